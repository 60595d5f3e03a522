use nalgebra::Point3;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::delatin::Delatin;
use crate::error::{Error, Result};
use crate::mesh::TerrainMesh;
use crate::model::ElevationGrid;

/// Triangulate `grid` into a TIN whose vertical error is at most `max_error`.
///
/// `vertical_offset` is added to every height before the vertices are placed
/// at their cell centres in world space. Triangles covering a nodata cell are
/// left out, so the mesh only spans modelled terrain.
pub fn triangulate(grid: &ElevationGrid, max_error: f64, vertical_offset: f64) -> Result<TerrainMesh> {
    if !max_error.is_finite() || max_error < 0.0 {
        return Err(Error::invalid(format!("invalid max_error: {}", max_error)));
    }
    let (rows, cols) = grid.shape();
    if rows < 2 || cols < 2 {
        return Err(Error::invalid(format!(
            "elevation grid must be at least 2x2 to triangulate, got {}x{}",
            rows, cols
        )));
    }

    info!(
        "Starting triangulation with max_error: {} on a {}x{} grid",
        max_error, cols, rows
    );
    let start_time = Instant::now();

    let (heights, nodata) = fill_nodata(grid, max_error)?;
    let mut tin = Delatin::new(&heights, cols, rows);
    tin.run(max_error);

    debug!(
        "Triangulated into {} vertices / {} triangles (max error {:.3}, rmsd {:.3})",
        tin.vertex_count(),
        tin.triangle_count(),
        tin.max_error(),
        tin.rmsd()
    );

    let mut raster_vertices = tin.vertices();
    let mut triangles = tin.triangle_indices();
    if nodata.iter().any(|&n| n) {
        let before = triangles.len();
        triangles.retain(|t| {
            let corners = t.map(|v| [raster_vertices[v][0], raster_vertices[v][1]]);
            !touches_nodata(corners, &nodata, cols)
        });
        if triangles.is_empty() {
            return Err(Error::invalid("no triangle lies entirely on valid heights"));
        }
        warn!(
            "{} of {} triangle(s) cover nodata cells and were removed from the mesh",
            before - triangles.len(),
            before
        );
        (raster_vertices, triangles) = compact(raster_vertices, triangles);
    }

    // 標高にオフセットを加えてからワールド座標へ変換
    let vertices = raster_vertices
        .into_iter()
        .map(|[col, row, z]| {
            let (x, y) = grid.transform.cell_center(col, row);
            Point3::new(x, y, z + vertical_offset)
        })
        .collect();

    let mesh = TerrainMesh::new(vertices, triangles)?;

    info!(
        "Triangulation executed successfully in {:.2}s.",
        start_time.elapsed().as_secs_f64()
    );
    Ok(mesh)
}

/// Heights for the refinement plus a nodata mask.
///
/// Nodata cells are sunk well below the lowest valid height so that the
/// refinement places vertices along every data gap.
fn fill_nodata(grid: &ElevationGrid, max_error: f64) -> Result<(Vec<f64>, Vec<bool>)> {
    let min_valid = grid
        .values
        .iter()
        .copied()
        .filter(|v| !grid.is_nodata(*v))
        .fold(f64::INFINITY, f64::min);
    if !min_valid.is_finite() {
        return Err(Error::invalid("elevation grid contains no valid height"));
    }

    let fill = min_valid - (10.0 * max_error + 1.0);
    let nodata: Vec<bool> = grid.values.iter().map(|&v| grid.is_nodata(v)).collect();
    let heights = grid
        .values
        .iter()
        .zip(&nodata)
        .map(|(&v, &missing)| if missing { fill } else { v })
        .collect();

    let filled = nodata.iter().filter(|&&n| n).count();
    if filled > 0 {
        warn!(
            "{} nodata cell(s) in the elevation grid; the mesh will not cover them",
            filled
        );
    }
    Ok((heights, nodata))
}

/// Whether a raster-space triangle contains (or touches) a nodata cell centre.
fn touches_nodata(tri: [[f64; 2]; 3], nodata: &[bool], cols: usize) -> bool {
    let [a, b, c] = tri;
    let c0 = a[0].min(b[0]).min(c[0]).max(0.0) as usize;
    let c1 = a[0].max(b[0]).max(c[0]) as usize;
    let r0 = a[1].min(b[1]).min(c[1]).max(0.0) as usize;
    let r1 = a[1].max(b[1]).max(c[1]) as usize;

    for row in r0..=r1 {
        for col in c0..=c1.min(cols - 1) {
            let Some(&missing) = nodata.get(row * cols + col) else {
                continue;
            };
            if !missing {
                continue;
            }
            // 頂点は整数座標なので判定は厳密
            let p = [col as f64, row as f64];
            let w0 = orient(b, c, p);
            let w1 = orient(c, a, p);
            let w2 = orient(a, b, p);
            if (w0 >= 0.0 && w1 >= 0.0 && w2 >= 0.0) || (w0 <= 0.0 && w1 <= 0.0 && w2 <= 0.0) {
                return true;
            }
        }
    }
    false
}

fn orient(a: [f64; 2], b: [f64; 2], p: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

/// Drop vertices no triangle references and renumber the rest.
fn compact(vertices: Vec<[f64; 3]>, triangles: Vec<[usize; 3]>) -> (Vec<[f64; 3]>, Vec<[usize; 3]>) {
    let mut remap = vec![usize::MAX; vertices.len()];
    let mut kept = Vec::new();
    let mut renumbered = Vec::with_capacity(triangles.len());
    for t in triangles {
        let mut out = [0usize; 3];
        for (slot, v) in out.iter_mut().zip(t) {
            if remap[v] == usize::MAX {
                remap[v] = kept.len();
                kept.push(vertices[v]);
            }
            *slot = remap[v];
        }
        renumbered.push(out);
    }
    (kept, renumbered)
}
