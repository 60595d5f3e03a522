use geo::LineString;
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mesh::TerrainMesh;
use crate::model::Bounds;

/// Barycentric slack so that points on shared edges still hit.
const EDGE_EPSILON: f64 = 1e-9;
const DET_EPSILON: f64 = 1e-12;
const MAX_INDEX_SIDE: usize = 1024;

/// One intersection, tagged with the vertex (ray) that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    pub ray_index: usize,
    pub point: Point3<f64>,
    pub triangle: usize,
}

/// Möller–Trumbore. Returns the ray parameter of the hit, if any.
fn intersect_triangle(origin: &Point3<f64>, dir: &Vector3<f64>, tri: &[Point3<f64>; 3]) -> Option<f64> {
    let e1 = tri[1] - tri[0];
    let e2 = tri[2] - tri[0];
    let p = dir.cross(&e2);
    let det = e1.dot(&p);
    if det.abs() < DET_EPSILON {
        return None;
    }
    let inv_det = 1.0 / det;

    let s = origin - tri[0];
    let u = s.dot(&p) * inv_det;
    if !(-EDGE_EPSILON..=1.0 + EDGE_EPSILON).contains(&u) {
        return None;
    }

    let q = s.cross(&e1);
    let v = dir.dot(&q) * inv_det;
    if v < -EDGE_EPSILON || u + v > 1.0 + EDGE_EPSILON {
        return None;
    }

    let t = e2.dot(&q) * inv_det;
    if t < 0.0 {
        None
    } else {
        Some(t)
    }
}

/// Ray origin height below the whole mesh (z = 0 unless the terrain dips under it).
fn ray_origin_z(mesh: &TerrainMesh) -> f64 {
    let (z_min, _) = mesh.z_range();
    if z_min <= 0.0 {
        z_min - 1.0
    } else {
        0.0
    }
}

/// Uniform 2D bucket grid over triangle bounding boxes.
#[derive(Debug, Clone)]
pub(crate) struct TriangleIndex {
    bounds: Bounds,
    cols: usize,
    rows: usize,
    cell_w: f64,
    cell_h: f64,
    cells: Vec<Vec<usize>>,
}

impl TriangleIndex {
    pub(crate) fn build(mesh: &TerrainMesh) -> Self {
        let bounds = mesh.bounds_2d();
        let side = ((mesh.triangles.len() as f64).sqrt().ceil() as usize).clamp(1, MAX_INDEX_SIDE);
        let cell_w = if bounds.width() > 0.0 { bounds.width() / side as f64 } else { 1.0 };
        let cell_h = if bounds.height() > 0.0 { bounds.height() / side as f64 } else { 1.0 };

        let mut index = Self {
            bounds,
            cols: side,
            rows: side,
            cell_w,
            cell_h,
            cells: vec![Vec::new(); side * side],
        };

        for (i, tri) in mesh.triangles.iter().enumerate() {
            let xs = tri.map(|v| mesh.vertices[v].x);
            let ys = tri.map(|v| mesh.vertices[v].y);
            let x_lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
            let x_hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let y_lo = ys.iter().copied().fold(f64::INFINITY, f64::min);
            let y_hi = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);

            let (c0, r0) = index.cell_of(x_lo - EDGE_EPSILON, y_lo - EDGE_EPSILON);
            let (c1, r1) = index.cell_of(x_hi + EDGE_EPSILON, y_hi + EDGE_EPSILON);
            for r in r0..=r1 {
                for c in c0..=c1 {
                    index.cells[r * index.cols + c].push(i);
                }
            }
        }
        index
    }

    fn cell_of(&self, x: f64, y: f64) -> (usize, usize) {
        let c = ((x - self.bounds.x_min) / self.cell_w).floor();
        let r = ((y - self.bounds.y_min) / self.cell_h).floor();
        (
            (c.max(0.0) as usize).min(self.cols - 1),
            (r.max(0.0) as usize).min(self.rows - 1),
        )
    }

    fn candidates(&self, x: f64, y: f64) -> &[usize] {
        let b = &self.bounds;
        let slack = EDGE_EPSILON * (1.0 + x.abs().max(y.abs()));
        if x < b.x_min - slack || x > b.x_max + slack || y < b.y_min - slack || y > b.y_max + slack {
            return &[];
        }
        let (c, r) = self.cell_of(x, y);
        &self.cells[r * self.cols + c]
    }

    /// Triangles whose buckets overlap `area`, each listed once.
    pub(crate) fn candidates_in(&self, area: &Bounds) -> Vec<usize> {
        let b = &self.bounds;
        if area.x_max < b.x_min || area.x_min > b.x_max || area.y_max < b.y_min || area.y_min > b.y_max {
            return Vec::new();
        }
        let (c0, r0) = self.cell_of(area.x_min, area.y_min);
        let (c1, r1) = self.cell_of(area.x_max, area.y_max);
        let mut found: Vec<usize> = (r0..=r1)
            .flat_map(|r| (c0..=c1).flat_map(move |c| self.cells[r * self.cols + c].iter().copied()))
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }
}

/// Vertical ray caster over a terrain mesh shifted by the vertical offset.
pub struct RayCaster {
    mesh: TerrainMesh,
    index: TriangleIndex,
    origin_z: f64,
}

impl RayCaster {
    /// Move `mesh` by `vertical_offset` and index it.
    ///
    /// The shift is applied to whatever heights the mesh carries, so a mesh
    /// triangulated with the same offset ends up moved by it twice.
    pub fn new(mesh: &TerrainMesh, vertical_offset: f64) -> Result<Self> {
        mesh.validate()?;
        let mesh = mesh.shifted(vertical_offset);
        let index = TriangleIndex::build(&mesh);
        let origin_z = ray_origin_z(&mesh);
        debug!(
            "Ray caster ready: {} triangles in a {}x{} index",
            mesh.triangles.len(),
            index.cols,
            index.rows
        );
        Ok(Self {
            mesh,
            index,
            origin_z,
        })
    }

    pub fn mesh(&self) -> &TerrainMesh {
        &self.mesh
    }

    /// Cast a `+z` ray at `(x, y)` and return the first hit.
    pub fn cast_vertical(&self, ray_index: usize, x: f64, y: f64) -> Option<RayHit> {
        let origin = Point3::new(x, y, self.origin_z);
        let dir = Vector3::z();

        let mut best: Option<(f64, usize)> = None;
        for &t in self.index.candidates(x, y) {
            if let Some(dist) = intersect_triangle(&origin, &dir, &self.mesh.triangle(t)) {
                if best.map_or(true, |(d, _)| dist < d) {
                    best = Some((dist, t));
                }
            }
        }

        best.map(|(dist, triangle)| RayHit {
            ray_index,
            point: Point3::new(x, y, self.origin_z + dist),
            triangle,
        })
    }

    /// Cast one ray per point. Hits come back in no particular order.
    pub fn cast_points(&self, points: &[(f64, f64)]) -> Vec<RayHit> {
        points
            .par_iter()
            .enumerate()
            .filter_map(|(i, &(x, y))| self.cast_vertical(i, x, y))
            .collect()
    }

    /// Drape a 2D line onto the terrain.
    ///
    /// Vertices without a hit are left out of the result; fewer than two hits
    /// is a [`Error::ProjectionFailure`].
    pub fn drape(&self, line: &LineString<f64>, identifier: &str) -> Result<Vec<Point3<f64>>> {
        let points: Vec<(f64, f64)> = line.coords().map(|c| (c.x, c.y)).collect();
        let hits = self.cast_points(&points);
        let hit_count = hits.len();

        match assemble_hits(hits) {
            Some(path) => {
                if hit_count < points.len() {
                    debug!(
                        "Feature {}: {} of {} vertices missed the terrain and were omitted",
                        identifier,
                        points.len() - hit_count,
                        points.len()
                    );
                }
                Ok(path)
            }
            None => {
                let missed: Vec<(f64, f64)> = points
                    .iter()
                    .enumerate()
                    .filter(|(i, p)| self.cast_vertical(*i, p.0, p.1).is_none())
                    .map(|(_, p)| *p)
                    .collect();
                warn!(
                    "Some points of feature {} are not on the mesh: {:?}",
                    identifier, missed
                );
                Err(Error::ProjectionFailure {
                    identifier: identifier.to_string(),
                    points,
                })
            }
        }
    }
}

/// Order hits by their originating vertex and build the 3D line.
///
/// Returns `None` when fewer than two vertices hit the terrain.
pub fn assemble_hits(mut hits: Vec<RayHit>) -> Option<Vec<Point3<f64>>> {
    if hits.len() < 2 {
        return None;
    }
    hits.sort_by_key(|h| h.ray_index);
    Some(hits.into_iter().map(|h| h.point).collect())
}

/// Drape `line` onto `mesh` after moving the mesh by `vertical_offset`.
pub fn drape(line: &LineString<f64>, mesh: &TerrainMesh, vertical_offset: f64) -> Result<Vec<Point3<f64>>> {
    RayCaster::new(mesh, vertical_offset)?.drape(line, "<unnamed>")
}

impl TerrainMesh {
    /// Height of the surface directly above or below `(x, y)`, if any.
    ///
    /// Builds a fresh [`RayCaster`]; use one directly for repeated lookups.
    pub fn height_at(&self, x: f64, y: f64) -> Option<f64> {
        let caster = RayCaster::new(self, 0.0).ok()?;
        caster.cast_vertical(0, x, y).map(|hit| hit.point.z)
    }
}
