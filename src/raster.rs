use gdal::Dataset;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{ElevationGrid, GeoTransform};
use crate::tile_name::merged_tile_name;

pub const DEFAULT_NODATA: f64 = -9999.0;
const ALIGN_TOLERANCE: f64 = 1e-6;

/// Result of importing one or more DEM tiles.
#[derive(Debug, Clone)]
pub struct DemImport {
    pub grid: ElevationGrid,
    /// Logical filename of the (possibly merged) tile.
    pub name: PathBuf,
    /// Files that actually went into `grid`, in paint order.
    pub merged: Vec<PathBuf>,
}

/// Read band 1 of a GeoTIFF into an [`ElevationGrid`].
pub fn read_tile(path: &Path) -> Result<ElevationGrid> {
    if !path.is_file() {
        return Err(Error::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "DEM tile not found"),
        ));
    }

    let dataset = Dataset::open(path)?;
    let (cols, rows) = dataset.raster_size();
    let transform = GeoTransform::from_gdal(dataset.geo_transform()?)?;
    let band = dataset.rasterband(1)?;
    let nodata = band.no_data_value();

    let buffer = band.read_as::<f64>((0, 0), (cols, rows), (cols, rows), None)?;
    let values = buffer.data().to_vec();

    let projection = dataset.projection();
    let crs = if projection.is_empty() {
        None
    } else {
        Some(projection)
    };

    debug!("Read tile {:?}: {}x{} pixels", path, cols, rows);
    Ok(ElevationGrid::new(rows, cols, values, transform, nodata)?.with_crs(crs))
}

/// Mosaic tiles onto a common grid spanning the union of their bounds.
///
/// Merge policy is first-valid: tiles are painted in slice order and a cell
/// keeps the first non-nodata value that reaches it. Cells no tile covers
/// are nodata.
pub fn merge_grids(tiles: &[ElevationGrid]) -> Result<ElevationGrid> {
    let first = tiles
        .first()
        .ok_or_else(|| Error::invalid("no DEM files provided"))?;
    if let Some(tile) = tiles.iter().find(|t| !t.transform.is_north_up()) {
        return Err(Error::invalid(format!(
            "only north-up tiles can be merged, got pixel size ({}, {})",
            tile.transform.pixel_width, tile.transform.pixel_height
        )));
    }
    if tiles.len() == 1 {
        return Ok(first.clone());
    }

    let pixel_width = first.transform.pixel_width;
    let pixel_height = first.transform.pixel_height;
    for tile in &tiles[1..] {
        if !same_size(tile.transform.pixel_width, pixel_width)
            || !same_size(tile.transform.pixel_height, pixel_height)
        {
            return Err(Error::invalid(format!(
                "cannot merge tiles with different resolutions: ({}, {}) vs ({}, {})",
                pixel_width, pixel_height, tile.transform.pixel_width, tile.transform.pixel_height
            )));
        }
        if let (Some(a), Some(b)) = (&first.crs, &tile.crs) {
            if a != b {
                return Err(Error::invalid("cannot merge tiles with different CRS"));
            }
        }
    }

    let bounds = tiles
        .iter()
        .skip(1)
        .fold(first.bounds(), |acc, t| acc.union(&t.bounds()));
    let cell_w = pixel_width.abs();
    let cell_h = pixel_height.abs();
    let cols = (bounds.width() / cell_w).round() as usize;
    let rows = (bounds.height() / cell_h).round() as usize;

    let nodata = first.nodata.unwrap_or(DEFAULT_NODATA);
    let mut values = vec![nodata; rows * cols];
    let mut written = vec![false; rows * cols];

    // 入力順に書き込み、最初の有効値を採用
    for tile in tiles {
        let tb = tile.bounds();
        let col_off = lattice_offset(tb.x_min - bounds.x_min, cell_w)?;
        let row_off = lattice_offset(bounds.y_max - tb.y_max, cell_h)?;

        for row in 0..tile.rows {
            for col in 0..tile.cols {
                let value = tile.get(row, col);
                if tile.is_nodata(value) {
                    continue;
                }
                let idx = (row + row_off) * cols + (col + col_off);
                if !written[idx] {
                    values[idx] = value;
                    written[idx] = true;
                }
            }
        }
    }

    info!(
        "Merged {} tiles into a {}x{} grid ({} cells without data)",
        tiles.len(),
        cols,
        rows,
        written.iter().filter(|w| !**w).count()
    );

    let transform = GeoTransform {
        origin_x: bounds.x_min,
        origin_y: bounds.y_max,
        pixel_width: cell_w,
        pixel_height: -cell_h,
    };
    Ok(ElevationGrid::new(rows, cols, values, transform, Some(nodata))?.with_crs(first.crs.clone()))
}

fn same_size(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * a.abs().max(b.abs())
}

fn lattice_offset(distance: f64, cell: f64) -> Result<usize> {
    let steps = distance / cell;
    let rounded = steps.round();
    if (steps - rounded).abs() > ALIGN_TOLERANCE || rounded < 0.0 {
        return Err(Error::invalid(format!(
            "tile is not aligned with the common pixel grid (offset {} cells)",
            steps
        )));
    }
    Ok(rounded as usize)
}

/// Import the DEM tiles of one footprint as a single grid.
pub fn import_dem(paths: &[PathBuf]) -> Result<DemImport> {
    if paths.is_empty() {
        return Err(Error::invalid("no DEM files provided"));
    }

    if paths.len() == 1 {
        let grid = read_tile(&paths[0])?;
        debug!("DEM file imported successfully!");
        return Ok(DemImport {
            grid,
            name: paths[0].clone(),
            merged: paths.to_vec(),
        });
    }

    let tiles = paths
        .iter()
        .map(|p| read_tile(p))
        .collect::<Result<Vec<_>>>()?;
    let grid = merge_grids(&tiles)?;
    let name = merged_tile_name(paths).unwrap_or_else(|| paths[0].clone());
    for path in paths {
        debug!("Merged tile: {:?}", path);
    }
    debug!("DEM files imported successfully!");

    Ok(DemImport {
        grid,
        name,
        merged: paths.to_vec(),
    })
}

/// List the swissALTI3D tiles of a working directory in a stable order.
pub fn discover_tiles(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut tiles = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if path.is_file()
            && name.starts_with("swissalti3d")
            && name.ends_with(".tif")
            && !name.contains("clipped")
        {
            tiles.push(path);
        }
    }
    tiles.sort();
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bounds;
    use crate::writer::GeoTiffWriter;
    use gdal::DriverManager;
    use tempfile::TempDir;

    fn tile(origin_x: f64, origin_y: f64, rows: usize, cols: usize, value: f64) -> ElevationGrid {
        let transform = GeoTransform {
            origin_x,
            origin_y,
            pixel_width: 1.0,
            pixel_height: -1.0,
        };
        ElevationGrid::new(rows, cols, vec![value; rows * cols], transform, Some(DEFAULT_NODATA))
            .unwrap()
    }

    #[test]
    fn test_merge_bounds_is_union_of_tiles() {
        let tiles = vec![
            tile(0.0, 10.0, 10, 10, 1.0),
            tile(10.0, 10.0, 10, 10, 2.0),
            tile(0.0, 0.0, 10, 10, 3.0),
        ];
        let merged = merge_grids(&tiles).unwrap();
        let expected = tiles
            .iter()
            .skip(1)
            .fold(tiles[0].bounds(), |acc, t| acc.union(&t.bounds()));
        assert_eq!(merged.bounds(), expected);
        assert_eq!(merged.bounds(), Bounds::new(0.0, -10.0, 20.0, 10.0));
        assert_eq!(merged.shape(), (20, 20));

        assert_eq!(merged.get(0, 0), 1.0);
        assert_eq!(merged.get(0, 15), 2.0);
        assert_eq!(merged.get(15, 5), 3.0);
        // どのタイルにも覆われないセル
        assert!(merged.is_nodata(merged.get(15, 15)));
    }

    #[test]
    fn test_merge_first_valid_wins_on_overlap() {
        let mut a = tile(0.0, 4.0, 4, 4, 10.0);
        a.values[0] = DEFAULT_NODATA;
        let b = tile(2.0, 4.0, 4, 4, 20.0);
        let c = tile(0.0, 4.0, 1, 1, 30.0);

        let merged = merge_grids(&[a, b, c]).unwrap();
        assert_eq!(merged.shape(), (4, 6));
        // 重複部分は先に書き込まれたタイルの値
        assert_eq!(merged.get(0, 2), 10.0);
        assert_eq!(merged.get(0, 5), 20.0);
        // 先のタイルがnodataなら後続の有効値で埋める
        assert_eq!(merged.get(0, 0), 30.0);
    }

    #[test]
    fn test_merge_rejects_mixed_resolution() {
        let a = tile(0.0, 4.0, 4, 4, 1.0);
        let mut b = tile(4.0, 4.0, 4, 4, 1.0);
        b.transform.pixel_width = 2.0;
        b.transform.pixel_height = -2.0;
        assert!(matches!(merge_grids(&[a, b]), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_merge_rejects_south_up_tiles() {
        let a = tile(0.0, 4.0, 4, 4, 1.0);
        let mut b = tile(4.0, 0.0, 4, 4, 1.0);
        b.transform.pixel_height = 1.0;
        assert!(matches!(merge_grids(&[a, b]), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_merge_rejects_misaligned_tiles() {
        let a = tile(0.0, 4.0, 4, 4, 1.0);
        let b = tile(4.5, 4.0, 4, 4, 1.0);
        assert!(merge_grids(&[a, b]).is_err());
    }

    #[test]
    fn test_import_requires_at_least_one_tile() {
        let err = import_dem(&[]).unwrap_err();
        assert!(err.to_string().contains("no DEM files provided"));
        assert!(merge_grids(&[]).is_err());
    }

    #[test]
    fn test_discover_tiles_skips_clipped_and_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        for name in [
            "swissalti3d_2019_2600-1200_0.5_2056_5728.tif",
            "swissalti3d_2019_2601-1200_0.5_2056_5728.tif",
            "swissalti3d_2019_2600-1200_0.5_2056_5728_clipped.tif",
            "other.tif",
            "swissalti3d_notes.txt",
        ] {
            fs::write(temp_dir.path().join(name), b"").unwrap();
        }
        let tiles = discover_tiles(temp_dir.path()).unwrap();
        let names: Vec<_> = tiles
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "swissalti3d_2019_2600-1200_0.5_2056_5728.tif",
                "swissalti3d_2019_2601-1200_0.5_2056_5728.tif",
            ]
        );
    }

    #[test]
    fn test_import_merges_tiles_from_disk() {
        if DriverManager::get_driver_by_name("GTiff").is_err() {
            eprintln!("Skipping test: GTiff driver not available in bundled GDAL");
            return;
        }
        let temp_dir = TempDir::new().unwrap();
        let west = temp_dir
            .path()
            .join("swissalti3d_2019_2600-1200_0.5_2056_5728.tif");
        let east = temp_dir
            .path()
            .join("swissalti3d_2019_2601-1200_0.5_2056_5728.tif");

        let writer = GeoTiffWriter::new();
        writer.write(&tile(0.0, 3.0, 3, 3, 100.0), &west).unwrap();
        writer.write(&tile(3.0, 3.0, 3, 3, 200.0), &east).unwrap();

        let import = import_dem(&[west.clone(), east.clone()]).unwrap();
        assert_eq!(import.grid.bounds(), Bounds::new(0.0, 0.0, 6.0, 3.0));
        assert_eq!(import.grid.get(1, 1), 100.0);
        assert_eq!(import.grid.get(1, 4), 200.0);
        assert_eq!(import.merged, vec![west, east]);
        assert!(import
            .name
            .to_str()
            .unwrap()
            .ends_with("swissalti3d_2019_2600-1200_0.5_2056_5728_extended.tif"));

        let single = import_dem(&[import.merged[0].clone()]).unwrap();
        assert_eq!(single.grid.shape(), (3, 3));
        assert_eq!(single.name, import.merged[0]);
    }
}
