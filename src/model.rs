use crate::error::{Error, Result};

/// World-space bounding box `(x_min, y_min, x_max, y_max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Bounds {
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            x_min: self.x_min.min(other.x_min),
            y_min: self.y_min.min(other.y_min),
            x_max: self.x_max.max(other.x_max),
            y_max: self.y_max.max(other.y_max),
        }
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }
}

/// North-up affine transform. `pixel_height` is negative (row 0 is the north edge).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// GDAL形式の6要素から生成（回転成分は0である必要がある）
    pub fn from_gdal(gt: [f64; 6]) -> Result<Self> {
        if gt[2] != 0.0 || gt[4] != 0.0 {
            return Err(Error::invalid(format!(
                "rotated geotransforms are not supported: {:?}",
                gt
            )));
        }
        if gt[1] <= 0.0 || gt[5] == 0.0 {
            return Err(Error::invalid(format!("degenerate pixel size: {:?}", gt)));
        }
        let transform = Self {
            origin_x: gt[0],
            origin_y: gt[3],
            pixel_width: gt[1],
            pixel_height: gt[5],
        };
        if !transform.is_north_up() {
            return Err(Error::invalid(format!(
                "south-up rasters are not supported (pixel height {})",
                gt[5]
            )));
        }
        Ok(transform)
    }

    /// Row 0 is the north edge and columns run east.
    pub fn is_north_up(&self) -> bool {
        self.pixel_width > 0.0 && self.pixel_height < 0.0
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.origin_x,
            self.pixel_width,
            0.0,
            self.origin_y,
            0.0,
            self.pixel_height,
        ]
    }

    /// ピクセル中心のワールド座標
    pub fn cell_center(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + (col + 0.5) * self.pixel_width,
            self.origin_y + (row + 0.5) * self.pixel_height,
        )
    }
}

/// A single-band height raster with its world placement.
#[derive(Debug, Clone)]
pub struct ElevationGrid {
    pub rows: usize,
    pub cols: usize,
    /// Row-major, north to south.
    pub values: Vec<f64>,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    /// WKT of the source projection, if known.
    pub crs: Option<String>,
}

impl ElevationGrid {
    pub fn new(
        rows: usize,
        cols: usize,
        values: Vec<f64>,
        transform: GeoTransform,
        nodata: Option<f64>,
    ) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(Error::invalid("elevation grid is empty"));
        }
        if values.len() != rows * cols {
            return Err(Error::invalid(format!(
                "grid shape {}x{} does not match {} values",
                rows,
                cols,
                values.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            values,
            transform,
            nodata,
            crs: None,
        })
    }

    pub fn with_crs(mut self, crs: Option<String>) -> Self {
        self.crs = crs;
        self
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn geo_transform(&self) -> [f64; 6] {
        self.transform.to_gdal()
    }

    pub fn bounds(&self) -> Bounds {
        let t = &self.transform;
        let x_end = t.origin_x + self.cols as f64 * t.pixel_width;
        let y_end = t.origin_y + self.rows as f64 * t.pixel_height;
        Bounds::new(
            t.origin_x.min(x_end),
            t.origin_y.min(y_end),
            t.origin_x.max(x_end),
            t.origin_y.max(y_end),
        )
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.cols + col]
    }

    pub fn is_nodata(&self, value: f64) -> bool {
        if value.is_nan() {
            return true;
        }
        match self.nodata {
            Some(nd) => value == nd,
            None => false,
        }
    }

    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| !self.is_nodata(**v)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform() -> GeoTransform {
        GeoTransform {
            origin_x: 2_600_000.0,
            origin_y: 1_200_000.0,
            pixel_width: 0.5,
            pixel_height: -0.5,
        }
    }

    #[test]
    fn test_bounds_from_transform_and_shape() {
        let grid = ElevationGrid::new(4, 6, vec![0.0; 24], transform(), None).unwrap();
        let b = grid.bounds();
        assert_eq!(b, Bounds::new(2_600_000.0, 1_199_998.0, 2_600_003.0, 1_200_000.0));
        assert_eq!(grid.shape(), (4, 6));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let result = ElevationGrid::new(2, 2, vec![1.0; 3], transform(), None);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(ElevationGrid::new(0, 0, vec![], transform(), None).is_err());
    }

    #[test]
    fn test_from_gdal_requires_north_up() {
        let gt = GeoTransform::from_gdal([2_600_000.0, 0.5, 0.0, 1_200_000.0, 0.0, -0.5]).unwrap();
        assert_eq!(gt, transform());
        assert_eq!(gt.to_gdal()[5], -0.5);

        // 南北反転したラスタ
        let south_up = GeoTransform::from_gdal([2_600_000.0, 0.5, 0.0, 1_199_998.0, 0.0, 0.5]);
        assert!(matches!(south_up, Err(Error::InvalidInput(_))));
        assert!(GeoTransform::from_gdal([0.0, 0.5, 0.1, 0.0, 0.0, -0.5]).is_err());
        assert!(GeoTransform::from_gdal([0.0, 0.0, 0.0, 0.0, 0.0, -0.5]).is_err());
    }

    #[test]
    fn test_rotated_transform_is_rejected() {
        assert!(GeoTransform::from_gdal([0.0, 1.0, 0.1, 0.0, 0.0, -1.0]).is_err());
        let t = GeoTransform::from_gdal(transform().to_gdal()).unwrap();
        assert_eq!(t, transform());
    }

    #[test]
    fn test_nodata_detection() {
        let grid =
            ElevationGrid::new(1, 3, vec![1.0, -9999.0, f64::NAN], transform(), Some(-9999.0))
                .unwrap();
        assert_eq!(grid.valid_count(), 1);
    }
}
