use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{DriverManager, Metadata};
use std::path::Path;
use tracing::warn;

use crate::error::Result;
use crate::model::ElevationGrid;
use crate::raster::DEFAULT_NODATA;

/// Writes elevation grids (e.g. a merged mosaic) as float32 GeoTIFF.
#[derive(Default)]
pub struct GeoTiffWriter {
    epsg: Option<u32>,
}

impl GeoTiffWriter {
    pub fn new() -> Self {
        Self { epsg: None }
    }

    /// グリッドにCRSが無い場合に使用するEPSGコード
    pub fn with_epsg(mut self, epsg: u32) -> Self {
        self.epsg = Some(epsg);
        self
    }

    pub fn write(&self, grid: &ElevationGrid, output_path: &Path) -> Result<()> {
        // GTiffドライバーを取得
        let driver = DriverManager::get_driver_by_name("GTiff")?;

        // データセットを作成
        let (rows, cols) = grid.shape();
        let mut dataset = driver.create_with_band_type::<f32, _>(
            output_path,
            cols,
            rows,
            1, // バンド数
        )?;

        // ジオトランスフォームを設定
        dataset.set_geo_transform(&grid.geo_transform())?;

        // 座標系を設定
        self.set_projection(&mut dataset, grid)?;

        let nodata = grid.nodata.unwrap_or(DEFAULT_NODATA);
        let mut band = dataset.rasterband(1)?;
        band.set_no_data_value(Some(nodata))?;

        // データを書き込み（GDALは行優先順を期待）
        let values: Vec<f32> = grid
            .values
            .iter()
            .map(|&v| if grid.is_nodata(v) { nodata as f32 } else { v as f32 })
            .collect();
        let mut buffer = Buffer::new((cols, rows), values);
        band.write((0, 0), (cols, rows), &mut buffer)?;

        dataset.set_metadata_item("AREA_OR_POINT", "Area", "")?;

        Ok(())
    }

    fn set_projection(&self, dataset: &mut gdal::Dataset, grid: &ElevationGrid) -> Result<()> {
        if let Some(wkt) = &grid.crs {
            dataset.set_projection(wkt)?;
        } else if let Some(epsg) = self.epsg {
            let srs = SpatialRef::from_epsg(epsg)?;
            dataset.set_projection(&srs.to_wkt()?)?;
        } else {
            // CRSが不明な場合は警告のみ
            warn!("Writing GeoTIFF without a coordinate reference system");
        }
        Ok(())
    }
}
