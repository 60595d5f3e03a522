use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::mesh::TerrainMesh;
use crate::model::ElevationGrid;
use crate::network::{NetworkFeature3D, NetworkFeatureCollection, NetworkFeatureCollection3D};
use crate::overlay::{explode, restrict_to_mesh};
use crate::ply::{mesh_filename, write_ply};
use crate::raster::import_dem;
use crate::raycast::RayCaster;
use crate::terrain::triangulate;
use crate::writer::GeoTiffWriter;

/// Where the terrain for a run comes from.
#[derive(Debug, Clone)]
pub enum TerrainSource {
    /// DEM tiles to import (and merge) and triangulate.
    Dem(Vec<PathBuf>),
    /// An elevation grid already in memory.
    Grid(ElevationGrid),
    /// A ready-made mesh, e.g. loaded from PLY.
    Mesh(TerrainMesh),
}

/// Runs acquire → triangulate → overlay → drape → assemble for one network.
pub struct Assembler {
    config: PipelineConfig,
}

impl Assembler {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn assemble(
        &self,
        network: &NetworkFeatureCollection,
        terrain: TerrainSource,
    ) -> Result<NetworkFeatureCollection3D> {
        self.config.validate()?;
        if network.is_empty() {
            return Err(Error::invalid("network contains no features"));
        }
        if !network.columns.contains(&self.config.identifier) {
            warn!(
                "Identifier column '{}' not found in the network; features will be logged as <unknown>",
                self.config.identifier
            );
        }

        let start_time = Instant::now();
        let mesh = self.build_mesh(terrain)?;

        // メッシュ範囲外の区間を除去
        let restricted = restrict_to_mesh(
            network,
            &mesh,
            self.config.line_merge,
            &self.config.identifier,
        );
        let exploded = explode(&restricted);
        debug!(
            "{} feature(s) after restricting and exploding",
            exploded.len()
        );

        let caster = RayCaster::new(&mesh, self.config.vertical_offset)?;
        let mut features = Vec::with_capacity(exploded.len());
        let mut failed = 0usize;
        for feature in &exploded.features {
            let identifier = feature.identifier(&self.config.identifier);
            for line in &feature.geometry {
                match caster.drape(line, &identifier) {
                    Ok(geometry) => features.push(NetworkFeature3D {
                        geometry,
                        properties: feature.properties.clone(),
                    }),
                    Err(e @ Error::ProjectionFailure { .. }) => {
                        failed += 1;
                        error!("{}", e);
                        if let Error::ProjectionFailure { points, .. } = &e {
                            error!("Coordinates of feature {}: {:?}", identifier, points);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        if failed > 0 {
            warn!("{} feature(s) could not be draped and were dropped", failed);
        }

        let collection = NetworkFeatureCollection3D {
            epsg: network.epsg,
            columns: network.columns.clone(),
            features,
        }
        .sanitize_columns();

        info!(
            "Footprint processed: {} 3D feature(s) in {:.2}s",
            collection.len(),
            start_time.elapsed().as_secs_f64()
        );
        Ok(collection)
    }

    fn build_mesh(&self, terrain: TerrainSource) -> Result<TerrainMesh> {
        match terrain {
            TerrainSource::Dem(paths) => {
                let import = import_dem(&paths)?;
                if self.config.write_merged_dem && import.merged.len() > 1 {
                    GeoTiffWriter::new()
                        .with_epsg(self.config.epsg)
                        .write(&import.grid, &import.name)?;
                    info!("Merged DEM written to {:?}", import.name);
                }
                let mesh = triangulate(
                    &import.grid,
                    self.config.max_error,
                    self.config.vertical_offset,
                )?;
                write_ply(&mesh, &mesh_filename(&import.name, self.config.max_error))?;
                Ok(mesh)
            }
            TerrainSource::Grid(grid) => triangulate(
                &grid,
                self.config.max_error,
                self.config.vertical_offset,
            ),
            TerrainSource::Mesh(mesh) => {
                mesh.validate()?;
                Ok(mesh)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GeoTransform;
    use crate::network::NetworkFeature;
    use geo::{line_string, MultiLineString};
    use serde_json::json;

    fn flat_grid(height: f64) -> ElevationGrid {
        ElevationGrid::new(
            5,
            5,
            vec![height; 25],
            GeoTransform {
                origin_x: 2_600_000.0,
                origin_y: 1_200_010.0,
                pixel_width: 2.0,
                pixel_height: -2.0,
            },
            None,
        )
        .unwrap()
    }

    fn feature(line: geo::LineString<f64>, id: &str) -> NetworkFeature {
        NetworkFeature::new(
            MultiLineString::new(vec![line]),
            json!({"NIS_Nummer": id, "Leitungs-Typ": "Gas"})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    #[test]
    fn test_empty_network_is_rejected() {
        let assembler = Assembler::new(PipelineConfig::default());
        let network = NetworkFeatureCollection::new(2056, vec![]);
        let result = assembler.assemble(&network, TerrainSource::Grid(flat_grid(400.0)));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_grid_source_is_offset_at_triangulation_and_draping() {
        let assembler = Assembler::new(PipelineConfig::default());
        let network = NetworkFeatureCollection::new(
            2056,
            vec![feature(
                line_string![(x: 2_600_002.0, y: 1_200_002.0), (x: 2_600_006.0, y: 1_200_008.0)],
                "G-1",
            )],
        );
        // 三角形分割で -0.8、レイキャスト前にもう一度 -0.8
        let result = assembler
            .assemble(&network, TerrainSource::Grid(flat_grid(400.0)))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.features[0]
            .geometry
            .iter()
            .all(|p| (p.z - 398.4).abs() < 1e-9));
        assert_eq!(result.columns, vec!["NIS_Nummer", "Leitungs_Typ"]);
        assert_eq!(result.features[0].properties["Leitungs_Typ"], json!("Gas"));
    }

    #[test]
    fn test_mesh_source_is_shifted_by_the_offset() {
        let mesh = TerrainMesh::new(
            vec![
                nalgebra::Point3::new(0.0, 0.0, 10.0),
                nalgebra::Point3::new(10.0, 0.0, 10.0),
                nalgebra::Point3::new(10.0, 10.0, 10.0),
                nalgebra::Point3::new(0.0, 10.0, 10.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
        .unwrap();
        let network = NetworkFeatureCollection::new(
            2056,
            vec![
                feature(line_string![(x: 1.0, y: 1.0), (x: 9.0, y: 9.0)], "M-1"),
                feature(line_string![(x: 50.0, y: 50.0), (x: 60.0, y: 60.0)], "M-2"),
            ],
        );
        let result = Assembler::new(PipelineConfig::default())
            .assemble(&network, TerrainSource::Mesh(mesh))
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.features[0].identifier("NIS_Nummer"), "M-1");
        assert!(result.features[0]
            .geometry
            .iter()
            .all(|p| (p.z - 9.2).abs() < 1e-9));
    }
}
