pub mod config;
pub mod delatin;
pub mod error;
#[cfg(feature = "download")]
pub mod fetch;
pub mod geojson;
pub mod mesh;
pub mod model;
pub mod network;
pub mod overlay;
pub mod pipeline;
pub mod ply;
pub mod raster;
pub mod raycast;
pub mod terrain;
pub mod tile_name;
pub mod writer;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use mesh::TerrainMesh;
pub use model::{Bounds, ElevationGrid, GeoTransform};
pub use network::{
    NetworkFeature, NetworkFeature3D, NetworkFeatureCollection, NetworkFeatureCollection3D,
};
pub use pipeline::{Assembler, TerrainSource};
pub use raster::{import_dem, DemImport};
pub use raycast::{drape, RayCaster, RayHit};
pub use terrain::triangulate;
pub use writer::GeoTiffWriter;
