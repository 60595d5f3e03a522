use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Projection failed for feature {identifier}: fewer than 2 of its {} vertices hit the terrain", .points.len())]
    ProjectionFailure {
        identifier: String,
        /// Original 2D vertices of the feature.
        points: Vec<(f64, f64)>,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote fetch failed: {0}")]
    RemoteFetch(String),

    #[error("Raster error: {0}")]
    Raster(#[from] gdal::errors::GdalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Mesh format error: {0}")]
    MeshFormat(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}
