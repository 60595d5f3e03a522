use geo::{Coord, LineString, MultiLineString};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::network::{NetworkFeature, NetworkFeatureCollection, NetworkFeatureCollection3D};

#[derive(Debug, Deserialize)]
struct InputCollection {
    #[serde(default)]
    crs: Option<Crs>,
    features: Vec<InputFeature>,
}

#[derive(Debug, Deserialize)]
struct InputFeature {
    geometry: Option<InputGeometry>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InputGeometry {
    LineString { coordinates: Vec<Vec<f64>> },
    MultiLineString { coordinates: Vec<Vec<Vec<f64>>> },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize)]
struct Crs {
    #[serde(rename = "type")]
    kind: String,
    properties: CrsProperties,
}

#[derive(Debug, Serialize, Deserialize)]
struct CrsProperties {
    name: String,
}

impl Crs {
    fn from_epsg(epsg: u32) -> Self {
        Self {
            kind: "name".to_string(),
            properties: CrsProperties {
                name: format!("urn:ogc:def:crs:EPSG::{}", epsg),
            },
        }
    }

    /// "urn:ogc:def:crs:EPSG::2056" や "EPSG:2056" からコードを取り出す
    fn epsg(&self) -> Option<u32> {
        let name = &self.properties.name;
        if !name.to_ascii_uppercase().contains("EPSG") {
            return None;
        }
        name.rsplit(':').next().and_then(|code| code.trim().parse().ok())
    }
}

#[derive(Debug, Serialize)]
struct OutputCollection {
    #[serde(rename = "type")]
    kind: &'static str,
    crs: Crs,
    features: Vec<OutputFeature>,
}

#[derive(Debug, Serialize)]
struct OutputFeature {
    #[serde(rename = "type")]
    kind: &'static str,
    properties: Map<String, Value>,
    geometry: OutputGeometry,
}

#[derive(Debug, Serialize)]
struct OutputGeometry {
    #[serde(rename = "type")]
    kind: &'static str,
    coordinates: Vec<[f64; 3]>,
}

fn to_line(coords: Vec<Vec<f64>>) -> Result<LineString<f64>> {
    coords
        .into_iter()
        .map(|c| match c.as_slice() {
            // z の値は無視する
            [x, y, ..] => Ok(Coord { x: *x, y: *y }),
            _ => Err(Error::invalid(format!("position with {} ordinate(s)", c.len()))),
        })
        .collect::<Result<Vec<_>>>()
        .map(LineString::new)
}

/// Parse a 2D network trace.
///
/// LineString and MultiLineString features are kept; any other geometry is
/// skipped with a warning. The network is always placed in `epsg`; a
/// different `crs` declared by the file is overridden with a warning.
pub fn parse_network(text: &str, epsg: u32) -> Result<NetworkFeatureCollection> {
    let input: InputCollection = serde_json::from_str(text)?;
    if let Some(declared) = input.crs.as_ref().and_then(Crs::epsg) {
        if declared != epsg {
            warn!(
                "Network declares EPSG:{} but is processed as EPSG:{}; coordinates are not reprojected",
                declared, epsg
            );
        }
    }

    let mut features = Vec::with_capacity(input.features.len());
    for (i, feature) in input.features.into_iter().enumerate() {
        let geometry = match feature.geometry {
            Some(InputGeometry::LineString { coordinates }) => {
                MultiLineString::new(vec![to_line(coordinates)?])
            }
            Some(InputGeometry::MultiLineString { coordinates }) => MultiLineString::new(
                coordinates
                    .into_iter()
                    .map(to_line)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Some(InputGeometry::Unsupported) => {
                warn!("Feature {} has an unsupported geometry type and is skipped", i);
                continue;
            }
            None => {
                warn!("Feature {} has no geometry and is skipped", i);
                continue;
            }
        };
        features.push(NetworkFeature::new(
            geometry,
            feature.properties.unwrap_or_default(),
        ));
    }

    Ok(NetworkFeatureCollection::new(epsg, features))
}

pub fn read_network(path: &Path, epsg: u32) -> Result<NetworkFeatureCollection> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let network = parse_network(&text, epsg)?;
    info!(
        "Read {} network feature(s) from {:?} (EPSG:{})",
        network.len(),
        path,
        network.epsg
    );
    Ok(network)
}

/// Serialize a draped network as a GeoJSON FeatureCollection with a `crs` member.
pub fn to_geojson_string(collection: &NetworkFeatureCollection3D) -> Result<String> {
    let features = collection
        .features
        .iter()
        .map(|f| {
            // 列順を保持
            let mut properties = Map::new();
            for column in &collection.columns {
                properties.insert(
                    column.clone(),
                    f.properties.get(column).cloned().unwrap_or(Value::Null),
                );
            }
            OutputFeature {
                kind: "Feature",
                properties,
                geometry: OutputGeometry {
                    kind: "LineString",
                    coordinates: f.geometry.iter().map(|p| [p.x, p.y, p.z]).collect(),
                },
            }
        })
        .collect();

    let output = OutputCollection {
        kind: "FeatureCollection",
        crs: Crs::from_epsg(collection.epsg),
        features,
    };
    Ok(serde_json::to_string(&output)?)
}

pub fn write_network_3d(collection: &NetworkFeatureCollection3D, path: &Path) -> Result<()> {
    let text = to_geojson_string(collection)?;
    fs::write(path, text).map_err(|e| Error::io(path, e))?;
    info!("Wrote {} 3D feature(s) to {:?}", collection.len(), path);
    Ok(())
}

/// `<output_dir>/<trace stem>_3D.<trace ext>`
pub fn output_path(output_dir: &Path, trace: &Path) -> PathBuf {
    let stem = trace
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "network".to_string());
    let ext = trace
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "geojson".to_string());
    output_dir.join(format!("{}_3D.{}", stem, ext))
}
