use geo::{BoundingRect, MultiLineString};
use nalgebra::Point3;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::warn;

use crate::model::Bounds;

/// One pipe segment: 2D geometry plus its scalar attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkFeature {
    pub geometry: MultiLineString<f64>,
    pub properties: Map<String, Value>,
}

impl NetworkFeature {
    pub fn new(geometry: MultiLineString<f64>, properties: Map<String, Value>) -> Self {
        Self {
            geometry,
            properties,
        }
    }

    /// Value of the identifier column as text, for logging.
    pub fn identifier(&self, column: &str) -> String {
        identifier_of(&self.properties, column)
    }
}

fn identifier_of(properties: &Map<String, Value>, column: &str) -> String {
    match properties.get(column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "<unknown>".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Column names in order of first appearance.
fn collect_columns<'a>(maps: impl Iterator<Item = &'a Map<String, Value>>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut columns = Vec::new();
    for map in maps {
        for key in map.keys() {
            if seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkFeatureCollection {
    pub epsg: u32,
    pub columns: Vec<String>,
    pub features: Vec<NetworkFeature>,
}

impl NetworkFeatureCollection {
    pub fn new(epsg: u32, features: Vec<NetworkFeature>) -> Self {
        let columns = collect_columns(features.iter().map(|f| &f.properties));
        Self {
            epsg,
            columns,
            features,
        }
    }

    /// Same schema and CRS, different features.
    pub fn with_features(&self, features: Vec<NetworkFeature>) -> Self {
        Self {
            epsg: self.epsg,
            columns: self.columns.clone(),
            features,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Bounding box of all geometries, `None` for an empty network.
    pub fn footprint(&self) -> Option<Bounds> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .map(|r| Bounds::new(r.min().x, r.min().y, r.max().x, r.max().y))
            .reduce(|a, b| a.union(&b))
    }
}

/// A draped segment: 3D polyline plus attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkFeature3D {
    pub geometry: Vec<Point3<f64>>,
    pub properties: Map<String, Value>,
}

impl NetworkFeature3D {
    pub fn identifier(&self, column: &str) -> String {
        identifier_of(&self.properties, column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkFeatureCollection3D {
    pub epsg: u32,
    pub columns: Vec<String>,
    pub features: Vec<NetworkFeature3D>,
}

impl NetworkFeatureCollection3D {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Rename columns with [`column_rename_table`] and apply it to every feature.
    pub fn sanitize_columns(self) -> Self {
        let table = column_rename_table(&self.columns);
        let columns = table.iter().map(|(_, new)| new.clone()).collect();
        let features = self
            .features
            .into_iter()
            .map(|f| {
                let mut properties = Map::new();
                for (old, new) in &table {
                    if let Some(v) = f.properties.get(old) {
                        properties.insert(new.clone(), v.clone());
                    }
                }
                NetworkFeature3D {
                    geometry: f.geometry,
                    properties,
                }
            })
            .collect();
        Self {
            epsg: self.epsg,
            columns,
            features,
        }
    }
}

/// `(old, new)` pairs with `-` replaced by `_`.
///
/// The first column to claim a sanitized name keeps it; later ones get `_1`,
/// `_2`, ... appended.
pub fn column_rename_table(columns: &[String]) -> Vec<(String, String)> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut table = Vec::with_capacity(columns.len());
    for column in columns {
        let base = column.replace('-', "_");
        let mut name = base.clone();
        let mut n = 1;
        while taken.contains(&name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }
        if name != base {
            warn!(
                "Column '{}' collides with another column after sanitizing; renamed to '{}'",
                column, name
            );
        }
        taken.insert(name.clone());
        table.push((column.clone(), name));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::line_string;
    use serde_json::json;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_columns_follow_first_appearance() {
        let a = NetworkFeature::new(
            MultiLineString::new(vec![line_string![(x: 0.0, y: 0.0), (x: 1.0, y: 1.0)]]),
            props(json!({"NIS_Nummer": "A", "Material-Typ": "PE"})),
        );
        let b = NetworkFeature::new(
            MultiLineString::new(vec![line_string![(x: 5.0, y: -2.0), (x: 6.0, y: 3.0)]]),
            props(json!({"NIS_Nummer": 7, "DN": 110})),
        );
        let network = NetworkFeatureCollection::new(2056, vec![a, b]);
        assert_eq!(network.columns, vec!["NIS_Nummer", "Material-Typ", "DN"]);
        assert_eq!(network.features[0].identifier("NIS_Nummer"), "A");
        assert_eq!(network.features[1].identifier("NIS_Nummer"), "7");
        assert_eq!(network.features[1].identifier("missing"), "<unknown>");

        let fp = network.footprint().unwrap();
        assert_eq!((fp.x_min, fp.y_min, fp.x_max, fp.y_max), (0.0, -2.0, 6.0, 3.0));
        assert!(NetworkFeatureCollection::new(2056, vec![]).footprint().is_none());
    }

    #[test]
    fn test_rename_table_resolves_collisions() {
        let columns: Vec<String> = ["Material-Typ", "Material_Typ", "Bau-Jahr", "NIS_Nummer"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let table = column_rename_table(&columns);
        let renamed: Vec<&str> = table.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(renamed, vec!["Material_Typ", "Material_Typ_1", "Bau_Jahr", "NIS_Nummer"]);
    }

    #[test]
    fn test_sanitize_keeps_values() {
        let collection = NetworkFeatureCollection3D {
            epsg: 2056,
            columns: vec!["NIS-Nummer".into(), "DN".into()],
            features: vec![NetworkFeature3D {
                geometry: vec![Point3::new(0.0, 0.0, 1.0), Point3::new(1.0, 0.0, 1.0)],
                properties: props(json!({"NIS-Nummer": "W-12", "DN": 150})),
            }],
        };
        let sanitized = collection.sanitize_columns();
        assert_eq!(sanitized.columns, vec!["NIS_Nummer", "DN"]);
        let p = &sanitized.features[0].properties;
        assert_eq!(p["NIS_Nummer"], json!("W-12"));
        assert_eq!(p["DN"], json!(150));
        assert!(p.get("NIS-Nummer").is_none());
    }
}
