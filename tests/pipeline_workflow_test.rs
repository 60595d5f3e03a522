use geo::{line_string, LineString, MultiLineString};
use nalgebra::Point3;
use pipe_drape::geojson::{output_path, read_network, write_network_3d};
use pipe_drape::model::GeoTransform;
use pipe_drape::ply::{mesh_filename, read_ply, write_ply};
use pipe_drape::raster::merge_grids;
use pipe_drape::{
    triangulate, Assembler, ElevationGrid, GeoTiffWriter, NetworkFeature, NetworkFeatureCollection,
    PipelineConfig, TerrainMesh, TerrainSource,
};
use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;

fn flat_grid(origin_x: f64, origin_y: f64, rows: usize, cols: usize, height: f64) -> ElevationGrid {
    ElevationGrid::new(
        rows,
        cols,
        vec![height; rows * cols],
        GeoTransform {
            origin_x,
            origin_y,
            pixel_width: 0.5,
            pixel_height: -0.5,
        },
        None,
    )
    .unwrap()
}

fn feature(line: LineString<f64>, properties: Value) -> NetworkFeature {
    NetworkFeature::new(
        MultiLineString::new(vec![line]),
        properties.as_object().cloned().unwrap(),
    )
}

fn gtiff_available() -> bool {
    gdal::DriverManager::get_driver_by_name("GTiff").is_ok()
}

#[test]
fn test_flat_triangulation_carries_the_offset() {
    // 400m の平坦地形、オフセット -0.8
    let grid = flat_grid(2_600_000.0, 1_200_000.0, 8, 8, 400.0);
    let mesh = triangulate(&grid, 0.5, -0.8).unwrap();
    assert_eq!(mesh.vertices.len(), 4);
    assert_eq!(mesh.triangles.len(), 2);
    assert!(mesh.vertices.iter().all(|v| (v.z - 399.2).abs() < 1e-9));
}

#[test]
fn test_flat_terrain_end_to_end() {
    // 標高 400m の平坦メッシュ、対角線は (x0, y0)-(x0+10, y0+10)
    let (x0, y0) = (2_600_000.0, 1_200_000.0);
    let mesh = TerrainMesh::new(
        vec![
            Point3::new(x0, y0, 400.0),
            Point3::new(x0 + 10.0, y0, 400.0),
            Point3::new(x0 + 10.0, y0 + 10.0, 400.0),
            Point3::new(x0, y0 + 10.0, 400.0),
        ],
        vec![[0, 1, 2], [0, 2, 3]],
    )
    .unwrap();

    // 対角線と交差しない正方形
    let square = line_string![
        (x: x0 + 6.0, y: y0 + 1.0),
        (x: x0 + 9.0, y: y0 + 1.0),
        (x: x0 + 9.0, y: y0 + 4.0),
        (x: x0 + 6.0, y: y0 + 4.0),
    ];
    let network = NetworkFeatureCollection::new(
        2056,
        vec![
            feature(
                square.clone(),
                json!({"NIS_Nummer": "W-1", "Rohr-Material": "PE", "DN": 110}),
            ),
            feature(
                line_string![(x: 2_700_000.0, y: 1_100_000.0), (x: 2_700_010.0, y: 1_100_000.0)],
                json!({"NIS_Nummer": "W-2", "Rohr-Material": "GG", "DN": 150}),
            ),
        ],
    );

    let result = Assembler::new(PipelineConfig::default())
        .assemble(&network, TerrainSource::Mesh(mesh))
        .unwrap();

    // 範囲外の区間は出力されない
    assert_eq!(result.len(), 1);
    let f = &result.features[0];
    assert_eq!(f.geometry.len(), 4);
    assert!(f.geometry.iter().all(|p| (p.z - 399.2).abs() < 1e-9));
    for (p, c) in f.geometry.iter().zip(square.coords()) {
        assert!((p.x - c.x).abs() < 1e-6 && (p.y - c.y).abs() < 1e-6);
    }

    // 属性は保持され、列名は正規化される
    assert_eq!(result.columns, vec!["NIS_Nummer", "Rohr_Material", "DN"]);
    assert_eq!(f.properties["NIS_Nummer"], json!("W-1"));
    assert_eq!(f.properties["Rohr_Material"], json!("PE"));
    assert_eq!(f.properties["DN"], json!(110));
}

#[test]
fn test_gap_between_merged_tiles_is_not_draped() {
    // L字に並んだ3タイル、南東の 2m 四方は欠損
    let merged = merge_grids(&[
        flat_grid(2_600_000.0, 1_200_000.0, 4, 4, 400.0),
        flat_grid(2_600_002.0, 1_200_000.0, 4, 4, 400.0),
        flat_grid(2_600_000.0, 1_199_998.0, 4, 4, 400.0),
    ])
    .unwrap();
    assert_eq!(merged.shape(), (8, 8));
    assert!(merged.is_nodata(merged.get(6, 6)));

    let network = NetworkFeatureCollection::new(
        2056,
        vec![
            feature(
                line_string![(x: 2_600_002.75, y: 1_199_997.25), (x: 2_600_003.25, y: 1_199_996.75)],
                json!({"NIS_Nummer": "GAP"}),
            ),
            feature(
                line_string![(x: 2_600_000.5, y: 1_199_999.5), (x: 2_600_001.5, y: 1_199_999.0)],
                json!({"NIS_Nummer": "NW"}),
            ),
        ],
    );
    let result = Assembler::new(PipelineConfig::default())
        .assemble(&network, TerrainSource::Grid(merged))
        .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.features[0].identifier("NIS_Nummer"), "NW");
    assert!(result.features[0]
        .geometry
        .iter()
        .all(|p| (p.z - 398.4).abs() < 1e-9));
}

#[test]
fn test_network_outside_terrain_yields_empty_collection() {
    let grid = flat_grid(2_600_000.0, 1_200_000.0, 4, 4, 400.0);
    let network = NetworkFeatureCollection::new(
        2056,
        vec![feature(
            line_string![(x: 0.0, y: 0.0), (x: 10.0, y: 10.0)],
            json!({"NIS_Nummer": "X-1"}),
        )],
    );
    let result = Assembler::new(PipelineConfig::default())
        .assemble(&network, TerrainSource::Grid(grid))
        .unwrap();
    assert!(result.is_empty());
}

#[test]
fn test_saved_mesh_reloads_with_the_same_heights() {
    let temp_dir = TempDir::new().unwrap();
    let grid = flat_grid(2_600_000.0, 1_200_000.0, 4, 4, 400.0);
    let mesh = triangulate(&grid, 0.5, -0.8).unwrap();
    let path = mesh_filename(&temp_dir.path().join("tile.tif"), 0.5);
    write_ply(&mesh, &path).unwrap();

    let loaded = read_ply(&path).unwrap();
    assert_eq!(loaded.vertices, mesh.vertices);
    assert!(loaded.vertices.iter().all(|v| (v.z - 399.2).abs() < 1e-9));

    // 読み込んだメッシュにもレイキャスト前のオフセットが掛かる
    let network = NetworkFeatureCollection::new(
        2056,
        vec![feature(
            line_string![(x: 2_600_000.5, y: 1_199_999.5), (x: 2_600_001.5, y: 1_199_998.5)],
            json!({"NIS_Nummer": "P-1"}),
        )],
    );
    let result = Assembler::new(PipelineConfig::default())
        .assemble(&network, TerrainSource::Mesh(loaded))
        .unwrap();
    assert_eq!(result.len(), 1);
    assert!(result.features[0]
        .geometry
        .iter()
        .all(|p| (p.z - 398.4).abs() < 1e-9));
}

#[test]
fn test_project_workflow_with_dem_tiles() {
    if !gtiff_available() {
        eprintln!("Skipping test: GTiff driver not available in bundled GDAL");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let work = temp_dir.path().join("TEMP");
    fs::create_dir_all(&work).unwrap();

    // 隣接する2タイル（各4x4ピクセル、0.5m）
    let writer = GeoTiffWriter::new().with_epsg(2056);
    writer
        .write(
            &flat_grid(2_600_000.0, 1_200_000.0, 4, 4, 400.0),
            &work.join("swissalti3d_2019_2600-1199_0.5_2056_5728.tif"),
        )
        .unwrap();
    writer
        .write(
            &flat_grid(2_600_002.0, 1_200_000.0, 4, 4, 400.0),
            &work.join("swissalti3d_2019_2601-1199_0.5_2056_5728.tif"),
        )
        .unwrap();

    let trace = temp_dir.path().join("leitungen.geojson");
    fs::write(
        &trace,
        r#"{"type": "FeatureCollection",
            "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::2056"}},
            "features": [{"type": "Feature",
                          "properties": {"NIS_Nummer": "G-7", "Bau-Jahr": 1999},
                          "geometry": {"type": "LineString",
                                       "coordinates": [[2600001.0, 1199999.0, 0.0], [2600003.0, 1199998.5, 0.0]]}}]}"#,
    )
    .unwrap();

    let network = read_network(&trace, 2056).unwrap();
    let tiles = pipe_drape::raster::discover_tiles(&work).unwrap();
    assert_eq!(tiles.len(), 2);

    let result = Assembler::new(PipelineConfig::default())
        .assemble(&network, TerrainSource::Dem(tiles))
        .unwrap();
    assert_eq!(result.len(), 1);
    assert!(work
        .join("swissalti3d_2019_2600-1199_0.5_2056_5728_extended_delatin_err05.ply")
        .is_file());

    let output = output_path(&work, &trace);
    write_network_3d(&result, &output).unwrap();
    let written: Value = serde_json::from_str(&fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(written["features"][0]["properties"]["Bau_Jahr"], json!(1999));
    let z = written["features"][0]["geometry"]["coordinates"][0][2].as_f64().unwrap();
    assert!((z - 398.4).abs() < 1e-6);
}
