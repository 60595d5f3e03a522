use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::{
    BooleanOps, Coord, Intersects, Line, LineLocatePoint, LineString, MultiLineString, MultiPolygon,
    Point, Polygon,
};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::mesh::TerrainMesh;
use crate::model::Bounds;
use crate::network::{NetworkFeature, NetworkFeatureCollection};
use crate::raycast::TriangleIndex;

/// Crossings closer than this to an existing vertex are not inserted (metres).
const VERTEX_TOLERANCE: f64 = 1e-6;

/// 2D outline of the mesh: union of its triangles as polygons with holes.
pub fn mesh_footprint(mesh: &TerrainMesh) -> MultiPolygon<f64> {
    let triangles: Vec<Polygon<f64>> = mesh
        .triangles
        .iter()
        .map(|&[a, b, c]| {
            let ring: Vec<Coord<f64>> = [a, b, c, a]
                .iter()
                .map(|&i| Coord {
                    x: mesh.vertices[i].x,
                    y: mesh.vertices[i].y,
                })
                .collect();
            Polygon::new(LineString::new(ring), vec![])
        })
        .collect();

    // TINの三角形は重ならないので、空集合との和で共有辺が消える
    MultiPolygon::new(triangles).union(&MultiPolygon::new(vec![]))
}

/// Insert a vertex wherever `line` crosses a triangle edge of the mesh.
fn split_at_mesh_edges(line: &LineString<f64>, mesh: &TerrainMesh, index: &TriangleIndex) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = Vec::with_capacity(line.0.len());
    for segment in line.lines() {
        if coords.is_empty() {
            coords.push(segment.start);
        }
        let d = segment.delta();
        let len2 = d.x * d.x + d.y * d.y;
        if len2 == 0.0 {
            continue;
        }
        let param = |c: Coord<f64>| ((c.x - segment.start.x) * d.x + (c.y - segment.start.y) * d.y) / len2;

        let area = Bounds::new(
            segment.start.x.min(segment.end.x),
            segment.start.y.min(segment.end.y),
            segment.start.x.max(segment.end.x),
            segment.start.y.max(segment.end.y),
        );
        let mut ts = Vec::new();
        for t in index.candidates_in(&area) {
            let [a, b, c] = mesh.triangle(t);
            for (p, q) in [(a, b), (b, c), (c, a)] {
                let edge = Line::new(Coord { x: p.x, y: p.y }, Coord { x: q.x, y: q.y });
                match line_intersection(segment, edge) {
                    Some(LineIntersection::SinglePoint { intersection, .. }) => {
                        ts.push(param(intersection));
                    }
                    Some(LineIntersection::Collinear { intersection }) => {
                        ts.push(param(intersection.start));
                        ts.push(param(intersection.end));
                    }
                    None => {}
                }
            }
        }

        let slack = VERTEX_TOLERANCE / len2.sqrt();
        ts.retain(|t| *t > slack && *t < 1.0 - slack);
        ts.sort_by(|a, b| a.total_cmp(b));
        ts.dedup_by(|a, b| (*a - *b).abs() <= slack);
        coords.extend(ts.into_iter().map(|t| Coord {
            x: segment.start.x + d.x * t,
            y: segment.start.y + d.y * t,
        }));
        coords.push(segment.end);
    }
    LineString::new(coords)
}

/// Parts of `line` inside (`keep_inside`) or outside the footprint.
/// The boundary counts as inside.
fn clip_line(line: &LineString<f64>, footprint: &MultiPolygon<f64>, keep_inside: bool) -> Vec<LineString<f64>> {
    if !footprint.intersects(line) {
        return if keep_inside { Vec::new() } else { vec![line.clone()] };
    }
    // 入力線の向きと順序に揃える
    let mut parts: Vec<(f64, LineString<f64>)> = footprint
        .clip(&MultiLineString::new(vec![line.clone()]), !keep_inside)
        .0
        .into_iter()
        .filter(|part| part.0.len() >= 2)
        .map(|mut part| {
            let start = line.line_locate_point(&Point::from(part.0[0]));
            let end = line.line_locate_point(&Point::from(part.0[part.0.len() - 1]));
            match (start, end) {
                (Some(a), Some(b)) if a > b => {
                    part.0.reverse();
                    (b, part)
                }
                (Some(a), _) => (a, part),
                _ => (0.0, part),
            }
        })
        .collect();
    parts.sort_by(|a, b| a.0.total_cmp(&b.0));
    parts.into_iter().map(|(_, part)| part).collect()
}

fn coord_key(c: Coord<f64>) -> (u64, u64) {
    ((c.x + 0.0).to_bits(), (c.y + 0.0).to_bits())
}

/// Join lines whose endpoints coincide into maximal runs.
///
/// Lines only join through nodes where exactly two line ends meet; a line is
/// reversed where needed so each run is continuous.
pub fn merge_lines(lines: Vec<LineString<f64>>) -> Vec<LineString<f64>> {
    let lines: Vec<LineString<f64>> = lines.into_iter().filter(|l| l.0.len() >= 2).collect();
    if lines.len() < 2 {
        return lines;
    }

    let mut nodes: HashMap<(u64, u64), Vec<usize>> = HashMap::new();
    for (i, l) in lines.iter().enumerate() {
        nodes.entry(coord_key(l.0[0])).or_default().push(i);
        nodes.entry(coord_key(l.0[l.0.len() - 1])).or_default().push(i);
    }

    // 次数2の節点でつながる相手
    let partner = |node: Coord<f64>, from: usize| -> Option<usize> {
        match nodes.get(&coord_key(node)).map(|v| v.as_slice()) {
            Some([a, b]) if *a == from && *b != from => Some(*b),
            Some([a, b]) if *b == from && *a != from => Some(*a),
            _ => None,
        }
    };

    let mut used = vec![false; lines.len()];
    let mut merged = Vec::new();
    for seed in 0..lines.len() {
        if used[seed] {
            continue;
        }
        used[seed] = true;
        let mut run: Vec<Coord<f64>> = lines[seed].0.clone();

        // 前方へ延長
        let mut last = seed;
        while let Some(next) = partner(run[run.len() - 1], last) {
            if used[next] {
                break;
            }
            used[next] = true;
            let mut coords = lines[next].0.clone();
            if coord_key(coords[0]) != coord_key(run[run.len() - 1]) {
                coords.reverse();
            }
            run.extend(coords.into_iter().skip(1));
            last = next;
        }

        // 後方へ延長
        let mut first = seed;
        while let Some(prev) = partner(run[0], first) {
            if used[prev] {
                break;
            }
            used[prev] = true;
            let mut coords = lines[prev].0.clone();
            if coord_key(coords[coords.len() - 1]) != coord_key(run[0]) {
                coords.reverse();
            }
            coords.pop();
            coords.extend(run);
            run = coords;
            first = prev;
        }

        merged.push(LineString::new(run));
    }
    merged
}

fn clip_collection(
    network: &NetworkFeatureCollection,
    footprint: &MultiPolygon<f64>,
    keep_inside: bool,
    line_merge: bool,
    identifier: &str,
    split: impl Fn(LineString<f64>) -> LineString<f64>,
) -> NetworkFeatureCollection {
    let mut features = Vec::with_capacity(network.features.len());
    for feature in &network.features {
        let mut parts: Vec<LineString<f64>> = feature
            .geometry
            .iter()
            .flat_map(|line| clip_line(line, footprint, keep_inside))
            .map(&split)
            .collect();
        if line_merge {
            parts = merge_lines(parts);
        }
        if parts.is_empty() {
            debug!(
                "Feature {} lies entirely {} the terrain and is dropped",
                feature.identifier(identifier),
                if keep_inside { "outside" } else { "inside" }
            );
            continue;
        }
        features.push(NetworkFeature::new(
            MultiLineString::new(parts),
            feature.properties.clone(),
        ));
    }
    network.with_features(features)
}

/// Keep only the parts of the network that lie on the terrain mesh.
///
/// Kept parts gain a vertex at every triangle edge they cross, so the draped
/// line follows the surface between the original vertices.
pub fn restrict_to_mesh(
    network: &NetworkFeatureCollection,
    mesh: &TerrainMesh,
    line_merge: bool,
    identifier: &str,
) -> NetworkFeatureCollection {
    let start_time = Instant::now();
    let footprint = mesh_footprint(mesh);
    let index = TriangleIndex::build(mesh);
    let restricted = clip_collection(network, &footprint, true, line_merge, identifier, |part| {
        split_at_mesh_edges(&part, mesh, &index)
    });
    info!(
        "Network restricted to the mesh footprint: {} of {} feature(s) kept in {:.2}s",
        restricted.len(),
        network.len(),
        start_time.elapsed().as_secs_f64()
    );
    restricted
}

/// Boolean difference: keep only the parts of the network outside `footprint`.
pub fn subtract_footprint(
    network: &NetworkFeatureCollection,
    footprint: &MultiPolygon<f64>,
    line_merge: bool,
    identifier: &str,
) -> NetworkFeatureCollection {
    clip_collection(network, footprint, false, line_merge, identifier, |part| part)
}

/// One feature per line part, each with a copy of the original attributes.
pub fn explode(network: &NetworkFeatureCollection) -> NetworkFeatureCollection {
    let features = network
        .features
        .iter()
        .flat_map(|f| {
            f.geometry
                .iter()
                .map(|line| {
                    NetworkFeature::new(
                        MultiLineString::new(vec![line.clone()]),
                        f.properties.clone(),
                    )
                })
        })
        .collect();
    network.with_features(features)
}
