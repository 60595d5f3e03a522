use nalgebra::Point3;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mesh::TerrainMesh;

/// `<tile stem>_delatin_err<max_error without '.'>.ply` next to the tile.
pub fn mesh_filename(tile: &Path, max_error: f64) -> PathBuf {
    let stem = tile
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let err = format!("{:?}", max_error).replace('.', "");
    let name = format!("{}_delatin_err{}.ply", stem, err);
    match tile.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Write `mesh` as ASCII PLY.
pub fn write_ply(mesh: &TerrainMesh, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut w = BufWriter::new(file);
    write_ascii(mesh, &mut w).map_err(|e| Error::io(path, e))?;
    w.flush().map_err(|e| Error::io(path, e))?;
    info!(
        "Mesh written to {:?} ({} vertices, {} triangles)",
        path,
        mesh.vertices.len(),
        mesh.triangles.len()
    );
    Ok(())
}

fn write_ascii(mesh: &TerrainMesh, w: &mut impl Write) -> std::io::Result<()> {
    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "comment generated by pipe-drape")?;
    writeln!(w, "element vertex {}", mesh.vertices.len())?;
    writeln!(w, "property double x")?;
    writeln!(w, "property double y")?;
    writeln!(w, "property double z")?;
    writeln!(w, "element face {}", mesh.triangles.len())?;
    writeln!(w, "property list uchar int vertex_indices")?;
    writeln!(w, "end_header")?;
    for v in &mesh.vertices {
        writeln!(w, "{} {} {}", v.x, v.y, v.z)?;
    }
    for [a, b, c] in &mesh.triangles {
        writeln!(w, "3 {} {} {}", a, b, c)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl Scalar {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "char" | "int8" => Scalar::I8,
            "uchar" | "uint8" => Scalar::U8,
            "short" | "int16" => Scalar::I16,
            "ushort" | "uint16" => Scalar::U16,
            "int" | "int32" => Scalar::I32,
            "uint" | "uint32" => Scalar::U32,
            "float" | "float32" => Scalar::F32,
            "double" | "float64" => Scalar::F64,
            other => return Err(Error::MeshFormat(format!("unknown property type '{}'", other))),
        })
    }

    fn size(self) -> usize {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::F64 => 8,
        }
    }

    fn decode_le(self, b: &[u8]) -> f64 {
        match self {
            Scalar::I8 => b[0] as i8 as f64,
            Scalar::U8 => b[0] as f64,
            Scalar::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            Scalar::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            Scalar::I32 => i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Scalar::U32 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Scalar::F32 => f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64,
            Scalar::F64 => f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        }
    }
}

#[derive(Debug, Clone)]
enum Property {
    Scalar { name: String, ty: Scalar },
    List { name: String, count: Scalar, item: Scalar },
}

impl Property {
    fn name(&self) -> &str {
        match self {
            Property::Scalar { name, .. } | Property::List { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    count: usize,
    properties: Vec<Property>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Format {
    Ascii,
    BinaryLittleEndian,
}

#[derive(Debug)]
struct Header {
    format: Format,
    elements: Vec<Element>,
}

fn parse_header(reader: &mut impl BufRead) -> Result<Header> {
    let mut line = String::new();
    let mut next_line = |line: &mut String| -> Result<bool> {
        line.clear();
        let n = reader
            .read_line(line)
            .map_err(|e| Error::MeshFormat(format!("failed to read header: {}", e)))?;
        Ok(n > 0)
    };

    if !next_line(&mut line)? || line.trim() != "ply" {
        return Err(Error::MeshFormat("missing 'ply' magic".into()));
    }

    let mut format = None;
    let mut elements: Vec<Element> = Vec::new();
    loop {
        if !next_line(&mut line)? {
            return Err(Error::MeshFormat("header is not terminated by end_header".into()));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["end_header"] => break,
            ["format", "ascii", _] => format = Some(Format::Ascii),
            ["format", "binary_little_endian", _] => format = Some(Format::BinaryLittleEndian),
            ["format", other, ..] => {
                return Err(Error::MeshFormat(format!("unsupported PLY format '{}'", other)));
            }
            ["comment", ..] | ["obj_info", ..] | [] => {}
            ["element", name, count] => {
                let count = count
                    .parse()
                    .map_err(|_| Error::MeshFormat(format!("bad element count '{}'", count)))?;
                elements.push(Element {
                    name: name.to_string(),
                    count,
                    properties: Vec::new(),
                });
            }
            ["property", "list", count, item, name] => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| Error::MeshFormat("property before element".into()))?;
                element.properties.push(Property::List {
                    name: name.to_string(),
                    count: Scalar::parse(count)?,
                    item: Scalar::parse(item)?,
                });
            }
            ["property", ty, name] => {
                let element = elements
                    .last_mut()
                    .ok_or_else(|| Error::MeshFormat("property before element".into()))?;
                element.properties.push(Property::Scalar {
                    name: name.to_string(),
                    ty: Scalar::parse(ty)?,
                });
            }
            _ => {
                return Err(Error::MeshFormat(format!(
                    "unexpected header line '{}'",
                    line.trim()
                )));
            }
        }
    }

    let format = format.ok_or_else(|| Error::MeshFormat("missing format line".into()))?;
    Ok(Header { format, elements })
}

/// Body value stream, either whitespace tokens or packed little-endian bytes.
enum Body {
    Ascii { tokens: Vec<String>, pos: usize },
    Binary { data: Vec<u8>, pos: usize },
}

impl Body {
    fn next(&mut self, ty: Scalar) -> Result<f64> {
        match self {
            Body::Ascii { tokens, pos } => {
                let token = tokens
                    .get(*pos)
                    .ok_or_else(|| Error::MeshFormat("unexpected end of data".into()))?;
                *pos += 1;
                token
                    .parse::<f64>()
                    .map_err(|_| Error::MeshFormat(format!("bad number '{}'", token)))
            }
            Body::Binary { data, pos } => {
                let end = *pos + ty.size();
                let bytes = data
                    .get(*pos..end)
                    .ok_or_else(|| Error::MeshFormat("unexpected end of data".into()))?;
                *pos = end;
                Ok(ty.decode_le(bytes))
            }
        }
    }
}

fn vertex_index(value: f64, n_vertices: usize) -> Result<usize> {
    if value < 0.0 || value.fract() != 0.0 || value as usize >= n_vertices {
        return Err(Error::MeshFormat(format!(
            "face references invalid vertex {} ({} vertices)",
            value, n_vertices
        )));
    }
    Ok(value as usize)
}

/// Read an ASCII or binary little-endian PLY mesh.
///
/// Polygons with more than three corners are fan-triangulated.
pub fn read_ply(path: &Path) -> Result<TerrainMesh> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let header = parse_header(&mut reader)?;

    let mut body = match header.format {
        Format::Ascii => {
            let mut text = String::new();
            reader
                .read_to_string(&mut text)
                .map_err(|e| Error::io(path, e))?;
            Body::Ascii {
                tokens: text.split_whitespace().map(str::to_string).collect(),
                pos: 0,
            }
        }
        Format::BinaryLittleEndian => {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).map_err(|e| Error::io(path, e))?;
            Body::Binary { data, pos: 0 }
        }
    };

    let mut vertices: Vec<Point3<f64>> = Vec::new();
    let mut triangles: Vec<[usize; 3]> = Vec::new();

    for element in &header.elements {
        match element.name.as_str() {
            "vertex" => {
                let axis = |n: &str| element.properties.iter().position(|p| p.name() == n);
                let (ix, iy, iz) = match (axis("x"), axis("y"), axis("z")) {
                    (Some(x), Some(y), Some(z)) => (x, y, z),
                    _ => return Err(Error::MeshFormat("vertex element lacks x/y/z".into())),
                };
                vertices.reserve(element.count);
                let mut values = vec![0.0; element.properties.len()];
                for _ in 0..element.count {
                    for (slot, prop) in values.iter_mut().zip(&element.properties) {
                        *slot = match prop {
                            Property::Scalar { ty, .. } => body.next(*ty)?,
                            Property::List { count, item, .. } => {
                                let n = body.next(*count)? as usize;
                                for _ in 0..n {
                                    body.next(*item)?;
                                }
                                0.0
                            }
                        };
                    }
                    vertices.push(Point3::new(values[ix], values[iy], values[iz]));
                }
            }
            "face" => {
                let n_vertices = vertices.len();
                for _ in 0..element.count {
                    for prop in &element.properties {
                        match prop {
                            Property::List { name, count, item }
                                if name == "vertex_indices" || name == "vertex_index" =>
                            {
                                let n = body.next(*count)? as usize;
                                let mut corners = Vec::with_capacity(n);
                                for _ in 0..n {
                                    corners.push(vertex_index(body.next(*item)?, n_vertices)?);
                                }
                                if n < 3 {
                                    return Err(Error::MeshFormat(format!(
                                        "face with {} corners",
                                        n
                                    )));
                                }
                                // 多角形は扇形に分割
                                for k in 1..n - 1 {
                                    triangles.push([corners[0], corners[k], corners[k + 1]]);
                                }
                            }
                            Property::List { count, item, .. } => {
                                let n = body.next(*count)? as usize;
                                for _ in 0..n {
                                    body.next(*item)?;
                                }
                            }
                            Property::Scalar { ty, .. } => {
                                body.next(*ty)?;
                            }
                        }
                    }
                }
            }
            other => {
                debug!("Skipping PLY element '{}' ({} entries)", other, element.count);
                for _ in 0..element.count {
                    for prop in &element.properties {
                        match prop {
                            Property::Scalar { ty, .. } => {
                                body.next(*ty)?;
                            }
                            Property::List { count, item, .. } => {
                                let n = body.next(*count)? as usize;
                                for _ in 0..n {
                                    body.next(*item)?;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    let mesh = TerrainMesh::new(vertices, triangles)
        .map_err(|e| Error::MeshFormat(format!("{:?}: {}", path, e)))?;
    info!(
        "Mesh loaded from {:?} ({} vertices, {} triangles)",
        path,
        mesh.vertices.len(),
        mesh.triangles.len()
    );
    Ok(mesh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_mesh() -> TerrainMesh {
        TerrainMesh::new(
            vec![
                Point3::new(2_600_000.25, 1_199_999.75, 432.125),
                Point3::new(2_600_010.25, 1_199_999.75, 433.5),
                Point3::new(2_600_010.25, 1_199_989.75, 431.0),
                Point3::new(2_600_000.25, 1_199_989.75, 430.75),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
        .unwrap()
    }

    #[test]
    fn test_mesh_filename() {
        let tile = Path::new("/data/TEMP/swissalti3d_2019_2600-1199_0.5_2056_5728_extended.tif");
        assert_eq!(
            mesh_filename(tile, 0.5),
            PathBuf::from("/data/TEMP/swissalti3d_2019_2600-1199_0.5_2056_5728_extended_delatin_err05.ply")
        );
        assert_eq!(
            mesh_filename(Path::new("tile.tif"), 2.0),
            PathBuf::from("tile_delatin_err20.ply")
        );
    }

    #[test]
    fn test_ascii_written_mesh_reads_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mesh.ply");
        let mesh = sample_mesh();

        write_ply(&mesh, &path).unwrap();
        let read = read_ply(&path).unwrap();

        assert_eq!(read.vertices, mesh.vertices);
        assert_eq!(read.triangles, mesh.triangles);
    }

    #[test]
    fn test_binary_little_endian_with_quads() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("binary.ply");

        let mut bytes = b"ply\nformat binary_little_endian 1.0\ncomment exported elsewhere\n\
element vertex 4\nproperty float x\nproperty float y\nproperty float z\nproperty uchar red\n\
element face 1\nproperty list uchar uint vertex_indices\nend_header\n"
            .to_vec();
        for (x, y, z) in [(0.0f32, 0.0f32, 1.0f32), (4.0, 0.0, 2.0), (4.0, 4.0, 3.0), (0.0, 4.0, 4.0)] {
            bytes.extend_from_slice(&x.to_le_bytes());
            bytes.extend_from_slice(&y.to_le_bytes());
            bytes.extend_from_slice(&z.to_le_bytes());
            bytes.push(255);
        }
        bytes.push(4);
        for i in [0u32, 1, 2, 3] {
            bytes.extend_from_slice(&i.to_le_bytes());
        }
        std::fs::write(&path, bytes).unwrap();

        let mesh = read_ply(&path).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.vertices[2], Point3::new(4.0, 4.0, 3.0));
        assert_eq!(mesh.triangles, vec![[0, 1, 2], [0, 2, 3]]);
    }

    #[test]
    fn test_malformed_files_are_rejected() {
        let temp_dir = TempDir::new().unwrap();

        let path = temp_dir.path().join("not_a_mesh.ply");
        std::fs::write(&path, "solid cube\n").unwrap();
        assert!(matches!(read_ply(&path), Err(Error::MeshFormat(_))));

        let path = temp_dir.path().join("bad_index.ply");
        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 3\nproperty float x\nproperty float y\n\
property float z\nelement face 1\nproperty list uchar int vertex_indices\nend_header\n\
0 0 0\n1 0 0\n0 1 0\n3 0 1 7\n",
        )
        .unwrap();
        assert!(matches!(read_ply(&path), Err(Error::MeshFormat(_))));

        assert!(matches!(
            read_ply(&temp_dir.path().join("missing.ply")),
            Err(Error::Io { .. })
        ));
    }
}
