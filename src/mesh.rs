use nalgebra::{Point3, Vector3};

use crate::error::{Error, Result};
use crate::model::Bounds;

/// Triangulated terrain surface in world coordinates.
#[derive(Debug, Clone)]
pub struct TerrainMesh {
    pub vertices: Vec<Point3<f64>>,
    pub triangles: Vec<[usize; 3]>,
}

impl TerrainMesh {
    pub fn new(vertices: Vec<Point3<f64>>, triangles: Vec<[usize; 3]>) -> Result<Self> {
        let mesh = Self { vertices, triangles };
        mesh.validate()?;
        Ok(mesh)
    }

    pub fn validate(&self) -> Result<()> {
        if self.triangles.is_empty() {
            return Err(Error::invalid("terrain mesh has no triangles"));
        }
        let n = self.vertices.len();
        for (i, t) in self.triangles.iter().enumerate() {
            if t.iter().any(|&v| v >= n) {
                return Err(Error::invalid(format!(
                    "triangle {} references a vertex out of range ({:?}, {} vertices)",
                    i, t, n
                )));
            }
            if t[0] == t[1] || t[1] == t[2] || t[0] == t[2] {
                return Err(Error::invalid(format!(
                    "triangle {} has repeated vertices: {:?}",
                    i, t
                )));
            }
        }
        if self.vertices.iter().any(|v| !v.coords.iter().all(|c| c.is_finite())) {
            return Err(Error::invalid("terrain mesh has non-finite vertices"));
        }
        Ok(())
    }

    pub fn translate(&mut self, offset: Vector3<f64>) {
        for v in &mut self.vertices {
            *v += offset;
        }
    }

    /// Copy of the mesh moved by `dz` along the vertical axis.
    pub fn shifted(&self, dz: f64) -> TerrainMesh {
        let mut mesh = self.clone();
        if dz != 0.0 {
            mesh.translate(Vector3::new(0.0, 0.0, dz));
        }
        mesh
    }

    pub fn triangle(&self, index: usize) -> [Point3<f64>; 3] {
        let [a, b, c] = self.triangles[index];
        [self.vertices[a], self.vertices[b], self.vertices[c]]
    }

    /// Horizontal extent of the vertices.
    pub fn bounds_2d(&self) -> Bounds {
        let mut b = Bounds::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for v in &self.vertices {
            b.x_min = b.x_min.min(v.x);
            b.y_min = b.y_min.min(v.y);
            b.x_max = b.x_max.max(v.x);
            b.y_max = b.y_max.max(v.y);
        }
        b
    }

    pub fn z_range(&self) -> (f64, f64) {
        self.vertices
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v.z), hi.max(v.z))
            })
    }
}
