//! Deformation measures on linear tetrahedra.

use crate::{geometry::GeometryError, mesh::signed_volume, HeartGeometry, Mat3, Region, TetMesh, Vec3};

/// Shape function gradients and volume of a tetrahedron
/// in the reference configuration.
#[derive(Clone, Copy, Debug)]
pub struct ReferenceCell {
    /// Vertex indices of the cell.
    pub nodes: [usize; 4],
    /// Gradient of each vertex's shape function with respect to
    /// reference coordinates (constant over the cell).
    pub grads: [Vec3; 4],
    /// Reference volume.
    pub volume: f64,
}

impl ReferenceCell {
    /// Precompute the reference data of a cell.
    pub fn new(mesh: &TetMesh, cell: usize) -> Result<Self, GeometryError> {
        let [x0, x1, x2, x3] = mesh.cell_vertices(cell);
        let dm = Mat3::from_columns(&[x1 - x0, x2 - x0, x3 - x0]);
        let dm_inv = dm
            .try_inverse()
            .ok_or(GeometryError::DegenerateCell(cell))?;
        // rows of the inverse are the gradients of the barycentric coordinates
        let g1 = dm_inv.row(0).transpose();
        let g2 = dm_inv.row(1).transpose();
        let g3 = dm_inv.row(2).transpose();
        let g0 = -(g1 + g2 + g3);

        let volume = signed_volume(&[x0, x1, x2, x3]).abs();
        if volume <= f64::EPSILON * dm.norm().powi(3) {
            return Err(GeometryError::DegenerateCell(cell));
        }

        Ok(Self {
            nodes: mesh.cells()[cell],
            grads: [g0, g1, g2, g3],
            volume,
        })
    }

    /// Deformation gradient `F = I + grad u` for a displacement field
    /// given per vertex.
    #[inline]
    pub fn deformation_gradient(&self, u: &[Vec3]) -> Mat3 {
        self.deformation_gradient_local(&self.nodes.map(|n| u[n]))
    }

    /// Deformation gradient from the displacements of this cell's vertices only.
    #[inline]
    pub fn deformation_gradient_local(&self, u: &[Vec3; 4]) -> Mat3 {
        let mut f = Mat3::identity();
        for (ua, ga) in u.iter().zip(&self.grads) {
            f += ua * ga.transpose();
        }
        f
    }
}

/// Precompute the reference data of every cell of a mesh.
pub fn reference_cells(mesh: &TetMesh) -> Result<Vec<ReferenceCell>, GeometryError> {
    (0..mesh.cell_count())
        .map(|cell| ReferenceCell::new(mesh, cell))
        .collect()
}

/// Green-Lagrange strain `E = (F^T F - I) / 2`.
#[inline]
pub fn green_lagrange(f: &Mat3) -> Mat3 {
    0.5 * (f.transpose() * f - Mat3::identity())
}

/// Vertex positions after applying a displacement.
pub fn deformed_positions(mesh: &TetMesh, u: &[Vec3]) -> Vec<Vec3> {
    mesh.vertices().iter().zip(u).map(|(x, u)| x + u).collect()
}

/// Volume enclosed by the endocardium and the plane of the base.
///
/// Computed as `-1/3 * sum((x - c) . n dA)` over the endocardial faces
/// at the given vertex positions, with `c` the base center
/// (so the missing lid on the base plane contributes nothing).
/// Face normals point out of the wall, i.e. into the cavity,
/// hence the sign.
pub fn cavity_volume(geometry: &HeartGeometry, positions: &[Vec3], origin: Vec3) -> f64 {
    let mesh = &geometry.mesh;
    let endo = geometry.region_faces(Region::Endo);
    let flux: f64 = endo
        .indices
        .ones()
        .map(|face| {
            let [a, b, c] = mesh.exterior_faces()[face].vertices.map(|i| positions[i]);
            let centroid = (a + b + c) / 3.;
            (centroid - origin).dot(&mesh.face_area_vector(face, positions))
        })
        .sum();
    -flux / 3.
}
