//! The volumetric tetrahedral mesh underlying a heart geometry.

/// Low-level mesh construction and corresponding tests.
mod mesh_construction;
/// re-export the testing meshes for use in other modules' tests
/// (pub because they're also handy for integration tests and benchmarks)
#[doc(hidden)]
pub use mesh_construction::{cup_mesh, unit_cube_mesh};

//

use fixedbitset as fb;
use nalgebra as na;

use std::{collections::BTreeMap, rc::Rc};

use crate::Vec3;

/// A mesh of linear tetrahedra with named groups of surface triangles.
///
/// Surface groups are the raw input from the mesh file
/// (e.g. the `Epi`, `Endo` and `Base` physical groups);
/// they are turned into integer face markers by [`crate::tagging`].
#[derive(Clone, Debug)]
pub struct TetMesh {
    /// Vertices stored in a Rc so that they can be accessed from multiple locations.
    /// Mutation after creation is not supported.
    pub vertices: Rc<[Vec3]>,
    tets: Vec<[usize; 4]>,
    /// segment id per tetrahedron, e.g. an AHA segment from a volume physical group
    segments: Vec<u32>,
    surface_groups: BTreeMap<String, Vec<[usize; 3]>>,
    /// faces referenced by exactly one tetrahedron,
    /// ordered by the first tetrahedron that references them.
    exterior_faces: Vec<ExteriorFace>,
}

/// A triangle on the exterior of the mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExteriorFace {
    /// Vertex indices, ordered so that the right-hand normal
    /// points out of the mesh.
    pub vertices: [usize; 3],
    /// The tetrahedron this face belongs to.
    pub cell: usize,
}

impl TetMesh {
    /// Construct a mesh from raw vertices and tetrahedra.
    ///
    /// Every tetrahedron gets segment id 1 and there are no surface groups;
    /// see [`with_segments`][Self::with_segments]
    /// and [`insert_surface_group`][Self::insert_surface_group].
    pub fn new(vertices: Vec<Vec3>, tets: Vec<[usize; 4]>) -> Self {
        let segments = vec![1; tets.len()];
        mesh_construction::build_mesh(vertices, tets, segments)
    }

    /// Replace the segment ids of the tetrahedra.
    ///
    /// Panics if the number of ids doesn't match the number of tetrahedra.
    pub fn with_segments(mut self, segments: Vec<u32>) -> Self {
        assert_eq!(
            segments.len(),
            self.tets.len(),
            "one segment id per tetrahedron required"
        );
        self.segments = segments;
        self
    }

    /// Add a named group of surface triangles,
    /// appending to the group if it already exists.
    pub fn insert_surface_group(&mut self, name: &str, triangles: Vec<[usize; 3]>) {
        self.surface_groups
            .entry(name.to_string())
            .or_default()
            .extend(triangles);
    }

    /// Get the number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of tetrahedra in the mesh.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.tets.len()
    }

    /// Get a slice of all vertices in the mesh.
    #[inline]
    pub fn vertices(&self) -> &[Vec3] {
        &self.vertices
    }

    /// Get the vertex indices of every tetrahedron.
    #[inline]
    pub fn cells(&self) -> &[[usize; 4]] {
        &self.tets
    }

    /// Get the segment id of every tetrahedron.
    #[inline]
    pub fn segments(&self) -> &[u32] {
        &self.segments
    }

    /// Get the positions of the vertices of a tetrahedron.
    #[inline]
    pub fn cell_vertices(&self, cell: usize) -> [Vec3; 4] {
        self.tets[cell].map(|i| self.vertices[i])
    }

    /// Get the barycenter of every tetrahedron.
    pub fn barycenters(&self) -> Vec<Vec3> {
        self.tets
            .iter()
            .map(|tet| tet.iter().map(|&i| self.vertices[i]).sum::<Vec3>() / 4.)
            .collect()
    }

    /// Look up a named surface group.
    pub fn surface_group(&self, name: &str) -> Option<&[[usize; 3]]> {
        self.surface_groups.get(name).map(|g| g.as_slice())
    }

    /// Iterate over all named surface groups.
    pub fn surface_groups(&self) -> impl Iterator<Item = (&str, &[[usize; 3]])> {
        self.surface_groups
            .iter()
            .map(|(name, tris)| (name.as_str(), tris.as_slice()))
    }

    /// Get the triangles on the exterior of the mesh.
    #[inline]
    pub fn exterior_faces(&self) -> &[ExteriorFace] {
        &self.exterior_faces
    }

    /// Get the positions of the vertices of an exterior face.
    #[inline]
    pub fn face_vertices(&self, face: usize) -> [Vec3; 3] {
        self.exterior_faces[face].vertices.map(|i| self.vertices[i])
    }

    /// Area vector (area times outward unit normal) of an exterior face
    /// in the configuration given by `positions`.
    #[inline]
    pub fn face_area_vector(&self, face: usize, positions: &[Vec3]) -> Vec3 {
        let [a, b, c] = self.exterior_faces[face].vertices.map(|i| positions[i]);
        0.5 * (b - a).cross(&(c - a))
    }

    /// Get a bounding box enclosing the entire mesh.
    pub fn bounds(&self) -> BoundingBox {
        let mut min = Vec3::repeat(f64::INFINITY);
        let mut max = Vec3::repeat(f64::NEG_INFINITY);
        for v in self.vertices.iter() {
            min = min.inf(v);
            max = max.sup(v);
        }
        BoundingBox { min, max }
    }

    // pieces used by the refinement and persistence code
    // to rebuild meshes without going through the public constructor

    pub(crate) fn from_parts(
        vertices: Vec<Vec3>,
        tets: Vec<[usize; 4]>,
        segments: Vec<u32>,
        surface_groups: BTreeMap<String, Vec<[usize; 3]>>,
    ) -> Self {
        let mut mesh = mesh_construction::build_mesh(vertices, tets, segments);
        mesh.surface_groups = surface_groups;
        mesh
    }

    pub(crate) fn surface_group_map(&self) -> &BTreeMap<String, Vec<[usize; 3]>> {
        &self.surface_groups
    }
}

/// An axis-aligned bounding box.
#[derive(Clone, Copy, Debug)]
pub struct BoundingBox {
    /// The minimum corner of the box.
    pub min: Vec3,
    /// The maximum corner of the box.
    pub max: Vec3,
}

/// A subset of the exterior faces of a mesh, e.g. every face with a given marker.
///
/// Iterate over the face indices with `indices.ones()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaceSubset {
    /// A bitset containing the indices of faces present in the subset.
    pub indices: fb::FixedBitSet,
}

impl FaceSubset {
    /// Create a subset from an iterator of exterior face indices.
    pub fn from_indices(indices: impl Iterator<Item = usize>) -> Self {
        Self {
            indices: fb::FixedBitSet::from_iter(indices),
        }
    }

    /// Create a subset of the faces satisfying a predicate.
    pub fn from_predicate(mesh: &TetMesh, pred: impl Fn(usize, &ExteriorFace) -> bool) -> Self {
        let mut indices = fb::FixedBitSet::with_capacity(mesh.exterior_faces.len());
        for (idx, face) in mesh.exterior_faces.iter().enumerate() {
            indices.set(idx, pred(idx, face));
        }
        Self { indices }
    }

    /// Take the union (i.e. set of faces that are in one or the other)
    /// of this subset with another.
    #[inline]
    pub fn union(&self, other: &Self) -> Self {
        let mut indices = self.indices.clone();
        indices.union_with(&other.indices);
        Self { indices }
    }

    /// Get the number of faces in this subset.
    #[inline]
    pub fn count(&self) -> usize {
        self.indices.count_ones(..)
    }

    /// Whether the subset contains no faces.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Get the set of vertices touched by the faces in this subset.
    pub fn vertices(&self, mesh: &TetMesh) -> fb::FixedBitSet {
        let mut verts = fb::FixedBitSet::with_capacity(mesh.vertex_count());
        for face in self.indices.ones() {
            for &v in &mesh.exterior_faces[face].vertices {
                verts.insert(v);
            }
        }
        verts
    }
}

/// Signed volume of a tetrahedron, positive if the vertices
/// are in right-handed order.
#[inline]
pub fn signed_volume(verts: &[Vec3; 4]) -> f64 {
    let edges = na::Matrix3::from_columns(&[
        verts[1] - verts[0],
        verts[2] - verts[0],
        verts[3] - verts[0],
    ]);
    edges.determinant() / 6.
}
