//! Uniform refinement of tagged geometries.
//!
//! Every refinement level splits each tetrahedron into eight
//! by inserting a vertex at the midpoint of every edge
//! (four corner tetrahedra plus an octahedron cut along one diagonal),
//! and each exterior face into four.
//! Face markers, segment ids, surface groups and microstructure
//! are carried over to the children.

use std::collections::{BTreeMap, HashMap};

use crate::{
    geometry::{GeometryError, UNMARKED},
    mesh::signed_volume,
    microstructure::{FiberBasis, FiberSpace, Microstructure},
    HeartGeometry, TetMesh, Vec3,
};

/// Refine a geometry `levels` times.
///
/// Zero levels returns a copy of the input.
pub fn refine(geometry: &HeartGeometry, levels: u32) -> Result<HeartGeometry, GeometryError> {
    let mut current = geometry.clone();
    for level in 0..levels {
        current = refine_once(&current)?;
        tracing::debug!(
            level = level + 1,
            cells = current.mesh.cell_count(),
            vertices = current.mesh.vertex_count(),
            "refined geometry"
        );
    }
    Ok(current)
}

/// Edge midpoints created during refinement, in creation order.
struct Midpoints {
    vertices: Vec<Vec3>,
    index: HashMap<(usize, usize), usize>,
    edges: Vec<(usize, usize)>,
}

impl Midpoints {
    fn new(vertices: &[Vec3]) -> Self {
        Self {
            vertices: vertices.to_vec(),
            index: HashMap::new(),
            edges: Vec::new(),
        }
    }

    fn key(a: usize, b: usize) -> (usize, usize) {
        (a.min(b), a.max(b))
    }

    fn insert(&mut self, a: usize, b: usize) -> usize {
        let key = Self::key(a, b);
        if let Some(&m) = self.index.get(&key) {
            return m;
        }
        let m = self.vertices.len();
        self.vertices.push(0.5 * (self.vertices[a] + self.vertices[b]));
        self.index.insert(key, m);
        self.edges.push(key);
        m
    }

    fn get(&self, a: usize, b: usize) -> Option<usize> {
        self.index.get(&Self::key(a, b)).copied()
    }
}

fn split_triangle([a, b, c]: [usize; 3], [mab, mbc, mca]: [usize; 3]) -> [[usize; 3]; 4] {
    [[a, mab, mca], [mab, b, mbc], [mca, mbc, c], [mab, mbc, mca]]
}

fn sorted(mut face: [usize; 3]) -> [usize; 3] {
    face.sort_unstable();
    face
}

fn refine_once(geometry: &HeartGeometry) -> Result<HeartGeometry, GeometryError> {
    let mesh = &geometry.mesh;
    let mut mids = Midpoints::new(mesh.vertices());

    let mut tets = Vec::with_capacity(mesh.cell_count() * 8);
    let mut segments = Vec::with_capacity(mesh.cell_count() * 8);
    for (&[v0, v1, v2, v3], &segment) in mesh.cells().iter().zip(mesh.segments()) {
        let m01 = mids.insert(v0, v1);
        let m02 = mids.insert(v0, v2);
        let m03 = mids.insert(v0, v3);
        let m12 = mids.insert(v1, v2);
        let m13 = mids.insert(v1, v3);
        let m23 = mids.insert(v2, v3);

        let children = [
            [v0, m01, m02, m03],
            [m01, v1, m12, m13],
            [m02, m12, v2, m23],
            [m03, m13, m23, v3],
            // octahedron split along the m02-m13 diagonal
            [m02, m13, m01, m12],
            [m02, m13, m12, m23],
            [m02, m13, m23, m03],
            [m02, m13, m03, m01],
        ];
        for mut child in children {
            let vol = signed_volume(&child.map(|v| mids.vertices[v]));
            if vol == 0. {
                return Err(GeometryError::DegenerateCell(tets.len()));
            }
            if vol < 0. {
                child.swap(2, 3);
            }
            tets.push(child);
            segments.push(segment);
        }
    }

    // markers of the children of every marked exterior face
    let mut child_markers: HashMap<[usize; 3], u32> = HashMap::new();
    for (face, &marker) in mesh.exterior_faces().iter().zip(geometry.face_markers()) {
        if marker == UNMARKED {
            continue;
        }
        let [a, b, c] = face.vertices;
        let edge_mids = [(a, b), (b, c), (c, a)].map(|(x, y)| mids.insert(x, y));
        for child in split_triangle(face.vertices, edge_mids) {
            child_markers.insert(sorted(child), marker);
        }
    }

    let mut surface_groups: BTreeMap<String, Vec<[usize; 3]>> = BTreeMap::new();
    for (name, tris) in mesh.surface_groups() {
        let refined = surface_groups.entry(name.to_string()).or_default();
        for &[a, b, c] in tris {
            let edge_mids = [(a, b), (b, c), (c, a)].map(|(x, y)| mids.get(x, y));
            match edge_mids {
                [Some(mab), Some(mbc), Some(mca)] => {
                    refined.extend(split_triangle([a, b, c], [mab, mbc, mca]));
                }
                // the triangle doesn't lie on any tetrahedron;
                // it can't be matched to a face anyway
                _ => tracing::debug!(group = name, triangle = ?[a, b, c], "dropped surface triangle"),
            }
        }
    }

    let microstructure = geometry
        .microstructure()
        .map(|micro| refine_microstructure(micro, &mids));

    let Midpoints { vertices, .. } = mids;
    let refined_mesh = TetMesh::from_parts(vertices, tets, segments, surface_groups);
    let face_markers = refined_mesh
        .exterior_faces()
        .iter()
        .map(|face| {
            child_markers
                .get(&sorted(face.vertices))
                .copied()
                .unwrap_or(UNMARKED)
        })
        .collect();

    let mut refined = HeartGeometry::new(refined_mesh, face_markers)?;
    if let Some(micro) = microstructure {
        micro.check_size(&refined.mesh)?;
        refined = refined.with_microstructure(micro);
    }
    Ok(refined)
}

fn refine_microstructure(micro: &Microstructure, mids: &Midpoints) -> Microstructure {
    let bases = micro.bases();
    let refined: Vec<FiberBasis> = match micro.space() {
        FiberSpace::Cell => bases
            .iter()
            .flat_map(|b| std::iter::repeat(*b).take(8))
            .collect(),
        FiberSpace::Vertex => bases
            .iter()
            .copied()
            .chain(mids.edges.iter().map(|&(a, b)| {
                FiberBasis::orthonormalize(bases[a].f + bases[b].f, bases[a].s + bases[b].s)
            }))
            .collect(),
    };
    Microstructure::new(micro.space(), refined)
}
