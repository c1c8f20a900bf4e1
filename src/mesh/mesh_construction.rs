use std::{
    collections::{BTreeMap, HashMap},
    rc::Rc,
};

use itertools::{iproduct, Itertools};

use super::{signed_volume, ExteriorFace, TetMesh};
use crate::Vec3;

/// Construct a mesh from raw vertices, tetrahedra and segment ids,
/// deriving the exterior faces.
pub fn build_mesh(vertices: Vec<Vec3>, tets: Vec<[usize; 4]>, segments: Vec<u32>) -> TetMesh {
    let vertices: Rc<[Vec3]> = Rc::from(vertices);

    // count references to every face, identified by its sorted vertex indices.
    // faces are kept in order of first appearance
    // so that the face numbering is deterministic for a given input
    let mut face_slots: HashMap<[usize; 3], usize> = HashMap::new();
    let mut faces: Vec<(ExteriorFace, u32)> = Vec::new();

    for (cell, tet) in tets.iter().enumerate() {
        for exclude_idx in 0..4 {
            let opposite = tet[exclude_idx];
            let mut face = [0; 3];
            for (slot, vert) in tet
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != exclude_idx)
                .map(|(_, v)| *v)
                .enumerate()
            {
                face[slot] = vert;
            }

            let mut key = face;
            key.sort_unstable();
            match face_slots.get(&key) {
                Some(&slot) => faces[slot].1 += 1,
                None => {
                    face_slots.insert(key, faces.len());
                    faces.push((
                        orient_outward(&vertices, face, opposite, cell),
                        1,
                    ));
                }
            }
        }
    }

    let exterior_faces = faces
        .into_iter()
        .filter(|(_, refs)| *refs == 1)
        .map(|(face, _)| face)
        .collect();

    TetMesh {
        vertices,
        tets,
        segments,
        surface_groups: BTreeMap::new(),
        exterior_faces,
    }
}

/// Order the vertices of a face so that its normal points away
/// from the opposite vertex of the tetrahedron it came from.
fn orient_outward(
    vertices: &[Vec3],
    mut face: [usize; 3],
    opposite: usize,
    cell: usize,
) -> ExteriorFace {
    let [a, b, c] = face.map(|i| vertices[i]);
    let normal = (b - a).cross(&(c - a));
    if normal.dot(&(vertices[opposite] - a)) > 0. {
        face.swap(1, 2);
    }
    ExteriorFace {
        vertices: face,
        cell,
    }
}

/// Split the cubes of a structured grid into six tetrahedra each.
///
/// Every cube is cut along its main diagonal (Kuhn triangulation),
/// which gives a conforming mesh as long as all cubes use the same pattern.
/// Tetrahedra are returned with positive orientation.
fn kuhn_tets(
    vertices: &[Vec3],
    cube_corner: impl Fn(usize, usize, usize) -> usize,
    i: usize,
    j: usize,
    k: usize,
) -> Vec<[usize; 4]> {
    let offsets = [[1, 0, 0], [0, 1, 0], [0, 0, 1]];
    (0..3)
        .permutations(3)
        .map(|perm| {
            let mut pos = [i, j, k];
            let mut tet = [cube_corner(pos[0], pos[1], pos[2]); 4];
            for (slot, axis) in perm.into_iter().enumerate() {
                for d in 0..3 {
                    pos[d] += offsets[axis][d];
                }
                tet[slot + 1] = cube_corner(pos[0], pos[1], pos[2]);
            }
            if signed_volume(&tet.map(|v| vertices[v])) < 0. {
                tet.swap(2, 3);
            }
            tet
        })
        .collect()
}

/// A unit cube split into `n^3` subcubes of six tetrahedra each,
/// with no surface groups.
pub fn unit_cube_mesh(n: usize) -> TetMesh {
    let idx = |i: usize, j: usize, k: usize| (k * (n + 1) + j) * (n + 1) + i;
    let h = 1. / n as f64;

    let vertices: Vec<Vec3> = iproduct!(0..=n, 0..=n, 0..=n)
        .map(|(k, j, i)| Vec3::new(i as f64 * h, j as f64 * h, k as f64 * h))
        .collect();

    let tets = iproduct!(0..n, 0..n, 0..n)
        .flat_map(|(k, j, i)| kuhn_tets(&vertices, idx, i, j, k))
        .collect();

    TetMesh::new(vertices, tets)
}

/// A box-shaped stand-in for a left ventricle:
/// a `nx * ny * nz` block of unit cubes with a cavity
/// carved out of its interior and open at the top (`z = nz`).
/// The wall is one cube thick.
///
/// Surface groups `Epi` (outside), `Endo` (cavity walls)
/// and `Base` (the ring at the top) are generated,
/// and the bottom layer of cubes gets segment id 1, the rest segment id 2.
/// The cavity volume is `(nx - 2) * (ny - 2) * (nz - 1)`.
pub fn cup_mesh(nx: usize, ny: usize, nz: usize) -> TetMesh {
    assert!(nx >= 3 && ny >= 3 && nz >= 2, "cup needs room for a cavity");
    let grid_idx = |i: usize, j: usize, k: usize| (k * (ny + 1) + j) * (nx + 1) + i;
    let grid_vertices: Vec<Vec3> = iproduct!(0..=nz, 0..=ny, 0..=nx)
        .map(|(k, j, i)| Vec3::new(i as f64, j as f64, k as f64))
        .collect();

    let in_cavity = |i: usize, j: usize, k: usize| {
        i >= 1 && i < nx - 1 && j >= 1 && j < ny - 1 && k >= 1
    };

    let mut grid_tets = Vec::new();
    let mut segments = Vec::new();
    for (k, j, i) in iproduct!(0..nz, 0..ny, 0..nx) {
        if in_cavity(i, j, k) {
            continue;
        }
        let cube = kuhn_tets(&grid_vertices, grid_idx, i, j, k);
        segments.extend(std::iter::repeat(if k == 0 { 1 } else { 2 }).take(cube.len()));
        grid_tets.extend(cube);
    }

    // drop grid vertices that ended up inside the cavity
    let mut remap: Vec<Option<usize>> = vec![None; grid_vertices.len()];
    let mut vertices = Vec::new();
    let tets: Vec<[usize; 4]> = grid_tets
        .iter()
        .map(|tet| {
            tet.map(|v| {
                *remap[v].get_or_insert_with(|| {
                    vertices.push(grid_vertices[v]);
                    vertices.len() - 1
                })
            })
        })
        .collect();

    let mut mesh = TetMesh::new(vertices, tets).with_segments(segments);

    // classify exterior faces by position
    let (top, xmax, ymax) = (nz as f64, nx as f64, ny as f64);
    let mut groups: BTreeMap<&str, Vec<[usize; 3]>> = BTreeMap::new();
    for face in 0..mesh.exterior_faces().len() {
        let verts = mesh.face_vertices(face);
        let on_top = verts.iter().all(|v| v.z == top);
        let centroid = verts.iter().sum::<Vec3>() / 3.;
        let inside = centroid.x > 0.
            && centroid.x < xmax
            && centroid.y > 0.
            && centroid.y < ymax
            && centroid.z > 0.;
        let group = if on_top {
            "Base"
        } else if inside {
            "Endo"
        } else {
            "Epi"
        };
        groups
            .entry(group)
            .or_default()
            .push(mesh.exterior_faces()[face].vertices);
    }
    for (name, tris) in groups {
        mesh.insert_surface_group(name, tris);
    }

    mesh
}
