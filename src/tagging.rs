//! Mapping the named surface groups of a mesh onto its exterior faces.
//!
//! The surface triangles in the input file and the exterior faces
//! of the volume mesh are separate lists with no shared numbering,
//! so faces are matched by geometry: each triangle is reduced to a key
//! built from its vertex coordinates rounded to a tolerance,
//! sorted so that the key doesn't depend on vertex order or winding.
//!
//! Faces are checked against the groups in the order Epi, Endo, Base
//! and get the marker of the first group that contains their key.
//! Well-formed input has disjoint key sets, so the order only matters
//! when the input is ambiguous, in which case the result is unspecified.
//! Degenerate triangles (repeated or coincident vertices)
//! give keys that may collide with neighbouring faces;
//! the input is expected not to contain them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::{
    geometry::{check_vertex_indices, GeometryError, UNMARKED},
    HeartGeometry, Region, TetMesh, Vec3,
};

/// Parameters for [`tag`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggingConfig {
    /// Coordinates closer than this are treated as equal.
    pub tolerance: f64,
    /// Name of the epicardium surface group in the mesh.
    pub epi_group: String,
    /// Name of the endocardium surface group in the mesh.
    pub endo_group: String,
    /// Name of the base surface group in the mesh.
    pub base_group: String,
}

impl Default for TaggingConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            epi_group: Region::Epi.group_name().to_string(),
            endo_group: Region::Endo.group_name().to_string(),
            base_group: Region::Base.group_name().to_string(),
        }
    }
}

impl TaggingConfig {
    fn group_name(&self, region: Region) -> &str {
        match region {
            Region::Base => &self.base_group,
            Region::Endo => &self.endo_group,
            Region::Epi => &self.epi_group,
        }
    }
}

/// Tolerance-rounded, order-independent key of a triangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FaceKey([[i64; 3]; 3]);

impl FaceKey {
    /// Compute the key of a triangle from its vertex positions.
    pub fn new(coords: &[Vec3; 3], tolerance: f64) -> Self {
        let mut rounded: [[i64; 3]; 3] =
            coords.map(|c| [c.x, c.y, c.z].map(|x| (x / tolerance).round() as i64));
        rounded.sort_unstable();
        Self(rounded)
    }
}

/// Build the set of keys for a group of triangles.
pub fn build_face_keys(vertices: &[Vec3], triangles: &[[usize; 3]], tolerance: f64) -> HashSet<FaceKey> {
    triangles
        .iter()
        .map(|tri| FaceKey::new(&tri.map(|i| vertices[i]), tolerance))
        .collect()
}

/// Number of faces that got each marker in [`tag`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaggingReport {
    /// Exterior faces marked as epicardium.
    pub epi: usize,
    /// Exterior faces marked as endocardium.
    pub endo: usize,
    /// Exterior faces marked as base.
    pub base: usize,
    /// Exterior faces matching none of the groups.
    pub unmarked: usize,
}

/// Tag the exterior faces of a mesh with the region markers
/// of the surface groups they belong to.
///
/// Fails with [`GeometryError::MissingRegion`] if any of the three
/// surface groups is missing or empty.
pub fn tag(mesh: TetMesh, config: &TaggingConfig) -> Result<HeartGeometry, GeometryError> {
    let (geometry, report) = tag_with_report(mesh, config)?;
    tracing::debug!(
        epi = report.epi,
        endo = report.endo,
        base = report.base,
        unmarked = report.unmarked,
        "tagged exterior faces"
    );
    Ok(geometry)
}

/// Like [`tag`], also returning the number of faces per marker.
pub fn tag_with_report(
    mesh: TetMesh,
    config: &TaggingConfig,
) -> Result<(HeartGeometry, TaggingReport), GeometryError> {
    let mut key_sets: Vec<(u32, HashSet<FaceKey>)> = Vec::with_capacity(3);
    for region in Region::PRIORITY {
        let name = config.group_name(region);
        let triangles = mesh
            .surface_group(name)
            .filter(|tris| !tris.is_empty())
            .ok_or_else(|| GeometryError::MissingRegion(name.to_string()))?;
        check_vertex_indices(
            triangles,
            mesh.vertex_count(),
            &format!("surface group `{name}` triangle"),
        )?;
        key_sets.push((
            region.marker(),
            build_face_keys(mesh.vertices(), triangles, config.tolerance),
        ));
    }

    let mut report = TaggingReport::default();
    let face_markers: Vec<u32> = (0..mesh.exterior_faces().len())
        .map(|face| {
            let key = FaceKey::new(&mesh.face_vertices(face), config.tolerance);
            let marker = key_sets
                .iter()
                .find(|(_, keys)| keys.contains(&key))
                .map(|(marker, _)| *marker)
                .unwrap_or(UNMARKED);
            match marker {
                m if m == Region::Epi.marker() => report.epi += 1,
                m if m == Region::Endo.marker() => report.endo += 1,
                m if m == Region::Base.marker() => report.base += 1,
                _ => report.unmarked += 1,
            }
            marker
        })
        .collect();

    Ok((HeartGeometry::new(mesh, face_markers)?, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{cup_mesh, unit_cube_mesh};

    fn triangle() -> [Vec3; 3] {
        [
            Vec3::new(0.1, 0.2, 0.3),
            Vec3::new(1.5, -0.25, 2.0),
            Vec3::new(-3.0, 0.75, 0.125),
        ]
    }

    #[test]
    fn key_ignores_vertex_order() {
        let [a, b, c] = triangle();
        let key = FaceKey::new(&[a, b, c], 1e-6);
        for perm in [[a, c, b], [b, a, c], [b, c, a], [c, a, b], [c, b, a]] {
            assert_eq!(key, FaceKey::new(&perm, 1e-6));
        }
    }

    #[test]
    fn key_ignores_sub_tolerance_noise() {
        let [a, b, c] = triangle();
        let noise = Vec3::new(1e-9, -2e-9, 3e-9);
        assert_eq!(
            FaceKey::new(&[a, b, c], 1e-6),
            FaceKey::new(&[a + noise, b - noise, c + noise], 1e-6)
        );
    }

    #[test]
    fn key_detects_super_tolerance_changes() {
        let [a, b, c] = triangle();
        let shift = Vec3::new(0., 5e-6, 0.);
        assert_ne!(
            FaceKey::new(&[a, b, c], 1e-6),
            FaceKey::new(&[a, b + shift, c], 1e-6)
        );
    }

    /// A unit cube with its six sides split into three groups of two
    /// gets two sides' worth of faces per marker and nothing unmarked.
    #[test]
    fn unit_cube_sides() {
        let mut mesh = unit_cube_mesh(2);
        let mut sides: [Vec<[usize; 3]>; 6] = Default::default();
        for face in 0..mesh.exterior_faces().len() {
            let verts = mesh.face_vertices(face);
            let side = (0..3)
                .flat_map(|axis| [(axis, 0.), (axis, 1.)])
                .position(|(axis, val)| verts.iter().all(|v| v[axis] == val))
                .expect("exterior face not on a cube side");
            sides[side].push(mesh.exterior_faces()[face].vertices);
        }
        // x sides are Epi, y sides Endo, z sides Base
        for (side, tris) in sides.into_iter().enumerate() {
            let name = ["Epi", "Endo", "Base"][side / 2];
            // reversed winding to check the key ignores it
            let tris = tris.into_iter().map(|[a, b, c]| [c, b, a]).collect();
            mesh.insert_surface_group(name, tris);
        }

        let (geo, report) = tag_with_report(mesh, &TaggingConfig::default()).unwrap();
        // 2 sides * 4 squares * 2 triangles
        assert_eq!(report.epi, 16);
        assert_eq!(report.endo, 16);
        assert_eq!(report.base, 16);
        assert_eq!(report.unmarked, 0);
        assert_eq!(geo.region_faces(Region::Epi).count(), 16);
        for face in geo.region_faces(Region::Base).indices.ones() {
            let verts = geo.mesh.face_vertices(face);
            assert!(
                verts.iter().all(|v| v.z == 0.) || verts.iter().all(|v| v.z == 1.),
                "base face {verts:?} not on a z side"
            );
        }
    }

    #[test]
    fn faces_in_no_group_stay_unmarked() {
        let mut mesh = unit_cube_mesh(1);
        let faces: Vec<[usize; 3]> = mesh.exterior_faces().iter().map(|f| f.vertices).collect();
        mesh.insert_surface_group("Epi", faces[..2].to_vec());
        mesh.insert_surface_group("Endo", faces[2..4].to_vec());
        mesh.insert_surface_group("Base", faces[4..5].to_vec());

        let (geo, report) = tag_with_report(mesh, &TaggingConfig::default()).unwrap();
        assert_eq!(report.unmarked, faces.len() - 5);
        assert_eq!(&geo.face_markers()[..5], &[7, 7, 6, 6, 5]);
        assert!(geo.face_markers()[5..].iter().all(|&m| m == UNMARKED));
    }

    #[test]
    fn missing_group_is_a_configuration_error() {
        let mut mesh = cup_mesh(3, 3, 2);
        mesh = TetMesh::from_parts(
            mesh.vertices().to_vec(),
            mesh.cells().to_vec(),
            mesh.segments().to_vec(),
            mesh.surface_group_map()
                .iter()
                .filter(|(name, _)| name.as_str() != "Base")
                .map(|(name, tris)| (name.clone(), tris.clone()))
                .collect(),
        );
        match tag(mesh, &TaggingConfig::default()) {
            Err(GeometryError::MissingRegion(name)) => assert_eq!(name, "Base"),
            other => panic!("expected a missing region error, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_triangle_vertex_is_an_error() {
        let mut mesh = unit_cube_mesh(1);
        let faces: Vec<[usize; 3]> = mesh.exterior_faces().iter().map(|f| f.vertices).collect();
        let count = mesh.vertex_count();
        mesh.insert_surface_group("Epi", vec![faces[0], [0, 1, count + 90]]);
        mesh.insert_surface_group("Endo", faces[2..4].to_vec());
        mesh.insert_surface_group("Base", faces[4..5].to_vec());

        match tag_with_report(mesh, &TaggingConfig::default()) {
            Err(GeometryError::InvalidVertex { index, count: c, .. }) => {
                assert_eq!(index, count + 90);
                assert_eq!(c, count);
            }
            other => panic!("expected an invalid vertex error, got {other:?}"),
        }
    }

    #[test]
    fn cup_regions_are_tagged() {
        let (geo, report) = tag_with_report(cup_mesh(4, 4, 3), &TaggingConfig::default()).unwrap();
        assert_eq!(report.base, 24);
        assert_eq!(report.endo, 40);
        assert_eq!(report.epi, 128);
        assert_eq!(report.unmarked, 0);
        assert_eq!(geo.region_faces(Region::Endo).count(), 40);
    }
}
