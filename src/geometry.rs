//! A tagged heart geometry: the mesh, its boundary markers
//! and (once assigned) its microstructure.

use std::{collections::BTreeMap, io::Write, path::Path};

use serde::{Deserialize, Serialize};

use crate::{mesh::FaceSubset, Microstructure, TetMesh, Vec3};

/// Error in building, saving or loading a heart geometry.
#[derive(thiserror::Error, Debug)]
pub enum GeometryError {
    /// A named surface group required for tagging is absent or empty.
    #[error("Required surface region `{0}` is missing from the mesh")]
    MissingRegion(String),
    /// A tetrahedron has zero volume.
    #[error("Cell {0} is degenerate (zero volume)")]
    DegenerateCell(usize),
    /// An operation needs a microstructure, but none has been assigned.
    #[error("The geometry has no microstructure assigned")]
    MissingMicrostructure,
    /// A per-entity array doesn't match the size of the mesh.
    #[error("Expected {expected} values for {what}, found {found}")]
    SizeMismatch {
        /// What the values are for.
        what: &'static str,
        /// Number of entities in the mesh.
        expected: usize,
        /// Number of values given.
        found: usize,
    },
    /// An element refers to a vertex the mesh doesn't have.
    #[error("{what} refers to vertex {index}, but the mesh has {count} vertices")]
    InvalidVertex {
        /// The referring element.
        what: String,
        /// The vertex index.
        index: usize,
        /// Number of vertices in the mesh.
        count: usize,
    },
    /// Reading or writing a geometry file failed.
    #[error("Geometry file I/O failed")]
    Io(#[from] std::io::Error),
    /// A geometry file couldn't be (de)serialized.
    #[error("Geometry file is malformed")]
    Json(#[from] serde_json::Error),
}

/// The anatomical boundary regions of the left ventricle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    /// The basal plane, where the ventricle is cut off.
    Base,
    /// The endocardium, the inner surface facing the cavity.
    Endo,
    /// The epicardium, the outer surface.
    Epi,
}

impl Region {
    /// All regions in tagging priority order.
    pub const PRIORITY: [Region; 3] = [Region::Epi, Region::Endo, Region::Base];

    /// The integer marker stored on faces of this region.
    pub const fn marker(self) -> u32 {
        match self {
            Region::Base => 5,
            Region::Endo => 6,
            Region::Epi => 7,
        }
    }

    /// Key of the region in the marker table.
    pub const fn name(self) -> &'static str {
        match self {
            Region::Base => "BASE",
            Region::Endo => "ENDO",
            Region::Epi => "EPI",
        }
    }

    /// Name of the surface group holding this region in the input mesh.
    pub const fn group_name(self) -> &'static str {
        match self {
            Region::Base => "Base",
            Region::Endo => "Endo",
            Region::Epi => "Epi",
        }
    }
}

/// Marker 0 means a face belongs to no region.
pub const UNMARKED: u32 = 0;

/// Entry in the marker table of a geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMarker {
    /// The integer marker stored on the region's entities.
    pub marker: u32,
    /// Topological dimension of the marked entities (2 for faces).
    pub dim: u32,
}

/// A heart mesh with integer markers on its exterior faces.
///
/// Created by [`crate::tagging::tag`]; the microstructure is attached afterwards
/// with [`with_microstructure`][Self::with_microstructure].
#[derive(Clone, Debug)]
pub struct HeartGeometry {
    /// The underlying tetrahedral mesh.
    pub mesh: TetMesh,
    face_markers: Vec<u32>,
    markers: BTreeMap<String, RegionMarker>,
    microstructure: Option<Microstructure>,
}

impl HeartGeometry {
    /// Assemble a geometry from a mesh and one marker per exterior face.
    ///
    /// The marker table lists the three regions of [`Region`].
    pub fn new(mesh: TetMesh, face_markers: Vec<u32>) -> Result<Self, GeometryError> {
        if face_markers.len() != mesh.exterior_faces().len() {
            return Err(GeometryError::SizeMismatch {
                what: "exterior face markers",
                expected: mesh.exterior_faces().len(),
                found: face_markers.len(),
            });
        }
        let markers = Region::PRIORITY
            .iter()
            .map(|r| {
                (
                    r.name().to_string(),
                    RegionMarker {
                        marker: r.marker(),
                        dim: 2,
                    },
                )
            })
            .collect();
        Ok(Self {
            mesh,
            face_markers,
            markers,
            microstructure: None,
        })
    }

    /// Attach a microstructure, replacing any previous one.
    pub fn with_microstructure(mut self, microstructure: Microstructure) -> Self {
        self.microstructure = Some(microstructure);
        self
    }

    /// The microstructure, if one has been assigned.
    #[inline]
    pub fn microstructure(&self) -> Option<&Microstructure> {
        self.microstructure.as_ref()
    }

    /// The marker of every exterior face, in the order of
    /// [`TetMesh::exterior_faces`].
    #[inline]
    pub fn face_markers(&self) -> &[u32] {
        &self.face_markers
    }

    /// The region name → (marker, dimension) table.
    #[inline]
    pub fn markers(&self) -> &BTreeMap<String, RegionMarker> {
        &self.markers
    }

    /// Look up the marker of a region in the marker table.
    pub fn marker(&self, region: Region) -> u32 {
        self.markers
            .get(region.name())
            .map(|m| m.marker)
            .unwrap_or_else(|| region.marker())
    }

    /// The exterior faces carrying a given marker.
    pub fn faces_with_marker(&self, marker: u32) -> FaceSubset {
        FaceSubset::from_predicate(&self.mesh, |idx, _| self.face_markers[idx] == marker)
    }

    /// The exterior faces of a region.
    #[inline]
    pub fn region_faces(&self, region: Region) -> FaceSubset {
        self.faces_with_marker(self.marker(region))
    }

    /// Mean position of the base vertices,
    /// used as the origin of the cavity volume integral.
    pub fn base_center(&self) -> Vec3 {
        let verts = self.region_faces(Region::Base).vertices(&self.mesh);
        let count = verts.count_ones(..);
        if count == 0 {
            return Vec3::zeros();
        }
        verts.ones().map(|v| self.mesh.vertices()[v]).sum::<Vec3>() / count as f64
    }

    /// Write the geometry to a JSON file.
    ///
    /// The file is written to a temporary path next to the target
    /// and moved into place once complete,
    /// so an interrupted save never leaves a truncated file behind.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GeometryError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, &GeometryFile::from(self))?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| GeometryError::Io(e.error))?;
        tracing::debug!(path = %path.display(), "saved geometry");
        Ok(())
    }

    /// Read a geometry written by [`save`][Self::save].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeometryError> {
        let file = std::fs::File::open(path)?;
        let contents: GeometryFile = serde_json::from_reader(std::io::BufReader::new(file))?;
        contents.try_into()
    }
}

/// On-disk representation of a [`HeartGeometry`].
///
/// Exterior faces aren't stored; they're derived again on load,
/// which gives the same order for the same tetrahedra.
#[derive(Serialize, Deserialize)]
struct GeometryFile {
    vertices: Vec<[f64; 3]>,
    cells: Vec<[usize; 4]>,
    segments: Vec<u32>,
    surface_groups: BTreeMap<String, Vec<[usize; 3]>>,
    face_markers: Vec<u32>,
    markers: BTreeMap<String, RegionMarker>,
    microstructure: Option<Microstructure>,
}

impl From<&HeartGeometry> for GeometryFile {
    fn from(geo: &HeartGeometry) -> Self {
        Self {
            vertices: geo.mesh.vertices().iter().map(|v| [v.x, v.y, v.z]).collect(),
            cells: geo.mesh.cells().to_vec(),
            segments: geo.mesh.segments().to_vec(),
            surface_groups: geo.mesh.surface_group_map().clone(),
            face_markers: geo.face_markers.clone(),
            markers: geo.markers.clone(),
            microstructure: geo.microstructure.clone(),
        }
    }
}

impl TryFrom<GeometryFile> for HeartGeometry {
    type Error = GeometryError;

    fn try_from(file: GeometryFile) -> Result<Self, Self::Error> {
        if file.segments.len() != file.cells.len() {
            return Err(GeometryError::SizeMismatch {
                what: "cell segments",
                expected: file.cells.len(),
                found: file.segments.len(),
            });
        }
        let count = file.vertices.len();
        check_vertex_indices(&file.cells, count, "cell")?;
        for (name, tris) in &file.surface_groups {
            check_vertex_indices(tris, count, &format!("surface group `{name}` triangle"))?;
        }
        let vertices = file.vertices.into_iter().map(Vec3::from).collect();
        let mesh = TetMesh::from_parts(vertices, file.cells, file.segments, file.surface_groups);
        let mut geo = HeartGeometry::new(mesh, file.face_markers)?;
        geo.markers = file.markers;
        if let Some(micro) = file.microstructure {
            micro.check_size(&geo.mesh)?;
            geo.microstructure = Some(micro);
        }
        Ok(geo)
    }
}

/// Check that every element refers to one of `count` vertices.
pub(crate) fn check_vertex_indices<const N: usize>(
    elements: &[[usize; N]],
    count: usize,
    what: &str,
) -> Result<(), GeometryError> {
    for (el, indices) in elements.iter().enumerate() {
        if let Some(&index) = indices.iter().find(|&&i| i >= count) {
            return Err(GeometryError::InvalidVertex {
                what: format!("{what} {el}"),
                index,
                count,
            });
        }
    }
    Ok(())
}
