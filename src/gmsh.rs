//! Utilities for loading heart meshes generated with [`gmsh`](https://www.gmsh.info/).
//!
//! Only version 4.1 of the MSH format is supported,
//! as per the [`mshio`] library.

use std::collections::{BTreeMap, HashMap};

use crate::{TetMesh, Vec3};

/// Error in loading a mesh from a Gmsh .msh file.
#[derive(thiserror::Error, Debug)]
pub enum GmshError {
    /// Error parsing the .msh file.
    ///
    /// (Implementation note: parser error converted to string
    /// to avoid lifetime issues with the byte slices it contains)
    #[error("Parsing the .msh data failed: {0}")]
    ParseError(String),
    /// The given .msh file contains no nodes.
    #[error("Invalid .msh data: no nodes")]
    MissingNodes,
    /// The given .msh file contains no elements of the supported type.
    #[error("Invalid .msh data: no elements of the correct type")]
    MissingElements,
    /// The `$PhysicalNames` section couldn't be read.
    #[error("Invalid $PhysicalNames section: {0}")]
    InvalidPhysicalNames(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EntityId {
    dim: i32,
    tag: i32,
}

/// Load a tetrahedral heart mesh from a `.msh` file.
///
/// First-order tetrahedron elements (`Tet4`) become the cells of the mesh
/// and first-order triangle elements (`Tri3`) become named surface groups.
///
/// # Physical groups
///
/// Every triangle is added to the surface group of each physical group
/// its geometric entity belongs to.
/// Groups are named after the `$PhysicalNames` section if the file has one
/// (e.g. `Epi`, `Endo`, `Base`), otherwise after their integer tag.
/// A triangle belonging to no physical group is not stored.
///
/// The first physical tag of the volume entity a tetrahedron belongs to
/// becomes its segment id; tetrahedra in volumes without physical groups
/// get segment id 1.
///
/// ```
/// # use dynacomp::gmsh::{load_heart_mesh, GmshError};
/// # fn load() -> Result<(), Box<dyn std::error::Error>> {
/// let mesh = load_heart_mesh(include_bytes!("gmsh/single_tet.msh"))?;
/// assert!(mesh.surface_group("Endo").is_some());
/// # Ok(())
/// # }
/// # load().expect("Failed to load mesh");
/// ```
pub fn load_heart_mesh(bytes: &[u8]) -> Result<TetMesh, GmshError> {
    let msh = mshio::parse_msh_bytes(bytes).map_err(|e| GmshError::ParseError(format!("{}", e)))?;
    let nodes = msh.data.nodes.ok_or(GmshError::MissingNodes)?;
    let elements = msh.data.elements.ok_or(GmshError::MissingElements)?;

    let physical_tags = gather_physical_tags(msh.data.entities.as_ref());
    let names = parse_physical_names(bytes)?;

    let vertices: Vec<Vec3> = nodes
        .node_blocks
        .iter()
        .flat_map(|block| block.nodes.iter())
        .map(|node| Vec3::new(node.x, node.y, node.z))
        .collect();
    if vertices.is_empty() {
        return Err(GmshError::MissingNodes);
    }

    let mut tets: Vec<[usize; 4]> = Vec::new();
    let mut segments: Vec<u32> = Vec::new();
    let mut surface_groups: BTreeMap<String, Vec<[usize; 3]>> = BTreeMap::new();

    for block in &elements.element_blocks {
        let ent_id = EntityId {
            dim: block.entity_dim,
            tag: block.entity_tag,
        };
        let groups = physical_tags
            .get(&ent_id)
            .map(|tags| tags.as_slice())
            .unwrap_or(&[]);

        match block.element_type {
            mshio::ElementType::Tet4 => {
                let segment = groups
                    .first()
                    .and_then(|&tag| u32::try_from(tag).ok())
                    .unwrap_or(1);
                for el in &block.elements {
                    tets.push(node_indices(&el.nodes, vertices.len())?);
                    segments.push(segment);
                }
            }
            mshio::ElementType::Tri3 => {
                for &group in groups {
                    let name = names
                        .get(&EntityId { dim: 2, tag: group })
                        .cloned()
                        .unwrap_or_else(|| format!("{}", group));
                    let tris = surface_groups.entry(name).or_default();
                    for el in &block.elements {
                        tris.push(node_indices(&el.nodes, vertices.len())?);
                    }
                }
            }
            _ => {}
        }
    }

    if tets.is_empty() {
        return Err(GmshError::MissingElements);
    }

    Ok(TetMesh::from_parts(vertices, tets, segments, surface_groups))
}

/// Convert gmsh node tags to vertex indices,
/// checking that they refer to one of the `node_count` nodes.
fn node_indices<const N: usize>(tags: &[u64], node_count: usize) -> Result<[usize; N], GmshError> {
    let mut indices = [0; N];
    if tags.len() != N {
        return Err(GmshError::ParseError(format!(
            "element with {} nodes, expected {N}",
            tags.len()
        )));
    }
    for (idx, tag) in indices.iter_mut().zip(tags) {
        // gmsh tags start at 1, subtract 1 to get the index in the array.
        // (this assumes tags are sequential and in order!
        // empirically this seems to be true even in the presence of sparse ids,
        // as these only affect entities)
        *idx = usize::try_from(*tag)
            .ok()
            .and_then(|tag| tag.checked_sub(1))
            .filter(|&idx| idx < node_count)
            .ok_or_else(|| {
                GmshError::ParseError(format!("node tag {tag} out of range 1..={node_count}"))
            })?;
    }
    Ok(indices)
}

/// Collect the physical tags of every geometric entity in a .msh file
/// into a structure we can easily look them up from.
fn gather_physical_tags(
    entities: Option<&mshio::Entities<i32, f64>>,
) -> HashMap<EntityId, Vec<i32>> {
    let Some(entities) = entities else {
        return HashMap::new();
    };

    let mut tags: HashMap<EntityId, Vec<i32>> = HashMap::new();

    for point in &entities.points {
        tags.entry(EntityId {
            dim: 0,
            tag: point.tag,
        })
        .or_default()
        .extend(&point.physical_tags);
    }

    for curve in &entities.curves {
        tags.entry(EntityId {
            dim: 1,
            tag: curve.tag,
        })
        .or_default()
        .extend(&curve.physical_tags);
    }

    for surface in &entities.surfaces {
        tags.entry(EntityId {
            dim: 2,
            tag: surface.tag,
        })
        .or_default()
        .extend(&surface.physical_tags);
    }

    for volume in &entities.volumes {
        tags.entry(EntityId {
            dim: 3,
            tag: volume.tag,
        })
        .or_default()
        .extend(&volume.physical_tags);
    }

    tags
}

/// Read the `$PhysicalNames` section, which [`mshio`] skips.
///
/// The section is plain text in both ASCII and binary .msh files:
/// a count followed by one `dim tag "name"` line per group.
fn parse_physical_names(bytes: &[u8]) -> Result<HashMap<EntityId, String>, GmshError> {
    const START: &[u8] = b"$PhysicalNames";
    const END: &[u8] = b"$EndPhysicalNames";

    let Some(start) = find(bytes, START) else {
        return Ok(HashMap::new());
    };
    let body_start = start + START.len();
    let body_len = find(&bytes[body_start..], END)
        .ok_or_else(|| GmshError::InvalidPhysicalNames("unterminated section".into()))?;
    let body = std::str::from_utf8(&bytes[body_start..body_start + body_len])
        .map_err(|e| GmshError::InvalidPhysicalNames(e.to_string()))?;

    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());
    let count: usize = lines
        .next()
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| GmshError::InvalidPhysicalNames("missing group count".into()))?;

    let mut names = HashMap::with_capacity(count);
    for line in lines.take(count) {
        let invalid = || GmshError::InvalidPhysicalNames(format!("bad line `{line}`"));
        let mut fields = line.splitn(3, char::is_whitespace);
        let dim: i32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let tag: i32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(invalid)?;
        let name = fields.next().ok_or_else(invalid)?.trim().trim_matches('"');
        names.insert(EntityId { dim, tag }, name.to_string());
    }

    Ok(names)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_groups_are_loaded() {
        let mesh =
            load_heart_mesh(include_bytes!("gmsh/single_tet.msh")).expect("Failed to load mesh");

        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.cell_count(), 1);
        assert_eq!(mesh.exterior_faces().len(), 4);
        // the volume belongs to physical group 4
        assert_eq!(mesh.segments(), &[4]);

        let epi = mesh.surface_group("Epi").expect("Epi group missing");
        let endo = mesh.surface_group("Endo").expect("Endo group missing");
        let base = mesh.surface_group("Base").expect("Base group missing");
        assert_eq!(epi, &[[1, 2, 3]]);
        assert_eq!(endo, &[[0, 1, 2]]);
        assert_eq!(base, &[[0, 2, 3]]);

        // the endocardial triangle lies on z = 0
        for &v in &endo[0] {
            assert_eq!(
                mesh.vertices()[v].z,
                0.,
                "Endo contained a vertex off the z = 0 face"
            );
        }
    }

    #[test]
    fn physical_names_are_parsed() {
        let names = parse_physical_names(include_bytes!("gmsh/single_tet.msh"))
            .expect("Failed to parse names");
        assert_eq!(names.len(), 4);
        assert_eq!(
            names.get(&EntityId { dim: 3, tag: 4 }).map(String::as_str),
            Some("Myocardium")
        );
    }

    #[test]
    fn missing_physical_names_fall_back_to_tags() {
        let names = parse_physical_names(b"$MeshFormat\n4.1 0 8\n$EndMeshFormat\n")
            .expect("no section should not be an error");
        assert!(names.is_empty());
    }

    #[test]
    fn out_of_range_node_tags_are_errors() {
        let text = std::str::from_utf8(include_bytes!("gmsh/single_tet.msh")).unwrap();
        for bad in ["4 1 2 3 9", "4 0 2 3 4"] {
            let broken = text.replace("4 1 2 3 4\n$EndElements", &format!("{bad}\n$EndElements"));
            assert_ne!(broken, text);
            assert!(
                matches!(load_heart_mesh(broken.as_bytes()), Err(GmshError::ParseError(_))),
                "element `{bad}` was accepted"
            );
        }
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            load_heart_mesh(b"definitely not a mesh"),
            Err(GmshError::ParseError(_))
        ));
    }
}
