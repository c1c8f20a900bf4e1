//! Myofiber, sheet and sheet-normal orientation fields.
//!
//! The orientation algorithm itself sits behind [`FiberGenerator`];
//! this module decides where the fields live ([`FiberSpace`]),
//! translates region markers into the roles a generator needs
//! and validates what comes back.
//! [`RuleBasedFibers`] is a small generator good enough for
//! idealised geometries and tests.

use serde::{Deserialize, Serialize};

use crate::{geometry::GeometryError, HeartGeometry, Region, TetMesh, Vec3};

/// Fiber and sheet angles in degrees at the endo- and epicardium
/// of the left ventricle.
///
/// Angles in between are interpolated linearly
/// through the thickness of the wall.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberAngles {
    /// Fiber angle on the LV endocardium.
    pub alpha_endo_lv: f64,
    /// Fiber angle on the LV epicardium.
    pub alpha_epi_lv: f64,
    /// Sheet angle on the LV endocardium.
    pub beta_endo_lv: f64,
    /// Sheet angle on the LV epicardium.
    pub beta_epi_lv: f64,
}

impl Default for FiberAngles {
    fn default() -> Self {
        Self {
            alpha_endo_lv: 60.,
            alpha_epi_lv: -60.,
            beta_endo_lv: -15.,
            beta_epi_lv: 15.,
        }
    }
}

impl FiberAngles {
    /// Fiber and sheet angle in radians at transmural position `t`
    /// (0 on the endocardium, 1 on the epicardium).
    pub fn at(&self, t: f64) -> (f64, f64) {
        let lerp = |endo: f64, epi: f64| (endo * (1. - t) + epi * t).to_radians();
        (
            lerp(self.alpha_endo_lv, self.alpha_epi_lv),
            lerp(self.beta_endo_lv, self.beta_epi_lv),
        )
    }
}

/// Where the orientation vectors of a microstructure are stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiberSpace {
    /// One basis per tetrahedron, evaluated at its barycenter.
    #[default]
    Cell,
    /// One basis per mesh vertex.
    Vertex,
}

/// Local material directions at one point.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FiberBasis {
    /// Fiber direction.
    pub f: Vec3,
    /// Sheet direction.
    pub s: Vec3,
    /// Sheet-normal direction.
    pub n: Vec3,
}

impl FiberBasis {
    /// Whether the three vectors are unit length and mutually orthogonal
    /// up to the given tolerance.
    pub fn is_orthonormal(&self, tol: f64) -> bool {
        let unit = |v: &Vec3| (v.norm() - 1.).abs() <= tol;
        unit(&self.f)
            && unit(&self.s)
            && unit(&self.n)
            && self.f.dot(&self.s).abs() <= tol
            && self.f.dot(&self.n).abs() <= tol
            && self.s.dot(&self.n).abs() <= tol
    }

    /// Build an orthonormal basis from approximate fiber and sheet directions
    /// with Gram-Schmidt.
    ///
    /// Vectors that vanish (e.g. averages of opposing directions)
    /// are replaced with an arbitrary valid direction.
    pub fn orthonormalize(f: Vec3, s: Vec3) -> Self {
        let f = f.try_normalize(1e-12).unwrap_or_else(Vec3::x);
        let s = (s - s.dot(&f) * f)
            .try_normalize(1e-12)
            .unwrap_or_else(|| any_perpendicular(&f));
        Self { f, s, n: f.cross(&s) }
    }
}

/// The markers a fiber generator uses to find the surfaces of the ventricle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FiberMarkers {
    /// Marker of the basal plane.
    pub base: u32,
    /// Marker of the left-ventricular endocardium.
    pub lv: u32,
    /// Marker of the epicardium.
    pub epi: u32,
}

impl FiberMarkers {
    /// Look the markers up from the region table of a geometry.
    pub fn from_geometry(geometry: &HeartGeometry) -> Self {
        Self {
            base: geometry.marker(Region::Base),
            lv: geometry.marker(Region::Endo),
            epi: geometry.marker(Region::Epi),
        }
    }
}

/// An algorithm computing fiber orientations on a tagged geometry.
pub trait FiberGenerator {
    /// Compute one basis per point in `points`.
    fn generate(
        &self,
        geometry: &HeartGeometry,
        markers: FiberMarkers,
        angles: &FiberAngles,
        points: &[Vec3],
    ) -> Result<Vec<FiberBasis>, GeometryError>;
}

/// Orientation fields on a mesh.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Microstructure {
    space: FiberSpace,
    bases: Vec<FiberBasis>,
}

impl Microstructure {
    /// Wrap a list of bases living in the given space.
    pub fn new(space: FiberSpace, bases: Vec<FiberBasis>) -> Self {
        Self { space, bases }
    }

    /// The space the bases live in.
    #[inline]
    pub fn space(&self) -> FiberSpace {
        self.space
    }

    /// One basis per cell or vertex, depending on [`space`][Self::space].
    #[inline]
    pub fn bases(&self) -> &[FiberBasis] {
        &self.bases
    }

    /// Number of entities of `mesh` the bases should correspond to.
    pub fn expected_len(space: FiberSpace, mesh: &TetMesh) -> usize {
        match space {
            FiberSpace::Cell => mesh.cell_count(),
            FiberSpace::Vertex => mesh.vertex_count(),
        }
    }

    /// Check that there is one basis per entity of the mesh.
    pub fn check_size(&self, mesh: &TetMesh) -> Result<(), GeometryError> {
        let expected = Self::expected_len(self.space, mesh);
        if self.bases.len() != expected {
            return Err(GeometryError::SizeMismatch {
                what: "fiber bases",
                expected,
                found: self.bases.len(),
            });
        }
        Ok(())
    }

    /// One basis per cell of `mesh`.
    ///
    /// Vertex fields are averaged over the vertices of each cell
    /// and orthonormalized again.
    pub fn cell_bases(&self, mesh: &TetMesh) -> Vec<FiberBasis> {
        match self.space {
            FiberSpace::Cell => self.bases.clone(),
            FiberSpace::Vertex => mesh
                .cells()
                .iter()
                .map(|cell| {
                    let f: Vec3 = cell.iter().map(|&v| self.bases[v].f).sum();
                    let s: Vec3 = cell.iter().map(|&v| self.bases[v].s).sum();
                    FiberBasis::orthonormalize(f, s)
                })
                .collect(),
        }
    }
}

/// Compute the microstructure of a tagged geometry.
///
/// The result is validated for size and orthonormality
/// and can be attached with [`HeartGeometry::with_microstructure`].
pub fn assign(
    geometry: &HeartGeometry,
    angles: &FiberAngles,
    space: FiberSpace,
    generator: &impl FiberGenerator,
) -> Result<Microstructure, GeometryError> {
    let points = match space {
        FiberSpace::Cell => geometry.mesh.barycenters(),
        FiberSpace::Vertex => geometry.mesh.vertices().to_vec(),
    };
    let markers = FiberMarkers::from_geometry(geometry);
    let bases = generator.generate(geometry, markers, angles, &points)?;

    let micro = Microstructure::new(space, bases);
    micro.check_size(&geometry.mesh)?;
    if let Some(idx) = micro.bases.iter().position(|b| !b.is_orthonormal(1e-8)) {
        tracing::warn!(point = idx, "fiber generator returned a non-orthonormal basis");
    }
    tracing::debug!(?space, points = points.len(), ?angles, "assigned microstructure");
    Ok(micro)
}

/// Fiber generator based on distances to the endo- and epicardium.
///
/// At every point the transmural coordinate `t = d_endo / (d_endo + d_epi)`
/// and the transmural direction (nearest endocardial vertex
/// to nearest epicardial vertex) are computed.
/// The longitudinal direction is the outward normal of the base,
/// orthogonalized against the transmural one,
/// and the circumferential direction is longitudinal × transmural.
/// The fiber is rotated from the circumferential direction
/// towards the longitudinal one by the fiber angle,
/// and the sheet from the transmural direction about the fiber
/// by the sheet angle.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleBasedFibers;

impl FiberGenerator for RuleBasedFibers {
    fn generate(
        &self,
        geometry: &HeartGeometry,
        markers: FiberMarkers,
        angles: &FiberAngles,
        points: &[Vec3],
    ) -> Result<Vec<FiberBasis>, GeometryError> {
        let mesh = &geometry.mesh;
        let surface_points = |marker: u32, region: Region| {
            let verts: Vec<Vec3> = geometry
                .faces_with_marker(marker)
                .vertices(mesh)
                .ones()
                .map(|v| mesh.vertices()[v])
                .collect();
            if verts.is_empty() {
                Err(GeometryError::MissingRegion(region.name().to_string()))
            } else {
                Ok(verts)
            }
        };
        let endo = surface_points(markers.lv, Region::Endo)?;
        let epi = surface_points(markers.epi, Region::Epi)?;
        let base = surface_points(markers.base, Region::Base)?;

        let longitudinal = long_axis(geometry, markers.base, &base, &epi);
        let base_center = base.iter().sum::<Vec3>() / base.len() as f64;

        Ok(points
            .iter()
            .map(|&x| {
                let (p_endo, d_endo) = nearest(&endo, x);
                let (p_epi, d_epi) = nearest(&epi, x);
                let t = if d_endo + d_epi > 0. {
                    d_endo / (d_endo + d_epi)
                } else {
                    0.
                };

                let mut e_t = p_epi - p_endo;
                if e_t.norm() < 1e-12 {
                    // radial direction away from the long axis
                    let r = x - base_center;
                    e_t = r - r.dot(&longitudinal) * longitudinal;
                }
                let e_t = e_t
                    .try_normalize(1e-12)
                    .unwrap_or_else(|| any_perpendicular(&longitudinal));

                let e_l = (longitudinal - longitudinal.dot(&e_t) * e_t)
                    .try_normalize(1e-12)
                    .unwrap_or_else(|| any_perpendicular(&e_t));
                let e_c = e_l.cross(&e_t);

                let (alpha, beta) = angles.at(t);
                let f = alpha.cos() * e_c + alpha.sin() * e_l;
                let s = beta.cos() * e_t + beta.sin() * f.cross(&e_t);
                FiberBasis::orthonormalize(f, s)
            })
            .collect())
    }
}

/// Direction from the apex towards the base.
///
/// Uses the summed outward area vector of the base faces,
/// falling back to the direction from the epicardial vertex farthest
/// from the base to the base centroid if the base is not planar enough.
fn long_axis(geometry: &HeartGeometry, base_marker: u32, base: &[Vec3], epi: &[Vec3]) -> Vec3 {
    let mesh = &geometry.mesh;
    let normal: Vec3 = geometry
        .faces_with_marker(base_marker)
        .indices
        .ones()
        .map(|face| mesh.face_area_vector(face, mesh.vertices()))
        .sum();
    if let Some(n) = normal.try_normalize(1e-12) {
        return n;
    }

    let center = base.iter().sum::<Vec3>() / base.len() as f64;
    let apex = epi
        .iter()
        .copied()
        .max_by(|a, b| (a - center).norm().total_cmp(&(b - center).norm()))
        .unwrap_or(center);
    (center - apex)
        .try_normalize(1e-12)
        .unwrap_or_else(Vec3::z)
}

fn nearest(points: &[Vec3], x: Vec3) -> (Vec3, f64) {
    points
        .iter()
        .map(|&p| (p, (p - x).norm()))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((x, 0.))
}

fn any_perpendicular(v: &Vec3) -> Vec3 {
    let axis = if v.x.abs() <= v.y.abs() && v.x.abs() <= v.z.abs() {
        Vec3::x()
    } else if v.y.abs() <= v.z.abs() {
        Vec3::y()
    } else {
        Vec3::z()
    };
    v.cross(&axis).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mesh::cup_mesh, tagging};
    use approx::assert_relative_eq;

    fn cup() -> HeartGeometry {
        tagging::tag(cup_mesh(4, 4, 3), &Default::default()).unwrap()
    }

    /// Counts events at info level or above.
    struct InfoCounter(std::sync::Arc<std::sync::atomic::AtomicUsize>);

    impl tracing::Subscriber for InfoCounter {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }
        fn new_span(&self, _: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            tracing::span::Id::from_u64(1)
        }
        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}
        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}
        fn event(&self, event: &tracing::Event<'_>) {
            if *event.metadata().level() <= tracing::Level::INFO {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
        fn enter(&self, _: &tracing::span::Id) {}
        fn exit(&self, _: &tracing::span::Id) {}
    }

    /// Geometry preprocessing runs on every rank,
    /// so it only reports progress at debug level.
    #[test]
    fn preprocessing_is_quiet_at_info_level() {
        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let subscriber = InfoCounter(count.clone());
        tracing::subscriber::with_default(subscriber, || {
            let geo = cup();
            for space in [FiberSpace::Cell, FiberSpace::Vertex] {
                assign(&geo, &FiberAngles::default(), space, &RuleBasedFibers).unwrap();
            }
        });
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    fn vertex_at(mesh: &TetMesh, pos: Vec3) -> usize {
        mesh.vertices()
            .iter()
            .position(|v| (v - pos).norm() < 1e-12)
            .expect("no vertex at position")
    }

    #[test]
    fn default_angles() {
        let angles: FiberAngles = toml::from_str("alpha_endo_lv = 45.0").unwrap();
        assert_eq!(angles.alpha_endo_lv, 45.);
        assert_eq!(angles.alpha_epi_lv, -60.);
        assert_eq!(angles.beta_endo_lv, -15.);
        assert_eq!(angles.beta_epi_lv, 15.);
    }

    #[test]
    fn bases_are_orthonormal() {
        let geo = cup();
        for space in [FiberSpace::Cell, FiberSpace::Vertex] {
            let micro = assign(&geo, &FiberAngles::default(), space, &RuleBasedFibers).unwrap();
            micro.check_size(&geo.mesh).unwrap();
            for (i, b) in micro.bases().iter().enumerate() {
                assert!(b.is_orthonormal(1e-10), "basis {i} in {space:?}: {b:?}");
                // right-handed
                assert_relative_eq!(b.f.cross(&b.s).dot(&b.n), 1., epsilon = 1e-10);
            }
            let cells = micro.cell_bases(&geo.mesh);
            assert_eq!(cells.len(), geo.mesh.cell_count());
            assert!(cells.iter().all(|b| b.is_orthonormal(1e-10)));
        }
    }

    /// On a straight wall the fiber angle is measured from the
    /// circumferential direction towards the long axis.
    #[test]
    fn fiber_angle_varies_through_wall() {
        let geo = cup();
        let micro = assign(
            &geo,
            &FiberAngles::default(),
            FiberSpace::Vertex,
            &RuleBasedFibers,
        )
        .unwrap();

        let endo = vertex_at(&geo.mesh, Vec3::new(1., 2., 2.));
        let epi = vertex_at(&geo.mesh, Vec3::new(0., 2., 2.));
        let f_endo = micro.bases()[endo].f;
        let f_epi = micro.bases()[epi].f;
        assert_relative_eq!(f_endo.z, 60f64.to_radians().sin(), epsilon = 1e-12);
        assert_relative_eq!(f_epi.z, (-60f64).to_radians().sin(), epsilon = 1e-12);
        // the wall normal is x, so fibers stay in the wall
        assert!(f_endo.x.abs() < 1e-12);
        assert!(f_epi.x.abs() < 1e-12);
    }

    #[test]
    fn missing_region_is_reported() {
        let geo = cup();
        let markers = FiberMarkers {
            lv: 42,
            ..FiberMarkers::from_geometry(&geo)
        };
        let res = RuleBasedFibers.generate(
            &geo,
            markers,
            &FiberAngles::default(),
            &geo.mesh.barycenters(),
        );
        assert!(matches!(res, Err(GeometryError::MissingRegion(_))));
    }

    #[test]
    fn size_mismatch_is_detected() {
        let geo = cup();
        let micro = Microstructure::new(
            FiberSpace::Vertex,
            vec![FiberBasis::orthonormalize(Vec3::x(), Vec3::y()); 3],
        );
        assert!(matches!(
            micro.check_size(&geo.mesh),
            Err(GeometryError::SizeMismatch { expected: 98, found: 3, .. })
        ));
    }
}
