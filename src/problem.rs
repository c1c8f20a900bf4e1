//! The nonlinear boundary value problem of a loaded ventricle.
//!
//! [`MechanicsProblem`] is what the load path driver in [`crate::model`]
//! needs from a solver. [`FeProblem`] implements it with linear tetrahedra,
//! one integration point per cell and Newton iteration
//! on a sparse Cholesky factorization.

use std::rc::Rc;

use fixedbitset as fb;
use nalgebra as na;
use nalgebra_sparse as nas;
use serde::{Deserialize, Serialize};

use crate::{
    geometry::GeometryError,
    kinematics::{deformed_positions, reference_cells, ReferenceCell},
    material::Material,
    mesh::FaceSubset,
    microstructure::FiberBasis,
    HeartGeometry, HolzapfelOgden, Region, Vec3,
};

/// Failure of a nonlinear solve.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    /// The residual didn't reach the tolerance within the iteration limit.
    #[error("Newton solver did not converge in {iterations} iterations (residual {residual:e})")]
    NotConverged {
        /// Number of iterations performed.
        iterations: usize,
        /// Residual norm after the last iteration.
        residual: f64,
    },
    /// The tangent matrix couldn't be factorized.
    #[error("Tangent matrix is singular or indefinite")]
    Singular,
    /// The residual or the update contained NaN or infinite values,
    /// e.g. because a cell was inverted.
    #[error("Solver produced non-finite values")]
    NonFinite,
}

/// The loads applied to the ventricle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Load {
    /// Active fiber tension.
    pub activation: f64,
    /// Cavity pressure acting on the endocardium.
    pub pressure: f64,
}

/// Statistics of a successful solve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolveReport {
    /// Number of Newton iterations taken.
    pub iterations: usize,
    /// Final residual norm.
    pub residual: f64,
}

/// A mechanics problem the load path driver can solve repeatedly.
///
/// `solve` either converges and replaces the displacement,
/// or fails and leaves the displacement as it was.
pub trait MechanicsProblem {
    /// Solve for the equilibrium displacement under `load`,
    /// starting from the current displacement.
    fn solve(&mut self, load: Load) -> Result<SolveReport, SolveError>;
    /// The current displacement, one vector per mesh vertex.
    fn displacement(&self) -> &[Vec3];
    /// Overwrite the current displacement.
    ///
    /// Panics if the length doesn't match the number of vertices.
    fn set_displacement(&mut self, u: &[Vec3]);
    /// The constitutive law of the problem.
    fn material(&self) -> &dyn Material;
}

/// How the base of the ventricle is held in place.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseConstraint {
    /// The longitudinal (z) displacement of the base is fixed,
    /// and the endocardial ring where base and endocardium meet
    /// is fixed in every direction.
    #[default]
    EndoRing,
    /// Only the longitudinal (z) displacement of the base is fixed.
    Longitudinal,
    /// All displacement components of the base are fixed.
    Fixed,
}

impl BaseConstraint {
    fn components(self) -> [bool; 3] {
        match self {
            BaseConstraint::EndoRing | BaseConstraint::Longitudinal => [false, false, true],
            BaseConstraint::Fixed => [true; 3],
        }
    }
}

/// Spring stiffnesses and base constraint of a model.
///
/// With [`BaseConstraint::Longitudinal`] and no springs
/// the ventricle can still translate sideways and rotate about its axis,
/// which the solver reports as [`SolveError::Singular`] or non-convergence;
/// set a spring or use one of the other constraints.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryParams {
    /// Stiffness of the springs on the epicardium.
    pub pericardium_spring: f64,
    /// Stiffness of the springs on the base.
    pub base_spring: f64,
    /// Dirichlet constraint on the base.
    pub base_constraint: BaseConstraint,
}

/// Displacement components fixed to zero on a set of vertices.
#[derive(Clone, Debug)]
pub struct DirichletCondition {
    /// The constrained vertices.
    pub vertices: fb::FixedBitSet,
    /// Which of the x, y, z components are fixed.
    pub components: [bool; 3],
}

/// Cavity pressure acting on a set of faces.
#[derive(Clone, Debug)]
pub struct NeumannCondition {
    /// The loaded faces.
    pub faces: FaceSubset,
}

/// Linear springs pulling a set of faces back to their reference position.
#[derive(Clone, Debug)]
pub struct RobinCondition {
    /// The supported faces.
    pub faces: FaceSubset,
    /// Spring stiffness per unit reference area.
    pub stiffness: f64,
}

/// All boundary conditions of a problem.
#[derive(Clone, Debug, Default)]
pub struct BoundaryConditions {
    /// Fixed displacement components.
    pub dirichlet: Vec<DirichletCondition>,
    /// Pressure loads.
    pub neumann: Vec<NeumannCondition>,
    /// Elastic supports.
    pub robin: Vec<RobinCondition>,
}

impl BoundaryConditions {
    /// The standard ventricle setup: constrained base, pressure on the endocardium
    /// and springs on the epicardium and base if their stiffness is positive.
    pub fn from_params(geometry: &HeartGeometry, params: &BoundaryParams) -> Self {
        let mesh = &geometry.mesh;
        let base = geometry.region_faces(Region::Base).vertices(mesh);
        let mut dirichlet = vec![DirichletCondition {
            vertices: base.clone(),
            components: params.base_constraint.components(),
        }];
        if params.base_constraint == BaseConstraint::EndoRing {
            let endo = geometry.region_faces(Region::Endo).vertices(mesh);
            let mut ring = fb::FixedBitSet::with_capacity(mesh.vertex_count());
            for v in base.ones().filter(|v| endo.contains(*v)) {
                ring.insert(v);
            }
            if ring.count_ones(..) == 0 {
                tracing::warn!("base and endocardium share no vertices, endocardial ring is empty");
            }
            dirichlet.push(DirichletCondition {
                vertices: ring,
                components: [true; 3],
            });
        }

        let mut robin = Vec::new();
        for (region, stiffness) in [
            (Region::Epi, params.pericardium_spring),
            (Region::Base, params.base_spring),
        ] {
            if stiffness > 0. {
                robin.push(RobinCondition {
                    faces: geometry.region_faces(region),
                    stiffness,
                });
            }
        }
        Self {
            dirichlet,
            neumann: vec![NeumannCondition {
                faces: geometry.region_faces(Region::Endo),
            }],
            robin,
        }
    }
}

/// Parameters of the Newton iteration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Absolute tolerance on the largest residual component.
    pub abs_tol: f64,
    /// Tolerance relative to the residual at the start of the solve.
    pub rel_tol: f64,
    /// Iterations before giving up.
    pub max_iterations: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            abs_tol: 1e-8,
            rel_tol: 1e-8,
            max_iterations: 30,
        }
    }
}

/// Total Lagrangian finite element discretization of the ventricle
/// with linear tetrahedra.
///
/// The tangent stiffness of each element is computed by finite differences
/// of its internal forces and symmetrized,
/// and the pressure load is treated as a fixed force during each iteration,
/// so Newton converges linearly when the pressure is significant.
#[derive(Clone, Debug)]
pub struct FeProblem<M = HolzapfelOgden> {
    geometry: Rc<HeartGeometry>,
    material: M,
    bcs: BoundaryConditions,
    config: SolverConfig,
    cells: Vec<ReferenceCell>,
    bases: Vec<FiberBasis>,
    /// constrained degrees of freedom, indexed `3 * vertex + component`
    constrained: fb::FixedBitSet,
    u: Vec<Vec3>,
}

impl<M: Material> FeProblem<M> {
    /// Set up a problem on a geometry with a microstructure.
    pub fn new(
        geometry: Rc<HeartGeometry>,
        material: M,
        bcs: BoundaryConditions,
        config: SolverConfig,
    ) -> Result<Self, GeometryError> {
        let mesh = &geometry.mesh;
        let micro = geometry
            .microstructure()
            .ok_or(GeometryError::MissingMicrostructure)?;
        micro.check_size(mesh)?;
        let bases = micro.cell_bases(mesh);
        let cells = reference_cells(mesh)?;

        let mut constrained = fb::FixedBitSet::with_capacity(3 * mesh.vertex_count());
        for cond in &bcs.dirichlet {
            for v in cond.vertices.ones() {
                for (comp, _) in cond.components.iter().enumerate().filter(|(_, c)| **c) {
                    constrained.insert(3 * v + comp);
                }
            }
        }
        // vertices outside every cell have no stiffness
        let mut referenced = fb::FixedBitSet::with_capacity(mesh.vertex_count());
        for cell in mesh.cells() {
            for &v in cell {
                referenced.insert(v);
            }
        }
        for v in (0..mesh.vertex_count()).filter(|v| !referenced.contains(*v)) {
            constrained.insert_range(3 * v..3 * v + 3);
        }

        Ok(Self {
            u: vec![Vec3::zeros(); mesh.vertex_count()],
            geometry,
            material,
            bcs,
            config,
            cells,
            bases,
            constrained,
        })
    }

    /// The boundary conditions of the problem.
    #[inline]
    pub fn boundary_conditions(&self) -> &BoundaryConditions {
        &self.bcs
    }

    /// Number of constrained degrees of freedom.
    pub fn constrained_dof_count(&self) -> usize {
        self.constrained.count_ones(..)
    }

    /// Internal forces of one cell at the given vertex displacements.
    fn element_forces(&self, cell: usize, u: &[Vec3; 4], activation: f64) -> [Vec3; 4] {
        let rc = &self.cells[cell];
        let f = rc.deformation_gradient_local(u);
        let p = self.material.first_piola(&f, &self.bases[cell], activation);
        rc.grads.map(|g| rc.volume * (p * g))
    }

    /// Residual (internal minus external forces) with constrained entries zeroed.
    pub fn residual(&self, u: &[Vec3], load: Load) -> na::DVector<f64> {
        let mesh = &self.geometry.mesh;
        let mut r = na::DVector::zeros(3 * mesh.vertex_count());
        let mut add = |v: usize, force: Vec3| {
            for comp in 0..3 {
                r[3 * v + comp] += force[comp];
            }
        };

        for (cell, rc) in self.cells.iter().enumerate() {
            let forces = self.element_forces(cell, &rc.nodes.map(|n| u[n]), load.activation);
            for (&node, force) in rc.nodes.iter().zip(forces) {
                add(node, force);
            }
        }

        if load.pressure != 0. {
            let positions = deformed_positions(mesh, u);
            for cond in &self.bcs.neumann {
                for face in cond.faces.indices.ones() {
                    // face normals point out of the wall, into the cavity,
                    // and the pressure pushes the wall the other way
                    let share = load.pressure / 3. * mesh.face_area_vector(face, &positions);
                    for &v in &mesh.exterior_faces()[face].vertices {
                        add(v, share);
                    }
                }
            }
        }

        for cond in &self.bcs.robin {
            for face in cond.faces.indices.ones() {
                let k = cond.stiffness * mesh.face_area_vector(face, mesh.vertices()).norm() / 3.;
                for &v in &mesh.exterior_faces()[face].vertices {
                    add(v, k * u[v]);
                }
            }
        }

        for dof in self.constrained.ones() {
            r[dof] = 0.;
        }
        r
    }

    /// Tangent stiffness with constrained rows and columns replaced by identity.
    pub fn tangent(&self, u: &[Vec3], load: Load) -> nas::CscMatrix<f64> {
        let mesh = &self.geometry.mesh;
        let n = 3 * mesh.vertex_count();
        let mut coo = nas::CooMatrix::new(n, n);

        for (cell, rc) in self.cells.iter().enumerate() {
            let u_local = rc.nodes.map(|node| u[node]);
            let ke = self.element_tangent(cell, &u_local, load.activation);
            let dofs: Vec<usize> = rc
                .nodes
                .iter()
                .flat_map(|&node| (0..3).map(move |comp| 3 * node + comp))
                .collect();
            for (i, &row) in dofs.iter().enumerate() {
                if self.constrained.contains(row) {
                    continue;
                }
                for (j, &col) in dofs.iter().enumerate() {
                    if !self.constrained.contains(col) {
                        coo.push(row, col, ke[(i, j)]);
                    }
                }
            }
        }

        for cond in &self.bcs.robin {
            for face in cond.faces.indices.ones() {
                let k = cond.stiffness * mesh.face_area_vector(face, mesh.vertices()).norm() / 3.;
                for &v in &mesh.exterior_faces()[face].vertices {
                    for dof in 3 * v..3 * v + 3 {
                        if !self.constrained.contains(dof) {
                            coo.push(dof, dof, k);
                        }
                    }
                }
            }
        }

        for dof in self.constrained.ones() {
            coo.push(dof, dof, 1.);
        }

        nas::CscMatrix::from(&coo)
    }

    fn element_tangent(
        &self,
        cell: usize,
        u: &[Vec3; 4],
        activation: f64,
    ) -> na::SMatrix<f64, 12, 12> {
        let rc = &self.cells[cell];
        let h = 1e-7 * (6. * rc.volume).cbrt();
        let base = self.element_forces(cell, u, activation);

        let mut ke = na::SMatrix::<f64, 12, 12>::zeros();
        for col in 0..12 {
            let mut perturbed = *u;
            perturbed[col / 3][col % 3] += h;
            let forces = self.element_forces(cell, &perturbed, activation);
            for (a, (fp, f0)) in forces.iter().zip(&base).enumerate() {
                for comp in 0..3 {
                    ke[(3 * a + comp, col)] = (fp[comp] - f0[comp]) / h;
                }
            }
        }
        0.5 * (ke + ke.transpose())
    }
}

fn is_finite(v: &na::DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

impl<M: Material> MechanicsProblem for FeProblem<M> {
    fn solve(&mut self, load: Load) -> Result<SolveReport, SolveError> {
        // work on a copy so that a failed solve leaves the state untouched
        let mut u = self.u.clone();
        let mut r = self.residual(&u, load);
        if !is_finite(&r) {
            return Err(SolveError::NonFinite);
        }
        let tol = self.config.abs_tol + self.config.rel_tol * r.amax();

        let mut iterations = 0;
        while r.amax() > tol {
            if iterations == self.config.max_iterations {
                tracing::debug!(iterations, residual = r.amax(), "newton iteration failed");
                return Err(SolveError::NotConverged {
                    iterations,
                    residual: r.amax(),
                });
            }

            let k = self.tangent(&u, load);
            let chol = nas::factorization::CscCholesky::factor(&k)
                .map_err(|_| SolveError::Singular)?;
            let du = chol.solve(&na::DMatrix::from_column_slice(r.len(), 1, r.as_slice()));
            if du.iter().any(|x| !x.is_finite()) {
                return Err(SolveError::NonFinite);
            }

            // halve the step while it inverts cells
            let mut step = 1.;
            loop {
                let trial: Vec<Vec3> = u
                    .iter()
                    .enumerate()
                    .map(|(v, uv)| uv - step * Vec3::new(du[3 * v], du[3 * v + 1], du[3 * v + 2]))
                    .collect();
                let trial_r = self.residual(&trial, load);
                if is_finite(&trial_r) {
                    u = trial;
                    r = trial_r;
                    break;
                }
                step *= 0.5;
                if step < 1e-3 {
                    return Err(SolveError::NonFinite);
                }
            }
            iterations += 1;
            tracing::trace!(iterations, residual = r.amax(), "newton step");
        }

        self.u = u;
        Ok(SolveReport {
            iterations,
            residual: r.amax(),
        })
    }

    #[inline]
    fn displacement(&self) -> &[Vec3] {
        &self.u
    }

    fn set_displacement(&mut self, u: &[Vec3]) {
        assert_eq!(u.len(), self.u.len(), "one displacement per vertex required");
        self.u.copy_from_slice(u);
    }

    #[inline]
    fn material(&self) -> &dyn Material {
        &self.material
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kinematics::cavity_volume,
        mesh::cup_mesh,
        microstructure::{self, FiberAngles, FiberSpace, RuleBasedFibers},
        tagging,
    };

    fn cup() -> Rc<HeartGeometry> {
        let geo = tagging::tag(cup_mesh(4, 4, 3), &Default::default()).unwrap();
        let micro =
            microstructure::assign(&geo, &FiberAngles::default(), FiberSpace::Cell, &RuleBasedFibers)
                .unwrap();
        Rc::new(geo.with_microstructure(micro))
    }

    fn fixed_base() -> BoundaryParams {
        BoundaryParams {
            base_constraint: BaseConstraint::Fixed,
            ..Default::default()
        }
    }

    fn problem(geo: &Rc<HeartGeometry>, params: &BoundaryParams) -> FeProblem {
        FeProblem::new(
            geo.clone(),
            HolzapfelOgden::default(),
            BoundaryConditions::from_params(geo, params),
            SolverConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn zero_springs_add_no_robin_terms() {
        let geo = cup();
        let bcs = BoundaryConditions::from_params(&geo, &BoundaryParams::default());
        assert!(bcs.robin.is_empty());
        assert_eq!(bcs.dirichlet.len(), 2);
        assert_eq!(bcs.dirichlet[0].components, [false, false, true]);
        assert_eq!(bcs.dirichlet[1].components, [true; 3]);
        assert_eq!(bcs.neumann.len(), 1);

        let with_springs = BoundaryConditions::from_params(
            &geo,
            &BoundaryParams {
                pericardium_spring: 1.,
                base_spring: 2.,
                ..Default::default()
            },
        );
        assert_eq!(with_springs.robin.len(), 2);
        assert_eq!(with_springs.robin[0].faces, geo.region_faces(Region::Epi));
        assert_eq!(with_springs.robin[1].stiffness, 2.);
    }

    #[test]
    fn base_vertices_are_constrained() {
        let geo = cup();
        let p = problem(&geo, &fixed_base());
        let base_verts = geo.region_faces(Region::Base).vertices(&geo.mesh).count_ones(..);
        assert_eq!(p.constrained_dof_count(), 3 * base_verts);

        let longitudinal = BoundaryParams {
            base_constraint: BaseConstraint::Longitudinal,
            ..Default::default()
        };
        let p = problem(&geo, &longitudinal);
        assert_eq!(p.constrained_dof_count(), base_verts);

        // the cavity opening of the cup is a 2x2 square with 8 rim vertices,
        // which additionally get their in-plane components fixed
        let bcs = BoundaryConditions::from_params(&geo, &BoundaryParams::default());
        let ring = &bcs.dirichlet[1].vertices;
        assert_eq!(ring.count_ones(..), 8);
        for v in ring.ones() {
            let x = geo.mesh.vertices()[v];
            assert_eq!(x.z, 3.);
            assert!((1. ..=3.).contains(&x.x) && (1. ..=3.).contains(&x.y));
        }
        let p = problem(&geo, &BoundaryParams::default());
        assert_eq!(p.constrained_dof_count(), base_verts + 2 * 8);
    }

    #[test]
    fn unloaded_problem_needs_no_iterations() {
        let geo = cup();
        let mut p = problem(&geo, &fixed_base());
        let report = p.solve(Load::default()).unwrap();
        assert_eq!(report.iterations, 0);
        assert!(p.displacement().iter().all(|u| *u == Vec3::zeros()));
    }

    #[test]
    fn pressure_inflates_cavity() {
        let geo = cup();
        let mut p = problem(&geo, &fixed_base());
        let load = Load {
            activation: 0.,
            pressure: 0.2,
        };
        let report = p.solve(load).unwrap();
        assert!(report.iterations > 0);
        assert!(p.residual(p.displacement(), load).amax() <= report.residual + 1e-12);

        let c = geo.base_center();
        let positions = deformed_positions(&geo.mesh, p.displacement());
        assert!(cavity_volume(&geo, &positions, c) > 8.);
        // base stays put
        for v in geo.region_faces(Region::Base).vertices(&geo.mesh).ones() {
            assert_eq!(p.displacement()[v], Vec3::zeros());
        }
    }

    #[test]
    fn failed_solve_keeps_state() {
        let geo = cup();
        let mut p = FeProblem::new(
            geo.clone(),
            HolzapfelOgden::default(),
            BoundaryConditions::from_params(&geo, &fixed_base()),
            SolverConfig {
                max_iterations: 1,
                abs_tol: 1e-14,
                rel_tol: 0.,
            },
        )
        .unwrap();
        let res = p.solve(Load {
            activation: 0.,
            pressure: 0.5,
        });
        assert!(matches!(res, Err(SolveError::NotConverged { iterations: 1, .. })));
        assert!(p.displacement().iter().all(|u| *u == Vec3::zeros()));
    }

    #[test]
    fn tangent_is_symmetric() {
        let geo = cup();
        let p = problem(&geo, &fixed_base());
        let u: Vec<Vec3> = geo.mesh.vertices().iter().map(|x| 0.01 * x).collect();
        let k = na::DMatrix::from(&p.tangent(&u, Load::default()));
        assert!((&k - k.transpose()).amax() < 1e-9);
    }
}
