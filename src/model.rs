//! The load path driver: a mechanics problem on a heart geometry
//! moved through (activation, pressure) states.

use std::{
    collections::BTreeMap,
    ops::{Deref, DerefMut},
    path::Path,
    rc::Rc,
};

use crate::{
    config::{ContinuationConfig, ModelConfig},
    kinematics::{cavity_volume, deformed_positions, green_lagrange, reference_cells, ReferenceCell},
    output::{write_json_atomic, OutputError, SegmentHistory, TimeSeriesWriter},
    problem::{BoundaryConditions, FeProblem, Load, MechanicsProblem, SolveError},
    refine::refine,
    Error, FiberBasis, HeartGeometry, Mat3, Vec3,
};

/// Rank and size of the process group a model runs in.
///
/// Every rank does the same computation;
/// informational logging only happens on rank 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Communicator {
    /// Index of this process.
    pub rank: usize,
    /// Number of processes.
    pub size: usize,
}

impl Default for Communicator {
    fn default() -> Self {
        Self { rank: 0, size: 1 }
    }
}

impl Communicator {
    /// Whether this is the root process.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    /// Read the rank and size set by an MPI launcher
    /// (Open MPI or a PMI-based one), defaulting to a single process.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().and_then(|v| v.parse().ok());
        let rank = read("OMPI_COMM_WORLD_RANK").or_else(|| read("PMI_RANK"));
        let size = read("OMPI_COMM_WORLD_SIZE").or_else(|| read("PMI_SIZE"));
        match (rank, size) {
            (Some(rank), Some(size)) if rank < size => Self { rank, size },
            _ => Self::default(),
        }
    }
}

/// The two load parameters continuation steps through.
#[derive(Clone, Copy, Debug)]
enum Quantity {
    Activation,
    Pressure,
}

impl Quantity {
    fn get(self, load: &Load) -> f64 {
        match self {
            Quantity::Activation => load.activation,
            Quantity::Pressure => load.pressure,
        }
    }

    fn set(self, load: &mut Load, value: f64) {
        match self {
            Quantity::Activation => load.activation = value,
            Quantity::Pressure => load.pressure = value,
        }
    }

    fn max_step(self, config: &ContinuationConfig) -> f64 {
        match self {
            Quantity::Activation => config.max_activation_step,
            Quantity::Pressure => config.max_pressure_step,
        }
    }
}

/// A left ventricle model driven through (activation, pressure) load states.
///
/// The model owns its [`MechanicsProblem`] and the current [`Load`].
/// Construction solves the unloaded state;
/// afterwards the load only changes through
/// [`compute_volume`][Self::compute_volume],
/// [`initial_loading`][Self::initial_loading]
/// and [`assign_state_variables`][Self::assign_state_variables].
///
/// Strains are measured relative to the reference configuration
/// frozen by [`initial_loading`][Self::initial_loading]
/// (the unloaded geometry until then).
pub struct HeartModel<P: MechanicsProblem = FeProblem> {
    geometry: Rc<HeartGeometry>,
    problem: P,
    load: Load,
    /// load the displacement is in equilibrium with
    converged: Load,
    comm: Communicator,
    continuation: ContinuationConfig,
    cells: Vec<ReferenceCell>,
    bases: Vec<FiberBasis>,
    /// origin of the cavity volume integral
    base_center: Vec3,
    /// inverse deformation gradient of the reference configuration per cell
    f0_inv: Vec<Mat3>,
    reference_frozen: bool,
    fiber_strain: SegmentHistory,
    myocardial_work: SegmentHistory,
    step: usize,
}

impl HeartModel<FeProblem> {
    /// Set up a model with the built-in finite element problem.
    ///
    /// The geometry must have a microstructure.
    /// If the configuration asks for refinement,
    /// the model works on a refined copy of the geometry.
    pub fn new(
        geometry: Rc<HeartGeometry>,
        config: &ModelConfig,
        comm: Communicator,
    ) -> Result<Self, Error> {
        config.validate()?;
        let geometry = match config.refinement {
            Some(levels) if levels > 0 => Rc::new(refine(&geometry, levels)?),
            _ => geometry,
        };
        let bcs = BoundaryConditions::from_params(&geometry, &config.bc);
        let problem = FeProblem::new(geometry.clone(), config.material, bcs, config.solver)?;
        Self::with_problem(geometry, problem, config.continuation, comm)
    }
}

impl<P: MechanicsProblem> HeartModel<P> {
    /// Set up a model around an existing problem on the same geometry.
    pub fn with_problem(
        geometry: Rc<HeartGeometry>,
        mut problem: P,
        continuation: ContinuationConfig,
        comm: Communicator,
    ) -> Result<Self, Error> {
        let micro = geometry
            .microstructure()
            .ok_or(crate::geometry::GeometryError::MissingMicrostructure)?;
        micro.check_size(&geometry.mesh)?;
        let bases = micro.cell_bases(&geometry.mesh);
        let cells = reference_cells(&geometry.mesh)?;

        continuation.validate()?;
        let load = Load::default();
        problem.solve(load)?;

        if comm.is_root() {
            tracing::info!(
                cells = geometry.mesh.cell_count(),
                vertices = geometry.mesh.vertex_count(),
                ranks = comm.size,
                "initialized heart model"
            );
        }

        Ok(Self {
            base_center: geometry.base_center(),
            f0_inv: vec![Mat3::identity(); cells.len()],
            geometry,
            problem,
            load,
            converged: load,
            comm,
            continuation,
            cells,
            bases,
            reference_frozen: false,
            fiber_strain: Vec::new(),
            myocardial_work: Vec::new(),
            step: 0,
        })
    }

    /// Move to the given activation and then the given pressure
    /// in increments no larger than the configured step sizes,
    /// and return the resulting cavity volume.
    ///
    /// Continuation starts from the last load the model converged at,
    /// which differs from [`load`][Self::load] after
    /// [`assign_state_variables`][Self::assign_state_variables].
    /// If a step fails, the error is returned
    /// and the model stays at the last load it converged at.
    pub fn compute_volume(&mut self, activation: f64, pressure: f64) -> Result<f64, SolveError> {
        if !self.is_converged() {
            tracing::debug!(
                assigned = ?self.load,
                converged = ?self.converged,
                "continuing from the last converged load"
            );
            self.load = self.converged;
        }
        self.continue_to(Quantity::Activation, activation)?;
        self.continue_to(Quantity::Pressure, pressure)?;
        let volume = self.volume();
        if self.comm.is_root() {
            tracing::info!(volume, activation, pressure, "computed volume");
        }
        Ok(volume)
    }

    fn continue_to(&mut self, quantity: Quantity, target: f64) -> Result<(), SolveError> {
        let start = quantity.get(&self.converged);
        let delta = target - start;
        if delta == 0. {
            return Ok(());
        }
        let steps = (delta.abs() / quantity.max_step(&self.continuation)).ceil().max(1.) as usize;

        for i in 1..=steps {
            let mut load = self.converged;
            let value = if i == steps {
                target
            } else {
                start + delta * i as f64 / steps as f64
            };
            quantity.set(&mut load, value);
            if let Err(err) = self.problem.solve(load) {
                tracing::warn!(
                    ?quantity,
                    step = i,
                    of = steps,
                    value,
                    converged = quantity.get(&self.converged),
                    "continuation step failed: {err}"
                );
                return Err(err);
            }
            self.load = load;
            self.converged = load;
            tracing::debug!(?quantity, step = i, of = steps, value, "continuation step");
        }
        Ok(())
    }

    /// Forward difference estimate of the derivative of cavity volume
    /// with respect to activation at the given load.
    ///
    /// The load is applied directly, without continuation,
    /// so it should be close to the current state.
    /// Activation is then increased by the fraction `delta_a_percent`.
    /// The displacement and load are restored afterwards,
    /// whether the estimate succeeds or not.
    /// The result isn't finite for zero activation.
    pub fn dv_da(
        &mut self,
        activation: f64,
        pressure: f64,
        delta_a_percent: f64,
    ) -> Result<f64, SolveError> {
        if self.comm.is_root() {
            tracing::info!(activation, pressure, "computing dV/da");
        }
        let dv_da = self.with_snapshot(|model| -> Result<f64, SolveError> {
            let load = Load {
                activation,
                pressure,
            };
            model.problem.solve(load)?;
            model.load = load;
            model.converged = load;
            let v_i = model.volume();

            let perturbed = Load {
                activation: activation * (1. + delta_a_percent),
                ..load
            };
            model.problem.solve(perturbed)?;
            model.load = perturbed;
            model.converged = perturbed;
            let v_f = model.volume();

            Ok((v_f - v_i) / (activation * delta_a_percent))
        })?;
        if self.comm.is_root() {
            tracing::info!(dv_da, "computed dV/da");
        }
        Ok(dv_da)
    }

    /// Run `f` on the model and restore the displacement and load afterwards,
    /// including when `f` returns early or panics.
    pub fn with_snapshot<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let mut guard = Restore::new(self);
        f(&mut guard)
    }

    /// Load to the given pressure without activation
    /// and make the resulting state the reference for strains.
    ///
    /// Returns the cavity volume at that pressure.
    /// Meant to be called once, for the end-diastolic pressure;
    /// calling it again redefines the reference.
    pub fn initial_loading(&mut self, pressure: f64) -> Result<f64, SolveError> {
        if self.reference_frozen {
            tracing::warn!("initial loading repeated, strain reference configuration redefined");
        }
        let volume = self.compute_volume(0., pressure)?;
        let u = self.problem.displacement();
        self.f0_inv = self
            .cells
            .iter()
            .map(|cell| cell.deformation_gradient(u).try_inverse())
            .collect::<Option<Vec<_>>>()
            .ok_or(SolveError::NonFinite)?;
        self.reference_frozen = true;
        Ok(volume)
    }

    /// Green-Lagrange strain relative to the reference configuration, per cell.
    pub fn strain(&self) -> Vec<Mat3> {
        let u = self.problem.displacement();
        self.cells
            .iter()
            .zip(&self.f0_inv)
            .map(|(cell, f0_inv)| green_lagrange(&(cell.deformation_gradient(u) * f0_inv)))
            .collect()
    }

    fn fiber_strain_per_cell(&self) -> Vec<f64> {
        self.strain()
            .iter()
            .zip(&self.bases)
            .map(|(e, b)| b.f.dot(&(e * b.f)))
            .collect()
    }

    /// Compute the fiber strain `E_ff = f0 . E f0` of every cell,
    /// append it to the fiber strain history grouped by segment,
    /// and return the grouped values.
    pub fn compute_fiber_strain(&mut self) -> BTreeMap<u32, Vec<f64>> {
        let grouped = self.group_by_segment(&self.fiber_strain_per_cell());
        self.fiber_strain.push(grouped.clone());
        grouped
    }

    /// Compute the myocardial work density `t_ff E_ff` of every cell,
    /// where `t_ff` is the Cauchy traction along the current fiber direction,
    /// append it to the work history grouped by segment,
    /// and return the grouped values.
    pub fn compute_myocardial_work(&mut self) -> BTreeMap<u32, Vec<f64>> {
        let u = self.problem.displacement();
        let material = self.problem.material();
        let work: Vec<f64> = self
            .cells
            .iter()
            .zip(&self.bases)
            .zip(self.fiber_strain_per_cell())
            .map(|((cell, basis), e_ff)| {
                let f = cell.deformation_gradient(u);
                let sigma = material.cauchy_stress(&f, basis, self.load.activation);
                let f_current = f * basis.f;
                let t_ff = (sigma * f_current).dot(&f_current);
                t_ff * e_ff
            })
            .collect();
        let grouped = self.group_by_segment(&work);
        self.myocardial_work.push(grouped.clone());
        grouped
    }

    fn group_by_segment(&self, values: &[f64]) -> BTreeMap<u32, Vec<f64>> {
        let mut grouped: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for (&segment, &value) in self.geometry.mesh.segments().iter().zip(values) {
            grouped.entry(segment).or_default().push(value);
        }
        grouped
    }

    /// Write the displacement, strain and activation of the current state
    /// as records `time_index + 1` under `outdir`,
    /// and advance the step counter.
    pub fn save(&mut self, time_index: usize, outdir: impl AsRef<Path>) -> Result<(), OutputError> {
        let writer = TimeSeriesWriter::new(outdir.as_ref())?;
        let index = time_index + 1;
        let time = index as f64;

        let u: Vec<[f64; 3]> = self
            .problem
            .displacement()
            .iter()
            .map(|u| [u.x, u.y, u.z])
            .collect();
        writer.write("u", index, time, &u)?;

        let e: Vec<[[f64; 3]; 3]> = self
            .strain()
            .iter()
            .map(|e| [0, 1, 2].map(|i| [e[(i, 0)], e[(i, 1)], e[(i, 2)]]))
            .collect();
        writer.write("E", index, time, &e)?;

        let activation = vec![self.load.activation; self.geometry.mesh.cell_count()];
        writer.write("activation", index, time, &activation)?;

        self.step += 1;
        if self.comm.is_root() {
            tracing::info!(time, dir = %writer.root().display(), "saved state");
        }
        Ok(())
    }

    /// Write the fiber strain and myocardial work histories
    /// to `fiber_strain.json` and `myocardial_work.json` under `outdir`.
    pub fn save_histories(&self, outdir: impl AsRef<Path>) -> Result<(), OutputError> {
        let outdir = outdir.as_ref();
        std::fs::create_dir_all(outdir)?;
        write_json_atomic(&outdir.join("fiber_strain.json"), &self.fiber_strain)?;
        write_json_atomic(&outdir.join("myocardial_work.json"), &self.myocardial_work)?;
        Ok(())
    }

    /// Set the load without solving.
    ///
    /// The displacement keeps solving the previous load,
    /// and [`is_converged`][Self::is_converged] is false
    /// until the next [`compute_volume`][Self::compute_volume].
    pub fn assign_state_variables(&mut self, activation: f64, pressure: f64) {
        self.load = Load {
            activation,
            pressure,
        };
    }

    /// Whether the displacement is in equilibrium with the current load.
    #[inline]
    pub fn is_converged(&self) -> bool {
        self.load == self.converged
    }

    /// Cavity volume at the current displacement.
    pub fn volume(&self) -> f64 {
        cavity_volume(&self.geometry, &self.deformed_vertices(), self.base_center)
    }

    /// Vertex positions at the current displacement.
    pub fn deformed_vertices(&self) -> Vec<Vec3> {
        deformed_positions(&self.geometry.mesh, self.problem.displacement())
    }

    /// The current cavity pressure.
    #[inline]
    pub fn pressure(&self) -> f64 {
        self.load.pressure
    }

    /// The current activation.
    #[inline]
    pub fn activation(&self) -> f64 {
        self.load.activation
    }

    /// The current load.
    #[inline]
    pub fn load(&self) -> Load {
        self.load
    }

    /// The current displacement.
    #[inline]
    pub fn displacement(&self) -> &[Vec3] {
        self.problem.displacement()
    }

    /// The geometry the model is solved on (refined if configured).
    #[inline]
    pub fn geometry(&self) -> &Rc<HeartGeometry> {
        &self.geometry
    }

    /// The underlying mechanics problem.
    #[inline]
    pub fn problem(&self) -> &P {
        &self.problem
    }

    /// The process group of the model.
    #[inline]
    pub fn communicator(&self) -> Communicator {
        self.comm
    }

    /// Every result of [`compute_fiber_strain`][Self::compute_fiber_strain] so far.
    #[inline]
    pub fn fiber_strain_history(&self) -> &SegmentHistory {
        &self.fiber_strain
    }

    /// Every result of [`compute_myocardial_work`][Self::compute_myocardial_work] so far.
    #[inline]
    pub fn myocardial_work_history(&self) -> &SegmentHistory {
        &self.myocardial_work
    }

    /// Number of states saved with [`save`][Self::save].
    #[inline]
    pub fn step(&self) -> usize {
        self.step
    }
}

/// Restores the displacement and load of a model when dropped.
struct Restore<'a, P: MechanicsProblem> {
    model: &'a mut HeartModel<P>,
    u: Vec<Vec3>,
    load: Load,
    converged: Load,
}

impl<'a, P: MechanicsProblem> Restore<'a, P> {
    fn new(model: &'a mut HeartModel<P>) -> Self {
        Self {
            u: model.problem.displacement().to_vec(),
            load: model.load,
            converged: model.converged,
            model,
        }
    }
}

impl<P: MechanicsProblem> Drop for Restore<'_, P> {
    fn drop(&mut self) {
        self.model.problem.set_displacement(&self.u);
        self.model.load = self.load;
        self.model.converged = self.converged;
    }
}

impl<P: MechanicsProblem> Deref for Restore<'_, P> {
    type Target = HeartModel<P>;

    fn deref(&self) -> &Self::Target {
        self.model
    }
}

impl<P: MechanicsProblem> DerefMut for Restore<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        material::Material,
        mesh::cup_mesh,
        microstructure::{self, FiberAngles, FiberSpace, RuleBasedFibers},
        tagging, HolzapfelOgden,
    };
    use approx::assert_relative_eq;

    /// A problem whose solution is a uniform stretch about the base center
    /// growing with pressure and shrinking with activation.
    struct ScriptedProblem {
        positions: Vec<Vec3>,
        center: Vec3,
        u: Vec<Vec3>,
        solved: Vec<Load>,
        fail_above_activation: f64,
        material: HolzapfelOgden,
    }

    impl ScriptedProblem {
        fn new(geometry: &HeartGeometry) -> Self {
            Self {
                positions: geometry.mesh.vertices().to_vec(),
                center: geometry.base_center(),
                u: vec![Vec3::zeros(); geometry.mesh.vertex_count()],
                solved: Vec::new(),
                fail_above_activation: f64::INFINITY,
                material: HolzapfelOgden::default(),
            }
        }
    }

    impl MechanicsProblem for ScriptedProblem {
        fn solve(&mut self, load: Load) -> Result<crate::problem::SolveReport, SolveError> {
            self.solved.push(load);
            if load.activation > self.fail_above_activation {
                return Err(SolveError::NotConverged {
                    iterations: 30,
                    residual: 1.,
                });
            }
            let stretch = 0.1 * load.pressure - 0.01 * load.activation;
            self.u = self
                .positions
                .iter()
                .map(|x| stretch * (x - self.center))
                .collect();
            Ok(crate::problem::SolveReport {
                iterations: 1,
                residual: 0.,
            })
        }

        fn displacement(&self) -> &[Vec3] {
            &self.u
        }

        fn set_displacement(&mut self, u: &[Vec3]) {
            self.u.copy_from_slice(u);
        }

        fn material(&self) -> &dyn Material {
            &self.material
        }
    }

    fn cup() -> Rc<HeartGeometry> {
        let geo = tagging::tag(cup_mesh(4, 4, 3), &Default::default()).unwrap();
        let micro =
            microstructure::assign(&geo, &FiberAngles::default(), FiberSpace::Cell, &RuleBasedFibers)
                .unwrap();
        Rc::new(geo.with_microstructure(micro))
    }

    fn scripted_model() -> HeartModel<ScriptedProblem> {
        let geo = cup();
        let problem = ScriptedProblem::new(&geo);
        HeartModel::with_problem(
            geo,
            problem,
            ContinuationConfig {
                max_activation_step: 1.,
                max_pressure_step: 0.25,
            },
            Communicator::default(),
        )
        .unwrap()
    }

    #[test]
    fn unloaded_volume_is_reference_volume() {
        let mut model = scripted_model();
        assert_eq!(model.compute_volume(0., 0.).unwrap(), 8.);
        // only the solve at construction
        assert_eq!(model.problem().solved.len(), 1);
    }

    #[test]
    fn continuation_steps_activation_then_pressure() {
        let mut model = scripted_model();
        let volume = model.compute_volume(2.5, 1.).unwrap();

        let solved = &model.problem().solved[1..];
        for (load, expected) in solved[..3].iter().zip([2.5 / 3., 5. / 3., 2.5]) {
            assert_relative_eq!(load.activation, expected, epsilon = 1e-15);
        }
        assert!(solved[..3].iter().all(|l| l.pressure == 0.));
        let pressures: Vec<f64> = solved[3..].iter().map(|l| l.pressure).collect();
        assert_eq!(pressures, vec![0.25, 0.5, 0.75, 1.]);
        assert!(solved[3..].iter().all(|l| l.activation == 2.5));

        assert_eq!(model.load(), Load { activation: 2.5, pressure: 1. });
        let stretch: f64 = 1. + 0.1 - 0.025;
        assert_relative_eq!(volume, 8. * stretch.powi(3), epsilon = 1e-12);
    }

    #[test]
    fn failed_continuation_stops_at_last_converged_step() {
        let mut model = scripted_model();
        model.problem.fail_above_activation = 1.5;
        let err = model.compute_volume(3., 0.5).unwrap_err();
        assert!(matches!(err, SolveError::NotConverged { .. }));
        assert_eq!(model.activation(), 1.);
        assert_eq!(model.pressure(), 0.);
        assert_relative_eq!(model.volume(), 8. * 0.99f64.powi(3), epsilon = 1e-12);
    }

    #[test]
    fn dv_da_restores_state() {
        let mut model = scripted_model();
        let v0 = model.compute_volume(2., 0.5).unwrap();
        let u0 = model.displacement().to_vec();

        let dv_da = model.dv_da(2., 0.5, 0.01).unwrap();
        // V = 8 (1 + 0.05 - 0.01 a)^3
        let expected = (8. * (1.05 - 0.0202f64).powi(3) - 8. * (1.05 - 0.02f64).powi(3)) / 0.02;
        assert_relative_eq!(dv_da, expected, epsilon = 1e-9);

        assert_eq!(model.activation().to_bits(), 2f64.to_bits());
        assert_eq!(model.pressure().to_bits(), 0.5f64.to_bits());
        assert_eq!(model.volume().to_bits(), v0.to_bits());
        assert_eq!(model.displacement(), u0.as_slice());
    }

    #[test]
    fn dv_da_restores_state_on_failure() {
        let mut model = scripted_model();
        model.compute_volume(1., 0.5).unwrap();
        let u0 = model.displacement().to_vec();
        model.problem.fail_above_activation = 1.005;

        assert!(model.dv_da(1., 0.5, 0.01).is_err());
        assert_eq!(model.load(), Load { activation: 1., pressure: 0.5 });
        assert_eq!(model.displacement(), u0.as_slice());
    }

    #[test]
    fn snapshot_restores_after_panic() {
        let mut model = scripted_model();
        model.compute_volume(1., 0.).unwrap();
        let before = model.load();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            model.with_snapshot(|m| {
                m.assign_state_variables(5., 5.);
                panic!("interrupted");
            })
        }));
        assert!(res.is_err());
        assert_eq!(model.load(), before);
    }

    #[test]
    fn strain_is_relative_to_initial_loading() {
        let mut model = scripted_model();
        // the scripted solution is a uniform 5% stretch
        model.compute_volume(0., 0.5).unwrap();
        let strained = model.compute_fiber_strain();
        let e = 0.5 * (1.05f64.powi(2) - 1.);
        for values in strained.values() {
            for v in values {
                assert_relative_eq!(*v, e, epsilon = 1e-12);
            }
        }

        model.initial_loading(0.5).unwrap();
        let relative = model.compute_fiber_strain();
        assert!(relative.values().flatten().all(|v| v.abs() < 1e-12));
        assert_eq!(model.fiber_strain_history().len(), 2);
        // both segments of the cup, every cell once
        assert_eq!(relative.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        let cells: usize = relative.values().map(Vec::len).sum();
        assert_eq!(cells, model.geometry().mesh.cell_count());
    }

    #[test]
    fn work_is_zero_without_load() {
        let mut model = scripted_model();
        let work = model.compute_myocardial_work();
        assert!(work.values().flatten().all(|w| *w == 0.));
        assert_eq!(model.myocardial_work_history().len(), 1);
    }

    #[test]
    fn save_writes_records_and_advances_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = scripted_model();
        model.compute_volume(1., 0.2).unwrap();
        model.save(0, dir.path()).unwrap();
        model.compute_volume(2., 0.4).unwrap();
        model.save(1, dir.path()).unwrap();
        assert_eq!(model.step(), 2);

        let u: Vec<crate::output::Record<Vec<[f64; 3]>>> =
            crate::output::read_series(dir.path(), "u").unwrap();
        assert_eq!(u.len(), 2);
        assert_eq!(u[0].time, 1.);
        assert_eq!(u[1].values.len(), model.geometry().mesh.vertex_count());
        let act: Vec<crate::output::Record<Vec<f64>>> =
            crate::output::read_series(dir.path(), "activation").unwrap();
        assert_eq!(act[1].values[0], 2.);
        assert!(dir.path().join("E").join("E_000002.json").exists());
    }

    #[test]
    fn missing_microstructure_is_rejected() {
        let geo = Rc::new(tagging::tag(cup_mesh(3, 3, 2), &Default::default()).unwrap());
        let problem = ScriptedProblem::new(&geo);
        let res = HeartModel::with_problem(
            geo,
            problem,
            ContinuationConfig::default(),
            Communicator::default(),
        );
        assert!(matches!(
            res,
            Err(Error::Geometry(crate::geometry::GeometryError::MissingMicrostructure))
        ));
    }

    #[test]
    fn assigned_load_is_solved_before_returning_a_volume() {
        let mut model = scripted_model();
        model.assign_state_variables(0., 0.3);
        assert!(!model.is_converged());
        assert_eq!(model.load(), Load { activation: 0., pressure: 0.3 });

        let volume = model.compute_volume(0., 0.3).unwrap();
        assert!(model.is_converged());
        assert_relative_eq!(volume, 8. * 1.03f64.powi(3), epsilon = 1e-12);
        // continuation ran from the unloaded state in two pressure steps
        let pressures: Vec<f64> = model.problem().solved[1..].iter().map(|l| l.pressure).collect();
        assert_eq!(pressures.len(), 2);
        assert_eq!(pressures[1], 0.3);
    }

    #[test]
    fn zero_or_nan_continuation_step_is_rejected() {
        for step in [0., -1., f64::NAN, f64::INFINITY] {
            let geo = cup();
            let problem = ScriptedProblem::new(&geo);
            let res = HeartModel::with_problem(
                geo,
                problem,
                ContinuationConfig {
                    max_activation_step: step,
                    max_pressure_step: 0.25,
                },
                Communicator::default(),
            );
            assert!(matches!(res, Err(Error::Config(_))), "step {step} was accepted");
        }
    }

    #[test]
    fn repeated_initial_loading_redefines_reference() {
        let mut model = scripted_model();
        model.initial_loading(0.5).unwrap();
        model.initial_loading(1.).unwrap();
        let at_second = model.compute_fiber_strain();
        assert!(at_second.values().flatten().all(|v| v.abs() < 1e-12));

        // going back to the first pressure compresses relative to the second
        model.compute_volume(0., 0.5).unwrap();
        let e = 0.5 * ((1.05f64 / 1.1).powi(2) - 1.);
        for v in model.compute_fiber_strain().values().flatten() {
            assert_relative_eq!(*v, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn communicator_defaults_to_single_rank() {
        let comm = Communicator::default();
        assert!(comm.is_root());
        assert_eq!(comm.size, 1);
    }
}
