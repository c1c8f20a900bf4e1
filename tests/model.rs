//! End-to-end runs of the geometry pipeline and the load path driver
//! on the box-shaped test ventricle.

use std::rc::Rc;

use approx::assert_relative_eq;
use dynacomp::{
    config::ContinuationConfig,
    mesh::cup_mesh,
    microstructure::{self, RuleBasedFibers},
    problem::{BaseConstraint, BoundaryParams, SolverConfig},
    tagging, Error, FiberAngles, FiberSpace, HeartGeometry, HeartModel, ModelConfig, Region,
    SolveError,
};

fn cup_geometry(space: FiberSpace) -> HeartGeometry {
    let geo = tagging::tag(cup_mesh(4, 4, 3), &Default::default()).unwrap();
    let micro = microstructure::assign(&geo, &FiberAngles::default(), space, &RuleBasedFibers)
        .unwrap();
    geo.with_microstructure(micro)
}

fn clamped_config() -> ModelConfig {
    ModelConfig {
        bc: BoundaryParams {
            base_constraint: BaseConstraint::Fixed,
            pericardium_spring: 0.1,
            ..Default::default()
        },
        continuation: ContinuationConfig {
            max_activation_step: 0.5,
            max_pressure_step: 0.1,
        },
        ..Default::default()
    }
}

#[test]
fn unloaded_model_has_reference_volume() {
    let mut model = HeartModel::new(
        Rc::new(cup_geometry(FiberSpace::Cell)),
        &clamped_config(),
        Default::default(),
    )
    .unwrap();
    assert_relative_eq!(model.compute_volume(0., 0.).unwrap(), 8., epsilon = 1e-12);
    assert_eq!(model.pressure(), 0.);
    assert_eq!(model.activation(), 0.);
}

#[test]
fn default_configuration_inflates() {
    let mut model = HeartModel::new(
        Rc::new(cup_geometry(FiberSpace::Cell)),
        &ModelConfig::default(),
        Default::default(),
    )
    .unwrap();
    let edv = model.initial_loading(0.2).unwrap();
    assert!(edv > 8., "passive inflation gave volume {edv}");
    assert!(model.is_converged());
    // the endocardial ring stays in place
    let geometry = model.geometry().clone();
    let base = geometry.region_faces(Region::Base).vertices(&geometry.mesh);
    let endo = geometry.region_faces(Region::Endo).vertices(&geometry.mesh);
    for v in base.ones().filter(|v| endo.contains(*v)) {
        assert_eq!(model.displacement()[v], dynacomp::Vec3::zeros());
    }
}

#[test]
fn pressure_and_activation_path() {
    let mut model = HeartModel::new(
        Rc::new(cup_geometry(FiberSpace::Cell)),
        &clamped_config(),
        Default::default(),
    )
    .unwrap();

    let edv = model.initial_loading(0.3).unwrap();
    assert!(edv > 8., "passive inflation gave volume {edv}");
    // strains are now relative to the loaded state
    let e_ff = model.compute_fiber_strain();
    assert!(e_ff.values().flatten().all(|e| e.abs() < 1e-10));

    let v = model.compute_volume(1., 0.3).unwrap();
    assert!(v.is_finite());
    assert_eq!(model.activation(), 1.);
    assert_eq!(model.pressure(), 0.3);

    let work = model.compute_myocardial_work();
    assert!(work.values().flatten().all(|w| w.is_finite()));
    assert_eq!(model.myocardial_work_history().len(), 1);
}

#[test]
fn dv_da_has_no_side_effects() {
    let mut model = HeartModel::new(
        Rc::new(cup_geometry(FiberSpace::Cell)),
        &clamped_config(),
        Default::default(),
    )
    .unwrap();
    let volume = model.compute_volume(1., 0.2).unwrap();
    let u = model.displacement().to_vec();

    let dv_da = model.dv_da(1., 0.2, 0.01).unwrap();
    assert!(dv_da.is_finite());

    assert_eq!(model.activation().to_bits(), 1f64.to_bits());
    assert_eq!(model.pressure().to_bits(), 0.2f64.to_bits());
    assert_eq!(model.volume().to_bits(), volume.to_bits());
    assert_eq!(model.displacement(), u.as_slice());
}

#[test]
fn failed_solve_surfaces_as_error() {
    let config = ModelConfig {
        solver: SolverConfig {
            max_iterations: 1,
            abs_tol: 1e-14,
            rel_tol: 1e-14,
        },
        ..clamped_config()
    };
    let mut model =
        HeartModel::new(Rc::new(cup_geometry(FiberSpace::Cell)), &config, Default::default())
            .unwrap();

    let res = model.compute_volume(0., 0.3);
    assert!(matches!(res, Err(SolveError::NotConverged { .. })));
    assert_eq!(model.pressure(), 0.);
    assert_relative_eq!(model.volume(), 8., epsilon = 1e-12);
}

#[test]
fn refined_model_from_saved_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cup.json");
    cup_geometry(FiberSpace::Vertex).save(&path).unwrap();
    let geometry = HeartGeometry::load(&path).unwrap();
    assert_eq!(
        geometry.microstructure().map(|m| m.space()),
        Some(FiberSpace::Vertex)
    );

    let config = ModelConfig {
        refinement: Some(1),
        ..clamped_config()
    };
    let mut model = HeartModel::new(Rc::new(geometry), &config, Default::default()).unwrap();
    assert_eq!(model.geometry().mesh.cell_count(), 8 * 240);
    assert_relative_eq!(model.compute_volume(0., 0.).unwrap(), 8., epsilon = 1e-12);
}

#[test]
fn geometry_without_fibers_is_rejected() {
    let geometry = tagging::tag(cup_mesh(3, 3, 2), &Default::default()).unwrap();
    let res = HeartModel::new(Rc::new(geometry), &ModelConfig::default(), Default::default());
    assert!(matches!(res, Err(Error::Geometry(_))));
}

#[test]
fn invalid_config_is_rejected_before_solving() {
    let mut config = clamped_config();
    config.bc.pericardium_spring = -1.;
    let res = HeartModel::new(
        Rc::new(cup_geometry(FiberSpace::Cell)),
        &config,
        Default::default(),
    );
    assert!(matches!(res, Err(Error::Config(_))));
}
