//! Implementations of the subcommands.

use std::{error::Error, path::Path, rc::Rc};

use dynacomp::{
    gmsh, microstructure, tagging, Communicator, Config, HeartGeometry, HeartModel, Load,
};
use dynacomp_tools::{
    organize::{self as org, OrganizeOptions},
    pv::{self, LoopParams, PvData},
};

type CmdResult = Result<(), Box<dyn Error>>;

fn load_config(path: Option<&Path>) -> Result<Config, dynacomp::config::ConfigError> {
    match path {
        Some(path) => {
            tracing::info!(config = %path.display(), "reading configuration");
            Config::from_file(path)
        }
        None => Ok(Config::default()),
    }
}

/// Tag a mesh, compute its microstructure and save the geometry.
pub fn geometry(mesh_path: &Path, config_path: Option<&Path>, out: &Path) -> CmdResult {
    let config = load_config(config_path)?;
    let bytes = std::fs::read(mesh_path)?;
    let mesh = gmsh::load_heart_mesh(&bytes)?;
    tracing::info!(
        vertices = mesh.vertex_count(),
        cells = mesh.cell_count(),
        "loaded mesh"
    );

    let geometry = tagging::tag(mesh, &config.geometry.tagging)?;
    let fibers = microstructure::assign(
        &geometry,
        &config.geometry.fiber_angles,
        config.geometry.fiber_space,
        &microstructure::RuleBasedFibers,
    )?;
    geometry.with_microstructure(fibers).save(out)?;
    tracing::info!(out = %out.display(), "saved geometry");
    Ok(())
}

/// Inflate to end-diastole, then step through a load path,
/// saving the state and the PV trajectory along the way.
///
/// If a step fails to converge, the results up to it are still written.
pub fn simulate(
    geometry_path: &Path,
    config_path: Option<&Path>,
    edp: f64,
    load_path: Option<&Path>,
    outdir: &Path,
) -> CmdResult {
    let config = load_config(config_path)?;
    let path = match load_path {
        Some(p) => read_load_path(p)?,
        None => Vec::new(),
    };
    let geometry = Rc::new(HeartGeometry::load(geometry_path)?);
    let mut model = HeartModel::new(geometry, &config.model, Communicator::from_env())?;

    let edv = model.initial_loading(edp)?;
    model.save(0, outdir)?;
    let mut trajectory = PvData::new(vec![edp], vec![edv]);

    let mut failure = None;
    for (step, load) in path.iter().enumerate() {
        match model.compute_volume(load.activation, load.pressure) {
            Ok(volume) => {
                trajectory.pressures.push(load.pressure);
                trajectory.volumes.push(volume);
                model.compute_fiber_strain();
                model.compute_myocardial_work();
                model.save(step + 1, outdir)?;
            }
            Err(e) => {
                tracing::error!(step = step + 1, ?load, "load path stopped: {e}");
                failure = Some(e);
                break;
            }
        }
    }

    if model.communicator().is_root() {
        model.save_histories(outdir)?;
        pv::write_pv_csv(outdir.join("pv_loop.csv"), &trajectory)?;
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Read (activation, pressure) pairs, one per line.
/// A first line that isn't numeric is a header.
fn read_load_path(path: &Path) -> Result<Vec<Load>, Box<dyn Error>> {
    let text = std::fs::read_to_string(path)?;
    let mut loads = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let values: Result<Vec<f64>, _> = line.split(',').map(|x| x.trim().parse()).collect();
        match values.as_deref() {
            Ok([activation, pressure, ..]) => loads.push(Load {
                activation: *activation,
                pressure: *pressure,
            }),
            _ if idx == 0 => continue,
            _ => {
                let msg = format!("{}:{}: expected activation,pressure", path.display(), idx + 1);
                return Err(msg.into());
            }
        }
    }
    tracing::info!(steps = loads.len(), "read load path");
    Ok(loads)
}

/// Extract the representative loop of a recording.
pub fn pv_loop(
    data: &Path,
    p_channel: usize,
    v_channel: usize,
    out: &Path,
    smoothed: Option<&Path>,
) -> CmdResult {
    let recording = pv::load_pv_csv(data, p_channel, v_channel)?;
    let pv_loop = pv::representative_loop(&recording, &LoopParams::default())?;
    pv::write_pv_csv(out, &pv_loop)?;
    tracing::info!(samples = pv_loop.len(), out = %out.display(), "wrote PV loop");

    if let Some(smoothed) = smoothed {
        pv::write_pv_csv(smoothed, &pv::smooth_periodic(&pv_loop, 200, 2.))?;
    }
    Ok(())
}

/// Sort the files of one or all samples of the master sheet.
pub fn organize(sheet: &Path, sample: &str, opts: OrganizeOptions) -> CmdResult {
    let rows = org::read_master_sheet(sheet)?;
    let summary = org::organize(&rows, sample, &opts);
    for (name, dest) in &summary.placed {
        println!("{name}: {}", dest.display());
    }
    tracing::info!(
        placed = summary.placed.len(),
        copied = summary.copied,
        missing = summary.missing.len(),
        failed = summary.failed,
        "organized samples"
    );
    Ok(())
}
