use crate::{
    config::ConfigError, geometry::GeometryError, gmsh::GmshError, output::OutputError,
    problem::SolveError,
};

/// Any error produced by this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Loading a mesh failed.
    #[error(transparent)]
    Gmsh(#[from] GmshError),
    /// A geometry is invalid or couldn't be read or written.
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    /// A nonlinear solve failed.
    #[error(transparent)]
    Solve(#[from] SolveError),
    /// Writing results failed.
    #[error(transparent)]
    Output(#[from] OutputError),
    /// A configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Other I/O failure.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}
