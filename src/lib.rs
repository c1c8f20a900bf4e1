//! Patient-specific finite-element modelling of the left ventricle.
//!
//! The pipeline goes from a Gmsh mesh with named `Epi`, `Endo` and `Base`
//! surfaces to a tagged [`HeartGeometry`] with myofiber microstructure,
//! and from there to a [`HeartModel`] that is driven through
//! (activation, pressure) load paths to compute cavity volume,
//! fiber strain and myocardial work.
//!
//! ```no_run
//! # use dynacomp::{gmsh, tagging, microstructure, HeartModel, ModelConfig};
//! # use std::rc::Rc;
//! # fn run() -> Result<(), dynacomp::Error> {
//! let bytes = std::fs::read("lv.msh")?;
//! let mesh = gmsh::load_heart_mesh(&bytes)?;
//! let geometry = tagging::tag(mesh, &tagging::TaggingConfig::default())?;
//! let fibers = microstructure::assign(
//!     &geometry,
//!     &microstructure::FiberAngles::default(),
//!     microstructure::FiberSpace::Cell,
//!     &microstructure::RuleBasedFibers,
//! )?;
//! let geometry = Rc::new(geometry.with_microstructure(fibers));
//!
//! let mut model = HeartModel::new(geometry, &ModelConfig::default(), Default::default())?;
//! let edv = model.initial_loading(1.0)?;
//! let esv = model.compute_volume(60.0, 12.0)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod mesh;
#[doc(inline)]
pub use mesh::{FaceSubset, TetMesh};

pub mod gmsh;

pub mod geometry;
#[doc(inline)]
pub use geometry::{HeartGeometry, Region};

pub mod tagging;

pub mod microstructure;
#[doc(inline)]
pub use microstructure::{FiberAngles, FiberBasis, FiberSpace, Microstructure};

pub mod refine;

pub mod kinematics;

pub mod material;
#[doc(inline)]
pub use material::{HolzapfelOgden, Material};

pub mod problem;
#[doc(inline)]
pub use problem::{BoundaryConditions, FeProblem, Load, MechanicsProblem, SolveError};

pub mod model;
#[doc(inline)]
pub use model::{Communicator, HeartModel};

pub mod output;

pub mod config;
#[doc(inline)]
pub use config::{Config, ModelConfig};

mod error;
pub use error::Error;

// nalgebra re-exports of common types for convenience

pub use nalgebra as na;
/// Type alias for a 3D `nalgebra` vector.
pub type Vec3 = na::Vector3<f64>;
/// Type alias for a 3x3 `nalgebra` matrix, used for tensors.
pub type Mat3 = na::Matrix3<f64>;
