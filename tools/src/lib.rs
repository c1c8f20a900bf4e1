//! Tools around the `dynacomp` library: pressure-volume loop extraction
//! and sorting of raw experiment files, used by the `dynacomp` binary.

#![warn(missing_docs)]

pub mod logging;
pub mod organize;
pub mod pv;
