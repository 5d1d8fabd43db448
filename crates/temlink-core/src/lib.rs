//! temlink Core - Shared types for instrument bridging
//!
//! This crate provides the domain values shared between the daemon
//! (temlinkd) and the bus protocol: stage setpoints and readbacks,
//! motion tolerances, and the locally tracked optics state.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod scope;
pub mod stage;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use scope::{
    MagMode, MagnificationTable, MagnificationTables, ReportedMagMode, ScopeState, ScreenPosition,
};
pub use stage::{
    Axis, StageReadback, StageSetpoint, Tolerances, DEFAULT_ROT_TOL, DEFAULT_TRANS_TOL,
};
