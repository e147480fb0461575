//! Temporal interference montage pipeline: catalog loading, per-montage
//! stage execution against external solver tools, envelope computation and
//! artifact verification, scheduled across montages in parallel.

pub mod cli;
pub mod core;
pub mod logging;

pub use crate::core::error::{TiError, TiResult};
