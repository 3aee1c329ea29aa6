//! # Utilities Module
//!
//! ## Role
//! Cross-cutting helpers that don't belong in domain-specific modules.
//!
//! ## Sub-modules
//! - `threading`: Rayon thread pool configuration for the data loader
//! - `progress`: batch counter, ETA and the progress reporter seam

pub mod progress;
pub mod threading;
