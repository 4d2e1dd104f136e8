//! fabric control plane library.
//!
//! The crate primarily ships the `control-plane` binary; the library surface
//! exists for integration testing and reuse.

pub mod api;
pub mod config;
pub mod db;
pub mod jobs;
pub mod model;
pub mod service;
pub mod state;
pub mod subsystems;
pub mod workers;
