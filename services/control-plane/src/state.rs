//! Application state shared across request handlers.

use std::sync::Arc;

use crate::service::Core;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    core: Arc<Core>,
}

impl AppState {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    /// The services' view of the store, subsystems and fabric config.
    pub fn core(&self) -> &Core {
        &self.core
    }
}
