//! State shared with the health handlers.

use std::sync::Arc;

use crate::db::Store;
use crate::engine::Engine;

/// Shared application state.
///
/// Passed to handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(AppStateInner { engine }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.inner.engine.store()
    }
}
