use crate::volume_loader::SourceError;

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;

/// Cooperative cancellation flag shared between the caller and a background
/// task. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why a model build or refinement pass stopped before finishing.
#[derive(Debug, Error)]
pub enum PassError {
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Source(#[from] SourceError),
}
