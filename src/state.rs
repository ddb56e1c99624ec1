//! Shared state for the built-in routes.

use crate::inject::Container;
use crate::pipeline::PipelineStats;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub container: Container,
    pub stats: Arc<PipelineStats>,
    /// Number of reflected routes.
    pub routes: usize,
    pub pool: Option<PgPool>,
}
