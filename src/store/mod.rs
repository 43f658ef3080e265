//! Store Module - persisted runs
//!
//! Runs are keyed by `(app_id, user_id, period)` so a scheduled driver can
//! ask "did this pair already run today?" before dispatching again.
//!
//! Key types:
//! - `RunStore`: persistence seam used by the batch dispatcher
//! - `InMemoryRunStore`: DashMap-backed store for tests and single-process use

mod memory;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::runtime::RunRecord;

pub use memory::InMemoryRunStore;

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Latest terminal run for the pair in `period`, if any
    async fn find_terminal(
        &self,
        app_id: &str,
        user_id: Option<&str>,
        period: &str,
    ) -> Result<Option<RunRecord>, RuntimeError>;

    async fn save(&self, period: &str, record: RunRecord) -> Result<(), RuntimeError>;
}
