//! InMemoryRunStore - run records in a DashMap

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::RunStore;
use crate::error::RuntimeError;
use crate::runtime::RunRecord;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RunKey {
    app_id: String,
    user_id: Option<String>,
    period: String,
}

impl RunKey {
    fn new(app_id: &str, user_id: Option<&str>, period: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            user_id: user_id.map(String::from),
            period: period.to_string(),
        }
    }
}

/// Thread-safe run storage; records for one key are kept in save order
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<DashMap<RunKey, Vec<RunRecord>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record saved for the pair in `period`
    pub fn records(&self, app_id: &str, user_id: Option<&str>, period: &str) -> Vec<RunRecord> {
        self.runs
            .get(&RunKey::new(app_id, user_id, period))
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    /// Total number of saved records
    pub fn len(&self) -> usize {
        self.runs.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn find_terminal(
        &self,
        app_id: &str,
        user_id: Option<&str>,
        period: &str,
    ) -> Result<Option<RunRecord>, RuntimeError> {
        Ok(self
            .runs
            .get(&RunKey::new(app_id, user_id, period))
            .and_then(|records| {
                records
                    .iter()
                    .rev()
                    .find(|r| r.status.is_terminal())
                    .cloned()
            }))
    }

    async fn save(&self, period: &str, record: RunRecord) -> Result<(), RuntimeError> {
        let key = RunKey::new(&record.app_id, record.user_id.as_deref(), period);
        self.runs.entry(key).or_default().push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{RunMode, RunStatus};
    use chrono::Utc;
    use serde_json::Map;
    use uuid::Uuid;

    fn record(app: &str, user: &str, status: RunStatus) -> RunRecord {
        RunRecord {
            id: Uuid::new_v4(),
            app_id: app.to_string(),
            user_id: Some(user.to_string()),
            mode: RunMode::Use,
            status,
            inputs: Map::new(),
            outputs: Map::new(),
            trace: Vec::new(),
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn finds_terminal_run_for_period() {
        let store = InMemoryRunStore::new();
        let done = record("digest", "u1", RunStatus::Completed);
        store.save("2026-10-16", done.clone()).await.unwrap();

        let found = store
            .find_terminal("digest", Some("u1"), "2026-10-16")
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id), Some(done.id));

        assert!(store
            .find_terminal("digest", Some("u1"), "2026-10-17")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_terminal("digest", Some("u2"), "2026-10-16")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn non_terminal_runs_do_not_count() {
        let store = InMemoryRunStore::new();
        store
            .save("p", record("digest", "u1", RunStatus::Running))
            .await
            .unwrap();

        assert!(store
            .find_terminal("digest", Some("u1"), "p")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn latest_terminal_record_wins() {
        let store = InMemoryRunStore::new();
        store
            .save("p", record("digest", "u1", RunStatus::Failed))
            .await
            .unwrap();
        let retry = record("digest", "u1", RunStatus::Completed);
        store.save("p", retry.clone()).await.unwrap();

        let found = store.find_terminal("digest", Some("u1"), "p").await.unwrap();
        assert_eq!(found.map(|r| r.status), Some(RunStatus::Completed));
        assert_eq!(store.records("digest", Some("u1"), "p").len(), 2);
    }
}
