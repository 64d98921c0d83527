//! In-process progress store, used when no Redis URL is configured

use std::collections::{BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::ProgressTracker;

/// Progress kept in memory; lost on restart
#[derive(Debug, Default)]
pub struct InMemoryProgress {
    completed: RwLock<HashMap<String, BTreeSet<u32>>>,
}

impl InMemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressTracker for InMemoryProgress {
    async fn record_completion(&self, user_id: &str, lesson_id: u32) -> Result<()> {
        let newly = self
            .completed
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(lesson_id);
        debug!(
            "Recorded lesson {} for user {} (new: {})",
            lesson_id, user_id, newly
        );
        Ok(())
    }

    async fn completed_lessons(&self, user_id: &str) -> Result<BTreeSet<u32>> {
        Ok(self
            .completed
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let progress = InMemoryProgress::new();
        assert_ok!(progress.record_completion("ada", 1).await);
        assert_ok!(progress.record_completion("ada", 1).await);
        assert_ok!(progress.record_completion("ada", 2).await);

        let done = progress.completed_lessons("ada").await.unwrap();
        assert_eq!(done.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let progress = InMemoryProgress::new();
        progress.record_completion("ada", 3).await.unwrap();
        assert!(progress.completed_lessons("bob").await.unwrap().is_empty());
    }
}
