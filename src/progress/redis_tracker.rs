//! Redis-backed progress store
//!
//! Completed lessons live in one set per user. Each new completion is also
//! published so other services (dashboards, belt bookkeeping) can react.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::ProgressTracker;

/// Redis key constants
pub mod keys {
    /// Per-user set of completed lesson ids
    pub const PROGRESS_PREFIX: &str = "dojo:progress:";

    /// Completion events channel (for pub/sub)
    pub const PROGRESS_CHANNEL: &str = "dojo:progress:events";
}

const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct CompletionEvent<'a> {
    user_id: &'a str,
    lesson_id: u32,
}

fn progress_key(user_id: &str) -> String {
    format!("{}{}", keys::PROGRESS_PREFIX, user_id)
}

/// Progress tracker storing completions in Redis sets
pub struct RedisProgressTracker {
    client: redis::Client,
    conn: RwLock<MultiplexedConnection>,
}

impl RedisProgressTracker {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            client,
            conn: RwLock::new(conn),
        })
    }

    async fn connection(&self) -> MultiplexedConnection {
        self.conn.read().await.clone()
    }

    /// Replace the shared connection after a failure
    async fn reconnect(&self) -> Result<MultiplexedConnection> {
        let conn = get_connection_with_retry(&self.client).await?;
        *self.conn.write().await = conn.clone();
        Ok(conn)
    }
}

#[async_trait]
impl ProgressTracker for RedisProgressTracker {
    async fn record_completion(&self, user_id: &str, lesson_id: u32) -> Result<()> {
        let key = progress_key(user_id);
        let mut conn = self.connection().await;

        // Try to store, reconnect on failure
        let added: i64 = match conn.sadd::<_, _, i64>(&key, lesson_id).await {
            Ok(added) => added,
            Err(e) => {
                warn!("Failed to record progress: {}. Reconnecting...", e);
                conn = self.reconnect().await?;
                conn.sadd::<_, _, i64>(&key, lesson_id)
                    .await
                    .with_context(|| format!("Failed to record lesson {} for {}", lesson_id, user_id))?
            }
        };

        if added > 0 {
            let event = serde_json::to_string(&CompletionEvent { user_id, lesson_id })?;
            // Publish to channel (ignore errors as there may be no subscribers)
            let _ = conn
                .publish::<_, _, ()>(keys::PROGRESS_CHANNEL, &event)
                .await;
        }

        Ok(())
    }

    async fn completed_lessons(&self, user_id: &str) -> Result<BTreeSet<u32>> {
        let key = progress_key(user_id);
        let mut conn = self.connection().await;

        let members: Vec<u32> = match conn.smembers::<_, Vec<u32>>(&key).await {
            Ok(members) => members,
            Err(e) => {
                warn!("Failed to read progress: {}. Reconnecting...", e);
                conn = self.reconnect().await?;
                conn.smembers::<_, Vec<u32>>(&key)
                    .await
                    .with_context(|| format!("Failed to read progress for {}", user_id))?
            }
        };

        Ok(members.into_iter().collect())
    }
}

/// Get a Redis connection, giving up after a few attempts
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    let mut attempt = 1;
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {}s...",
                    e,
                    CONNECT_RETRY_DELAY.as_secs()
                );
                attempt += 1;
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e).context("Failed to connect to Redis"),
        }
    }
}
