//! Redis Manager - queue transport for the worker
//!
//! This module handles all Redis-related operations:
//! - Job queue operations (BLPOP)
//! - Result storage and publishing
//!
//! BLPOP blocks its connection, so the worker keeps one manager for popping
//! and a separate one (cloned per task) for results.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::jobs::{ExecuteJob, ExecuteResult};

/// Redis key constants
pub mod keys {
    /// Execution job queue key
    pub const EXECUTE_QUEUE: &str = "execute:queue";

    /// Execution result key prefix (for polling)
    pub const EXECUTE_RESULT_PREFIX: &str = "execute:result:";

    /// Execution result channel (for pub/sub)
    pub const EXECUTE_RESULT_CHANNEL: &str = "execute:results";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Redis connection with reconnect-on-failure
#[derive(Clone)]
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    /// Connect to Redis, retrying until it is reachable
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);

        Ok(Self { client, conn })
    }

    /// Connect using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = redis_url_from_env();
        Self::with_url(&url).await
    }

    /// Open an independent connection to the same server
    pub async fn reconnected(&self) -> Result<Self> {
        let conn = get_connection_with_retry(&self.client).await?;
        Ok(Self {
            client: self.client.clone(),
            conn,
        })
    }

    /// Block and wait for the next job from the queue.
    ///
    /// Malformed payloads are logged and skipped.
    /// Automatically reconnects on connection failure.
    pub async fn pop_job(&mut self) -> Result<ExecuteJob> {
        loop {
            let result: Option<(String, String)> =
                match redis::AsyncCommands::blpop(&mut self.conn, keys::EXECUTE_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.reconnect().await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<ExecuteJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// Store an execution result in Redis.
    ///
    /// The result is stored with a 1-hour expiration and also published
    /// to a channel for real-time subscribers.
    pub async fn store_execute_result(&mut self, result: &ExecuteResult) -> Result<()> {
        self.store_result(
            &result_key(&result.job_id),
            Some(keys::EXECUTE_RESULT_CHANNEL),
            result,
        )
        .await
    }

    async fn store_result<T: Serialize>(
        &mut self,
        key: &str,
        channel: Option<&str>,
        result: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(result)?;

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish failures are not fatal
        if let Some(chan) = channel {
            if let Err(e) = self.conn.publish::<_, _, ()>(chan, &json).await {
                debug!("Failed to publish result on {}: {}", chan, e);
            }
        }

        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

pub fn redis_url_from_env() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into())
}

pub fn result_key(job_id: &str) -> String {
    format!("{}{}", keys::EXECUTE_RESULT_PREFIX, job_id)
}

async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in {} seconds...",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
