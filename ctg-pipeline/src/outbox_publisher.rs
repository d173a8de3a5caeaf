//! Transactional outbox publisher
//!
//! Bridges SQLite and the broker so a state change and its event publish
//! exactly-once together. One publisher is active per logical deployment,
//! elected by the `outbox-publisher-leader` lease and kept alive by
//! heartbeat renewal. A crash between broker ack and the status update
//! re-delivers the payload in a fresh envelope; downstream handlers
//! deduplicate on payload identity.

use crate::broker::{Broker, BrokerError, JobEnvelope, Lease};
use ctg_common::db::outbox;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct OutboxPublisher {
    pub db: SqlitePool,
    pub broker: Arc<Broker>,
    /// Rows drained per tick
    pub batch_size: i64,
    /// Poll interval between ticks
    pub interval: Duration,
    /// Leader lease; TTL should cover several intervals
    pub lease: Lease,
}

impl OutboxPublisher {
    pub fn new(db: SqlitePool, broker: Arc<Broker>, batch_size: usize, interval_ms: u64) -> Self {
        // Lease outlives a handful of missed heartbeats before failover
        let ttl_ms = (interval_ms * 10).max(5_000);
        Self {
            db,
            broker,
            batch_size: batch_size as i64,
            interval: Duration::from_millis(interval_ms),
            lease: Lease::outbox_leader(ttl_ms),
        }
    }

    /// Poll/publish until cancelled. Non-leaders idle on acquisition
    /// attempts; the leader renews its lease each tick and steps down on
    /// renewal failure.
    pub async fn run(self, cancel: CancellationToken) {
        let mut is_leader = false;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if is_leader {
                        if let Err(err) = self.broker.release_lease(&self.lease).await {
                            warn!(error = %err, "Failed to release publisher lease on shutdown");
                        }
                    }
                    info!("Outbox publisher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if !is_leader {
                        match self.broker.acquire_lease(&self.lease).await {
                            Ok(true) => {
                                info!("Acquired outbox publisher leadership");
                                is_leader = true;
                            }
                            Ok(false) => continue,
                            Err(err) => {
                                debug!(error = %err, "Leadership acquisition failed");
                                continue;
                            }
                        }
                    } else {
                        match self.broker.renew_lease(&self.lease).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!("Lost outbox publisher leadership");
                                is_leader = false;
                                continue;
                            }
                            Err(err) => {
                                warn!(error = %err, "Lease renewal failed, stepping down");
                                is_leader = false;
                                continue;
                            }
                        }
                    }

                    if let Err(err) = self.publish_tick().await {
                        // Broker trouble leaves rows pending for next tick
                        warn!(error = %err, "Outbox tick aborted");
                    }
                }
            }
        }
    }

    /// Drain one batch of pending rows in id order.
    async fn publish_tick(&self) -> Result<(), BrokerError> {
        let pending = match outbox::fetch_pending(&self.db, self.batch_size).await {
            Ok(pending) => pending,
            Err(err) => {
                error!(error = %err, "Failed to read pending outbox rows");
                return Ok(());
            }
        };
        if pending.is_empty() {
            return Ok(());
        }

        for event in pending {
            let payload: serde_json::Value = match serde_json::from_str(&event.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    // A row that cannot be decoded can never publish
                    error!(id = event.id, error = %err, "Outbox payload undecodable, marking failed");
                    if let Err(db_err) = outbox::mark_failed(&self.db, event.id).await {
                        error!(id = event.id, error = %db_err, "Failed to mark outbox row failed");
                    }
                    continue;
                }
            };

            // Enqueue first; only a broker ack flips the row to published
            self.broker
                .enqueue(&event.queue_name, &JobEnvelope::new(payload))
                .await?;

            match outbox::mark_published(&self.db, event.id).await {
                Ok(true) => {
                    debug!(id = event.id, queue = %event.queue_name, "Outbox event published");
                }
                Ok(false) => {
                    // Another publisher claimed it between fetch and update;
                    // the duplicate delivery is absorbed downstream
                    warn!(id = event.id, "Outbox row already claimed by a peer");
                }
                Err(err) => {
                    // Published but not marked; the row re-publishes next
                    // tick and idempotent consumers absorb the duplicate
                    error!(id = event.id, error = %err, "Failed to mark outbox row published");
                }
            }
        }

        Ok(())
    }
}
