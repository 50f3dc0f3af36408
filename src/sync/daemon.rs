// ABOUTME: SyncDaemon orchestrates the per-table replication cycle
// ABOUTME: Runs read-fetch-normalize-publish-advance on a cancellable interval

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;

use super::error::SyncError;
use super::normalize::{normalize, Provenance, SyncMessage, TableSpec};
use super::publisher::Publisher;
use super::reader::{ChangeSource, FetchOutcome};
use super::watermark::WatermarkStore;

/// What to do when a table's watermark falls behind the retention floor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalenessPolicy {
    /// Clamp the watermark to the retention floor, persist the reset, and
    /// keep going. The skipped version window is permanently lost and is
    /// logged loudly as such.
    #[default]
    AutoReset,
    /// Refuse to advance and surface the condition each cycle until an
    /// operator intervenes.
    FailFast,
}

/// Configuration for the SyncDaemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Delay between sync cycles (the loop is work-then-sleep, so cycles
    /// never overlap)
    pub sync_interval: Duration,
    /// Staleness recovery policy
    pub staleness_policy: StalenessPolicy,
    /// Tables to replicate, processed sequentially in this order
    pub tables: Vec<TableSpec>,
    /// Identity of this installation, stamped on every message
    pub provenance: Provenance,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(5),
            staleness_policy: StalenessPolicy::default(),
            tables: Vec::new(),
            provenance: Provenance::default(),
        }
    }
}

/// Statistics from one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub tables_synced: usize,
    pub rows_published: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Check if the cycle completed without per-table failures.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Drives the replication cycle for every configured table.
///
/// Each cycle runs read watermark -> fetch changes -> normalize -> publish
/// -> advance watermark, per table, sequentially. A failing table is
/// logged and recorded in the cycle stats; it never blocks other tables
/// and never aborts the process. The watermark for a table only advances
/// after the broker accepted every message of that table's cycle.
pub struct SyncDaemon<S, C, P> {
    config: DaemonConfig,
    store: S,
    source: C,
    publisher: P,
}

impl<S, C, P> SyncDaemon<S, C, P>
where
    S: WatermarkStore,
    C: ChangeSource,
    P: Publisher,
{
    pub fn new(config: DaemonConfig, store: S, source: C, publisher: P) -> Self {
        Self {
            config,
            store,
            source,
            publisher,
        }
    }

    /// Ensure a watermark entry exists for every configured table.
    ///
    /// Idempotent; run once before the first cycle. Failure here is fatal
    /// at startup rather than a per-cycle condition.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        for table in &self.config.tables {
            self.store.initialize_if_absent(&table.table_name).await?;
        }
        Ok(())
    }

    /// Run one sync cycle across all configured tables.
    pub async fn run_cycle(&self) -> SyncStats {
        let start = std::time::Instant::now();
        let mut stats = SyncStats::default();

        for table in &self.config.tables {
            match self.sync_table(table).await {
                Ok(rows) => {
                    stats.tables_synced += 1;
                    stats.rows_published += rows;
                }
                Err(e) => {
                    tracing::error!("Failed to sync '{}': {}", table.table_name, e);
                    stats
                        .errors
                        .push(format!("{}: {}", table.table_name, e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        stats
    }

    /// Run the daemon until a shutdown signal arrives.
    ///
    /// Cancellation is cooperative: checked before each cycle and again
    /// during the inter-cycle delay, so a shutdown requested mid-sleep
    /// does not wait for the full interval.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut cycles = 0u64;

        tracing::info!(
            "Starting sync daemon: {} tables, interval {:?}, staleness policy {:?}",
            self.config.tables.len(),
            self.config.sync_interval,
            self.config.staleness_policy
        );

        loop {
            match shutdown.try_recv() {
                Err(broadcast::error::TryRecvError::Empty) => {}
                _ => {
                    tracing::info!("Shutdown requested, stopping sync daemon");
                    break;
                }
            }

            cycles += 1;
            let stats = self.run_cycle().await;
            if stats.is_success() {
                tracing::info!(
                    "Cycle {} completed: {} tables, {} rows in {}ms",
                    cycles,
                    stats.tables_synced,
                    stats.rows_published,
                    stats.duration_ms
                );
            } else {
                tracing::warn!(
                    "Cycle {} completed with {} errors: {} tables, {} rows in {}ms",
                    cycles,
                    stats.errors.len(),
                    stats.tables_synced,
                    stats.rows_published,
                    stats.duration_ms
                );
            }

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::info!("Shutdown requested during delay, stopping sync daemon");
                    break;
                }
                _ = tokio::time::sleep(self.config.sync_interval) => {}
            }
        }

        Ok(())
    }

    /// Run one table through the full cycle. Connection and broker
    /// resources are scoped inside the reader and publisher calls.
    async fn sync_table(&self, table: &TableSpec) -> Result<u64, SyncError> {
        let mut since_version = self.store.get(&table.table_name).await?;

        let mut outcome = self.source.fetch_changes(table, since_version).await?;

        if let FetchOutcome::Stale { min_valid_version } = outcome {
            match self.config.staleness_policy {
                StalenessPolicy::FailFast => {
                    return Err(SyncError::StaleAnchor {
                        table: table.table_name.clone(),
                        watermark: since_version,
                        min_valid_version,
                    });
                }
                StalenessPolicy::AutoReset => {
                    tracing::warn!(
                        "Watermark {} for '{}' fell behind the retention floor; \
                         resetting to {} (changes in between are permanently lost)",
                        since_version,
                        table.table_name,
                        min_valid_version
                    );
                    // Persist the reset before fetching so a crash cannot
                    // replay the lost window decision differently.
                    self.store
                        .set(&table.table_name, min_valid_version)
                        .await?;
                    since_version = min_valid_version;
                    outcome = self.source.fetch_changes(table, since_version).await?;
                }
            }
        }

        let (records, new_version) = match outcome {
            FetchOutcome::Disabled => {
                tracing::warn!("{}", SyncError::TrackingDisabled(table.table_name.clone()));
                return Ok(0);
            }
            FetchOutcome::Stale { min_valid_version } => {
                // The retention floor moved again between the reset and the
                // re-fetch; give up until the next interval.
                return Err(SyncError::StaleAnchor {
                    table: table.table_name.clone(),
                    watermark: since_version,
                    min_valid_version,
                });
            }
            FetchOutcome::Changes {
                records,
                new_version,
            } => (records, new_version),
        };

        let row_count = records.len() as u64;
        if !records.is_empty() {
            let messages: Vec<SyncMessage> = records
                .iter()
                .map(|record| normalize(table, record, &self.config.provenance))
                .collect();
            self.publisher.publish(&messages).await?;
            tracing::info!(
                "Published {} messages for '{}' (version {} -> {})",
                row_count,
                table.table_name,
                since_version,
                new_version
            );
        } else {
            tracing::debug!(
                "No changes in '{}' since version {}",
                table.table_name,
                since_version
            );
        }

        // Advance only after every message was accepted by the broker; a
        // publish failure above leaves the watermark untouched.
        if new_version > since_version {
            self.store.set(&table.table_name, new_version).await?;
        }

        Ok(row_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.staleness_policy, StalenessPolicy::AutoReset);
        assert!(config.tables.is_empty());
    }

    #[test]
    fn test_staleness_policy_parses_kebab_case() {
        let policy: StalenessPolicy = serde_json::from_str("\"auto-reset\"").unwrap();
        assert_eq!(policy, StalenessPolicy::AutoReset);
        let policy: StalenessPolicy = serde_json::from_str("\"fail-fast\"").unwrap();
        assert_eq!(policy, StalenessPolicy::FailFast);
    }

    #[test]
    fn test_sync_stats_success() {
        let stats = SyncStats {
            tables_synced: 3,
            rows_published: 100,
            errors: vec![],
            duration_ms: 12,
        };
        assert!(stats.is_success());
    }

    #[test]
    fn test_sync_stats_with_errors() {
        let stats = SyncStats {
            tables_synced: 2,
            rows_published: 80,
            errors: vec!["employees: publish error: broker unreachable".to_string()],
            duration_ms: 12,
        };
        assert!(!stats.is_success());
    }
}
