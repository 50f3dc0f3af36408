// ABOUTME: Change reader for the PostgreSQL change-tracking ledger
// ABOUTME: Implements the watermark query and staleness-recovery protocol

use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};

use super::error::SyncError;
use super::normalize::{ChangeOp, ChangeRecord, TableSpec};

/// Source of tracked row changes for one table.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Fetch every change recorded after `since_version`, together with the
    /// version the watermark should advance to once those changes are
    /// durably published.
    async fn fetch_changes(
        &self,
        table: &TableSpec,
        since_version: i64,
    ) -> Result<FetchOutcome, SyncError>;
}

#[async_trait]
impl<T: ChangeSource + ?Sized> ChangeSource for std::sync::Arc<T> {
    async fn fetch_changes(
        &self,
        table: &TableSpec,
        since_version: i64,
    ) -> Result<FetchOutcome, SyncError> {
        (**self).fetch_changes(table, since_version).await
    }
}

/// Result of one change-tracking query.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The table is not registered for tracking. Recoverable: the cycle
    /// makes no progress for this table and warns.
    Disabled,
    /// `since_version` fell behind the retention floor; the changes in
    /// between can no longer be retrieved. The orchestrator applies the
    /// configured staleness policy.
    Stale { min_valid_version: i64 },
    /// Changes in `(since_version, new_version]`, possibly empty.
    Changes {
        records: Vec<ChangeRecord>,
        new_version: i64,
    },
}

/// Reads changes from a PostgreSQL source through its change-tracking
/// ledger.
///
/// PostgreSQL has no built-in change-tracking facility, so the source
/// database carries a small trigger-maintained schema, installed by the
/// operator:
///
/// ```sql
/// CREATE SEQUENCE sync_change_version;
///
/// CREATE TABLE sync_tracking (
///     table_name        TEXT PRIMARY KEY,
///     min_valid_version BIGINT NOT NULL DEFAULT 0
/// );
///
/// CREATE TABLE sync_changes (
///     version    BIGINT PRIMARY KEY DEFAULT nextval('sync_change_version'),
///     table_name TEXT NOT NULL,
///     operation  TEXT NOT NULL,   -- 'I' | 'U' | 'D'
///     row_id     TEXT NOT NULL
/// );
/// ```
///
/// Per-table AFTER INSERT/UPDATE/DELETE triggers append one `sync_changes`
/// row per modification. Retention pruning deletes old ledger rows and
/// raises `min_valid_version` accordingly; a watermark below that floor is
/// stale and reported as such.
///
/// A fresh connection is opened per fetch and dropped on every exit path;
/// connections are scoped to one table's step of one cycle.
pub struct PostgresChangeReader {
    database_url: String,
}

impl PostgresChangeReader {
    pub fn new(database_url: String) -> Self {
        Self { database_url }
    }
}

#[async_trait]
impl ChangeSource for PostgresChangeReader {
    async fn fetch_changes(
        &self,
        table: &TableSpec,
        since_version: i64,
    ) -> Result<FetchOutcome, SyncError> {
        let client = connect(&self.database_url).await?;

        // A missing registry row means tracking is not enabled for the table.
        let min_valid_version = match client
            .query_opt(
                "SELECT min_valid_version FROM sync_tracking WHERE table_name = $1",
                &[&table.table_name],
            )
            .await?
        {
            Some(row) => row.get::<_, i64>(0),
            None => return Ok(FetchOutcome::Disabled),
        };

        // Capture the upper bound before reading any rows: a row that changes
        // after this point belongs to the next cycle, never to a gap.
        let row = client
            .query_one("SELECT last_value, is_called FROM sync_change_version", &[])
            .await?;
        let current_version = if row.get::<_, bool>(1) {
            row.get::<_, i64>(0)
        } else {
            0
        };

        if since_version < min_valid_version {
            return Ok(FetchOutcome::Stale { min_valid_version });
        }

        if since_version >= current_version {
            return Ok(FetchOutcome::Changes {
                records: Vec::new(),
                new_version: current_version,
            });
        }

        let columns = table_columns(&client, &table.table_name).await?;

        // Ledger entries joined with the current row contents. Deleted rows
        // join to nothing and come back with a NULL payload. Identifiers are
        // validated at configuration time before they reach this query.
        let query = format!(
            "SELECT c.version, c.operation, c.row_id, \
                    CASE WHEN t.\"{id}\" IS NULL THEN NULL::jsonb ELSE to_jsonb(t) END AS row_data \
             FROM sync_changes c \
             LEFT JOIN \"{table}\" t ON (t.\"{id}\")::text = c.row_id \
             WHERE c.table_name = $1 AND c.version > $2 AND c.version <= $3 \
             ORDER BY c.version",
            table = table.table_name,
            id = table.id_column,
        );

        let rows = client
            .query(&query, &[&table.table_name, &since_version, &current_version])
            .await
            .map_err(|e| {
                SyncError::Reader(format!(
                    "failed to read changes for '{}': {}",
                    table.table_name, e
                ))
            })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(to_change_record(table, &columns, row)?);
        }

        Ok(FetchOutcome::Changes {
            records,
            new_version: current_version,
        })
    }
}

/// Verify the tracking schema exists before the first cycle.
pub async fn preflight(database_url: &str) -> Result<(), SyncError> {
    let client = connect(database_url)
        .await
        .map_err(|e| SyncError::Configuration(format!("cannot reach source database: {}", e)))?;

    let row = client
        .query_one(
            "SELECT to_regclass('sync_changes') IS NOT NULL \
                AND to_regclass('sync_tracking') IS NOT NULL \
                AND to_regclass('sync_change_version') IS NOT NULL",
            &[],
        )
        .await
        .map_err(|e| {
            SyncError::Configuration(format!("failed to inspect tracking schema: {}", e))
        })?;

    if !row.get::<_, bool>(0) {
        return Err(SyncError::Configuration(
            "change-tracking schema is missing on the source database; \
             install sync_changes, sync_tracking, and sync_change_version \
             (see the PostgresChangeReader documentation)"
                .to_string(),
        ));
    }

    Ok(())
}

async fn connect(database_url: &str) -> Result<Client, SyncError> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .map_err(|e| SyncError::Reader(format!("failed to connect to source database: {}", e)))?;

    // The connection task finishes when the client is dropped, which
    // releases the socket at the end of the fetch.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("Source connection closed: {}", e);
        }
    });

    Ok(client)
}

async fn table_columns(client: &Client, table: &str) -> Result<Vec<String>, SyncError> {
    let rows = client
        .query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&table],
        )
        .await
        .map_err(|e| SyncError::Reader(format!("failed to list columns for '{}': {}", table, e)))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

fn to_change_record(
    table: &TableSpec,
    columns: &[String],
    row: &Row,
) -> Result<ChangeRecord, SyncError> {
    let change_version: i64 = row.get("version");
    let op_tag: String = row.get("operation");
    let row_id: String = row.get("row_id");
    let op = parse_op_tag(&op_tag)
        .ok_or_else(|| {
            SyncError::Reader(format!(
                "unknown operation tag '{}' at version {}",
                op_tag, change_version
            ))
        })?;

    let row_data: Option<serde_json::Value> = row.get("row_data");
    let columns = match row_data {
        Some(serde_json::Value::Object(map)) => map,
        Some(other) => {
            return Err(SyncError::Reader(format!(
                "unexpected row payload for '{}' at version {}: {}",
                table.table_name, change_version, other
            )))
        }
        // Deleted rows join to nothing; every column becomes an explicit
        // null except the identifier, which the ledger still carries.
        None => null_columns(columns, &table.id_column, &row_id),
    };

    Ok(ChangeRecord {
        op,
        change_version,
        row_id,
        columns,
    })
}

fn parse_op_tag(tag: &str) -> Option<ChangeOp> {
    match tag {
        "I" => Some(ChangeOp::Insert),
        "U" => Some(ChangeOp::Update),
        "D" => Some(ChangeOp::Delete),
        _ => None,
    }
}

fn null_columns(
    columns: &[String],
    id_column: &str,
    row_id: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for column in columns {
        map.insert(column.clone(), serde_json::Value::Null);
    }
    map.insert(
        id_column.to_string(),
        serde_json::Value::String(row_id.to_string()),
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_op_tag() {
        assert_eq!(parse_op_tag("I"), Some(ChangeOp::Insert));
        assert_eq!(parse_op_tag("U"), Some(ChangeOp::Update));
        assert_eq!(parse_op_tag("D"), Some(ChangeOp::Delete));
        assert_eq!(parse_op_tag("X"), None);
        assert_eq!(parse_op_tag(""), None);
    }

    #[test]
    fn test_null_columns_keeps_the_identifier() {
        let columns = vec![
            "employee_id".to_string(),
            "name".to_string(),
            "salary".to_string(),
        ];
        let map = null_columns(&columns, "employee_id", "42");

        assert_eq!(map.len(), 3);
        assert_eq!(map["employee_id"], serde_json::json!("42"));
        assert_eq!(map["name"], serde_json::Value::Null);
        assert_eq!(map["salary"], serde_json::Value::Null);
    }
}
