// ABOUTME: Record normalization from raw tracked changes to portable queue messages
// ABOUTME: Attaches routing, provenance, and the cross-installation global identity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit of replication: a table and the column that identifies its rows.
///
/// Static configuration, immutable for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub table_name: String,
    pub id_column: String,
}

/// Change-tracking operation tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One changed row as returned by the change reader.
///
/// `columns` carries the full current row contents keyed by column name;
/// database NULL is an explicit JSON null, distinguishable from a column
/// that is absent entirely. Deleted rows carry null for every non-id
/// column. Ephemeral, never persisted.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub op: ChangeOp,
    pub change_version: i64,
    pub row_id: String,
    pub columns: serde_json::Map<String, serde_json::Value>,
}

/// Identifies the installation publishing into the shared queue.
///
/// Both fields are required configuration; an empty value is rejected at
/// startup, so normalization itself never fails per record.
#[derive(Debug, Clone, Default)]
pub struct Provenance {
    pub source_database: String,
    pub location_code: String,
}

/// The wire message handed to the publisher, serialized as camelCase JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub source_database: String,
    pub location_code: String,
    pub table_name: String,
    pub operation: ChangeOp,
    pub change_version: i64,
    pub sync_timestamp: DateTime<Utc>,
    pub global_id: String,
    pub column_values: serde_json::Map<String, serde_json::Value>,
}

/// Build the cross-installation deduplication key for a row.
///
/// Deterministic and unique per (location, table, row id): every
/// installation publishing into the same queue produces non-colliding ids,
/// and re-delivery of the same change reproduces the same id so consumers
/// can discard duplicates keyed on global id + change version.
pub fn global_id(location_code: &str, table_name: &str, row_id: &str) -> String {
    format!("{}_{}_{}", location_code, table_name, row_id)
}

/// Convert a raw changed row into a portable queue message.
pub fn normalize(table: &TableSpec, record: &ChangeRecord, provenance: &Provenance) -> SyncMessage {
    SyncMessage {
        source_database: provenance.source_database.clone(),
        location_code: provenance.location_code.clone(),
        table_name: table.table_name.clone(),
        operation: record.op,
        change_version: record.change_version,
        sync_timestamp: Utc::now(),
        global_id: global_id(&provenance.location_code, &table.table_name, &record.row_id),
        column_values: record.columns.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employees() -> TableSpec {
        TableSpec {
            table_name: "employees".to_string(),
            id_column: "employee_id".to_string(),
        }
    }

    fn provenance() -> Provenance {
        Provenance {
            source_database: "erp_main".to_string(),
            location_code: "MAD01".to_string(),
        }
    }

    #[test]
    fn test_global_id_is_deterministic() {
        let a = global_id("MAD01", "employees", "42");
        let b = global_id("MAD01", "employees", "42");
        assert_eq!(a, b);
        assert_eq!(a, "MAD01_employees_42");
    }

    #[test]
    fn test_global_id_distinguishes_rows_and_locations() {
        assert_ne!(
            global_id("MAD01", "employees", "42"),
            global_id("MAD01", "employees", "43")
        );
        assert_ne!(
            global_id("MAD01", "employees", "42"),
            global_id("BCN02", "employees", "42")
        );
    }

    #[test]
    fn test_normalize_carries_provenance_and_payload() {
        let mut columns = serde_json::Map::new();
        columns.insert("employee_id".to_string(), serde_json::json!(42));
        columns.insert("name".to_string(), serde_json::json!("Ada"));
        columns.insert("manager_id".to_string(), serde_json::Value::Null);

        let record = ChangeRecord {
            op: ChangeOp::Update,
            change_version: 9,
            row_id: "42".to_string(),
            columns,
        };

        let msg = normalize(&employees(), &record, &provenance());
        assert_eq!(msg.source_database, "erp_main");
        assert_eq!(msg.location_code, "MAD01");
        assert_eq!(msg.table_name, "employees");
        assert_eq!(msg.operation, ChangeOp::Update);
        assert_eq!(msg.change_version, 9);
        assert_eq!(msg.global_id, "MAD01_employees_42");
        // DB null stays an explicit null, not a missing key
        assert!(msg.column_values.contains_key("manager_id"));
        assert_eq!(msg.column_values["manager_id"], serde_json::Value::Null);
    }

    #[test]
    fn test_deleted_row_still_gets_a_valid_global_id() {
        let mut columns = serde_json::Map::new();
        columns.insert("employee_id".to_string(), serde_json::json!("42"));
        columns.insert("name".to_string(), serde_json::Value::Null);

        let record = ChangeRecord {
            op: ChangeOp::Delete,
            change_version: 11,
            row_id: "42".to_string(),
            columns,
        };

        let msg = normalize(&employees(), &record, &provenance());
        assert_eq!(msg.operation, ChangeOp::Delete);
        assert_eq!(msg.global_id, "MAD01_employees_42");
        assert_eq!(msg.column_values["name"], serde_json::Value::Null);
    }

    #[test]
    fn test_wire_format_uses_camel_case() {
        let record = ChangeRecord {
            op: ChangeOp::Insert,
            change_version: 1,
            row_id: "1".to_string(),
            columns: serde_json::Map::new(),
        };
        let msg = normalize(&employees(), &record, &provenance());
        let value = serde_json::to_value(&msg).unwrap();
        let obj = value.as_object().unwrap();

        for key in [
            "sourceDatabase",
            "locationCode",
            "tableName",
            "operation",
            "changeVersion",
            "syncTimestamp",
            "globalId",
            "columnValues",
        ] {
            assert!(obj.contains_key(key), "missing key {}", key);
        }
        assert_eq!(obj["operation"], "insert");
    }
}
