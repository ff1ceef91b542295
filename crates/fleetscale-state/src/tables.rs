//! redb table definitions for the local backend.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Composite keys use `|` as separator so prefix scans select one node or
//! one metric series.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Node records keyed by `{node_id}`.
pub const NODES: JsonTable = TableDefinition::new("nodes");

/// Target-group members keyed by `{group}|{node_id}`.
pub const TARGETS: JsonTable = TableDefinition::new("targets");

/// Utilization samples keyed by `{node_id}|{namespace}/{name}|{millis:020}`.
pub const DATAPOINTS: JsonTable = TableDefinition::new("datapoints");

/// Custom metrics keyed by `{namespace}/{name}|{millis:020}|{uuid}`.
pub const PUBLISHED: JsonTable = TableDefinition::new("published");

/// Delivered alerts keyed by `{millis:020}|{uuid}`.
pub const ALERTS: JsonTable = TableDefinition::new("alerts");

/// Dashboard definitions keyed by `{name}`.
pub const DASHBOARDS: JsonTable = TableDefinition::new("dashboards");

/// Tick leases keyed by lease name.
pub const LEASES: JsonTable = TableDefinition::new("leases");

pub const ALL: [JsonTable; 7] = [NODES, TARGETS, DATAPOINTS, PUBLISHED, ALERTS, DASHBOARDS, LEASES];
