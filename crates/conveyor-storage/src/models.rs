// Database rows (internal, converted at the store boundary)

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use conveyor_core::DataMap;

/// Workflow instance row; data is a JSON column, timestamps are RFC 3339
/// text with nanosecond precision.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowInstanceRow {
    pub id: String,
    pub workflow_type: String,
    pub current_state: String,
    pub previous_state: Option<String>,
    pub data: String,
    pub start_time: String,
    pub last_updated: String,
    pub completed: bool,
    pub error: Option<String>,
}

/// Resource row keyed by (resource_type, id)
#[derive(Debug, Clone, FromRow)]
pub struct ResourceRow {
    pub resource_type: String,
    pub id: String,
    pub data: String,
    pub state: Option<String>,
    pub last_update: String,
}

/// User row keyed by id with unique email
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub data: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Public user record; `data` carries the open attribute map (PII fields
/// encrypted at rest).
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub data: DataMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
