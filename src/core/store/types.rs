use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::jobs::JobStatus;

/// Durable job row. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub user_id: String,
    pub dashboard_id: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub attempts: i64,
    pub queue_time_ms: Option<i64>,
    pub processing_time_ms: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardRecord {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub refresh_reason: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct DatasetRecord {
    pub id: String,
    pub dashboard_id: Option<String>,
    pub file_id: Option<String>,
    pub db_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetRecord {
    pub id: String,
    pub dashboard_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub widget_type: String,
    pub config: Value,
    pub data: Option<Value>,
    pub sql: Option<String>,
    pub layout: Value,
    pub chat_id: Option<String>,
    pub is_configured: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessageRecord {
    pub role: String,
    pub content: String,
    pub created_at: i64,
    pub request_id: Option<String>,
    pub error: bool,
    pub chart_id: Option<String>,
}
