//! Widget persistence and dashboard refresh notification.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::store::types::WidgetRecord;
use crate::core::store::{NewWidget, Store, WidgetVisual, now_ms};

/// What happened to a widget during one analysis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetChange {
    Created,
    Updated,
}

impl WidgetChange {
    /// Refresh reason recorded on the dashboard watermark.
    pub fn refresh_reason(self) -> &'static str {
        match self {
            WidgetChange::Created => "widget_created",
            WidgetChange::Updated => "widget_updated",
        }
    }
}

pub async fn create_widget(store: &Store, widget: &NewWidget) -> Result<WidgetRecord> {
    let rec = store.insert_widget(widget, now_ms()).await?;
    info!(
        "Created widget {} ({}) on dashboard {}",
        rec.id, rec.widget_type, rec.dashboard_id
    );
    Ok(rec)
}

pub async fn update_widget(
    store: &Store,
    widget_id: &str,
    visual: &WidgetVisual,
) -> Result<WidgetRecord> {
    let rec = store.update_widget_visual(widget_id, visual, now_ms()).await?;
    info!("Updated widget {} on dashboard {}", rec.id, rec.dashboard_id);
    Ok(rec)
}

/// Best-effort: the widget write already succeeded, so a failed bump is only logged.
pub async fn trigger_refresh(store: &Store, dashboard_id: &str, reason: &str) {
    match store
        .bump_dashboard_watermark(dashboard_id, reason, now_ms())
        .await
    {
        Ok(true) => info!("Dashboard {} refresh triggered ({})", dashboard_id, reason),
        Ok(false) => warn!(
            "Dashboard {} not found, refresh ({}) skipped",
            dashboard_id, reason
        ),
        Err(e) => warn!("Dashboard {} refresh ({}) failed: {}", dashboard_id, reason, e),
    }
}
