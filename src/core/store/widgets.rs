use anyhow::{Result, anyhow};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::Store;
use super::types::WidgetRecord;
use crate::core::sql_guard::GuardedSql;

const WIDGET_COLUMNS: &str = "id, dashboard_id, title, widget_type, config_json, data_json, sql,
     layout_json, chat_id, is_configured, created_at, updated_at";

/// Grid columns a dashboard is laid out on.
const GRID_COLUMNS: i64 = 12;
const SLOT_WIDTH: i64 = 6;
const SLOT_HEIGHT: i64 = 4;

/// Fields needed to insert a widget. `sql` only accepts guarded text.
#[derive(Debug, Clone)]
pub struct NewWidget {
    pub id: String,
    pub dashboard_id: String,
    pub title: String,
    pub widget_type: String,
    pub config: Value,
    pub data: Option<Value>,
    pub sql: Option<GuardedSql>,
    pub layout: Option<Value>,
    pub chat_id: Option<String>,
    pub is_configured: bool,
}

/// Visual fields a formatting pass may change.
#[derive(Debug, Clone)]
pub struct WidgetVisual {
    pub title: String,
    pub widget_type: String,
    pub config: Value,
    pub data: Option<Value>,
}

fn json_column(idx: usize, raw: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn widget_from_row(row: &Row<'_>) -> rusqlite::Result<WidgetRecord> {
    let data_json: Option<String> = row.get(5)?;
    Ok(WidgetRecord {
        id: row.get(0)?,
        dashboard_id: row.get(1)?,
        title: row.get(2)?,
        widget_type: row.get(3)?,
        config: json_column(4, row.get(4)?)?,
        data: data_json.map(|d| json_column(5, d)).transpose()?,
        sql: row.get(6)?,
        layout: json_column(7, row.get(7)?)?,
        chat_id: row.get(8)?,
        is_configured: row.get::<_, i64>(9)? != 0,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Grid position for the `index`-th widget: two per row, top to bottom.
pub(crate) fn layout_slot(index: i64) -> Value {
    let per_row = GRID_COLUMNS / SLOT_WIDTH;
    serde_json::json!({
        "x": (index % per_row) * SLOT_WIDTH,
        "y": (index / per_row) * SLOT_HEIGHT,
        "w": SLOT_WIDTH,
        "h": SLOT_HEIGHT,
    })
}

impl Store {
    /// Insert a new widget. Without an explicit layout it takes the next free slot.
    pub async fn insert_widget(&self, widget: &NewWidget, now: i64) -> Result<WidgetRecord> {
        let db = self.db.lock().await;
        let layout = match &widget.layout {
            Some(layout) => layout.clone(),
            None => {
                let count: i64 = db.query_row(
                    "SELECT COUNT(*) FROM widgets WHERE dashboard_id = ?1",
                    params![widget.dashboard_id],
                    |row| row.get(0),
                )?;
                layout_slot(count)
            }
        };
        let data_json = widget.data.as_ref().map(serde_json::to_string).transpose()?;
        db.execute(
            "INSERT INTO widgets (id, dashboard_id, title, widget_type, config_json, data_json, sql,
                                  layout_json, chat_id, is_configured, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                widget.id,
                widget.dashboard_id,
                widget.title,
                widget.widget_type,
                serde_json::to_string(&widget.config)?,
                data_json,
                widget.sql.as_ref().map(GuardedSql::as_str),
                serde_json::to_string(&layout)?,
                widget.chat_id,
                widget.is_configured as i64,
                now
            ],
        )?;
        let rec = db.query_row(
            &format!("SELECT {} FROM widgets WHERE id = ?1", WIDGET_COLUMNS),
            params![widget.id],
            widget_from_row,
        )?;
        Ok(rec)
    }

    /// Replace the visual fields of an existing widget. Its query is left alone.
    pub async fn update_widget_visual(
        &self,
        widget_id: &str,
        visual: &WidgetVisual,
        now: i64,
    ) -> Result<WidgetRecord> {
        let db = self.db.lock().await;
        let data_json = visual.data.as_ref().map(serde_json::to_string).transpose()?;
        let rows = db.execute(
            "UPDATE widgets SET title = ?2, widget_type = ?3, config_json = ?4,
                    data_json = COALESCE(?5, data_json), is_configured = 1, updated_at = ?6
             WHERE id = ?1",
            params![
                widget_id,
                visual.title,
                visual.widget_type,
                serde_json::to_string(&visual.config)?,
                data_json,
                now
            ],
        )?;
        if rows == 0 {
            return Err(anyhow!("Widget '{}' not found", widget_id));
        }
        let rec = db.query_row(
            &format!("SELECT {} FROM widgets WHERE id = ?1", WIDGET_COLUMNS),
            params![widget_id],
            widget_from_row,
        )?;
        Ok(rec)
    }

    pub async fn get_widget(&self, widget_id: &str) -> Result<Option<WidgetRecord>> {
        let db = self.db.lock().await;
        let rec = db
            .query_row(
                &format!("SELECT {} FROM widgets WHERE id = ?1", WIDGET_COLUMNS),
                params![widget_id],
                widget_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    pub async fn list_widgets(&self, dashboard_id: &str) -> Result<Vec<WidgetRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM widgets WHERE dashboard_id = ?1 ORDER BY created_at, id",
            WIDGET_COLUMNS
        ))?;
        let rows = stmt.query_map(params![dashboard_id], widget_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_widget(id: &str, sql: Option<&str>) -> NewWidget {
        NewWidget {
            id: id.to_string(),
            dashboard_id: "d1".to_string(),
            title: "Total sales".to_string(),
            widget_type: "bar".to_string(),
            config: serde_json::json!({ "xKey": "region" }),
            data: Some(serde_json::json!([{ "region": "north", "total": 1 }])),
            sql: sql.map(|s| GuardedSql::from_stored(s.to_string())),
            layout: None,
            chat_id: Some("c1".to_string()),
            is_configured: true,
        }
    }

    #[test]
    fn slots_fill_two_per_row() {
        assert_eq!(layout_slot(0)["x"], 0);
        assert_eq!(layout_slot(1)["x"], 6);
        assert_eq!(layout_slot(2)["y"], 4);
        assert_eq!(layout_slot(2)["x"], 0);
    }

    #[tokio::test]
    async fn insert_assigns_successive_slots_and_round_trips_json() {
        let store = Store::open_in_memory().expect("store");
        let a = store
            .insert_widget(&new_widget("w1", Some("SELECT 1 FROM csv_data")), 10)
            .await
            .unwrap();
        let b = store.insert_widget(&new_widget("w2", None), 11).await.unwrap();
        assert_eq!(a.layout, layout_slot(0));
        assert_eq!(b.layout, layout_slot(1));
        assert_eq!(a.sql.as_deref(), Some("SELECT 1 FROM csv_data"));
        assert_eq!(b.sql, None);
        assert_eq!(a.data, new_widget("w1", None).data);

        let listed = store.list_widgets("d1").await.unwrap();
        assert_eq!(listed.iter().map(|w| w.id.as_str()).collect::<Vec<_>>(), ["w1", "w2"]);
    }

    #[tokio::test]
    async fn visual_update_keeps_query_and_existing_data() {
        let store = Store::open_in_memory().expect("store");
        let original = store
            .insert_widget(&new_widget("w1", Some("SELECT 1 FROM csv_data")), 10)
            .await
            .unwrap();
        let updated = store
            .update_widget_visual(
                "w1",
                &WidgetVisual {
                    title: "Sales".to_string(),
                    widget_type: "line".to_string(),
                    config: serde_json::json!({ "color": "red" }),
                    data: None,
                },
                20,
            )
            .await
            .unwrap();
        assert_eq!(updated.widget_type, "line");
        assert_eq!(updated.sql, original.sql);
        assert_eq!(updated.data, original.data);
        assert_eq!(updated.updated_at, 20);

        assert!(
            store
                .update_widget_visual(
                    "missing",
                    &WidgetVisual {
                        title: String::new(),
                        widget_type: "bar".to_string(),
                        config: Value::Null,
                        data: None,
                    },
                    30,
                )
                .await
                .is_err()
        );
    }
}
