use anyhow::Result;
use rusqlite::params;

use super::Store;
use super::types::ChatMessageRecord;

impl Store {
    /// Append-only; ordering within a chat follows insertion.
    pub async fn append_chat_message(&self, chat_id: &str, msg: &ChatMessageRecord) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO chat_messages (chat_id, role, content, request_id, error, chart_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chat_id,
                msg.role,
                msg.content,
                msg.request_id,
                msg.error as i64,
                msg.chart_id,
                msg.created_at
            ],
        )?;
        Ok(())
    }

    pub async fn list_chat_messages(&self, chat_id: &str) -> Result<Vec<ChatMessageRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT role, content, created_at, request_id, error, chart_id
             FROM chat_messages WHERE chat_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok(ChatMessageRecord {
                role: row.get(0)?,
                content: row.get(1)?,
                created_at: row.get(2)?,
                request_id: row.get(3)?,
                error: row.get::<_, i64>(4)? != 0,
                chart_id: row.get(5)?,
            })
        })?;
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

    #[tokio::test]
    async fn messages_come_back_in_append_order() {
        let store = Store::open_in_memory().expect("store");
        for (i, content) in ["first", "second"].iter().enumerate() {
            store
                .append_chat_message(
                    "c1",
                    &ChatMessageRecord {
                        role: "assistant".to_string(),
                        content: content.to_string(),
                        created_at: 100 - i as i64,
                        request_id: Some("r1".to_string()),
                        error: i == 1,
                        chart_id: None,
                    },
                )
                .await
                .unwrap();
        }
        let msgs = store.list_chat_messages("c1").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "first");
        assert!(msgs[1].error);
        assert!(store.list_chat_messages("c2").await.unwrap().is_empty());
    }
}
