use serde::Deserialize;

use crate::core::analysis::{AnalysisRequest, Routing};

/// Task payload as delivered by the queue. Decoded once, then normalized
/// into an [`AnalysisRequest`].
#[derive(Debug, Default, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: Option<String>,
    pub chat_id: Option<String>,
    pub request_id: Option<String>,
    pub dashboard_id: Option<String>,
    pub file_id: Option<String>,
    pub user_prompt: Option<String>,
    pub user_id: Option<String>,
    pub context_widget_ids: Option<Vec<String>>,
    pub target_widget_type: Option<String>,
    pub received_at: Option<serde_json::Value>,
}

/// A decoded task plus the owner named by the producer, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTask {
    pub request: AnalysisRequest,
    pub user_id: Option<String>,
}

fn present(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl TaskEnvelope {
    pub fn parse(raw_body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw_body)
    }

    /// Validate the field set for the routing mode. `dashboard_id` selects the
    /// dashboard route; otherwise `file_id` is required. The error lists every
    /// missing field.
    pub fn decode(self, message_id: Option<&str>) -> Result<DecodedTask, Vec<&'static str>> {
        let chat_id = present(&self.chat_id);
        let request_id = present(&self.request_id);
        let dashboard_id = present(&self.dashboard_id);
        let file_id = present(&self.file_id);
        let user_prompt = present(&self.user_prompt);

        let mut missing = Vec::new();
        if chat_id.is_none() {
            missing.push("chat_id");
        }
        if request_id.is_none() {
            missing.push("request_id");
        }
        if dashboard_id.is_none() && file_id.is_none() {
            missing.push("file_id");
        }
        if user_prompt.is_none() {
            missing.push("user_prompt");
        }

        let (Some(chat_id), Some(request_id), Some(user_prompt)) = (chat_id, request_id, user_prompt)
        else {
            return Err(missing);
        };
        let routing = match (dashboard_id, file_id) {
            (Some(dashboard_id), _) => Routing::Dashboard { dashboard_id },
            (None, Some(file_id)) => Routing::File { file_id },
            (None, None) => return Err(missing),
        };

        let job_id = present(&self.task_id)
            .or_else(|| {
                message_id
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| request_id.clone());

        Ok(DecodedTask {
            request: AnalysisRequest {
                job_id,
                chat_id,
                request_id,
                routing,
                user_prompt,
                context_widget_ids: self
                    .context_widget_ids
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|id| !id.trim().is_empty())
                    .collect(),
                target_widget_type: present(&self.target_widget_type),
            },
            user_id: present(&self.user_id),
        })
    }
}
