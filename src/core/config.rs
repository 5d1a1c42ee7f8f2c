use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::confidence::ConfidenceWeights;

pub const DEFAULT_CONFIG_FILE: &str = "querydeck.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub store: StoreConfig,
    pub llm: LlmConfig,
    pub analysis: AnalysisConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally reachable base URL; queue signatures are bound to it.
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            public_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub publish_url: String,
    pub token: String,
    pub current_signing_key: String,
    pub next_signing_key: String,
    pub issuer: String,
    pub clock_tolerance_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "analysis".to_string(),
            publish_url: "https://qstash.upstash.io/v2/publish".to_string(),
            token: String::new(),
            current_signing_key: String::new(),
            next_signing_key: String::new(),
            issuer: "Upstash".to_string(),
            clock_tolerance_secs: 60,
        }
    }
}

impl QueueConfig {
    pub fn intake_path(&self) -> String {
        format!("/internal/process-{}", self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// `redis://…` selects the Redis store (requires the `cache` feature);
    /// empty keeps job snapshots in process memory.
    pub ephemeral_url: String,
    pub job_ttl_secs: u64,
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/querydeck.db"),
            ephemeral_url: String::new(),
            job_ttl_secs: 86_400,
            op_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub max_attempts: usize,
    pub row_limit: usize,
    pub min_answer_chars: usize,
    /// Wall-clock budget for one dataset statement.
    pub query_timeout_ms: u64,
    pub weights: ConfidenceWeights,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            row_limit: 500,
            min_answer_chars: 20,
            query_timeout_ms: 10_000,
            weights: ConfidenceWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `QUERYDECK_CONFIG` (or `querydeck.toml`), then overlay secrets from the environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var("QUERYDECK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub(crate) fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides: [(&str, &mut String); 6] = [
            (
                "QUERYDECK_CURRENT_SIGNING_KEY",
                &mut self.queue.current_signing_key,
            ),
            ("QUERYDECK_NEXT_SIGNING_KEY", &mut self.queue.next_signing_key),
            ("QUERYDECK_QUEUE_TOKEN", &mut self.queue.token),
            ("QUERYDECK_LLM_API_KEY", &mut self.llm.api_key),
            ("QUERYDECK_PUBLIC_URL", &mut self.server.public_url),
            ("QUERYDECK_REDIS_URL", &mut self.store.ephemeral_url),
        ];
        for (key, slot) in overrides {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = value;
            }
        }
    }
}
