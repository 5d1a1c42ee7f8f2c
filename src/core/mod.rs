pub mod analysis;
pub mod confidence;
pub mod config;
pub mod dataset;
pub mod intake;
pub mod jobs;
pub mod llm;
pub mod queue;
pub mod signature;
pub mod sql_guard;
pub mod store;
pub mod widgets;
