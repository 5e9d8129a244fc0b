// Library interface for dailyreport modules
// This allows tests and the binary to import modules

pub mod app;
pub mod article;
pub mod build_lock;
pub mod cache;
pub mod clock;
pub mod compose;
pub mod dedupe;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod render;
pub mod scraping;
pub mod sources;
pub mod storage;
