pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod schema_context;
pub mod shaper;
pub mod synthesizer;
pub mod tunnel;

pub use error::{QueryError, Result};
pub use pipeline::{Answer, QueryPipeline};
