//! Question-to-answer pipeline
//!
//! One call = one tunnel, one warehouse connection, one synthesis. The
//! tunnel is closed exactly once on every exit path after it was opened.

use crate::config::AppConfig;
use crate::db::{resolve_current_table, PgWarehouseConnector, Warehouse, WarehouseConnector};
use crate::error::{QueryError, Result};
use crate::llm::LlmClient;
use crate::prompts;
use crate::schema_context::build_context;
use crate::shaper::{shape, Table};
use crate::synthesizer::{LlmSqlSynthesizer, QuerySynthesizer, SynthesisRequest};
use crate::tunnel::{ChannelOpener, SshChannelOpener};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// What the service returns for a question
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub query_string: String,
    pub output_df: Table,
    pub question: String,
    pub query: String,
}

impl Answer {
    pub fn new(question: &str, sql: &str, output_df: Table) -> Self {
        Self {
            query_string: format!("Question: \n{}\n\nQuery: \n{}\n", question, sql),
            output_df,
            question: question.to_string(),
            query: sql.to_string(),
        }
    }
}

pub struct QueryPipeline {
    channel: Arc<dyn ChannelOpener>,
    connector: Arc<dyn WarehouseConnector>,
    synthesizer: Arc<dyn QuerySynthesizer>,
    dictionary_path: PathBuf,
    permits: Semaphore,
}

impl QueryPipeline {
    pub fn new(
        channel: Arc<dyn ChannelOpener>,
        connector: Arc<dyn WarehouseConnector>,
        synthesizer: Arc<dyn QuerySynthesizer>,
        dictionary_path: PathBuf,
        max_concurrent_queries: usize,
    ) -> Self {
        Self {
            channel,
            connector,
            synthesizer,
            dictionary_path,
            permits: Semaphore::new(max_concurrent_queries.max(1)),
        }
    }

    /// Production wiring: SSH tunnel, Postgres warehouse, LLM synthesizer.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let llm = LlmClient::new(&config.llm)?;
        let synthesizer = LlmSqlSynthesizer::new(Arc::new(llm)).with_schemas(config.database.schemas());
        Ok(Self::new(
            Arc::new(SshChannelOpener::new(config.tunnel.clone())),
            Arc::new(PgWarehouseConnector::new(config.database.clone())),
            Arc::new(synthesizer),
            config.dictionary_path.clone(),
            config.max_concurrent_queries,
        ))
    }

    /// Answer one natural-language question.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        // Bounds how many tunnels exist at once
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| QueryError::Channel(format!("Pipeline unavailable: {}", e)))?;

        let mut session = self.channel.open().await?;
        let outcome = self.answer_through(question, session.local_addr()).await;
        if let Err(e) = session.close().await {
            warn!(code = e.kind(), "Failed to close tunnel: {}", e);
        }
        outcome
    }

    async fn answer_through(&self, question: &str, local_addr: SocketAddr) -> Result<Answer> {
        let warehouse = self.connector.connect(local_addr).await?;
        let outcome = self.answer_with(question, warehouse.as_ref()).await;
        warehouse.close().await;
        outcome
    }

    async fn answer_with(&self, question: &str, warehouse: &dyn Warehouse) -> Result<Answer> {
        let table = resolve_current_table(warehouse).await?;
        let context = build_context(&table, &self.dictionary_path)?;
        let instructions = prompts::instruction_prompt(&table);

        let request = SynthesisRequest {
            question,
            table: &table,
            instructions: &instructions,
            context: &context,
        };
        let response = self.synthesizer.synthesize(&request, warehouse).await?;

        let output_df = shape(&response.rows, &response.col_keys);
        let answer = Answer::new(question, &response.sql, output_df);
        info!("{}", answer.query_string);
        info!(table = %table, rows = answer.output_df.row_count(), "Question answered");
        Ok(answer)
    }
}
