//! Test doubles for the pipeline seams

#![allow(dead_code)]

use async_trait::async_trait;
use hts_query::db::{ColumnInfo, PeriodRecord, RawRows, Warehouse, WarehouseConnector};
use hts_query::error::{QueryError, Result};
use hts_query::pipeline::QueryPipeline;
use hts_query::synthesizer::{QuerySynthesizer, SynthesisRequest, SynthesisResponse};
use hts_query::tunnel::{ChannelOpener, ChannelSession};
use serde_json::{json, Value};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

pub const PREP_QUESTION: &str = "What is the proportion of clients offered Prep who accepted Prep";

pub const PREP_SQL: &str = "SELECT SUM(CASE WHEN prep_offered = 'Yes' THEN 1 ELSE 0 END) AS TotalOfferedPrep, \
SUM(CASE WHEN prep_offered = 'Yes' AND prep_accepted = 'Yes' THEN 1 ELSE 0 END) AS TotalAcceptedPrep, \
SUM(CASE WHEN prep_offered = 'Yes' AND prep_accepted = 'Yes' THEN 1 ELSE 0 END) * 100.0 / \
SUM(CASE WHEN prep_offered = 'Yes' THEN 1 ELSE 0 END) AS ProportionAcceptedPrep \
FROM expanded_hts_weekly_2024w32;";

#[derive(Default)]
pub struct Counters {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub warehouse_closes: AtomicUsize,
}

impl Counters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn warehouse_closes(&self) -> usize {
        self.warehouse_closes.load(Ordering::SeqCst)
    }
}

pub struct FakeChannel {
    pub counters: Arc<Counters>,
    pub fail_open: bool,
}

struct FakeSession {
    counters: Arc<Counters>,
}

#[async_trait]
impl ChannelSession for FakeSession {
    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:6543".parse().unwrap()
    }

    async fn close(&mut self) -> Result<()> {
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ChannelOpener for FakeChannel {
    async fn open(&self) -> Result<Box<dyn ChannelSession>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(QueryError::Channel("SSH authentication rejected for user analyst".to_string()));
        }
        Ok(Box::new(FakeSession {
            counters: self.counters.clone(),
        }))
    }
}

pub struct FakeConnector {
    pub counters: Arc<Counters>,
    pub periods: Vec<PeriodRecord>,
    pub fail_connect: bool,
}

struct FakeWarehouse {
    counters: Arc<Counters>,
    periods: Vec<PeriodRecord>,
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn fetch_periods(&self) -> Result<Vec<PeriodRecord>> {
        Ok(self.periods.clone())
    }

    async fn describe_table(&self, _table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(vec![
            ColumnInfo { name: "prep_offered".to_string(), data_type: "text".to_string() },
            ColumnInfo { name: "prep_accepted".to_string(), data_type: "text".to_string() },
        ])
    }

    async fn execute(&self, _sql: &str) -> Result<RawRows> {
        Err(QueryError::Database("not used by canned synthesizer".to_string()))
    }

    async fn close(&self) {
        self.counters.warehouse_closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl WarehouseConnector for FakeConnector {
    async fn connect(&self, local_addr: SocketAddr) -> Result<Box<dyn Warehouse>> {
        if self.fail_connect {
            return Err(QueryError::Database(format!(
                "Failed to connect to lamisplus_ods_dwh through {}: password authentication failed",
                local_addr
            )));
        }
        Ok(Box::new(FakeWarehouse {
            counters: self.counters.clone(),
            periods: self.periods.clone(),
        }))
    }
}

/// What the synthesizer was asked
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub question: String,
    pub table: String,
    pub instructions: String,
    pub context: String,
}

/// Returns fixed SQL and rows, or a fixed failure
pub struct CannedSynthesizer {
    pub response: std::result::Result<SynthesisResponse, String>,
    pub seen: Mutex<Vec<SeenRequest>>,
}

impl CannedSynthesizer {
    pub fn returning(sql: &str, col_keys: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            response: Ok(SynthesisResponse {
                sql: sql.to_string(),
                rows,
                col_keys: col_keys.iter().map(|k| k.to_string()).collect(),
            }),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn prep() -> Self {
        Self::returning(
            PREP_SQL,
            &["totalofferedprep", "totalacceptedprep", "proportionacceptedprep"],
            vec![vec![json!(250), json!(180), json!(72.0)]],
        )
    }
}

#[async_trait]
impl QuerySynthesizer for CannedSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        _warehouse: &dyn Warehouse,
    ) -> Result<SynthesisResponse> {
        self.seen.lock().unwrap().push(SeenRequest {
            question: request.question.to_string(),
            table: request.table.to_string(),
            instructions: request.instructions.to_string(),
            context: request.context.to_string(),
        });
        self.response.clone().map_err(QueryError::Synthesis)
    }
}

pub fn prep_dictionary() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        b"parent,name,description\n\
prep_,offered,Was the client offered PrEP (Yes/No)\n\
prep_,accepted,Did the client accept PrEP (Yes/No)\n\
,finalhivtestresult,Final HIV test result\n",
    )
    .unwrap();
    file
}

pub fn current_periods() -> Vec<PeriodRecord> {
    vec![
        PeriodRecord::new("2024W31", false),
        PeriodRecord::new("2024W32", true),
    ]
}

pub struct Harness {
    pub pipeline: Arc<QueryPipeline>,
    pub counters: Arc<Counters>,
    pub synthesizer: Arc<CannedSynthesizer>,
    pub dictionary: NamedTempFile,
}

pub fn harness(periods: Vec<PeriodRecord>, synthesizer: CannedSynthesizer, fail_open: bool) -> Harness {
    build_harness(periods, synthesizer, fail_open, false)
}

/// Tunnel opens, but the warehouse login behind it is refused
pub fn harness_failing_connect(synthesizer: CannedSynthesizer) -> Harness {
    build_harness(current_periods(), synthesizer, false, true)
}

fn build_harness(
    periods: Vec<PeriodRecord>,
    synthesizer: CannedSynthesizer,
    fail_open: bool,
    fail_connect: bool,
) -> Harness {
    let counters = Arc::new(Counters::default());
    let synthesizer = Arc::new(synthesizer);
    let dictionary = prep_dictionary();
    let pipeline = Arc::new(QueryPipeline::new(
        Arc::new(FakeChannel {
            counters: counters.clone(),
            fail_open,
        }),
        Arc::new(FakeConnector {
            counters: counters.clone(),
            periods,
            fail_connect,
        }),
        synthesizer.clone(),
        dictionary.path().to_path_buf(),
        2,
    ));
    Harness {
        pipeline,
        counters,
        synthesizer,
        dictionary,
    }
}
