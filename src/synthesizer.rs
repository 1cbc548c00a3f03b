//! Query synthesis
//!
//! Turns a question plus schema context into SQL, checks the SQL only reads
//! the resolved table, and runs it on the warehouse.

use crate::db::warehouse::{ColumnInfo, Warehouse};
use crate::error::{QueryError, Result};
use crate::llm::CompletionModel;
use crate::prompts;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, ObjectName, Query, SetExpr, Statement, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// Everything the synthesizer needs for one question
#[derive(Debug, Clone)]
pub struct SynthesisRequest<'a> {
    pub question: &'a str,
    /// Resolved weekly table; the only table the SQL may read
    pub table: &'a str,
    /// Instruction prompt with the table name already substituted
    pub instructions: &'a str,
    /// Narrative plus data dictionary
    pub context: &'a str,
}

/// Generated SQL and the rows it produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SynthesisResponse {
    pub sql: String,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub col_keys: Vec<String>,
}

#[async_trait]
pub trait QuerySynthesizer: Send + Sync {
    async fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        warehouse: &dyn Warehouse,
    ) -> Result<SynthesisResponse>;
}

/// Synthesizer backed by a language model
pub struct LlmSqlSynthesizer {
    model: Arc<dyn CompletionModel>,
    schemas: Vec<String>,
}

impl LlmSqlSynthesizer {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self {
            model,
            schemas: Vec::new(),
        }
    }

    /// Schemas a qualified reference to the resolved table may name
    pub fn with_schemas(mut self, schemas: Vec<String>) -> Self {
        self.schemas = schemas;
        self
    }
}

#[async_trait]
impl QuerySynthesizer for LlmSqlSynthesizer {
    async fn synthesize(
        &self,
        request: &SynthesisRequest<'_>,
        warehouse: &dyn Warehouse,
    ) -> Result<SynthesisResponse> {
        let columns = warehouse.describe_table(request.table).await?;
        let schema = prompts::table_schema(&describe_columns(request.table, &columns), request.context);
        let question = prompts::question_prompt(request.question, request.instructions);
        let prompt = prompts::text_to_sql_prompt(&schema, &question);
        debug!(table = %request.table, prompt_chars = prompt.len(), "Requesting SQL");

        let completion = self.model.complete(&prompt, &[prompts::STOP_SEQUENCE]).await?;
        let sql = extract_sql(&completion).ok_or_else(|| {
            QueryError::Synthesis(format!("Model response contained no SQL: {:?}", completion.trim()))
        })?;
        validate_sql(&sql, request.table, &self.schemas)?;
        info!(sql = %sql, "Generated SQL");

        let raw = warehouse.execute(&sql).await?;
        Ok(SynthesisResponse {
            sql,
            rows: raw.rows,
            col_keys: raw.col_keys,
        })
    }
}

/// Column listing in the form `Table 't' has columns: a (text), b (integer).`
pub fn describe_columns(table: &str, columns: &[ColumnInfo]) -> String {
    let listed: Vec<String> = columns
        .iter()
        .map(|c| format!("{} ({})", c.name, c.data_type))
        .collect();
    format!("Table '{}' has columns: {}.", table, listed.join(", "))
}

fn code_fence() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)\s*```").expect("valid regex"))
}

/// Pull the SQL out of a model completion.
///
/// Takes the text after `SQLQuery:` when present, cuts it at `SQLResult:`,
/// and unwraps a markdown code fence.
pub fn extract_sql(completion: &str) -> Option<String> {
    let mut text = completion;
    if let Some(start) = text.find("SQLQuery:") {
        text = &text[start + "SQLQuery:".len()..];
    }
    if let Some(end) = text.find("SQLResult:") {
        text = &text[..end];
    }

    let text = text.trim();
    let sql = match code_fence().captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text.trim_matches('`').trim(),
    };

    if sql.is_empty() {
        None
    } else {
        Some(sql.to_string())
    }
}

/// Reject anything other than a single read-only query over `table`.
///
/// `schemas` are the schemas a qualified reference to `table` may name.
pub fn validate_sql(sql: &str, table: &str, schemas: &[String]) -> Result<()> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| QueryError::Synthesis(format!("Generated SQL does not parse: {}", e)))?;

    if statements.len() != 1 {
        return Err(QueryError::Synthesis(format!(
            "Expected one SQL statement, got {}",
            statements.len()
        )));
    }

    let query = match &statements[0] {
        Statement::Query(query) => query,
        _ => {
            return Err(QueryError::Synthesis(
                "Only read-only SELECT queries are allowed".to_string(),
            ))
        }
    };

    let mut check = SqlCheck {
        table: table.to_lowercase(),
        schemas: schemas.iter().map(|s| s.to_lowercase()).collect(),
        reads_table: false,
    };
    check.query(query, &[]).map_err(QueryError::Synthesis)?;
    if !check.reads_table {
        return Err(QueryError::Synthesis(format!("Generated SQL does not read {}", check.table)));
    }
    Ok(())
}

/// Function names the generated SQL may not call
fn is_forbidden_function(name: &str) -> bool {
    const PREFIXES: [&str; 3] = ["pg_", "lo_", "dblink"];
    const NAMES: [&str; 6] = ["set_config", "current_setting", "nextval", "setval", "currval", "txid_current"];
    PREFIXES.iter().any(|p| name.starts_with(p)) || NAMES.contains(&name) || name.contains("_to_xml")
}

/// True when nothing in `body` writes: no `INTO`, no data-modifying statement.
fn is_read_only(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => query.locks.is_empty() && is_read_only(&query.body),
        SetExpr::SetOperation { left, right, .. } => is_read_only(left) && is_read_only(right),
        SetExpr::Values(_) => true,
        _ => false,
    }
}

struct SqlCheck {
    table: String,
    schemas: Vec<String>,
    reads_table: bool,
}

impl SqlCheck {
    /// `scope` holds the CTE names visible to `query`. A CTE only sees the
    /// ones defined before it, plus itself under `WITH RECURSIVE`.
    fn query(&mut self, query: &Query, scope: &[String]) -> std::result::Result<(), String> {
        if !query.locks.is_empty() {
            return Err("Generated SQL must not lock rows".to_string());
        }

        let mut scope = scope.to_vec();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let name = cte.alias.name.value.to_lowercase();
                let mut inner = scope.clone();
                if with.recursive {
                    inner.push(name.clone());
                }
                self.query(&cte.query, &inner)?;
                scope.push(name);
            }
        }

        self.body(&query.body, &scope)?;
        for order_by in &query.order_by {
            self.visit(order_by, &scope)?;
        }
        if let Some(limit) = &query.limit {
            self.visit(limit, &scope)?;
        }
        if let Some(offset) = &query.offset {
            self.visit(&offset.value, &scope)?;
        }
        Ok(())
    }

    fn body(&mut self, body: &SetExpr, scope: &[String]) -> std::result::Result<(), String> {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    return Err("Generated SQL must not use SELECT ... INTO".to_string());
                }
                self.visit(&**select, scope)
            }
            SetExpr::Query(query) => self.query(query, scope),
            SetExpr::SetOperation { left, right, .. } => {
                self.body(left, scope)?;
                self.body(right, scope)
            }
            SetExpr::Values(values) => self.visit(values, scope),
            _ => Err("Generated SQL must not modify data".to_string()),
        }
    }

    fn visit<V: Visit>(&mut self, node: &V, scope: &[String]) -> std::result::Result<(), String> {
        let mut guard = Guard { check: self, scope };
        match node.visit(&mut guard) {
            ControlFlow::Break(reason) => Err(reason),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    fn relation(&mut self, relation: &ObjectName, scope: &[String]) -> bool {
        let parts: Vec<String> = relation.0.iter().map(|ident| ident.value.to_lowercase()).collect();
        let allowed = match parts.as_slice() {
            [name] if *name == self.table => true,
            [name] => return scope.contains(name),
            [schema, name] => *name == self.table && self.schemas.contains(schema),
            _ => false,
        };
        self.reads_table |= allowed;
        allowed
    }
}

/// Walks one clause with the CTE scope of its enclosing query
struct Guard<'a> {
    check: &'a mut SqlCheck,
    scope: &'a [String],
}

impl Visitor for Guard<'_> {
    type Break = String;

    // Subqueries share the enclosing scope, so they may not declare their own CTEs
    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<String> {
        if query.with.is_some() {
            return ControlFlow::Break("WITH is only allowed at the top of the query".to_string());
        }
        if !query.locks.is_empty() || !is_read_only(&query.body) {
            return ControlFlow::Break("Generated SQL must not modify data".to_string());
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<String> {
        if self.check.relation(relation, self.scope) {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(format!(
                "Generated SQL reads {} but only {} is allowed",
                relation, self.check.table
            ))
        }
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<String> {
        if let Expr::Function(function) = expr {
            let name = function
                .name
                .0
                .last()
                .map(|ident| ident.value.to_lowercase())
                .unwrap_or_default();
            if is_forbidden_function(&name) {
                return ControlFlow::Break(format!("Generated SQL calls {}", function.name));
            }
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::warehouse::{PeriodRecord, RawRows};
    use serde_json::json;
    use std::sync::Mutex;

    const TABLE: &str = "expanded_hts_weekly_2024w32";

    #[test]
    fn test_extract_plain_sql() {
        assert_eq!(
            extract_sql("SELECT COUNT(*) FROM t;").as_deref(),
            Some("SELECT COUNT(*) FROM t;")
        );
    }

    #[test]
    fn test_extract_after_marker_and_before_result() {
        let completion = "Question: how many?\nSQLQuery: SELECT COUNT(*) FROM t\nSQLResult: 42\nAnswer: 42";
        assert_eq!(extract_sql(completion).as_deref(), Some("SELECT COUNT(*) FROM t"));
    }

    #[test]
    fn test_extract_from_code_fence() {
        let completion = "SQLQuery: ```sql\nSELECT sex FROM t\n```";
        assert_eq!(extract_sql(completion).as_deref(), Some("SELECT sex FROM t"));
    }

    #[test]
    fn test_extract_nothing() {
        assert_eq!(extract_sql("SQLQuery:   "), None);
    }

    fn validate(sql: &str) -> Result<()> {
        let schemas = vec!["expanded_hts_prep".to_string(), "public".to_string()];
        validate_sql(sql, TABLE, &schemas)
    }

    fn rejection(sql: &str) -> String {
        let err = validate(sql).unwrap_err();
        assert_eq!(err.kind(), "synthesis");
        err.to_string()
    }

    #[test]
    fn test_validate_accepts_resolved_table() {
        validate(&format!(
            "SELECT stateofresidence, COUNT(*) FROM expanded_hts_prep.{} GROUP BY stateofresidence",
            TABLE
        ))
        .unwrap();
        validate(&format!(
            "SELECT COUNT(*) FROM (SELECT * FROM {t} WHERE sex = 'Female') AS f \
             UNION ALL SELECT COUNT(*) FROM {t} ORDER BY 1",
            t = TABLE
        ))
        .unwrap();
    }

    #[test]
    fn test_validate_accepts_cte() {
        let sql = format!(
            "WITH pos AS (SELECT * FROM {} WHERE finalhivtestresult = 'Positive'), \
             lagos AS (SELECT * FROM pos WHERE stateofresidence = 'Lagos') SELECT COUNT(*) FROM lagos",
            TABLE
        );
        validate(&sql).unwrap();
    }

    #[test]
    fn test_validate_rejects_other_tables() {
        assert!(rejection(&format!("SELECT * FROM {} JOIN pg_user ON true", TABLE)).contains("pg_user"));
        assert!(rejection(&format!("SELECT * FROM other_schema.{}", TABLE)).contains("other_schema"));
    }

    #[test]
    fn test_validate_rejects_writes_and_batches() {
        rejection(&format!("DELETE FROM {}", TABLE));
        rejection(&format!("SELECT 1 FROM {}; SELECT 2", TABLE));
        rejection("I'm not sure");
    }

    #[test]
    fn test_validate_rejects_select_into() {
        let reason = rejection(&format!("SELECT * INTO stolen FROM {}", TABLE));
        assert!(reason.contains("INTO"));
    }

    #[test]
    fn test_validate_rejects_writable_cte() {
        rejection(&format!(
            "WITH d AS (UPDATE {} SET sex = 'x' RETURNING *) SELECT COUNT(*) FROM d",
            TABLE
        ));
    }

    #[test]
    fn test_validate_cte_cannot_shadow_its_source() {
        let reason = rejection("WITH pg_shadow AS (SELECT * FROM pg_catalog.pg_shadow) SELECT * FROM pg_shadow");
        assert!(reason.contains("pg_catalog.pg_shadow"));

        // A CTE is not visible to the ones defined before it
        rejection(&format!(
            "WITH a AS (SELECT * FROM b), b AS (SELECT * FROM {}) SELECT * FROM a",
            TABLE
        ));
    }

    #[test]
    fn test_validate_rejects_admin_functions() {
        assert!(rejection("SELECT pg_read_file('/etc/passwd')").contains("pg_read_file"));
        rejection(&format!("SELECT current_setting('data_directory') FROM {}", TABLE));
        rejection(&format!("SELECT COUNT(*) FROM {} WHERE sex = query_to_xml('x', true, true, '')::text", TABLE));
    }

    #[test]
    fn test_validate_requires_resolved_table() {
        assert!(rejection("SELECT 1").contains("does not read"));
    }

    #[test]
    fn test_describe_columns() {
        let columns = vec![
            ColumnInfo { name: "sex".to_string(), data_type: "text".to_string() },
            ColumnInfo { name: "age".to_string(), data_type: "integer".to_string() },
        ];
        assert_eq!(
            describe_columns("t", &columns),
            "Table 't' has columns: sex (text), age (integer)."
        );
    }

    struct ScriptedModel {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionModel for ScriptedModel {
        async fn complete(&self, prompt: &str, stop: &[&str]) -> Result<String> {
            assert_eq!(stop, &[prompts::STOP_SEQUENCE]);
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    #[derive(Default)]
    struct RecordingWarehouse {
        executed: Mutex<Vec<String>>,
        fail_describe: bool,
    }

    #[async_trait]
    impl Warehouse for RecordingWarehouse {
        async fn fetch_periods(&self) -> Result<Vec<PeriodRecord>> {
            Ok(vec![PeriodRecord::new("2024W32", true)])
        }

        async fn describe_table(&self, table: &str) -> Result<Vec<ColumnInfo>> {
            if self.fail_describe {
                return Err(QueryError::Database(format!("Table {} has no visible columns", table)));
            }
            Ok(vec![ColumnInfo {
                name: "finalhivtestresult".to_string(),
                data_type: "text".to_string(),
            }])
        }

        async fn execute(&self, sql: &str) -> Result<RawRows> {
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(RawRows {
                col_keys: vec!["total".to_string()],
                rows: vec![vec![json!(12)]],
            })
        }

        async fn close(&self) {}
    }

    fn request<'a>(instructions: &'a str) -> SynthesisRequest<'a> {
        SynthesisRequest {
            question: "How many tests were done?",
            table: TABLE,
            instructions,
            context: "description of the table: HTS",
        }
    }

    #[tokio::test]
    async fn test_llm_synthesizer_runs_extracted_sql() {
        let model = Arc::new(ScriptedModel {
            reply: format!("SQLQuery: SELECT COUNT(*) AS total FROM {}", TABLE),
            prompts: Mutex::new(Vec::new()),
        });
        let synthesizer = LlmSqlSynthesizer::new(model.clone());
        let warehouse = RecordingWarehouse::default();
        let instructions = prompts::instruction_prompt(TABLE);

        let response = synthesizer.synthesize(&request(&instructions), &warehouse).await.unwrap();

        assert_eq!(response.sql, format!("SELECT COUNT(*) AS total FROM {}", TABLE));
        assert_eq!(response.col_keys, vec!["total".to_string()]);
        assert_eq!(*warehouse.executed.lock().unwrap(), vec![response.sql.clone()]);

        let prompt = model.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains(&format!(
            "Table '{}' has columns: finalhivtestresult (text). The table description is: description of the table: HTS",
            TABLE
        )));
        assert!(prompt.contains("Write a SQL query to answer the following question: How many tests were done?."));
    }

    #[tokio::test]
    async fn test_llm_synthesizer_refuses_foreign_table() {
        let model = Arc::new(ScriptedModel {
            reply: "SELECT * FROM patients".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let synthesizer = LlmSqlSynthesizer::new(model);
        let warehouse = RecordingWarehouse::default();
        let instructions = prompts::instruction_prompt(TABLE);

        let err = synthesizer.synthesize(&request(&instructions), &warehouse).await.unwrap_err();
        assert_eq!(err.kind(), "synthesis");
        assert!(warehouse.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_llm_synthesizer_stops_when_table_cannot_be_described() {
        let model = Arc::new(ScriptedModel {
            reply: format!("SELECT COUNT(*) FROM {}", TABLE),
            prompts: Mutex::new(Vec::new()),
        });
        let synthesizer = LlmSqlSynthesizer::new(model.clone());
        let warehouse = RecordingWarehouse {
            fail_describe: true,
            ..Default::default()
        };
        let instructions = prompts::instruction_prompt(TABLE);

        let err = synthesizer.synthesize(&request(&instructions), &warehouse).await.unwrap_err();
        assert_eq!(err.kind(), "database");
        assert!(model.prompts.lock().unwrap().is_empty());
        assert!(warehouse.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_llm_synthesizer_accepts_search_path_schema() {
        let model = Arc::new(ScriptedModel {
            reply: format!("SELECT COUNT(*) AS total FROM public.{}", TABLE),
            prompts: Mutex::new(Vec::new()),
        });
        let synthesizer = LlmSqlSynthesizer::new(model).with_schemas(vec!["public".to_string()]);
        let warehouse = RecordingWarehouse::default();
        let instructions = prompts::instruction_prompt(TABLE);

        synthesizer.synthesize(&request(&instructions), &warehouse).await.unwrap();
        assert_eq!(warehouse.executed.lock().unwrap().len(), 1);
    }
}
