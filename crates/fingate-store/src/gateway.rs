use std::sync::Arc;

use chrono::{Local, NaiveDate};
use fingate_types::{
    DbStatus, GatewayError, GatewayResult, JsonMap, QueryRequest, QueryResult, ValidationVerdict,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::catalog::{
    Catalog, CATEGORY_BREAKDOWN, DESCRIBE_TABLE, LIST_ACCOUNTS, LIST_CATEGORIES, LIST_PERSONS,
    LIST_TABLES, MONTHLY_TOTALS, RECENT_TRANSACTIONS, SEARCH_TRANSACTIONS, SPENDING_SUMMARY,
};
use crate::config::DbConfig;
use crate::postgres::PostgresBackend;
use crate::validator::{strip_terminator, KnownSchema, Validator};
use crate::{Backend, ExecutionLimits, Statement};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpendingSummaryArgs {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub person_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecentTransactionsArgs {
    pub category: Option<String>,
    pub person_id: Option<i64>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTotalsArgs {
    pub year: Option<i64>,
    pub months: Option<i64>,
    pub person_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryBreakdownArgs {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateOutcome {
    pub parameters: JsonMap,
    pub result: QueryResult,
}

pub struct Gateway {
    backend: Arc<dyn Backend>,
    catalog: Catalog,
    validator: Validator,
    limits: ExecutionLimits,
}

impl Gateway {
    pub fn new(config: DbConfig) -> GatewayResult<Self> {
        let validator = if config.enforce_schema {
            Validator::with_schema(KnownSchema::finance())
        } else {
            Validator::new()
        };
        let limits = config.limits();
        info!(
            database = %config.database,
            port = config.port,
            timeout_ms = limits.timeout.as_millis() as u64,
            max_rows = limits.max_rows,
            enforce_schema = config.enforce_schema,
            "gateway configured"
        );
        let backend = PostgresBackend::new(config)?;
        Self::with_backend(Arc::new(backend), validator, limits)
    }

    pub fn with_backend(
        backend: Arc<dyn Backend>,
        validator: Validator,
        limits: ExecutionLimits,
    ) -> GatewayResult<Self> {
        Ok(Self {
            backend,
            catalog: Catalog::finance()?,
            validator,
            limits,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    pub fn validate(&self, sql: &str) -> ValidationVerdict {
        self.validator.validate(sql)
    }

    pub fn run(&self, request: &QueryRequest) -> GatewayResult<QueryResult> {
        match request {
            QueryRequest::Template(call) => self.run_template(&call.template_name, &call.parameters),
            QueryRequest::Raw(raw) => self.execute_select_query(&raw.raw_statement),
        }
    }

    pub fn run_template(&self, name: &str, params: &JsonMap) -> GatewayResult<QueryResult> {
        self.call_template(name, params).map(|outcome| outcome.result)
    }

    pub fn call_template(&self, name: &str, params: &JsonMap) -> GatewayResult<TemplateOutcome> {
        self.call_template_on(name, params, Local::now().date_naive())
    }

    #[instrument(skip_all, fields(template = name))]
    fn call_template_on(
        &self,
        name: &str,
        params: &JsonMap,
        today: NaiveDate,
    ) -> GatewayResult<TemplateOutcome> {
        let call = self.catalog.prepare(name, params, today).inspect_err(|err| {
            debug!(error = %err, "template call refused");
        })?;
        let result = self
            .backend
            .fetch(Statement::new(call.sql(), &call.params), &self.limits)
            .inspect_err(|err| warn!(kind = %err.kind, error = %err, "template call failed"))?;
        Ok(TemplateOutcome {
            parameters: call.resolved(),
            result,
        })
    }

    #[instrument(skip_all)]
    pub fn execute_select_query(&self, raw_statement: &str) -> GatewayResult<QueryResult> {
        if let Err(err) = self.validator.validate(raw_statement).into_result() {
            info!(rule = ?err.rule, "statement rejected");
            return Err(err);
        }
        let sql = strip_terminator(raw_statement);
        self.backend
            .fetch(Statement::new(sql, &[]), &self.limits)
            .inspect_err(|err| warn!(kind = %err.kind, error = %err, "statement failed"))
    }

    pub fn get_database_status(&self) -> DbStatus {
        self.backend.status()
    }

    pub fn get_spending_summary(&self, args: &SpendingSummaryArgs) -> GatewayResult<QueryResult> {
        self.run_template(SPENDING_SUMMARY, &to_params(args)?)
    }

    pub fn get_recent_transactions(
        &self,
        args: &RecentTransactionsArgs,
    ) -> GatewayResult<QueryResult> {
        self.run_template(RECENT_TRANSACTIONS, &to_params(args)?)
    }

    pub fn get_monthly_totals(&self, args: &MonthlyTotalsArgs) -> GatewayResult<QueryResult> {
        self.run_template(MONTHLY_TOTALS, &to_params(args)?)
    }

    pub fn get_category_breakdown(
        &self,
        args: &CategoryBreakdownArgs,
    ) -> GatewayResult<QueryResult> {
        self.run_template(CATEGORY_BREAKDOWN, &to_params(args)?)
    }

    pub fn search_transactions(&self, text: &str, limit: Option<i64>) -> GatewayResult<QueryResult> {
        let mut params = JsonMap::new();
        params.insert("search_term".to_string(), json!(text));
        if let Some(limit) = limit {
            params.insert("limit".to_string(), json!(limit));
        }
        self.run_template(SEARCH_TRANSACTIONS, &params)
    }

    pub fn list_categories(&self) -> GatewayResult<QueryResult> {
        self.run_template(LIST_CATEGORIES, &JsonMap::new())
    }

    pub fn list_persons(&self) -> GatewayResult<QueryResult> {
        self.run_template(LIST_PERSONS, &JsonMap::new())
    }

    pub fn list_accounts(&self) -> GatewayResult<QueryResult> {
        self.run_template(LIST_ACCOUNTS, &JsonMap::new())
    }

    pub fn list_tables(&self) -> GatewayResult<QueryResult> {
        self.run_template(LIST_TABLES, &JsonMap::new())
    }

    pub fn describe_table(&self, table_name: &str) -> GatewayResult<QueryResult> {
        let mut params = JsonMap::new();
        params.insert("table_name".to_string(), json!(table_name));
        self.run_template(DESCRIBE_TABLE, &params)
    }
}

fn to_params<T: Serialize>(args: &T) -> GatewayResult<JsonMap> {
    match serde_json::to_value(args) {
        Ok(Value::Object(map)) => Ok(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        Ok(other) => Err(GatewayError::invalid_parameters(format!(
            "expected an argument object, got {}",
            other
        ))),
        Err(err) => Err(GatewayError::invalid_parameters(err.to_string())),
    }
}
