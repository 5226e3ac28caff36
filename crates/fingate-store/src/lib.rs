use chrono::NaiveDate;
use fingate_types::{DbStatus, GatewayResult, QueryResult};
use serde_json::{json, Value};
use std::time::Duration;

mod catalog;
mod config;
mod gateway;
mod postgres;
mod shape;
mod validator;

pub use catalog::{
    finance_templates, BoundsPolicy, Catalog, CatalogError, ParamDefault, ParamSpec, ParamType,
    PreparedCall, RangeConstraint, Template,
};
pub use config::{DbConfig, FINANCE_SCHEMA, LOOPBACK_HOST};
pub use gateway::{
    CategoryBreakdownArgs, Gateway, MonthlyTotalsArgs, RecentTransactionsArgs, SpendingSummaryArgs,
    TemplateOutcome,
};
pub use self::postgres::PostgresBackend;
pub use shape::column_type;
pub use validator::{strip_terminator, KnownSchema, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub max_rows: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_rows: 1000,
        }
    }
}

// Nulls keep their type so they bind to a typed placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundValue {
    Null(ParamType),
    Date(NaiveDate),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl BoundValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BoundValue::Null(_))
    }

    pub fn to_json(&self) -> Value {
        match self {
            BoundValue::Null(_) => Value::Null,
            BoundValue::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            BoundValue::Integer(v) => json!(v),
            BoundValue::Float(v) => json!(v),
            BoundValue::Text(v) => json!(v),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Statement<'a> {
    pub sql: &'a str,
    pub params: &'a [BoundValue],
}

impl<'a> Statement<'a> {
    pub fn new(sql: &'a str, params: &'a [BoundValue]) -> Self {
        Self { sql, params }
    }
}

pub trait Backend: Send + Sync {
    fn fetch(&self, statement: Statement<'_>, limits: &ExecutionLimits)
        -> GatewayResult<QueryResult>;

    fn status(&self) -> DbStatus;
}
