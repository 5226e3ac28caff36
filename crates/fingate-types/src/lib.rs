use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

pub type JsonMap = BTreeMap<String, serde_json::Value>;

pub type GatewayResult<T> = Result<T, GatewayError>;

pub const UNAVAILABLE_HINT: &str =
    "The database may be unavailable. Other tools continue working normally.";
pub const READ_ONLY_HINT: &str = "Only a single read-only SELECT statement is allowed.";
pub const TIMEOUT_HINT: &str = "Narrow the date range or add a LIMIT clause and try again.";

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Integer(v) => Some(*v as f64),
            ScalarValue::Float(v) => Some(*v),
            ScalarValue::Decimal(v) => v.to_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

// Decimals go out as JSON numbers; callers are agents reading amounts, not ledgers.
impl Serialize for ScalarValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ScalarValue::Null => serializer.serialize_none(),
            ScalarValue::Bool(v) => serializer.serialize_bool(*v),
            ScalarValue::Integer(v) => serializer.serialize_i64(*v),
            ScalarValue::Float(v) => serializer.serialize_f64(*v),
            ScalarValue::Decimal(v) => match v.to_f64() {
                Some(f) => serializer.serialize_f64(f),
                None => serializer.serialize_str(&v.to_string()),
            },
            ScalarValue::Text(v) => serializer.serialize_str(v),
            ScalarValue::Date(v) => v.serialize(serializer),
            ScalarValue::Timestamp(v) => v.serialize(serializer),
            ScalarValue::TimestampTz(v) => v.serialize(serializer),
            ScalarValue::Json(v) => v.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Numeric,
    Text,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    columns: Vec<ColumnDescriptor>,
    rows: Vec<Vec<ScalarValue>>,
    row_count: usize,
    truncated: bool,
}

impl QueryResult {
    pub fn new(
        columns: Vec<ColumnDescriptor>,
        rows: Vec<Vec<ScalarValue>>,
        truncated: bool,
    ) -> GatewayResult<Self> {
        if let Some(idx) = rows.iter().position(|row| row.len() != columns.len()) {
            return Err(GatewayError::execution(format!(
                "row {} has {} values but the result has {} columns",
                idx,
                rows[idx].len(),
                columns.len()
            )));
        }
        let row_count = rows.len();
        Ok(Self {
            columns,
            rows,
            row_count,
            truncated,
        })
    }

    pub fn empty(columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
        }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<ScalarValue>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_values(&self, name: &str) -> Option<Vec<&ScalarValue>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionUnavailable,
    ValidationRejected,
    InvalidParameters,
    UnknownTemplate,
    Timeout,
    ExecutionError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConnectionUnavailable => "connection_unavailable",
            ErrorKind::ValidationRejected => "validation_rejected",
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::UnknownTemplate => "unknown_template",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutionError => "execution_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationRule {
    Empty,
    Malformed,
    MultiStatement,
    DisallowedVerb,
    DenylistedKeyword,
    OutOfSchemaReference,
}

impl ValidationRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationRule::Empty => "empty",
            ValidationRule::Malformed => "malformed",
            ValidationRule::MultiStatement => "multi_statement",
            ValidationRule::DisallowedVerb => "disallowed_verb",
            ValidationRule::DenylistedKeyword => "denylisted_keyword",
            ValidationRule::OutOfSchemaReference => "out_of_schema_reference",
        }
    }
}

impl fmt::Display for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unavailability {
    Unreachable,
    CredentialsRejected,
    DatabaseMissing,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ValidationRule>,
}

impl ValidationVerdict {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            rule: None,
        }
    }

    pub fn reject(rule: ValidationRule, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            rule: Some(rule),
        }
    }

    pub fn into_result(self) -> GatewayResult<()> {
        if self.allowed {
            return Ok(());
        }
        let rule = self.rule.unwrap_or(ValidationRule::Malformed);
        let reason = self
            .reason
            .unwrap_or_else(|| "statement rejected".to_string());
        Err(GatewayError::rejected(rule, reason))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: Option<String>,
    pub rule: Option<ValidationRule>,
    pub diagnosis: Option<Unavailability>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
            rule: None,
            diagnosis: None,
        }
    }

    pub fn unavailable(diagnosis: Unavailability, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::ConnectionUnavailable, message).with_hint(UNAVAILABLE_HINT);
        err.diagnosis = Some(diagnosis);
        err
    }

    pub fn rejected(rule: ValidationRule, reason: impl Into<String>) -> Self {
        let mut err = Self::new(
            ErrorKind::ValidationRejected,
            format!("{} ({})", reason.into(), rule),
        )
        .with_hint(READ_ONLY_HINT);
        err.rule = Some(rule);
        err
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameters, message)
    }

    pub fn unknown_template(name: &str) -> Self {
        Self::new(ErrorKind::UnknownTemplate, format!("Unknown tool: {}", name))
    }

    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "Query exceeded the {} ms limit and was cancelled",
                limit.as_millis()
            ),
        )
        .with_hint(TIMEOUT_HINT)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionError, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for GatewayError {}

impl Serialize for GatewayError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = 3
            + usize::from(self.hint.is_some())
            + usize::from(self.rule.is_some())
            + usize::from(self.diagnosis.is_some());
        let mut state = serializer.serialize_struct("GatewayError", len)?;
        state.serialize_field("error", &true)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("message", &self.message)?;
        if let Some(hint) = &self.hint {
            state.serialize_field("hint", hint)?;
        }
        if let Some(rule) = &self.rule {
            state.serialize_field("rule", rule)?;
        }
        if let Some(diagnosis) = &self.diagnosis {
            state.serialize_field("diagnosis", diagnosis)?;
        }
        state.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub total_transactions: i64,
    pub total_persons: i64,
    pub total_categories: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbStatus {
    pub reachable: bool,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub server_version: Option<String>,
    pub database: String,
    pub host: String,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TableStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum QueryRequest {
    Template(TemplateRequest),
    Raw(RawRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateRequest {
    pub template_name: String,
    #[serde(default)]
    pub parameters: JsonMap,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRequest {
    pub raw_statement: String,
}

impl QueryRequest {
    pub fn template(name: impl Into<String>, parameters: JsonMap) -> Self {
        QueryRequest::Template(TemplateRequest {
            template_name: name.into(),
            parameters,
        })
    }

    pub fn raw(statement: impl Into<String>) -> Self {
        QueryRequest::Raw(RawRequest {
            raw_statement: statement.into(),
        })
    }
}
