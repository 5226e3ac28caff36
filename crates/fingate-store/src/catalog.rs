use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{Datelike, NaiveDate};
use fingate_types::{GatewayError, GatewayResult, JsonMap};
use serde::Serialize;
use serde_json::{json, Value};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::config::FINANCE_SCHEMA;
use crate::validator::Validator;
use crate::BoundValue;

pub const SPENDING_SUMMARY: &str = "get_spending_summary";
pub const RECENT_TRANSACTIONS: &str = "get_recent_transactions";
pub const MONTHLY_TOTALS: &str = "get_monthly_totals";
pub const CATEGORY_BREAKDOWN: &str = "get_category_breakdown";
pub const SEARCH_TRANSACTIONS: &str = "search_transactions";
pub const LIST_CATEGORIES: &str = "list_categories";
pub const LIST_PERSONS: &str = "list_persons";
pub const LIST_ACCOUNTS: &str = "list_accounts";
pub const LIST_TABLES: &str = "list_tables";
pub const DESCRIBE_TABLE: &str = "describe_table";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Date,
    Integer,
    Float,
    Text,
}

impl ParamType {
    fn json_type(&self) -> &'static str {
        match self {
            ParamType::Date | ParamType::Text => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "number",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamDefault {
    Integer(i64),
    Today,
    FirstOfMonth,
    FirstOfYear,
}

impl ParamDefault {
    fn resolve(&self, today: NaiveDate) -> BoundValue {
        match self {
            ParamDefault::Integer(v) => BoundValue::Integer(*v),
            ParamDefault::Today => BoundValue::Date(today),
            ParamDefault::FirstOfMonth => BoundValue::Date(today.with_day(1).unwrap_or(today)),
            ParamDefault::FirstOfYear => BoundValue::Date(
                NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today),
            ),
        }
    }

    fn describe(&self) -> String {
        match self {
            ParamDefault::Integer(v) => v.to_string(),
            ParamDefault::Today => "today".to_string(),
            ParamDefault::FirstOfMonth => "first day of the current month".to_string(),
            ParamDefault::FirstOfYear => "first day of the current year".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsPolicy {
    Reject,
    Clamp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub param_type: ParamType,
    pub description: String,
    pub required: bool,
    pub default: Option<ParamDefault>,
    pub bounds: Option<(i64, i64, BoundsPolicy)>,
}

impl ParamSpec {
    fn new(name: &str, param_type: ParamType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            description: description.to_string(),
            required: false,
            default: None,
            bounds: None,
        }
    }

    pub fn date(name: &str, description: &str) -> Self {
        Self::new(name, ParamType::Date, description)
    }

    pub fn integer(name: &str, description: &str) -> Self {
        Self::new(name, ParamType::Integer, description)
    }

    pub fn float(name: &str, description: &str) -> Self {
        Self::new(name, ParamType::Float, description)
    }

    pub fn text(name: &str, description: &str) -> Self {
        Self::new(name, ParamType::Text, description)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_to(mut self, default: ParamDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn bounded(mut self, min: i64, max: i64) -> Self {
        self.bounds = Some((min, max, BoundsPolicy::Reject));
        self
    }

    pub fn clamped(mut self, min: i64, max: i64) -> Self {
        self.bounds = Some((min, max, BoundsPolicy::Clamp));
        self
    }

    fn coerce(&self, raw: Option<&Value>, today: NaiveDate) -> GatewayResult<BoundValue> {
        let raw = match raw {
            None | Some(Value::Null) => {
                if let Some(default) = &self.default {
                    return Ok(default.resolve(today));
                }
                if self.required {
                    return Err(GatewayError::invalid_parameters(format!(
                        "{} is required",
                        self.name
                    )));
                }
                return Ok(BoundValue::Null(self.param_type));
            }
            Some(value) => value,
        };

        let value = match self.param_type {
            ParamType::Date => {
                let text = raw.as_str().ok_or_else(|| self.type_error("a YYYY-MM-DD string"))?;
                let date = NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                    .map_err(|_| self.type_error("a YYYY-MM-DD date"))?;
                BoundValue::Date(date)
            }
            ParamType::Integer => BoundValue::Integer(self.apply_bounds(coerce_integer(raw).ok_or_else(
                || self.type_error("an integer"),
            )?)?),
            ParamType::Float => {
                let number = match raw {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .filter(|f| f.is_finite())
                .ok_or_else(|| self.type_error("a number"))?;
                BoundValue::Float(number)
            }
            ParamType::Text => {
                let text = raw.as_str().ok_or_else(|| self.type_error("a string"))?;
                if self.required && text.trim().is_empty() {
                    return Err(GatewayError::invalid_parameters(format!(
                        "{} must not be empty",
                        self.name
                    )));
                }
                BoundValue::Text(text.to_string())
            }
        };
        Ok(value)
    }

    fn apply_bounds(&self, value: i64) -> GatewayResult<i64> {
        match self.bounds {
            Some((min, max, BoundsPolicy::Clamp)) => Ok(value.clamp(min, max)),
            Some((min, max, BoundsPolicy::Reject)) if value < min || value > max => {
                Err(GatewayError::invalid_parameters(format!(
                    "{} must be between {} and {}",
                    self.name, min, max
                )))
            }
            _ => Ok(value),
        }
    }

    fn type_error(&self, expected: &str) -> GatewayError {
        GatewayError::invalid_parameters(format!("{} must be {}", self.name, expected))
    }

    fn json_schema(&self) -> Value {
        let mut description = self.description.clone();
        if let Some(default) = &self.default {
            description.push_str(&format!(" Defaults to {}.", default.describe()));
        }
        let mut schema = json!({
            "type": self.param_type.json_type(),
            "description": description,
        });
        if self.param_type == ParamType::Date {
            schema["format"] = json!("date");
        }
        if let Some(ParamDefault::Integer(v)) = &self.default {
            schema["default"] = json!(v);
        }
        if let Some((min, max, _)) = self.bounds {
            schema["minimum"] = json!(min);
            schema["maximum"] = json!(max);
        }
        schema
    }
}

fn coerce_integer(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeConstraint {
    pub lower: String,
    pub upper: String,
}

impl RangeConstraint {
    pub fn new(lower: &str, upper: &str) -> Self {
        Self {
            lower: lower.to_string(),
            upper: upper.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub description: String,
    pub sql: String,
    pub params: Vec<ParamSpec>,
    pub constraints: Vec<RangeConstraint>,
}

impl Template {
    pub fn new(name: &str, description: &str, sql: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            sql: sql.into(),
            params: Vec::new(),
            constraints: Vec::new(),
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn constraint(mut self, lower: &str, upper: &str) -> Self {
        self.constraints.push(RangeConstraint::new(lower, upper));
        self
    }

    pub fn input_schema(&self) -> Value {
        let properties: serde_json::Map<String, Value> = self
            .params
            .iter()
            .map(|p| (p.name.clone(), p.json_schema()))
            .collect();
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required && p.default.is_none())
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    fn check(&self) -> Result<(), CatalogError> {
        let verdict = Validator::new().validate(&self.sql);
        if !verdict.allowed {
            return Err(self.error(verdict.reason.unwrap_or_default()));
        }

        let mut names = BTreeSet::new();
        for spec in &self.params {
            if !names.insert(spec.name.as_str()) {
                return Err(self.error(format!("duplicate parameter {}", spec.name)));
            }
        }

        let placeholders = placeholder_indexes(&self.sql).map_err(|reason| self.error(reason))?;
        let expected: BTreeSet<usize> = (1..=self.params.len()).collect();
        if placeholders != expected {
            return Err(self.error(format!(
                "placeholders {:?} do not match {} declared parameters",
                placeholders,
                self.params.len()
            )));
        }

        for constraint in &self.constraints {
            let lower = self.spec(&constraint.lower);
            let upper = self.spec(&constraint.upper);
            match (lower, upper) {
                (Some(l), Some(u)) if l.param_type == u.param_type && l.param_type != ParamType::Text => {}
                _ => {
                    return Err(self.error(format!(
                        "constraint {} <= {} needs two comparable parameters",
                        constraint.lower, constraint.upper
                    )));
                }
            }
        }
        Ok(())
    }

    fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    fn error(&self, reason: impl Into<String>) -> CatalogError {
        CatalogError {
            template: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn bind(&self, params: &JsonMap, today: NaiveDate) -> GatewayResult<Vec<BoundValue>> {
        if let Some(unknown) = params.keys().find(|k| self.spec(k).is_none()) {
            return Err(GatewayError::invalid_parameters(format!(
                "Unknown parameter for {}: {}",
                self.name, unknown
            )));
        }

        let values = self
            .params
            .iter()
            .map(|spec| spec.coerce(params.get(&spec.name), today))
            .collect::<GatewayResult<Vec<_>>>()?;

        for constraint in &self.constraints {
            let lower = self.params.iter().position(|p| p.name == constraint.lower);
            let upper = self.params.iter().position(|p| p.name == constraint.upper);
            if let (Some(l), Some(u)) = (lower, upper) {
                if out_of_order(&values[l], &values[u]) {
                    return Err(GatewayError::invalid_parameters(format!(
                        "{} must not be after {}",
                        constraint.lower, constraint.upper
                    )));
                }
            }
        }
        Ok(values)
    }
}

fn out_of_order(lower: &BoundValue, upper: &BoundValue) -> bool {
    match (lower, upper) {
        (BoundValue::Date(l), BoundValue::Date(u)) => l > u,
        (BoundValue::Integer(l), BoundValue::Integer(u)) => l > u,
        (BoundValue::Float(l), BoundValue::Float(u)) => l > u,
        _ => false,
    }
}

fn placeholder_indexes(sql: &str) -> Result<BTreeSet<usize>, String> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|err| err.to_string())?;
    let mut indexes = BTreeSet::new();
    for token in tokens {
        if let Token::Placeholder(text) = token {
            let idx = text
                .strip_prefix('$')
                .and_then(|n| n.parse::<usize>().ok())
                .ok_or_else(|| format!("unsupported placeholder {}", text))?;
            indexes.insert(idx);
        }
    }
    Ok(indexes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogError {
    pub template: String,
    pub reason: String,
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template {} is invalid: {}", self.template, self.reason)
    }
}

impl std::error::Error for CatalogError {}

impl From<CatalogError> for GatewayError {
    fn from(err: CatalogError) -> Self {
        GatewayError::execution(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall<'a> {
    pub template: &'a Template,
    pub params: Vec<BoundValue>,
}

impl PreparedCall<'_> {
    pub fn sql(&self) -> &str {
        &self.template.sql
    }

    pub fn resolved(&self) -> JsonMap {
        self.template
            .params
            .iter()
            .zip(&self.params)
            .map(|(spec, value)| (spec.name.clone(), value.to_json()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    templates: BTreeMap<String, Template>,
}

impl Catalog {
    pub fn new(templates: Vec<Template>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for template in templates {
            template.check()?;
            if map.contains_key(&template.name) {
                return Err(template.error("duplicate template name"));
            }
            map.insert(template.name.clone(), template);
        }
        Ok(Self { templates: map })
    }

    pub fn finance() -> Result<Self, CatalogError> {
        Self::new(finance_templates())
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn templates(&self) -> impl Iterator<Item = &Template> {
        self.templates.values()
    }

    pub fn prepare(
        &self,
        name: &str,
        params: &JsonMap,
        today: NaiveDate,
    ) -> GatewayResult<PreparedCall<'_>> {
        let template = self
            .get(name)
            .ok_or_else(|| GatewayError::unknown_template(name))?;
        let params = template.bind(params, today)?;
        Ok(PreparedCall { template, params })
    }
}

pub fn finance_templates() -> Vec<Template> {
    let s = FINANCE_SCHEMA;
    vec![
        Template::new(
            SPENDING_SUMMARY,
            "Get a summary of spending by category for a date range",
            format!(
                "SELECT sc.category_name, \
                        COUNT(*) AS transaction_count, \
                        SUM(t.amount) AS total_amount, \
                        AVG(t.amount) AS avg_amount, \
                        MIN(t.amount) AS min_amount, \
                        MAX(t.amount) AS max_amount \
                 FROM {s}.transactions t \
                 JOIN {s}.spending_categories sc ON t.category_id = sc.id \
                 WHERE t.transaction_date >= $1::date \
                   AND t.transaction_date <= $2::date \
                   AND ($3::bigint IS NULL OR t.person_id = $3::bigint) \
                 GROUP BY sc.category_name \
                 ORDER BY total_amount DESC"
            ),
        )
        .param(ParamSpec::date("start_date", "Start date (YYYY-MM-DD).").default_to(ParamDefault::FirstOfMonth))
        .param(ParamSpec::date("end_date", "End date (YYYY-MM-DD).").default_to(ParamDefault::Today))
        .param(ParamSpec::integer("person_id", "Filter by person ID (optional)."))
        .constraint("start_date", "end_date"),
        Template::new(
            RECENT_TRANSACTIONS,
            "Get recent transactions with optional filters",
            format!(
                "SELECT t.id, t.transaction_date, t.description, t.amount, \
                        sc.category_name, p.name AS person_name, acct.account_name \
                 FROM {s}.transactions t \
                 JOIN {s}.spending_categories sc ON t.category_id = sc.id \
                 JOIN {s}.persons p ON t.person_id = p.id \
                 JOIN {s}.account_type acct ON t.account_type_id = acct.id \
                 WHERE ($1::text IS NULL OR LOWER(sc.category_name) = LOWER($1::text)) \
                   AND ($2::bigint IS NULL OR t.person_id = $2::bigint) \
                   AND ($3::float8 IS NULL OR t.amount >= $3::float8) \
                   AND ($4::float8 IS NULL OR t.amount <= $4::float8) \
                 ORDER BY t.transaction_date DESC, t.id DESC \
                 LIMIT $5::bigint"
            ),
        )
        .param(ParamSpec::text("category", "Filter by spending category name."))
        .param(ParamSpec::integer("person_id", "Filter by person ID."))
        .param(ParamSpec::float("min_amount", "Minimum transaction amount."))
        .param(ParamSpec::float("max_amount", "Maximum transaction amount."))
        .param(
            ParamSpec::integer("limit", "Number of transactions to return (max 100).")
                .default_to(ParamDefault::Integer(20))
                .clamped(1, 100),
        )
        .constraint("min_amount", "max_amount"),
        Template::new(
            MONTHLY_TOTALS,
            "Get total spending by month for a year or the trailing months",
            format!(
                "SELECT DATE_TRUNC('month', t.transaction_date)::date AS month, \
                        SUM(t.amount) AS total_amount, \
                        COUNT(*) AS transaction_count \
                 FROM {s}.transactions t \
                 WHERE (($1::bigint IS NOT NULL AND EXTRACT(YEAR FROM t.transaction_date) = $1::bigint) \
                     OR ($1::bigint IS NULL AND t.transaction_date >= \
                         (DATE_TRUNC('month', CURRENT_DATE) - make_interval(months => $2::bigint::int))::date)) \
                   AND ($3::bigint IS NULL OR t.person_id = $3::bigint) \
                 GROUP BY 1 \
                 ORDER BY 1 DESC"
            ),
        )
        .param(ParamSpec::integer("year", "Calendar year to report (optional).").bounded(1900, 2200))
        .param(
            ParamSpec::integer("months", "Number of trailing months when no year is given.")
                .default_to(ParamDefault::Integer(12))
                .bounded(1, 120),
        )
        .param(ParamSpec::integer("person_id", "Filter by person ID (optional).")),
        Template::new(
            CATEGORY_BREAKDOWN,
            "Get a breakdown of spending by category with percentage of total",
            format!(
                "SELECT sc.category_name, \
                        SUM(t.amount) AS total_amount, \
                        COUNT(*) AS transaction_count, \
                        (100.0 * SUM(t.amount) / NULLIF(SUM(SUM(t.amount)) OVER (), 0))::float8 AS percentage \
                 FROM {s}.transactions t \
                 JOIN {s}.spending_categories sc ON t.category_id = sc.id \
                 WHERE t.transaction_date >= $1::date \
                   AND t.transaction_date <= $2::date \
                 GROUP BY sc.category_name \
                 ORDER BY total_amount DESC"
            ),
        )
        .param(ParamSpec::date("start_date", "Start date (YYYY-MM-DD).").default_to(ParamDefault::FirstOfYear))
        .param(ParamSpec::date("end_date", "End date (YYYY-MM-DD).").default_to(ParamDefault::Today))
        .constraint("start_date", "end_date"),
        Template::new(
            SEARCH_TRANSACTIONS,
            "Search transactions by description",
            format!(
                "SELECT t.id, t.transaction_date, t.description, t.amount, \
                        sc.category_name, p.name AS person_name \
                 FROM {s}.transactions t \
                 JOIN {s}.spending_categories sc ON t.category_id = sc.id \
                 JOIN {s}.persons p ON t.person_id = p.id \
                 WHERE t.description ILIKE \
                     '%' || replace(replace(replace($1::text, '\\', '\\\\'), '%', '\\%'), '_', '\\_') || '%' \
                 ORDER BY t.transaction_date DESC, t.id DESC \
                 LIMIT $2::bigint"
            ),
        )
        .param(ParamSpec::text("search_term", "Text to search for in transaction descriptions.").required())
        .param(
            ParamSpec::integer("limit", "Maximum results to return (max 100).")
                .default_to(ParamDefault::Integer(20))
                .clamped(1, 100),
        ),
        Template::new(
            LIST_CATEGORIES,
            "List all available spending categories",
            format!("SELECT id, category_name FROM {s}.spending_categories ORDER BY category_name"),
        ),
        Template::new(
            LIST_PERSONS,
            "List all persons in the database",
            format!("SELECT id, name FROM {s}.persons ORDER BY name"),
        ),
        Template::new(
            LIST_ACCOUNTS,
            "List all account types (credit cards, etc.)",
            format!("SELECT id, account_name FROM {s}.account_type ORDER BY account_name"),
        ),
        Template::new(
            LIST_TABLES,
            "List the tables of the finance schema",
            format!(
                "SELECT table_name::text AS table_name, table_type::text AS table_type \
                 FROM information_schema.tables \
                 WHERE table_schema = '{s}' \
                 ORDER BY table_name"
            ),
        ),
        Template::new(
            DESCRIBE_TABLE,
            "Describe the columns of a finance table",
            format!(
                "SELECT column_name::text AS column_name, data_type::text AS data_type, \
                        is_nullable::text AS is_nullable, column_default::text AS column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = '{s}' AND table_name = $1::text \
                 ORDER BY ordinal_position"
            ),
        )
        .param(ParamSpec::text("table_name", "Table to describe.").required()),
    ]
}
