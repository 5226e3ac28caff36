use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;

use fingate_types::{ValidationRule, ValidationVerdict};
use sqlparser::ast::{Ident, ObjectName, Query, Statement, TableFactor, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

use crate::config::FINANCE_SCHEMA;

const MUTATING_VERBS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "CREATE",
    "COPY", "CALL", "EXECUTE", "DO", "MERGE", "VACUUM", "REINDEX", "CLUSTER", "LOCK", "LISTEN",
    "NOTIFY", "SET", "RESET", "INTO",
];

const ADMIN_FUNCTIONS: &[&str] = &[
    "PG_TERMINATE_BACKEND",
    "PG_CANCEL_BACKEND",
    "PG_RELOAD_CONF",
    "PG_ROTATE_LOGFILE",
    "PG_READ_FILE",
    "PG_READ_BINARY_FILE",
    "PG_LS_DIR",
    "PG_STAT_FILE",
    "LO_IMPORT",
    "LO_EXPORT",
    "LO_UNLINK",
    "DBLINK",
    "DBLINK_EXEC",
    "SET_CONFIG",
    "PG_ADVISORY_LOCK",
    "PG_ADVISORY_XACT_LOCK",
    "PG_PROMOTE",
    "PG_SWITCH_WAL",
    // These run SQL passed as a string, which no token or relation check can see.
    "QUERY_TO_XML",
    "QUERY_TO_XMLSCHEMA",
    "QUERY_TO_XML_AND_XMLSCHEMA",
    "CURSOR_TO_XML",
    "CURSOR_TO_XMLSCHEMA",
    "TABLE_TO_XML",
    "TABLE_TO_XMLSCHEMA",
    "TABLE_TO_XML_AND_XMLSCHEMA",
    "SCHEMA_TO_XML",
    "SCHEMA_TO_XMLSCHEMA",
    "SCHEMA_TO_XML_AND_XMLSCHEMA",
    "DATABASE_TO_XML",
    "DATABASE_TO_XMLSCHEMA",
    "DATABASE_TO_XML_AND_XMLSCHEMA",
];

const FINANCE_TABLES: &[&str] = &["transactions", "persons", "spending_categories", "account_type"];

// Echoed keywords and references are cut to this many characters.
const MAX_ECHO_CHARS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownSchema {
    schema: String,
    tables: BTreeSet<String>,
}

impl KnownSchema {
    pub fn new<I, S>(schema: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            schema: schema.into(),
            tables: tables.into_iter().map(Into::into).collect(),
        }
    }

    pub fn finance() -> Self {
        Self::new(FINANCE_SCHEMA, FINANCE_TABLES.iter().copied())
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    fn allows(&self, name: &ObjectName) -> bool {
        let parts: Vec<String> = name.0.iter().map(normalize_ident).collect();
        match parts.as_slice() {
            [table] => self.tables.contains(table),
            [schema, table] => *schema == self.schema && self.tables.contains(table),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    schema: Option<KnownSchema>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: KnownSchema) -> Self {
        Self {
            schema: Some(schema),
        }
    }

    pub fn known_schema(&self) -> Option<&KnownSchema> {
        self.schema.as_ref()
    }

    pub fn validate(&self, sql: &str) -> ValidationVerdict {
        if sql.trim().is_empty() {
            return ValidationVerdict::reject(ValidationRule::Empty, "Query is required");
        }

        let dialect = PostgreSqlDialect {};
        let tokens = match Tokenizer::new(&dialect, sql).tokenize() {
            Ok(tokens) => tokens,
            Err(err) => {
                debug!(error = %err, "statement failed to tokenize");
                return ValidationVerdict::reject(
                    ValidationRule::Malformed,
                    "Statement could not be tokenized",
                );
            }
        };
        let significant: Vec<&Token> = tokens
            .iter()
            .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
            .collect();

        if let Some(pos) = significant.iter().position(|t| matches!(t, Token::SemiColon)) {
            let trailing = &significant[pos + 1..];
            if trailing.iter().any(|t| !matches!(t, Token::SemiColon)) {
                return ValidationVerdict::reject(
                    ValidationRule::MultiStatement,
                    "Only a single statement may be executed",
                );
            }
        }

        match significant.first() {
            Some(Token::Word(word))
                if word.quote_style.is_none() && word.value.eq_ignore_ascii_case("SELECT") => {}
            Some(Token::Word(word)) if word.quote_style.is_none() => {
                return ValidationVerdict::reject(
                    ValidationRule::DisallowedVerb,
                    format!(
                        "Only SELECT queries are allowed; {} statements are rejected",
                        echo(&word.value.to_ascii_uppercase())
                    ),
                );
            }
            Some(_) => {
                return ValidationVerdict::reject(
                    ValidationRule::DisallowedVerb,
                    "Only SELECT queries are allowed; the statement must begin with SELECT",
                );
            }
            None => {
                return ValidationVerdict::reject(ValidationRule::Empty, "Query is required");
            }
        }

        for token in &significant {
            if let Token::Word(word) = token {
                if word.quote_style.is_some() {
                    continue;
                }
                let upper = word.value.to_ascii_uppercase();
                if MUTATING_VERBS.contains(&upper.as_str()) || ADMIN_FUNCTIONS.contains(&upper.as_str())
                {
                    return ValidationVerdict::reject(
                        ValidationRule::DenylistedKeyword,
                        format!(
                            "Query contains forbidden keyword: {}. Only read-only SELECT queries are allowed",
                            echo(&upper)
                        ),
                    );
                }
            }
        }

        match &self.schema {
            Some(schema) => check_references(sql, schema),
            None => ValidationVerdict::allow(),
        }
    }
}

pub fn strip_terminator(sql: &str) -> &str {
    let mut text = sql.trim();
    while let Some(rest) = text.strip_suffix(';') {
        text = rest.trim_end();
    }
    text
}

fn check_references(sql: &str, schema: &KnownSchema) -> ValidationVerdict {
    let dialect = PostgreSqlDialect {};
    let statements = match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => statements,
        Err(err) => {
            debug!(error = %err, "statement failed to parse");
            return ValidationVerdict::reject(
                ValidationRule::Malformed,
                "Statement could not be parsed for schema checks",
            );
        }
    };

    let mut collector = RelationCollector {
        schema,
        ctes: HashSet::new(),
        outside: None,
    };
    for statement in &statements {
        if !matches!(statement, Statement::Query(_)) {
            return ValidationVerdict::reject(
                ValidationRule::DisallowedVerb,
                "Only SELECT queries are allowed",
            );
        }
        if statement.visit(&mut collector).is_break() {
            break;
        }
    }

    match collector.outside {
        Some(reference) => ValidationVerdict::reject(
            ValidationRule::OutOfSchemaReference,
            format!(
                "Reference to {} is outside the {} schema",
                echo(&reference),
                schema.schema
            ),
        ),
        None => ValidationVerdict::allow(),
    }
}

struct RelationCollector<'a> {
    schema: &'a KnownSchema,
    ctes: HashSet<String>,
    outside: Option<String>,
}

impl Visitor for RelationCollector<'_> {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(normalize_ident(&cte.alias.name));
            }
        }
        ControlFlow::Continue(())
    }

    // Table functions such as generate_series are left to the denylist.
    fn pre_visit_table_factor(&mut self, factor: &TableFactor) -> ControlFlow<Self::Break> {
        let TableFactor::Table { name, args, .. } = factor else {
            return ControlFlow::Continue(());
        };
        if args.is_some() {
            return ControlFlow::Continue(());
        }
        if let [single] = name.0.as_slice() {
            if self.ctes.contains(&normalize_ident(single)) {
                return ControlFlow::Continue(());
            }
        }
        if self.schema.allows(name) {
            ControlFlow::Continue(())
        } else {
            self.outside = Some(name.to_string());
            ControlFlow::Break(())
        }
    }
}

fn normalize_ident(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

fn echo(text: &str) -> String {
    text.chars().take(MAX_ECHO_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_of(verdict: &ValidationVerdict) -> Option<ValidationRule> {
        verdict.rule
    }

    #[test]
    fn accepts_plain_select() {
        let validator = Validator::new();
        assert!(validator.validate("SELECT 1").allowed);
        assert!(validator.validate("  select * from transactions;  ").allowed);
        assert!(validator
            .validate("-- monthly\nSELECT amount FROM transactions /* all */")
            .allowed);
    }

    #[test]
    fn rejects_empty_statements() {
        let validator = Validator::new();
        assert_eq!(rule_of(&validator.validate("")), Some(ValidationRule::Empty));
        assert_eq!(rule_of(&validator.validate("   \n")), Some(ValidationRule::Empty));
        assert_eq!(rule_of(&validator.validate("-- nothing")), Some(ValidationRule::Empty));
    }

    #[test]
    fn rejects_non_select_verbs() {
        let validator = Validator::new();
        for sql in [
            "INSERT INTO transactions VALUES (1)",
            "update transactions set amount = 0",
            "DELETE FROM transactions",
            "DROP TABLE transactions",
            "ALTER TABLE transactions ADD COLUMN x int",
            "TRUNCATE transactions",
            "GRANT ALL ON transactions TO public",
            "CREATE TABLE x (id int)",
            "COPY transactions TO '/tmp/out'",
            "CALL refresh_totals()",
            "WITH x AS (SELECT 1) SELECT * FROM x",
        ] {
            let verdict = validator.validate(sql);
            assert!(!verdict.allowed, "{sql}");
            assert_eq!(rule_of(&verdict), Some(ValidationRule::DisallowedVerb), "{sql}");
        }
    }

    #[test]
    fn names_the_rejected_verb() {
        let verdict = Validator::new().validate("delete from transactions");
        assert!(verdict.reason.unwrap().contains("DELETE"));
    }

    #[test]
    fn rejects_leading_punctuation() {
        let verdict = Validator::new().validate("(SELECT 1)");
        assert_eq!(rule_of(&verdict), Some(ValidationRule::DisallowedVerb));
    }

    #[test]
    fn rejects_multiple_statements() {
        let validator = Validator::new();
        let verdict = validator.validate("SELECT 1; DROP TABLE transactions;");
        assert_eq!(rule_of(&verdict), Some(ValidationRule::MultiStatement));
        assert!(!verdict.reason.unwrap().contains("transactions"));

        let verdict = validator.validate("SELECT 1; SELECT 2");
        assert_eq!(rule_of(&verdict), Some(ValidationRule::MultiStatement));
    }

    #[test]
    fn allows_trailing_terminators() {
        let validator = Validator::new();
        assert!(validator.validate("SELECT 1;").allowed);
        assert!(validator.validate("SELECT 1;;  -- done").allowed);
    }

    #[test]
    fn rejects_embedded_denylisted_keywords() {
        let validator = Validator::new();
        for sql in [
            "SELECT * FROM t WHERE x IN (DELETE FROM t RETURNING id)",
            "SELECT * FROM transactions FOR UPDATE",
            "SELECT pg_terminate_backend(123)",
            "SELECT pg_read_file('/etc/passwd')",
            "SELECT set_config('search_path', 'public', false)",
            "SELECT 1 FROM x WHERE EXISTS (SELECT 1) AND drop = 1",
            "SELECT * INTO stolen FROM transactions",
        ] {
            let verdict = validator.validate(sql);
            assert_eq!(
                rule_of(&verdict),
                Some(ValidationRule::DenylistedKeyword),
                "{sql}"
            );
        }
    }

    #[test]
    fn ignores_keywords_inside_literals_identifiers_and_comments() {
        let validator = Validator::new();
        for sql in [
            "SELECT created_at, updated_at FROM transactions",
            "SELECT * FROM transactions WHERE description = 'DELETE ME'",
            "SELECT \"update\" FROM transactions",
            "SELECT 1 -- drop table transactions",
            "SELECT 1 /* insert */",
        ] {
            assert!(validator.validate(sql).allowed, "{sql}");
        }
    }

    #[test]
    fn rejects_unterminated_literals() {
        let verdict = Validator::new().validate("SELECT 'oops");
        assert_eq!(rule_of(&verdict), Some(ValidationRule::Malformed));
    }

    #[test]
    fn schema_allowlist_accepts_known_tables() {
        let validator = Validator::with_schema(KnownSchema::finance());
        for sql in [
            "SELECT * FROM transactions",
            "SELECT t.amount FROM budget_app.transactions t JOIN persons p ON p.id = t.person_id",
            "SELECT * FROM TRANSACTIONS",
            "SELECT 1",
            "SELECT * FROM (SELECT * FROM transactions) AS sub",
            "SELECT * FROM (WITH recent AS (SELECT * FROM transactions) SELECT * FROM recent) AS r",
            "SELECT * FROM transactions WHERE category_id IN (SELECT id FROM spending_categories)",
        ] {
            let verdict = validator.validate(sql);
            assert!(verdict.allowed, "{sql}: {:?}", verdict.reason);
        }
    }

    #[test]
    fn schema_allowlist_rejects_foreign_references() {
        let validator = Validator::with_schema(KnownSchema::finance());
        for sql in [
            "SELECT * FROM pg_shadow",
            "SELECT * FROM public.transactions",
            "SELECT * FROM information_schema.tables",
            "SELECT * FROM transactions t JOIN secrets s ON s.id = t.id",
            "SELECT * FROM transactions WHERE person_id IN (SELECT id FROM pg_catalog.pg_user)",
        ] {
            let verdict = validator.validate(sql);
            assert_eq!(
                rule_of(&verdict),
                Some(ValidationRule::OutOfSchemaReference),
                "{sql}"
            );
        }
    }

    #[test]
    fn string_executing_functions_are_denylisted_under_schema() {
        let validator = Validator::with_schema(KnownSchema::finance());
        for sql in [
            "SELECT query_to_xml('select * from pg_catalog.pg_authid', true, false, '')",
            "SELECT query_to_xml_and_xmlschema('select 1', true, false, '')::text",
            "SELECT table_to_xml('pg_catalog.pg_authid', true, false, '')",
            "SELECT cursor_to_xml('c', 10, true, false, '')",
            "SELECT schema_to_xml('pg_catalog', true, false, '')",
            "SELECT database_to_xmlschema(true, false, '')",
        ] {
            let verdict = validator.validate(sql);
            assert_eq!(
                rule_of(&verdict),
                Some(ValidationRule::DenylistedKeyword),
                "{sql}"
            );
        }
    }

    #[test]
    fn select_into_is_rejected_with_or_without_schema() {
        let sql = "SELECT * INTO stolen FROM transactions";
        for validator in [Validator::new(), Validator::with_schema(KnownSchema::finance())] {
            let verdict = validator.validate(sql);
            assert!(!verdict.allowed);
            assert_eq!(rule_of(&verdict), Some(ValidationRule::DenylistedKeyword));
        }
    }

    #[test]
    fn table_functions_are_not_schema_references() {
        let validator = Validator::with_schema(KnownSchema::finance());
        for sql in [
            "SELECT * FROM generate_series(1, 3)",
            "SELECT g FROM generate_series(1, 3) AS g JOIN transactions t ON t.id = g",
        ] {
            let verdict = validator.validate(sql);
            assert!(verdict.allowed, "{sql}: {:?}", verdict.reason);
        }
        let verdict = validator.validate("SELECT * FROM generate_series(1, 3) g, pg_catalog.pg_user u");
        assert_eq!(rule_of(&verdict), Some(ValidationRule::OutOfSchemaReference));
    }

    #[test]
    fn schema_check_skipped_without_metadata() {
        let validator = Validator::new();
        assert!(validator.validate("SELECT * FROM pg_stat_activity").allowed);
        assert!(validator.known_schema().is_none());
    }

    #[test]
    fn strip_terminator_removes_trailing_semicolons() {
        assert_eq!(strip_terminator("  SELECT 1 ; ;  "), "SELECT 1");
        assert_eq!(strip_terminator("SELECT ';'"), "SELECT ';'");
    }
}
