use std::io::{self, BufRead, Write};

use fingate_store::Gateway;
use fingate_types::{GatewayError, GatewayResult, JsonMap};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::tools::{DATABASE_STATUS, EXECUTE_SELECT};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServeRequest {
    #[serde(default)]
    id: Option<Value>,
    tool: String,
    #[serde(default)]
    arguments: JsonMap,
}

pub fn call(gateway: &Gateway, tool: &str, arguments: &JsonMap) -> Value {
    match try_call(gateway, tool, arguments) {
        Ok(value) => value,
        Err(err) => to_value(&err),
    }
}

fn try_call(gateway: &Gateway, tool: &str, arguments: &JsonMap) -> GatewayResult<Value> {
    match tool {
        DATABASE_STATUS => Ok(to_value(&gateway.get_database_status())),
        EXECUTE_SELECT => {
            let query = match arguments.get("query").or_else(|| arguments.get("raw_statement")) {
                None | Some(Value::Null) => "",
                Some(Value::String(text)) => text.as_str(),
                Some(_) => return Err(GatewayError::invalid_parameters("query must be a string")),
            };
            let result = gateway.execute_select_query(query)?;
            Ok(json!({ "tool": tool, "query": query.trim(), "result": result }))
        }
        _ => {
            let outcome = gateway.call_template(tool, arguments)?;
            Ok(json!({
                "tool": tool,
                "parameters": outcome.parameters,
                "result": outcome.result,
            }))
        }
    }
}

pub fn serve<R: BufRead, W: Write>(gateway: &Gateway, input: R, mut output: W) -> io::Result<usize> {
    let mut handled = 0;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match parse_json::<ServeRequest>(&line) {
            Ok(request) => {
                debug!(tool = %request.tool, "request received");
                let mut response = call(gateway, &request.tool, &request.arguments);
                if let (Some(id), Value::Object(map)) = (request.id, &mut response) {
                    map.insert("id".to_string(), id);
                }
                response
            }
            Err(err) => to_value(&err),
        };
        writeln!(output, "{}", response)?;
        output.flush()?;
        handled += 1;
    }
    info!(requests = handled, "input closed");
    Ok(handled)
}

pub fn parse_json<T: DeserializeOwned>(payload: &str) -> GatewayResult<T> {
    serde_json::from_str(payload)
        .map_err(|err| GatewayError::invalid_parameters(format!("malformed request: {}", err)))
}

pub fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| {
        json!({ "error": true, "kind": "execution_error", "message": err.to_string() })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingate_store::{Backend, ExecutionLimits, KnownSchema, Statement, Validator};
    use fingate_types::{ColumnDescriptor, ColumnType, DbStatus, QueryResult, ScalarValue};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CannedBackend {
        fetches: AtomicUsize,
    }

    impl Backend for CannedBackend {
        fn fetch(
            &self,
            _statement: Statement<'_>,
            _limits: &ExecutionLimits,
        ) -> GatewayResult<QueryResult> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            QueryResult::new(
                vec![ColumnDescriptor::new("n", ColumnType::Integer)],
                vec![vec![ScalarValue::Integer(8)]],
                false,
            )
        }

        fn status(&self) -> DbStatus {
            DbStatus {
                reachable: false,
                latency_ms: None,
                server_version: None,
                database: "money_stuff".to_string(),
                host: "127.0.0.1".to_string(),
                schema: "budget_app".to_string(),
                stats: None,
                stats_error: None,
                error: Some("Cannot connect".to_string()),
                hint: Some("later".to_string()),
            }
        }
    }

    fn gateway() -> (Gateway, Arc<CannedBackend>) {
        let backend = Arc::new(CannedBackend::default());
        let gateway = Gateway::with_backend(
            backend.clone(),
            Validator::with_schema(KnownSchema::finance()),
            ExecutionLimits::default(),
        )
        .unwrap();
        (gateway, backend)
    }

    fn args(value: Value) -> JsonMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn template_call_reports_parameters_and_rows() {
        let (gateway, _) = gateway();
        let response = call(&gateway, "search_transactions", &args(json!({ "search_term": "Amazon" })));
        assert_eq!(response["tool"], "search_transactions");
        assert_eq!(response["parameters"]["limit"], 20);
        assert_eq!(response["result"]["row_count"], 1);
        assert_eq!(response["result"]["rows"][0][0], 8);
    }

    #[test]
    fn errors_are_values() {
        let (gateway, backend) = gateway();
        let response = call(&gateway, "launch_rockets", &JsonMap::new());
        assert_eq!(response["error"], true);
        assert_eq!(response["kind"], "unknown_template");
        assert_eq!(response["message"], "Unknown tool: launch_rockets");

        let response = call(
            &gateway,
            EXECUTE_SELECT,
            &args(json!({ "query": "DROP TABLE budget_app.transactions" })),
        );
        assert_eq!(response["kind"], "validation_rejected");
        assert_eq!(response["rule"], "disallowed_verb");

        let response = call(&gateway, EXECUTE_SELECT, &args(json!({ "query": 42 })));
        assert_eq!(response["kind"], "invalid_parameters");
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn status_is_not_an_error() {
        let (gateway, _) = gateway();
        let response = call(&gateway, DATABASE_STATUS, &JsonMap::new());
        assert_eq!(response["reachable"], false);
        assert!(response.get("kind").is_none());
    }

    #[test]
    fn serve_answers_each_line() {
        let (gateway, _) = gateway();
        let input = concat!(
            "{\"id\": 1, \"tool\": \"execute_select_query\", \"arguments\": {\"query\": \"SELECT COUNT(*) AS n FROM budget_app.transactions\"}}\n",
            "\n",
            "not json\n",
            "{\"id\": \"b\", \"tool\": \"list_persons\"}\n",
        );
        let mut output = Vec::new();
        let handled = serve(&gateway, input.as_bytes(), &mut output).unwrap();
        assert_eq!(handled, 3);

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["id"], 1);
        assert_eq!(lines[0]["result"]["rows"][0][0], 8);
        assert_eq!(lines[1]["kind"], "invalid_parameters");
        assert_eq!(lines[2]["id"], "b");
        assert_eq!(lines[2]["tool"], "list_persons");
    }
}
