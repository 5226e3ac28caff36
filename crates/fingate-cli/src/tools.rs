use fingate_store::Catalog;
use serde::Serialize;
use serde_json::{json, Value};

pub const DATABASE_STATUS: &str = "get_database_status";
pub const EXECUTE_SELECT: &str = "execute_select_query";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub fn describe(catalog: &Catalog) -> Vec<ToolDescriptor> {
    let mut tools: Vec<ToolDescriptor> = catalog
        .templates()
        .map(|template| ToolDescriptor {
            name: template.name.clone(),
            description: template.description.clone(),
            input_schema: template.input_schema(),
        })
        .collect();

    tools.push(ToolDescriptor {
        name: DATABASE_STATUS.to_string(),
        description: "Check database connection status and basic stats".to_string(),
        input_schema: json!({ "type": "object", "properties": {}, "required": [] }),
    });
    tools.push(ToolDescriptor {
        name: EXECUTE_SELECT.to_string(),
        description: "Execute a custom SELECT query (read-only, advanced users)".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A single SELECT statement against the budget_app schema."
                }
            },
            "required": ["query"]
        }),
    });
    tools
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_templates_and_builtins() {
        let catalog = Catalog::finance().unwrap();
        let tools = describe(&catalog);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        for expected in [
            "get_spending_summary",
            "get_recent_transactions",
            "get_monthly_totals",
            "get_category_breakdown",
            "search_transactions",
            "list_categories",
            "list_persons",
            "list_accounts",
            "list_tables",
            "describe_table",
            DATABASE_STATUS,
            EXECUTE_SELECT,
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert_eq!(names.len(), 12);
    }

    #[test]
    fn search_requires_a_term() {
        let catalog = Catalog::finance().unwrap();
        let tools = describe(&catalog);
        let search = tools.iter().find(|t| t.name == "search_transactions").unwrap();
        assert_eq!(search.input_schema["required"], json!(["search_term"]));

        let rendered = serde_json::to_value(search).unwrap();
        assert!(rendered.get("inputSchema").is_some());
    }
}
