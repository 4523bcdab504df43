use futures::future::BoxFuture;
use serde::Deserialize;

use weave_core::error::{Result, WeaveError};
use weave_core::traits::Tool;
use weave_core::types::{ToolContext, ToolOutput};

// ── JsonQueryTool ───────────────────────────────────────────────

pub struct JsonQueryTool;

#[derive(Deserialize)]
struct JsonQueryInput {
    json: serde_json::Value,
    path: String,
}

impl Tool for JsonQueryTool {
    fn name(&self) -> &str {
        "json_query"
    }
    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'foo.bar[0].baz')."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "json": { "description": "JSON value, or a string containing JSON" },
                "path": { "type": "string", "description": "Dot-notation path (e.g. 'items[0].name')" }
            },
            "required": ["json", "path"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let p: JsonQueryInput = serde_json::from_value(input)
                .map_err(|e| WeaveError::ToolValidation(e.to_string()))?;
            let value = match p.json {
                serde_json::Value::String(text) => serde_json::from_str(&text)
                    .map_err(|e| WeaveError::ToolValidation(format!("Invalid JSON: {}", e)))?,
                other => other,
            };
            Ok(ToolOutput::success(json_path_query(&value, &p.path)))
        })
    }
}

fn json_path_query(value: &serde_json::Value, path: &str) -> serde_json::Value {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        // key[0][1]
        let (key, indexes) = match segment.find('[') {
            Some(pos) => (&segment[..pos], &segment[pos..]),
            None => (segment, ""),
        };
        if !key.is_empty() {
            match current.get(key) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
        for idx in indexes
            .split(['[', ']'])
            .filter(|s| !s.is_empty())
        {
            match idx.parse::<usize>().ok().and_then(|i| current.get(i)) {
                Some(v) => current = v,
                None => return serde_json::Value::Null,
            }
        }
    }
    current.clone()
}

// ── RegexReplaceTool ────────────────────────────────────────────

pub struct RegexReplaceTool;

#[derive(Deserialize)]
struct RegexInput {
    text: String,
    pattern: String,
    replacement: String,
}

impl Tool for RegexReplaceTool {
    fn name(&self) -> &str {
        "regex_replace"
    }
    fn description(&self) -> &str {
        "Find and replace using regex."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "pattern": { "type": "string", "description": "Regex pattern" },
                "replacement": { "type": "string", "description": "Replacement string" }
            },
            "required": ["text", "pattern", "replacement"]
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let p: RegexInput = serde_json::from_value(input)
                .map_err(|e| WeaveError::ToolValidation(e.to_string()))?;
            let re = regex::Regex::new(&p.pattern)
                .map_err(|e| WeaveError::ToolValidation(format!("Invalid regex: {}", e)))?;
            let result = re.replace_all(&p.text, p.replacement.as_str()).to_string();
            Ok(ToolOutput::success(result))
        })
    }
}

// ── TextTemplateTool ────────────────────────────────────────────

pub struct TextTemplateTool;

impl Tool for TextTemplateTool {
    fn name(&self) -> &str {
        "text_template"
    }
    fn description(&self) -> &str {
        "Render a template, replacing {{name}} with the argument of the same name."
    }
    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "template": { "type": "string", "description": "Text with {{name}} placeholders" }
            },
            "required": ["template"],
            "additionalProperties": true
        })
    }
    fn execute(
        &self,
        input: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let template = input["template"]
                .as_str()
                .ok_or_else(|| WeaveError::ToolValidation("'template' must be a string".into()))?;
            let re = regex::Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}")
                .map_err(|e| WeaveError::ToolValidation(e.to_string()))?;

            let rendered = re.replace_all(template, |caps: &regex::Captures| {
                let value = json_path_query(&input, &caps[1]);
                match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                }
            });
            Ok(ToolOutput::success(rendered.into_owned()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weave_test_utils::test_context;

    #[tokio::test]
    async fn test_json_query_nested_path() {
        let out = JsonQueryTool
            .execute(
                serde_json::json!({
                    "json": {"items": [{"name": "a"}, {"name": "b"}]},
                    "path": "items[1].name"
                }),
                test_context(),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "b");
    }

    #[tokio::test]
    async fn test_json_query_string_input_and_missing_path() {
        let out = JsonQueryTool
            .execute(
                serde_json::json!({"json": "{\"a\": {\"b\": 3}}", "path": "a.c"}),
                test_context(),
            )
            .await
            .unwrap();
        assert_eq!(out.content, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_json_query_invalid_json_string() {
        let err = JsonQueryTool
            .execute(
                serde_json::json!({"json": "{not json", "path": "a"}),
                test_context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::ToolValidation(_)));
    }

    #[test]
    fn test_json_path_multi_index() {
        let value = serde_json::json!({"grid": [[1, 2], [3, 4]]});
        assert_eq!(json_path_query(&value, "grid[1][0]"), serde_json::json!(3));
        assert_eq!(json_path_query(&value, ""), value);
    }

    #[tokio::test]
    async fn test_regex_replace() {
        let out = RegexReplaceTool
            .execute(
                serde_json::json!({"text": "a1b22c", "pattern": "[0-9]+", "replacement": "#"}),
                test_context(),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "a#b#c");
    }

    #[tokio::test]
    async fn test_regex_replace_invalid_pattern() {
        let err = RegexReplaceTool
            .execute(
                serde_json::json!({"text": "x", "pattern": "(", "replacement": ""}),
                test_context(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn test_text_template() {
        let out = TextTemplateTool
            .execute(
                serde_json::json!({
                    "template": "{{ greeting }}, {{user.name}}! ({{count}}{{missing}})",
                    "greeting": "Hello",
                    "user": {"name": "Ada"},
                    "count": 3
                }),
                test_context(),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "Hello, Ada! (3)");
    }
}
