//! Step condition expressions.
//!
//! Supported expressions, evaluated against the chain's current data:
//! - `key == "value"`: exact match
//! - `key != "value"`: not equal
//! - `key contains "substr"`: substring match
//! - `key`: present and truthy (not `null`, `false`, `0`, `""`, `[]` or `{}`)
//! - `!key`: absent or falsy
//!
//! Non-string values compare by their JSON text, so `count == "3"` matches
//! the number 3.

use weave_core::types::Vars;

/// Evaluate a condition. Returns `false` for unparseable expressions.
pub fn evaluate_condition(expr: &str, data: &Vars) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return lookup_text(data, key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup_text(data, key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup_text(data, key).is_some_and(|s| s == value);
    }

    if let Some(key) = expr.strip_prefix('!') {
        let key = key.trim();
        return is_identifier(key) && !data.get(key).is_some_and(is_truthy);
    }

    is_identifier(expr) && data.get(expr).is_some_and(is_truthy)
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if !is_identifier(key) {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}

fn lookup_text(data: &Vars, key: &str) -> Option<String> {
    data.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(value: serde_json::Value) -> Vars {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Vars::new(),
        }
    }

    #[test]
    fn test_condition_equals() {
        let data = vars(serde_json::json!({"status": "success"}));
        assert!(evaluate_condition(r#"status == "success""#, &data));
        assert!(!evaluate_condition(r#"status == "failure""#, &data));
    }

    #[test]
    fn test_condition_not_equals() {
        let data = vars(serde_json::json!({"status": "success"}));
        assert!(evaluate_condition(r#"status != "failure""#, &data));
        assert!(!evaluate_condition(r#"status != "success""#, &data));
    }

    #[test]
    fn test_condition_contains() {
        let data = vars(serde_json::json!({"output": "The file was created successfully."}));
        assert!(evaluate_condition(r#"output contains "created""#, &data));
        assert!(!evaluate_condition(r#"output contains "deleted""#, &data));
    }

    #[test]
    fn test_condition_numbers_compare_as_text() {
        let data = vars(serde_json::json!({"count": 3}));
        assert!(evaluate_condition(r#"count == "3""#, &data));
        assert!(evaluate_condition("count == 3", &data));
    }

    #[test]
    fn test_condition_truthiness() {
        let data = vars(serde_json::json!({
            "flag": true, "off": false, "empty": "", "items": [1], "zero": 0
        }));
        assert!(evaluate_condition("flag", &data));
        assert!(evaluate_condition("items", &data));
        assert!(!evaluate_condition("off", &data));
        assert!(!evaluate_condition("empty", &data));
        assert!(!evaluate_condition("zero", &data));
        assert!(!evaluate_condition("missing", &data));
        assert!(evaluate_condition("!missing", &data));
        assert!(!evaluate_condition("!flag", &data));
    }

    #[test]
    fn test_condition_missing_key() {
        let data = Vars::new();
        assert!(!evaluate_condition(r#"missing == "value""#, &data));
        assert!(!evaluate_condition(r#"missing != "value""#, &data));
    }

    #[test]
    fn test_condition_invalid_expr() {
        let data = Vars::new();
        assert!(!evaluate_condition("this is not valid", &data));
        assert!(!evaluate_condition("", &data));
    }
}
