//! Input schema normalization for aggregated tools.
//!
//! Some MCP clients reject tools whose `inputSchema` is absent, or whose
//! object schema declares neither `properties` nor `additionalProperties`.
//! Backends are not always strict about this, so every tool entering the
//! unified catalog goes through [`normalize_input_schema`].

use serde_json::{json, Map, Value};

/// The permissive schema substituted for tools that advertise none.
pub fn default_input_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Normalizes a tool's input schema.
///
/// # Rules
///
/// * absent or `null` schema becomes `{"type":"object","properties":{}}`
/// * `{"type":"object", ...}` with neither `properties` nor
///   `additionalProperties` gains an empty `properties` object; every other
///   field is preserved unchanged
/// * anything else is returned as-is
///
/// The function is idempotent: normalizing its own output is a no-op.
///
/// # Examples
///
/// ```
/// use mcpgate::mcp::schema::normalize_input_schema;
/// use serde_json::json;
///
/// let fixed = normalize_input_schema(Some(json!({"type": "object"})), "probe");
/// assert_eq!(fixed, json!({"type": "object", "properties": {}}));
/// ```
pub fn normalize_input_schema(schema: Option<Value>, tool_name: &str) -> Value {
    let schema = match schema {
        None | Some(Value::Null) => {
            tracing::debug!(tool = %tool_name, "tool has no input schema, using default");
            return default_input_schema();
        }
        Some(schema) => schema,
    };

    let Value::Object(mut fields) = schema else {
        return schema;
    };

    if is_bare_object_schema(&fields) {
        tracing::debug!(tool = %tool_name, "object schema lacks properties, adding empty set");
        fields.insert("properties".to_string(), Value::Object(Map::new()));
    }

    Value::Object(fields)
}

fn is_bare_object_schema(fields: &Map<String, Value>) -> bool {
    fields.get("type").and_then(Value::as_str) == Some("object")
        && !fields.contains_key("properties")
        && !fields.contains_key("additionalProperties")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_schema_gets_default() {
        assert_eq!(normalize_input_schema(None, "t"), default_input_schema());
        assert_eq!(
            normalize_input_schema(Some(Value::Null), "t"),
            default_input_schema()
        );
    }

    #[test]
    fn bare_object_keeps_other_fields() {
        let schema = json!({"type": "object", "required": ["q"], "description": "d"});
        let normalized = normalize_input_schema(Some(schema), "t");
        assert_eq!(
            normalized,
            json!({"type": "object", "required": ["q"], "description": "d", "properties": {}})
        );
    }

    #[test]
    fn additional_properties_counts_as_declared() {
        let schema = json!({"type": "object", "additionalProperties": true});
        assert_eq!(normalize_input_schema(Some(schema.clone()), "t"), schema);
    }

    #[test]
    fn valid_schema_is_untouched() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        assert_eq!(normalize_input_schema(Some(schema.clone()), "t"), schema);
    }

    #[test]
    fn non_object_schemas_pass_through() {
        for schema in [json!({"type": "string"}), json!(true), json!({"$ref": "#/defs/x"})] {
            assert_eq!(normalize_input_schema(Some(schema.clone()), "t"), schema);
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            None,
            Some(json!({"type": "object"})),
            Some(json!({"type": "object", "properties": {"a": {"type": "number"}}})),
            Some(json!({"type": "object", "additionalProperties": false})),
            Some(json!({"type": "array", "items": {}})),
            Some(json!("weird")),
        ];

        for sample in samples {
            let once = normalize_input_schema(sample, "t");
            let twice = normalize_input_schema(Some(once.clone()), "t");
            assert_eq!(once, twice);
        }
    }
}
