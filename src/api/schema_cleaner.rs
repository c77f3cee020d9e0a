// JSON-Schema sanitizer for the Gemini function-declaration surface, which
// rejects schemas carrying keywords outside a fixed set. The walk is purely
// structural: $ref/$defs are kept as opaque values, never dereferenced.

use serde_json::Value;

/// Keys the Gemini schema surface accepts. Everything else is dropped,
/// except the immediate children of a `properties` map, which are
/// user-defined property names.
const KEEP_KEYS: &[&str] = &[
    "type",
    "properties",
    "required",
    "description",
    "enum",
    "items",
    "format",
    "nullable",
    "title",
    "anyOf",
    "$ref",
    "$defs",
    "$id",
    "$anchor",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
    "prefixItems",
    "additionalProperties",
    "propertyOrdering",
];

pub fn sanitize_schema(schema: &Value) -> Value {
    let mut out = schema.clone();
    walk(&mut out, false);
    out
}

fn walk(value: &mut Value, is_properties_map: bool) {
    match value {
        Value::Object(map) => {
            if !is_properties_map {
                map.retain(|key, _| KEEP_KEYS.contains(&key.as_str()));
            }
            let keys: Vec<String> = map.keys().cloned().collect();
            for key in keys {
                if let Some(child) = map.get_mut(&key) {
                    let child_is_props = !is_properties_map && key == "properties";
                    walk(child, child_is_props);
                }
            }
        }
        Value::Array(arr) => {
            for item in arr {
                walk(item, false);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Every recursively reachable key must be whitelisted, except keys that
    /// are immediate children of a `properties` map.
    fn assert_only_whitelisted(value: &Value, under_properties: bool) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    if !under_properties {
                        assert!(
                            KEEP_KEYS.contains(&key.as_str()),
                            "unexpected key survived: {}",
                            key
                        );
                    }
                    let child_under_props = !under_properties && key == "properties";
                    assert_only_whitelisted(child, child_under_props);
                }
            }
            Value::Array(arr) => {
                for item in arr {
                    assert_only_whitelisted(item, false);
                }
            }
            _ => {}
        }
    }

    #[test]
    fn drops_unsupported_keywords_keeps_whitelisted() {
        let schema = json!({
            "type": "object",
            "properties": {
                "x": { "type": "string", "examples": ["a"], "pattern": "." }
            },
            "additionalProperties": false,
            "$schema": "http://json-schema.org/draft-07/schema#"
        });
        let cleaned = sanitize_schema(&schema);
        assert_eq!(cleaned["type"], "object");
        assert_eq!(cleaned["additionalProperties"], false);
        assert_eq!(cleaned["properties"]["x"]["type"], "string");
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned["properties"]["x"].get("examples").is_none());
        assert!(cleaned["properties"]["x"].get("pattern").is_none());
        assert_only_whitelisted(&cleaned, false);
    }

    #[test]
    fn property_names_are_never_whitelisted() {
        // property names colliding with schema keywords must survive
        let schema = json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "properties": { "type": "object", "properties": { "y": { "type": "number", "multipleOf": 2 } } },
                "weird name!": { "type": "boolean" }
            }
        });
        let cleaned = sanitize_schema(&schema);
        assert!(cleaned["properties"].get("pattern").is_some());
        assert!(cleaned["properties"].get("weird name!").is_some());
        // the nested value named "properties" is a schema, and its own
        // nested properties map is exempt again
        assert_eq!(
            cleaned["properties"]["properties"]["properties"]["y"]["type"],
            "number"
        );
        assert!(cleaned["properties"]["properties"]["properties"]["y"]
            .get("multipleOf")
            .is_none());
        assert_only_whitelisted(&cleaned, false);
    }

    #[test]
    fn recurses_into_items_and_anyof() {
        let schema = json!({
            "type": "array",
            "items": {
                "anyOf": [
                    { "type": "string", "minLength": 3 },
                    { "type": "integer", "minimum": 0, "exclusiveMaximum": 10 }
                ]
            },
            "maxItems": 5,
            "uniqueItems": true
        });
        let cleaned = sanitize_schema(&schema);
        assert_eq!(cleaned["maxItems"], 5);
        assert!(cleaned.get("uniqueItems").is_none());
        assert!(cleaned["items"]["anyOf"][0].get("minLength").is_none());
        assert_eq!(cleaned["items"]["anyOf"][1]["minimum"], 0);
        assert!(cleaned["items"]["anyOf"][1].get("exclusiveMaximum").is_none());
        assert_only_whitelisted(&cleaned, false);
    }

    #[test]
    fn scalars_pass_through_untouched() {
        assert_eq!(sanitize_schema(&json!(true)), json!(true));
        assert_eq!(sanitize_schema(&json!(null)), json!(null));
    }
}
