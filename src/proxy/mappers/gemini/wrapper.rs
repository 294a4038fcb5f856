// Gemini v1internal wrapping/unwrapping
use serde_json::{json, Map, Value};

pub const COUNT_TOKENS_ACTION: &str = "countTokens";

/// Wrap request body to v1internal format
pub fn build_upstream_request(action: &str, body: Value, model: &str, project_id: &str) -> Value {
    if action == COUNT_TOKENS_ACTION {
        return build_count_tokens_request(body, model);
    }
    json!({
        "model": model,
        "project": project_id,
        "request": body,
    })
}

/// countTokens takes `{request: {model: "models/<id>", ...}}` with no project.
/// Clients may send the contents directly or nested in `generateContentRequest`.
fn build_count_tokens_request(body: Value, model: &str) -> Value {
    let inner = match body {
        Value::Object(mut obj) => match obj
            .remove("generateContentRequest")
            .or_else(|| obj.remove("request"))
        {
            Some(nested) => nested,
            None => Value::Object(obj),
        },
        other => other,
    };

    let mut request = match inner {
        Value::Object(obj) => obj,
        _ => Map::new(),
    };
    request.insert("model".to_string(), json!(format!("models/{}", model)));

    json!({ "request": request })
}

/// Upstream method and query for an inbound action
pub fn upstream_method(action: &str, is_streaming: bool) -> (&str, Option<&'static str>) {
    if is_streaming {
        ("streamGenerateContent", Some("alt=sse"))
    } else {
        (action, None)
    }
}

/// Flatten a `response` envelope onto the top level; anything else passes through
pub fn unwrap_response(value: Value) -> Value {
    match value {
        Value::Object(mut obj) => match obj.remove("response") {
            Some(Value::Object(inner)) => {
                for (k, v) in inner {
                    obj.insert(k, v);
                }
                Value::Object(obj)
            }
            Some(other) => {
                obj.insert("response".to_string(), other);
                Value::Object(obj)
            }
            None => Value::Object(obj),
        },
        other => other,
    }
}
