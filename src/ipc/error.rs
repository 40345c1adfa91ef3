use serde_json::json;

use crate::error::{EngineError, StoreError};

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Structured details for an engine error; always says whether a retry can
/// succeed without the user changing anything.
pub fn engine_details(e: &EngineError) -> serde_json::Value {
    let mut details = match e {
        EngineError::NotFound { entity, id } => json!({ "entity": entity, "id": id }),
        EngineError::Validation { problems } => json!({ "problems": problems }),
        EngineError::NoValidRows { errors } => json!({ "errors": errors }),
        EngineError::TooManyRows { rows, limit } => json!({ "rows": rows, "limit": limit }),
        EngineError::Cancelled { processed } => json!({ "processed": processed }),
        EngineError::Store(StoreError::ClearFailed { session_id, .. })
        | EngineError::Store(StoreError::RepopulateFailed { session_id, .. }) => {
            json!({ "classSessionId": session_id })
        }
        _ => json!({}),
    };
    details["retryable"] = json!(e.retryable());
    details
}
