//! Result-URL extraction from workflow stream records.
//!
//! The workflow service does not keep a stable frame shape, so each record is
//! probed with an ordered table of strategies and the first URL found wins.

use serde_json::Value;
use tracing::{debug, info};

pub const ERROR_EVENT: &str = "error";
pub const PROGRESS_EVENT: &str = "message";
pub const COMPLETION_EVENTS: [&str; 3] = ["Message.completed", "Done", "done"];
pub const CREDENTIAL_ACCEPTED: [&str; 2] = ["密钥正确", "success"];
pub const GENERIC_FAILURE: &str = "generation failed";
pub const GENERIC_PROGRESS: &str = "generating...";

/// Keys checked, in order, inside a re-parsed `message.content` object.
const NESTED_URL_KEYS: [&str; 4] = ["data", "output", "image_url", "url"];

/// A string starting with `http`.
pub fn url_shaped(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| s.starts_with("http"))
}

fn url_field(object: &Value, key: &str) -> Option<String> {
    object.get(key).and_then(url_shaped).map(str::to_string)
}

// Fields that carry JSON encoded as a string.
fn reparse(raw: &Value) -> Option<Value> {
    serde_json::from_str(raw.as_str()?).ok()
}

fn message_content(record: &Value) -> Option<&Value> {
    record.get("message")?.get("content")
}

pub struct Strategy {
    pub name: &'static str,
    /// Cheap shape check: does the record carry the field this strategy reads?
    pub applies: fn(&Value) -> bool,
    pub extract: fn(&Value) -> Option<String>,
}

pub const STRATEGIES: [Strategy; 7] = [
    Strategy {
        name: "content->data",
        applies: |r| r.get("content").is_some_and(Value::is_string),
        extract: |r| url_field(&reparse(r.get("content")?)?, "data"),
    },
    Strategy {
        name: "message.content->json",
        applies: |r| message_content(r).is_some_and(Value::is_string),
        extract: |r| {
            let parsed = reparse(message_content(r)?)?;
            NESTED_URL_KEYS.iter().find_map(|key| url_field(&parsed, key))
        },
    },
    Strategy {
        name: "message.content",
        applies: |r| message_content(r).and_then(Value::as_str).is_some_and(|s| serde_json::from_str::<Value>(s).is_err()),
        extract: |r| message_content(r).and_then(url_shaped).map(str::to_string),
    },
    Strategy { name: "output", applies: |r| r.get("output").is_some(), extract: |r| url_field(r, "output") },
    Strategy { name: "data", applies: |r| r.get("data").is_some(), extract: |r| url_field(r, "data") },
    Strategy { name: "image_url", applies: |r| r.get("image_url").is_some(), extract: |r| url_field(r, "image_url") },
    Strategy { name: "url", applies: |r| r.get("url").is_some(), extract: |r| url_field(r, "url") },
];

/// Runs the strategy table against one record, stopping at the first URL.
pub fn extract_url(record: &Value) -> Option<String> {
    STRATEGIES
        .iter()
        .filter(|strategy| (strategy.applies)(record))
        .find_map(|strategy| {
            let url = (strategy.extract)(record)?;
            info!("🎨 Extracted result URL via [{}]: {}", strategy.name, url);
            Some(url)
        })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn event(record: &Value) -> Option<&str> {
    record.get("event").and_then(Value::as_str)
}

fn describe(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("content"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        Value::Null | Value::Bool(_) => None,
        other => Some(other.to_string()),
    }
}

/// The failure message carried by an explicit error record, if this is one.
pub fn error_signal(record: &Value) -> Option<String> {
    let error = record.get("error").filter(|v| truthy(v));
    if error.is_none() && event(record) != Some(ERROR_EVENT) {
        return None;
    }
    let message = error
        .and_then(describe)
        .or_else(|| record.get("message").and_then(describe))
        .unwrap_or_else(|| GENERIC_FAILURE.to_string());
    Some(message)
}

/// Status text for a progress record.
pub fn progress_signal(record: &Value) -> Option<String> {
    if event(record) != Some(PROGRESS_EVENT) {
        return None;
    }
    let message = record.get("message").filter(|v| truthy(v))?;
    let text = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(GENERIC_PROGRESS);
    Some(text.to_string())
}

pub fn is_completion(record: &Value) -> bool {
    event(record).is_some_and(|e| COMPLETION_EVENTS.contains(&e))
}

pub fn credential_accepted(record: &Value) -> bool {
    record.get("key1").and_then(Value::as_str).is_some_and(|k| CREDENTIAL_ACCEPTED.contains(&k))
}

/// Everything the generation loop needs to know about one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inspection {
    pub url: Option<String>,
    pub error: Option<String>,
    pub progress: Option<String>,
    pub completed: bool,
}

pub fn inspect(record: &Value) -> Inspection {
    if credential_accepted(record) {
        info!("✅ Secret accepted by workflow: {}", record["key1"]);
    }
    let inspection = Inspection {
        url: extract_url(record),
        error: error_signal(record),
        progress: progress_signal(record),
        completed: is_completion(record),
    };
    if inspection.url.is_none() {
        debug!("No result URL in frame (keys: {:?})", record.as_object().map(|o| o.keys().collect::<Vec<_>>()));
    }
    inspection
}
