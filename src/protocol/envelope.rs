//! Request and response envelopes.
//!
//! Inbound messages are decoded into a [`RequestEnvelope`], a thin wrapper
//! over the raw JSON object. Graph requests are then validated into a typed
//! [`GraphRequest`]; annotation requests skip validation and travel to the
//! engine as the raw envelope.
//!
//! Outbound messages are [`ResponseEnvelope`]s: the identifying fields of the
//! originating request followed by either a full result, one partial result,
//! or an error.
//!
//! # Example
//!
//! ```
//! use metrilyx_dataserver::codec::JsonCodec;
//! use metrilyx_dataserver::protocol::GraphRequest;
//!
//! let envelope = JsonCodec::decode(
//!     r#"{"_id":"g1","graphType":"line","name":"cpu","start":1000,"series":[{"q":"a"}]}"#,
//! ).unwrap();
//! let request = GraphRequest::try_from(&envelope).unwrap();
//! assert_eq!(request.id, "g1");
//! assert_eq!(request.series.len(), 1);
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DataserverError, Result};

/// Identifier that routes a request down the annotation path.
pub const ANNOTATIONS_ID: &str = "annotations";

/// Wire name of the request identifier.
pub const ID_FIELD: &str = "_id";

/// Accepted alias for the request identifier on input.
pub const ID_ALIAS: &str = "identifier";

const IDENTITY_FIELDS: [&str; 4] = [ID_FIELD, "graphType", "name", "start"];

/// A decoded client message.
///
/// Nothing beyond "is a JSON object" is checked at this stage.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RequestEnvelope(Map<String, Value>);

impl RequestEnvelope {
    /// Wrap a decoded JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// The request identifier, from `_id` or its `identifier` alias.
    pub fn id(&self) -> Option<&str> {
        self.0
            .get(ID_FIELD)
            .or_else(|| self.0.get(ID_ALIAS))
            .and_then(Value::as_str)
    }

    /// Whether this envelope selects the annotation path.
    pub fn is_annotations(&self) -> bool {
        self.id() == Some(ANNOTATIONS_ID)
    }

    /// An `error` field the client sent itself, if it is truthy.
    pub fn reported_error(&self) -> Option<&Value> {
        self.0.get("error").filter(|v| is_truthy(v))
    }

    /// Look up a raw field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Borrow the underlying object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Best-effort identifying fields, for envelopes that skip validation.
    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            id: self.id().unwrap_or_default().to_string(),
            graph_type: self.get("graphType").and_then(Value::as_str).map(String::from),
            name: self.get("name").and_then(Value::as_str).map(String::from),
            start: self.get("start").and_then(parse_start),
        }
    }
}

impl fmt::Display for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// Identifying fields mirrored from a request onto each of its responses.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestMeta {
    pub id: String,
    pub graph_type: Option<String>,
    pub name: Option<String>,
    pub start: Option<f64>,
}

/// A validated graph request.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRequest {
    pub id: String,
    pub graph_type: String,
    pub name: String,
    /// Unix time in seconds, fractional allowed.
    pub start: f64,
    /// Sub-query specifications, in request order.
    pub series: Vec<Value>,
    /// Any other fields the client sent (`end`, `tags`, ...).
    pub extra: Map<String, Value>,
}

impl GraphRequest {
    /// Identifying fields for responses to this request.
    pub fn meta(&self) -> RequestMeta {
        RequestMeta {
            id: self.id.clone(),
            graph_type: Some(self.graph_type.clone()),
            name: Some(self.name.clone()),
            start: Some(self.start),
        }
    }
}

impl TryFrom<&RequestEnvelope> for GraphRequest {
    type Error = DataserverError;

    fn try_from(envelope: &RequestEnvelope) -> Result<Self> {
        let id = envelope
            .id()
            .ok_or_else(|| missing(ID_FIELD))?
            .to_string();
        let graph_type = required_str(envelope, "graphType")?;
        let name = required_str(envelope, "name")?;
        let start = envelope
            .get("start")
            .ok_or_else(|| missing("start"))?;
        let start = parse_start(start).ok_or_else(|| {
            DataserverError::Validation(format!("'start' is not a valid timestamp: {}", start))
        })?;
        let series = match envelope.get("series") {
            Some(Value::Array(items)) if !items.is_empty() => items.clone(),
            Some(Value::Array(_)) => {
                return Err(DataserverError::Validation(
                    "'series' must not be empty".to_string(),
                ))
            }
            Some(_) => {
                return Err(DataserverError::Validation(
                    "'series' must be a list".to_string(),
                ))
            }
            None => return Err(missing("series")),
        };

        let extra = envelope
            .as_map()
            .iter()
            .filter(|(k, _)| {
                !IDENTITY_FIELDS.contains(&k.as_str()) && *k != ID_ALIAS && *k != "series"
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            id,
            graph_type,
            name,
            start,
            series,
            extra,
        })
    }
}

fn missing(field: &str) -> DataserverError {
    DataserverError::Validation(format!("missing required field '{}'", field))
}

fn required_str(envelope: &RequestEnvelope, field: &str) -> Result<String> {
    match envelope.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(DataserverError::Validation(format!(
            "'{}' must be a string, got {}",
            field, other
        ))),
        None => Err(missing(field)),
    }
}

/// Accepts a number or a numeric string; rejects non-finite values.
fn parse_start(value: &Value) -> Option<f64> {
    let start = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    start.is_finite().then_some(start)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Render a request start time for log lines.
pub fn format_start(start: f64) -> String {
    let secs = start.floor();
    let nanos = ((start - secs) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| start.to_string())
}

/// Result payload carried by a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// The aggregate result for the whole request.
    Complete(Map<String, Value>),
    /// The result for one sub-query, by position in `series`.
    Partial {
        sub_query: usize,
        payload: Map<String, Value>,
    },
    /// A client-facing error description.
    Error(String),
}

/// An outbound message.
///
/// Serializes as one flat JSON object: identity fields first, then the body.
/// Body keys never override identity fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub meta: RequestMeta,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn complete(meta: RequestMeta, payload: Map<String, Value>) -> Self {
        Self {
            meta,
            body: ResponseBody::Complete(payload),
        }
    }

    pub fn partial(meta: RequestMeta, sub_query: usize, payload: Map<String, Value>) -> Self {
        Self {
            meta,
            body: ResponseBody::Partial { sub_query, payload },
        }
    }

    pub fn error(meta: RequestMeta, message: impl Into<String>) -> Self {
        Self {
            meta,
            body: ResponseBody::Error(message.into()),
        }
    }
}

impl Serialize for ResponseEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(ID_FIELD, &self.meta.id)?;
        if let Some(graph_type) = &self.meta.graph_type {
            map.serialize_entry("graphType", graph_type)?;
        }
        if let Some(name) = &self.meta.name {
            map.serialize_entry("name", name)?;
        }
        if let Some(start) = self.meta.start {
            map.serialize_entry("start", &start)?;
        }

        let (payload, reserved): (_, &[&str]) = match &self.body {
            ResponseBody::Complete(payload) => (payload, &[]),
            ResponseBody::Partial { sub_query, payload } => {
                map.serialize_entry("partial", &true)?;
                map.serialize_entry("subQuery", sub_query)?;
                (payload, &["partial", "subQuery"])
            }
            ResponseBody::Error(message) => {
                map.serialize_entry("error", message)?;
                return map.end();
            }
        };
        for (key, value) in payload {
            if IDENTITY_FIELDS.contains(&key.as_str()) || reserved.contains(&key.as_str()) {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// The bare `{"error": ...}` reply sent for frames that never became requests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReply {
    pub error: String,
}

impl ErrorReply {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> RequestEnvelope {
        match value {
            Value::Object(map) => RequestEnvelope::from_map(map),
            other => panic!("not an object: {}", other),
        }
    }

    fn graph_json() -> Value {
        json!({
            "_id": "g1",
            "graphType": "line",
            "name": "cpu",
            "start": 1000,
            "end": 2000,
            "series": [{"q": "a"}, {"q": "b"}]
        })
    }

    #[test]
    fn test_validate_graph_request() {
        let request = GraphRequest::try_from(&envelope(graph_json())).unwrap();

        assert_eq!(request.id, "g1");
        assert_eq!(request.graph_type, "line");
        assert_eq!(request.name, "cpu");
        assert_eq!(request.start, 1000.0);
        assert_eq!(request.series, vec![json!({"q": "a"}), json!({"q": "b"})]);
        assert_eq!(request.extra.get("end"), Some(&json!(2000)));
        assert!(!request.extra.contains_key("series"));
    }

    #[test]
    fn test_identifier_alias_accepted() {
        let env = envelope(json!({
            "identifier": "g2",
            "graphType": "area",
            "name": "mem",
            "start": "1000.25",
            "series": [{"q": "a"}]
        }));

        let request = GraphRequest::try_from(&env).unwrap();
        assert_eq!(request.id, "g2");
        assert_eq!(request.start, 1000.25);
        assert!(request.extra.is_empty());
    }

    #[test]
    fn test_missing_fields_rejected() {
        for field in ["_id", "graphType", "name", "start", "series"] {
            let mut value = graph_json();
            value.as_object_mut().unwrap().remove(field);

            let err = GraphRequest::try_from(&envelope(value)).unwrap_err();
            assert!(
                matches!(err, DataserverError::Validation(ref m) if m.contains(field)),
                "field {} gave {:?}",
                field,
                err
            );
        }
    }

    #[test]
    fn test_malformed_fields_rejected() {
        let cases = [
            ("name", json!(7)),
            ("start", json!("yesterday")),
            ("start", json!(null)),
            ("series", json!({"q": "a"})),
            ("series", json!([])),
        ];
        for (field, bad) in cases {
            let mut value = graph_json();
            value[field] = bad;
            assert!(GraphRequest::try_from(&envelope(value)).is_err());
        }
    }

    #[test]
    fn test_annotation_detection() {
        let env = envelope(json!({"_id": "annotations", "types": ["deploy"]}));
        assert!(env.is_annotations());
        assert_eq!(env.meta().id, "annotations");
        assert_eq!(env.meta().graph_type, None);

        assert!(!envelope(graph_json()).is_annotations());
    }

    #[test]
    fn test_reported_error_truthiness() {
        assert!(envelope(json!({"error": "boom"})).reported_error().is_some());
        assert!(envelope(json!({"error": ""})).reported_error().is_none());
        assert!(envelope(json!({"error": null})).reported_error().is_none());
        assert!(envelope(json!({"error": false})).reported_error().is_none());
        assert!(envelope(graph_json()).reported_error().is_none());
    }

    #[test]
    fn test_partial_response_shape() {
        let request = GraphRequest::try_from(&envelope(graph_json())).unwrap();
        let mut payload = Map::new();
        payload.insert("series".into(), json!([{"alias": "a", "data": [[1, 2]]}]));
        // identity fields in the payload must not leak through
        payload.insert("name".into(), json!("spoofed"));

        let response = ResponseEnvelope::partial(request.meta(), 1, payload);
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["_id"], "g1");
        assert_eq!(value["graphType"], "line");
        assert_eq!(value["name"], "cpu");
        assert_eq!(value["start"], 1000.0);
        assert_eq!(value["partial"], true);
        assert_eq!(value["subQuery"], 1);
        assert_eq!(value["series"][0]["alias"], "a");
    }

    #[test]
    fn test_error_response_shape() {
        let meta = RequestMeta {
            id: "annotations".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(ResponseEnvelope::error(meta, "timeout")).unwrap();

        assert_eq!(value, json!({"_id": "annotations", "error": "timeout"}));
    }

    #[test]
    fn test_format_start() {
        assert_eq!(format_start(0.0), "1970-01-01 00:00:00");
        assert_eq!(format_start(1000.5), "1970-01-01 00:16:40");
    }
}
