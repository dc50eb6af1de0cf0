//! Call envelopes: the serialized descriptor of one call or one batch.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::RpcError;

/// Resource name used by batch envelopes.
pub const BATCH_RESOURCE: &str = "batch";

/// How the client wants a response decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// The raw decoded value; non-2xx responses become errors.
    #[default]
    Default,
    /// A status-aware envelope; never an error.
    Object,
    /// The transport response itself; non-2xx responses become errors.
    Response,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Default => "default",
            ResponseType::Object => "object",
            ResponseType::Response => "response",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(ResponseType::Default),
            "object" => Some(ResponseType::Object),
            "response" => Some(ResponseType::Response),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level call descriptor.
///
/// For a batch (`batch == true`) `args` holds the non-batch sub-envelopes as JSON
/// values; they are validated one by one when the batch is executed so a malformed
/// item never fails its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub resource: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub batch: bool,
    #[serde(default)]
    pub response_type: ResponseType,
}

impl Envelope {
    pub fn single(resource: impl Into<String>, args: Vec<Value>) -> Self {
        Envelope {
            resource: resource.into(),
            args,
            batch: false,
            response_type: ResponseType::Default,
        }
    }

    pub fn batch(items: Vec<Envelope>) -> Self {
        Envelope {
            resource: BATCH_RESOURCE.to_string(),
            args: items.iter().map(Envelope::to_value).collect(),
            batch: true,
            response_type: ResponseType::Default,
        }
    }

    pub fn with_response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Validate a raw JSON value and turn it into an envelope.
    ///
    /// The value must be an object whose `resource` is a non-empty string and whose
    /// `args`, when present, is an array. Unknown `responseType` strings are rejected.
    pub fn from_value(value: &Value) -> Result<Self, RpcError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RpcError::validation("envelope must be a JSON object"))?;

        let resource = match obj.get("resource") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => {
                return Err(RpcError::validation("resource must not be empty"));
            }
            _ => return Err(RpcError::validation("resource must be a string")),
        };

        let args = match obj.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => return Err(RpcError::validation("args must be an array")),
        };

        let batch = match obj.get("batch") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(RpcError::validation("batch must be a boolean")),
        };

        let response_type = match obj.get("responseType") {
            None | Some(Value::Null) => ResponseType::Default,
            Some(Value::String(s)) => ResponseType::parse(s).ok_or_else(|| {
                RpcError::validation(format!("unknown responseType: {s}"))
            })?,
            Some(_) => return Err(RpcError::validation("responseType must be a string")),
        };

        Ok(Envelope {
            resource,
            args,
            batch,
            response_type,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "resource": self.resource,
            "args": self.args,
            "batch": self.batch,
            "responseType": self.response_type,
        })
    }

    /// Sub-envelopes of a batch that pass validation, with malformed and nested
    /// batch items dropped.
    pub fn batch_items(&self) -> Vec<Envelope> {
        self.args
            .iter()
            .filter_map(|item| match Envelope::from_value(item) {
                Ok(env) if !env.batch => Some(env),
                Ok(_) => {
                    tracing::debug!("dropping nested batch item");
                    None
                }
                Err(err) => {
                    tracing::debug!(error = %err, "dropping malformed batch item");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_envelope_gets_defaults() {
        let env = Envelope::from_value(&json!({"resource": "math.add"})).unwrap();
        assert_eq!(env.resource, "math.add");
        assert!(env.args.is_empty());
        assert!(!env.batch);
        assert_eq!(env.response_type, ResponseType::Default);
    }

    #[test]
    fn rejects_malformed_envelopes() {
        let cases = [
            json!("math.add"),
            json!([1, 2]),
            json!({"resource": ""}),
            json!({"resource": "   "}),
            json!({"resource": 12}),
            json!({"resource": "a", "args": {"x": 1}}),
            json!({"resource": "a", "batch": "yes"}),
            json!({"resource": "a", "responseType": "stream"}),
        ];
        for case in cases {
            let err = Envelope::from_value(&case).unwrap_err();
            assert_eq!(err.status, 400, "{case}");
        }
    }

    #[test]
    fn wire_shape_uses_camel_case() {
        let env = Envelope::single("echo", vec![json!(1)]).with_response_type(ResponseType::Object);
        let value = env.to_value();
        assert_eq!(value["responseType"], "object");
        assert_eq!(serde_json::to_value(&env).unwrap(), value);
        assert_eq!(Envelope::from_value(&value).unwrap(), env);
    }

    #[test]
    fn batch_items_drop_invalid_entries() {
        let batch = Envelope {
            resource: BATCH_RESOURCE.into(),
            args: vec![
                Envelope::single("a", vec![]).to_value(),
                json!(42),
                json!({"resource": "b", "args": "nope"}),
                Envelope::batch(vec![]).to_value(),
                Envelope::single("c", vec![json!(true)]).to_value(),
            ],
            batch: true,
            response_type: ResponseType::Default,
        };
        let items = batch.batch_items();
        let names: Vec<_> = items.iter().map(|e| e.resource.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
    }
}
