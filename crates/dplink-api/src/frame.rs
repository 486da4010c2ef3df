// ── Decoded device replies ──

use serde_json::Value;

use crate::error::Error;
use crate::value::{DpValues, values_from_json};

/// One decoded reply from a device.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Datapoint values. A full status reply carries every datapoint the
    /// device chose to report; pushes and partial replies carry a subset.
    Dps(DpValues),
    /// The transport or device reported an error instead of data.
    Error {
        code: Option<String>,
        message: String,
        payload: Option<String>,
    },
    /// Nothing arrived (heartbeat ack, idle receive).
    Empty,
}

impl Frame {
    /// Decode the conventional JSON envelope.
    ///
    /// `{"dps": {...}}` yields [`Frame::Dps`]; an object carrying `Error`
    /// (with optional `Err` code and `Payload`) yields [`Frame::Error`];
    /// `null` or an object with neither yields [`Frame::Empty`].
    pub fn from_json(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Empty;
        };

        if let Some(message) = object.get("Error") {
            return Self::Error {
                code: object.get("Err").map(scalar_text),
                message: scalar_text(message),
                payload: object
                    .get("Payload")
                    .filter(|p| !p.is_null())
                    .map(scalar_text),
            };
        }

        match object.get("dps").and_then(Value::as_object) {
            Some(dps) => Self::Dps(values_from_json(dps)),
            None => Self::Empty,
        }
    }

    /// Parse a JSON envelope from text.
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Ok(Self::Empty);
        }
        let value: Value = serde_json::from_str(text).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: text.to_owned(),
        })?;
        Ok(Self::from_json(&value))
    }

    pub fn dps(&self) -> Option<&DpValues> {
        match self {
            Self::Dps(dps) => Some(dps),
            _ => None,
        }
    }

    /// Turn an error frame into the matching transport error.
    ///
    /// Error codes follow the common device-library numbering: 901/905 are
    /// network failures, 902 a timeout, 904/914 a payload that did not
    /// decode (wrong version or key); anything else is a device rejection.
    pub fn into_result(self) -> Result<Self, Error> {
        let (code, message, payload) = match self {
            Self::Error {
                code,
                message,
                payload,
            } => (code, message, payload),
            other => return Ok(other),
        };

        let detail = match payload {
            Some(p) => format!("{message}: {p}"),
            None => message,
        };

        match code.as_deref() {
            Some("901" | "905") => Err(Error::Connectivity {
                address: String::new(),
                reason: detail,
            }),
            Some("902") => Err(Error::Timeout { timeout_secs: 0 }),
            Some("904" | "914") => Err(Error::ProtocolMismatch { message: detail }),
            _ => Err(Error::Rejected {
                code,
                message: detail,
            }),
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::value::{DpId, DpValue};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn decodes_dps_envelope() {
        let frame = Frame::from_json(&json!({"dps": {"1": true, "2": 21}, "t": 17}));
        let dps = frame.dps().unwrap();
        assert_eq!(dps.get(&DpId::from(1)), Some(&DpValue::Bool(true)));
        assert_eq!(dps.get(&DpId::from(2)), Some(&DpValue::Int(21)));
    }

    #[test]
    fn decodes_error_envelope() {
        let frame = Frame::from_json(&json!({"Error": "Network Error", "Err": "905", "Payload": null}));
        assert_eq!(
            frame,
            Frame::Error {
                code: Some("905".into()),
                message: "Network Error".into(),
                payload: None,
            }
        );
    }

    #[test]
    fn numeric_error_codes_become_text() {
        let frame = Frame::from_json(&json!({"Error": "Unexpected Payload", "Err": 904}));
        let err = frame.into_result().unwrap_err();
        assert!(err.is_protocol_mismatch());
    }

    #[test]
    fn error_codes_classify() {
        let err = |code: &str| {
            Frame::Error {
                code: Some(code.into()),
                message: "x".into(),
                payload: None,
            }
            .into_result()
            .unwrap_err()
        };
        assert!(err("901").is_connectivity());
        assert!(err("902").is_connectivity());
        assert!(err("914").is_protocol_mismatch());
        assert!(err("903").is_rejection());
    }

    #[test]
    fn empty_and_garbage() {
        assert_eq!(Frame::parse("").unwrap(), Frame::Empty);
        assert_eq!(Frame::parse("null").unwrap(), Frame::Empty);
        assert!(matches!(
            Frame::parse("{not json"),
            Err(Error::Deserialization { .. })
        ));
    }
}
