// ── Core error types ──
//
// Session- and catalog-level errors. Consumers never see raw transport
// codes; the `From<dplink_api::Error>` impl folds transport failures into
// the categories the session's retry policy acts on.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Device errors ────────────────────────────────────────────────
    #[error("Device {device} unreachable: {reason}")]
    Connectivity { device: String, reason: String },

    #[error("Device {device} did not decode under protocol {version}: {message}")]
    ProtocolMismatch {
        device: String,
        version: String,
        message: String,
    },

    #[error("Device rejected write{}: {message}", code_suffix(.code))]
    WriteRejected {
        code: Option<String>,
        message: String,
    },

    // ── Catalog errors ───────────────────────────────────────────────
    #[error("Profile configuration error in {source_name}: {message}")]
    Configuration {
        source_name: String,
        message: String,
    },

    #[error("No known profile matches the reported datapoints ({observed})")]
    NoMatch { observed: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Session for device {device} is not running")]
    SessionStopped { device: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" (code {c})"))
        .unwrap_or_default()
}

impl CoreError {
    pub(crate) fn config(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::ProtocolMismatch { .. }
        )
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<dplink_api::Error> for CoreError {
    fn from(err: dplink_api::Error) -> Self {
        match err {
            dplink_api::Error::Connectivity { address, reason } => Self::Connectivity {
                device: address,
                reason,
            },
            dplink_api::Error::Timeout { timeout_secs } => Self::Connectivity {
                device: String::new(),
                reason: format!("no answer within {timeout_secs}s"),
            },
            dplink_api::Error::Closed => Self::Connectivity {
                device: String::new(),
                reason: "transport closed".into(),
            },
            dplink_api::Error::Io(e) => Self::Connectivity {
                device: String::new(),
                reason: e.to_string(),
            },
            dplink_api::Error::ProtocolMismatch { message } => Self::ProtocolMismatch {
                device: String::new(),
                version: String::new(),
                message,
            },
            dplink_api::Error::Deserialization { message, body: _ } => Self::ProtocolMismatch {
                device: String::new(),
                version: String::new(),
                message,
            },
            dplink_api::Error::Rejected { code, message } => Self::WriteRejected { code, message },
            dplink_api::Error::Worker(msg) => Self::Internal(msg),
        }
    }
}

impl CoreError {
    /// Fill in device context that transport errors cannot know.
    pub(crate) fn for_device(mut self, id: &str, version: Option<&str>) -> Self {
        match &mut self {
            Self::Connectivity { device, .. } if device.is_empty() => *device = id.to_owned(),
            Self::ProtocolMismatch {
                device, version: v, ..
            } => {
                id.clone_into(device);
                if let Some(version) = version {
                    version.clone_into(v);
                }
            }
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_fold_into_session_categories() {
        let err: CoreError = dplink_api::Error::Timeout { timeout_secs: 5 }.into();
        assert!(matches!(err, CoreError::Connectivity { .. }));
        assert!(err.is_transient());

        let err: CoreError = dplink_api::Error::Rejected {
            code: Some("903".into()),
            message: "range".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Device rejected write (code 903): range");
        assert!(!err.is_transient());
    }

    #[test]
    fn device_context_is_filled_in() {
        let err: CoreError = dplink_api::Error::ProtocolMismatch {
            message: "bad crc".into(),
        }
        .into();
        let err = err.for_device("bf01", Some("3.4"));
        assert_eq!(
            err.to_string(),
            "Device bf01 did not decode under protocol 3.4: bad crc"
        );
    }
}
