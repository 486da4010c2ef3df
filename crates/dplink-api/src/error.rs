use thiserror::Error;

/// Top-level error type for the `dplink-api` crate.
///
/// Covers every failure mode a transport can report: the device being
/// unreachable, a reply that does not decode under the assumed protocol
/// version, an explicit rejection from the device, and worker-pool trouble.
/// `dplink-core` maps these into session-level errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connectivity ────────────────────────────────────────────────
    /// Socket could not be opened or was reset mid-exchange.
    #[error("Cannot reach device at {address}: {reason}")]
    Connectivity { address: String, reason: String },

    /// The device accepted the connection but never answered.
    #[error("Device did not answer within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The transport was closed and cannot be used until reopened.
    #[error("Transport closed")]
    Closed,

    // ── Protocol ────────────────────────────────────────────────────
    /// Reply could not be decoded under the protocol version in use.
    #[error("Reply does not match the negotiated protocol: {message}")]
    ProtocolMismatch { message: String },

    /// A frame decoded but its JSON body was malformed.
    #[error("Malformed frame: {message}")]
    Deserialization { message: String, body: String },

    // ── Device ──────────────────────────────────────────────────────
    /// The device answered with an explicit error payload.
    #[error("Device rejected request{}: {message}", code_suffix(.code))]
    Rejected {
        code: Option<String>,
        message: String,
    },

    // ── Runtime ─────────────────────────────────────────────────────
    /// The blocking worker panicked or the transport lock was poisoned.
    #[error("Transport worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref()
        .map(|c| format!(" (code {c})"))
        .unwrap_or_default()
}

impl Error {
    /// Returns `true` if the failure is about reaching the device at all,
    /// as opposed to what the device said.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Connectivity { .. } | Self::Timeout { .. } | Self::Closed | Self::Io(_)
        )
    }

    /// Returns `true` if the reply did not fit the assumed protocol version.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ProtocolMismatch { .. } | Self::Deserialization { .. }
        )
    }

    /// Returns `true` if the device explicitly refused the request.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_display_includes_code_when_present() {
        let err = Error::Rejected {
            code: Some("903".into()),
            message: "value out of range".into(),
        };
        assert_eq!(
            err.to_string(),
            "Device rejected request (code 903): value out of range"
        );

        let err = Error::Rejected {
            code: None,
            message: "nope".into(),
        };
        assert_eq!(err.to_string(), "Device rejected request: nope");
    }

    #[test]
    fn classification() {
        assert!(Error::Closed.is_connectivity());
        assert!(Error::Timeout { timeout_secs: 5 }.is_connectivity());
        assert!(
            Error::ProtocolMismatch {
                message: "bad crc".into()
            }
            .is_protocol_mismatch()
        );
        assert!(!Error::Worker("boom".into()).is_connectivity());
    }
}
