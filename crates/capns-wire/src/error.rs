use std::fmt;

/// Short uppercase error identifiers carried in ERR frame meta.
///
/// The wire form is the string from [`as_str`](ErrorCode::as_str); codes
/// this enum does not know stay representable as [`ErrorCode::Other`] so a
/// newer peer's codes survive a relay hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// State-machine or structural violation.
    ProtocolError,
    /// No registered cap accepts the request URN.
    NoHandler,
    /// Continuation frame with no routing entry.
    UnknownRequest,
    /// Plugin process could not be started.
    SpawnFailed,
    /// Peer crashed or closed mid-request.
    EndpointDied,
    /// Handler-returned failure.
    HandlerError,
    /// REQ is structurally valid but misses required context.
    InvalidRequest,
    /// Arguments could not be bound to the handler's expected input.
    PayloadError,
    /// Produced by external timeout wrappers, never by the core.
    Timeout,
    /// A code minted by a peer this build does not know.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::NoHandler => "NO_HANDLER",
            ErrorCode::UnknownRequest => "UNKNOWN_REQUEST",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::EndpointDied => "ENDPOINT_DIED",
            ErrorCode::HandlerError => "HANDLER_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::PayloadError => "PAYLOAD_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Other(code) => code,
        }
    }

    pub fn parse(code: &str) -> ErrorCode {
        match code {
            "PROTOCOL_ERROR" => ErrorCode::ProtocolError,
            "NO_HANDLER" => ErrorCode::NoHandler,
            "UNKNOWN_REQUEST" => ErrorCode::UnknownRequest,
            "SPAWN_FAILED" => ErrorCode::SpawnFailed,
            "ENDPOINT_DIED" => ErrorCode::EndpointDied,
            "HANDLER_ERROR" => ErrorCode::HandlerError,
            "INVALID_REQUEST" => ErrorCode::InvalidRequest,
            "PAYLOAD_ERROR" => ErrorCode::PayloadError,
            "TIMEOUT" => ErrorCode::Timeout,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_roundtrip() {
        for code in [
            ErrorCode::ProtocolError,
            ErrorCode::NoHandler,
            ErrorCode::UnknownRequest,
            ErrorCode::SpawnFailed,
            ErrorCode::EndpointDied,
            ErrorCode::HandlerError,
            ErrorCode::InvalidRequest,
            ErrorCode::PayloadError,
            ErrorCode::Timeout,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
    }

    #[test]
    fn unknown_codes_survive() {
        let code = ErrorCode::parse("SOMETHING_NEW");
        assert_eq!(code, ErrorCode::Other("SOMETHING_NEW".to_string()));
        assert_eq!(code.as_str(), "SOMETHING_NEW");
    }
}
