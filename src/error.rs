use serde_json::Value;
use thiserror::Error;

use crate::protocol::ResponseError;

/// JSON-RPC error codes used by the MCP protocol.
///
/// The first five are the standard JSON-RPC 2.0 codes; the remainder are
/// implementation-reserved codes in the -32000..-32099 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received by the peer (-32700)
    ParseError,
    /// The JSON sent is not a valid request object (-32600)
    InvalidRequest,
    /// The method does not exist or is not available (-32601)
    MethodNotFound,
    /// Invalid method parameters (-32602)
    InvalidParams,
    /// Internal JSON-RPC error (-32603)
    InternalError,
    /// A request was received before the initialize handshake completed (-32002)
    ServerNotInitialized,
    /// An error code the peer sent that we do not recognize (-32001)
    UnknownErrorCode,
    /// The request was understood but could not be satisfied (-32000)
    RequestFailed,
}

impl ErrorCode {
    /// Maps a wire-level integer code back to an [`ErrorCode`].
    ///
    /// Unknown codes collapse to [`ErrorCode::UnknownErrorCode`]; the
    /// original integer is preserved in the surrounding [`ResponseError`]
    /// when one is available.
    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32002 => ErrorCode::ServerNotInitialized,
            -32000 => ErrorCode::RequestFailed,
            _ => ErrorCode::UnknownErrorCode,
        }
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> i32 {
        match code {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerNotInitialized => -32002,
            ErrorCode::UnknownErrorCode => -32001,
            ErrorCode::RequestFailed => -32000,
        }
    }
}

/// Error type covering every failure mode of the SDK.
///
/// Protocol errors carry the JSON-RPC code and optional `data` payload so
/// they can be converted back into a wire-level [`ResponseError`] without
/// loss. Transport, timeout, and session-closed errors never cross the wire;
/// they surface on the local caller's future.
#[derive(Debug, Error)]
pub enum Error {
    /// A JSON-RPC level error, either produced locally or received from the peer
    #[error("protocol error {code:?}: {message}")]
    Protocol {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    /// Transport-level failure (I/O on the wire, stream lost, send after close)
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON serialization or deserialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An outbound request outlived its deadline
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The session was closed while the operation was pending
    #[error("session closed")]
    SessionClosed,

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Creates a protocol error with no `data` payload.
    pub fn protocol(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates a protocol error carrying a `data` payload.
    pub fn protocol_with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        Error::Protocol {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Creates the error representing a JSON-RPC error object received from
    /// the peer in a response.
    pub fn from_response_error(error: ResponseError) -> Self {
        Error::Protocol {
            code: ErrorCode::from_code(error.code),
            message: error.message,
            data: error.data,
        }
    }
}
