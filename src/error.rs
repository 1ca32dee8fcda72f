use thiserror::Error;

use crate::protocol::{ER_UNKNOWN_ERROR, SS_UNKNOWN_SQL_STATE};

#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// An error with a MySQL error code and SQLSTATE attached. This is
    /// what gets rendered into an ERR packet verbatim; every other
    /// variant is wrapped as a generic server error first.
    #[error("server error {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: &'static str,
        message: String,
    },

    /// Returned by the result writer when the handler keeps streaming
    /// after the terminating OK packet was already sent.
    #[error("result stream already finished")]
    ResultsFinished,
}

impl WireError {
    pub fn server(code: u16, sql_state: &'static str, message: impl Into<String>) -> Self {
        WireError::Server {
            code,
            sql_state,
            message: message.into(),
        }
    }

    /// The `(code, sql_state, message)` triple used for an ERR packet.
    pub fn err_packet_parts(&self) -> (u16, &'static str, String) {
        match self {
            WireError::Server {
                code,
                sql_state,
                message,
            } => (*code, sql_state, message.clone()),
            other => (ER_UNKNOWN_ERROR, SS_UNKNOWN_SQL_STATE, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
