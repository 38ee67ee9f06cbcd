//! Core data model for the ingestion pipeline
//!
//! This module provides:
//! - Token: the domain object emitted by a reader for a scanned item
//! - Scan: the unit of reader output (token acceptance or removal)
//! - Notification: the publisher input record ({method, params})
//! - methods: well-known notification method names

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known notification method names.
///
/// The publisher filter (if configured) matches against these exactly,
/// case-sensitive.
pub mod methods {
    pub const TOKENS_ADDED: &str = "tokens.added";
    pub const TOKENS_REMOVED: &str = "tokens.removed";
    pub const READERS_ADDED: &str = "readers.added";
    pub const READERS_REMOVED: &str = "readers.removed";
    pub const MEDIA_STARTED: &str = "media.started";
    pub const MEDIA_STOPPED: &str = "media.stopped";
}

/// Discriminator for the kind of physical or virtual item a token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Mass-storage device carrying a token file
    ExternalDrive,
    /// Serial barcode scanner line
    Barcode,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::ExternalDrive => write!(f, "externaldrive"),
            TokenType::Barcode => write!(f, "barcode"),
        }
    }
}

/// A scan result produced by a reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Kind of token
    #[serde(rename = "type")]
    pub token_type: TokenType,
    /// Normalized payload (trimmed file or line contents)
    pub text: String,
    /// Unique identifier of the physical token when applicable
    pub uid: String,
    /// Raw payload; hex-encoded when the source was binary
    pub data: String,
    /// Capture timestamp; non-decreasing per reader
    pub scan_time: DateTime<Utc>,
    /// Connection string of the emitting reader instance
    pub source: String,
    /// Identifier of the hardware reader; non-empty for hardware tokens
    pub reader_id: String,
}

/// A reader output record.
///
/// A `None` token denotes removal: the previously active token is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub source: String,
    pub token: Option<Token>,
}

impl Scan {
    /// A token-acceptance record
    pub fn added(source: impl Into<String>, token: Token) -> Self {
        Self {
            source: source.into(),
            token: Some(token),
        }
    }

    /// A token-removal record
    pub fn removed(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            token: None,
        }
    }
}

/// A publisher input record, serialized as `{"method": ..., "params": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    pub params: serde_json::Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Notification derived from a scan record
    pub fn from_scan(scan: &Scan) -> Self {
        match &scan.token {
            Some(token) => Self::new(
                methods::TOKENS_ADDED,
                serde_json::json!({ "source": scan.source, "token": token }),
            ),
            None => Self::new(
                methods::TOKENS_REMOVED,
                serde_json::json!({ "source": scan.source }),
            ),
        }
    }
}
