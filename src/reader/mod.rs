//! Reader capability contract
//!
//! A reader is any component that turns hardware or OS events into [`Scan`]
//! records on a caller-supplied channel. Polymorphism is a trait plus
//! explicit dispatch on driver aliases; there is no inheritance and no
//! registry magic. Concrete readers: external-drive (mass storage carrying
//! a token file) and RS-232 barcode.

pub mod barcode;
pub mod external_drive;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::detect::DetectorError;
use crate::token::{Scan, Token};

/// Reader errors
#[derive(Debug, Error)]
pub enum ReaderError {
    /// `open` was called with a driver this reader does not answer to
    #[error("invalid driver: {0}")]
    InvalidDriver(String),

    /// Mount-detection backend could not be constructed or started
    #[error("detector backend: {0}")]
    Backend(#[from] DetectorError),

    /// Device could not be opened (missing path, port error)
    #[error("failed to open device: {0}")]
    OpenFailed(String),

    /// This reader has no write-back support
    #[error("reader does not support writes")]
    WriteNotSupported,

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static descriptor of a reader driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverMetadata {
    pub id: &'static str,
    pub default_enabled: bool,
    pub default_auto_detect: bool,
    pub description: &'static str,
}

/// Optional reader capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Reader can write a token back to physical media
    Write,
}

/// Media state forwarded to readers that mirror playback on the hardware
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveMedia {
    pub path: String,
    pub name: String,
}

/// A parsed connect descriptor of the form `<driver>:<path>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSpec {
    pub driver: String,
    pub path: String,
}

impl ConnectSpec {
    pub fn new(driver: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            path: path.into(),
        }
    }

    /// Parse `driver:path`; a descriptor without a colon is a bare driver
    pub fn parse(descriptor: &str) -> Self {
        match descriptor.split_once(':') {
            Some((driver, path)) => Self::new(driver, path),
            None => Self::new(descriptor, ""),
        }
    }

    pub fn connection_string(&self) -> String {
        format!("{}:{}", self.driver, self.path)
    }
}

impl std::fmt::Display for ConnectSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.driver, self.path)
    }
}

/// The reader capability.
///
/// Lifecycle: created → `open(connect, scan_tx)` → emits scans → `close`.
/// `close` must be safe when `open` was never called, and idempotent.
/// Readers never close the supplied scan channel; the dispatcher owns it.
#[async_trait]
pub trait Reader: Send {
    /// Static descriptor
    fn metadata(&self) -> DriverMetadata;

    /// Driver aliases this reader answers to
    fn ids(&self) -> Vec<&'static str>;

    /// Acquire backend resources and begin emitting scans.
    /// Must not block after initial setup.
    async fn open(
        &mut self,
        connect: &ConnectSpec,
        scan_tx: mpsc::Sender<Scan>,
    ) -> Result<(), ReaderError>;

    /// Stop event tasks, close the backend, drain in-flight work
    async fn close(&mut self) -> Result<(), ReaderError>;

    /// Probe for a usable device; `Some("<driver>:<path>")` on success.
    /// Platform-capability results may be cached after the first call.
    async fn detect(&self, hints: &[String]) -> Option<String>;

    /// Connection string of the currently-opened device
    fn device(&self) -> String;

    fn connected(&self) -> bool;

    fn info(&self) -> String;

    /// Write a token back to the media, where supported
    async fn write(&mut self, _text: &str) -> Result<Token, ReaderError> {
        Err(ReaderError::WriteNotSupported)
    }

    fn cancel_write(&mut self) {}

    fn capabilities(&self) -> Vec<Capability> {
        Vec::new()
    }

    fn on_media_change(&mut self, _media: Option<ActiveMedia>) {}
}

/// Reject connect descriptors whose driver is not claimed by the reader
pub(crate) fn validate_driver(ids: &[&str], connect: &ConnectSpec) -> Result<(), ReaderError> {
    if ids.iter().any(|id| *id == connect.driver) {
        Ok(())
    } else {
        Err(ReaderError::InvalidDriver(connect.driver.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_spec_parse() {
        let spec = ConnectSpec::parse("externaldrive:");
        assert_eq!(spec.driver, "externaldrive");
        assert_eq!(spec.path, "");

        let spec = ConnectSpec::parse("barcode:/dev/ttyUSB0");
        assert_eq!(spec.driver, "barcode");
        assert_eq!(spec.path, "/dev/ttyUSB0");
        assert_eq!(spec.connection_string(), "barcode:/dev/ttyUSB0");

        let spec = ConnectSpec::parse("bare");
        assert_eq!(spec.driver, "bare");
        assert_eq!(spec.path, "");
    }

    #[test]
    fn test_validate_driver() {
        let ids = ["externaldrive", "external_drive"];
        assert!(validate_driver(&ids, &ConnectSpec::parse("externaldrive:")).is_ok());
        assert!(validate_driver(&ids, &ConnectSpec::parse("external_drive:")).is_ok());
        let err = validate_driver(&ids, &ConnectSpec::parse("nfc:usb")).unwrap_err();
        assert!(matches!(err, ReaderError::InvalidDriver(d) if d == "nfc"));
    }
}
