//! RS-232 barcode reader
//!
//! Representative streaming-bytes reader: a polling task reads the serial
//! port in 100 ms slices and feeds each byte through a line framer. Lines
//! are delimited by CR or LF; an 8 KiB cap drops runaway input until the
//! next delimiter. Decoded lines become barcode tokens.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{validate_driver, ConnectSpec, DriverMetadata, Reader, ReaderError};
use crate::token::{Scan, Token, TokenType};

const DRIVER_IDS: [&str; 2] = ["barcode", "rs232"];
const READER_ID: &str = "barcode";
const BAUD_RATE: u32 = 9600;
const READ_SLICE: Duration = Duration::from_millis(100);

/// Upper bound on a single barcode line
pub const MAX_LINE_LEN: usize = 8 * 1024;

const STX: char = '\u{2}';
const ETX: char = '\u{3}';

/// Byte → line framing state machine.
///
/// Push bytes one at a time; a decoded line is returned when a delimiter
/// completes one. Oversized lines flip the overflow flag and are discarded
/// up to and including the next delimiter.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    overflow: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Option<String> {
        if byte == b'\n' || byte == b'\r' {
            if self.overflow {
                self.overflow = false;
                self.buffer.clear();
                return None;
            }
            if self.buffer.is_empty() {
                return None;
            }
            let raw = std::mem::take(&mut self.buffer);
            return decode_line(&raw);
        }
        if self.overflow {
            return None;
        }
        if self.buffer.len() >= MAX_LINE_LEN {
            warn!(len = self.buffer.len(), "barcode line overflow, discarding");
            self.buffer.clear();
            self.overflow = true;
            return None;
        }
        self.buffer.push(byte);
        None
    }
}

/// Trim whitespace, strip framing STX/ETX, discard empty lines
fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    let text = text.strip_prefix(STX).unwrap_or(text);
    let text = text.strip_suffix(ETX).unwrap_or(text);
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Reader for serial barcode scanners speaking 9600 8N1
pub struct BarcodeReader {
    cancel: CancellationToken,
    tracker: TaskTracker,
    source: String,
    opened: bool,
}

impl Default for BarcodeReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BarcodeReader {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            source: String::new(),
            opened: false,
        }
    }
}

#[async_trait]
impl Reader for BarcodeReader {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: READER_ID,
            default_enabled: true,
            default_auto_detect: false,
            description: "RS-232 barcode scanners",
        }
    }

    fn ids(&self) -> Vec<&'static str> {
        DRIVER_IDS.to_vec()
    }

    async fn open(
        &mut self,
        connect: &ConnectSpec,
        scan_tx: mpsc::Sender<Scan>,
    ) -> Result<(), ReaderError> {
        validate_driver(&DRIVER_IDS, connect)?;

        // Device nodes are real files everywhere but Windows.
        if !cfg!(windows) && std::fs::metadata(&connect.path).is_err() {
            return Err(ReaderError::OpenFailed(format!(
                "no such device: {}",
                connect.path
            )));
        }

        let port = tokio_serial::new(connect.path.as_str(), BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()?;

        self.cancel = CancellationToken::new();
        self.tracker = TaskTracker::new();
        self.source = connect.connection_string();

        let cancel = self.cancel.clone();
        let source = self.source.clone();
        self.tracker.spawn(async move {
            read_loop(port, cancel, source, scan_tx).await;
        });

        self.opened = true;
        info!(source = %self.source, "barcode reader opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ReaderError> {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if self.opened {
            info!(source = %self.source, "barcode reader closed");
        }
        self.opened = false;
        Ok(())
    }

    async fn detect(&self, hints: &[String]) -> Option<String> {
        for hint in hints {
            if cfg!(windows) || std::fs::metadata(hint).is_ok() {
                return Some(format!("{READER_ID}:{hint}"));
            }
        }
        None
    }

    fn device(&self) -> String {
        self.source.clone()
    }

    fn connected(&self) -> bool {
        self.opened
    }

    fn info(&self) -> String {
        "RS-232 barcode scanner".to_string()
    }
}

async fn read_loop(
    mut port: tokio_serial::SerialStream,
    cancel: CancellationToken,
    source: String,
    scan_tx: mpsc::Sender<Scan>,
) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 256];

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = tokio::time::timeout(READ_SLICE, port.read(&mut buf)) => read,
        };

        let n = match read {
            Err(_) => continue, // timeout slice, re-check cancellation
            Ok(Ok(0)) => {
                warn!(source = %source, "serial port closed");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(err)) => {
                warn!(source = %source, error = %err, "serial read failed, stopping");
                break;
            }
        };

        for &byte in &buf[..n] {
            let Some(line) = framer.push(byte) else {
                continue;
            };
            debug!(source = %source, line = %line, "barcode decoded");
            let token = Token {
                token_type: TokenType::Barcode,
                text: line.clone(),
                uid: line.clone(),
                data: line,
                scan_time: Utc::now(),
                source: source.clone(),
                reader_id: READER_ID.to_string(),
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = scan_tx.send(Scan::added(source.clone(), token)) => {
                    if result.is_err() {
                        debug!("scan receiver dropped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut LineFramer, bytes: &[u8]) -> Vec<String> {
        bytes.iter().filter_map(|&b| framer.push(b)).collect()
    }

    #[test]
    fn test_framer_basic_line() {
        let mut framer = LineFramer::new();
        let lines = feed(&mut framer, b"ABC123\n");
        assert_eq!(lines, vec!["ABC123"]);
    }

    #[test]
    fn test_framer_strips_stx_etx() {
        let mut framer = LineFramer::new();
        let lines = feed(&mut framer, b"\x02ABC123\x03\r\n");
        assert_eq!(lines, vec!["ABC123"]);
    }

    #[test]
    fn test_framer_crlf_yields_one_line() {
        let mut framer = LineFramer::new();
        let lines = feed(&mut framer, b"A1\r\nB2\r\n");
        assert_eq!(lines, vec!["A1", "B2"]);
    }

    #[test]
    fn test_framer_discards_blank_and_whitespace_lines() {
        let mut framer = LineFramer::new();
        let lines = feed(&mut framer, b"\n\r\n   \nX\n");
        assert_eq!(lines, vec!["X"]);
    }

    #[test]
    fn test_framer_overflow_discards_until_delimiter() {
        let mut framer = LineFramer::new();
        let mut input = vec![b'A'; MAX_LINE_LEN + 1];
        input.extend_from_slice(b"tail\n");
        let lines = feed(&mut framer, &input);
        assert!(lines.is_empty(), "overflowed line must be discarded");

        // Normal framing resumes after the delimiter.
        let lines = feed(&mut framer, b"NEXT\n");
        assert_eq!(lines, vec!["NEXT"]);
    }

    #[test]
    fn test_decode_line_trims_before_stripping_framing() {
        assert_eq!(decode_line(b"  \x02X\x03  "), Some("X".to_string()));
        assert_eq!(decode_line(b"\x02\x03"), None);
        assert_eq!(decode_line(b"   "), None);
    }
}
