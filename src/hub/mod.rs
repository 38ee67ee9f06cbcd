//! Scan aggregator
//!
//! Fan-in of scan records from all active readers into one bounded channel
//! owned by the dispatcher side. The hub opens readers against validated
//! connect descriptors, runs detect sweeps, and closes every reader on
//! shutdown. Readers share clones of the hub's sender and never close it.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::reader::{ConnectSpec, Reader, ReaderError};
use crate::token::Scan;

/// Default depth of the aggregated scan channel
pub const SCAN_CHANNEL_DEPTH: usize = 10;

/// Aggregates scans from a set of readers
pub struct ScanHub {
    scan_tx: mpsc::Sender<Scan>,
    readers: Vec<Box<dyn Reader>>,
}

impl ScanHub {
    /// Create a hub and the receiving end of its scan channel
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<Scan>) {
        let (scan_tx, scan_rx) = mpsc::channel(depth);
        (
            Self {
                scan_tx,
                readers: Vec::new(),
            },
            scan_rx,
        )
    }

    /// A sender feeding the aggregated channel, for readers managed
    /// outside the hub
    pub fn scan_sender(&self) -> mpsc::Sender<Scan> {
        self.scan_tx.clone()
    }

    /// Open a reader against a `driver:path` descriptor and take ownership
    pub async fn open_reader(
        &mut self,
        mut reader: Box<dyn Reader>,
        descriptor: &str,
    ) -> Result<(), ReaderError> {
        let connect = ConnectSpec::parse(descriptor);
        reader.open(&connect, self.scan_tx.clone()).await?;
        info!(device = %reader.device(), "reader opened");
        self.readers.push(reader);
        Ok(())
    }

    /// Probe a reader for a usable device and open it on a hit.
    /// Returns whether the reader was opened.
    pub async fn auto_detect(
        &mut self,
        mut reader: Box<dyn Reader>,
        hints: &[String],
    ) -> Result<bool, ReaderError> {
        let Some(descriptor) = reader.detect(hints).await else {
            return Ok(false);
        };
        let connect = ConnectSpec::parse(&descriptor);
        reader.open(&connect, self.scan_tx.clone()).await?;
        info!(device = %reader.device(), "reader auto-detected");
        self.readers.push(reader);
        Ok(true)
    }

    /// Connection strings of the currently-open readers
    pub fn devices(&self) -> Vec<String> {
        self.readers.iter().map(|r| r.device()).collect()
    }

    /// Close every reader; failures are logged, not propagated
    pub async fn close_all(&mut self) {
        for reader in &mut self.readers {
            if let Err(err) = reader.close().await {
                warn!(device = %reader.device(), error = %err, "reader close failed");
            }
        }
        self.readers.clear();
    }
}
