//! End-to-end tests for the external-drive reader, driven through a mock
//! mount detector injected at construction time.
//!
//! Each test builds a temp-dir "volume", injects mount/unmount events, and
//! asserts on the scans that come out the reader's channel.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use zaparoo_ingest::detect::{
    DetectorError, DeviceType, MountDetector, MountEvent, MountStream,
};
use zaparoo_ingest::reader::external_drive::{ExternalDriveReader, Options};
use zaparoo_ingest::reader::{ConnectSpec, Reader};
use zaparoo_ingest::token::{Scan, TokenType};

/// Detector that replays injected events instead of watching the OS
struct MockDetector {
    stream: Mutex<Option<MountStream>>,
    forgotten: Arc<Mutex<Vec<String>>>,
    stops: Arc<AtomicUsize>,
}

/// Test-side handles into a [`MockDetector`]
struct MockHandle {
    mount_tx: mpsc::Sender<MountEvent>,
    unmount_tx: mpsc::Sender<String>,
    forgotten: Arc<Mutex<Vec<String>>>,
    stops: Arc<AtomicUsize>,
}

impl MockDetector {
    fn new() -> (Self, MockHandle) {
        let (mount_tx, mounts) = mpsc::channel(10);
        let (unmount_tx, unmounts) = mpsc::channel(10);
        let forgotten = Arc::new(Mutex::new(Vec::new()));
        let stops = Arc::new(AtomicUsize::new(0));
        (
            Self {
                stream: Mutex::new(Some(MountStream { mounts, unmounts })),
                forgotten: forgotten.clone(),
                stops: stops.clone(),
            },
            MockHandle {
                mount_tx,
                unmount_tx,
                forgotten,
                stops,
            },
        )
    }
}

#[async_trait]
impl MountDetector for MockDetector {
    async fn start(&self) -> Result<MountStream, DetectorError> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or(DetectorError::AlreadyStarted)
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn forget(&self, device_id: &str) {
        self.forgotten.lock().unwrap().push(device_id.to_string());
    }
}

fn fast_options() -> Options {
    Options {
        media_roots: Vec::new(),
        settle_delay: Duration::from_millis(5),
        read_timeout: Duration::from_secs(1),
        read_retries: 1,
        retry_backoff: Duration::from_millis(10),
    }
}

fn mount_event(device_id: &str, device_node: &str, mount_path: &Path) -> MountEvent {
    MountEvent {
        device_id: device_id.to_string(),
        device_node: device_node.to_string(),
        mount_path: mount_path.to_path_buf(),
        volume_label: "USB".to_string(),
        device_type: DeviceType::Usb,
    }
}

async fn open_reader(options: Options) -> (ExternalDriveReader, MockHandle, mpsc::Receiver<Scan>) {
    open_reader_with_depth(options, 10).await
}

async fn open_reader_with_depth(
    options: Options,
    depth: usize,
) -> (ExternalDriveReader, MockHandle, mpsc::Receiver<Scan>) {
    let (detector, handle) = MockDetector::new();
    let mut reader = ExternalDriveReader::with_detector(options, Box::new(detector));
    let (scan_tx, scan_rx) = mpsc::channel(depth);
    reader
        .open(&ConnectSpec::parse("externaldrive:"), scan_tx)
        .await
        .expect("open reader");
    (reader, handle, scan_rx)
}

async fn recv_scan(rx: &mut mpsc::Receiver<Scan>) -> Scan {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for scan")
        .expect("scan channel closed")
}

async fn assert_no_scan(rx: &mut mpsc::Receiver<Scan>) {
    assert!(
        timeout(Duration::from_millis(400), rx.recv()).await.is_err(),
        "unexpected scan emitted"
    );
}

#[tokio::test]
async fn usb_insert_and_remove_with_valid_token() {
    let volume = tempfile::tempdir().unwrap();
    std::fs::write(volume.path().join("zaparoo.txt"), "**launch.system:nes").unwrap();

    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;

    handle
        .mount_tx
        .send(mount_event("UUID-AAAA", "", volume.path()))
        .await
        .unwrap();

    let scan = recv_scan(&mut scans).await;
    let token = scan.token.expect("acceptance scan carries a token");
    assert_eq!(token.token_type, TokenType::ExternalDrive);
    assert_eq!(token.text, "**launch.system:nes");
    assert_eq!(token.data, "**launch.system:nes");
    assert!(!token.reader_id.is_empty());
    assert_eq!(scan.source, "externaldrive:");

    handle.unmount_tx.send("UUID-AAAA".to_string()).await.unwrap();
    let scan = recv_scan(&mut scans).await;
    assert!(scan.token.is_none(), "removal scan carries no token");

    reader.close().await.unwrap();
    assert!(handle.stops.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn partition_duplicates_are_suppressed() {
    let volume = tempfile::tempdir().unwrap();
    std::fs::write(volume.path().join("zaparoo.txt"), "payload").unwrap();

    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;

    handle
        .mount_tx
        .send(mount_event("/dev/sda1", "", volume.path()))
        .await
        .unwrap();
    handle
        .mount_tx
        .send(mount_event("/dev/sda2", "", volume.path()))
        .await
        .unwrap();

    let scan = recv_scan(&mut scans).await;
    assert!(scan.token.is_some());
    assert_no_scan(&mut scans).await;

    // Unmounting any partition of the base device releases the token.
    handle.unmount_tx.send("/dev/sda2".to_string()).await.unwrap();
    let scan = recv_scan(&mut scans).await;
    assert!(scan.token.is_none());
    assert_no_scan(&mut scans).await;

    reader.close().await.unwrap();
}

#[tokio::test]
async fn token_found_on_sibling_mount() {
    let root = tempfile::tempdir().unwrap();
    let primary = root.path().join("primary");
    let other = root.path().join("other");
    std::fs::create_dir_all(&primary).unwrap();
    std::fs::create_dir_all(&other).unwrap();
    std::fs::write(other.join("zaparoo.txt"), "sibling payload").unwrap();

    let options = Options {
        media_roots: vec![root.path().to_path_buf()],
        ..fast_options()
    };
    let (mut reader, handle, mut scans) = open_reader(options).await;

    handle
        .mount_tx
        .send(mount_event("UUID-BBBB", "", &primary))
        .await
        .unwrap();

    let scan = recv_scan(&mut scans).await;
    let token = scan.token.expect("sibling token accepted");
    assert_eq!(token.text, "sibling payload");

    reader.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_token_file_is_rejected() {
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("real.txt");
    std::fs::write(&target, "valid content").unwrap();

    let volume = tempfile::tempdir().unwrap();
    std::os::unix::fs::symlink(&target, volume.path().join("zaparoo.txt")).unwrap();

    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;
    handle
        .mount_tx
        .send(mount_event("UUID-CCCC", "", volume.path()))
        .await
        .unwrap();

    assert_no_scan(&mut scans).await;
    reader.close().await.unwrap();
}

#[tokio::test]
async fn oversized_token_file_is_rejected() {
    let volume = tempfile::tempdir().unwrap();
    let big = vec![b'a'; 1024 * 1024 + 1];
    std::fs::write(volume.path().join("zaparoo.txt"), big).unwrap();

    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;
    handle
        .mount_tx
        .send(mount_event("UUID-DDDD", "", volume.path()))
        .await
        .unwrap();

    assert_no_scan(&mut scans).await;
    reader.close().await.unwrap();
}

#[tokio::test]
async fn empty_token_file_is_ignored() {
    let volume = tempfile::tempdir().unwrap();
    std::fs::write(volume.path().join("zaparoo.txt"), "   \n\t\n").unwrap();

    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;
    handle
        .mount_tx
        .send(mount_event("UUID-EEEE", "", volume.path()))
        .await
        .unwrap();

    assert_no_scan(&mut scans).await;
    reader.close().await.unwrap();
}

#[tokio::test]
async fn stale_mount_triggers_forget_and_no_scan() {
    let volume = tempfile::tempdir().unwrap();
    std::fs::write(volume.path().join("zaparoo.txt"), "payload").unwrap();

    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;

    // A device node that does not exist marks the mount as stale.
    handle
        .mount_tx
        .send(mount_event("UUID-STALE", "/dev/zzz99", volume.path()))
        .await
        .unwrap();

    assert_no_scan(&mut scans).await;
    let forgotten = handle.forgotten.lock().unwrap().clone();
    assert_eq!(forgotten, vec!["UUID-STALE".to_string()]);

    reader.close().await.unwrap();
}

#[tokio::test]
async fn unmount_without_tracked_token_emits_nothing() {
    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;

    handle
        .unmount_tx
        .send("UUID-NEVER-SEEN".to_string())
        .await
        .unwrap();

    assert_no_scan(&mut scans).await;
    reader.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_safe_without_open() {
    // Never opened
    let (detector, _handle) = MockDetector::new();
    let mut reader = ExternalDriveReader::with_detector(fast_options(), Box::new(detector));
    reader.close().await.unwrap();
    reader.close().await.unwrap();

    // Opened, then closed repeatedly
    let (mut reader, handle, _scans) = open_reader(fast_options()).await;
    reader.close().await.unwrap();
    reader.close().await.unwrap();
    assert_eq!(handle.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn blocked_workers_return_promptly_on_close() {
    let volume_a = tempfile::tempdir().unwrap();
    let volume_b = tempfile::tempdir().unwrap();
    std::fs::write(volume_a.path().join("zaparoo.txt"), "first").unwrap();
    std::fs::write(volume_b.path().join("zaparoo.txt"), "second").unwrap();

    // Depth-1 scan channel that nobody drains: the first scan fills it and
    // the second worker blocks on the send.
    let (mut reader, handle, _scans) = open_reader_with_depth(fast_options(), 1).await;

    handle
        .mount_tx
        .send(mount_event("UUID-ONE", "", volume_a.path()))
        .await
        .unwrap();
    handle
        .mount_tx
        .send(mount_event("UUID-TWO", "", volume_b.path()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(2), reader.close())
        .await
        .expect("close must not hang on a blocked worker")
        .unwrap();
}

#[tokio::test]
async fn full_lifecycle_with_injected_detector() {
    let volume = tempfile::tempdir().unwrap();
    std::fs::write(volume.path().join("zaparoo.txt"), "payload").unwrap();

    let (mut reader, handle, mut scans) = open_reader(fast_options()).await;
    handle
        .mount_tx
        .send(mount_event("UUID-FFFF", "", volume.path()))
        .await
        .unwrap();
    assert!(recv_scan(&mut scans).await.token.is_some());
    reader.close().await.unwrap();
}

#[tokio::test]
async fn invalid_driver_is_rejected() {
    let (detector, _handle) = MockDetector::new();
    let mut reader = ExternalDriveReader::with_detector(fast_options(), Box::new(detector));
    let (scan_tx, _scan_rx) = mpsc::channel(10);

    let err = reader
        .open(&ConnectSpec::parse("nfc:usb"), scan_tx)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("invalid driver"));
}
