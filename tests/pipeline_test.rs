//! Aggregator-level test: a reader opened through the hub feeds the shared
//! scan channel, and scans convert into publisher notifications.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use zaparoo_ingest::detect::{
    DetectorError, DeviceType, MountDetector, MountEvent, MountStream,
};
use zaparoo_ingest::hub::{ScanHub, SCAN_CHANNEL_DEPTH};
use zaparoo_ingest::reader::external_drive::{ExternalDriveReader, Options};
use zaparoo_ingest::token::{methods, Notification};

struct ReplayDetector {
    stream: Mutex<Option<MountStream>>,
}

#[async_trait]
impl MountDetector for ReplayDetector {
    async fn start(&self) -> Result<MountStream, DetectorError> {
        self.stream
            .lock()
            .unwrap()
            .take()
            .ok_or(DetectorError::AlreadyStarted)
    }

    async fn stop(&self) {}

    fn forget(&self, _device_id: &str) {}
}

fn mount_event(device_id: &str, mount_path: &Path) -> MountEvent {
    MountEvent {
        device_id: device_id.to_string(),
        device_node: String::new(),
        mount_path: mount_path.to_path_buf(),
        volume_label: String::new(),
        device_type: DeviceType::Usb,
    }
}

#[tokio::test]
async fn hub_aggregates_scans_and_derives_notifications() {
    let volume = tempfile::tempdir().unwrap();
    std::fs::write(volume.path().join("zaparoo.txt"), "**launch.random").unwrap();

    let (mount_tx, mounts) = mpsc::channel(10);
    let (unmount_tx, unmounts) = mpsc::channel(10);
    let detector = ReplayDetector {
        stream: Mutex::new(Some(MountStream { mounts, unmounts })),
    };

    let options = Options {
        media_roots: Vec::new(),
        settle_delay: Duration::from_millis(5),
        read_timeout: Duration::from_secs(1),
        read_retries: 0,
        retry_backoff: Duration::from_millis(10),
    };
    let reader = ExternalDriveReader::with_detector(options, Box::new(detector));

    let (mut hub, mut scans) = ScanHub::new(SCAN_CHANNEL_DEPTH);
    hub.open_reader(Box::new(reader), "externaldrive:")
        .await
        .unwrap();
    assert_eq!(hub.devices(), vec!["externaldrive:".to_string()]);

    mount_tx
        .send(mount_event("UUID-HUB", volume.path()))
        .await
        .unwrap();
    let scan = timeout(Duration::from_secs(2), scans.recv())
        .await
        .expect("scan within deadline")
        .expect("channel open");
    let notification = Notification::from_scan(&scan);
    assert_eq!(notification.method, methods::TOKENS_ADDED);
    assert_eq!(notification.params["token"]["text"], "**launch.random");

    unmount_tx.send("UUID-HUB".to_string()).await.unwrap();
    let scan = timeout(Duration::from_secs(2), scans.recv())
        .await
        .expect("removal within deadline")
        .expect("channel open");
    assert!(scan.token.is_none());
    let notification = Notification::from_scan(&scan);
    assert_eq!(notification.method, methods::TOKENS_REMOVED);

    hub.close_all().await;
    assert!(hub.devices().is_empty());
}
