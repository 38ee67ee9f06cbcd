//! External-drive token reader
//!
//! Treats a mass-storage device carrying a `zaparoo.txt` file (root of the
//! volume, name matched case-insensitively) as a physical token: mount means
//! present, unmount means removed.
//!
//! Two-task architecture: one event loop consumes the detector's mount and
//! unmount channels; each mount event is handed to a transient worker so a
//! slow device cannot stall subsequent events. All tasks observe the
//! reader's cancellation token and are joined on `close` through a task
//! tracker. Per-event failures are logged and dropped; they never kill the
//! reader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{validate_driver, ConnectSpec, DriverMetadata, Reader, ReaderError};
use crate::detect::{self, base_device, MountDetector, MountEvent, MountStream};
use crate::token::{Scan, Token, TokenType};

/// Token file searched for at the root of a mounted volume
pub const TOKEN_FILENAME: &str = "zaparoo.txt";

/// Token files above this size are rejected outright
pub const MAX_TOKEN_FILE_SIZE: u64 = 1024 * 1024;

const DRIVER_IDS: [&str; 2] = ["externaldrive", "external_drive"];
const READER_ID: &str = "external_drive";

/// Tunables for token discovery and reading
#[derive(Debug, Clone)]
pub struct Options {
    /// Removable-media roots searched for sibling mounts
    pub media_roots: Vec<PathBuf>,
    /// Pause before reading, letting the filesystem settle
    pub settle_delay: Duration,
    /// Bound on a single token-file read
    pub read_timeout: Duration,
    /// Retries after a transient read failure
    pub read_retries: u32,
    /// Initial retry backoff; doubles per attempt
    pub retry_backoff: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            media_roots: default_media_roots(),
            settle_delay: Duration::from_millis(100),
            read_timeout: Duration::from_secs(5),
            read_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

fn default_media_roots() -> Vec<PathBuf> {
    if cfg!(target_os = "macos") {
        vec![PathBuf::from("/Volumes")]
    } else if cfg!(windows) {
        // Drive roots vary per machine; configure explicitly when needed.
        Vec::new()
    } else {
        vec![
            PathBuf::from("/media"),
            PathBuf::from("/mnt"),
            PathBuf::from("/run/media"),
        ]
    }
}

/// Shared context handed to the event loop and mount workers
#[derive(Clone)]
struct WorkerCtx {
    options: Options,
    detector: Arc<dyn MountDetector>,
    active: Arc<RwLock<HashMap<String, Token>>>,
    scan_tx: mpsc::Sender<Scan>,
    cancel: CancellationToken,
    source: String,
}

/// Reader that turns removable-volume mounts into token scans
pub struct ExternalDriveReader {
    options: Options,
    /// Detector supplied up front (tests); otherwise the platform default
    /// is constructed on `open`
    injected: Option<Box<dyn MountDetector>>,
    detector: Option<Arc<dyn MountDetector>>,
    active: Arc<RwLock<HashMap<String, Token>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    source: String,
    opened: bool,
    probe: OnceCell<bool>,
}

impl ExternalDriveReader {
    pub fn new(options: Options) -> Self {
        Self::build(options, None)
    }

    /// Construct with a pre-built detector instead of the platform default.
    /// This is the injection seam the integration tests drive events through.
    pub fn with_detector(options: Options, detector: Box<dyn MountDetector>) -> Self {
        Self::build(options, Some(detector))
    }

    fn build(options: Options, injected: Option<Box<dyn MountDetector>>) -> Self {
        Self {
            options,
            injected,
            detector: None,
            active: Arc::new(RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            source: String::new(),
            opened: false,
            probe: OnceCell::new(),
        }
    }

    async fn event_loop(ctx: WorkerCtx, mut stream: MountStream, tracker: TaskTracker) {
        loop {
            tokio::select! {
                biased;

                _ = ctx.cancel.cancelled() => break,

                event = stream.mounts.recv() => {
                    let Some(event) = event else {
                        debug!("mount channel closed, leaving event loop");
                        break;
                    };
                    let ctx = ctx.clone();
                    tracker.spawn(async move {
                        process_mount(ctx, event).await;
                    });
                }

                device_id = stream.unmounts.recv() => {
                    let Some(device_id) = device_id else {
                        debug!("unmount channel closed, leaving event loop");
                        break;
                    };
                    handle_unmount(&ctx, &device_id).await;
                }
            }
        }
    }
}

#[async_trait]
impl Reader for ExternalDriveReader {
    fn metadata(&self) -> DriverMetadata {
        DriverMetadata {
            id: READER_ID,
            default_enabled: true,
            default_auto_detect: true,
            description: "Removable drives carrying a token file",
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

        let detector: Arc<dyn MountDetector> = match self.injected.take() {
            Some(detector) => Arc::from(detector),
            None => Arc::from(detect::new_detector().await?),
        };
        let stream = detector.start().await?;

        self.cancel = CancellationToken::new();
        self.tracker = TaskTracker::new();
        self.source = connect.connection_string();
        self.detector = Some(detector.clone());

        let ctx = WorkerCtx {
            options: self.options.clone(),
            detector,
            active: self.active.clone(),
            scan_tx,
            cancel: self.cancel.clone(),
            source: self.source.clone(),
        };
        let tracker = self.tracker.clone();
        self.tracker
            .spawn(Self::event_loop(ctx, stream, tracker));

        self.opened = true;
        info!(source = %self.source, "external drive reader opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ReaderError> {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if let Some(detector) = self.detector.take() {
            detector.stop().await;
        }
        self.active.write().clear();
        if self.opened {
            info!(source = %self.source, "external drive reader closed");
        }
        self.opened = false;
        Ok(())
    }

    async fn detect(&self, _hints: &[String]) -> Option<String> {
        let usable = *self
            .probe
            .get_or_init(|| async { detect::new_detector().await.is_ok() })
            .await;
        usable.then(|| "externaldrive:".to_string())
    }

    fn device(&self) -> String {
        self.source.clone()
    }

    fn connected(&self) -> bool {
        self.opened
    }

    fn info(&self) -> String {
        "external drive".to_string()
    }
}

async fn handle_unmount(ctx: &WorkerCtx, device_id: &str) {
    let base = base_device(device_id);
    let removed = ctx.active.write().remove(&base);
    if removed.is_none() {
        return;
    }
    debug!(device = %base, "tracked device unmounted");
    tokio::select! {
        _ = ctx.cancel.cancelled() => {}
        result = ctx.scan_tx.send(Scan::removed(ctx.source.clone())) => {
            if result.is_err() {
                debug!("scan receiver dropped");
            }
        }
    }
}

/// Token-acceptance state machine for one mount event
async fn process_mount(ctx: WorkerCtx, event: MountEvent) {
    // Stale-mount gate: the mount record may outlive the block device
    // after an unsafe removal.
    if !event.device_node.is_empty() && !device_node_live(&event.device_node) {
        warn!(
            device = %event.device_id,
            node = %event.device_node,
            "mount is stale, recovering"
        );
        ctx.detector.forget(&event.device_id);
        recover_stale_mount(&event).await;
        return;
    }

    // Token file discovery: the mounted volume first, then sibling mounts
    // under the removable-media roots.
    let (token_file, effective_mount) = match find_token_file(&event.mount_path).await {
        Some(file) => (file, event.mount_path.clone()),
        None => match find_in_siblings(&ctx.options.media_roots, &event.mount_path).await {
            Some(found) => found,
            None => {
                debug!(mount = %event.mount_path.display(), "no token file on volume");
                return;
            }
        },
    };

    // Safety validation. Symlinks are always rejected to prevent path
    // traversal onto host filesystems.
    let meta = match tokio::fs::symlink_metadata(&token_file).await {
        Ok(meta) => meta,
        Err(err) => {
            debug!(file = %token_file.display(), error = %err, "token file vanished");
            return;
        }
    };
    if !meta.is_file() {
        warn!(file = %token_file.display(), "token file is not a regular file, rejecting");
        return;
    }
    if meta.len() > MAX_TOKEN_FILE_SIZE {
        warn!(
            file = %token_file.display(),
            size = meta.len(),
            "token file exceeds size limit, rejecting"
        );
        return;
    }

    // Let the filesystem settle before the first read.
    if !sleep_cancellable(&ctx.cancel, ctx.options.settle_delay).await {
        return;
    }
    let Some(contents) = read_with_retry(&ctx, &token_file).await else {
        return;
    };

    let text = contents.trim();
    if text.is_empty() {
        debug!(file = %token_file.display(), "token file is empty, ignoring");
        return;
    }

    // The device may have been unmounted during the read.
    if tokio::fs::metadata(&effective_mount).await.is_err() {
        debug!(mount = %effective_mount.display(), "device unmounted during read");
        return;
    }

    let base = base_device(&event.device_id);
    let token = Token {
        token_type: TokenType::ExternalDrive,
        text: text.to_string(),
        uid: base.clone(),
        data: text.to_string(),
        scan_time: Utc::now(),
        source: ctx.source.clone(),
        reader_id: READER_ID.to_string(),
    };

    {
        let mut active = ctx.active.write();
        if active.contains_key(&base) {
            // Another partition of the same physical device already
            // produced this token.
            debug!(device = %base, "token already active, suppressing duplicate");
            return;
        }
        active.insert(base.clone(), token.clone());
    }

    info!(device = %base, mount = %effective_mount.display(), "token accepted");
    tokio::select! {
        _ = ctx.cancel.cancelled() => {}
        result = ctx.scan_tx.send(Scan::added(ctx.source.clone(), token)) => {
            if result.is_err() {
                debug!("scan receiver dropped");
            }
        }
    }
}

/// Sleep that aborts on cancellation; returns false when cancelled
async fn sleep_cancellable(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Bounded read with exponential-backoff retries for transient failures
async fn read_with_retry(ctx: &WorkerCtx, file: &Path) -> Option<String> {
    let attempts = ctx.options.read_retries + 1;
    let mut backoff = ctx.options.retry_backoff;
    for attempt in 0..attempts {
        match tokio::time::timeout(ctx.options.read_timeout, tokio::fs::read_to_string(file)).await
        {
            Ok(Ok(contents)) => return Some(contents),
            Ok(Err(err)) => {
                debug!(file = %file.display(), attempt, error = %err, "token file read failed");
            }
            Err(_) => {
                debug!(file = %file.display(), attempt, "token file read timed out");
            }
        }
        if attempt + 1 < attempts {
            if !sleep_cancellable(&ctx.cancel, backoff).await {
                return None;
            }
            backoff *= 2;
        }
    }
    warn!(file = %file.display(), "token file unreadable after retries");
    None
}

/// Case-insensitive search for the token file at the root of a directory
async fn find_token_file(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if name.to_string_lossy().eq_ignore_ascii_case(TOKEN_FILENAME) {
            return Some(entry.path());
        }
    }
    None
}

/// Search sibling mount paths under the removable-media roots.
/// Returns the token file and the sibling's mount path.
async fn find_in_siblings(
    roots: &[PathBuf],
    own_mount: &Path,
) -> Option<(PathBuf, PathBuf)> {
    for root in roots {
        for candidate in sibling_mounts(root).await {
            if candidate == own_mount {
                continue;
            }
            if let Some(file) = find_token_file(&candidate).await {
                debug!(sibling = %candidate.display(), "token file found on sibling mount");
                return Some((file, candidate));
            }
        }
    }
    None
}

/// Direct children of a media root; `run/media` roots hold per-user
/// directories, so those descend one extra level
async fn sibling_mounts(root: &Path) -> Vec<PathBuf> {
    let mut mounts = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(root).await else {
        return mounts;
    };
    let per_user = root.ends_with("run/media");
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if per_user {
            if let Ok(mut inner) = tokio::fs::read_dir(&path).await {
                while let Ok(Some(entry)) = inner.next_entry().await {
                    let path = entry.path();
                    if path.is_dir() {
                        mounts.push(path);
                    }
                }
            }
        } else {
            mounts.push(path);
        }
    }
    mounts
}

/// Whether the block device backing a mount is still present
fn device_node_live(node: &str) -> bool {
    if Path::new(node).exists() {
        return true;
    }
    sys_block_entry(node).is_some_and(|sys| sys.exists())
}

/// `/sys/block/<base>` entry for a `/dev/` node, when one can be derived
fn sys_block_entry(node: &str) -> Option<PathBuf> {
    let name = node.strip_prefix("/dev/")?;
    let base = base_device(name);
    Some(Path::new("/sys/block").join(base))
}

/// Best-effort recovery from a stale mount: a lazy unmount, gated on a
/// strict allowlist so the command can never touch system filesystems
async fn recover_stale_mount(event: &MountEvent) {
    let node_exists = Path::new(&event.device_node).exists();
    let sys_exists = sys_block_entry(&event.device_node).is_some_and(|sys| sys.exists());
    if !unmount_allowed(&event.mount_path, &event.device_node, node_exists, sys_exists) {
        debug!(mount = %event.mount_path.display(), "stale mount outside unmount allowlist");
        return;
    }

    info!(mount = %event.mount_path.display(), "lazy-unmounting stale mount");
    match tokio::process::Command::new("umount")
        .arg("-l")
        .arg(&event.mount_path)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            warn!(
                mount = %event.mount_path.display(),
                status = %output.status,
                "lazy unmount failed"
            );
        }
        Err(err) => {
            warn!(mount = %event.mount_path.display(), error = %err, "lazy unmount failed");
        }
    }
}

/// Gate for the stale-mount lazy unmount; every condition must hold
fn unmount_allowed(
    mount_path: &Path,
    device_node: &str,
    node_exists: bool,
    sys_block_exists: bool,
) -> bool {
    let path = mount_path.to_string_lossy();
    let path_ok = ["/media/", "/mnt/", "/run/media/"]
        .iter()
        .any(|prefix| path.starts_with(prefix));
    let node_ok =
        device_node.starts_with("/dev/sd") || device_node.starts_with("/dev/mmcblk");
    path_ok && node_ok && !node_exists && !sys_block_exists
}
