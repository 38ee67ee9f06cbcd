//! Poll-based mount detection from `/proc/mounts`
//!
//! Fallback for hosts without a reachable UDisks2 daemon. The kernel flags
//! `/proc/mounts` with `POLLPRI|POLLERR` on mount-table changes; a 1 s
//! timeout doubles as a periodic safety net for kernels that do not signal.
//! Each pass rescans the table and diffs it against the tracked set.
//!
//! The loop blocks in `poll(2)`, so it runs under `spawn_blocking` with an
//! atomic stop flag, mirroring the hardware read-loop split used elsewhere
//! in the pipeline.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    DetectorError, DeviceType, MountDetector, MountEvent, MountStream, EVENT_CHANNEL_DEPTH,
};

const PROC_MOUNTS: &str = "/proc/mounts";
const BY_UUID_DIR: &str = "/dev/disk/by-uuid";
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Filesystem types that never correspond to removable media
const SYSTEM_FS: &[&str] = &[
    "sysfs", "proc", "procfs", "tmpfs", "devtmpfs", "devpts", "overlay", "autofs", "securityfs",
    "debugfs", "tracefs", "pstore", "efivarfs", "bpf", "configfs", "fusectl", "mqueue",
    "hugetlbfs", "binfmt_misc", "nsfs", "ramfs", "rpc_pipefs", "squashfs",
];

/// Mount detector that polls `/proc/mounts` and diffs the table
pub struct ProcMountsDetector {
    tracked: Arc<DashMap<String, ()>>,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ProcMountsDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcMountsDetector {
    pub fn new() -> Self {
        Self {
            tracked: Arc::new(DashMap::new()),
            stop: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MountDetector for ProcMountsDetector {
    async fn start(&self) -> Result<MountStream, DetectorError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(DetectorError::AlreadyStarted);
        }

        let file = File::open(PROC_MOUNTS)
            .map_err(|e| DetectorError::StartFailed(format!("{PROC_MOUNTS}: {e}")))?;

        let (mount_tx, mounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (unmount_tx, unmounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        let tracked = self.tracked.clone();
        let stop = self.stop.clone();
        *task = Some(tokio::task::spawn_blocking(move || {
            poll_loop(file, tracked, stop, mount_tx, unmount_tx);
        }));

        Ok(MountStream { mounts, unmounts })
    }

    async fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn forget(&self, device_id: &str) {
        self.tracked.remove(device_id);
    }
}

fn poll_loop(
    mut file: File,
    tracked: Arc<DashMap<String, ()>>,
    stop: Arc<AtomicBool>,
    mount_tx: mpsc::Sender<MountEvent>,
    unmount_tx: mpsc::Sender<String>,
) {
    let mut last_scan: Option<Instant> = None;

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        let due = last_scan.is_none_or(|t| t.elapsed() >= SCAN_INTERVAL);
        if due {
            last_scan = Some(Instant::now());
            if let Err(err) = rescan(&mut file, &tracked, &stop, &mount_tx, &unmount_tx) {
                warn!(error = %err, "mount table rescan failed");
            }
        }

        let mut fds = [PollFd::new(
            file.as_fd(),
            PollFlags::POLLPRI | PollFlags::POLLERR,
        )];
        match poll(&mut fds, PollTimeout::from(1000u16)) {
            Ok(0) => {} // timeout; the periodic rescan above covers it
            Ok(_) => {
                last_scan = None; // table changed, force a rescan now
            }
            Err(err) => {
                warn!(error = %err, "poll on /proc/mounts failed");
                std::thread::sleep(SCAN_INTERVAL);
            }
        }
    }
    debug!("mount table poll loop stopped");
}

fn rescan(
    file: &mut File,
    tracked: &DashMap<String, ()>,
    stop: &AtomicBool,
    mount_tx: &mpsc::Sender<MountEvent>,
    unmount_tx: &mpsc::Sender<String>,
) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;

    let uuids = uuid_index(Path::new(BY_UUID_DIR));

    let mut current: HashMap<String, MountEvent> = HashMap::new();
    for line in content.lines() {
        let Some((device, mount_path, fstype)) = parse_line(line) else {
            continue;
        };
        if !relevant_mount(&device, &mount_path, &fstype) {
            continue;
        }

        let device_id = resolve_device_id(&uuids, &device);
        if device_id.is_empty() {
            continue;
        }
        let mount_path = PathBuf::from(mount_path);
        let volume_label = mount_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        current.insert(
            device_id.clone(),
            MountEvent {
                device_id,
                device_node: device,
                mount_path,
                volume_label,
                device_type: DeviceType::Unknown,
            },
        );
    }

    // Added devices
    for (device_id, event) in &current {
        if tracked.contains_key(device_id) {
            continue;
        }
        tracked.insert(device_id.clone(), ());
        send_blocking(mount_tx, stop, event.clone());
    }

    // Removed devices
    let gone: Vec<String> = tracked
        .iter()
        .map(|entry| entry.key().clone())
        .filter(|id| !current.contains_key(id))
        .collect();
    for device_id in gone {
        tracked.remove(&device_id);
        send_blocking(unmount_tx, stop, device_id);
    }

    Ok(())
}

/// Blocking-context send that backs off while the channel is full and gives
/// up when the stop flag fires or the receiver is gone
fn send_blocking<T>(tx: &mpsc::Sender<T>, stop: &AtomicBool, item: T) {
    let mut item = item;
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match tx.try_send(item) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(back)) => {
                item = back;
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
}

/// Parse one `/proc/mounts` line into (device, mount path, fstype)
fn parse_line(line: &str) -> Option<(String, String, String)> {
    let mut fields = line.split_ascii_whitespace();
    let device = fields.next()?;
    let mount_path = fields.next()?;
    let fstype = fields.next()?;
    Some((
        unescape_octal(device),
        unescape_octal(mount_path),
        fstype.to_string(),
    ))
}

/// `/proc/mounts` escapes space, tab, newline and backslash as `\0dd` octal
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &bytes[i + 1..i + 4];
            if oct.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = u32::from(oct[0] - b'0') * 64
                    + u32::from(oct[1] - b'0') * 8
                    + u32::from(oct[2] - b'0');
                if value <= 0xFF {
                    out.push(value as u8);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Keep only real block devices mounted under the removable-media prefixes
fn relevant_mount(device: &str, mount_path: &str, fstype: &str) -> bool {
    if SYSTEM_FS.contains(&fstype) || fstype.starts_with("cgroup") {
        return false;
    }
    if !device.starts_with("/dev/") {
        return false;
    }
    mount_path.starts_with("/media/") || mount_path.starts_with("/mnt/")
}

/// Map canonical device paths to volume UUIDs by walking the by-uuid symlinks
fn uuid_index(by_uuid_dir: &Path) -> HashMap<PathBuf, String> {
    let mut index = HashMap::new();
    let Ok(entries) = std::fs::read_dir(by_uuid_dir) else {
        return index;
    };
    for entry in entries.flatten() {
        let Ok(target) = std::fs::canonicalize(entry.path()) else {
            continue;
        };
        index.insert(target, entry.file_name().to_string_lossy().into_owned());
    }
    index
}

fn resolve_device_id(uuids: &HashMap<PathBuf, String>, device: &str) -> String {
    let canonical = std::fs::canonicalize(device).unwrap_or_else(|_| PathBuf::from(device));
    match uuids.get(&canonical) {
        Some(uuid) => uuid.clone(),
        None => device.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let (device, path, fstype) =
            parse_line("/dev/sda1 /media/usb vfat rw,relatime 0 0").unwrap();
        assert_eq!(device, "/dev/sda1");
        assert_eq!(path, "/media/usb");
        assert_eq!(fstype, "vfat");
        assert!(parse_line("").is_none());
        assert!(parse_line("/dev/sda1").is_none());
    }

    #[test]
    fn test_unescape_octal() {
        assert_eq!(unescape_octal(r"/media/MY\040DISK"), "/media/MY DISK");
        assert_eq!(unescape_octal("/media/plain"), "/media/plain");
        assert_eq!(unescape_octal(r"ends\04"), r"ends\04");
    }

    #[test]
    fn test_relevant_mount_filters_system_fs() {
        assert!(!relevant_mount("/dev/sda1", "/media/usb", "tmpfs"));
        assert!(!relevant_mount("/dev/sda1", "/media/usb", "cgroup2"));
        assert!(relevant_mount("/dev/sda1", "/media/usb", "vfat"));
    }

    #[test]
    fn test_relevant_mount_filters_paths_and_devices() {
        assert!(!relevant_mount("overlay", "/media/usb", "ext4"));
        assert!(!relevant_mount("/dev/sda1", "/home/user", "ext4"));
        assert!(relevant_mount("/dev/mmcblk0p1", "/mnt/sd", "exfat"));
    }

    #[test]
    fn test_uuid_index_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("sda1");
        std::fs::write(&device, b"").unwrap();
        let by_uuid = dir.path().join("by-uuid");
        std::fs::create_dir(&by_uuid).unwrap();
        std::os::unix::fs::symlink(&device, by_uuid.join("AAAA-1234")).unwrap();

        let index = uuid_index(&by_uuid);
        let id = resolve_device_id(&index, device.to_str().unwrap());
        assert_eq!(id, "AAAA-1234");

        // Unknown device falls back to the node path
        let id = resolve_device_id(&index, "/dev/does-not-exist");
        assert_eq!(id, "/dev/does-not-exist");
    }
}
