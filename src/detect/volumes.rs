//! macOS mount detection by watching `/Volumes`
//!
//! Filesystem change notifications on `/Volumes` are debounced for ~100 ms,
//! then the directory is re-scanned and diffed against the tracked set.
//! Only local, browsable volumes of user-media filesystem types pass the
//! `statfs` gate; the device ID is the hex-encoded filesystem ID tuple.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    DetectorError, DeviceType, MountDetector, MountEvent, MountStream, EVENT_CHANNEL_DEPTH,
};

const VOLUMES_ROOT: &str = "/Volumes";
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Volumes the OS mounts for itself, matched exactly or as a name prefix
const SYSTEM_VOLUMES: &[&str] = &[
    "Macintosh HD",
    "Preboot",
    "Recovery",
    "VM",
    "Data",
    "System",
    "Update",
];

const MEDIA_FSTYPES: &[&str] = &["msdos", "exfat", "hfs", "apfs"];

struct Shared {
    mounted: DashMap<String, ()>,
    by_path: DashMap<PathBuf, String>,
}

/// Mount detector backed by `/Volumes` change notifications
pub struct VolumesDetector {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for VolumesDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumesDetector {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                mounted: DashMap::new(),
                by_path: DashMap::new(),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MountDetector for VolumesDetector {
    async fn start(&self) -> Result<MountStream, DetectorError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(DetectorError::AlreadyStarted);
        }

        let (kick_tx, mut kick_rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                if result.is_ok() {
                    let _ = kick_tx.send(());
                }
            },
        )
        .map_err(|e| DetectorError::StartFailed(format!("watcher: {e}")))?;
        watcher
            .watch(Path::new(VOLUMES_ROOT), RecursiveMode::NonRecursive)
            .map_err(|e| DetectorError::StartFailed(format!("watch {VOLUMES_ROOT}: {e}")))?;

        let (mount_tx, mounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (unmount_tx, unmounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            // The watcher must outlive the task or the OS watch is dropped.
            let _watcher = watcher;

            // Report volumes present at startup.
            rescan(&shared, &cancel, &mount_tx, &unmount_tx).await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    kick = kick_rx.recv() => {
                        if kick.is_none() {
                            break;
                        }
                        // Volume mounts arrive as bursts of directory events.
                        tokio::time::sleep(DEBOUNCE).await;
                        while kick_rx.try_recv().is_ok() {}
                        rescan(&shared, &cancel, &mount_tx, &unmount_tx).await;
                    }
                }
            }
            debug!("/Volumes watcher stopped");
        }));

        Ok(MountStream { mounts, unmounts })
    }

    async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn forget(&self, device_id: &str) {
        self.shared.mounted.remove(device_id);
        self.shared
            .by_path
            .retain(|_, id| id.as_str() != device_id);
    }
}

async fn rescan(
    shared: &Shared,
    cancel: &CancellationToken,
    mount_tx: &mpsc::Sender<MountEvent>,
    unmount_tx: &mpsc::Sender<String>,
) {
    let current = scan_volumes(Path::new(VOLUMES_ROOT));

    for event in &current {
        if shared.by_path.contains_key(&event.mount_path)
            || shared.mounted.contains_key(&event.device_id)
        {
            continue;
        }
        shared.mounted.insert(event.device_id.clone(), ());
        shared
            .by_path
            .insert(event.mount_path.clone(), event.device_id.clone());
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = mount_tx.send(event.clone()) => {
                if result.is_err() {
                    return;
                }
            }
        }
    }

    let gone: Vec<(PathBuf, String)> = shared
        .by_path
        .iter()
        .filter(|entry| !current.iter().any(|e| &e.mount_path == entry.key()))
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    for (path, device_id) in gone {
        shared.by_path.remove(&path);
        shared.mounted.remove(&device_id);
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = unmount_tx.send(device_id) => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}

fn scan_volumes(root: &Path) -> Vec<MountEvent> {
    let mut events = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        warn!(root = %root.display(), "cannot list volumes root");
        return events;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_system_volume(&name) {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some((device_id, device_node)) = volume_identity(&path) else {
            continue;
        };
        events.push(MountEvent {
            device_id,
            device_node,
            mount_path: path,
            volume_label: name,
            device_type: DeviceType::Removable,
        });
    }
    events
}

fn is_system_volume(name: &str) -> bool {
    SYSTEM_VOLUMES
        .iter()
        .any(|sys| name == *sys || name.starts_with(sys))
}

/// Gate a volume through `statfs`: local, browsable, user-media fstype.
/// Returns the hex filesystem-ID device ID and the backing device node.
fn volume_identity(path: &Path) -> Option<(String, String)> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(c_path.as_ptr(), &mut stat) } != 0 {
        return None;
    }

    let flags = stat.f_flags;
    if flags & (libc::MNT_LOCAL as u32) == 0 {
        return None;
    }
    if flags & (libc::MNT_DONTBROWSE as u32) != 0 {
        return None;
    }

    let fstype = c_char_field(&stat.f_fstypename);
    if !MEDIA_FSTYPES.contains(&fstype.as_str()) {
        return None;
    }

    let mut fsid = Vec::with_capacity(8);
    fsid.extend_from_slice(&stat.f_fsid.val[0].to_be_bytes());
    fsid.extend_from_slice(&stat.f_fsid.val[1].to_be_bytes());

    Some((hex::encode(fsid), c_char_field(&stat.f_mntfromname)))
}

fn c_char_field(field: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = field
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_system_volume() {
        assert!(is_system_volume("Macintosh HD"));
        assert!(is_system_volume("Macintosh HD - Data"));
        assert!(is_system_volume("Recovery"));
        assert!(is_system_volume("Update"));
        assert!(!is_system_volume("SANDISK32"));
        assert!(!is_system_volume("Untitled"));
    }

    #[test]
    fn test_c_char_field_stops_at_nul() {
        let mut raw = [0 as libc::c_char; 16];
        for (i, b) in b"apfs".iter().enumerate() {
            raw[i] = *b as libc::c_char;
        }
        assert_eq!(c_char_field(&raw), "apfs");
        assert_eq!(c_char_field(&[0 as libc::c_char; 4]), "");
    }
}
