//! Mount detection for removable volumes
//!
//! A detector turns OS mount signals into a stream of [`MountEvent`]s and
//! unmount notifications. Backends are platform-specific and selected at
//! construction time:
//! - Linux: D-Bus/UDisks2 signals, falling back to a `/proc/mounts` poll
//! - macOS: `/Volumes` filesystem watcher
//! - Windows: WMI `Win32_VolumeChangeEvent` subscription
//!
//! Detectors are unaware of their consumers; communication is strictly
//! through the channels handed out by `start`.

#[cfg(target_os = "linux")]
pub mod procmounts;
#[cfg(target_os = "linux")]
pub mod udisks;
#[cfg(target_os = "macos")]
pub mod volumes;
#[cfg(windows)]
pub mod wmi;

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Depth of the mount/unmount event channels
pub const EVENT_CHANNEL_DEPTH: usize = 10;

/// Detector errors
#[derive(Debug, Error)]
pub enum DetectorError {
    /// No backend works on this platform
    #[error("mount detection unavailable: {0}")]
    Unavailable(String),

    /// Backend construction succeeded but startup failed
    #[error("mount detection start failed: {0}")]
    StartFailed(String),

    /// Detector was started twice without an intervening stop
    #[error("detector already started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bus classification of a mounted device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    Usb,
    Sd,
    Removable,
    #[default]
    Unknown,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Usb => write!(f, "USB"),
            DeviceType::Sd => write!(f, "SD"),
            DeviceType::Removable => write!(f, "removable"),
            DeviceType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single device mount reported by a backend
#[derive(Debug, Clone, PartialEq)]
pub struct MountEvent {
    /// Stable identifier: volume UUID > device serial > device node.
    /// Events with an empty ID are discarded by the backend.
    pub device_id: String,
    /// Block-device path when known (e.g. `/dev/sda1`); used only for
    /// stale-mount safety checks
    pub device_node: String,
    /// Filesystem path at which the volume is accessible
    pub mount_path: PathBuf,
    /// User-facing label; may be empty
    pub volume_label: String,
    pub device_type: DeviceType,
}

/// Output channels of a started detector.
///
/// The senders live inside the backend task; both channels close exactly
/// once, when `stop` ends that task.
pub struct MountStream {
    /// Device mounts, in OS report order
    pub mounts: mpsc::Receiver<MountEvent>,
    /// Device IDs of unmounted devices
    pub unmounts: mpsc::Receiver<String>,
}

/// Platform mount-detection backend.
///
/// Lifecycle: created → `start` → emits → `stop`. `stop` is idempotent and
/// releases OS resources. `forget` clears internal tracking for a device so
/// a later re-appearance is reported again.
#[async_trait]
pub trait MountDetector: Send + Sync {
    async fn start(&self) -> Result<MountStream, DetectorError>;

    async fn stop(&self);

    fn forget(&self, device_id: &str);
}

/// Construct the preferred detector for this host.
///
/// On Linux the UDisks2 backend is probed first (daemon reachable on the
/// system bus) and the `/proc/mounts` poll is the fallback.
#[allow(unreachable_code)]
pub async fn new_detector() -> Result<Box<dyn MountDetector>, DetectorError> {
    #[cfg(target_os = "linux")]
    {
        match udisks::UDisksDetector::probe().await {
            Ok(detector) => return Ok(Box::new(detector)),
            Err(err) => {
                tracing::debug!(error = %err, "UDisks2 unavailable, using /proc/mounts poll");
            }
        }
        return Ok(Box::new(procmounts::ProcMountsDetector::new()));
    }

    #[cfg(target_os = "macos")]
    {
        return Ok(Box::new(volumes::VolumesDetector::new()));
    }

    #[cfg(windows)]
    {
        return Ok(Box::new(wmi::WmiDetector::new()));
    }

    Err(DetectorError::Unavailable(
        "no mount detection backend for this platform".to_string(),
    ))
}

/// Strip a trailing partition suffix from a device identifier.
///
/// `sdX<n>` → `sdX`, `nvme<n>n<m>p<k>` → `nvme<n>n<m>`,
/// `mmcblk<n>p<k>` → `mmcblk<n>`. Identifiers that are not partitioned
/// device names pass through unchanged. This is the dedup key for tokens:
/// partitions of one physical device share a base.
pub fn base_device(device_id: &str) -> String {
    let (prefix, name) = match device_id.rfind('/') {
        Some(idx) => device_id.split_at(idx + 1),
        None => ("", device_id),
    };

    let stripped = strip_partition(name);
    if stripped == name {
        device_id.to_string()
    } else {
        format!("{prefix}{stripped}")
    }
}

fn strip_partition(name: &str) -> &str {
    // nvme0n1p3 -> nvme0n1, mmcblk0p1 -> mmcblk0
    for base in ["nvme", "mmcblk"] {
        if let Some(rest) = name.strip_prefix(base) {
            if let Some(p_idx) = rest.rfind('p') {
                let (head, tail) = rest.split_at(p_idx);
                let digits = &tail[1..];
                if !head.is_empty()
                    && !digits.is_empty()
                    && digits.bytes().all(|b| b.is_ascii_digit())
                    && head.bytes().all(|b| b.is_ascii_alphanumeric())
                    && head.bytes().last().is_some_and(|b| b.is_ascii_digit())
                {
                    return &name[..base.len() + p_idx];
                }
            }
            return name;
        }
    }

    // sda1 -> sda
    if name.starts_with("sd") {
        let letters = name.bytes().take_while(|b| b.is_ascii_lowercase()).count();
        if letters >= 3 && name[letters..].bytes().all(|b| b.is_ascii_digit()) && letters < name.len()
        {
            return &name[..letters];
        }
    }

    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_device_strips_scsi_partitions() {
        assert_eq!(base_device("sda1"), "sda");
        assert_eq!(base_device("sdb12"), "sdb");
        assert_eq!(base_device("/dev/sda2"), "/dev/sda");
    }

    #[test]
    fn test_base_device_strips_nvme_partitions() {
        assert_eq!(base_device("nvme0n1p3"), "nvme0n1");
        assert_eq!(base_device("/dev/nvme1n2p10"), "/dev/nvme1n2");
    }

    #[test]
    fn test_base_device_strips_mmc_partitions() {
        assert_eq!(base_device("mmcblk0p1"), "mmcblk0");
        assert_eq!(base_device("/dev/mmcblk2p12"), "/dev/mmcblk2");
    }

    #[test]
    fn test_base_device_leaves_whole_devices() {
        assert_eq!(base_device("sda"), "sda");
        assert_eq!(base_device("nvme0n1"), "nvme0n1");
        assert_eq!(base_device("mmcblk0"), "mmcblk0");
    }

    #[test]
    fn test_base_device_passes_non_device_ids() {
        assert_eq!(base_device("UUID-AAAA"), "UUID-AAAA");
        assert_eq!(base_device("1234-ABCD"), "1234-ABCD");
        assert_eq!(base_device(""), "");
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(DeviceType::Usb.to_string(), "USB");
        assert_eq!(DeviceType::Unknown.to_string(), "unknown");
    }
}
