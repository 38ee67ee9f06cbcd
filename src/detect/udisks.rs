//! UDisks2 mount detection over the system D-Bus
//!
//! Subscribes to `InterfacesAdded`/`InterfacesRemoved` on the UDisks2 object
//! manager. A device is reported when it exposes both the Block and
//! Filesystem interfaces, is not hinted as a system device, and has at least
//! one mount point. An object-path map keeps unmount resolution
//! deterministic.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};
use zbus::Connection;

use super::{
    DetectorError, DeviceType, MountDetector, MountEvent, MountStream, EVENT_CHANNEL_DEPTH,
};

const UDISKS_SERVICE: &str = "org.freedesktop.UDisks2";
const BLOCK_IFACE: &str = "org.freedesktop.UDisks2.Block";
const FILESYSTEM_IFACE: &str = "org.freedesktop.UDisks2.Filesystem";

type InterfaceProps = HashMap<String, HashMap<String, OwnedValue>>;

#[zbus::proxy(
    default_service = "org.freedesktop.UDisks2",
    default_path = "/org/freedesktop/UDisks2",
    interface = "org.freedesktop.DBus.ObjectManager"
)]
trait UDisksObjectManager {
    fn get_managed_objects(&self) -> zbus::Result<HashMap<OwnedObjectPath, InterfaceProps>>;

    #[zbus(signal)]
    fn interfaces_added(
        &self,
        object_path: OwnedObjectPath,
        interfaces_and_properties: InterfaceProps,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn interfaces_removed(
        &self,
        object_path: OwnedObjectPath,
        interfaces: Vec<String>,
    ) -> zbus::Result<()>;
}

#[zbus::proxy(
    default_service = "org.freedesktop.UDisks2",
    interface = "org.freedesktop.UDisks2.Filesystem"
)]
trait Filesystem {
    #[zbus(property)]
    fn mount_points(&self) -> zbus::Result<Vec<Vec<u8>>>;
}

struct Shared {
    /// Tracked device IDs; `forget` clears entries so re-insertion reports again
    mounted: DashMap<String, ()>,
    /// D-Bus object path → device ID, for unmount resolution
    by_path: DashMap<String, String>,
}

/// Mount detector backed by the UDisks2 daemon
pub struct UDisksDetector {
    connection: Connection,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UDisksDetector {
    /// Connect to the system bus and verify the UDisks2 daemon is present.
    ///
    /// Fails with `Unavailable` when the bus or the daemon cannot be
    /// reached, letting the caller fall back to polling.
    pub async fn probe() -> Result<Self, DetectorError> {
        let connection = Connection::system()
            .await
            .map_err(|e| DetectorError::Unavailable(format!("system bus: {e}")))?;

        let dbus = zbus::fdo::DBusProxy::new(&connection)
            .await
            .map_err(|e| DetectorError::Unavailable(format!("bus proxy: {e}")))?;
        let names = dbus
            .list_names()
            .await
            .map_err(|e| DetectorError::Unavailable(format!("list names: {e}")))?;
        if !names.iter().any(|n| n.as_str() == UDISKS_SERVICE) {
            return Err(DetectorError::Unavailable(
                "UDisks2 daemon not on the system bus".to_string(),
            ));
        }

        Ok(Self {
            connection,
            shared: Arc::new(Shared {
                mounted: DashMap::new(),
                by_path: DashMap::new(),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    async fn handle_added(
        connection: &Connection,
        shared: &Shared,
        cancel: &CancellationToken,
        mount_tx: &mpsc::Sender<MountEvent>,
        object_path: OwnedObjectPath,
        interfaces: &InterfaceProps,
    ) {
        let Some(block) = interfaces.get(BLOCK_IFACE) else {
            return;
        };
        if !interfaces.contains_key(FILESYSTEM_IFACE) {
            return;
        }
        if prop_bool(block, "HintSystem") || prop_bool(block, "HintIgnore") {
            debug!(path = %object_path, "skipping hinted system device");
            return;
        }

        let Some(mount_path) = first_mount_point(connection, &object_path).await else {
            debug!(path = %object_path, "block device has no mount points");
            return;
        };

        let device_node = prop_byte_string(block, "Device");
        let uuid = prop_string(block, "IdUUID");
        let serial = prop_string(block, "IdSerial");
        let device_id = if !uuid.is_empty() {
            uuid
        } else if !serial.is_empty() {
            serial
        } else {
            device_node.clone()
        };
        if device_id.is_empty() {
            debug!(path = %object_path, "discarding mount with no usable device ID");
            return;
        }

        if shared.mounted.contains_key(&device_id) {
            return;
        }

        let event = MountEvent {
            device_id: device_id.clone(),
            device_node,
            mount_path,
            volume_label: prop_string(block, "IdLabel"),
            device_type: classify_bus(
                &prop_string(block, "ConnectionBus"),
                prop_bool(block, "Removable"),
            ),
        };

        shared.mounted.insert(device_id.clone(), ());
        shared
            .by_path
            .insert(object_path.to_string(), device_id);

        tokio::select! {
            _ = cancel.cancelled() => {}
            result = mount_tx.send(event) => {
                if result.is_err() {
                    debug!("mount event receiver dropped");
                }
            }
        }
    }

    async fn handle_removed(
        shared: &Shared,
        cancel: &CancellationToken,
        unmount_tx: &mpsc::Sender<String>,
        object_path: &OwnedObjectPath,
    ) {
        let Some((_, device_id)) = shared.by_path.remove(object_path.as_str()) else {
            return;
        };
        shared.mounted.remove(&device_id);

        tokio::select! {
            _ = cancel.cancelled() => {}
            result = unmount_tx.send(device_id) => {
                if result.is_err() {
                    debug!("unmount receiver dropped");
                }
            }
        }
    }
}

#[async_trait]
impl MountDetector for UDisksDetector {
    async fn start(&self) -> Result<MountStream, DetectorError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(DetectorError::AlreadyStarted);
        }

        let manager = UDisksObjectManagerProxy::new(&self.connection)
            .await
            .map_err(|e| DetectorError::StartFailed(format!("object manager: {e}")))?;
        let mut added = manager
            .receive_interfaces_added()
            .await
            .map_err(|e| DetectorError::StartFailed(format!("InterfacesAdded: {e}")))?;
        let mut removed = manager
            .receive_interfaces_removed()
            .await
            .map_err(|e| DetectorError::StartFailed(format!("InterfacesRemoved: {e}")))?;

        let (mount_tx, mounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (unmount_tx, unmounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        let connection = self.connection.clone();
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();

        *task = Some(tokio::spawn(async move {
            // Report volumes that were already mounted when we started.
            match manager.get_managed_objects().await {
                Ok(objects) => {
                    for (path, interfaces) in objects {
                        if cancel.is_cancelled() {
                            return;
                        }
                        Self::handle_added(
                            &connection,
                            &shared,
                            &cancel,
                            &mount_tx,
                            path,
                            &interfaces,
                        )
                        .await;
                    }
                }
                Err(err) => warn!(error = %err, "initial UDisks2 enumeration failed"),
            }

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    signal = added.next() => {
                        let Some(signal) = signal else { break };
                        match signal.args() {
                            Ok(args) => {
                                Self::handle_added(
                                    &connection,
                                    &shared,
                                    &cancel,
                                    &mount_tx,
                                    args.object_path,
                                    &args.interfaces_and_properties,
                                )
                                .await;
                            }
                            Err(err) => warn!(error = %err, "bad InterfacesAdded signal"),
                        }
                    }

                    signal = removed.next() => {
                        let Some(signal) = signal else { break };
                        match signal.args() {
                            Ok(args) => {
                                Self::handle_removed(
                                    &shared,
                                    &cancel,
                                    &unmount_tx,
                                    &args.object_path,
                                )
                                .await;
                            }
                            Err(err) => warn!(error = %err, "bad InterfacesRemoved signal"),
                        }
                    }
                }
            }
            debug!("UDisks2 listener stopped");
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
    }
}

async fn first_mount_point(
    connection: &Connection,
    object_path: &OwnedObjectPath,
) -> Option<PathBuf> {
    let fs = FilesystemProxy::builder(connection)
        .path(object_path.clone())
        .ok()?
        .build()
        .await
        .ok()?;
    let points = fs.mount_points().await.ok()?;
    points
        .into_iter()
        .map(|bytes| trim_nul(&bytes))
        .find(|p| !p.is_empty())
        .map(PathBuf::from)
}

/// Map the UDisks2 ConnectionBus (plus the Removable flag) to a device type
fn classify_bus(bus: &str, removable: bool) -> DeviceType {
    match bus {
        "usb" => DeviceType::Usb,
        "sdio" => DeviceType::Sd,
        "" => {
            if removable {
                DeviceType::Removable
            } else {
                DeviceType::Unknown
            }
        }
        _ => DeviceType::Removable,
    }
}

/// UDisks2 encodes paths as NUL-terminated byte arrays
fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn prop_bool(props: &HashMap<String, OwnedValue>, key: &str) -> bool {
    props
        .get(key)
        .and_then(|v| v.downcast_ref::<bool>().ok())
        .unwrap_or(false)
}

fn prop_string(props: &HashMap<String, OwnedValue>, key: &str) -> String {
    props
        .get(key)
        .and_then(|v| v.downcast_ref::<&str>().ok())
        .unwrap_or_default()
        .to_string()
}

/// Byte-array property (e.g. `Device`), NUL-trimmed
fn prop_byte_string(props: &HashMap<String, OwnedValue>, key: &str) -> String {
    let Some(value) = props.get(key) else {
        return String::new();
    };
    let Value::Array(array) = value.deref() else {
        return String::new();
    };
    let bytes: Vec<u8> = array
        .iter()
        .filter_map(|v| u8::try_from(v.clone()).ok())
        .collect();
    trim_nul(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bus() {
        assert_eq!(classify_bus("usb", false), DeviceType::Usb);
        assert_eq!(classify_bus("sdio", false), DeviceType::Sd);
        assert_eq!(classify_bus("ata", false), DeviceType::Removable);
        assert_eq!(classify_bus("", true), DeviceType::Removable);
        assert_eq!(classify_bus("", false), DeviceType::Unknown);
    }

    #[test]
    fn test_trim_nul() {
        assert_eq!(trim_nul(b"/dev/sda1\0"), "/dev/sda1");
        assert_eq!(trim_nul(b"/dev/sda1"), "/dev/sda1");
        assert_eq!(trim_nul(b"\0"), "");
        assert_eq!(trim_nul(b""), "");
    }
}
