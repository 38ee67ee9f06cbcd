//! Windows mount detection via WMI volume-change events
//!
//! A dedicated blocking task subscribes to `Win32_VolumeChangeEvent`
//! (EventType 2 = device arrival, 3 = device removal) and consumes events
//! with a 1 s `NextEvent` timeout so the stop flag is observed promptly.
//! Arrivals are gated on `GetDriveTypeW == DRIVE_REMOVABLE`; the device ID
//! is the volume serial number from `GetVolumeInformationW`, falling back
//! to the drive letter. COM is initialized on the consumer thread and
//! released in reverse order of acquisition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use windows::core::{w, BSTR, PCWSTR, VARIANT};
use windows::Win32::Storage::FileSystem::{
    GetDriveTypeW, GetVolumeInformationW, DRIVE_REMOVABLE,
};
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket, CoUninitialize,
    CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED, EOAC_NONE, RPC_C_AUTHN_LEVEL_CALL,
    RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE,
};
use windows::Win32::System::Rpc::{RPC_C_AUTHN_WINNT, RPC_C_AUTHZ_NONE};
use windows::Win32::System::Wmi::{
    IWbemClassObject, IWbemLocator, IWbemServices, WbemLocator, WBEM_FLAG_FORWARD_ONLY,
    WBEM_FLAG_RETURN_IMMEDIATELY,
};

use super::{
    DetectorError, DeviceType, MountDetector, MountEvent, MountStream, EVENT_CHANNEL_DEPTH,
};

const EVENT_QUERY: &str =
    "SELECT * FROM Win32_VolumeChangeEvent WHERE EventType = 2 OR EventType = 3";
const EVENT_ARRIVAL: i32 = 2;
const EVENT_REMOVAL: i32 = 3;

struct Shared {
    mounted: DashMap<String, ()>,
    by_letter: DashMap<String, String>,
}

/// Mount detector backed by WMI volume-change notifications
pub struct WmiDetector {
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Default for WmiDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl WmiDetector {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                mounted: DashMap::new(),
                by_letter: DashMap::new(),
            }),
            stop: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl MountDetector for WmiDetector {
    async fn start(&self) -> Result<MountStream, DetectorError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(DetectorError::AlreadyStarted);
        }

        let (mount_tx, mounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let (unmount_tx, unmounts) = mpsc::channel(EVENT_CHANNEL_DEPTH);

        // Probe COM/WMI on the consumer thread before declaring success.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let handle = tokio::task::spawn_blocking(move || {
            event_thread(shared, stop, mount_tx, unmount_tx, ready_tx);
        });

        match ready_rx.recv_timeout(Duration::from_secs(10)) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                let _ = handle.await;
                return Err(DetectorError::StartFailed(message));
            }
            Err(_) => {
                self.stop.store(true, Ordering::Relaxed);
                let _ = handle.await;
                return Err(DetectorError::StartFailed(
                    "WMI subscription timed out".to_string(),
                ));
            }
        }

        *task = Some(handle);
        Ok(MountStream { mounts, unmounts })
    }

    async fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    fn forget(&self, device_id: &str) {
        self.shared.mounted.remove(device_id);
        self.shared
            .by_letter
            .retain(|_, id| id.as_str() != device_id);
    }
}

fn event_thread(
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    mount_tx: mpsc::Sender<MountEvent>,
    unmount_tx: mpsc::Sender<String>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    unsafe {
        if let Err(err) = CoInitializeEx(None, COINIT_MULTITHREADED).ok() {
            let _ = ready_tx.send(Err(format!("CoInitializeEx: {err}")));
            return;
        }
    }

    consume_events(&shared, &stop, &mount_tx, &unmount_tx, &ready_tx);

    // All COM objects are dropped inside consume_events.
    unsafe { CoUninitialize() };
    debug!("WMI event thread stopped");
}

fn consume_events(
    shared: &Shared,
    stop: &AtomicBool,
    mount_tx: &mpsc::Sender<MountEvent>,
    unmount_tx: &mpsc::Sender<String>,
    ready_tx: &std::sync::mpsc::Sender<Result<(), String>>,
) {
    // May legitimately fail when the process already initialized security.
    unsafe {
        let _ = CoInitializeSecurity(
            None,
            -1,
            None,
            None,
            RPC_C_AUTHN_LEVEL_DEFAULT,
            RPC_C_IMP_LEVEL_IMPERSONATE,
            None,
            EOAC_NONE,
            None,
        );
    }

    let enumerator = unsafe {
        let locator: IWbemLocator =
            match CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER) {
                Ok(locator) => locator,
                Err(err) => {
                    let _ = ready_tx.send(Err(format!("WbemLocator: {err}")));
                    return;
                }
            };
        let services: IWbemServices = match locator.ConnectServer(
            &BSTR::from("ROOT\\CIMV2"),
            &BSTR::new(),
            &BSTR::new(),
            &BSTR::new(),
            0,
            &BSTR::new(),
            None,
        ) {
            Ok(services) => services,
            Err(err) => {
                let _ = ready_tx.send(Err(format!("ConnectServer: {err}")));
                return;
            }
        };
        if let Err(err) = CoSetProxyBlanket(
            &services,
            RPC_C_AUTHN_WINNT,
            RPC_C_AUTHZ_NONE,
            None,
            RPC_C_AUTHN_LEVEL_CALL,
            RPC_C_IMP_LEVEL_IMPERSONATE,
            None,
            EOAC_NONE,
        ) {
            let _ = ready_tx.send(Err(format!("CoSetProxyBlanket: {err}")));
            return;
        }
        match services.ExecNotificationQuery(
            &BSTR::from("WQL"),
            &BSTR::from(EVENT_QUERY),
            WBEM_FLAG_RETURN_IMMEDIATELY.0 | WBEM_FLAG_FORWARD_ONLY.0,
            None,
        ) {
            Ok(enumerator) => enumerator,
            Err(err) => {
                let _ = ready_tx.send(Err(format!("ExecNotificationQuery: {err}")));
                return;
            }
        }
    };

    let _ = ready_tx.send(Ok(()));

    while !stop.load(Ordering::Relaxed) {
        let mut objects: [Option<IWbemClassObject>; 1] = [None];
        let mut returned = 0u32;
        let hr = unsafe { enumerator.Next(1000, &mut objects, &mut returned) };
        if hr.is_err() {
            warn!(hresult = ?hr, "WMI NextEvent failed");
            break;
        }
        if returned == 0 {
            continue; // timeout, re-check the stop flag
        }
        let Some(object) = objects[0].take() else {
            continue;
        };

        let event_type = get_i32(&object, w!("EventType")).unwrap_or_default();
        let drive = get_string(&object, w!("DriveName"));
        if drive.is_empty() {
            continue;
        }

        match event_type {
            EVENT_ARRIVAL => handle_arrival(shared, stop, mount_tx, &drive),
            EVENT_REMOVAL => handle_removal(shared, stop, unmount_tx, &drive),
            _ => {}
        }
    }
}

fn handle_arrival(
    shared: &Shared,
    stop: &AtomicBool,
    mount_tx: &mpsc::Sender<MountEvent>,
    drive: &str,
) {
    let root = format!("{drive}\\");
    let root_wide = to_wide(&root);

    let drive_type = unsafe { GetDriveTypeW(PCWSTR(root_wide.as_ptr())) };
    if drive_type != DRIVE_REMOVABLE {
        debug!(drive = %drive, drive_type, "ignoring non-removable drive");
        return;
    }

    let mut label_buf = [0u16; 256];
    let mut serial = 0u32;
    let volume_label = unsafe {
        match GetVolumeInformationW(
            PCWSTR(root_wide.as_ptr()),
            Some(&mut label_buf),
            Some(&mut serial),
            None,
            None,
            None,
        ) {
            Ok(()) => wide_to_string(&label_buf),
            Err(err) => {
                debug!(drive = %drive, error = %err, "GetVolumeInformation failed");
                String::new()
            }
        }
    };

    let device_id = if serial != 0 {
        format!("{serial:08X}")
    } else {
        drive.to_string()
    };
    if shared.mounted.contains_key(&device_id) {
        return;
    }
    shared.mounted.insert(device_id.clone(), ());
    shared.by_letter.insert(drive.to_string(), device_id.clone());

    send_blocking(
        mount_tx,
        stop,
        MountEvent {
            device_id,
            device_node: String::new(),
            mount_path: root.into(),
            volume_label,
            device_type: DeviceType::Removable,
        },
    );
}

fn handle_removal(
    shared: &Shared,
    stop: &AtomicBool,
    unmount_tx: &mpsc::Sender<String>,
    drive: &str,
) {
    let Some((_, device_id)) = shared.by_letter.remove(drive) else {
        return;
    };
    shared.mounted.remove(&device_id);
    send_blocking(unmount_tx, stop, device_id);
}

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

fn get_string(object: &IWbemClassObject, name: PCWSTR) -> String {
    let mut value = VARIANT::default();
    if unsafe { object.Get(name, 0, &mut value, None, None) }.is_err() {
        return String::new();
    }
    BSTR::try_from(&value)
        .map(|b| b.to_string())
        .unwrap_or_default()
}

fn get_i32(object: &IWbemClassObject, name: PCWSTR) -> Option<i32> {
    let mut value = VARIANT::default();
    unsafe { object.Get(name, 0, &mut value, None, None) }.ok()?;
    i32::try_from(&value).ok()
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn wide_to_string(buf: &[u16]) -> String {
    let end = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..end])
}
