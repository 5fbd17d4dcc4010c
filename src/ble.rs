//! Bluetooth LE transport adapter.
//!
//! Wraps a btleplug peripheral into the blocking [`Transport`] the drivers
//! consume. A process-wide tokio runtime bridges the async BLE stack; a
//! background task forwards GATT notifications into a channel so no packet
//! is lost between reads.

use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::OnceLock;
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::time;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{LineConfig, Purge, Timeout, Transport};

/// GATT characteristics used by the dive computers we know; the caller may
/// override them per device.
pub const KNOWN_WRITE_UUID: Uuid = Uuid::from_u128(0x99a91ebd_b21f_1689_bb43_681f1f55e966);
pub const KNOWN_READ_UUID: Uuid = Uuid::from_u128(0x1d1aae28_d2a8_91a1_1242_9d2973fbe571);

/// BLE name prefixes that identify supported dive computers.
const NAME_PREFIXES: &[&str] = &[
    "Mares", "Sirius", "Quad", "Puck", "Petrel", "Perdix", "Teric", "EON", "Suunto", "Cobalt",
];

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn runtime() -> Result<&'static Runtime> {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("failed to build BLE runtime")
    });
    RUNTIME.get().ok_or(Error::NoDevice)
}

fn ble_error(e: btleplug::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Discovered BLE device info.
#[derive(Debug)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    pub peripheral: Peripheral,
}

fn is_supported_device(name: &str) -> bool {
    NAME_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Get the default BLE adapter.
pub fn default_adapter() -> Result<Adapter> {
    runtime()?.block_on(async {
        let manager = Manager::new().await.map_err(ble_error)?;
        let adapters = manager.adapters().await.map_err(ble_error)?;
        adapters.into_iter().next().ok_or(Error::NoDevice)
    })
}

/// Scan for supported dive computers.
pub fn scan(adapter: &Adapter, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
    runtime()?.block_on(async {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(ble_error)?;
        let mut events = adapter.events().await.map_err(ble_error)?;

        let deadline = time::Instant::now() + timeout;
        let mut found = HashSet::new();
        loop {
            let remaining = deadline.saturating_duration_since(time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match time::timeout(remaining, events.next()).await {
                Ok(Some(CentralEvent::DeviceDiscovered(id))) => {
                    found.insert(id);
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => break,
            }
        }
        adapter.stop_scan().await.ok();

        let mut devices = Vec::new();
        for p in adapter.peripherals().await.map_err(ble_error)? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(ref name) = props.local_name {
                    if is_supported_device(name) {
                        devices.push(DiscoveredDevice {
                            name: name.clone(),
                            address: props.address.to_string(),
                            rssi: props.rssi,
                            peripheral: p,
                        });
                    }
                }
            }
        }
        Ok(devices)
    })
}

/// GATT service with its characteristics.
#[derive(Debug)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// GATT characteristic info.
#[derive(Debug)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: String,
}

/// Enumerate all GATT services and characteristics on a device, connecting
/// if needed and disconnecting afterwards.
pub fn enumerate_gatt(peripheral: &Peripheral) -> Result<Vec<GattService>> {
    runtime()?.block_on(async {
        let was_connected = peripheral.is_connected().await.map_err(ble_error)?;
        if !was_connected {
            peripheral.connect().await.map_err(ble_error)?;
        }
        peripheral.discover_services().await.map_err(ble_error)?;

        let mut services = Vec::new();
        for svc in &peripheral.services() {
            let characteristics = svc
                .characteristics
                .iter()
                .map(|c| GattCharacteristic {
                    uuid: c.uuid,
                    properties: format!("{:?}", c.properties),
                })
                .collect();
            services.push(GattService {
                uuid: svc.uuid,
                characteristics,
            });
        }

        if !was_connected {
            peripheral.disconnect().await.ok();
        }
        Ok(services)
    })
}

/// An open BLE link speaking the blocking [`Transport`] contract.
pub struct BleTransport {
    peripheral: Peripheral,
    write_char: Characteristic,
    rx: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    timeout_ms: u64,
    // Keeps the notification forwarder alive for the life of the link.
    _listener: tokio::task::JoinHandle<()>,
}

impl BleTransport {
    /// Connect and subscribe to notifications.
    pub fn connect(
        peripheral: &Peripheral,
        write_uuid: Option<Uuid>,
        read_uuid: Option<Uuid>,
    ) -> Result<Self> {
        let rt = runtime()?;
        rt.block_on(async {
            if !peripheral.is_connected().await.map_err(ble_error)? {
                peripheral.connect().await.map_err(ble_error)?;
            }
            peripheral.discover_services().await.map_err(ble_error)?;

            let write_target = write_uuid.unwrap_or(KNOWN_WRITE_UUID);
            let read_target = read_uuid.unwrap_or(KNOWN_READ_UUID);

            let chars = peripheral.characteristics();
            let write_char = chars
                .iter()
                .find(|c| c.uuid == write_target)
                .cloned()
                .ok_or(Error::NoDevice)?;
            let read_char = chars
                .iter()
                .find(|c| c.uuid == read_target)
                .cloned()
                .ok_or(Error::NoDevice)?;

            peripheral.subscribe(&read_char).await.map_err(ble_error)?;

            // Forward notifications into a channel so nothing is dropped
            // between transport reads.
            let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
            let mut stream = peripheral.notifications().await.map_err(ble_error)?;
            let read_uuid_filter = read_char.uuid;
            let listener = tokio::spawn(async move {
                while let Some(notification) = stream.next().await {
                    if notification.uuid == read_uuid_filter
                        && tx.send(notification.value).await.is_err()
                    {
                        break;
                    }
                }
            });

            Ok(BleTransport {
                peripheral: peripheral.clone(),
                write_char,
                rx,
                pending: VecDeque::new(),
                timeout_ms: 5000,
                _listener: listener,
            })
        })
    }

    pub fn disconnect(&self) -> Result<()> {
        runtime()?.block_on(async {
            self.peripheral.disconnect().await.map_err(ble_error)
        })
    }
}

impl Transport for BleTransport {
    fn configure(&mut self, _config: &LineConfig) -> Result<()> {
        // No line parameters on a GATT link.
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Timeout) -> Result<()> {
        self.timeout_ms = match timeout {
            Timeout::Blocking => u64::MAX,
            Timeout::NonBlocking => 0,
            Timeout::Millis(ms) => u64::from(ms),
        };
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            let rt = runtime()?;
            let timeout = Duration::from_millis(self.timeout_ms);
            let packet = rt.block_on(async {
                match time::timeout(timeout, self.rx.recv()).await {
                    Ok(Some(data)) => Ok(data),
                    Ok(None) => Err(Error::NoDevice),
                    Err(_) => Err(Error::Timeout),
                }
            })?;
            self.pending.extend(packet);
        }
        let take = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(take) {
            *slot = self.pending.pop_front().unwrap();
        }
        Ok(take)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let rt = runtime()?;
        rt.block_on(async {
            // 20-byte chunks fit the lowest common ATT MTU.
            for chunk in buf.chunks(20) {
                self.peripheral
                    .write(&self.write_char, chunk, WriteType::WithoutResponse)
                    .await
                    .map_err(ble_error)?;
            }
            Ok(buf.len())
        })
    }

    fn purge(&mut self, direction: Purge) -> Result<()> {
        if matches!(direction, Purge::Input | Purge::Both) {
            self.pending.clear();
            while self.rx.try_recv().is_ok() {}
        }
        Ok(())
    }

    fn sleep(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
