//! Real radio access through btleplug.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter as BtleScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use chrono::Utc;
use futures_util::StreamExt;
use gattkit_protocol::{
    Catalog, CharacteristicInfo, DescriptorInfo, DescriptorRef, DeviceDriver, DeviceRecord,
    DisconnectCallback, DiscoveryStream, DriverError, DriverResult, HexBytes, LinkHandle,
    Notification, NotificationStream, RSSI_UNKNOWN, ScanFilter, ScanId, ServiceInfo,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::guard::CloseOnDrop;

struct LiveLink {
    peripheral: Peripheral,
    on_disconnect: DisconnectCallback,
}

#[derive(Default)]
struct BtleState {
    links: HashMap<u64, LiveLink>,
    scans: HashMap<ScanId, Arc<Notify>>,
}

/// Driver backed by the first adapter btleplug reports.
pub struct BtleplugDriver {
    adapter: Adapter,
    state: Arc<Mutex<BtleState>>,
    next_link: AtomicU64,
}

impl BtleplugDriver {
    pub async fn open() -> Result<Self> {
        let manager = Manager::new().await.context("failed to create BLE manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("failed to list BLE adapters")?
            .into_iter()
            .next()
            .context("no BLE adapter available")?;
        let state = Arc::new(Mutex::new(BtleState::default()));
        let events = adapter
            .events()
            .await
            .context("failed to subscribe to adapter events")?;
        tokio::spawn(watch_disconnects(events, state.clone()));
        info!("btleplug adapter ready");
        Ok(Self {
            adapter,
            state,
            next_link: AtomicU64::new(0),
        })
    }

    fn linked(&self, link: &LinkHandle) -> DriverResult<Peripheral> {
        self.state
            .lock()
            .links
            .get(&link.id)
            .map(|l| l.peripheral.clone())
            .ok_or(DriverError::Disconnected)
    }

    async fn find_peripheral(&self, address: &str) -> DriverResult<Peripheral> {
        let peripherals = self.adapter.peripherals().await.map_err(map_btleplug)?;
        for peripheral in peripherals {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(peripheral);
            }
        }
        Err(DriverError::Unreachable(format!(
            "{address} has not been seen by a scan"
        )))
    }
}

/// Spawn a disconnect for a link nobody will register.
fn close_abandoned(peripheral: Peripheral) {
    let address = peripheral.address().to_string();
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            debug!(address = %address, "closing abandoned connect attempt");
            runtime.spawn(async move {
                if let Err(err) = peripheral.disconnect().await {
                    debug!(address = %address, error = %err, "abandoned link disconnect failed");
                }
            });
        }
        Err(_) => warn!(address = %address, "no runtime left to close abandoned link"),
    }
}

async fn watch_disconnects(
    mut events: std::pin::Pin<Box<dyn futures_util::Stream<Item = CentralEvent> + Send>>,
    state: Arc<Mutex<BtleState>>,
) {
    while let Some(event) = events.next().await {
        let CentralEvent::DeviceDisconnected(id) = event else {
            continue;
        };
        let callbacks: Vec<DisconnectCallback> = {
            let mut state = state.lock();
            let ids: Vec<u64> = state
                .links
                .iter()
                .filter(|(_, link)| link.peripheral.id() == id)
                .map(|(link_id, _)| *link_id)
                .collect();
            ids.into_iter()
                .filter_map(|link_id| state.links.remove(&link_id))
                .map(|link| link.on_disconnect)
                .collect()
        };
        let now = Utc::now();
        for callback in &callbacks {
            callback(now);
        }
    }
    warn!("adapter event stream ended; link losses will no longer be reported");
}

fn advertised_id(event: &CentralEvent) -> Option<&PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
        CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

async fn device_record(adapter: &Adapter, id: &PeripheralId) -> Option<DeviceRecord> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(DeviceRecord {
        address: properties.address.to_string(),
        name: properties.local_name,
        rssi: properties.rssi.unwrap_or(RSSI_UNKNOWN),
        tx_power: properties.tx_power_level,
        service_uuids: properties.services,
        manufacturer_data: properties
            .manufacturer_data
            .into_iter()
            .map(|(company, data)| (company, HexBytes(data)))
            .collect(),
        service_data: properties
            .service_data
            .into_iter()
            .map(|(uuid, data)| (uuid, HexBytes(data)))
            .collect(),
    })
}

fn property_names(flags: CharPropFlags) -> Vec<String> {
    [
        (CharPropFlags::BROADCAST, "broadcast"),
        (CharPropFlags::READ, "read"),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, "write-without-response"),
        (CharPropFlags::WRITE, "write"),
        (CharPropFlags::NOTIFY, "notify"),
        (CharPropFlags::INDICATE, "indicate"),
        (CharPropFlags::AUTHENTICATED_SIGNED_WRITES, "authenticated-signed-writes"),
        (CharPropFlags::EXTENDED_PROPERTIES, "extended-properties"),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, name)| name.to_owned())
    .collect()
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> DriverResult<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| DriverError::UnknownCapability(uuid.to_string()))
}

fn map_btleplug(err: btleplug::Error) -> DriverError {
    match err {
        btleplug::Error::NotConnected => DriverError::Disconnected,
        btleplug::Error::DeviceNotFound => DriverError::Unreachable(err.to_string()),
        btleplug::Error::TimedOut(_) => DriverError::Timeout,
        btleplug::Error::NoSuchCharacteristic => DriverError::UnknownCapability(err.to_string()),
        btleplug::Error::NotSupported(what) => DriverError::Unsupported(what),
        btleplug::Error::PermissionDenied | btleplug::Error::RuntimeError(_) => {
            DriverError::Fault(err.to_string())
        }
        other => DriverError::Transient(other.to_string()),
    }
}

#[async_trait]
impl DeviceDriver for BtleplugDriver {
    async fn start_scan(
        &self,
        scan_id: &ScanId,
        filter: &ScanFilter,
    ) -> DriverResult<DiscoveryStream> {
        let mut events = self.adapter.events().await.map_err(map_btleplug)?;
        self.adapter
            .start_scan(BtleScanFilter {
                services: filter.service_uuid.into_iter().collect(),
            })
            .await
            .map_err(map_btleplug)?;
        let stop = Arc::new(Notify::new());
        self.state.lock().scans.insert(scan_id.clone(), stop.clone());

        let adapter = self.adapter.clone();
        let stream = async_stream::stream! {
            loop {
                let next = tokio::select! {
                    _ = stop.notified() => None,
                    event = events.next() => event,
                };
                let Some(event) = next else {
                    break;
                };
                let Some(id) = advertised_id(&event) else {
                    continue;
                };
                if let Some(record) = device_record(&adapter, id).await {
                    yield record;
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn stop_scan(&self, scan_id: &ScanId) -> DriverResult<()> {
        let remaining = {
            let mut state = self.state.lock();
            if let Some(stop) = state.scans.remove(scan_id) {
                stop.notify_one();
            }
            state.scans.len()
        };
        if remaining == 0 {
            self.adapter.stop_scan().await.map_err(map_btleplug)?;
        }
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> DriverResult<LinkHandle> {
        let peripheral = self.find_peripheral(address).await?;
        // Armed before connecting: the caller may drop this future at any await.
        let guard = CloseOnDrop::new({
            let peripheral = peripheral.clone();
            move || close_abandoned(peripheral)
        });
        if let Err(err) = peripheral.connect().await {
            guard.disarm();
            return Err(map_btleplug(err));
        }
        // On failure the guard closes the link.
        peripheral
            .discover_services()
            .await
            .map_err(map_btleplug)?;
        let id = self.next_link.fetch_add(1, Ordering::SeqCst) + 1;
        let address = peripheral.address().to_string();
        guard.disarm();
        self.state.lock().links.insert(
            id,
            LiveLink {
                peripheral,
                on_disconnect,
            },
        );
        debug!(address = %address, link = id, "link established");
        Ok(LinkHandle { id, address })
    }

    async fn disconnect(&self, link: &LinkHandle) -> DriverResult<()> {
        let removed = self.state.lock().links.remove(&link.id);
        match removed {
            Some(live) => live.peripheral.disconnect().await.map_err(map_btleplug),
            None => Ok(()),
        }
    }

    fn is_connected(&self, link: &LinkHandle) -> bool {
        self.state.lock().links.contains_key(&link.id)
    }

    async fn discover(&self, link: &LinkHandle) -> DriverResult<Catalog> {
        let peripheral = self.linked(link)?;
        let services = peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        handle: None,
                        properties: property_names(c.properties),
                        descriptors: c
                            .descriptors
                            .into_iter()
                            .map(|d| DescriptorInfo {
                                uuid: d.uuid,
                                handle: None,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Ok(Catalog { services })
    }

    async fn mtu(&self, link: &LinkHandle) -> DriverResult<u16> {
        self.linked(link)?;
        Err(DriverError::Unsupported(
            "btleplug does not report the negotiated MTU".to_owned(),
        ))
    }

    async fn read(&self, link: &LinkHandle, characteristic: Uuid) -> DriverResult<Vec<u8>> {
        let peripheral = self.linked(link)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        peripheral.read(&target).await.map_err(map_btleplug)
    }

    async fn write(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> DriverResult<()> {
        let peripheral = self.linked(link)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&target, value, write_type)
            .await
            .map_err(map_btleplug)
    }

    async fn read_descriptor(
        &self,
        link: &LinkHandle,
        descriptor: DescriptorRef,
    ) -> DriverResult<Vec<u8>> {
        let peripheral = self.linked(link)?;
        let owner = find_characteristic(&peripheral, descriptor.characteristic)?;
        let target = owner
            .descriptors
            .into_iter()
            .find(|d| d.uuid == descriptor.descriptor)
            .ok_or_else(|| DriverError::UnknownCapability(descriptor.descriptor.to_string()))?;
        peripheral.read_descriptor(&target).await.map_err(map_btleplug)
    }

    async fn write_descriptor(
        &self,
        link: &LinkHandle,
        descriptor: DescriptorRef,
        value: &[u8],
    ) -> DriverResult<()> {
        let peripheral = self.linked(link)?;
        let owner = find_characteristic(&peripheral, descriptor.characteristic)?;
        let target = owner
            .descriptors
            .into_iter()
            .find(|d| d.uuid == descriptor.descriptor)
            .ok_or_else(|| DriverError::UnknownCapability(descriptor.descriptor.to_string()))?;
        peripheral
            .write_descriptor(&target, value)
            .await
            .map_err(map_btleplug)
    }

    async fn subscribe(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
    ) -> DriverResult<NotificationStream> {
        let peripheral = self.linked(link)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        let notifications = peripheral.notifications().await.map_err(map_btleplug)?;
        peripheral.subscribe(&target).await.map_err(map_btleplug)?;
        Ok(notifications
            .filter(move |n| std::future::ready(n.uuid == characteristic))
            .map(|n| Notification::now(n.value))
            .boxed())
    }

    async fn unsubscribe(&self, link: &LinkHandle, characteristic: Uuid) -> DriverResult<()> {
        let peripheral = self.linked(link)?;
        let target = find_characteristic(&peripheral, characteristic)?;
        peripheral.unsubscribe(&target).await.map_err(map_btleplug)
    }
}
