//! A scriptable in-memory driver.
//!
//! `SimulatedDriver` plays the radio for tests and demos: peripherals are
//! registered up front, scans replay their advertisements, and the test
//! side pushes notifications, drops links and injects transient failures.
//! Connecting to an address nobody registered never completes, so the
//! caller's deadline is what ends the attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use gattkit_protocol::{
    Catalog, CharacteristicInfo, DescriptorInfo, DescriptorRef, DeviceDriver, DeviceRecord,
    DisconnectCallback, DiscoveryStream, DriverError, DriverResult, LinkHandle, Notification,
    NotificationStream, ScanFilter, ScanId, ServiceInfo, uuid_from_short,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

/// A fake device and everything it will answer.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub address: String,
    pub name: Option<String>,
    pub rssi: i16,
    pub advertised_services: Vec<Uuid>,
    pub catalog: Catalog,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub descriptors: HashMap<DescriptorRef, Vec<u8>>,
    pub mtu: u16,
    /// Refuse every connection attempt with `Unreachable`.
    pub refuse: bool,
    /// Characteristics that notify on their own at a fixed period once subscribed.
    pub tickers: HashMap<Uuid, Duration>,
    writes: Vec<(Uuid, Vec<u8>)>,
    next_handle: u16,
}

impl SimPeripheral {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            rssi: -60,
            advertised_services: Vec::new(),
            catalog: Catalog::default(),
            values: HashMap::new(),
            descriptors: HashMap::new(),
            mtu: 23,
            refuse: false,
            tickers: HashMap::new(),
            writes: Vec::new(),
            next_handle: 1,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn advertising(mut self, service: Uuid) -> Self {
        self.advertised_services.push(service);
        self
    }

    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn characteristic(
        mut self,
        service: Uuid,
        characteristic: Uuid,
        properties: &[&str],
        value: &[u8],
    ) -> Self {
        let handle = self.next_handle;
        self.next_handle += 2;
        let info = CharacteristicInfo {
            uuid: characteristic,
            handle: Some(handle),
            properties: properties.iter().map(|p| (*p).to_owned()).collect(),
            descriptors: Vec::new(),
        };
        match self.catalog.services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => existing.characteristics.push(info),
            None => self.catalog.services.push(ServiceInfo {
                uuid: service,
                characteristics: vec![info],
            }),
        }
        self.values.insert(characteristic, value.to_vec());
        self
    }

    pub fn descriptor(mut self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Self {
        let handle = self.next_handle;
        self.next_handle += 1;
        if let Some(info) = self
            .catalog
            .services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.uuid == characteristic)
        {
            info.descriptors.push(DescriptorInfo {
                uuid: descriptor,
                handle: Some(handle),
            });
        }
        self.descriptors.insert(
            DescriptorRef {
                characteristic,
                descriptor,
            },
            value.to_vec(),
        );
        self
    }

    pub fn ticking(mut self, characteristic: Uuid, period: Duration) -> Self {
        self.tickers.insert(characteristic, period);
        self
    }

    pub fn advertisement(&self) -> DeviceRecord {
        let mut record = DeviceRecord::new(self.address.clone()).with_rssi(self.rssi);
        record.name = self.name.clone();
        for service in &self.advertised_services {
            record = record.with_service(*service);
        }
        record
    }

    fn require_characteristic(&self, characteristic: &Uuid) -> DriverResult<()> {
        match self.catalog.characteristic(characteristic) {
            Some(_) => Ok(()),
            None => Err(DriverError::UnknownCapability(characteristic.to_string())),
        }
    }
}

/// Where a scripted link drop lands inside a driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDropPoint {
    /// The link comes up and is lost before `connect` returns.
    AfterConnect,
    /// The link is lost after the subscriber is registered, before `subscribe` returns.
    DuringSubscribe,
}

struct SimLink {
    address: String,
    on_disconnect: DisconnectCallback,
    subscribers: HashMap<Uuid, Vec<mpsc::UnboundedSender<Notification>>>,
}

#[derive(Default)]
struct SimState {
    peripherals: HashMap<String, SimPeripheral>,
    scans: HashMap<ScanId, mpsc::UnboundedSender<DeviceRecord>>,
    links: HashMap<u64, SimLink>,
    scripted_drops: HashMap<String, LinkDropPoint>,
    stop_scan_calls: usize,
    unsubscribe_calls: usize,
}

impl SimState {
    fn linked_peripheral(&mut self, link: &LinkHandle) -> DriverResult<&mut SimPeripheral> {
        let address = self
            .links
            .get(&link.id)
            .map(|l| key(&l.address))
            .ok_or(DriverError::Disconnected)?;
        self.peripherals
            .get_mut(&address)
            .ok_or(DriverError::Disconnected)
    }
}

#[derive(Default)]
struct SimInner {
    state: Mutex<SimState>,
    next_link: AtomicU64,
    transient_failures: AtomicU32,
}

impl SimInner {
    fn deliver(&self, link_id: u64, characteristic: Uuid, payload: &[u8]) -> usize {
        let state = self.state.lock();
        state
            .links
            .get(&link_id)
            .and_then(|link| link.subscribers.get(&characteristic))
            .map(|senders| {
                senders
                    .iter()
                    .filter(|tx| tx.send(Notification::now(payload.to_vec())).is_ok())
                    .count()
            })
            .unwrap_or(0)
    }
}

#[derive(Clone, Default)]
pub struct SimulatedDriver {
    inner: Arc<SimInner>,
}

fn key(address: &str) -> String {
    address.to_ascii_lowercase()
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A thermometer that ticks once a second and a writable dimmer.
    pub fn with_demo_peripherals() -> Self {
        let driver = Self::new();
        let generic_access = uuid_from_short(0x1800);
        let thermometer = uuid_from_short(0x1809);
        let battery = uuid_from_short(0x180f);
        let temperature = uuid_from_short(0x2a1c);
        let battery_level = uuid_from_short(0x2a19);
        let cccd = uuid_from_short(0x2902);
        driver.add_peripheral(
            SimPeripheral::new("C0:FF:EE:00:00:01")
                .named("gattkit Thermometer")
                .rssi(-48)
                .mtu(185)
                .advertising(thermometer)
                .characteristic(generic_access, uuid_from_short(0x2a00), &["read"], b"gattkit Thermometer")
                .characteristic(thermometer, temperature, &["indicate", "notify"], &[0, 0, 0, 0])
                .descriptor(temperature, cccd, &[0, 0])
                .characteristic(battery, battery_level, &["read", "notify"], &[87])
                .ticking(temperature, Duration::from_secs(1)),
        );
        let dimmer = uuid_from_short(0xfff0);
        driver.add_peripheral(
            SimPeripheral::new("C0:FF:EE:00:00:02")
                .named("gattkit Dimmer")
                .rssi(-71)
                .advertising(dimmer)
                .characteristic(dimmer, uuid_from_short(0xfff1), &["read", "write", "write-without-response"], &[0]),
        );
        driver
    }

    pub fn add_peripheral(&self, peripheral: SimPeripheral) {
        self.inner
            .state
            .lock()
            .peripherals
            .insert(key(&peripheral.address), peripheral);
    }

    /// Deliver an advertisement to every running scan.
    pub fn advertise(&self, record: DeviceRecord) {
        let mut state = self.inner.state.lock();
        state.scans.retain(|_, tx| tx.send(record.clone()).is_ok());
    }

    /// Push a notification to every subscriber of `characteristic` on links to `address`.
    pub fn notify(&self, address: &str, characteristic: Uuid, payload: &[u8]) -> usize {
        let link_ids: Vec<u64> = {
            let state = self.inner.state.lock();
            state
                .links
                .iter()
                .filter(|(_, link)| link.address.eq_ignore_ascii_case(address))
                .map(|(id, _)| *id)
                .collect()
        };
        link_ids
            .into_iter()
            .map(|id| self.inner.deliver(id, characteristic, payload))
            .sum()
    }

    /// Drop every link to `address` as if the device vanished, firing disconnect callbacks.
    pub fn drop_link(&self, address: &str) -> usize {
        let callbacks: Vec<DisconnectCallback> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<u64> = state
                .links
                .iter()
                .filter(|(_, link)| link.address.eq_ignore_ascii_case(address))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.links.remove(&id))
                .map(|link| link.on_disconnect)
                .collect()
        };
        let now = Utc::now();
        for callback in &callbacks {
            callback(now);
        }
        callbacks.len()
    }

    /// Drop the link to `address` once, at `point` of the next matching call.
    pub fn drop_link_at(&self, address: &str, point: LinkDropPoint) {
        self.inner
            .state
            .lock()
            .scripted_drops
            .insert(key(address), point);
    }

    fn scripted_drop(&self, address: &str, point: LinkDropPoint) {
        let due = {
            let mut state = self.inner.state.lock();
            let address = key(address);
            let due = state.scripted_drops.get(&address) == Some(&point);
            if due {
                state.scripted_drops.remove(&address);
            }
            due
        };
        if due {
            debug!(address, ?point, "scripted link drop");
            self.drop_link(address);
        }
    }

    /// Fail the next `count` fallible operations with a transient error.
    pub fn inject_transient_failures(&self, count: u32) {
        self.inner.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn written(&self, address: &str, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.inner
            .state
            .lock()
            .peripherals
            .get(&key(address))
            .map(|p| {
                p.writes
                    .iter()
                    .filter(|(uuid, _)| *uuid == characteristic)
                    .map(|(_, value)| value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn descriptor_value(&self, address: &str, descriptor: DescriptorRef) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .peripherals
            .get(&key(address))
            .and_then(|p| p.descriptors.get(&descriptor).cloned())
    }

    pub fn stop_scan_calls(&self) -> usize {
        self.inner.state.lock().stop_scan_calls
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.inner.state.lock().unsubscribe_calls
    }

    pub fn running_scans(&self) -> usize {
        self.inner.state.lock().scans.len()
    }

    pub fn live_links(&self) -> usize {
        self.inner.state.lock().links.len()
    }

    pub fn subscriber_count(&self, address: &str, characteristic: Uuid) -> usize {
        self.inner
            .state
            .lock()
            .links
            .values()
            .filter(|link| link.address.eq_ignore_ascii_case(address))
            .filter_map(|link| link.subscribers.get(&characteristic))
            .map(Vec::len)
            .sum()
    }

    fn take_transient(&self) -> DriverResult<()> {
        let injected = self
            .inner
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DriverError::Transient("injected failure".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    async fn start_scan(
        &self,
        scan_id: &ScanId,
        _filter: &ScanFilter,
    ) -> DriverResult<DiscoveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();
        let mut known: Vec<DeviceRecord> = state
            .peripherals
            .values()
            .map(SimPeripheral::advertisement)
            .collect();
        known.sort_by(|a, b| a.address.cmp(&b.address));
        for record in known {
            // rx is still held here
            let _ = tx.send(record);
        }
        state.scans.insert(scan_id.clone(), tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn stop_scan(&self, scan_id: &ScanId) -> DriverResult<()> {
        let mut state = self.inner.state.lock();
        state.scans.remove(scan_id);
        state.stop_scan_calls += 1;
        Ok(())
    }

    async fn connect(
        &self,
        address: &str,
        on_disconnect: DisconnectCallback,
    ) -> DriverResult<LinkHandle> {
        self.take_transient()?;
        let known = {
            let state = self.inner.state.lock();
            state
                .peripherals
                .get(&key(address))
                .map(|p| (p.refuse, p.address.clone()))
        };
        let Some((refuse, address)) = known else {
            debug!(address, "no such peripheral, connect will not complete");
            return std::future::pending().await;
        };
        if refuse {
            return Err(DriverError::Unreachable(format!(
                "{address} refused the connection"
            )));
        }
        let id = self.inner.next_link.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.state.lock().links.insert(
            id,
            SimLink {
                address: address.clone(),
                on_disconnect,
                subscribers: HashMap::new(),
            },
        );
        self.scripted_drop(&address, LinkDropPoint::AfterConnect);
        Ok(LinkHandle { id, address })
    }

    async fn disconnect(&self, link: &LinkHandle) -> DriverResult<()> {
        self.inner.state.lock().links.remove(&link.id);
        Ok(())
    }

    fn is_connected(&self, link: &LinkHandle) -> bool {
        self.inner.state.lock().links.contains_key(&link.id)
    }

    async fn discover(&self, link: &LinkHandle) -> DriverResult<Catalog> {
        self.take_transient()?;
        let mut state = self.inner.state.lock();
        Ok(state.linked_peripheral(link)?.catalog.clone())
    }

    async fn mtu(&self, link: &LinkHandle) -> DriverResult<u16> {
        let mut state = self.inner.state.lock();
        Ok(state.linked_peripheral(link)?.mtu)
    }

    async fn read(&self, link: &LinkHandle, characteristic: Uuid) -> DriverResult<Vec<u8>> {
        self.take_transient()?;
        let mut state = self.inner.state.lock();
        let peripheral = state.linked_peripheral(link)?;
        peripheral.require_characteristic(&characteristic)?;
        Ok(peripheral
            .values
            .get(&characteristic)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
        value: &[u8],
        _with_response: bool,
    ) -> DriverResult<()> {
        self.take_transient()?;
        let mut state = self.inner.state.lock();
        let peripheral = state.linked_peripheral(link)?;
        peripheral.require_characteristic(&characteristic)?;
        peripheral.values.insert(characteristic, value.to_vec());
        peripheral.writes.push((characteristic, value.to_vec()));
        Ok(())
    }

    async fn read_descriptor(
        &self,
        link: &LinkHandle,
        descriptor: DescriptorRef,
    ) -> DriverResult<Vec<u8>> {
        let mut state = self.inner.state.lock();
        state
            .linked_peripheral(link)?
            .descriptors
            .get(&descriptor)
            .cloned()
            .ok_or_else(|| DriverError::UnknownCapability(descriptor.descriptor.to_string()))
    }

    async fn write_descriptor(
        &self,
        link: &LinkHandle,
        descriptor: DescriptorRef,
        value: &[u8],
    ) -> DriverResult<()> {
        let mut state = self.inner.state.lock();
        let slot = state
            .linked_peripheral(link)?
            .descriptors
            .get_mut(&descriptor)
            .ok_or_else(|| DriverError::UnknownCapability(descriptor.descriptor.to_string()))?;
        *slot = value.to_vec();
        Ok(())
    }

    async fn subscribe(
        &self,
        link: &LinkHandle,
        characteristic: Uuid,
    ) -> DriverResult<NotificationStream> {
        self.take_transient()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let ticker = {
            let mut state = self.inner.state.lock();
            let peripheral = state.linked_peripheral(link)?;
            peripheral.require_characteristic(&characteristic)?;
            let period = peripheral.tickers.get(&characteristic).copied();
            state
                .links
                .get_mut(&link.id)
                .ok_or(DriverError::Disconnected)?
                .subscribers
                .entry(characteristic)
                .or_default()
                .push(tx);
            period
        };
        if let Some(period) = ticker {
            tokio::spawn(run_ticker(
                Arc::downgrade(&self.inner),
                link.id,
                characteristic,
                period,
            ));
        }
        self.scripted_drop(&link.address, LinkDropPoint::DuringSubscribe);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn unsubscribe(&self, link: &LinkHandle, characteristic: Uuid) -> DriverResult<()> {
        let mut state = self.inner.state.lock();
        state.unsubscribe_calls += 1;
        let link = state
            .links
            .get_mut(&link.id)
            .ok_or(DriverError::Disconnected)?;
        link.subscribers.remove(&characteristic);
        Ok(())
    }
}

async fn run_ticker(inner: Weak<SimInner>, link_id: u64, characteristic: Uuid, period: Duration) {
    let mut counter: u32 = 0;
    loop {
        tokio::time::sleep(period).await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        counter = counter.wrapping_add(1);
        if inner.deliver(link_id, characteristic, &counter.to_le_bytes()) == 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const ADDRESS: &str = "AA:BB:CC:DD:EE:01";

    fn battery_level() -> Uuid {
        uuid_from_short(0x2a19)
    }

    fn driver() -> SimulatedDriver {
        let driver = SimulatedDriver::new();
        driver.add_peripheral(
            SimPeripheral::new(ADDRESS)
                .named("Tag")
                .characteristic(uuid_from_short(0x180f), battery_level(), &["read", "notify"], &[90])
                .descriptor(battery_level(), uuid_from_short(0x2902), &[0, 0]),
        );
        driver
    }

    fn noop_callback() -> DisconnectCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn scan_replays_known_peripherals() {
        let driver = driver();
        let mut stream = driver
            .start_scan(&ScanId::from("s"), &ScanFilter::default())
            .await
            .unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.address, ADDRESS);
        assert_eq!(first.name.as_deref(), Some("Tag"));

        driver.advertise(DeviceRecord::new("FF").with_rssi(-30));
        assert_eq!(stream.next().await.unwrap().address, "FF");

        driver.stop_scan(&ScanId::from("s")).await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(driver.stop_scan_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_address_never_connects() {
        let driver = driver();
        let attempt = driver.connect("00:00:00:00:00:00", noop_callback());
        let outcome = tokio::time::timeout(Duration::from_secs(3), attempt).await;
        assert!(outcome.is_err());
    }

    #[tokio::test]
    async fn refusing_peripheral_is_unreachable() {
        let driver = SimulatedDriver::new();
        driver.add_peripheral(SimPeripheral::new("AA").refusing());
        let err = driver.connect("aa", noop_callback()).await.unwrap_err();
        assert!(matches!(err, DriverError::Unreachable(_)));
    }

    #[tokio::test]
    async fn read_write_and_descriptors() {
        let driver = driver();
        let link = driver.connect(ADDRESS, noop_callback()).await.unwrap();
        assert_eq!(driver.read(&link, battery_level()).await.unwrap(), vec![90]);
        driver.write(&link, battery_level(), &[42], true).await.unwrap();
        assert_eq!(driver.read(&link, battery_level()).await.unwrap(), vec![42]);
        assert_eq!(driver.written(ADDRESS, battery_level()), vec![vec![42]]);

        let cccd = DescriptorRef {
            characteristic: battery_level(),
            descriptor: uuid_from_short(0x2902),
        };
        driver.write_descriptor(&link, cccd, &[1, 0]).await.unwrap();
        assert_eq!(driver.read_descriptor(&link, cccd).await.unwrap(), vec![1, 0]);

        let missing = driver.read(&link, uuid_from_short(0x2a00)).await.unwrap_err();
        assert!(matches!(missing, DriverError::UnknownCapability(_)));
    }

    #[tokio::test]
    async fn notifications_reach_subscribers() {
        let driver = driver();
        let link = driver.connect(ADDRESS, noop_callback()).await.unwrap();
        let mut stream = driver.subscribe(&link, battery_level()).await.unwrap();
        assert_eq!(driver.notify(ADDRESS, battery_level(), &[1]), 1);
        assert_eq!(stream.next().await.unwrap().payload, vec![1]);

        driver.unsubscribe(&link, battery_level()).await.unwrap();
        assert_eq!(driver.notify(ADDRESS, battery_level(), &[2]), 0);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn drop_link_fires_callback_once() {
        let driver = driver();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback: DisconnectCallback = {
            let fired = fired.clone();
            Arc::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let link = driver.connect(ADDRESS, callback).await.unwrap();
        assert!(driver.is_connected(&link));
        assert_eq!(driver.drop_link(ADDRESS), 1);
        assert_eq!(driver.drop_link(ADDRESS), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!driver.is_connected(&link));
        assert_eq!(
            driver.read(&link, battery_level()).await.unwrap_err(),
            DriverError::Disconnected
        );
    }

    #[tokio::test]
    async fn scripted_drops_fire_once_at_their_point() {
        let driver = driver();
        let fired = Arc::new(AtomicUsize::new(0));
        let callback: DisconnectCallback = {
            let fired = fired.clone();
            Arc::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        driver.drop_link_at(ADDRESS, LinkDropPoint::AfterConnect);
        let link = driver.connect(ADDRESS, callback.clone()).await.unwrap();
        assert!(!driver.is_connected(&link));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        driver.drop_link_at(ADDRESS, LinkDropPoint::DuringSubscribe);
        let link = driver.connect(ADDRESS, callback).await.unwrap();
        assert!(driver.is_connected(&link));
        let mut stream = driver.subscribe(&link, battery_level()).await.unwrap();
        assert!(!driver.is_connected(&link));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(stream.next().await.is_none());

        assert_eq!(
            driver.unsubscribe(&link, battery_level()).await.unwrap_err(),
            DriverError::Disconnected
        );
        assert_eq!(driver.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_counted() {
        let driver = driver();
        let link = driver.connect(ADDRESS, noop_callback()).await.unwrap();
        driver.inject_transient_failures(1);
        assert!(driver.read(&link, battery_level()).await.unwrap_err().is_transient());
        assert!(driver.read(&link, battery_level()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn ticking_characteristic_notifies_periodically() {
        let temperature = uuid_from_short(0x2a1c);
        let driver = SimulatedDriver::new();
        driver.add_peripheral(
            SimPeripheral::new(ADDRESS)
                .characteristic(uuid_from_short(0x1809), temperature, &["notify"], &[])
                .ticking(temperature, Duration::from_millis(100)),
        );
        let link = driver.connect(ADDRESS, noop_callback()).await.unwrap();
        let mut stream = driver.subscribe(&link, temperature).await.unwrap();
        assert_eq!(stream.next().await.unwrap().payload, 1u32.to_le_bytes().to_vec());
        assert_eq!(stream.next().await.unwrap().payload, 2u32.to_le_bytes().to_vec());
    }
}
