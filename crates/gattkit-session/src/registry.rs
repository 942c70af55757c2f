//! The process-wide session table.
//!
//! `SessionRegistry` is the only component that creates, looks up or removes
//! scans, connections and subscriptions. Each session lives behind its own
//! mutex inside a table guarded by a read-write lock, so calls touching
//! different ids never wait on each other and driver-pushed events serialize
//! with controller calls on the same id. No lock is held across an await.
//! Lock order is table, then session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future::join_all;
use gattkit_protocol::{
    Catalog, ConnectionId, DescriptorRef, DeviceDriver, DisconnectCallback, DiscoveryStream,
    DriverError, LinkHandle, Notification, NotificationStream, ScanFilter, ScanId, SessionError,
    SessionKind, SessionResult, SpecRef, SubscriptionId,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::buffer::{Batch, NotificationBuffer, PushOutcome};
use crate::config::RegistryConfig;
use crate::connection::{ConnectionSession, ConnectionStatus, ConnectionSummary, DisconnectCause};
use crate::retry::with_retry;
use crate::scan::{ScanSession, ScanSnapshot, ScanSummary, StopReason};
use crate::subscription::{Subscription, SubscriptionSummary};

const ALERT_CAPACITY: usize = 256;

/// Out-of-band events for a controller that wants to be told instead of polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum SessionAlert {
    LinkLost {
        connection_id: ConnectionId,
        address: String,
        ts: DateTime<Utc>,
    },
    NotificationsAvailable {
        connection_id: ConnectionId,
        subscription_id: SubscriptionId,
        characteristic_uuid: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub timeout: Duration,
    pub filter: ScanFilter,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub address: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub connection_id: ConnectionId,
    pub address: String,
    pub device_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    pub spec: Option<SpecRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionOutcome {
    pub subscription_id: SubscriptionId,
    pub connection_id: ConnectionId,
    pub characteristic_uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MtuInfo {
    pub mtu: u16,
    pub max_write_payload: u16,
}

/// One entry taken by `wait_notification`, with the cumulative drop count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Waited {
    pub notification: Option<Notification>,
    pub dropped: u64,
}

type Shared<T> = Arc<Mutex<T>>;

struct RegistryShared {
    driver: Arc<dyn DeviceDriver>,
    config: RegistryConfig,
    scans: RwLock<HashMap<ScanId, Shared<ScanSession>>>,
    connections: RwLock<HashMap<ConnectionId, Shared<ConnectionSession>>>,
    subscription_owners: RwLock<HashMap<SubscriptionId, ConnectionId>>,
    pending_connects: AtomicUsize,
    alerts: broadcast::Sender<SessionAlert>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: RegistryConfig) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CAPACITY);
        Self {
            shared: Arc::new(RegistryShared {
                driver,
                config,
                scans: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                subscription_owners: RwLock::new(HashMap::new()),
                pending_connects: AtomicUsize::new(0),
                alerts,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<SessionAlert> {
        self.shared.alerts.subscribe()
    }

    // -- scans ---------------------------------------------------------------

    #[instrument(skip(self, request), fields(timeout_ms = request.timeout.as_millis() as u64))]
    pub async fn create_scan(&self, request: ScanRequest) -> SessionResult<ScanId> {
        let scan_id = ScanId::generate();
        let session = Arc::new(Mutex::new(ScanSession::new(
            scan_id.clone(),
            request.filter.clone(),
            request.timeout,
        )));
        {
            let mut scans = self.shared.scans.write();
            let active = scans.values().filter(|s| s.lock().is_active()).count();
            if active >= self.shared.config.max_scans {
                return Err(SessionError::LimitExceeded(format!(
                    "at most {} scans may run at once",
                    self.shared.config.max_scans
                )));
            }
            scans.insert(scan_id.clone(), session.clone());
        }

        let stream = match self
            .shared
            .driver
            .start_scan(&scan_id, &request.filter)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                self.shared.scans.write().remove(&scan_id);
                return Err(map_driver_error(err));
            }
        };

        let deadline = Instant::now() + request.timeout;
        let task = tokio::spawn(run_discovery(
            Arc::downgrade(&self.shared),
            session.clone(),
            stream,
            deadline,
        ));
        let stopped_meanwhile = {
            let mut guard = session.lock();
            if guard.is_active() {
                guard.set_task(task);
                None
            } else {
                Some(task)
            }
        };
        if let Some(task) = stopped_meanwhile {
            task.abort();
            self.stop_driver_scan(&scan_id).await;
        }

        info!(scan_id = %scan_id, "scan started");
        Ok(scan_id)
    }

    pub fn get_scan(&self, scan_id: &ScanId) -> SessionResult<ScanSnapshot> {
        Ok(self.scan_entry(scan_id)?.lock().snapshot())
    }

    /// Stop a scan and return its frozen device set. Stopping twice is not an error.
    #[instrument(skip(self), fields(scan_id = %scan_id))]
    pub async fn stop_scan(&self, scan_id: &ScanId) -> SessionResult<ScanSnapshot> {
        let session = self.scan_entry(scan_id)?;
        let (transitioned, task) = {
            let mut guard = session.lock();
            (guard.stop(StopReason::Requested), guard.take_task())
        };
        if let Some(task) = task {
            task.abort();
        }
        if transitioned {
            self.stop_driver_scan(scan_id).await;
            info!(scan_id = %scan_id, "scan stopped");
        }
        let snapshot = session.lock().snapshot();
        Ok(snapshot)
    }

    pub fn list_scans(&self) -> Vec<ScanSummary> {
        let mut summaries: Vec<ScanSummary> = self
            .shared
            .scans
            .read()
            .values()
            .map(|s| s.lock().summary())
            .collect();
        summaries.sort_by_key(|s| s.started_ts);
        summaries
    }

    fn scan_entry(&self, scan_id: &ScanId) -> SessionResult<Shared<ScanSession>> {
        self.shared
            .scans
            .read()
            .get(scan_id)
            .cloned()
            .ok_or_else(|| SessionError::not_found(SessionKind::Scan, scan_id))
    }

    async fn stop_driver_scan(&self, scan_id: &ScanId) {
        if let Err(err) = self.shared.driver.stop_scan(scan_id).await {
            warn!(scan_id = %scan_id, error = %err, "driver failed to stop scan");
        }
    }

    // -- connections ---------------------------------------------------------

    /// Connect within `request.timeout`. On timeout the driver attempt is dropped
    /// and nothing is registered.
    #[instrument(skip(self, request), fields(address = %request.address))]
    pub async fn create_connection(&self, request: ConnectRequest) -> SessionResult<ConnectOutcome> {
        let address = request.address.trim().to_owned();
        if address.is_empty() {
            return Err(SessionError::InvalidArgument("address is required".to_owned()));
        }
        let _slot = self.reserve_connection_slot()?;
        let connection_id = ConnectionId::generate();
        let on_disconnect = self.link_loss_callback(connection_id.clone());

        let driver = &self.shared.driver;
        let target = address.as_str();
        let attempt = with_retry(&self.shared.config.retry, "connect", move || {
            driver.connect(target, on_disconnect.clone())
        });
        let link = match tokio::time::timeout(request.timeout, attempt).await {
            Ok(Ok(link)) => link,
            Ok(Err(err)) => {
                warn!(address = %address, error = %err, "connect failed");
                return Err(map_connect_error(&address, err));
            }
            Err(_) => {
                warn!(address = %address, "connect timed out");
                return Err(SessionError::Timeout(format!(
                    "connection to {address} did not complete within {:.1}s",
                    request.timeout.as_secs_f64()
                )));
            }
        };

        let (device_name, service_uuids) = self.scan_cache_lookup(&address);
        let session = Arc::new(Mutex::new(ConnectionSession::new(
            connection_id.clone(),
            link.clone(),
            device_name.clone(),
        )));
        self.shared
            .connections
            .write()
            .insert(connection_id.clone(), session);

        // Inserted first so a link loss racing this check is seen either way.
        if !self.shared.driver.is_connected(&link) {
            self.shared.connections.write().remove(&connection_id);
            if let Err(err) = self.shared.driver.disconnect(&link).await {
                debug!(address = %address, error = %err, "cleanup disconnect failed");
            }
            return Err(SessionError::DeviceUnreachable(format!(
                "link to {address} dropped while connecting"
            )));
        }

        info!(connection_id = %connection_id, address = %address, "connected");
        Ok(ConnectOutcome {
            connection_id,
            address,
            device_name,
            service_uuids,
            spec: None,
        })
    }

    pub fn get_connection(&self, connection_id: &ConnectionId) -> SessionResult<ConnectionStatus> {
        Ok(self.connection_entry(connection_id)?.lock().status())
    }

    pub fn list_connections(&self) -> Vec<ConnectionSummary> {
        let mut summaries: Vec<ConnectionSummary> = self
            .shared
            .connections
            .read()
            .values()
            .map(|c| c.lock().summary())
            .collect();
        summaries.sort_by_key(|c| c.created_ts);
        summaries
    }

    /// Record an unsolicited link loss. Unknown or already-dead ids are a no-op.
    /// Returns whether this call made the transition.
    pub fn mark_disconnected(&self, connection_id: &ConnectionId, at: DateTime<Utc>) -> bool {
        let Ok(entry) = self.connection_entry(connection_id) else {
            return false;
        };
        self.record_link_loss(&entry, at)
    }

    /// Tear a connection down on request and drop it from the table.
    ///
    /// Returns the final status. Only sessions lost to the link itself stay
    /// queryable afterwards.
    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> SessionResult<ConnectionStatus> {
        let entry = self.connection_entry(connection_id)?;
        let torn_down = {
            let mut session = entry.lock();
            session
                .mark_dead(DisconnectCause::Requested, Utc::now())
                .map(|characteristics| (session.link().clone(), characteristics))
        };
        if let Some((link, characteristics)) = torn_down {
            for characteristic in characteristics {
                if let Err(err) = self.shared.driver.unsubscribe(&link, characteristic).await {
                    debug!(characteristic = %characteristic, error = %err, "unsubscribe during disconnect failed");
                }
            }
            if let Err(err) = self.shared.driver.disconnect(&link).await {
                warn!(connection_id = %connection_id, error = %err, "driver disconnect failed");
            }
            info!(connection_id = %connection_id, "disconnected");
        }
        let status = entry.lock().status();
        self.forget_connection(connection_id, &entry);
        Ok(status)
    }

    pub fn attach_spec(&self, connection_id: &ConnectionId, spec: SpecRef) -> SessionResult<()> {
        self.connection_entry(connection_id)?.lock().attach_spec(spec);
        Ok(())
    }

    pub fn attached_spec(&self, connection_id: &ConnectionId) -> SessionResult<Option<SpecRef>> {
        Ok(self.connection_entry(connection_id)?.lock().spec().cloned())
    }

    fn connection_entry(
        &self,
        connection_id: &ConnectionId,
    ) -> SessionResult<Shared<ConnectionSession>> {
        self.shared
            .connections
            .read()
            .get(connection_id)
            .cloned()
            .ok_or_else(|| SessionError::not_found(SessionKind::Connection, connection_id))
    }

    fn forget_connection(&self, connection_id: &ConnectionId, entry: &Shared<ConnectionSession>) {
        let mut connections = self.shared.connections.write();
        if !connections
            .get(connection_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            return;
        }
        connections.remove(connection_id);
        drop(connections);
        let subscription_ids = entry.lock().subscription_ids();
        let mut owners = self.shared.subscription_owners.write();
        for subscription_id in &subscription_ids {
            owners.remove(subscription_id);
        }
        debug!(connection_id = %connection_id, subscriptions = subscription_ids.len(), "connection removed");
    }

    fn reserve_connection_slot(&self) -> SessionResult<ConnectSlot> {
        let connections = self.shared.connections.write();
        let alive = connections.values().filter(|c| c.lock().is_alive()).count();
        let pending = self.shared.pending_connects.load(Ordering::SeqCst);
        if alive + pending >= self.shared.config.max_connections {
            return Err(SessionError::LimitExceeded(format!(
                "at most {} connections may be open at once",
                self.shared.config.max_connections
            )));
        }
        self.shared.pending_connects.fetch_add(1, Ordering::SeqCst);
        drop(connections);
        Ok(ConnectSlot {
            shared: self.shared.clone(),
        })
    }

    fn link_loss_callback(&self, connection_id: ConnectionId) -> DisconnectCallback {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |at| {
            if let Some(shared) = shared.upgrade() {
                SessionRegistry { shared }.mark_disconnected(&connection_id, at);
            }
        })
    }

    fn record_link_loss(&self, entry: &Shared<ConnectionSession>, at: DateTime<Utc>) -> bool {
        let lost = {
            let mut session = entry.lock();
            session
                .mark_dead(DisconnectCause::LinkLost, at)
                .map(|_| (session.id.clone(), session.address.clone()))
        };
        let Some((connection_id, address)) = lost else {
            return false;
        };
        warn!(connection_id = %connection_id, address = %address, "link lost");
        let _ = self.shared.alerts.send(SessionAlert::LinkLost {
            connection_id,
            address,
            ts: at,
        });
        true
    }

    /// Name and advertised services for `address` from the most recent scan that saw it.
    fn scan_cache_lookup(&self, address: &str) -> (Option<String>, Vec<Uuid>) {
        let scans: Vec<Shared<ScanSession>> = self.shared.scans.read().values().cloned().collect();
        let mut best: Option<(DateTime<Utc>, Option<String>, Vec<Uuid>)> = None;
        for scan in scans {
            let scan = scan.lock();
            let Some(device) = scan.device(address) else {
                continue;
            };
            if best.as_ref().is_none_or(|(started, _, _)| scan.started_at > *started) {
                best = Some((
                    scan.started_at,
                    device.name.clone(),
                    device.service_uuids.clone(),
                ));
            }
        }
        best.map(|(_, name, services)| (name, services))
            .unwrap_or_default()
    }

    // -- data operations -----------------------------------------------------

    fn alive_link(
        &self,
        connection_id: &ConnectionId,
    ) -> SessionResult<(Shared<ConnectionSession>, LinkHandle)> {
        let entry = self.connection_entry(connection_id)?;
        let link = entry.lock().alive_link()?;
        Ok((entry, link))
    }

    /// Translate a driver failure on a live link. A dropped link marks the session dead.
    fn link_failure(
        &self,
        entry: &Shared<ConnectionSession>,
        link: &LinkHandle,
        err: DriverError,
    ) -> SessionError {
        let lost = matches!(err, DriverError::Disconnected) || !self.shared.driver.is_connected(link);
        if lost {
            self.record_link_loss(entry, Utc::now());
            return entry.lock().not_alive_error();
        }
        map_driver_error(err)
    }

    #[instrument(skip(self), fields(connection_id = %connection_id))]
    pub async fn discover(&self, connection_id: &ConnectionId) -> SessionResult<Arc<Catalog>> {
        let (entry, link) = self.alive_link(connection_id)?;
        if let Some(catalog) = entry.lock().catalog() {
            return Ok(catalog);
        }
        let driver = &self.shared.driver;
        let target = &link;
        let catalog = with_retry(&self.shared.config.retry, "discover", move || {
            driver.discover(target)
        })
        .await
        .map_err(|err| self.link_failure(&entry, &link, err))?;
        debug!(services = catalog.services.len(), "catalog discovered");
        let cached = entry.lock().cache_catalog(catalog);
        Ok(cached)
    }

    pub async fn mtu(&self, connection_id: &ConnectionId) -> SessionResult<MtuInfo> {
        let (entry, link) = self.alive_link(connection_id)?;
        let mtu = self
            .shared
            .driver
            .mtu(&link)
            .await
            .map_err(|err| self.link_failure(&entry, &link, err))?;
        Ok(MtuInfo {
            mtu,
            max_write_payload: mtu.saturating_sub(3),
        })
    }

    #[instrument(skip(self), fields(connection_id = %connection_id, characteristic = %characteristic))]
    pub async fn read(&self, connection_id: &ConnectionId, characteristic: Uuid) -> SessionResult<Vec<u8>> {
        let (entry, link) = self.alive_link(connection_id)?;
        let driver = &self.shared.driver;
        let target = &link;
        with_retry(&self.shared.config.retry, "read", move || {
            driver.read(target, characteristic)
        })
        .await
        .map_err(|err| self.link_failure(&entry, &link, err))
    }

    #[instrument(skip(self, value), fields(connection_id = %connection_id, characteristic = %characteristic, len = value.len()))]
    pub async fn write(
        &self,
        connection_id: &ConnectionId,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
    ) -> SessionResult<()> {
        let (entry, link) = self.alive_link(connection_id)?;
        let driver = &self.shared.driver;
        let target = &link;
        with_retry(&self.shared.config.retry, "write", move || {
            driver.write(target, characteristic, value, with_response)
        })
        .await
        .map_err(|err| self.link_failure(&entry, &link, err))
    }

    pub async fn read_descriptor(
        &self,
        connection_id: &ConnectionId,
        descriptor: DescriptorRef,
    ) -> SessionResult<Vec<u8>> {
        let (entry, link) = self.alive_link(connection_id)?;
        let driver = &self.shared.driver;
        let target = &link;
        with_retry(&self.shared.config.retry, "read_descriptor", move || {
            driver.read_descriptor(target, descriptor)
        })
        .await
        .map_err(|err| self.link_failure(&entry, &link, err))
    }

    pub async fn write_descriptor(
        &self,
        connection_id: &ConnectionId,
        descriptor: DescriptorRef,
        value: &[u8],
    ) -> SessionResult<()> {
        let (entry, link) = self.alive_link(connection_id)?;
        let driver = &self.shared.driver;
        let target = &link;
        with_retry(&self.shared.config.retry, "write_descriptor", move || {
            driver.write_descriptor(target, descriptor, value)
        })
        .await
        .map_err(|err| self.link_failure(&entry, &link, err))
    }

    // -- subscriptions -------------------------------------------------------

    #[instrument(skip(self), fields(connection_id = %connection_id, characteristic = %characteristic))]
    pub async fn create_subscription(
        &self,
        connection_id: &ConnectionId,
        characteristic: Uuid,
    ) -> SessionResult<SubscriptionOutcome> {
        let (entry, link) = self.alive_link(connection_id)?;
        let limit = self.shared.config.max_subscriptions_per_connection;
        if entry.lock().active_subscriptions() >= limit {
            return Err(subscription_limit(limit));
        }

        let driver = &self.shared.driver;
        let target = &link;
        let stream = with_retry(&self.shared.config.retry, "subscribe", move || {
            driver.subscribe(target, characteristic)
        })
        .await
        .map_err(|err| self.link_failure(&entry, &link, err))?;

        let subscription_id = SubscriptionId::generate();
        let buffer = Arc::new(NotificationBuffer::new(self.shared.config.notification_capacity));
        let pump = tokio::spawn(run_pump(
            Arc::downgrade(&self.shared),
            connection_id.clone(),
            subscription_id.clone(),
            characteristic,
            buffer.clone(),
            stream,
        ));
        let subscription = Subscription::new(
            subscription_id.clone(),
            connection_id.clone(),
            characteristic,
            buffer,
            pump,
        );

        let rejected = {
            let mut session = entry.lock();
            if !session.is_alive() {
                Some(session.not_alive_error())
            } else if session.active_subscriptions() >= limit {
                Some(subscription_limit(limit))
            } else {
                session.add_subscription(subscription);
                None
            }
        };
        if let Some(err) = rejected {
            if let Err(cleanup) = self.shared.driver.unsubscribe(&link, characteristic).await {
                debug!(error = %cleanup, "unsubscribe after rejected subscription failed");
            }
            return Err(err);
        }
        self.shared
            .subscription_owners
            .write()
            .insert(subscription_id.clone(), connection_id.clone());

        info!(subscription_id = %subscription_id, "subscribed");
        Ok(SubscriptionOutcome {
            subscription_id,
            connection_id: connection_id.clone(),
            characteristic_uuid: characteristic,
        })
    }

    /// Stop and remove a subscription. Returns false if it was already gone.
    #[instrument(skip(self), fields(connection_id = %connection_id, subscription_id = %subscription_id))]
    pub async fn remove_subscription(
        &self,
        connection_id: &ConnectionId,
        subscription_id: &SubscriptionId,
    ) -> SessionResult<bool> {
        let entry = self.connection_entry(connection_id)?;
        self.check_owner(connection_id, subscription_id)?;
        let removed = {
            let mut session = entry.lock();
            session.remove_subscription(subscription_id).map(|mut subscription| {
                let was_active = subscription.is_active();
                subscription.teardown();
                let unsubscribe = was_active && !session.is_subscribed(&subscription.characteristic);
                (subscription.characteristic, unsubscribe, session.link().clone())
            })
        };
        let Some((characteristic, unsubscribe, link)) = removed else {
            return Ok(false);
        };
        self.shared.subscription_owners.write().remove(subscription_id);
        if unsubscribe {
            if let Err(err) = self.shared.driver.unsubscribe(&link, characteristic).await {
                debug!(error = %err, "driver unsubscribe failed");
            }
        }
        info!(subscription_id = %subscription_id, "unsubscribed");
        Ok(true)
    }

    pub fn list_subscriptions(
        &self,
        connection_id: Option<&ConnectionId>,
    ) -> SessionResult<Vec<SubscriptionSummary>> {
        let entries: Vec<Shared<ConnectionSession>> = match connection_id {
            Some(id) => vec![self.connection_entry(id)?],
            None => self.shared.connections.read().values().cloned().collect(),
        };
        let mut summaries: Vec<SubscriptionSummary> = entries
            .iter()
            .flat_map(|entry| entry.lock().subscription_summaries())
            .collect();
        summaries.sort_by_key(|s| s.created_ts);
        Ok(summaries)
    }

    pub fn poll_notifications(
        &self,
        connection_id: &ConnectionId,
        subscription_id: &SubscriptionId,
        max_items: usize,
    ) -> SessionResult<Batch> {
        Ok(self
            .subscription_buffer(connection_id, subscription_id)?
            .poll(max_items))
    }

    pub async fn wait_notification(
        &self,
        connection_id: &ConnectionId,
        subscription_id: &SubscriptionId,
        timeout: Duration,
    ) -> SessionResult<Waited> {
        let buffer = self.subscription_buffer(connection_id, subscription_id)?;
        let notification = buffer.wait(timeout).await;
        Ok(Waited {
            notification,
            dropped: buffer.dropped(),
        })
    }

    pub async fn drain_notifications(
        &self,
        connection_id: &ConnectionId,
        subscription_id: &SubscriptionId,
        timeout: Duration,
        idle_timeout: Duration,
        max_items: usize,
    ) -> SessionResult<Batch> {
        let buffer = self.subscription_buffer(connection_id, subscription_id)?;
        Ok(buffer.drain(timeout, idle_timeout, max_items).await)
    }

    fn subscription_buffer(
        &self,
        connection_id: &ConnectionId,
        subscription_id: &SubscriptionId,
    ) -> SessionResult<Arc<NotificationBuffer>> {
        let entry = self.connection_entry(connection_id)?;
        let buffer = entry
            .lock()
            .subscription(subscription_id)
            .map(Subscription::buffer);
        match buffer {
            Some(buffer) => Ok(buffer),
            None => {
                self.check_owner(connection_id, subscription_id)?;
                Err(SessionError::not_found(SessionKind::Subscription, subscription_id))
            }
        }
    }

    fn check_owner(
        &self,
        connection_id: &ConnectionId,
        subscription_id: &SubscriptionId,
    ) -> SessionResult<()> {
        match self.shared.subscription_owners.read().get(subscription_id) {
            Some(owner) if owner != connection_id => Err(SessionError::SubscriptionMismatch {
                subscription_id: subscription_id.to_string(),
                connection_id: connection_id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    // -- lifecycle -----------------------------------------------------------

    /// Stop every scan and disconnect every alive link within the shutdown budget.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let scans: Vec<Shared<ScanSession>> = self.shared.scans.read().values().cloned().collect();
        for scan in scans {
            let (scan_id, transitioned, task) = {
                let mut guard = scan.lock();
                let transitioned = guard.stop(StopReason::Shutdown);
                (guard.id.clone(), transitioned, guard.take_task())
            };
            if let Some(task) = task {
                task.abort();
            }
            if transitioned {
                self.stop_driver_scan(&scan_id).await;
            }
        }

        let connections: Vec<Shared<ConnectionSession>> =
            self.shared.connections.read().values().cloned().collect();
        let now = Utc::now();
        let links: Vec<LinkHandle> = connections
            .iter()
            .filter_map(|entry| {
                let mut session = entry.lock();
                session.mark_dead(DisconnectCause::Shutdown, now)?;
                Some(session.link().clone())
            })
            .collect();
        let closing = links.len();
        let driver = self.shared.driver.clone();
        let disconnects = join_all(links.into_iter().map(|link| {
            let driver = driver.clone();
            async move {
                if let Err(err) = driver.disconnect(&link).await {
                    warn!(address = %link.address, error = %err, "disconnect at shutdown failed");
                }
            }
        }));
        if tokio::time::timeout(self.shared.config.shutdown_timeout, disconnects)
            .await
            .is_err()
        {
            warn!(closing, "shutdown budget elapsed before every link closed");
        }
        info!(closing, "session registry shut down");
    }
}

/// Releases an in-flight connect reservation on drop.
struct ConnectSlot {
    shared: Arc<RegistryShared>,
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        self.shared.pending_connects.fetch_sub(1, Ordering::SeqCst);
    }
}

fn subscription_limit(limit: usize) -> SessionError {
    SessionError::LimitExceeded(format!(
        "at most {limit} subscriptions per connection"
    ))
}

async fn run_discovery(
    shared: Weak<RegistryShared>,
    session: Shared<ScanSession>,
    mut stream: DiscoveryStream,
    deadline: Instant,
) {
    let reason = loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break StopReason::DeadlineElapsed,
            next = stream.next() => match next {
                Some(device) => {
                    session.lock().record(device);
                }
                None => break StopReason::StreamEnded,
            },
        }
    };
    drop(stream);
    let (scan_id, transitioned) = {
        let mut guard = session.lock();
        (guard.id.clone(), guard.stop(reason))
    };
    if !transitioned {
        return;
    }
    if let Some(shared) = shared.upgrade() {
        if let Err(err) = shared.driver.stop_scan(&scan_id).await {
            warn!(scan_id = %scan_id, error = %err, "driver failed to stop scan");
        }
    }
    info!(scan_id = %scan_id, reason = ?reason, "scan finished");
}

async fn run_pump(
    shared: Weak<RegistryShared>,
    connection_id: ConnectionId,
    subscription_id: SubscriptionId,
    characteristic: Uuid,
    buffer: Arc<NotificationBuffer>,
    mut stream: NotificationStream,
) {
    while let Some(notification) = stream.next().await {
        match buffer.push(notification) {
            PushOutcome::Closed => break,
            PushOutcome::Stored { alert: false } => {}
            PushOutcome::Stored { alert: true } => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let _ = shared.alerts.send(SessionAlert::NotificationsAvailable {
                    connection_id: connection_id.clone(),
                    subscription_id: subscription_id.clone(),
                    characteristic_uuid: characteristic,
                });
            }
        }
    }
    debug!(subscription_id = %subscription_id, "notification stream ended");
}

fn map_connect_error(address: &str, err: DriverError) -> SessionError {
    match err {
        DriverError::Unreachable(reason) => {
            SessionError::DeviceUnreachable(format!("{address}: {reason}"))
        }
        DriverError::Disconnected => {
            SessionError::DeviceUnreachable(format!("{address}: link dropped while connecting"))
        }
        DriverError::Timeout => SessionError::Timeout(format!("connection to {address} timed out")),
        other => map_driver_error(other),
    }
}

fn map_driver_error(err: DriverError) -> SessionError {
    match err {
        DriverError::Timeout => SessionError::Timeout("device did not answer in time".to_owned()),
        DriverError::Unreachable(reason) => SessionError::DeviceUnreachable(reason),
        DriverError::Disconnected => SessionError::Transport("link is disconnected".to_owned()),
        DriverError::Transient(reason) => SessionError::Transport(reason),
        DriverError::UnknownCapability(what) => {
            SessionError::not_found(SessionKind::Capability, what)
        }
        DriverError::Unsupported(what) => SessionError::Unsupported(what),
        DriverError::Fault(reason) => {
            error!(error = %reason, "driver fault");
            SessionError::Internal(format!("driver fault: {reason}"))
        }
    }
}
