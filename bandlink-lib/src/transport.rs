//! Radio transport: one exclusively owned link to one peripheral
//!
//! The platform radio sits behind two traits. [`Radio`] finds and opens
//! peripherals, [`Link`] is a single open connection exposing GATT-style
//! read/write/notify primitives. Neither knows anything about the band
//! protocol.
//!
//! [`TransportSession`] wraps a link and adds what every caller needs:
//! endpoint resolution, notification fan-out in arrival order, and
//! cancellation of every pending operation the moment the link goes away
//! (explicit disconnect or link loss).

use crate::error::BandError;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 6-byte MAC-style hardware address, the identity of a physical band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for HardwareAddress {
    type Err = BandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BandError::InvalidArgument(format!("invalid hardware address '{s}'"));
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for HardwareAddress {
    type Error = BandError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HardwareAddress> for String {
    fn from(address: HardwareAddress) -> Self {
        address.to_string()
    }
}

/// A peripheral the platform knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Opaque platform identifier of the authorization
    pub handle_id: String,
    pub address: HardwareAddress,
    pub name: Option<String>,
}

/// What to open: a platform handle for silent reconnection, or a bare address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralTarget {
    Handle(String),
    Address(HardwareAddress),
}

impl fmt::Display for PeripheralTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralTarget::Handle(id) => write!(f, "handle {id}"),
            PeripheralTarget::Address(address) => write!(f, "address {address}"),
        }
    }
}

/// A service and the characteristics it exposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// A resolved characteristic endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Events a link reports outside of request/response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { characteristic: Uuid, value: Bytes },
    Disconnected { reason: String },
}

pub type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// Platform radio: discovery, authorization and opening links
pub trait Radio: Send + Sync + 'static {
    type Link: Link;

    /// Peripherals the platform already authorized, usable without prompting the user
    fn authorized_peripherals(&self) -> impl Future<Output = Result<Vec<PeripheralHandle>, BandError>> + Send;

    /// Discovery prompt: let the user pick a band
    fn request_peripheral(&self) -> impl Future<Output = Result<PeripheralHandle, BandError>> + Send;

    /// Open a link. Events for the link arrive on the returned receiver.
    fn open(&self, target: &PeripheralTarget) -> impl Future<Output = Result<(Self::Link, LinkEvents), BandError>> + Send;

    /// Drop the platform-level authorization of a peripheral
    fn revoke(&self, handle_id: &str) -> impl Future<Output = Result<(), BandError>> + Send;
}

/// One open connection to a peripheral
pub trait Link: Send + Sync + 'static {
    fn address(&self) -> HardwareAddress;

    fn handle_id(&self) -> String;

    fn discover_services(&self) -> impl Future<Output = Result<Vec<ServiceInfo>, BandError>> + Send;

    fn read(&self, characteristic: Characteristic) -> impl Future<Output = Result<Bytes, BandError>> + Send;

    fn write(&self, characteristic: Characteristic, data: &[u8]) -> impl Future<Output = Result<(), BandError>> + Send;

    fn set_notify(&self, characteristic: Characteristic, enabled: bool) -> impl Future<Output = Result<(), BandError>> + Send;

    /// Release the connection. Must be safe to call more than once.
    fn close(&self) -> impl Future<Output = Result<(), BandError>> + Send;
}

/// Why a session stopped accepting operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Host,
    LinkLost(String),
}

impl CloseReason {
    pub fn into_error(self) -> BandError {
        match self {
            CloseReason::Host => BandError::Transport("link closed by host".to_string()),
            CloseReason::LinkLost(reason) => BandError::Transport(format!("link lost: {reason}")),
        }
    }
}

type NotifyFn = dyn Fn(Bytes) + Send + Sync;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, Uuid, Arc<NotifyFn>)>,
}

impl Subscribers {
    fn watching(&self, characteristic: Uuid) -> bool {
        self.entries.iter().any(|(_, uuid, _)| *uuid == characteristic)
    }
}

/// Handle to a notification callback. Dropping it stops delivery.
pub struct Subscription {
    id: u64,
    characteristic: Characteristic,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    pub fn characteristic(&self) -> Characteristic {
        self.characteristic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().entries.retain(|(id, _, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("characteristic", &self.characteristic)
            .finish()
    }
}

pub struct TransportSession<L: Link> {
    link: Arc<L>,
    services: Mutex<Vec<ServiceInfo>>,
    subscribers: Arc<Mutex<Subscribers>>,
    closed: Arc<watch::Sender<Option<CloseReason>>>,
    released: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<L: Link> TransportSession<L> {
    /// Open a link to `target`, failing with `DeviceUnavailable` if nothing answers in time
    pub async fn connect<R>(radio: &R, target: &PeripheralTarget, timeout: Duration) -> Result<Self, BandError>
    where
        R: Radio<Link = L>,
    {
        info!(%target, "Opening radio link...");
        let (link, events) = tokio::time::timeout(timeout, radio.open(target))
            .await
            .map_err(|_| BandError::DeviceUnavailable(format!("{target} did not respond within {timeout:?}")))??;
        info!(address = %link.address(), "Radio link open.");

        let subscribers = Arc::new(Mutex::new(Subscribers::default()));
        let (closed, _) = watch::channel(None);
        let closed = Arc::new(closed);
        let pump = tokio::spawn(pump_events(events, subscribers.clone(), closed.clone()));

        Ok(Self {
            link: Arc::new(link),
            services: Mutex::new(Vec::new()),
            subscribers,
            closed,
            released: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn address(&self) -> HardwareAddress {
        self.link.address()
    }

    pub fn handle_id(&self) -> String {
        self.link.handle_id()
    }

    pub fn is_connected(&self) -> bool {
        self.closed.borrow().is_none()
    }

    /// `None` while the link is open
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.borrow().clone()
    }

    /// Resolves once the session stops accepting operations
    pub async fn closed(&self) -> CloseReason {
        wait_closed(self.closed.subscribe()).await
    }

    /// Detached close notification, for tasks that must not borrow the session
    pub fn on_close(&self) -> impl Future<Output = CloseReason> + Send + 'static {
        wait_closed(self.closed.subscribe())
    }

    fn ensure_open(&self) -> Result<(), BandError> {
        match self.closed.borrow().clone() {
            Some(reason) => Err(reason.into_error()),
            None => Ok(()),
        }
    }

    /// Run a link operation, abandoning it as soon as the session closes
    async fn guarded<T>(&self, op: impl Future<Output = Result<T, BandError>>) -> Result<T, BandError> {
        let mut closed = self.closed.subscribe();
        if let Some(reason) = closed.borrow_and_update().clone() {
            return Err(reason.into_error());
        }
        tokio::select! {
            result = op => return result,
            _ = closed.changed() => {}
        }
        let reason = self.closed.borrow().clone().unwrap_or(CloseReason::Host);
        Err(reason.into_error())
    }

    /// Discover the peripheral's services; must run before endpoint lookups
    pub async fn discover(&self) -> Result<Vec<ServiceInfo>, BandError> {
        let services = self.guarded(self.link.discover_services()).await?;
        debug!(count = services.len(), "Discovered services");
        *self.services.lock() = services.clone();
        Ok(services)
    }

    pub fn get_service(&self, uuid: Uuid) -> Result<ServiceInfo, BandError> {
        self.services
            .lock()
            .iter()
            .find(|service| service.uuid == uuid)
            .cloned()
            .ok_or(BandError::ServiceNotFound(uuid))
    }

    pub fn get_characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, BandError> {
        if self.get_service(service)?.characteristics.contains(&uuid) {
            Ok(Characteristic { service, uuid })
        } else {
            Err(BandError::CharacteristicNotFound {
                service,
                characteristic: uuid,
            })
        }
    }

    pub async fn read(&self, characteristic: &Characteristic) -> Result<Bytes, BandError> {
        let value = self.guarded(self.link.read(*characteristic)).await?;
        debug!(characteristic = %characteristic.uuid, bytes = hex::encode(&value), "Read");
        Ok(value)
    }

    pub async fn write(&self, characteristic: &Characteristic, data: &[u8]) -> Result<(), BandError> {
        debug!(characteristic = %characteristic.uuid, bytes = hex::encode(data), "Write");
        self.guarded(self.link.write(*characteristic, data)).await
    }

    /// Deliver every notification of `characteristic` to `on_notification` until
    /// the subscription is dropped or the session closes
    pub async fn subscribe<F>(&self, characteristic: &Characteristic, on_notification: F) -> Result<Subscription, BandError>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let first = !self.subscribers.lock().watching(characteristic.uuid);
        if first {
            self.guarded(self.link.set_notify(*characteristic, true)).await?;
        }

        let mut subscribers = self.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        let callback: Arc<NotifyFn> = Arc::new(on_notification);
        subscribers.entries.push((id, characteristic.uuid, callback));
        Ok(Subscription {
            id,
            characteristic: *characteristic,
            subscribers: Arc::downgrade(&self.subscribers),
        })
    }

    /// Stop a subscription and turn notifications off once nobody listens
    pub async fn unsubscribe(&self, subscription: Subscription) -> Result<(), BandError> {
        let characteristic = subscription.characteristic;
        drop(subscription);
        if self.is_connected() && !self.subscribers.lock().watching(characteristic.uuid) {
            self.guarded(self.link.set_notify(characteristic, false)).await?;
        }
        Ok(())
    }

    /// Release the link. Pending operations fail, subscriptions end. Idempotent.
    pub async fn disconnect(&self) -> Result<(), BandError> {
        self.closed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(CloseReason::Host);
                true
            } else {
                false
            }
        });
        self.subscribers.lock().entries.clear();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(address = %self.link.address(), "Closing radio link");
        self.link.close().await
    }
}

impl<L: Link> Drop for TransportSession<L> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}

async fn wait_closed(mut rx: watch::Receiver<Option<CloseReason>>) -> CloseReason {
    match rx.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone().unwrap_or(CloseReason::Host),
        Err(_) => CloseReason::Host,
    }
}

/// Fan link events out to subscribers, in arrival order
async fn pump_events(
    mut events: LinkEvents,
    subscribers: Arc<Mutex<Subscribers>>,
    closed: Arc<watch::Sender<Option<CloseReason>>>,
) {
    let reason = loop {
        match events.recv().await {
            Some(LinkEvent::Notification { characteristic, value }) => {
                let targets: Vec<Arc<NotifyFn>> = subscribers
                    .lock()
                    .entries
                    .iter()
                    .filter(|(_, uuid, _)| *uuid == characteristic)
                    .map(|(_, _, callback)| callback.clone())
                    .collect();
                debug!(%characteristic, bytes = hex::encode(&value), listeners = targets.len(), "Notification");
                for callback in targets {
                    callback(value.clone());
                }
            }
            Some(LinkEvent::Disconnected { reason }) => break reason,
            None => break "link event stream ended".to_string(),
        }
    };

    warn!(%reason, "Radio link lost");
    closed.send_if_modified(|state| {
        if state.is_none() {
            *state = Some(CloseReason::LinkLost(reason));
            true
        } else {
            false
        }
    });
    subscribers.lock().entries.clear();
}
