//! In-memory band implementing [`Radio`] and [`Link`]
//!
//! Speaks the same frames as real hardware: the handshake is checked with
//! the real cipher, and every readable characteristic is produced by the
//! codec encoders. Tests reach into it through the hooks on
//! [`SimulatedBand`] to drop the link, push heart-rate frames, or make the
//! band slow or silent.

use crate::auth::{AuthCommand, AuthRequest, AuthResponse, Authenticator, AUTH_SUCCESS};
use crate::codec::{
    ActivityStatus, Alarm, AlertLevel, AuthKey, BatteryInfo, DeviceInfo, HeartRateControl, HeartRateFrame,
    decode_alarm_frame, decode_goal_frame, decode_goal_notifications_frame, decode_time, encode_time,
};
use crate::constants::*;
use crate::error::BandError;
use crate::transport::{
    Characteristic, HardwareAddress, Link, LinkEvent, LinkEvents, PeripheralHandle, PeripheralTarget, Radio,
    ServiceInfo,
};
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status the band reports for a wrong key
pub const AUTH_FAILED: u8 = 0x04;

/// How the band answers the auth characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthBehavior {
    #[default]
    Respond,
    /// Never notify; the host's handshake must time out
    Silent,
    /// Answer a challenge request as if it were the encrypted response
    WrongCommand,
    /// Confirm the answer, then lose the link right away
    DropAfterSuccess,
}

/// Peripheral-side values, readable and writable through the link
#[derive(Debug, Clone)]
pub struct BandState {
    pub battery: BatteryInfo,
    pub status: ActivityStatus,
    pub time: NaiveDateTime,
    pub device_info: DeviceInfo,
    pub alarms: [Option<Alarm>; MAX_ALARMS],
    pub activity_goal: u32,
    pub goal_notifications: bool,
    pub last_alert: Option<AlertLevel>,
    pub continuous_heart_rate: bool,
    pub keepalives: usize,
}

impl Default for BandState {
    fn default() -> Self {
        let midnight = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        Self {
            battery: BatteryInfo {
                level: 87,
                is_charging: false,
                last_level: 100,
                last_charge: Some(midnight),
                last_off: None,
            },
            status: ActivityStatus {
                steps: 4321,
                meters: 3012,
                calories: 187,
            },
            time: midnight,
            device_info: DeviceInfo {
                hardware_revision: "V0.44.19.2".to_string(),
                firmware_version: "1.0.9.66".to_string(),
                vendor_id_source: 1,
                vendor_id: 0x0157,
                product_id: 0x0024,
                product_version: 0x0001,
            },
            alarms: [None; MAX_ALARMS],
            activity_goal: 0,
            goal_notifications: false,
            last_alert: None,
            continuous_heart_rate: false,
            keepalives: 0,
        }
    }
}

#[derive(Debug)]
struct Settings {
    reachable: bool,
    permission_denied: bool,
    authorized: bool,
    handle_generation: u32,
    auth: AuthBehavior,
    fixed_challenge: Option<[u8; AUTH_KEY_SIZE]>,
    response_delay: Duration,
    hang_reads: bool,
    omitted_service: Option<Uuid>,
    heart_rate_script: Vec<u8>,
    heart_rate_period: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reachable: true,
            permission_denied: false,
            authorized: false,
            handle_generation: 1,
            auth: AuthBehavior::Respond,
            fixed_challenge: None,
            response_delay: Duration::ZERO,
            hang_reads: false,
            omitted_service: None,
            heart_rate_script: Vec::new(),
            heart_rate_period: Duration::from_secs(1),
        }
    }
}

struct OpenLink {
    id: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    notifying: HashSet<Uuid>,
    pending_challenge: Option<[u8; AUTH_KEY_SIZE]>,
    streamer: Option<JoinHandle<()>>,
}

struct Inner {
    address: HardwareAddress,
    name: String,
    authenticator: Authenticator,
    settings: Mutex<Settings>,
    state: Mutex<BandState>,
    link: Mutex<Option<OpenLink>>,
    next_link: Mutex<u64>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connections: AtomicUsize,
}

impl Inner {
    fn handle_id(&self) -> String {
        let generation = self.settings.lock().handle_generation;
        format!("sim-{}-{generation}", self.address)
    }

    /// Queue a notification on the open link if the host enabled it
    fn notify(&self, link_id: u64, characteristic: Uuid, value: &[u8]) -> bool {
        self.push_notification(link_id, characteristic, value, false)
    }

    fn push_notification(&self, link_id: u64, characteristic: Uuid, value: &[u8], ignore_cccd: bool) -> bool {
        let link = self.link.lock();
        let Some(open) = link.as_ref().filter(|open| open.id == link_id) else {
            return false;
        };
        if !ignore_cccd && !open.notifying.contains(&characteristic) {
            debug!(%characteristic, "Notification dropped, host is not listening");
            return false;
        }
        open.events
            .send(LinkEvent::Notification {
                characteristic,
                value: Bytes::copy_from_slice(value),
            })
            .is_ok()
    }

    fn drop_link(&self, reason: &str) {
        if let Some(open) = self.link.lock().take() {
            warn!(%reason, "Simulated link dropped");
            if let Some(streamer) = open.streamer {
                streamer.abort();
            }
            let _ = open.events.send(LinkEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    fn current_link_id(&self) -> Option<u64> {
        self.link.lock().as_ref().map(|open| open.id)
    }
}

/// A band that lives in memory. Cloning shares the same band.
#[derive(Clone)]
pub struct SimulatedBand {
    inner: Arc<Inner>,
}

impl SimulatedBand {
    pub fn new(address: HardwareAddress, key: &AuthKey) -> Self {
        Self {
            inner: Arc::new(Inner {
                address,
                name: "Simulated Band".to_string(),
                authenticator: Authenticator::new(key),
                settings: Mutex::new(Settings::default()),
                state: Mutex::new(BandState::default()),
                link: Mutex::new(None),
                next_link: Mutex::new(1),
                writes: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    pub fn address(&self) -> HardwareAddress {
        self.inner.address
    }

    /// Current platform handle of this band
    pub fn handle_id(&self) -> String {
        self.inner.handle_id()
    }

    // --- Behaviour ---

    /// An unreachable band never answers `open`
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.settings.lock().reachable = reachable;
    }

    pub fn set_permission_denied(&self, denied: bool) {
        self.inner.settings.lock().permission_denied = denied;
    }

    /// Whether the platform already lists this band as authorized
    pub fn set_authorized(&self, authorized: bool) {
        self.inner.settings.lock().authorized = authorized;
    }

    /// Platform revoked and re-granted access: same band, new handle
    pub fn reissue_handle(&self) -> String {
        self.inner.settings.lock().handle_generation += 1;
        self.inner.handle_id()
    }

    pub fn set_auth_behavior(&self, behavior: AuthBehavior) {
        self.inner.settings.lock().auth = behavior;
    }

    pub fn set_fixed_challenge(&self, challenge: [u8; AUTH_KEY_SIZE]) {
        self.inner.settings.lock().fixed_challenge = Some(challenge);
    }

    /// Delay applied to every read and write
    pub fn set_response_delay(&self, delay: Duration) {
        self.inner.settings.lock().response_delay = delay;
    }

    /// Reads never complete while set
    pub fn set_hang_reads(&self, hang: bool) {
        self.inner.settings.lock().hang_reads = hang;
    }

    pub fn omit_service(&self, service: Uuid) {
        self.inner.settings.lock().omitted_service = Some(service);
    }

    /// Readings the band produces after a measurement ping, and cycles through
    /// while continuous mode is on
    pub fn set_heart_rate_script(&self, bpm: Vec<u8>, period: Duration) {
        let mut settings = self.inner.settings.lock();
        settings.heart_rate_script = bpm;
        settings.heart_rate_period = period;
    }

    pub fn update_state(&self, change: impl FnOnce(&mut BandState)) {
        change(&mut self.inner.state.lock());
    }

    // --- Hooks ---

    pub fn state(&self) -> BandState {
        self.inner.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Every write the host made, in order
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.inner.writes.lock().clone()
    }

    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        self.inner
            .writes
            .lock()
            .iter()
            .filter(|(uuid, _)| *uuid == characteristic)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Highest number of reads and writes that were ever in flight together
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Push one heart-rate notification; false if the host is not listening
    pub fn emit_heart_rate(&self, bpm: u8) -> bool {
        let Some(id) = self.inner.current_link_id() else {
            return false;
        };
        self.inner
            .notify(id, HR_MEASUREMENT_CHAR, &HeartRateFrame::new(bpm).encode())
    }

    /// Push raw bytes on any characteristic
    pub fn emit_raw(&self, characteristic: Uuid, value: &[u8]) -> bool {
        let Some(id) = self.inner.current_link_id() else {
            return false;
        };
        self.inner.notify(id, characteristic, value)
    }

    /// Push raw bytes even though the host switched notifications off,
    /// as a band still draining its radio queue does
    pub fn emit_stray(&self, characteristic: Uuid, value: &[u8]) -> bool {
        let Some(id) = self.inner.current_link_id() else {
            return false;
        };
        self.inner.push_notification(id, characteristic, value, true)
    }

    /// The radio link goes away without the host asking
    pub fn drop_link(&self, reason: &str) {
        self.inner.drop_link(reason);
    }

    fn peripheral(&self) -> PeripheralHandle {
        PeripheralHandle {
            handle_id: self.inner.handle_id(),
            address: self.inner.address,
            name: Some(self.inner.name.clone()),
        }
    }

    fn check_permission(&self) -> Result<(), BandError> {
        if self.inner.settings.lock().permission_denied {
            return Err(BandError::PermissionDenied);
        }
        Ok(())
    }

    fn services(&self) -> Vec<ServiceInfo> {
        let omitted = self.inner.settings.lock().omitted_service;
        [
            (AUTH_SERVICE, vec![AUTH_CHAR]),
            (
                BAND_SERVICE,
                vec![BATTERY_CHAR, STATUS_CHAR, CURRENT_TIME_CHAR, CONFIG_CHAR, USER_SETTINGS_CHAR],
            ),
            (HEART_RATE_SERVICE, vec![HR_CONTROL_CHAR, HR_MEASUREMENT_CHAR]),
            (IMMEDIATE_ALERT_SERVICE, vec![ALERT_LEVEL_CHAR]),
            (
                DEVICE_INFO_SERVICE,
                vec![HARDWARE_REVISION_CHAR, FIRMWARE_REVISION_CHAR, PNP_ID_CHAR],
            ),
        ]
        .into_iter()
        .filter(|(uuid, _)| Some(*uuid) != omitted)
        .map(|(uuid, characteristics)| ServiceInfo { uuid, characteristics })
        .collect()
    }
}

impl Radio for SimulatedBand {
    type Link = SimLink;

    async fn authorized_peripherals(&self) -> Result<Vec<PeripheralHandle>, BandError> {
        self.check_permission()?;
        if self.inner.settings.lock().authorized {
            Ok(vec![self.peripheral()])
        } else {
            Ok(Vec::new())
        }
    }

    async fn request_peripheral(&self) -> Result<PeripheralHandle, BandError> {
        self.check_permission()?;
        self.inner.settings.lock().authorized = true;
        Ok(self.peripheral())
    }

    async fn open(&self, target: &PeripheralTarget) -> Result<(SimLink, LinkEvents), BandError> {
        self.check_permission()?;
        let (reachable, authorized) = {
            let settings = self.inner.settings.lock();
            (settings.reachable, settings.authorized)
        };
        let matches = match target {
            PeripheralTarget::Handle(handle_id) => authorized && *handle_id == self.inner.handle_id(),
            PeripheralTarget::Address(address) => *address == self.inner.address,
        };
        if !matches {
            return Err(BandError::DeviceUnavailable(format!("no band answers to {target}")));
        }
        if !reachable {
            std::future::pending::<()>().await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut next = self.inner.next_link.lock();
            let id = *next;
            *next += 1;
            id
        };
        let previous = self.inner.link.lock().replace(OpenLink {
            id,
            events: tx,
            notifying: HashSet::new(),
            pending_challenge: None,
            streamer: None,
        });
        if let Some(streamer) = previous.and_then(|open| open.streamer) {
            streamer.abort();
        }
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        info!(%target, link = id, "Simulated band accepted link");
        Ok((
            SimLink {
                band: self.clone(),
                id,
                closed: AtomicBool::new(false),
            },
            rx,
        ))
    }

    async fn revoke(&self, handle_id: &str) -> Result<(), BandError> {
        if handle_id == self.inner.handle_id() {
            self.inner.settings.lock().authorized = false;
        }
        Ok(())
    }
}

/// Counts one in-flight operation for as long as it lives
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Link to a [`SimulatedBand`]
pub struct SimLink {
    band: SimulatedBand,
    id: u64,
    closed: AtomicBool,
}

impl SimLink {
    fn inner(&self) -> &Inner {
        &self.band.inner
    }

    fn ensure_open(&self) -> Result<(), BandError> {
        let live = self.inner().current_link_id() == Some(self.id);
        if self.closed.load(Ordering::SeqCst) || !live {
            return Err(BandError::Transport("simulated link is closed".to_string()));
        }
        Ok(())
    }

    async fn respond_delay(&self) {
        let delay = self.inner().settings.lock().response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn read_value(&self, uuid: Uuid) -> Result<Vec<u8>, BandError> {
        let state = self.inner().state.lock();
        match uuid {
            BATTERY_CHAR => Ok(state.battery.encode()?.to_vec()),
            STATUS_CHAR => Ok(state.status.encode().to_vec()),
            CURRENT_TIME_CHAR => Ok(encode_time(&state.time)?.to_vec()),
            HARDWARE_REVISION_CHAR => Ok(state.device_info.encode().hardware_revision),
            FIRMWARE_REVISION_CHAR => Ok(state.device_info.encode().firmware_version),
            PNP_ID_CHAR => Ok(state.device_info.encode().pnp_id.to_vec()),
            other => Err(BandError::Transport(format!("characteristic {other} is not readable"))),
        }
    }

    fn apply_write(&self, uuid: Uuid, data: &[u8]) -> Result<(), BandError> {
        match uuid {
            AUTH_CHAR => self.handle_auth(data),
            CURRENT_TIME_CHAR => {
                self.inner().state.lock().time = decode_time(data)?;
                Ok(())
            }
            CONFIG_CHAR => match data.first() {
                Some(&ALARM_COMMAND) => {
                    let (index, alarm) = decode_alarm_frame(data)?;
                    self.inner().state.lock().alarms[index as usize] = Some(alarm);
                    Ok(())
                }
                _ => {
                    self.inner().state.lock().goal_notifications = decode_goal_notifications_frame(data)?;
                    Ok(())
                }
            },
            USER_SETTINGS_CHAR => {
                self.inner().state.lock().activity_goal = decode_goal_frame(data)?;
                Ok(())
            }
            ALERT_LEVEL_CHAR => {
                let level = data
                    .first()
                    .and_then(|&byte| AlertLevel::try_from(byte).ok())
                    .ok_or_else(|| BandError::Transport(format!("bad alert level {}", hex::encode(data))))?;
                self.inner().state.lock().last_alert = Some(level);
                Ok(())
            }
            HR_CONTROL_CHAR => self.handle_heart_rate_control(HeartRateControl::decode(data)?),
            other => Err(BandError::Transport(format!("characteristic {other} is not writable"))),
        }
    }

    fn handle_auth(&self, data: &[u8]) -> Result<(), BandError> {
        let inner = self.inner();
        let (behavior, fixed) = {
            let settings = inner.settings.lock();
            (settings.auth, settings.fixed_challenge)
        };
        let request = AuthRequest::decode(data).map_err(|e| BandError::Transport(e.to_string()))?;
        let confirming = matches!(request, AuthRequest::EncryptedResponse(_));
        let response = match (request, behavior) {
            (_, AuthBehavior::Silent) => return Ok(()),
            (AuthRequest::RequestRandom, AuthBehavior::WrongCommand) => {
                AuthResponse::new(AuthCommand::EncryptedResponse, AUTH_SUCCESS, &[])
            }
            (AuthRequest::RequestRandom, _) => {
                let challenge = fixed.unwrap_or_else(rand::random);
                if let Some(open) = inner.link.lock().as_mut() {
                    open.pending_challenge = Some(challenge);
                }
                AuthResponse::new(AuthCommand::RequestRandom, AUTH_SUCCESS, &challenge)
            }
            (AuthRequest::EncryptedResponse(answer), _) => {
                let challenge = inner
                    .link
                    .lock()
                    .as_mut()
                    .and_then(|open| open.pending_challenge.take());
                let accepted = challenge.is_some_and(|challenge| inner.authenticator.verify(&challenge, &answer));
                let status = if accepted { AUTH_SUCCESS } else { AUTH_FAILED };
                debug!(accepted, "Simulated band checked auth answer");
                AuthResponse::new(AuthCommand::EncryptedResponse, status, &[])
            }
        };
        inner.notify(self.id, AUTH_CHAR, &response.encode());
        if confirming && behavior == AuthBehavior::DropAfterSuccess {
            inner.drop_link("lost right after authentication");
        }
        Ok(())
    }

    fn handle_heart_rate_control(&self, command: HeartRateControl) -> Result<(), BandError> {
        debug!(%command, "Simulated heart-rate control");
        let inner = self.inner();
        match command {
            HeartRateControl::Ping => self.start_streamer(false),
            HeartRateControl::ContinuousOn => {
                inner.state.lock().continuous_heart_rate = true;
                self.start_streamer(true);
            }
            HeartRateControl::ContinuousOff | HeartRateControl::Stop => {
                if command == HeartRateControl::ContinuousOff {
                    inner.state.lock().continuous_heart_rate = false;
                }
                self.stop_streamer();
            }
            HeartRateControl::KeepAlive => inner.state.lock().keepalives += 1,
        }
        Ok(())
    }

    /// Play the heart-rate script: once for a ping, cyclically in continuous mode
    fn start_streamer(&self, cycle: bool) {
        let (script, period) = {
            let settings = self.inner().settings.lock();
            (settings.heart_rate_script.clone(), settings.heart_rate_period)
        };
        if script.is_empty() {
            return;
        }
        let inner = self.band.inner.clone();
        let id = self.id;
        let streamer = tokio::spawn(async move {
            loop {
                for &bpm in &script {
                    tokio::time::sleep(period).await;
                    inner.notify(id, HR_MEASUREMENT_CHAR, &HeartRateFrame::new(bpm).encode());
                }
                if !cycle {
                    break;
                }
            }
        });
        let mut link = self.inner().link.lock();
        match link.as_mut().filter(|open| open.id == self.id) {
            Some(open) => {
                if let Some(previous) = open.streamer.replace(streamer) {
                    previous.abort();
                }
            }
            None => streamer.abort(),
        }
    }

    fn stop_streamer(&self) {
        let mut link = self.inner().link.lock();
        if let Some(streamer) = link
            .as_mut()
            .filter(|open| open.id == self.id)
            .and_then(|open| open.streamer.take())
        {
            streamer.abort();
        }
    }
}

impl Link for SimLink {
    fn address(&self) -> HardwareAddress {
        self.band.inner.address
    }

    fn handle_id(&self) -> String {
        self.band.inner.handle_id()
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, BandError> {
        self.ensure_open()?;
        Ok(self.band.services())
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Bytes, BandError> {
        self.ensure_open()?;
        let _in_flight = InFlight::enter(self.inner());
        self.respond_delay().await;
        let hang = self.inner().settings.lock().hang_reads;
        if hang {
            std::future::pending::<()>().await;
        }
        self.ensure_open()?;
        Ok(Bytes::from(self.read_value(characteristic.uuid)?))
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), BandError> {
        self.ensure_open()?;
        let _in_flight = InFlight::enter(self.inner());
        self.respond_delay().await;
        self.ensure_open()?;
        self.inner().writes.lock().push((characteristic.uuid, data.to_vec()));
        self.apply_write(characteristic.uuid, data)
    }

    async fn set_notify(&self, characteristic: Characteristic, enabled: bool) -> Result<(), BandError> {
        self.ensure_open()?;
        let mut link = self.inner().link.lock();
        if let Some(open) = link.as_mut().filter(|open| open.id == self.id) {
            if enabled {
                open.notifying.insert(characteristic.uuid);
            } else {
                open.notifying.remove(&characteristic.uuid);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BandError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut link = self.inner().link.lock();
        if link.as_ref().is_some_and(|open| open.id == self.id) {
            if let Some(streamer) = link.take().and_then(|open| open.streamer) {
                streamer.abort();
            }
            debug!(link = self.id, "Simulated link closed by host");
        }
        Ok(())
    }
}
