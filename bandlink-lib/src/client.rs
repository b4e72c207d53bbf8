//! Session state machine and command surface for one band
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingService -> Authenticating -> Authenticated
//!                     |               |                 |
//!                     +---------------+-----------------+--> Error
//! ```
//!
//! A [`BandClient`] holds at most one live session. Feature commands are
//! serialized through a FIFO queue so the band never sees two request/response
//! exchanges in flight at once.

use crate::auth::Authenticator;
use crate::codec::{
    ActivityStatus, Alarm, AlertLevel, AuthKey, BatteryInfo, DeviceInfo, HeartRateControl, HeartRateFrame, decode_time,
    encode_alarm_frame, encode_goal_frame, encode_goal_notifications_frame, encode_time,
};
use crate::config::BandConfig;
use crate::constants::*;
use crate::error::BandError;
use crate::heart_rate::{HeartRateMonitor, HeartRateReading, StabilityTracker};
use crate::registry::{DeviceRegistry, DeviceUpdate, NewPairedDevice, PairedDevice, validate_alarms};
use crate::transport::{
    Characteristic, CloseReason, HardwareAddress, Link, PeripheralTarget, Radio, TransportSession,
};
use bytes::Bytes;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of the client's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingService,
    Authenticating,
    Authenticated,
    /// The last attempt or session failed; `connect` starts over
    Error,
}

/// Receives every state entry of a `connect` call, for step-by-step progress UI
pub trait ConnectionObserver: Send + Sync {
    fn on_state(&self, state: SessionState);
}

impl<F> ConnectionObserver for F
where
    F: Fn(SessionState) + Send + Sync,
{
    fn on_state(&self, state: SessionState) {
        self(state)
    }
}

impl ConnectionObserver for () {
    fn on_state(&self, _state: SessionState) {}
}

/// Every endpoint the client talks to, resolved once per session
#[derive(Debug, Clone, Copy)]
pub(crate) struct BandCharacteristics {
    pub auth: Characteristic,
    pub battery: Characteristic,
    pub status: Characteristic,
    pub current_time: Characteristic,
    pub config: Characteristic,
    pub user_settings: Characteristic,
    pub hr_control: Characteristic,
    pub hr_measurement: Characteristic,
    pub alert_level: Characteristic,
    pub hardware_revision: Characteristic,
    pub firmware_revision: Characteristic,
    pub pnp_id: Characteristic,
}

impl BandCharacteristics {
    fn resolve<L: Link>(transport: &TransportSession<L>) -> Result<Self, BandError> {
        Ok(Self {
            auth: transport.get_characteristic(AUTH_SERVICE, AUTH_CHAR)?,
            battery: transport.get_characteristic(BAND_SERVICE, BATTERY_CHAR)?,
            status: transport.get_characteristic(BAND_SERVICE, STATUS_CHAR)?,
            current_time: transport.get_characteristic(BAND_SERVICE, CURRENT_TIME_CHAR)?,
            config: transport.get_characteristic(BAND_SERVICE, CONFIG_CHAR)?,
            user_settings: transport.get_characteristic(BAND_SERVICE, USER_SETTINGS_CHAR)?,
            hr_control: transport.get_characteristic(HEART_RATE_SERVICE, HR_CONTROL_CHAR)?,
            hr_measurement: transport.get_characteristic(HEART_RATE_SERVICE, HR_MEASUREMENT_CHAR)?,
            alert_level: transport.get_characteristic(IMMEDIATE_ALERT_SERVICE, ALERT_LEVEL_CHAR)?,
            hardware_revision: transport.get_characteristic(DEVICE_INFO_SERVICE, HARDWARE_REVISION_CHAR)?,
            firmware_revision: transport.get_characteristic(DEVICE_INFO_SERVICE, FIRMWARE_REVISION_CHAR)?,
            pnp_id: transport.get_characteristic(DEVICE_INFO_SERVICE, PNP_ID_CHAR)?,
        })
    }
}

/// One open link plus everything scoped to it
pub(crate) struct ActiveSession<L: Link> {
    device: PairedDevice,
    transport: TransportSession<L>,
    chars: OnceLock<BandCharacteristics>,
    /// FIFO: tokio's mutex hands the lock out in request order
    queue: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    /// Set while a `HeartRateMonitor` owns the heart-rate endpoints
    streaming: AtomicBool,
}

impl<L: Link> ActiveSession<L> {
    fn new(device: PairedDevice, transport: TransportSession<L>) -> Self {
        Self {
            device,
            transport,
            chars: OnceLock::new(),
            queue: tokio::sync::Mutex::new(()),
            watcher: Mutex::new(None),
            streaming: AtomicBool::new(false),
        }
    }

    pub(crate) fn transport(&self) -> &TransportSession<L> {
        &self.transport
    }

    /// Claim the heart-rate endpoints for continuous mode; false if already claimed
    fn begin_streaming(&self) -> bool {
        !self.streaming.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn end_streaming(&self) {
        self.streaming.store(false, Ordering::SeqCst);
    }

    fn ensure_not_streaming(&self) -> Result<(), BandError> {
        if self.streaming.load(Ordering::SeqCst) {
            return Err(BandError::InvalidArgument(
                "continuous heart rate is running, stop it first".to_string(),
            ));
        }
        Ok(())
    }

    fn chars(&self) -> Result<BandCharacteristics, BandError> {
        self.chars.get().copied().ok_or(BandError::NotAuthenticated)
    }

    /// Run `op` as the only exchange in flight on this session, bounded by `timeout`
    pub(crate) async fn exchange<T>(
        &self,
        command: &'static str,
        timeout: Duration,
        op: impl Future<Output = Result<T, BandError>>,
    ) -> Result<T, BandError> {
        let _turn = self.queue.lock().await;
        debug!(command, "Exchange");
        tokio::time::timeout(timeout, op)
            .await
            .map_err(|_| BandError::CommandTimeout { command, timeout })?
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Bytes, BandError> {
        self.transport.read(&characteristic).await
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), BandError> {
        self.transport.write(&characteristic, data).await
    }

    async fn close(&self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Link did not close cleanly");
        }
    }
}

/// Client for one band at a time
pub struct BandClient<R: Radio> {
    radio: R,
    registry: Arc<dyn DeviceRegistry>,
    config: BandConfig,
    state: Arc<watch::Sender<SessionState>>,
    session: Mutex<Option<Arc<ActiveSession<R::Link>>>>,
    /// Serializes `connect` calls
    connecting: tokio::sync::Mutex<()>,
    /// Bumped by every connect and disconnect; a connect whose epoch moved was cancelled
    epoch: AtomicU64,
}

impl<R: Radio> BandClient<R> {
    /// Fails with `InvalidArgument` when `config` does not validate
    pub fn new(radio: R, registry: Arc<dyn DeviceRegistry>, config: BandConfig) -> Result<Self, BandError> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        Ok(Self {
            radio,
            registry,
            config,
            state: Arc::new(state),
            session: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BandConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn DeviceRegistry> {
        &self.registry
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Address of the band behind the current session, if any
    pub fn hardware_address(&self) -> Option<HardwareAddress> {
        self.session.lock().as_ref().map(|session| session.transport.address())
    }

    /// Record of the band behind the current session, if any
    pub fn connected_device(&self) -> Option<PairedDevice> {
        self.session.lock().as_ref().map(|session| session.device.clone())
    }

    fn enter(&self, state: SessionState, observer: &impl ConnectionObserver) {
        info!(%state, "Session state");
        self.state.send_replace(state);
        observer.on_state(state);
    }

    // --- Lifecycle ---

    /// Connect and authenticate. Resolves only once the session is `Authenticated`.
    pub async fn connect<O: ConnectionObserver>(&self, device: &PairedDevice, observer: O) -> Result<(), BandError> {
        let _connecting = self.connecting.lock().await;
        let (epoch, previous) = self.retire();
        if let Some(previous) = previous {
            info!(address = %previous.transport.address(), "Replacing existing session");
            previous.close().await;
        }

        self.enter(SessionState::Connecting, &observer);
        let established = self
            .establish(device, epoch, &observer)
            .await
            .and_then(|()| self.commit(epoch));
        match established {
            Ok(()) => {
                info!(nickname = %device.nickname, address = %device.hardware_address, "Band connected");
                observer.on_state(SessionState::Authenticated);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Connect failed");
                // a moved epoch means disconnect() already tore the attempt down
                let (current, session) = {
                    let mut slot = self.session.lock();
                    if self.epoch.load(Ordering::SeqCst) == epoch {
                        (true, slot.take())
                    } else {
                        (false, None)
                    }
                };
                if let Some(session) = session {
                    session.close().await;
                }
                if current {
                    self.enter(SessionState::Error, &observer);
                }
                Err(e)
            }
        }
    }

    /// Publish `Authenticated`, unless disconnect() moved the epoch or the link
    /// died after the handshake
    fn commit(&self, epoch: u64) -> Result<(), BandError> {
        let slot = self.session.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(cancelled());
        }
        let lost = slot.as_ref().and_then(|session| session.transport.close_reason());
        if let Some(reason) = lost {
            return Err(reason.into_error());
        }
        self.state.send_replace(SessionState::Authenticated);
        Ok(())
    }

    async fn establish(
        &self,
        device: &PairedDevice,
        epoch: u64,
        observer: &impl ConnectionObserver,
    ) -> Result<(), BandError> {
        let authenticator = Authenticator::new(&device.auth_key);
        let target = self.resolve_target(device).await?;
        let transport = TransportSession::connect(&self.radio, &target, self.config.connect_timeout).await?;
        let session = Arc::new(ActiveSession::new(device.clone(), transport));

        let installed = {
            let mut slot = self.session.lock();
            if self.epoch.load(Ordering::SeqCst) == epoch {
                *slot = Some(session.clone());
                true
            } else {
                false
            }
        };
        if !installed {
            session.close().await;
            return Err(cancelled());
        }

        let found = session.transport.address();
        if found != device.hardware_address {
            return Err(BandError::WrongDevice {
                expected: device.hardware_address.to_string(),
                found: found.to_string(),
            });
        }

        self.enter(SessionState::AwaitingService, observer);
        let timeout = self.config.command_timeout;
        tokio::time::timeout(timeout, session.transport.discover())
            .await
            .map_err(|_| BandError::CommandTimeout {
                command: "discover_services",
                timeout,
            })??;
        let chars = BandCharacteristics::resolve(&session.transport)?;
        let chars = *session.chars.get_or_init(|| chars);

        self.enter(SessionState::Authenticating, observer);
        authenticator
            .handshake(&session.transport, &chars.auth, self.config.auth_timeout)
            .await?;

        *session.watcher.lock() = Some(self.spawn_link_watcher(&session));
        Ok(())
    }

    /// Prefer the stored platform handle, then any handle for the same address
    /// (re-issued into the registry), then the bare address
    async fn resolve_target(&self, device: &PairedDevice) -> Result<PeripheralTarget, BandError> {
        let authorized = self.radio.authorized_peripherals().await?;
        let stored = device
            .transport_handle_id
            .as_ref()
            .filter(|handle_id| authorized.iter().any(|peripheral| &peripheral.handle_id == *handle_id));
        if let Some(handle_id) = stored {
            debug!(%handle_id, "Reconnecting through stored handle");
            return Ok(PeripheralTarget::Handle(handle_id.clone()));
        }

        if let Some(peripheral) = authorized
            .iter()
            .find(|peripheral| peripheral.address == device.hardware_address)
        {
            info!(
                address = %device.hardware_address,
                handle_id = %peripheral.handle_id,
                "Platform re-issued the band's authorization"
            );
            self.registry.update(
                device.id,
                DeviceUpdate {
                    transport_handle_id: Some(peripheral.handle_id.clone()),
                    ..Default::default()
                },
            )?;
            return Ok(PeripheralTarget::Handle(peripheral.handle_id.clone()));
        }

        debug!(address = %device.hardware_address, "No authorized handle, targeting address");
        Ok(PeripheralTarget::Address(device.hardware_address))
    }

    fn spawn_link_watcher(&self, session: &ActiveSession<R::Link>) -> JoinHandle<()> {
        let closed = session.transport.on_close();
        let state = self.state.clone();
        tokio::spawn(async move {
            if let CloseReason::LinkLost(reason) = closed.await {
                warn!(%reason, "Session lost its link");
                state.send_replace(SessionState::Error);
            }
        })
    }

    /// Take the current session out of the slot and move the epoch on
    fn retire(&self) -> (u64, Option<Arc<ActiveSession<R::Link>>>) {
        let mut slot = self.session.lock();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        (epoch, slot.take())
    }

    /// Tear the session down from any state. Pending operations fail. Idempotent.
    pub async fn disconnect(&self) {
        let (_, previous) = self.retire();
        if let Some(session) = previous {
            info!(address = %session.transport.address(), "Disconnecting");
            session.close().await;
        }
        self.state.send_replace(SessionState::Disconnected);
    }

    /// Fresh handshake on the open link, discarding any earlier challenge
    pub async fn reauthenticate(&self) -> Result<(), BandError> {
        let session = self.session.lock().clone().ok_or(BandError::NotAuthenticated)?;
        let chars = session.chars()?;
        let authenticator = Authenticator::new(&session.device.auth_key);
        self.state.send_replace(SessionState::Authenticating);
        let result = session
            .exchange(
                "reauthenticate",
                self.config.auth_timeout,
                authenticator.handshake(&session.transport, &chars.auth, self.config.auth_timeout),
            )
            .await
            .map_err(|e| match e {
                BandError::CommandTimeout { timeout, .. } => BandError::AuthenticationTimeout(timeout),
                other => other,
            });
        let next = if result.is_ok() {
            SessionState::Authenticated
        } else {
            SessionState::Error
        };
        self.set_if_current(&session, next);
        result
    }

    // --- Pairing and records ---

    /// Let the user pick a band and store it under `nickname` with `key_hex`
    pub async fn pair(&self, nickname: &str, key_hex: &str) -> Result<PairedDevice, BandError> {
        let auth_key = AuthKey::from_hex(key_hex)?;
        let peripheral = self.radio.request_peripheral().await?;
        info!(address = %peripheral.address, "Band selected for pairing");
        let nickname = if nickname.is_empty() {
            peripheral.name.clone().unwrap_or_else(|| peripheral.address.to_string())
        } else {
            nickname.to_string()
        };
        self.registry.create(NewPairedDevice {
            nickname,
            hardware_address: peripheral.address,
            auth_key,
            transport_handle_id: Some(peripheral.handle_id),
        })
    }

    /// Disconnect if live, revoke the platform authorization, delete the record
    pub async fn forget(&self, device: &PairedDevice) -> Result<(), BandError> {
        let live = self
            .session
            .lock()
            .as_ref()
            .is_some_and(|session| session.device.id == device.id);
        if live {
            self.disconnect().await;
        }
        if let Some(handle_id) = &device.transport_handle_id {
            self.radio.revoke(handle_id).await?;
        }
        self.registry.remove(device.id)?;
        info!(nickname = %device.nickname, "Band forgotten");
        Ok(())
    }

    // --- Command plumbing ---

    fn active(&self) -> Result<Arc<ActiveSession<R::Link>>, BandError> {
        let session = self.session.lock().clone().ok_or(BandError::NotAuthenticated)?;
        self.ensure_authenticated()?;
        Ok(session)
    }

    fn ensure_authenticated(&self) -> Result<(), BandError> {
        match *self.state.borrow() {
            SessionState::Authenticated => Ok(()),
            _ => Err(BandError::NotAuthenticated),
        }
    }

    fn set_if_current(&self, session: &Arc<ActiveSession<R::Link>>, state: SessionState) {
        let slot = self.session.lock();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, session)) {
            self.state.send_replace(state);
        }
    }

    /// A transport failure not caused by our own disconnect marks the session dead
    fn note_failure<T>(&self, session: &Arc<ActiveSession<R::Link>>, result: &Result<T, BandError>) {
        let Err(BandError::Transport(reason)) = result else {
            return;
        };
        if session.transport.close_reason() != Some(CloseReason::Host) {
            warn!(%reason, "Transport failure, session marked as failed");
            self.set_if_current(session, SessionState::Error);
        }
    }

    /// One queued, bounded request/response exchange
    async fn exchange<T>(
        &self,
        session: &Arc<ActiveSession<R::Link>>,
        command: &'static str,
        op: impl Future<Output = Result<T, BandError>>,
    ) -> Result<T, BandError> {
        let result = session
            .exchange(command, self.config.command_timeout, async {
                // the state may have moved while this command waited its turn
                self.ensure_authenticated()?;
                op.await
            })
            .await;
        self.note_failure(session, &result);
        result
    }

    fn check_device(&self, session: &ActiveSession<R::Link>, device: &PairedDevice) -> Result<(), BandError> {
        if session.device.id != device.id {
            return Err(BandError::WrongDevice {
                expected: device.hardware_address.to_string(),
                found: session.device.hardware_address.to_string(),
            });
        }
        Ok(())
    }

    // --- Feature commands ---

    pub async fn get_device_info(&self) -> Result<DeviceInfo, BandError> {
        let session = self.active()?;
        let chars = session.chars()?;
        let (hardware, firmware, pnp) = self
            .exchange(&session, "device_info", async {
                let hardware = session.read(chars.hardware_revision).await?;
                let firmware = session.read(chars.firmware_revision).await?;
                let pnp = session.read(chars.pnp_id).await?;
                Ok((hardware, firmware, pnp))
            })
            .await?;
        DeviceInfo::decode(&hardware, &firmware, &pnp)
    }

    pub async fn get_battery_level(&self) -> Result<BatteryInfo, BandError> {
        let session = self.active()?;
        let chars = session.chars()?;
        let frame = self.exchange(&session, "battery", session.read(chars.battery)).await?;
        BatteryInfo::decode(&frame)
    }

    pub async fn get_current_status(&self) -> Result<ActivityStatus, BandError> {
        let session = self.active()?;
        let chars = session.chars()?;
        let frame = self.exchange(&session, "status", session.read(chars.status)).await?;
        ActivityStatus::decode(&frame)
    }

    pub async fn get_current_time(&self) -> Result<NaiveDateTime, BandError> {
        let session = self.active()?;
        let chars = session.chars()?;
        let frame = self.exchange(&session, "get_time", session.read(chars.current_time)).await?;
        decode_time(&frame)
    }

    pub async fn set_current_time(&self, time: &NaiveDateTime) -> Result<(), BandError> {
        let frame = encode_time(time)?;
        let session = self.active()?;
        let chars = session.chars()?;
        self.exchange(&session, "set_time", session.write(chars.current_time, &frame))
            .await
    }

    /// Make the band vibrate
    pub async fn send_find_me_alert(&self) -> Result<(), BandError> {
        let session = self.active()?;
        let chars = session.chars()?;
        self.exchange(
            &session,
            "find_me",
            session.write(chars.alert_level, &[AlertLevel::High.into()]),
        )
        .await
    }

    pub async fn set_activity_goal(&self, steps: u32) -> Result<(), BandError> {
        let session = self.active()?;
        let chars = session.chars()?;
        self.exchange(
            &session,
            "activity_goal",
            session.write(chars.user_settings, &encode_goal_frame(steps)),
        )
        .await
    }

    pub async fn set_goal_notifications(&self, enabled: bool) -> Result<(), BandError> {
        let session = self.active()?;
        let chars = session.chars()?;
        self.exchange(
            &session,
            "goal_notifications",
            session.write(chars.config, &encode_goal_notifications_frame(enabled)),
        )
        .await
    }

    /// Push one alarm into band slot `index`
    pub async fn set_alarm(&self, index: u8, alarm: &Alarm) -> Result<(), BandError> {
        let frame = encode_alarm_frame(index, alarm)?;
        let session = self.active()?;
        let chars = session.chars()?;
        self.exchange(&session, "alarm", session.write(chars.config, &frame)).await
    }

    /// Push goal settings to the connected band, then store them on its record
    pub async fn save_goal_settings(&self, device: &PairedDevice, steps: u32, notify: bool) -> Result<(), BandError> {
        let session = self.active()?;
        self.check_device(&session, device)?;
        self.set_activity_goal(steps).await?;
        self.set_goal_notifications(notify).await?;
        self.registry.update(
            device.id,
            DeviceUpdate {
                activity_goal: Some(steps),
                goal_notifications: Some(notify),
                ..Default::default()
            },
        )
    }

    /// Replace every alarm slot on the connected band, then store the list.
    /// Slots past the end of `alarms` are written disabled.
    pub async fn save_alarms(&self, device: &PairedDevice, alarms: &[Alarm]) -> Result<(), BandError> {
        validate_alarms(alarms)?;
        let session = self.active()?;
        self.check_device(&session, device)?;
        let cleared = Alarm {
            enabled: false,
            ..Alarm::new(0, 0)
        };
        for index in 0..MAX_ALARMS {
            let alarm = alarms.get(index).unwrap_or(&cleared);
            self.set_alarm(index as u8, alarm).await?;
        }
        self.registry.update(
            device.id,
            DeviceUpdate {
                alarms: Some(alarms.to_vec()),
                ..Default::default()
            },
        )
    }

    // --- Heart rate ---

    /// Take one measurement. Every reading before the final one goes to `on_progress`.
    pub async fn measure_heart_rate_once<F>(&self, mut on_progress: F) -> Result<HeartRateReading, BandError>
    where
        F: FnMut(HeartRateReading) + Send,
    {
        let session = self.active()?;
        let chars = session.chars()?;
        // the measurement switches continuous mode off on the band
        session.ensure_not_streaming()?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self
            .exchange(
                &session,
                "heart_rate_subscribe",
                session.transport.subscribe(&chars.hr_measurement, move |value| {
                    let _ = tx.send(value);
                }),
            )
            .await?;

        let outcome = self.collect_measurement(&session, &chars, &mut rx, &mut on_progress).await;
        if outcome.is_err() && session.transport.is_connected() {
            let stopped = session
                .exchange(
                    "heart_rate_stop",
                    self.config.command_timeout,
                    session.write(chars.hr_control, HeartRateControl::Stop.encode()),
                )
                .await;
            if let Err(e) = stopped {
                warn!(error = %e, "Could not abort heart-rate measurement");
            }
        }
        let released = session
            .exchange(
                "heart_rate_unsubscribe",
                self.config.command_timeout,
                session.transport.unsubscribe(subscription),
            )
            .await;
        let reading = outcome?;
        released?;
        info!(bpm = reading.bpm, "Heart rate measured");
        Ok(reading)
    }

    async fn collect_measurement(
        &self,
        session: &Arc<ActiveSession<R::Link>>,
        chars: &BandCharacteristics,
        rx: &mut mpsc::UnboundedReceiver<Bytes>,
        on_progress: &mut (impl FnMut(HeartRateReading) + Send),
    ) -> Result<HeartRateReading, BandError> {
        self.exchange(session, "heart_rate_start", async {
            session
                .write(chars.hr_control, HeartRateControl::ContinuousOff.encode())
                .await?;
            session.write(chars.hr_control, HeartRateControl::Stop.encode()).await?;
            session.write(chars.hr_control, HeartRateControl::Ping.encode()).await
        })
        .await?;

        let mut tracker = StabilityTracker::new(self.config.stable_readings, self.config.stable_tolerance_bpm);
        let limit = self.config.measurement_timeout;
        let settle = async {
            while let Some(value) = rx.recv().await {
                let frame = match HeartRateFrame::decode(&value) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, bytes = hex::encode(&value), "Dropping heart-rate frame");
                        continue;
                    }
                };
                let reading = HeartRateReading::now(frame.bpm);
                if tracker.push(frame.bpm) {
                    return Ok(reading);
                }
                debug!(bpm = frame.bpm, "Heart-rate progress");
                on_progress(reading);
            }
            Err(session
                .transport
                .close_reason()
                .map(CloseReason::into_error)
                .unwrap_or_else(|| BandError::Transport("heart-rate notifications ended".to_string())))
        };

        let result = match tokio::time::timeout(limit, settle).await {
            Ok(result) => result,
            Err(_) => {
                warn!(?limit, "No stable heart rate");
                Err(BandError::MeasurementTimeout(limit))
            }
        };
        self.note_failure(session, &result);
        result
    }

    /// Stream readings to `on_reading` until the returned monitor is stopped
    pub async fn start_continuous_heart_rate<F>(&self, on_reading: F) -> Result<HeartRateMonitor<R::Link>, BandError>
    where
        F: Fn(HeartRateReading) + Send + Sync + 'static,
    {
        let session = self.active()?;
        let chars = session.chars()?;
        if !session.begin_streaming() {
            return Err(BandError::InvalidArgument("continuous heart rate is already running".to_string()));
        }
        let started = self.enable_continuous(&session, &chars, on_reading).await;
        if started.is_err() {
            session.end_streaming();
        }
        started
    }

    async fn enable_continuous<F>(
        &self,
        session: &Arc<ActiveSession<R::Link>>,
        chars: &BandCharacteristics,
        on_reading: F,
    ) -> Result<HeartRateMonitor<R::Link>, BandError>
    where
        F: Fn(HeartRateReading) + Send + Sync + 'static,
    {
        let stopped = Arc::new(AtomicBool::new(false));
        let gate = stopped.clone();
        let subscription = self
            .exchange(
                session,
                "heart_rate_subscribe",
                session.transport.subscribe(&chars.hr_measurement, move |value| {
                    if gate.load(Ordering::SeqCst) {
                        return;
                    }
                    match HeartRateFrame::decode(&value) {
                        Ok(frame) => on_reading(HeartRateReading::now(frame.bpm)),
                        Err(e) => warn!(error = %e, bytes = hex::encode(&value), "Dropping heart-rate frame"),
                    }
                }),
            )
            .await?;

        self.exchange(
            session,
            "heart_rate_continuous_on",
            session.write(chars.hr_control, HeartRateControl::ContinuousOn.encode()),
        )
        .await?;

        Ok(HeartRateMonitor::start(
            session.clone(),
            chars.hr_control,
            stopped,
            subscription,
            self.config.keepalive_interval,
            self.config.command_timeout,
        ))
    }
}

fn cancelled() -> BandError {
    BandError::Transport("connect cancelled by disconnect".to_string())
}
