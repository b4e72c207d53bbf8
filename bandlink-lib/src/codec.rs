//! Fixed-layout frames spoken by the band
//!
//! Every decoder checks the exact frame length first and fails with
//! [`BandError::MalformedFrame`] instead of truncating or padding. Multi-byte
//! integers are little-endian throughout.
//!
//! # Layouts
//!
//! | Frame        | Size | Layout                                                              |
//! |--------------|------|---------------------------------------------------------------------|
//! | Time         | 9    | year u16, month, day, hour, minute, second, weekday, 0x00           |
//! | Battery      | 20   | 0x0F, level, charging, last_off\[8\], last_charge\[8\], last_level  |
//! | Status       | 13   | 0x0C, steps u32, meters u32, calories u32                           |
//! | PnP ID       | 7    | vendor source, vendor id u16, product id u16, product version u16   |
//! | Alarm        | 5    | 0x02, enabled<<7 \| slot, hour, minute, repetition                  |
//! | Heart rate   | 2    | flags, bpm                                                          |

use crate::constants::*;
use crate::error::BandError;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use modular_bitfield::prelude::*;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

fn expect_len(bytes: &[u8], expected: usize, frame: &str) -> Result<(), BandError> {
    if bytes.len() != expected {
        return Err(BandError::MalformedFrame(format!(
            "{frame} frame must be {expected} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}

fn parse<T: FromBytes + KnownLayout + Immutable + Copy>(bytes: &[u8], frame: &str) -> Result<T, BandError> {
    T::ref_from_bytes(bytes)
        .copied()
        .map_err(|_| BandError::MalformedFrame(format!("Failed to parse {frame} frame")))
}

// --- Auth key ---

/// 16-byte pre-shared secret, written down as 32 hex characters.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AuthKey([u8; AUTH_KEY_SIZE]);

impl AuthKey {
    /// Parse a key from exactly 32 hex characters.
    pub fn from_hex(text: &str) -> Result<Self, BandError> {
        if text.len() != AUTH_KEY_SIZE * 2 {
            return Err(BandError::InvalidKeyFormat(format!(
                "expected {} hex characters, got {}",
                AUTH_KEY_SIZE * 2,
                text.chars().count()
            )));
        }
        let mut bytes = [0u8; AUTH_KEY_SIZE];
        hex::decode_to_slice(text, &mut bytes).map_err(|e| BandError::InvalidKeyFormat(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; AUTH_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthKey(<redacted>)")
    }
}

impl FromStr for AuthKey {
    type Err = BandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for AuthKey {
    type Error = BandError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<AuthKey> for String {
    fn from(key: AuthKey) -> Self {
        key.to_hex()
    }
}

/// Validate a hex key string and return its 16 raw bytes.
pub fn encode_auth_key(text: &str) -> Result<[u8; AUTH_KEY_SIZE], BandError> {
    AuthKey::from_hex(text).map(|key| key.0)
}

// --- Timestamps ---

/// Date-time as embedded in battery frames (8 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct StampRaw {
    year: U16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    tz_quarters: u8, // ignored on read, written as 0
}

/// Current-time characteristic payload (9 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct TimeFrameRaw {
    year: U16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    weekday: u8, // 1 = Monday .. 7 = Sunday
    padding: u8,
}

fn year_u16(dt: &NaiveDateTime) -> Result<u16, BandError> {
    u16::try_from(dt.year()).map_err(|_| BandError::InvalidArgument(format!("year {} cannot be encoded", dt.year())))
}

fn build_datetime(year: u16, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Result<NaiveDateTime, BandError> {
    NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or_else(|| {
            BandError::MalformedFrame(format!(
                "invalid date {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            ))
        })
}

impl StampRaw {
    fn encode(stamp: Option<&NaiveDateTime>) -> Result<Self, BandError> {
        let Some(dt) = stamp else {
            return Ok(StampRaw::new_zeroed());
        };
        Ok(StampRaw {
            year: U16::new(year_u16(dt)?),
            month: dt.month() as u8,
            day: dt.day() as u8,
            hour: dt.hour() as u8,
            minute: dt.minute() as u8,
            second: dt.second() as u8,
            tz_quarters: 0,
        })
    }

    fn decode(&self) -> Result<Option<NaiveDateTime>, BandError> {
        if self.as_bytes().iter().all(|&b| b == 0) {
            return Ok(None);
        }
        build_datetime(self.year.get(), self.month, self.day, self.hour, self.minute, self.second).map(Some)
    }
}

/// Pack a date-time into the band's current-time layout.
pub fn encode_time(dt: &NaiveDateTime) -> Result<[u8; TIME_FRAME_SIZE], BandError> {
    let raw = TimeFrameRaw {
        year: U16::new(year_u16(dt)?),
        month: dt.month() as u8,
        day: dt.day() as u8,
        hour: dt.hour() as u8,
        minute: dt.minute() as u8,
        second: dt.second() as u8,
        weekday: dt.weekday().number_from_monday() as u8,
        padding: 0,
    };
    let mut out = [0u8; TIME_FRAME_SIZE];
    out.copy_from_slice(raw.as_bytes());
    Ok(out)
}

/// Inverse of [`encode_time`]. The weekday byte is informational and not cross-checked.
pub fn decode_time(bytes: &[u8]) -> Result<NaiveDateTime, BandError> {
    expect_len(bytes, TIME_FRAME_SIZE, "time")?;
    let raw: TimeFrameRaw = parse(bytes, "time")?;
    build_datetime(raw.year.get(), raw.month, raw.day, raw.hour, raw.minute, raw.second)
}

// --- Battery ---

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct BatteryFrameRaw {
    header: u8,
    level: u8,
    charging: u8,
    last_off: StampRaw,
    last_charge: StampRaw,
    last_level: u8,
}

/// Battery state as reported by the band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatteryInfo {
    /// Charge level in percent (0-100)
    pub level: u8,
    pub is_charging: bool,
    /// Level at the end of the last charge
    pub last_level: u8,
    pub last_charge: Option<NaiveDateTime>,
    pub last_off: Option<NaiveDateTime>,
}

impl BatteryInfo {
    pub fn encode(&self) -> Result<[u8; BATTERY_FRAME_SIZE], BandError> {
        if self.level > 100 || self.last_level > 100 {
            return Err(BandError::InvalidArgument(format!(
                "battery levels must be 0-100, got {}/{}",
                self.level, self.last_level
            )));
        }
        let raw = BatteryFrameRaw {
            header: BATTERY_FRAME_HEADER,
            level: self.level,
            charging: self.is_charging as u8,
            last_off: StampRaw::encode(self.last_off.as_ref())?,
            last_charge: StampRaw::encode(self.last_charge.as_ref())?,
            last_level: self.last_level,
        };
        let mut out = [0u8; BATTERY_FRAME_SIZE];
        out.copy_from_slice(raw.as_bytes());
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BandError> {
        expect_len(bytes, BATTERY_FRAME_SIZE, "battery")?;
        let raw: BatteryFrameRaw = parse(bytes, "battery")?;
        if raw.header != BATTERY_FRAME_HEADER {
            return Err(BandError::MalformedFrame(format!(
                "battery frame header {:#04x}, expected {:#04x}",
                raw.header, BATTERY_FRAME_HEADER
            )));
        }
        if raw.level > 100 || raw.last_level > 100 {
            return Err(BandError::MalformedFrame(format!(
                "battery level out of range: {}/{}",
                raw.level, raw.last_level
            )));
        }
        Ok(Self {
            level: raw.level,
            is_charging: raw.charging != 0,
            last_level: raw.last_level,
            last_charge: raw.last_charge.decode()?,
            last_off: raw.last_off.decode()?,
        })
    }
}

// --- Activity status ---

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct StatusFrameRaw {
    header: u8,
    steps: U32,
    meters: U32,
    calories: U32,
}

/// Today's activity counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ActivityStatus {
    pub steps: u32,
    pub meters: u32,
    pub calories: u32,
}

impl ActivityStatus {
    pub fn encode(&self) -> [u8; STATUS_FRAME_SIZE] {
        let raw = StatusFrameRaw {
            header: STATUS_FRAME_HEADER,
            steps: U32::new(self.steps),
            meters: U32::new(self.meters),
            calories: U32::new(self.calories),
        };
        let mut out = [0u8; STATUS_FRAME_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BandError> {
        expect_len(bytes, STATUS_FRAME_SIZE, "status")?;
        let raw: StatusFrameRaw = parse(bytes, "status")?;
        if raw.header != STATUS_FRAME_HEADER {
            return Err(BandError::MalformedFrame(format!(
                "status frame header {:#04x}, expected {:#04x}",
                raw.header, STATUS_FRAME_HEADER
            )));
        }
        Ok(Self {
            steps: raw.steps.get(),
            meters: raw.meters.get(),
            calories: raw.calories.get(),
        })
    }
}

// --- Device information ---

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct PnpIdRaw {
    vendor_id_source: u8,
    vendor_id: U16,
    product_id: U16,
    product_version: U16,
}

/// Identity of the band, assembled from the Device Information service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceInfo {
    pub hardware_revision: String,
    pub firmware_version: String,
    /// 1 = Bluetooth SIG assigned, 2 = USB-IF assigned
    pub vendor_id_source: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_version: u16,
}

/// The three characteristic payloads a [`DeviceInfo`] is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoFrames {
    pub hardware_revision: Vec<u8>,
    pub firmware_version: Vec<u8>,
    pub pnp_id: [u8; PNP_ID_FRAME_SIZE],
}

/// Revision strings are NUL-padded by some firmwares
fn revision_string(bytes: &[u8]) -> String {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..len]).trim().to_string()
}

impl DeviceInfo {
    pub fn decode(hardware_revision: &[u8], firmware_version: &[u8], pnp_id: &[u8]) -> Result<Self, BandError> {
        expect_len(pnp_id, PNP_ID_FRAME_SIZE, "PnP ID")?;
        let pnp: PnpIdRaw = parse(pnp_id, "PnP ID")?;
        Ok(Self {
            hardware_revision: revision_string(hardware_revision),
            firmware_version: revision_string(firmware_version),
            vendor_id_source: pnp.vendor_id_source,
            vendor_id: pnp.vendor_id.get(),
            product_id: pnp.product_id.get(),
            product_version: pnp.product_version.get(),
        })
    }

    pub fn encode(&self) -> DeviceInfoFrames {
        let pnp = PnpIdRaw {
            vendor_id_source: self.vendor_id_source,
            vendor_id: U16::new(self.vendor_id),
            product_id: U16::new(self.product_id),
            product_version: U16::new(self.product_version),
        };
        let mut pnp_id = [0u8; PNP_ID_FRAME_SIZE];
        pnp_id.copy_from_slice(pnp.as_bytes());
        DeviceInfoFrames {
            hardware_revision: self.hardware_revision.as_bytes().to_vec(),
            firmware_version: self.firmware_version.as_bytes().to_vec(),
            pnp_id,
        }
    }
}

// --- Alarms ---

/// Second byte of an alarm frame
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlarmSlot {
    pub index: B7,
    pub enabled: bool,
}

/// One alarm as stored locally and pushed to the band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alarm {
    pub hour: u8,
    pub minute: u8,
    pub enabled: bool,
    /// Bit 0 = Monday .. bit 6 = Sunday; empty rings once
    pub repetition: u8,
}

impl Alarm {
    pub fn new(hour: u8, minute: u8) -> Self {
        Self {
            hour,
            minute,
            enabled: true,
            repetition: 0,
        }
    }

    pub fn repeating_on(mut self, days: &[Weekday]) -> Self {
        for day in days {
            self.repetition |= 1 << day.num_days_from_monday();
        }
        self
    }

    pub fn repeats_on(&self, day: Weekday) -> bool {
        self.repetition & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_one_shot(&self) -> bool {
        self.repetition == 0
    }

    pub fn validate(&self) -> Result<(), BandError> {
        if self.hour > 23 || self.minute > 59 {
            return Err(BandError::InvalidArgument(format!(
                "alarm time {:02}:{:02} is not a valid time of day",
                self.hour, self.minute
            )));
        }
        if self.repetition & ALARM_ONCE != 0 {
            return Err(BandError::InvalidArgument(format!(
                "alarm repetition mask {:#04x} has bits beyond Sunday",
                self.repetition
            )));
        }
        Ok(())
    }
}

pub fn encode_alarm_frame(index: u8, alarm: &Alarm) -> Result<[u8; ALARM_FRAME_SIZE], BandError> {
    if index as usize >= MAX_ALARMS {
        return Err(BandError::InvalidArgument(format!(
            "alarm slot {index} out of range (band has {MAX_ALARMS})"
        )));
    }
    alarm.validate()?;
    let slot = AlarmSlot::new().with_index(index).with_enabled(alarm.enabled);
    let repetition = if alarm.is_one_shot() { ALARM_ONCE } else { alarm.repetition };
    Ok([ALARM_COMMAND, slot.into_bytes()[0], alarm.hour, alarm.minute, repetition])
}

pub fn decode_alarm_frame(bytes: &[u8]) -> Result<(u8, Alarm), BandError> {
    expect_len(bytes, ALARM_FRAME_SIZE, "alarm")?;
    if bytes[0] != ALARM_COMMAND {
        return Err(BandError::MalformedFrame(format!("alarm frame opcode {:#04x}", bytes[0])));
    }
    let slot = AlarmSlot::from_bytes([bytes[1]]);
    let alarm = Alarm {
        hour: bytes[2],
        minute: bytes[3],
        enabled: slot.enabled(),
        repetition: if bytes[4] == ALARM_ONCE { 0 } else { bytes[4] & !ALARM_ONCE },
    };
    if slot.index() as usize >= MAX_ALARMS || alarm.validate().is_err() {
        return Err(BandError::MalformedFrame(format!("alarm frame out of range: {}", hex::encode(bytes))));
    }
    Ok((slot.index(), alarm))
}

// --- Goal settings ---

pub fn encode_goal_frame(steps: u32) -> [u8; 7] {
    let mut out = [GOAL_COMMAND, 0x00, 0x00, 0, 0, 0, 0];
    out[3..].copy_from_slice(&steps.to_le_bytes());
    out
}

pub fn decode_goal_frame(bytes: &[u8]) -> Result<u32, BandError> {
    expect_len(bytes, 7, "goal")?;
    if bytes[..3] != [GOAL_COMMAND, 0x00, 0x00] {
        return Err(BandError::MalformedFrame(format!("goal frame prefix {}", hex::encode(&bytes[..3]))));
    }
    Ok(u32::from_le_bytes((&bytes[3..7]).try_into()?))
}

pub fn encode_goal_notifications_frame(enabled: bool) -> [u8; 4] {
    let [a, b, c] = GOAL_NOTIFICATION_COMMAND;
    [a, b, c, enabled as u8]
}

pub fn decode_goal_notifications_frame(bytes: &[u8]) -> Result<bool, BandError> {
    expect_len(bytes, 4, "goal notification")?;
    if bytes[..3] != GOAL_NOTIFICATION_COMMAND {
        return Err(BandError::MalformedFrame(format!(
            "goal notification prefix {}",
            hex::encode(&bytes[..3])
        )));
    }
    Ok(bytes[3] != 0)
}

// --- Alerts ---

/// Immediate Alert service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AlertLevel {
    NoAlert = 0x00,
    Mild = 0x01,
    High = 0x02,
}

// --- Heart rate ---

/// Heart-rate control point commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum HeartRateControl {
    /// Abort a single measurement
    Stop,
    /// Start a single measurement
    Ping,
    ContinuousOn,
    ContinuousOff,
    /// Keeps continuous monitoring from timing out on the band
    KeepAlive,
}

impl HeartRateControl {
    pub fn encode(&self) -> &'static [u8] {
        match self {
            HeartRateControl::Stop => &[0x15, 0x02, 0x00],
            HeartRateControl::Ping => &[0x15, 0x02, 0x01],
            HeartRateControl::ContinuousOn => &[0x15, 0x01, 0x01],
            HeartRateControl::ContinuousOff => &[0x15, 0x01, 0x00],
            HeartRateControl::KeepAlive => &[0x16],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BandError> {
        match bytes {
            [0x15, 0x02, 0x00] => Ok(HeartRateControl::Stop),
            [0x15, 0x02, 0x01] => Ok(HeartRateControl::Ping),
            [0x15, 0x01, 0x01] => Ok(HeartRateControl::ContinuousOn),
            [0x15, 0x01, 0x00] => Ok(HeartRateControl::ContinuousOff),
            [0x16] => Ok(HeartRateControl::KeepAlive),
            other => Err(BandError::MalformedFrame(format!(
                "unknown heart-rate control frame {}",
                hex::encode(other)
            ))),
        }
    }
}

/// Flags byte of a heart-rate measurement notification
#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateFlags {
    pub wide_value: bool,
    pub contact_detected: bool,
    pub contact_supported: bool,
    pub energy_expended: bool,
    pub rr_intervals: bool,
    #[skip]
    unused: B3,
}

/// One heart-rate measurement notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateFrame {
    pub flags: HeartRateFlags,
    pub bpm: u8,
}

impl HeartRateFrame {
    pub fn new(bpm: u8) -> Self {
        Self {
            flags: HeartRateFlags::new(),
            bpm,
        }
    }

    pub fn encode(&self) -> [u8; HEART_RATE_FRAME_SIZE] {
        [self.flags.into_bytes()[0], self.bpm]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BandError> {
        expect_len(bytes, HEART_RATE_FRAME_SIZE, "heart rate")?;
        let flags = HeartRateFlags::from_bytes([bytes[0]]);
        if flags.wide_value() {
            return Err(BandError::MalformedFrame(
                "16-bit heart-rate values do not fit the 2-byte frame".to_string(),
            ));
        }
        if bytes[1] > MAX_BPM {
            return Err(BandError::MalformedFrame(format!(
                "heart rate {} above {MAX_BPM} bpm",
                bytes[1]
            )));
        }
        Ok(Self { flags, bpm: bytes[1] })
    }
}
