// GATT profile and frame constants for Mi-Band-style fitness bands
//
// The vendor characteristics share the base 0000XXXX-0000-3512-2118-0009af100700,
// everything else is a Bluetooth SIG 16-bit UUID on the standard base.

use uuid::Uuid;

const SIG_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;
const VENDOR_BASE: u128 = 0x0000_0000_0000_3512_2118_0009_af10_0700;

/// Expand a 16-bit Bluetooth SIG UUID onto the standard base
pub const fn sig_uuid(short: u16) -> Uuid {
    Uuid::from_u128(SIG_BASE | ((short as u128) << 96))
}

/// Expand a 16-bit vendor characteristic onto the band vendor base
pub const fn vendor_uuid(short: u16) -> Uuid {
    Uuid::from_u128(VENDOR_BASE | ((short as u128) << 96))
}

// --- Services ---

pub const BAND_SERVICE: Uuid = sig_uuid(0xFEE0);
pub const AUTH_SERVICE: Uuid = sig_uuid(0xFEE1);
pub const HEART_RATE_SERVICE: Uuid = sig_uuid(0x180D);
pub const DEVICE_INFO_SERVICE: Uuid = sig_uuid(0x180A);
pub const IMMEDIATE_ALERT_SERVICE: Uuid = sig_uuid(0x1802);

// --- Characteristics ---

pub const AUTH_CHAR: Uuid = vendor_uuid(0x0009);
pub const CONFIG_CHAR: Uuid = vendor_uuid(0x0003);
pub const BATTERY_CHAR: Uuid = vendor_uuid(0x0006);
pub const STATUS_CHAR: Uuid = vendor_uuid(0x0007);
pub const USER_SETTINGS_CHAR: Uuid = vendor_uuid(0x0008);
pub const CURRENT_TIME_CHAR: Uuid = sig_uuid(0x2A2B);
pub const HR_CONTROL_CHAR: Uuid = sig_uuid(0x2A39);
pub const HR_MEASUREMENT_CHAR: Uuid = sig_uuid(0x2A37);
pub const ALERT_LEVEL_CHAR: Uuid = sig_uuid(0x2A06);
pub const HARDWARE_REVISION_CHAR: Uuid = sig_uuid(0x2A27);
pub const FIRMWARE_REVISION_CHAR: Uuid = sig_uuid(0x2A26);
pub const PNP_ID_CHAR: Uuid = sig_uuid(0x2A50);

// --- Frame sizes ---

/// Size of the time frame (9 bytes)
pub const TIME_FRAME_SIZE: usize = 9;

/// Size of the battery frame (20 bytes)
pub const BATTERY_FRAME_SIZE: usize = 20;

/// Size of the activity status frame (13 bytes)
pub const STATUS_FRAME_SIZE: usize = 13;

/// Size of the PnP ID frame (7 bytes)
pub const PNP_ID_FRAME_SIZE: usize = 7;

/// Size of an alarm frame (5 bytes)
pub const ALARM_FRAME_SIZE: usize = 5;

/// Size of a heart-rate notification frame (flags + bpm)
pub const HEART_RATE_FRAME_SIZE: usize = 2;

/// Size of an auth key in bytes
pub const AUTH_KEY_SIZE: usize = 16;

/// Number of alarm slots on the band
pub const MAX_ALARMS: usize = 5;

/// Highest heart rate the band reports
pub const MAX_BPM: u8 = 250;

// --- Frame markers ---

pub const BATTERY_FRAME_HEADER: u8 = 0x0F;
pub const STATUS_FRAME_HEADER: u8 = 0x0C;
pub const ALARM_COMMAND: u8 = 0x02;
pub const GOAL_COMMAND: u8 = 0x10;
pub const GOAL_NOTIFICATION_COMMAND: [u8; 3] = [0x06, 0x06, 0x00];

/// Repetition byte sent for a one-shot alarm
pub const ALARM_ONCE: u8 = 0x80;
