//! Paired-device records
//!
//! The client never keeps persistent state of its own. It reads and writes
//! [`PairedDevice`] records through an injected [`DeviceRegistry`], and only
//! at pairing completion, reauthorization and settings-save points.

use crate::codec::{Alarm, AuthKey};
use crate::constants::MAX_ALARMS;
use crate::error::BandError;
use crate::transport::HardwareAddress;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One authorized band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    /// Assigned at creation, never changes
    pub id: u64,
    pub nickname: String,
    /// Identity of the physical band, fixed once paired
    pub hardware_address: HardwareAddress,
    /// Fixed once paired
    pub auth_key: AuthKey,
    /// Platform authorization handle; re-issued when the platform revokes it
    pub transport_handle_id: Option<String>,
    pub activity_goal: u32,
    pub goal_notifications: bool,
    /// At most [`MAX_ALARMS`], in band slot order
    pub alarms: Vec<Alarm>,
    pub date_added: DateTime<Utc>,
}

/// Fields supplied when a pairing completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPairedDevice {
    pub nickname: String,
    pub hardware_address: HardwareAddress,
    pub auth_key: AuthKey,
    pub transport_handle_id: Option<String>,
}

/// Partial update. Identity fields (id, address, key) are deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub nickname: Option<String>,
    pub transport_handle_id: Option<String>,
    pub activity_goal: Option<u32>,
    pub goal_notifications: Option<bool>,
    pub alarms: Option<Vec<Alarm>>,
}

impl DeviceUpdate {
    fn apply(self, device: &mut PairedDevice) -> Result<(), BandError> {
        if let Some(alarms) = &self.alarms {
            validate_alarms(alarms)?;
        }
        if let Some(nickname) = self.nickname {
            device.nickname = nickname;
        }
        if let Some(handle) = self.transport_handle_id {
            device.transport_handle_id = Some(handle);
        }
        if let Some(goal) = self.activity_goal {
            device.activity_goal = goal;
        }
        if let Some(enabled) = self.goal_notifications {
            device.goal_notifications = enabled;
        }
        if let Some(alarms) = self.alarms {
            device.alarms = alarms;
        }
        Ok(())
    }
}

pub fn validate_alarms(alarms: &[Alarm]) -> Result<(), BandError> {
    if alarms.len() > MAX_ALARMS {
        return Err(BandError::InvalidArgument(format!(
            "{} alarms given, the band holds {MAX_ALARMS}",
            alarms.len()
        )));
    }
    alarms.iter().try_for_each(Alarm::validate)
}

/// CRUD store for paired devices, shared by every session of an application
pub trait DeviceRegistry: Send + Sync {
    /// All records, oldest first
    fn list(&self) -> Result<Vec<PairedDevice>, BandError>;

    fn get(&self, id: u64) -> Result<PairedDevice, BandError> {
        self.list()?
            .into_iter()
            .find(|device| device.id == id)
            .ok_or_else(|| BandError::Registry(format!("no paired device with id {id}")))
    }

    fn create(&self, fields: NewPairedDevice) -> Result<PairedDevice, BandError>;

    fn update(&self, id: u64, update: DeviceUpdate) -> Result<(), BandError>;

    fn remove(&self, id: u64) -> Result<(), BandError>;
}

/// Versioned on-disk and in-memory layout shared by both registries
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    next_id: u64,
    devices: Vec<PairedDevice>,
}

const REGISTRY_FILE_VERSION: u32 = 1;

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_FILE_VERSION,
            next_id: 1,
            devices: Vec::new(),
        }
    }
}

impl RegistryFile {
    fn list(&self) -> Vec<PairedDevice> {
        let mut devices = self.devices.clone();
        devices.sort_by_key(|device| (device.date_added, device.id));
        devices
    }

    fn create(&mut self, fields: NewPairedDevice) -> Result<PairedDevice, BandError> {
        if self
            .devices
            .iter()
            .any(|device| device.hardware_address == fields.hardware_address)
        {
            return Err(BandError::Registry(format!(
                "band {} is already paired",
                fields.hardware_address
            )));
        }
        let device = PairedDevice {
            id: self.next_id,
            nickname: fields.nickname,
            hardware_address: fields.hardware_address,
            auth_key: fields.auth_key,
            transport_handle_id: fields.transport_handle_id,
            activity_goal: 0,
            goal_notifications: false,
            alarms: Vec::new(),
            date_added: Utc::now(),
        };
        self.next_id += 1;
        self.devices.push(device.clone());
        Ok(device)
    }

    fn find_mut(&mut self, id: u64) -> Result<&mut PairedDevice, BandError> {
        self.devices
            .iter_mut()
            .find(|device| device.id == id)
            .ok_or_else(|| BandError::Registry(format!("no paired device with id {id}")))
    }

    fn remove(&mut self, id: u64) -> Result<(), BandError> {
        let before = self.devices.len();
        self.devices.retain(|device| device.id != id);
        if self.devices.len() == before {
            return Err(BandError::Registry(format!("no paired device with id {id}")));
        }
        Ok(())
    }
}

/// Registry that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<RegistryFile>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceRegistry for MemoryRegistry {
    fn list(&self) -> Result<Vec<PairedDevice>, BandError> {
        Ok(self.records.lock().list())
    }

    fn create(&self, fields: NewPairedDevice) -> Result<PairedDevice, BandError> {
        self.records.lock().create(fields)
    }

    fn update(&self, id: u64, update: DeviceUpdate) -> Result<(), BandError> {
        update.apply(self.records.lock().find_mut(id)?)
    }

    fn remove(&self, id: u64) -> Result<(), BandError> {
        self.records.lock().remove(id)
    }
}

/// Registry persisted as a JSON file, rewritten on every change
#[derive(Debug)]
pub struct JsonFileRegistry {
    file_path: PathBuf,
    records: Mutex<RegistryFile>,
}

impl JsonFileRegistry {
    /// Open (or start) `paired_bands.json` under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, BandError> {
        std::fs::create_dir_all(data_dir)?;
        let file_path = data_dir.join("paired_bands.json");
        let records = Self::load(&file_path)?;
        info!(count = records.devices.len(), path = ?file_path, "Loaded paired bands");
        Ok(Self {
            file_path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn load(path: &Path) -> Result<RegistryFile, BandError> {
        if !path.exists() {
            debug!(?path, "Registry file missing, starting empty");
            return Ok(RegistryFile::default());
        }
        let content = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&content)?;
        if file.version != REGISTRY_FILE_VERSION {
            return Err(BandError::Registry(format!(
                "unsupported registry file version {} in {path:?}",
                file.version
            )));
        }
        Ok(file)
    }

    fn save(&self, records: &RegistryFile) -> Result<(), BandError> {
        let content = serde_json::to_string_pretty(records)?;
        // a crash mid-write must leave the previous file intact
        let tmp_path = self.file_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.file_path)?;
        debug!(count = records.devices.len(), "Saved paired bands");
        Ok(())
    }

    /// Apply `change` and persist; memory is left untouched when either step fails
    fn transact<T>(&self, change: impl FnOnce(&mut RegistryFile) -> Result<T, BandError>) -> Result<T, BandError> {
        let mut records = self.records.lock();
        let mut next = records.clone();
        let value = change(&mut next)?;
        self.save(&next)?;
        *records = next;
        Ok(value)
    }
}

impl DeviceRegistry for JsonFileRegistry {
    fn list(&self) -> Result<Vec<PairedDevice>, BandError> {
        Ok(self.records.lock().list())
    }

    fn create(&self, fields: NewPairedDevice) -> Result<PairedDevice, BandError> {
        self.transact(|records| records.create(fields))
    }

    fn update(&self, id: u64, update: DeviceUpdate) -> Result<(), BandError> {
        self.transact(|records| update.apply(records.find_mut(id)?))
    }

    fn remove(&self, id: u64) -> Result<(), BandError> {
        self.transact(|records| records.remove(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn band(last: u8) -> NewPairedDevice {
        NewPairedDevice {
            nickname: format!("band {last}"),
            hardware_address: HardwareAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]),
            auth_key: AuthKey::from_hex("000102030405060708090a0b0c0d0e0f").unwrap(),
            transport_handle_id: None,
        }
    }

    #[test]
    fn test_ids_are_unique_and_stable() {
        let registry = MemoryRegistry::new();
        let first = registry.create(band(1)).unwrap();
        let second = registry.create(band(2)).unwrap();
        assert_ne!(first.id, second.id);

        registry.remove(first.id).unwrap();
        let third = registry.create(band(3)).unwrap();
        assert_ne!(third.id, first.id);
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = MemoryRegistry::new();
        registry.create(band(1)).unwrap();
        assert!(matches!(registry.create(band(1)), Err(BandError::Registry(_))));
    }

    #[test]
    fn test_update_rejects_too_many_alarms() {
        let registry = MemoryRegistry::new();
        let device = registry.create(band(1)).unwrap();
        let update = DeviceUpdate {
            alarms: Some(vec![Alarm::new(7, 0); MAX_ALARMS + 1]),
            nickname: Some("renamed".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            registry.update(device.id, update),
            Err(BandError::InvalidArgument(_))
        ));
        assert_eq!(registry.get(device.id).unwrap().nickname, "band 1");
    }

    #[test]
    fn test_file_registry_persists() -> Result<(), BandError> {
        let temp_dir = TempDir::new()?;
        let id = {
            let registry = JsonFileRegistry::open(temp_dir.path())?;
            let device = registry.create(band(9))?;
            registry.update(
                device.id,
                DeviceUpdate {
                    activity_goal: Some(8000),
                    alarms: Some(vec![Alarm::new(6, 30)]),
                    ..Default::default()
                },
            )?;
            device.id
        };

        let reopened = JsonFileRegistry::open(temp_dir.path())?;
        let device = reopened.get(id)?;
        assert_eq!(device.activity_goal, 8000);
        assert_eq!(device.alarms, vec![Alarm::new(6, 30)]);
        assert_eq!(device.hardware_address.to_string(), "AA:BB:CC:DD:EE:09");
        Ok(())
    }

    #[test]
    fn test_interrupted_save_keeps_previous_file() -> Result<(), BandError> {
        let temp_dir = TempDir::new()?;
        let registry = JsonFileRegistry::open(temp_dir.path())?;
        let first = registry.create(band(1))?;

        // what a crash halfway through the next save leaves behind
        let tmp_path = temp_dir.path().join("paired_bands.json.tmp");
        std::fs::write(&tmp_path, "{\"version\": 1, \"devi")?;
        let reopened = JsonFileRegistry::open(temp_dir.path())?;
        assert_eq!(reopened.list()?, vec![first]);

        reopened.create(band(2))?;
        assert!(!tmp_path.exists());
        assert_eq!(JsonFileRegistry::open(temp_dir.path())?.list()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_file_registry_rejects_unknown_version() -> Result<(), BandError> {
        let temp_dir = TempDir::new()?;
        std::fs::write(
            temp_dir.path().join("paired_bands.json"),
            r#"{"version": 7, "next_id": 1, "devices": []}"#,
        )?;
        assert!(matches!(
            JsonFileRegistry::open(temp_dir.path()),
            Err(BandError::Registry(_))
        ));
        Ok(())
    }
}
