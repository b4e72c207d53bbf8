//! Real hardware backend on top of btleplug
//!
//! Desktop Bluetooth stacks have no per-site authorization, so peripherals
//! this radio has already seen stand in for "authorized" ones. The discovery
//! prompt is a timed scan that picks the first band advertising the band
//! service or a known band name.

use crate::constants::BAND_SERVICE;
use crate::error::BandError;
use crate::transport::{
    Characteristic, HardwareAddress, Link, LinkEvent, LinkEvents, PeripheralHandle, PeripheralTarget, Radio,
    ServiceInfo,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic as GattCharacteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures_lite::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BAND_NAMES: &[&str] = &["Mi Smart Band", "Mi Band", "Amazfit Band"];

/// First adapter of the platform manager
pub struct BtleRadio {
    adapter: Adapter,
    scan_duration: Duration,
    known: Mutex<HashMap<String, Peripheral>>,
}

impl BtleRadio {
    pub async fn new(scan_duration: Duration) -> Result<Self, BandError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BandError::DeviceUnavailable("no Bluetooth adapter found".to_string()))?;
        info!(adapter = %adapter.adapter_info().await?, "Using Bluetooth adapter");
        Ok(Self {
            adapter,
            scan_duration,
            known: Mutex::new(HashMap::new()),
        })
    }

    async fn describe(peripheral: &Peripheral) -> Result<Option<(PeripheralHandle, bool)>, BandError> {
        let Some(props) = peripheral.properties().await? else {
            return Ok(None);
        };
        let name = props.local_name;
        let is_band = props.services.contains(&BAND_SERVICE)
            || name
                .as_deref()
                .is_some_and(|name| BAND_NAMES.iter().any(|band| name.starts_with(band)));
        let handle = PeripheralHandle {
            handle_id: handle_id(peripheral),
            address: HardwareAddress::new(peripheral.address().into_inner()),
            name,
        };
        Ok(Some((handle, is_band)))
    }

    async fn scan(&self) -> Result<Vec<Peripheral>, BandError> {
        info!(duration = ?self.scan_duration, "Scanning for bands...");
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(self.scan_duration).await;
        let peripherals = self.adapter.peripherals().await?;
        self.adapter.stop_scan().await?;
        Ok(peripherals)
    }

    fn remember(&self, peripheral: &Peripheral) {
        self.known.lock().insert(handle_id(peripheral), peripheral.clone());
    }

    async fn locate(&self, target: &PeripheralTarget) -> Result<Peripheral, BandError> {
        if let PeripheralTarget::Handle(id) = target {
            let known = self.known.lock().get(id).cloned();
            if let Some(peripheral) = known {
                return Ok(peripheral);
            }
        }
        for peripheral in self.scan().await? {
            let found = match target {
                PeripheralTarget::Handle(id) => handle_id(&peripheral) == *id,
                PeripheralTarget::Address(address) => peripheral.address().into_inner() == *address.as_bytes(),
            };
            if found {
                self.remember(&peripheral);
                return Ok(peripheral);
            }
        }
        Err(BandError::DeviceUnavailable(format!("{target} not found while scanning")))
    }
}

fn handle_id(peripheral: &Peripheral) -> String {
    format!("{:?}", peripheral.id())
}

impl Radio for BtleRadio {
    type Link = BtleLink;

    async fn authorized_peripherals(&self) -> Result<Vec<PeripheralHandle>, BandError> {
        let known: Vec<Peripheral> = self.known.lock().values().cloned().collect();
        let mut handles = Vec::with_capacity(known.len());
        for peripheral in known {
            if let Some((handle, _)) = Self::describe(&peripheral).await? {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    async fn request_peripheral(&self) -> Result<PeripheralHandle, BandError> {
        for peripheral in self.scan().await? {
            if let Some((handle, true)) = Self::describe(&peripheral).await? {
                info!(address = %handle.address, name = ?handle.name, "Found band");
                self.remember(&peripheral);
                return Ok(handle);
            }
        }
        Err(BandError::DeviceUnavailable("no band found while scanning".to_string()))
    }

    async fn open(&self, target: &PeripheralTarget) -> Result<(BtleLink, LinkEvents), BandError> {
        let peripheral = self.locate(target).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut notifications = peripheral.notifications().await?;
        let mut central_events = self.adapter.events().await?;
        let peripheral_id = peripheral.id();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(notification) => {
                            let _ = tx.send(LinkEvent::Notification {
                                characteristic: notification.uuid,
                                value: Bytes::from(notification.value),
                            });
                        }
                        None => {
                            let _ = tx.send(LinkEvent::Disconnected {
                                reason: "notification stream ended".to_string(),
                            });
                            break;
                        }
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            let _ = tx.send(LinkEvent::Disconnected {
                                reason: "peripheral disconnected".to_string(),
                            });
                            break;
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }
        });

        let link = BtleLink {
            address: HardwareAddress::new(peripheral.address().into_inner()),
            handle_id: handle_id(&peripheral),
            peripheral,
            forwarder: Mutex::new(Some(forwarder)),
            closed: AtomicBool::new(false),
        };
        Ok((link, rx))
    }

    async fn revoke(&self, handle_id: &str) -> Result<(), BandError> {
        let forgotten = self.known.lock().remove(handle_id);
        if let Some(peripheral) = forgotten {
            if peripheral.is_connected().await? {
                peripheral.disconnect().await?;
            }
        }
        Ok(())
    }
}

/// One connection to a band over btleplug
pub struct BtleLink {
    peripheral: Peripheral,
    address: HardwareAddress,
    handle_id: String,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BtleLink {
    fn gatt(&self, characteristic: Characteristic) -> Result<GattCharacteristic, BandError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or(BandError::CharacteristicNotFound {
                service: characteristic.service,
                characteristic: characteristic.uuid,
            })
    }
}

impl Link for BtleLink {
    fn address(&self) -> HardwareAddress {
        self.address
    }

    fn handle_id(&self) -> String {
        self.handle_id.clone()
    }

    async fn discover_services(&self) -> Result<Vec<ServiceInfo>, BandError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Bytes, BandError> {
        let gatt = self.gatt(characteristic)?;
        Ok(Bytes::from(self.peripheral.read(&gatt).await?))
    }

    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), BandError> {
        let gatt = self.gatt(characteristic)?;
        self.peripheral.write(&gatt, data, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn set_notify(&self, characteristic: Characteristic, enabled: bool) -> Result<(), BandError> {
        let gatt = self.gatt(characteristic)?;
        if enabled {
            self.peripheral.subscribe(&gatt).await?;
        } else {
            self.peripheral.unsubscribe(&gatt).await?;
        }
        debug!(characteristic = %characteristic.uuid, enabled, "Notifications toggled");
        Ok(())
    }

    async fn close(&self) -> Result<(), BandError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let forwarder = self.forwarder.lock().take();
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if self.peripheral.is_connected().await? {
            if let Err(e) = self.peripheral.disconnect().await {
                warn!(error = %e, "Peripheral refused to disconnect");
                return Err(e.into());
            }
        }
        Ok(())
    }
}
