//! Radio adapter abstraction
//!
//! The platform owns the Bluetooth stack (CoreBluetooth/CoreLocation on iOS,
//! the Android BLE advertiser and scanner). The protocol only needs the narrow
//! surface in [`RadioAdapter`]. [`MemoryRadio`] implements it over a shared
//! in-process [`MemoryAir`] so whole officer/member flows can run without
//! hardware.

use crate::beacon::{BeaconPayload, RawBeacon};
use crate::org::OrganizationCode;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RadioError {
    #[error("Bluetooth is powered off")]
    PoweredOff,
    #[error("Bluetooth permission not granted")]
    Unauthorized,
    #[error("Advertising failed: {0}")]
    AdvertiseFailed(String),
    #[error("Scanning failed: {0}")]
    ScanFailed(String),
    #[error("Platform error: {0}")]
    Platform(String),
}

impl RadioError {
    /// True when the user has to fix something (power, permission) before
    /// the radio can be used at all.
    pub fn requires_user_action(&self) -> bool {
        matches!(self, RadioError::PoweredOff | RadioError::Unauthorized)
    }
}

// ============================================================================
// PLATFORM TRAIT
// ============================================================================

/// Platform-specific broadcast/scan primitive.
///
/// Implementations are expected to be cheap to call concurrently; the
/// protocol serializes broadcast changes per organization itself.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Advertise `(identifier, major, minor)`. Returns once the platform has
    /// confirmed the advertisement started.
    async fn start_broadcasting(
        &self,
        identifier: Uuid,
        major: u16,
        minor: u16,
    ) -> Result<(), RadioError>;

    /// Stop the advertisement tagged with `org_code`. Stopping something that
    /// is not advertising succeeds.
    async fn stop_broadcasting(&self, org_code: OrganizationCode) -> Result<(), RadioError>;

    async fn start_listening(&self) -> Result<(), RadioError>;

    async fn stop_listening(&self) -> Result<(), RadioError>;

    /// Beacons observed since the previous poll
    async fn detected_beacons(&self) -> Result<Vec<RawBeacon>, RadioError>;
}

// ============================================================================
// IN-MEMORY RADIO
// ============================================================================

/// Shared airspace for [`MemoryRadio`] devices.
#[derive(Clone, Default)]
pub struct MemoryAir {
    advertisements: Arc<RwLock<HashMap<(usize, u16), BeaconPayload>>>,
    injected: Arc<RwLock<Vec<RawBeacon>>>,
    next_device: Arc<AtomicUsize>,
}

impl MemoryAir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new device to this airspace
    pub fn device(&self) -> MemoryRadio {
        MemoryRadio {
            air: self.clone(),
            device_id: self.next_device.fetch_add(1, Ordering::SeqCst),
            rssi: -60,
            powered_on: Arc::new(RwLock::new(true)),
            listening: Arc::new(RwLock::new(false)),
            broadcast_starts: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Put an arbitrary beacon on the air, e.g. one from a foreign tenant or
    /// a third-party beacon with garbage fields.
    pub fn inject(&self, beacon: RawBeacon) {
        self.injected.write().push(beacon);
    }

    /// Number of advertisements currently on the air
    pub fn active_advertisements(&self) -> usize {
        self.advertisements.read().len()
    }

    /// Advertisements currently on the air for one organization code
    pub fn advertisements_for(&self, org_code: OrganizationCode) -> Vec<BeaconPayload> {
        self.advertisements
            .read()
            .iter()
            .filter(|((_, major), _)| *major == org_code.value())
            .map(|(_, payload)| *payload)
            .collect()
    }
}

/// One simulated device attached to a [`MemoryAir`].
#[derive(Clone)]
pub struct MemoryRadio {
    air: MemoryAir,
    device_id: usize,
    rssi: i16,
    powered_on: Arc<RwLock<bool>>,
    listening: Arc<RwLock<bool>>,
    broadcast_starts: Arc<AtomicUsize>,
}

impl MemoryRadio {
    /// Signal strength this device reports for every beacon it hears
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn set_powered_on(&self, on: bool) {
        *self.powered_on.write() = on;
        if !on {
            self.air
                .advertisements
                .write()
                .retain(|(device, _), _| *device != self.device_id);
            *self.listening.write() = false;
        }
    }

    pub fn is_listening(&self) -> bool {
        *self.listening.read()
    }

    /// How many times an advertisement was started on this device
    pub fn broadcast_starts(&self) -> usize {
        self.broadcast_starts.load(Ordering::SeqCst)
    }

    /// Whether this device is currently advertising for `org_code`
    pub fn is_broadcasting(&self, org_code: OrganizationCode) -> bool {
        self.air
            .advertisements
            .read()
            .contains_key(&(self.device_id, org_code.value()))
    }

    fn ensure_powered(&self) -> Result<(), RadioError> {
        if *self.powered_on.read() {
            Ok(())
        } else {
            Err(RadioError::PoweredOff)
        }
    }
}

#[async_trait]
impl RadioAdapter for MemoryRadio {
    async fn start_broadcasting(
        &self,
        identifier: Uuid,
        major: u16,
        minor: u16,
    ) -> Result<(), RadioError> {
        self.ensure_powered()?;
        let payload = BeaconPayload {
            identifier,
            major,
            minor,
        };
        {
            let mut advertisements = self.air.advertisements.write();
            let key = (self.device_id, major);
            if advertisements.contains_key(&key) {
                return Err(RadioError::AdvertiseFailed(format!(
                    "device {} already advertising for major {}",
                    self.device_id, major
                )));
            }
            advertisements.insert(key, payload);
        }
        self.broadcast_starts.fetch_add(1, Ordering::SeqCst);
        debug!(device = self.device_id, major, minor, "memory radio advertising");
        Ok(())
    }

    async fn stop_broadcasting(&self, org_code: OrganizationCode) -> Result<(), RadioError> {
        self.air
            .advertisements
            .write()
            .remove(&(self.device_id, org_code.value()));
        Ok(())
    }

    async fn start_listening(&self) -> Result<(), RadioError> {
        self.ensure_powered()?;
        *self.listening.write() = true;
        Ok(())
    }

    async fn stop_listening(&self) -> Result<(), RadioError> {
        *self.listening.write() = false;
        Ok(())
    }

    async fn detected_beacons(&self) -> Result<Vec<RawBeacon>, RadioError> {
        self.ensure_powered()?;
        if !self.is_listening() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut beacons: Vec<RawBeacon> = self
            .air
            .advertisements
            .read()
            .iter()
            .filter(|((device, _), _)| *device != self.device_id)
            .map(|(_, payload)| RawBeacon {
                identifier: payload.identifier,
                major: payload.major,
                minor: payload.minor,
                rssi: self.rssi,
                timestamp: now,
            })
            .collect();
        beacons.extend(self.air.injected.read().iter().cloned());
        Ok(beacons)
    }
}
