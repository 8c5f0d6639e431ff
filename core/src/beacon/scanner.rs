/// Background beacon scanner
///
/// Polls the radio on a fixed interval, pushes every batch through the
/// organization filter first, recovers token digests from what survives and
/// hands them to the consumer over a bounded channel. A slow consumer costs
/// dropped detections, never a stalled poll loop.

use super::filter::filter_by_organization;
use super::payload::{parse, RawBeacon};
use crate::config::{ConfigError, ProtocolConfig};
use crate::org::Organization;
use crate::radio::{RadioAdapter, RadioError};
use crate::token::TokenDigest;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Idle, not scanning
    Idle,
    /// Actively polling the radio
    Scanning,
}

/// Errors for scanner operations
#[derive(Error, Debug, Clone)]
pub enum ScannerError {
    #[error("Cannot scan for unknown organization")]
    UnknownOrganization,
    #[error("Scanner already running")]
    AlreadyScanning,
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(RadioError),
    #[error("Radio error: {0}")]
    Radio(RadioError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RadioError> for ScannerError {
    fn from(err: RadioError) -> Self {
        if err.requires_user_action() {
            ScannerError::RadioUnavailable(err)
        } else {
            ScannerError::Radio(err)
        }
    }
}

/// A beacon of the observer's own tenant, reduced to what the session layer
/// needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub organization: Organization,
    pub digest: TokenDigest,
    /// RSSI (Received Signal Strength Indicator) in dBm
    pub rssi: i16,
    pub observed_at: DateTime<Utc>,
}

impl Detection {
    fn from_beacon(beacon: &RawBeacon, organization: Organization, digest: TokenDigest) -> Self {
        Self {
            organization,
            digest,
            rssi: beacon.rssi,
            observed_at: beacon.timestamp,
        }
    }

    /// Get approximate distance in meters based on RSSI (simple estimate)
    pub fn estimate_distance_m(&self) -> f64 {
        // Path loss model with a measured power of -59 dBm at 1 m and an
        // environment factor of 2 (free space).
        let measured_power = -59f64;
        10f64.powf((measured_power - f64::from(self.rssi)) / 20.0)
    }
}

/// Scanner bound to one observer organization
pub struct BeaconScanner {
    radio: Arc<dyn RadioAdapter>,
    observer: Organization,
    poll_interval: Duration,
    dedupe_window: Duration,
    channel_capacity: usize,
    state: Arc<RwLock<ScannerState>>,
    last_error: Arc<RwLock<Option<RadioError>>>,
    run: Arc<AtomicU64>,
}

impl BeaconScanner {
    /// Create a new scanner. Observers outside the registry are refused since
    /// they could never accept a beacon. The config must pass
    /// [`ProtocolConfig::validate`]; a zero poll interval would panic the loop.
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        observer: Organization,
        config: &ProtocolConfig,
    ) -> Result<Self, ScannerError> {
        if !observer.is_known() {
            return Err(ScannerError::UnknownOrganization);
        }
        config.validate()?;
        Ok(Self {
            radio,
            observer,
            poll_interval: config.scan_poll_interval(),
            dedupe_window: config.detection_dedupe_window(),
            channel_capacity: config.detection_channel_capacity.max(1),
            state: Arc::new(RwLock::new(ScannerState::Idle)),
            last_error: Arc::new(RwLock::new(None)),
            run: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn state(&self) -> ScannerState {
        *self.state.read()
    }

    pub fn observer(&self) -> Organization {
        self.observer
    }

    /// Radio error that ended the most recent scan, if any
    pub fn last_error(&self) -> Option<RadioError> {
        self.last_error.read().clone()
    }

    /// Start listening and spawn the poll loop
    pub async fn start(&self) -> Result<ScannerHandle, ScannerError> {
        let run = {
            let mut state = self.state.write();
            if *state == ScannerState::Scanning {
                return Err(ScannerError::AlreadyScanning);
            }
            *state = ScannerState::Scanning;
            self.run.fetch_add(1, Ordering::SeqCst) + 1
        };

        if let Err(err) = self.radio.start_listening().await {
            *self.state.write() = ScannerState::Idle;
            return Err(err.into());
        }
        *self.last_error.write() = None;

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let poll = PollLoop {
            radio: self.radio.clone(),
            observer: self.observer,
            poll_interval: self.poll_interval,
            dedupe_window: self.dedupe_window,
            last_error: self.last_error.clone(),
            exit: IdleOnExit {
                state: self.state.clone(),
                current_run: self.run.clone(),
                run,
            },
        };
        let task = tokio::spawn(poll.run(tx, shutdown_rx));

        info!(observer = %self.observer, "beacon scanning started");
        Ok(ScannerHandle {
            detections: rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
            radio: self.radio.clone(),
            state: self.state.clone(),
        })
    }
}

struct PollLoop {
    radio: Arc<dyn RadioAdapter>,
    observer: Organization,
    poll_interval: Duration,
    dedupe_window: Duration,
    last_error: Arc<RwLock<Option<RadioError>>>,
    exit: IdleOnExit,
}

/// Returns the scanner to `Idle` however the poll loop ends: shutdown, radio
/// loss, a closed channel, abort or panic. A loop from an earlier run leaves
/// the state alone once a newer run has started.
struct IdleOnExit {
    state: Arc<RwLock<ScannerState>>,
    current_run: Arc<AtomicU64>,
    run: u64,
}

impl Drop for IdleOnExit {
    fn drop(&mut self) {
        let mut state = self.state.write();
        if self.current_run.load(Ordering::SeqCst) == self.run {
            *state = ScannerState::Idle;
        }
    }
}

impl PollLoop {
    async fn run(self, tx: mpsc::Sender<Detection>, mut shutdown: oneshot::Receiver<()>) {
        let _exit = self.exit;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_reported: HashMap<TokenDigest, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let batch = match self.radio.detected_beacons().await {
                Ok(batch) => batch,
                Err(err) if err.requires_user_action() => {
                    warn!(observer = %self.observer, "scanning stopped: {}", err);
                    *self.last_error.write() = Some(err);
                    break;
                }
                Err(err) => {
                    debug!(observer = %self.observer, "scan poll failed: {}", err);
                    continue;
                }
            };

            let batch = filter_by_organization(batch, self.observer.slug());
            let now = Instant::now();
            last_reported.retain(|_, at| now.duration_since(*at) < self.dedupe_window);

            for beacon in &batch {
                let Some(digest) = parse(beacon, self.observer) else {
                    continue;
                };
                if last_reported.contains_key(&digest) {
                    continue;
                }

                let detection = Detection::from_beacon(beacon, self.observer, digest);
                match tx.try_send(detection) {
                    Ok(()) => {
                        last_reported.insert(digest, now);
                    }
                    // Not marked as reported, so a later poll offers it again.
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(%digest, "detection channel full, dropping");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        }
    }
}

/// Running scan. Dropping the handle aborts the poll loop; call
/// [`ScannerHandle::stop`] to also release the radio.
pub struct ScannerHandle {
    detections: mpsc::Receiver<Detection>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    radio: Arc<dyn RadioAdapter>,
    state: Arc<RwLock<ScannerState>>,
}

impl ScannerHandle {
    /// Next detection; `None` once the scan has ended
    pub async fn recv(&mut self) -> Option<Detection> {
        self.detections.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Detection> {
        self.detections.try_recv().ok()
    }

    /// Stop polling and stop listening
    pub async fn stop(mut self) -> Result<(), ScannerError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        *self.state.write() = ScannerState::Idle;
        self.radio.stop_listening().await?;
        info!("beacon scanning stopped");
        Ok(())
    }
}

impl Drop for ScannerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            *self.state.write() = ScannerState::Idle;
        }
    }
}
