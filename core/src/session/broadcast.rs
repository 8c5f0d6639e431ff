//! Per-organization broadcast control
//!
//! Each organization advertises at most once per device. Starting returns a
//! [`BroadcastHandle`]; stopping requires it, so there is no ambient
//! "currently broadcasting" flag and several tenants can advertise from one
//! process without stepping on each other.

use crate::beacon::payload::build_for;
use crate::beacon::BeaconPayload;
use crate::config::BroadcastPolicy;
use crate::org::Organization;
use crate::radio::{RadioAdapter, RadioError};
use crate::token::SessionToken;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("Unknown organization: {0}")]
    UnknownOrganization(String),
    #[error("Payload failed validation for {0}")]
    InvalidPayload(Organization),
    #[error("{0} is already broadcasting on this device")]
    BroadcastActive(Organization),
    #[error("Radio unavailable: {0}")]
    RadioUnavailable(RadioError),
    #[error("Radio error: {0}")]
    Radio(RadioError),
    /// The replacement could not start and the previous broadcast could not
    /// be put back, so `stopped` is off the air.
    #[error("Replacement broadcast failed: {source}")]
    ReplacementFailed {
        source: RadioError,
        stopped: SessionToken,
    },
}

impl From<RadioError> for BroadcastError {
    fn from(err: RadioError) -> Self {
        if err.requires_user_action() {
            BroadcastError::RadioUnavailable(err)
        } else {
            BroadcastError::Radio(err)
        }
    }
}

/// Proof that a broadcast was started. Stale handles (the broadcast was
/// replaced or already stopped) stop nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastHandle {
    organization: Organization,
    generation: u64,
    token: SessionToken,
    payload: BeaconPayload,
}

impl BroadcastHandle {
    pub fn organization(&self) -> Organization {
        self.organization
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn payload(&self) -> BeaconPayload {
        self.payload
    }
}

#[derive(Debug, Clone)]
struct ActiveBroadcast {
    generation: u64,
    token: SessionToken,
    payload: BeaconPayload,
}

/// One lock per known organization, so tenants never wait on each other.
pub struct BroadcastController {
    radio: Arc<dyn RadioAdapter>,
    slots: HashMap<Organization, Mutex<Option<ActiveBroadcast>>>,
    next_generation: AtomicU64,
}

impl BroadcastController {
    pub fn new(radio: Arc<dyn RadioAdapter>) -> Self {
        Self {
            radio,
            slots: Organization::known()
                .iter()
                .map(|org| (*org, Mutex::new(None)))
                .collect(),
            next_generation: AtomicU64::new(1),
        }
    }

    fn slot(&self, org: Organization) -> Option<&Mutex<Option<ActiveBroadcast>>> {
        self.slots.get(&org)
    }

    /// Advertise `token` for `org`.
    ///
    /// Returns the handle once the radio confirmed the advertisement, plus
    /// the token of the broadcast it replaced, if any. The organization's
    /// lock is held across the radio calls, so a replacement is never observed
    /// half done and two advertisements for one organization never overlap.
    ///
    /// If the new advertisement fails after the old one was stopped, the old
    /// one is put back on air and the error returned as is. When that also
    /// fails the slot is left empty and the error is
    /// [`BroadcastError::ReplacementFailed`] naming the token that went off air.
    pub async fn start(
        &self,
        token: &SessionToken,
        org: Organization,
        policy: BroadcastPolicy,
    ) -> Result<(BroadcastHandle, Option<SessionToken>), BroadcastError> {
        let Some(slot) = self.slot(org) else {
            return Err(BroadcastError::UnknownOrganization(org.slug().to_string()));
        };
        let payload = build_for(token, org);
        if !payload.validate_for(org) {
            return Err(BroadcastError::InvalidPayload(org));
        }

        let mut active = slot.lock().await;
        let mut replaced = None;
        if let Some(current) = active.as_ref() {
            match policy {
                BroadcastPolicy::Reject => return Err(BroadcastError::BroadcastActive(org)),
                BroadcastPolicy::Replace => {
                    self.radio.stop_broadcasting(org.code()).await?;
                    debug!(org = %org, minor = current.payload.minor, "stopped broadcast for replacement");
                    replaced = active.take();
                }
            }
        }

        if let Err(err) = self
            .radio
            .start_broadcasting(payload.identifier, payload.major, payload.minor)
            .await
        {
            let Some(previous) = replaced else {
                return Err(err.into());
            };
            let restored = self
                .radio
                .start_broadcasting(
                    previous.payload.identifier,
                    previous.payload.major,
                    previous.payload.minor,
                )
                .await;
            return match restored {
                Ok(()) => {
                    warn!(org = %org, "replacement failed, previous broadcast restored: {}", err);
                    *active = Some(previous);
                    Err(err.into())
                }
                Err(restore_err) => {
                    warn!(org = %org, "replacement failed and previous broadcast lost: {}", restore_err);
                    Err(BroadcastError::ReplacementFailed {
                        source: err,
                        stopped: previous.token,
                    })
                }
            };
        }
        let replaced = replaced.map(|previous| previous.token);

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        *active = Some(ActiveBroadcast {
            generation,
            token: token.clone(),
            payload,
        });
        info!(org = %org, major = payload.major, minor = payload.minor, "broadcast started");

        Ok((
            BroadcastHandle {
                organization: org,
                generation,
                token: token.clone(),
                payload,
            },
            replaced,
        ))
    }

    /// Stop the broadcast `handle` refers to. Returns whether anything was
    /// actually stopped.
    pub async fn stop(&self, handle: &BroadcastHandle) -> Result<bool, BroadcastError> {
        let Some(slot) = self.slot(handle.organization) else {
            return Ok(false);
        };
        let mut active = slot.lock().await;
        match active.as_ref() {
            Some(current) if current.generation == handle.generation => {}
            _ => return Ok(false),
        }
        self.radio
            .stop_broadcasting(handle.organization.code())
            .await?;
        *active = None;
        info!(org = %handle.organization, "broadcast stopped");
        Ok(true)
    }

    /// Stop whatever `org` is broadcasting. Returns the token that was on air.
    pub async fn stop_organization(
        &self,
        org: Organization,
    ) -> Result<Option<SessionToken>, BroadcastError> {
        let Some(slot) = self.slot(org) else {
            return Ok(None);
        };
        let mut active = slot.lock().await;
        if active.is_none() {
            return Ok(None);
        }
        self.radio.stop_broadcasting(org.code()).await?;
        info!(org = %org, "broadcast stopped");
        Ok(active.take().map(|previous| previous.token))
    }

    /// Stop `org`'s broadcast only if `token` is the one on air. The check and
    /// the stop happen under one lock, so a replacement that lands in between
    /// is never taken down. Returns whether anything was stopped.
    pub async fn stop_token(
        &self,
        org: Organization,
        token: &SessionToken,
    ) -> Result<bool, BroadcastError> {
        let Some(slot) = self.slot(org) else {
            return Ok(false);
        };
        let mut active = slot.lock().await;
        match active.as_ref() {
            Some(current) if current.token == *token => {}
            _ => return Ok(false),
        }
        self.radio.stop_broadcasting(org.code()).await?;
        *active = None;
        info!(org = %org, "broadcast stopped");
        Ok(true)
    }

    pub async fn is_broadcasting(&self, org: Organization) -> bool {
        self.active_token(org).await.is_some()
    }

    /// Token currently on air for `org`
    pub async fn active_token(&self, org: Organization) -> Option<SessionToken> {
        let slot = self.slot(org)?;
        let active = slot.lock().await;
        active.as_ref().map(|current| current.token.clone())
    }
}
