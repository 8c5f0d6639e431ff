//! Backend remote operations
//!
//! The persistent store (sessions, events, attendance) lives on the server.
//! The protocol reaches it only through [`Backend`]; transport and schema are
//! the server's business. [`MemoryBackend`] implements the same contract in
//! process: it issues tokens, owns expiry, checks tenant membership and
//! de-duplicates attendance, so clients can be exercised end to end.

use crate::clock::{Clock, SystemClock};
use crate::config::MAX_SESSION_TTL_SECS;
use crate::org::Organization;
use crate::token::SessionToken;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
}

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub org_id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_token: SessionToken,
    pub event_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// What a member learns about a session it can see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub event_id: Uuid,
    pub event_title: String,
    pub org_id: Uuid,
    pub org_slug: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_valid: bool,
}

impl SessionInfo {
    pub fn organization(&self) -> Organization {
        Organization::from_slug(&self.org_slug)
    }
}

/// Outcome of an attendance submission. `success: false` is an answer from
/// the backend, not a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttendanceResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttendanceResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// A currently valid session of one organization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub session_token: SessionToken,
    pub event_id: Uuid,
    pub event_title: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// BACKEND TRAIT
// ============================================================================

/// Remote operations consumed by the session lifecycle.
///
/// An implementation acts on behalf of one authenticated user; membership
/// and role checks happen behind this trait, never in the client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, BackendError>;

    /// `Ok(None)` when no session matches or the caller cannot see it
    async fn resolve_session(
        &self,
        token: &SessionToken,
    ) -> Result<Option<SessionInfo>, BackendError>;

    async fn add_attendance(&self, token: &SessionToken) -> Result<AttendanceResult, BackendError>;

    async fn list_active_sessions(&self, org_id: Uuid) -> Result<Vec<ActiveSession>, BackendError>;

    /// End a session before its expiry
    async fn terminate_session(&self, token: &SessionToken) -> Result<(), BackendError>;
}

// ============================================================================
// IN-MEMORY BACKEND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Member,
    Officer,
}

#[derive(Debug, Clone)]
struct StoredSession {
    org_id: Uuid,
    event_id: Uuid,
    title: String,
    starts_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    terminated_at: Option<DateTime<Utc>>,
}

impl StoredSession {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let end = match self.terminated_at {
            Some(terminated) if terminated < self.expires_at => terminated,
            _ => self.expires_at,
        };
        now >= self.starts_at && now < end
    }
}

/// One attendance row, unique per (member, event)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub attendance_id: Uuid,
    pub member_id: Uuid,
    pub event_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct Store {
    organizations: HashMap<Uuid, Organization>,
    memberships: HashMap<(Uuid, Uuid), Role>,
    sessions: HashMap<SessionToken, StoredSession>,
    attendance: HashMap<(Uuid, Uuid), AttendanceRecord>,
    offline: bool,
}

impl Store {
    fn role(&self, user: Uuid, org_id: Uuid) -> Option<Role> {
        self.memberships.get(&(user, org_id)).copied()
    }

    fn slug(&self, org_id: Uuid) -> String {
        self.organizations
            .get(&org_id)
            .copied()
            .unwrap_or(Organization::Unknown)
            .slug()
            .to_string()
    }
}

/// In-process backend. Clones share one store; [`MemoryBackend::as_user`]
/// returns a view that acts as a particular authenticated user.
#[derive(Clone)]
pub struct MemoryBackend {
    store: Arc<RwLock<Store>>,
    rng: Arc<Mutex<StdRng>>,
    clock: Arc<dyn Clock>,
    caller: Option<Uuid>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(RwLock::new(Store::default())),
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            clock,
            caller: None,
        }
    }

    /// Deterministic token generation
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// Register a tenant and return its backend id
    pub fn register_organization(&self, org: Organization) -> Uuid {
        let mut store = self.store.write();
        if let Some((id, _)) = store.organizations.iter().find(|(_, o)| **o == org) {
            return *id;
        }
        let id = Uuid::new_v4();
        store.organizations.insert(id, org);
        id
    }

    pub fn add_member(&self, user_id: Uuid, org_id: Uuid, role: Role) {
        self.store.write().memberships.insert((user_id, org_id), role);
    }

    /// View of this backend authenticated as `user_id`
    pub fn as_user(&self, user_id: Uuid) -> Self {
        Self {
            caller: Some(user_id),
            ..self.clone()
        }
    }

    /// Simulate an unreachable server
    pub fn set_offline(&self, offline: bool) {
        self.store.write().offline = offline;
    }

    pub fn attendance_for_event(&self, event_id: Uuid) -> Vec<AttendanceRecord> {
        self.store
            .read()
            .attendance
            .values()
            .filter(|record| record.event_id == event_id)
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.store.read().sessions.len()
    }

    fn caller(&self) -> Result<Uuid, BackendError> {
        self.caller
            .ok_or_else(|| BackendError::Rejected("not authenticated".to_string()))
    }

    fn ensure_online(&self) -> Result<(), BackendError> {
        if self.store.read().offline {
            return Err(BackendError::Network("backend unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, BackendError> {
        self.ensure_online()?;
        let caller = self.caller()?;
        if request.ttl_seconds == 0 || request.ttl_seconds > MAX_SESSION_TTL_SECS {
            return Err(BackendError::Rejected(format!(
                "ttl_seconds must be in 1..={}",
                MAX_SESSION_TTL_SECS
            )));
        }
        if request.title.trim().is_empty() {
            return Err(BackendError::Rejected("title is required".to_string()));
        }

        let mut store = self.store.write();
        if !store.organizations.contains_key(&request.org_id) {
            return Err(BackendError::Rejected("organization not found".to_string()));
        }
        if store.role(caller, request.org_id) != Some(Role::Officer) {
            return Err(BackendError::Rejected("permission denied".to_string()));
        }

        let token = {
            let mut rng = self.rng.lock();
            loop {
                let candidate = SessionToken::generate(&mut *rng);
                if !store.sessions.contains_key(&candidate) {
                    break candidate;
                }
            }
        };
        let expires_at = request.starts_at + Duration::seconds(request.ttl_seconds as i64);
        let event_id = Uuid::new_v4();
        store.sessions.insert(
            token.clone(),
            StoredSession {
                org_id: request.org_id,
                event_id,
                title: request.title,
                starts_at: request.starts_at,
                expires_at,
                terminated_at: None,
            },
        );

        Ok(CreatedSession {
            session_token: token,
            event_id,
            expires_at,
        })
    }

    async fn resolve_session(
        &self,
        token: &SessionToken,
    ) -> Result<Option<SessionInfo>, BackendError> {
        self.ensure_online()?;
        let caller = self.caller()?;
        let now = self.clock.now();
        let store = self.store.read();

        let Some(session) = store.sessions.get(token) else {
            return Ok(None);
        };
        if store.role(caller, session.org_id).is_none() {
            return Ok(None);
        }

        Ok(Some(SessionInfo {
            event_id: session.event_id,
            event_title: session.title.clone(),
            org_id: session.org_id,
            org_slug: store.slug(session.org_id),
            starts_at: session.starts_at,
            expires_at: session.expires_at,
            is_valid: session.is_valid_at(now),
        }))
    }

    async fn add_attendance(&self, token: &SessionToken) -> Result<AttendanceResult, BackendError> {
        self.ensure_online()?;
        let caller = self.caller()?;
        let now = self.clock.now();
        let mut store = self.store.write();

        let Some(session) = store.sessions.get(token).cloned() else {
            return Ok(AttendanceResult::failure("session not found"));
        };
        if store.role(caller, session.org_id).is_none() {
            return Ok(AttendanceResult::failure("not a member of this organization"));
        }
        if !session.is_valid_at(now) {
            return Ok(AttendanceResult {
                session_expires_at: Some(session.expires_at),
                ..AttendanceResult::failure("session expired")
            });
        }

        let org_slug = store.slug(session.org_id);
        let record = store
            .attendance
            .entry((caller, session.event_id))
            .or_insert_with(|| AttendanceRecord {
                attendance_id: Uuid::new_v4(),
                member_id: caller,
                event_id: session.event_id,
                recorded_at: now,
            })
            .clone();

        Ok(AttendanceResult {
            success: true,
            attendance_id: Some(record.attendance_id),
            event_id: Some(session.event_id),
            org_slug: Some(org_slug),
            recorded_at: Some(record.recorded_at),
            session_expires_at: Some(session.expires_at),
            error: None,
        })
    }

    async fn list_active_sessions(&self, org_id: Uuid) -> Result<Vec<ActiveSession>, BackendError> {
        self.ensure_online()?;
        let caller = self.caller()?;
        let now = self.clock.now();
        let store = self.store.read();

        if store.role(caller, org_id).is_none() {
            return Ok(Vec::new());
        }

        let mut active: Vec<ActiveSession> = store
            .sessions
            .iter()
            .filter(|(_, session)| session.org_id == org_id && session.is_valid_at(now))
            .map(|(token, session)| ActiveSession {
                session_token: token.clone(),
                event_id: session.event_id,
                event_title: session.title.clone(),
                starts_at: session.starts_at,
                expires_at: session.expires_at,
            })
            .collect();
        active.sort_by_key(|session| session.starts_at);
        Ok(active)
    }

    async fn terminate_session(&self, token: &SessionToken) -> Result<(), BackendError> {
        self.ensure_online()?;
        let caller = self.caller()?;
        let now = self.clock.now();
        let mut store = self.store.write();

        let org_id = match store.sessions.get(token) {
            Some(session) => session.org_id,
            None => return Err(BackendError::Rejected("session not found".to_string())),
        };
        if store.role(caller, org_id) != Some(Role::Officer) {
            return Err(BackendError::Rejected("permission denied".to_string()));
        }
        if let Some(session) = store.sessions.get_mut(token) {
            session.terminated_at.get_or_insert(now);
        }
        Ok(())
    }
}
