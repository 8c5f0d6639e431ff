//! Session Lifecycle Manager
//!
//! Officer device: `None → Creating → Created → Broadcasting → (Stopped | Expired)`.
//! Member device: detection → `find_session_by_beacon` → `add_attendance`.
//!
//! Expiry is reported here for display only. The backend re-checks the
//! session window before recording attendance because client clocks are not
//! trusted.

use super::broadcast::{BroadcastController, BroadcastError, BroadcastHandle};
use crate::backend::{AttendanceResult, Backend, BackendError, CreateSessionRequest, SessionInfo};
use crate::beacon::Detection;
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ProtocolConfig};
use crate::org::Organization;
use crate::radio::{RadioAdapter, RadioError};
use crate::token::{SessionToken, TokenDigest, TokenError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    InvalidTokenFormat(#[from] TokenError),

    #[error("Unknown organization: {0}")]
    UnknownOrganization(String),

    #[error("Session creation failed: {0}")]
    SessionCreationFailed(String),

    #[error("A session is already being created for {0}")]
    CreationInProgress(Organization),

    #[error("Invalid session TTL: {0}s")]
    InvalidTtl(u64),

    #[error("Session has expired")]
    Expired,

    #[error("Radio unavailable: {0}")]
    RadioUnavailable(RadioError),

    #[error("Radio error: {0}")]
    Radio(RadioError),

    #[error("{0} is already broadcasting on this device")]
    BroadcastActive(Organization),

    #[error("Backend call timed out: {0}")]
    Timeout(&'static str),

    #[error("Backend error: {0}")]
    Backend(BackendError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Whether retrying the same call later can succeed. Local validation
    /// failures and radio problems that need the user never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::SessionCreationFailed(_)
                | SessionError::Timeout(_)
                | SessionError::Backend(BackendError::Network(_))
                | SessionError::Radio(_)
        )
    }
}

impl From<BroadcastError> for SessionError {
    fn from(err: BroadcastError) -> Self {
        match err {
            BroadcastError::UnknownOrganization(slug) => SessionError::UnknownOrganization(slug),
            BroadcastError::InvalidPayload(org) => {
                SessionError::UnknownOrganization(org.slug().to_string())
            }
            BroadcastError::BroadcastActive(org) => SessionError::BroadcastActive(org),
            BroadcastError::RadioUnavailable(e) => SessionError::RadioUnavailable(e),
            BroadcastError::Radio(e) => SessionError::Radio(e),
            BroadcastError::ReplacementFailed { source, .. } => BroadcastError::from(source).into(),
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// Tenant context of the signed-in user: the backend's organization id plus
/// the protocol-level organization it maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    pub org_id: Uuid,
    pub organization: Organization,
}

impl Tenant {
    pub fn new(org_id: Uuid, organization: Organization) -> Self {
        Self {
            org_id,
            organization,
        }
    }
}

/// A session this device created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficerSession {
    pub token: SessionToken,
    pub event_id: Uuid,
    pub tenant: Tenant,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OfficerSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Officer-side lifecycle phase of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    /// Unknown to this device
    None,
    /// Backend call in flight (reported per organization)
    Creating,
    /// Token issued, not yet on air
    Created,
    /// Radio confirmed the advertisement
    Broadcasting,
    /// Stopped or terminated by the officer
    Stopped,
    /// Wall clock passed the expiry
    Expired,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Creating => write!(f, "Creating"),
            Self::Created => write!(f, "Created"),
            Self::Broadcasting => write!(f, "Broadcasting"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Expired => write!(f, "Expired"),
        }
    }
}

/// Result of turning a detection into an attendance submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckIn {
    /// Backend recorded (or had already recorded) attendance
    Recorded {
        session: SessionInfo,
        result: AttendanceResult,
    },
    /// Backend answered `success: false`
    Rejected {
        session: SessionInfo,
        result: AttendanceResult,
    },
    /// No valid session of the tenant matches the detected digest
    NoSession,
}

#[derive(Debug, Clone)]
struct PhaseEntry {
    phase: SessionPhase,
    organization: Organization,
    expires_at: DateTime<Utc>,
}

/// Removes the organization from the in-flight set however creation ends,
/// including cancellation of the caller's future.
struct CreationGuard<'a> {
    creating: &'a Mutex<HashSet<Organization>>,
    organization: Organization,
}

impl<'a> CreationGuard<'a> {
    fn acquire(
        creating: &'a Mutex<HashSet<Organization>>,
        organization: Organization,
    ) -> Result<Self, SessionError> {
        if !creating.lock().insert(organization) {
            return Err(SessionError::CreationInProgress(organization));
        }
        Ok(Self {
            creating,
            organization,
        })
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        self.creating.lock().remove(&self.organization);
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct SessionManager {
    backend: Arc<dyn Backend>,
    broadcaster: BroadcastController,
    clock: Arc<dyn Clock>,
    config: ProtocolConfig,
    creating: Mutex<HashSet<Organization>>,
    phases: RwLock<HashMap<SessionToken, PhaseEntry>>,
}

impl SessionManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        radio: Arc<dyn RadioAdapter>,
        config: ProtocolConfig,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            backend,
            broadcaster: BroadcastController::new(radio),
            clock: Arc::new(SystemClock),
            config,
            creating: Mutex::new(HashSet::new()),
            phases: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Officer side
    // ------------------------------------------------------------------

    /// Ask the backend for a new session.
    ///
    /// `ttl_secs = None` uses the configured default; `0` is rejected and
    /// values above the ceiling are clamped. Only one creation per
    /// organization may be in flight, since a retried create can leave a
    /// duplicate session behind.
    pub async fn create_session(
        &self,
        tenant: Tenant,
        title: &str,
        ttl_secs: Option<u64>,
    ) -> Result<OfficerSession, SessionError> {
        if !tenant.organization.is_known() {
            return Err(SessionError::UnknownOrganization(
                tenant.organization.slug().to_string(),
            ));
        }
        let ttl = self.effective_ttl(ttl_secs)?;
        let _guard = CreationGuard::acquire(&self.creating, tenant.organization)?;

        let starts_at = self.clock.now();
        let request = CreateSessionRequest {
            org_id: tenant.org_id,
            title: title.to_string(),
            starts_at,
            ttl_seconds: ttl,
        };

        let created = match tokio::time::timeout(
            self.config.backend_timeout(),
            self.backend.create_session(request),
        )
        .await
        {
            Ok(Ok(created)) => created,
            Ok(Err(err)) => {
                warn!(org = %tenant.organization, "create_session rejected: {}", err);
                return Err(SessionError::SessionCreationFailed(err.to_string()));
            }
            Err(_) => {
                warn!(org = %tenant.organization, "create_session timed out");
                return Err(SessionError::SessionCreationFailed(
                    "backend timed out".to_string(),
                ));
            }
        };

        self.phases.write().insert(
            created.session_token.clone(),
            PhaseEntry {
                phase: SessionPhase::Created,
                organization: tenant.organization,
                expires_at: created.expires_at,
            },
        );
        info!(
            org = %tenant.organization,
            digest = %created.session_token.digest(),
            ttl,
            "session created"
        );

        Ok(OfficerSession {
            token: created.session_token,
            event_id: created.event_id,
            tenant,
            title: title.to_string(),
            starts_at,
            expires_at: created.expires_at,
        })
    }

    /// Put `session` on the air. The phase only moves to `Broadcasting` once
    /// the radio confirmed.
    pub async fn start_broadcast(
        &self,
        session: &OfficerSession,
    ) -> Result<BroadcastHandle, SessionError> {
        if session.is_expired_at(self.clock.now()) {
            self.set_phase(&session.token, SessionPhase::Expired);
            return Err(SessionError::Expired);
        }

        let started = self
            .broadcaster
            .start(
                &session.token,
                session.tenant.organization,
                self.config.broadcast_policy,
            )
            .await;
        let (handle, replaced) = match started {
            Ok(started) => started,
            Err(err) => {
                if let BroadcastError::ReplacementFailed { stopped, .. } = &err {
                    self.set_phase(stopped, SessionPhase::Stopped);
                }
                return Err(err.into());
            }
        };

        let mut phases = self.phases.write();
        if let Some(previous) = replaced {
            if let Some(entry) = phases.get_mut(&previous) {
                entry.phase = SessionPhase::Stopped;
            }
        }
        phases
            .entry(session.token.clone())
            .or_insert_with(|| PhaseEntry {
                phase: SessionPhase::Created,
                organization: session.tenant.organization,
                expires_at: session.expires_at,
            })
            .phase = SessionPhase::Broadcasting;
        Ok(handle)
    }

    /// Stop the broadcast behind `handle`. Stopping something that is not on
    /// the air is a no-op.
    pub async fn stop_broadcast(&self, handle: &BroadcastHandle) -> Result<(), SessionError> {
        if self.broadcaster.stop(handle).await? {
            self.set_phase(handle.token(), SessionPhase::Stopped);
        } else {
            debug!(org = %handle.organization(), "stop_broadcast on inactive handle");
        }
        Ok(())
    }

    /// Stop whatever `org` is broadcasting on this device, if anything.
    pub async fn stop_organization(&self, org: Organization) -> Result<(), SessionError> {
        if let Some(token) = self.broadcaster.stop_organization(org).await? {
            self.set_phase(&token, SessionPhase::Stopped);
        }
        Ok(())
    }

    /// End a session early: take it off the air and tell the backend. The
    /// phase turns `Stopped` as soon as the radio stops, even if the backend
    /// call then fails.
    pub async fn terminate_session(&self, session: &OfficerSession) -> Result<(), SessionError> {
        let org = session.tenant.organization;
        if self.broadcaster.stop_token(org, &session.token).await? {
            self.set_phase(&session.token, SessionPhase::Stopped);
        }
        self.call("terminate_session", self.backend.terminate_session(&session.token))
            .await?;
        self.set_phase(&session.token, SessionPhase::Stopped);
        info!(org = %org, digest = %session.token.digest(), "session terminated");
        Ok(())
    }

    /// Stop broadcasts whose session has passed its expiry, then forget every
    /// session that has ended (stopped, or expired and off the air); their
    /// [`phase`](Self::phase) reads `None` afterwards. Returns how many
    /// broadcasts were stopped.
    pub async fn stop_expired_broadcasts(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let expired: Vec<(SessionToken, Organization)> = self
            .phases
            .read()
            .iter()
            .filter(|(_, entry)| {
                entry.phase == SessionPhase::Broadcasting && now >= entry.expires_at
            })
            .map(|(token, entry)| (token.clone(), entry.organization))
            .collect();

        let mut stopped = 0;
        for (token, org) in expired {
            if self.broadcaster.stop_token(org, &token).await? {
                stopped += 1;
                info!(org = %org, digest = %token.digest(), "expired broadcast stopped");
            }
            self.set_phase(&token, SessionPhase::Expired);
        }

        let mut phases = self.phases.write();
        let before = phases.len();
        phases.retain(|_, entry| match entry.phase {
            SessionPhase::Stopped | SessionPhase::Expired => false,
            SessionPhase::Broadcasting => true,
            _ => now < entry.expires_at,
        });
        if phases.len() < before {
            debug!(evicted = before - phases.len(), "ended sessions forgotten");
        }
        Ok(stopped)
    }

    /// Number of sessions this manager still tracks a phase for
    pub fn tracked_sessions(&self) -> usize {
        self.phases.read().len()
    }

    /// Officer-side phase of `token`
    pub fn phase(&self, token: &SessionToken) -> SessionPhase {
        let now = self.clock.now();
        match self.phases.read().get(token) {
            None => SessionPhase::None,
            Some(entry) if entry.phase == SessionPhase::Stopped => SessionPhase::Stopped,
            Some(entry) if now >= entry.expires_at => SessionPhase::Expired,
            Some(entry) => entry.phase,
        }
    }

    /// Whether a create call for `org` is currently in flight
    pub fn is_creating(&self, org: Organization) -> bool {
        self.creating.lock().contains(&org)
    }

    pub async fn is_broadcasting(&self, org: Organization) -> bool {
        self.broadcaster.is_broadcasting(org).await
    }

    // ------------------------------------------------------------------
    // Member side
    // ------------------------------------------------------------------

    /// Look a token up. `Ok(None)` means no matching session is visible to
    /// the caller, which is an ordinary answer; `Err` means the backend could
    /// not be asked.
    pub async fn resolve_session(
        &self,
        token: &SessionToken,
    ) -> Result<Option<SessionInfo>, SessionError> {
        self.call("resolve_session", self.backend.resolve_session(token))
            .await
    }

    /// Submit attendance. The backend decides membership and de-duplicates;
    /// `success: false` comes back as `Ok`.
    pub async fn add_attendance(
        &self,
        token: &SessionToken,
    ) -> Result<AttendanceResult, SessionError> {
        let result = self
            .call("add_attendance", self.backend.add_attendance(token))
            .await?;
        if result.success {
            info!(digest = %token.digest(), "attendance recorded");
        } else {
            info!(
                digest = %token.digest(),
                reason = result.error.as_deref().unwrap_or("unspecified"),
                "attendance refused"
            );
        }
        Ok(result)
    }

    /// Find the valid session of `tenant` whose token hashes to `digest`.
    ///
    /// Digests can collide; the first candidate the backend still reports as
    /// valid wins.
    pub async fn find_session_by_beacon(
        &self,
        tenant: Tenant,
        digest: TokenDigest,
    ) -> Result<Option<(SessionToken, SessionInfo)>, SessionError> {
        let active = self
            .call(
                "list_active_sessions",
                self.backend.list_active_sessions(tenant.org_id),
            )
            .await?;

        let candidates: Vec<SessionToken> = active
            .into_iter()
            .map(|session| session.session_token)
            .filter(|token| token.digest() == digest)
            .collect();

        if candidates.len() > 1 {
            warn!(
                org = %tenant.organization,
                %digest,
                candidates = candidates.len(),
                "digest collision between active sessions"
            );
        }

        for token in candidates {
            if let Some(info) = self.resolve_session(&token).await? {
                if info.is_valid && info.organization() == tenant.organization {
                    return Ok(Some((token, info)));
                }
            }
        }
        Ok(None)
    }

    /// Detection → session lookup → attendance submission.
    pub async fn check_in(
        &self,
        tenant: Tenant,
        detection: &Detection,
    ) -> Result<CheckIn, SessionError> {
        if detection.organization != tenant.organization {
            return Ok(CheckIn::NoSession);
        }
        let Some((token, session)) = self.find_session_by_beacon(tenant, detection.digest).await?
        else {
            debug!(digest = %detection.digest, "no session for detected beacon");
            return Ok(CheckIn::NoSession);
        };

        let result = self.add_attendance(&token).await?;
        if result.success {
            Ok(CheckIn::Recorded { session, result })
        } else {
            Ok(CheckIn::Rejected { session, result })
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn effective_ttl(&self, requested: Option<u64>) -> Result<u64, SessionError> {
        match requested {
            None => Ok(self.config.default_session_ttl_secs),
            Some(0) => Err(SessionError::InvalidTtl(0)),
            Some(ttl) if ttl > self.config.max_session_ttl_secs => {
                warn!(
                    requested = ttl,
                    max = self.config.max_session_ttl_secs,
                    "clamping session TTL"
                );
                Ok(self.config.max_session_ttl_secs)
            }
            Some(ttl) => Ok(ttl),
        }
    }

    fn set_phase(&self, token: &SessionToken, phase: SessionPhase) {
        if let Some(entry) = self.phases.write().get_mut(token) {
            entry.phase = phase;
        }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, SessionError> {
        match tokio::time::timeout(self.config.backend_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                debug!(operation, "backend error: {}", err);
                Err(SessionError::Backend(err))
            }
            Err(_) => {
                warn!(operation, "backend call timed out");
                Err(SessionError::Timeout(operation))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        ActiveSession, CreatedSession, MemoryBackend, MockBackend, Role,
    };
    use crate::clock::ManualClock;
    use crate::config::BroadcastPolicy;
    use crate::radio::{MemoryAir, MemoryRadio};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    struct Device {
        manager: SessionManager,
        radio: MemoryRadio,
    }

    struct World {
        clock: ManualClock,
        backend: MemoryBackend,
        air: MemoryAir,
        nhs: Tenant,
        nhsa: Tenant,
        officer: Uuid,
        member: Uuid,
    }

    impl World {
        fn new() -> Self {
            let clock = ManualClock::default();
            let backend = MemoryBackend::new(Arc::new(clock.clone())).with_seed(9);
            let nhs = Tenant::new(backend.register_organization(Organization::Nhs), Organization::Nhs);
            let nhsa = Tenant::new(
                backend.register_organization(Organization::Nhsa),
                Organization::Nhsa,
            );
            let officer = Uuid::new_v4();
            let member = Uuid::new_v4();
            backend.add_member(officer, nhs.org_id, Role::Officer);
            backend.add_member(officer, nhsa.org_id, Role::Officer);
            backend.add_member(member, nhs.org_id, Role::Member);
            Self {
                clock,
                backend,
                air: MemoryAir::new(),
                nhs,
                nhsa,
                officer,
                member,
            }
        }

        fn device(&self, user: Uuid, config: ProtocolConfig) -> Device {
            let radio = self.air.device();
            let manager = SessionManager::new(
                Arc::new(self.backend.as_user(user)),
                Arc::new(radio.clone()),
                config,
            )
            .unwrap()
            .with_clock(Arc::new(self.clock.clone()));
            Device { manager, radio }
        }
    }

    fn detection(org: Organization, digest: TokenDigest) -> Detection {
        Detection {
            organization: org,
            digest,
            rssi: -60,
            observed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_broadcast_session() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());

        let session = officer
            .manager
            .create_session(world.nhs, "Weekly Meeting", Some(3600))
            .await
            .unwrap();
        assert_eq!(officer.manager.phase(&session.token), SessionPhase::Created);
        assert_eq!(session.expires_at - session.starts_at, ChronoDuration::seconds(3600));

        let handle = officer.manager.start_broadcast(&session).await.unwrap();
        assert_eq!(officer.manager.phase(&session.token), SessionPhase::Broadcasting);
        assert_eq!(handle.payload().major, 1);
        assert_eq!(handle.payload().minor, session.token.digest().value());
        assert!(officer.radio.is_broadcasting(Organization::Nhs.code()));

        officer.manager.stop_broadcast(&handle).await.unwrap();
        assert_eq!(officer.manager.phase(&session.token), SessionPhase::Stopped);
        // Idempotent
        officer.manager.stop_broadcast(&handle).await.unwrap();
        officer.manager.stop_organization(Organization::Nhs).await.unwrap();
        assert!(!officer.radio.is_broadcasting(Organization::Nhs.code()));
    }

    #[tokio::test]
    async fn test_create_rejects_zero_ttl_and_clamps_large_ttl() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());

        assert_eq!(
            officer.manager.create_session(world.nhs, "Meeting", Some(0)).await,
            Err(SessionError::InvalidTtl(0))
        );

        let session = officer
            .manager
            .create_session(world.nhs, "Lock-in", Some(48 * 3600))
            .await
            .unwrap();
        assert_eq!(
            session.expires_at - session.starts_at,
            ChronoDuration::seconds(8 * 3600)
        );
    }

    #[tokio::test]
    async fn test_create_uses_default_ttl() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let session = officer
            .manager
            .create_session(world.nhs, "Meeting", None)
            .await
            .unwrap();
        assert_eq!(session.expires_at - session.starts_at, ChronoDuration::seconds(3600));
    }

    #[tokio::test]
    async fn test_create_for_unknown_organization() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let tenant = Tenant::new(Uuid::new_v4(), Organization::Unknown);
        assert!(matches!(
            officer.manager.create_session(tenant, "Meeting", Some(60)).await,
            Err(SessionError::UnknownOrganization(_))
        ));
    }

    #[tokio::test]
    async fn test_member_cannot_create_session() {
        let world = World::new();
        let member = world.device(world.member, ProtocolConfig::default());
        let err = member
            .manager
            .create_session(world.nhs, "Meeting", Some(60))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionCreationFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(world.backend.session_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_maps_to_session_creation_failed() {
        let mut backend = MockBackend::new();
        backend
            .expect_create_session()
            .times(1)
            .returning(|_| Err(BackendError::Network("connection reset".to_string())));

        let air = MemoryAir::new();
        let manager = SessionManager::new(
            Arc::new(backend),
            Arc::new(air.device()),
            ProtocolConfig::default(),
        )
        .unwrap();
        let tenant = Tenant::new(Uuid::new_v4(), Organization::Nhs);

        let err = manager
            .create_session(tenant, "Meeting", Some(60))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::SessionCreationFailed("Network error: connection reset".to_string())
        );
        assert!(!manager.is_creating(Organization::Nhs));
    }

    #[tokio::test]
    async fn test_resolve_none_is_not_an_error() {
        let mut backend = MockBackend::new();
        backend.expect_resolve_session().returning(|_| Ok(None));

        let air = MemoryAir::new();
        let manager = SessionManager::new(
            Arc::new(backend),
            Arc::new(air.device()),
            ProtocolConfig::default(),
        )
        .unwrap();

        let token = SessionToken::parse("NHS123456789").unwrap();
        assert_eq!(manager.resolve_session(&token).await, Ok(None));
    }

    #[tokio::test]
    async fn test_transport_error_is_distinct_from_refusal() {
        let mut backend = MockBackend::new();
        backend
            .expect_add_attendance()
            .withf(|token| token.as_str() == "NHS123456789")
            .returning(|_| Err(BackendError::Network("offline".to_string())));
        backend
            .expect_add_attendance()
            .withf(|token| token.as_str() == "ABCDEFGHIJKL")
            .returning(|_| Ok(AttendanceResult::failure("session expired")));

        let air = MemoryAir::new();
        let manager = SessionManager::new(
            Arc::new(backend),
            Arc::new(air.device()),
            ProtocolConfig::default(),
        )
        .unwrap();

        let offline = manager
            .add_attendance(&SessionToken::parse("NHS123456789").unwrap())
            .await;
        assert!(matches!(
            offline,
            Err(SessionError::Backend(BackendError::Network(_)))
        ));

        let refused = manager
            .add_attendance(&SessionToken::parse("ABCDEFGHIJKL").unwrap())
            .await
            .unwrap();
        assert!(!refused.success);
    }

    /// Backend that never answers within the test timeouts
    struct StalledBackend;

    #[async_trait]
    impl Backend for StalledBackend {
        async fn create_session(
            &self,
            request: CreateSessionRequest,
        ) -> Result<CreatedSession, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(CreatedSession {
                session_token: SessionToken::parse("NHS123456789").unwrap(),
                event_id: Uuid::new_v4(),
                expires_at: request.starts_at,
            })
        }

        async fn resolve_session(
            &self,
            _token: &SessionToken,
        ) -> Result<Option<SessionInfo>, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn add_attendance(
            &self,
            _token: &SessionToken,
        ) -> Result<AttendanceResult, BackendError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AttendanceResult::default())
        }

        async fn list_active_sessions(
            &self,
            _org_id: Uuid,
        ) -> Result<Vec<ActiveSession>, BackendError> {
            Ok(Vec::new())
        }

        async fn terminate_session(&self, _token: &SessionToken) -> Result<(), BackendError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeouts() {
        let air = MemoryAir::new();
        let config = ProtocolConfig {
            backend_timeout_ms: 500,
            ..Default::default()
        };
        let manager =
            SessionManager::new(Arc::new(StalledBackend), Arc::new(air.device()), config).unwrap();
        let tenant = Tenant::new(Uuid::new_v4(), Organization::Nhs);
        let token = SessionToken::parse("NHS123456789").unwrap();

        assert!(matches!(
            manager.create_session(tenant, "Meeting", Some(60)).await,
            Err(SessionError::SessionCreationFailed(_))
        ));
        assert_eq!(
            manager.resolve_session(&token).await,
            Err(SessionError::Timeout("resolve_session"))
        );
        assert_eq!(
            manager.add_attendance(&token).await,
            Err(SessionError::Timeout("add_attendance"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_in_flight_create_per_organization() {
        let air = MemoryAir::new();
        let config = ProtocolConfig {
            backend_timeout_ms: 1_000,
            ..Default::default()
        };
        let manager =
            SessionManager::new(Arc::new(StalledBackend), Arc::new(air.device()), config).unwrap();
        let nhs = Tenant::new(Uuid::new_v4(), Organization::Nhs);
        let nhsa = Tenant::new(Uuid::new_v4(), Organization::Nhsa);

        let (first, second, other_org) = tokio::join!(
            manager.create_session(nhs, "Meeting", Some(60)),
            manager.create_session(nhs, "Meeting", Some(60)),
            manager.create_session(nhsa, "Meeting", Some(60)),
        );

        assert!(matches!(first, Err(SessionError::SessionCreationFailed(_))));
        assert_eq!(second, Err(SessionError::CreationInProgress(Organization::Nhs)));
        // Different organization is not blocked by the guard.
        assert!(matches!(other_org, Err(SessionError::SessionCreationFailed(_))));
        assert!(!manager.is_creating(Organization::Nhs));
    }

    #[tokio::test]
    async fn test_phase_expires_with_clock() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let session = officer
            .manager
            .create_session(world.nhs, "Meeting", Some(60))
            .await
            .unwrap();
        officer.manager.start_broadcast(&session).await.unwrap();

        world.clock.advance(ChronoDuration::seconds(60));
        assert_eq!(officer.manager.phase(&session.token), SessionPhase::Expired);

        assert_eq!(officer.manager.stop_expired_broadcasts().await, Ok(1));
        assert!(!officer.radio.is_broadcasting(Organization::Nhs.code()));
        assert_eq!(officer.manager.start_broadcast(&session).await, Err(SessionError::Expired));
    }

    #[tokio::test]
    async fn test_replacement_marks_previous_session_stopped() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let first = officer
            .manager
            .create_session(world.nhs, "First", Some(600))
            .await
            .unwrap();
        let second = officer
            .manager
            .create_session(world.nhs, "Second", Some(600))
            .await
            .unwrap();

        officer.manager.start_broadcast(&first).await.unwrap();
        officer.manager.start_broadcast(&second).await.unwrap();

        assert_eq!(officer.manager.phase(&first.token), SessionPhase::Stopped);
        assert_eq!(officer.manager.phase(&second.token), SessionPhase::Broadcasting);
        assert_eq!(world.air.advertisements_for(Organization::Nhs.code()).len(), 1);
    }

    #[tokio::test]
    async fn test_reject_policy_surfaces_broadcast_active() {
        let world = World::new();
        let officer = world.device(
            world.officer,
            ProtocolConfig {
                broadcast_policy: BroadcastPolicy::Reject,
                ..Default::default()
            },
        );
        let first = officer
            .manager
            .create_session(world.nhs, "First", Some(600))
            .await
            .unwrap();
        let second = officer
            .manager
            .create_session(world.nhs, "Second", Some(600))
            .await
            .unwrap();

        officer.manager.start_broadcast(&first).await.unwrap();
        assert_eq!(
            officer.manager.start_broadcast(&second).await,
            Err(SessionError::BroadcastActive(Organization::Nhs))
        );
        assert_eq!(officer.manager.phase(&second.token), SessionPhase::Created);
    }

    #[tokio::test]
    async fn test_radio_off_keeps_session_off_air() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        officer.radio.set_powered_on(false);

        let session = officer
            .manager
            .create_session(world.nhs, "Meeting", Some(600))
            .await
            .unwrap();
        let err = officer.manager.start_broadcast(&session).await.unwrap_err();

        assert_eq!(err, SessionError::RadioUnavailable(RadioError::PoweredOff));
        assert!(!err.is_retryable());
        assert_eq!(officer.manager.phase(&session.token), SessionPhase::Created);
    }

    #[tokio::test]
    async fn test_two_organizations_broadcast_from_one_device() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());

        let nhs = officer.manager.create_session(world.nhs, "NHS", Some(600)).await.unwrap();
        let nhsa = officer.manager.create_session(world.nhsa, "NHSA", Some(600)).await.unwrap();
        let nhs_handle = officer.manager.start_broadcast(&nhs).await.unwrap();
        officer.manager.start_broadcast(&nhsa).await.unwrap();

        officer.manager.stop_broadcast(&nhs_handle).await.unwrap();
        assert!(!officer.manager.is_broadcasting(Organization::Nhs).await);
        assert!(officer.manager.is_broadcasting(Organization::Nhsa).await);
    }

    #[tokio::test]
    async fn test_check_in_from_detection() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let member = world.device(world.member, ProtocolConfig::default());

        let session = officer
            .manager
            .create_session(world.nhs, "Weekly Meeting", Some(3600))
            .await
            .unwrap();
        officer.manager.start_broadcast(&session).await.unwrap();

        let seen = detection(Organization::Nhs, session.token.digest());
        match member.manager.check_in(world.nhs, &seen).await.unwrap() {
            CheckIn::Recorded { session: info, result } => {
                assert_eq!(info.event_id, session.event_id);
                assert!(result.success);
            }
            other => panic!("unexpected check-in outcome: {:?}", other),
        }

        // Second check-in is de-duplicated by the backend.
        assert!(matches!(
            member.manager.check_in(world.nhs, &seen).await.unwrap(),
            CheckIn::Recorded { .. }
        ));
        assert_eq!(world.backend.attendance_for_event(session.event_id).len(), 1);
    }

    #[tokio::test]
    async fn test_check_in_with_unmatched_digest() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let member = world.device(world.member, ProtocolConfig::default());

        let session = officer
            .manager
            .create_session(world.nhs, "Weekly Meeting", Some(3600))
            .await
            .unwrap();
        let wrong = TokenDigest::new(session.token.digest().value().wrapping_add(1));

        assert_eq!(
            member.manager.check_in(world.nhs, &detection(Organization::Nhs, wrong)).await,
            Ok(CheckIn::NoSession)
        );
        assert_eq!(
            member
                .manager
                .check_in(world.nhs, &detection(Organization::Nhsa, session.token.digest()))
                .await,
            Ok(CheckIn::NoSession)
        );
    }

    #[tokio::test]
    async fn test_terminate_session() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let member = world.device(world.member, ProtocolConfig::default());

        let session = officer
            .manager
            .create_session(world.nhs, "Weekly Meeting", Some(3600))
            .await
            .unwrap();
        officer.manager.start_broadcast(&session).await.unwrap();
        officer.manager.terminate_session(&session).await.unwrap();

        assert_eq!(officer.manager.phase(&session.token), SessionPhase::Stopped);
        assert!(!officer.radio.is_broadcasting(Organization::Nhs.code()));
        let result = member.manager.add_attendance(&session.token).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_terminate_with_backend_down_still_stops_broadcast() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let session = officer
            .manager
            .create_session(world.nhs, "Weekly Meeting", Some(3600))
            .await
            .unwrap();
        officer.manager.start_broadcast(&session).await.unwrap();

        world.backend.set_offline(true);
        let err = officer.manager.terminate_session(&session).await.unwrap_err();
        assert!(matches!(err, SessionError::Backend(BackendError::Network(_))));

        assert_eq!(officer.manager.phase(&session.token), SessionPhase::Stopped);
        assert!(!officer.manager.is_broadcasting(Organization::Nhs).await);
        assert!(!officer.radio.is_broadcasting(Organization::Nhs.code()));
    }

    #[tokio::test]
    async fn test_terminate_leaves_replacement_on_air() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let first = officer
            .manager
            .create_session(world.nhs, "First", Some(600))
            .await
            .unwrap();
        let second = officer
            .manager
            .create_session(world.nhs, "Second", Some(600))
            .await
            .unwrap();
        officer.manager.start_broadcast(&first).await.unwrap();
        officer.manager.start_broadcast(&second).await.unwrap();

        officer.manager.terminate_session(&first).await.unwrap();
        assert_eq!(officer.manager.phase(&second.token), SessionPhase::Broadcasting);
        assert!(officer.radio.is_broadcasting(Organization::Nhs.code()));
    }

    #[tokio::test]
    async fn test_failed_replacement_marks_previous_stopped() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let first = officer
            .manager
            .create_session(world.nhs, "First", Some(600))
            .await
            .unwrap();
        let second = officer
            .manager
            .create_session(world.nhs, "Second", Some(600))
            .await
            .unwrap();
        officer.manager.start_broadcast(&first).await.unwrap();

        officer.radio.set_powered_on(false);
        assert_eq!(
            officer.manager.start_broadcast(&second).await,
            Err(SessionError::RadioUnavailable(RadioError::PoweredOff))
        );

        assert_eq!(officer.manager.phase(&first.token), SessionPhase::Stopped);
        assert_eq!(officer.manager.phase(&second.token), SessionPhase::Created);
        assert!(!officer.manager.is_broadcasting(Organization::Nhs).await);
    }

    #[tokio::test]
    async fn test_sweep_forgets_ended_sessions() {
        let world = World::new();
        let officer = world.device(world.officer, ProtocolConfig::default());
        let stopped = officer
            .manager
            .create_session(world.nhs, "Stopped", Some(3600))
            .await
            .unwrap();
        let expiring = officer
            .manager
            .create_session(world.nhs, "Expiring", Some(60))
            .await
            .unwrap();
        let live = officer
            .manager
            .create_session(world.nhsa, "Live", Some(3600))
            .await
            .unwrap();
        let handle = officer.manager.start_broadcast(&stopped).await.unwrap();
        officer.manager.stop_broadcast(&handle).await.unwrap();
        officer.manager.start_broadcast(&expiring).await.unwrap();
        officer.manager.start_broadcast(&live).await.unwrap();
        assert_eq!(officer.manager.tracked_sessions(), 3);

        world.clock.advance(ChronoDuration::seconds(61));
        assert_eq!(officer.manager.stop_expired_broadcasts().await, Ok(1));

        assert_eq!(officer.manager.tracked_sessions(), 1);
        assert_eq!(officer.manager.phase(&stopped.token), SessionPhase::None);
        assert_eq!(officer.manager.phase(&expiring.token), SessionPhase::None);
        assert_eq!(officer.manager.phase(&live.token), SessionPhase::Broadcasting);
        assert!(officer.radio.is_broadcasting(Organization::Nhsa.code()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let air = MemoryAir::new();
        let config = ProtocolConfig {
            scan_poll_interval_ms: 0,
            ..Default::default()
        };
        let result = SessionManager::new(
            Arc::new(MemoryBackend::default()),
            Arc::new(air.device()),
            config,
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }
}
