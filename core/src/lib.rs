// Attendance Beacon Core: BLE session protocol
#![allow(clippy::empty_line_after_doc_comments)]
//
// An officer's device advertises a short-lived session as a beacon; members'
// devices hear it, map it back to a session and record attendance with the
// backend. The beacon only carries a 16-bit digest of the session token, so
// the backend stays the authority on validity and membership.

pub mod backend;
pub mod beacon;
pub mod clock;
pub mod config;
pub mod org;
pub mod radio;
pub mod session;
pub mod token;

pub use backend::{
    ActiveSession, AttendanceRecord, AttendanceResult, Backend, BackendError, CreateSessionRequest,
    CreatedSession, MemoryBackend, Role, SessionInfo,
};
pub use beacon::{
    build, filter_by_organization, organization_of, parse, validate, BeaconPayload, BeaconScanner,
    Detection, PayloadError, RawBeacon, ScannerError, ScannerHandle, ScannerState,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BroadcastPolicy, ConfigError, ProtocolConfig};
pub use org::{advertisement_identifier_for, code_for, Organization, OrganizationCode};
pub use radio::{MemoryAir, MemoryRadio, RadioAdapter, RadioError};
pub use session::{
    BroadcastController, BroadcastError, BroadcastHandle, CheckIn, OfficerSession, SessionError,
    SessionManager, SessionPhase, Tenant,
};
pub use token::{encode, is_valid_format, SessionToken, TokenDigest, TokenError};
