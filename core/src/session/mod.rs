// Session lifecycle: officer side (create, broadcast, stop) and member side
// (resolve, check in). The backend stays the source of truth for validity and
// attendance; this layer only drives it and the radio.

pub mod broadcast;
pub mod manager;

pub use broadcast::{BroadcastController, BroadcastError, BroadcastHandle};
pub use manager::{CheckIn, OfficerSession, SessionError, SessionManager, SessionPhase, Tenant};
