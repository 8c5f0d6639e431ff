/// Beacon Module
///
/// Everything that touches the three over-the-air fields of an attendance
/// beacon:
///
/// - **payload**: building `(identifier, major, minor)` from a session token
///   and validating observed fields against the observer's tenant
/// - **filter**: the organization isolation boundary applied to every scan batch
/// - **scanner**: background poll loop turning radio reports into detections
///
/// No personal identifiers ever leave the device; the only session-specific
/// bits on the air are the 16-bit token digest.

pub mod filter;
pub mod payload;
pub mod scanner;

pub use filter::{filter_by_organization, organization_of};
pub use payload::{build, parse, validate, BeaconPayload, PayloadError, RawBeacon};
pub use scanner::{BeaconScanner, Detection, ScannerError, ScannerHandle, ScannerState};
