/// Beacon payload construction and validation
///
/// On-air format (bit-exact across implementations):
///
/// | field      | width   | content                         |
/// |------------|---------|---------------------------------|
/// | identifier | 128 bit | tenant advertisement identifier |
/// | major      | 16 bit  | organization code               |
/// | minor      | 16 bit  | session token digest            |

use crate::org::{advertisement_identifier_for, code_for, Organization};
use crate::token::{SessionToken, TokenDigest, TokenError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors for payload operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error(transparent)]
    InvalidTokenFormat(#[from] TokenError),
    #[error("Unknown organization: {0}")]
    UnknownOrganization(String),
}

/// The three fields actually transmitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeaconPayload {
    pub identifier: Uuid,
    pub major: u16,
    pub minor: u16,
}

impl BeaconPayload {
    pub fn organization(&self) -> Organization {
        Organization::from_code(self.major)
    }

    pub fn digest(&self) -> TokenDigest {
        TokenDigest::new(self.minor)
    }

    /// Same gate as [`validate`], against an already-resolved organization
    pub fn validate_for(&self, org: Organization) -> bool {
        validate(self.major, self.minor, org.slug())
    }
}

/// A beacon as reported by the radio. `rssi` and `timestamp` are measured
/// by the receiver and never transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBeacon {
    pub identifier: Uuid,
    pub major: u16,
    pub minor: u16,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// When the receiver observed the beacon
    pub timestamp: DateTime<Utc>,
}

impl RawBeacon {
    pub fn payload(&self) -> BeaconPayload {
        BeaconPayload {
            identifier: self.identifier,
            major: self.major,
            minor: self.minor,
        }
    }
}

/// Assemble the advertisement for `token` under the tenant `org_slug`.
pub fn build(token: &str, org_slug: &str) -> Result<BeaconPayload, PayloadError> {
    let org = Organization::from_slug(org_slug);
    if !org.is_known() {
        return Err(PayloadError::UnknownOrganization(org_slug.to_string()));
    }
    let token = SessionToken::parse(token)?;
    Ok(build_for(&token, org))
}

/// Typed variant of [`build`] for callers that already hold a validated
/// token and a known organization.
pub(crate) fn build_for(token: &SessionToken, org: Organization) -> BeaconPayload {
    BeaconPayload {
        identifier: advertisement_identifier_for(org.slug()),
        major: code_for(org.slug()).value(),
        minor: token.digest().value(),
    }
}

/// The single accept/reject gate for beacon fields.
///
/// True iff `major` is the observer tenant's code and that code is not the
/// reserved unknown code. `minor` is any 16-bit value, which `u16` already
/// guarantees.
pub fn validate(major: u16, _minor: u16, org_slug: &str) -> bool {
    let expected = code_for(org_slug);
    !expected.is_unknown() && major == expected.value()
}

/// Recover the token digest from an observed beacon, if it belongs to the
/// observer's tenant. The identifier has to match too, so a beacon that
/// merely reuses a tenant's major under another identifier is ignored.
pub fn parse(beacon: &RawBeacon, observer: Organization) -> Option<TokenDigest> {
    if beacon.identifier != observer.advertisement_id() {
        return None;
    }
    if !validate(beacon.major, beacon.minor, observer.slug()) {
        return None;
    }
    Some(TokenDigest::new(beacon.minor))
}
