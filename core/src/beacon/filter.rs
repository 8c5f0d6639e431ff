/// Organization isolation filter
///
/// Applied to every scan batch before anything else looks at it. Beacons from
/// other tenants are routine input and are dropped silently; a device must
/// never surface, log the contents of, or act on another tenant's sessions.

use super::payload::RawBeacon;
use crate::org::{code_for, Organization};
use tracing::trace;

/// Keep only beacons whose major equals the observer tenant's code.
///
/// An observer with an unregistered slug keeps nothing: the reserved code
/// `0` never matches as a real tenant.
pub fn filter_by_organization(beacons: Vec<RawBeacon>, observer_org_slug: &str) -> Vec<RawBeacon> {
    let expected = code_for(observer_org_slug);
    if expected.is_unknown() {
        return Vec::new();
    }

    let total = beacons.len();
    let kept: Vec<RawBeacon> = beacons
        .into_iter()
        .filter(|beacon| beacon.major == expected.value())
        .collect();

    if kept.len() != total {
        trace!(
            observer = observer_org_slug,
            dropped = total - kept.len(),
            "dropped beacons outside observer organization"
        );
    }
    kept
}

/// Tenant slug a beacon's major belongs to, or `"unknown"`.
///
/// Diagnostics only; authorization never depends on it.
pub fn organization_of(beacon: &RawBeacon) -> &'static str {
    Organization::from_code(beacon.major).slug()
}
