// Organization Registry
//
// Static mapping from tenant slug to the two protocol constants each tenant
// owns: the 128-bit advertisement identifier and the 16-bit organization code
// carried in the beacon's major field. Adding a tenant is a new enum variant,
// so every match below has to be revisited.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Numeric tenant code transmitted as the beacon major
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationCode(u16);

impl OrganizationCode {
    /// Reserved for unknown/unassigned tenants. Never valid on the air.
    pub const UNKNOWN: OrganizationCode = OrganizationCode(0);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }
}

impl fmt::Display for OrganizationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advertisement identifier for the National Honor Society tenant
pub const NHS_ADVERTISEMENT_ID: Uuid = Uuid::from_u128(0x6E4F2A1C_8B3D_4C5E_9F70_1A2B3C4D5E01);

/// Advertisement identifier for the National Honor Society of Arts tenant
pub const NHSA_ADVERTISEMENT_ID: Uuid = Uuid::from_u128(0x6E4F2A1C_8B3D_4C5E_9F70_1A2B3C4D5E02);

/// Slug reported for beacons that belong to no known tenant
pub const UNKNOWN_SLUG: &str = "unknown";

/// Known tenants, plus an explicit catch-all for anything else
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Organization {
    Nhs,
    Nhsa,
    Unknown,
}

impl Organization {
    /// Classify a slug. Never fails; unrecognized input is `Unknown`.
    pub fn from_slug(slug: &str) -> Self {
        match slug.trim().to_ascii_lowercase().as_str() {
            "nhs" => Organization::Nhs,
            "nhsa" => Organization::Nhsa,
            _ => Organization::Unknown,
        }
    }

    /// Reverse lookup from a beacon major
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Organization::Nhs,
            2 => Organization::Nhsa,
            _ => Organization::Unknown,
        }
    }

    /// Reverse lookup from an advertisement identifier
    pub fn from_advertisement_id(identifier: &Uuid) -> Self {
        Self::known()
            .iter()
            .copied()
            .find(|org| org.advertisement_id() == *identifier)
            .unwrap_or(Organization::Unknown)
    }

    pub fn slug(self) -> &'static str {
        match self {
            Organization::Nhs => "nhs",
            Organization::Nhsa => "nhsa",
            Organization::Unknown => UNKNOWN_SLUG,
        }
    }

    pub fn code(self) -> OrganizationCode {
        match self {
            Organization::Nhs => OrganizationCode(1),
            Organization::Nhsa => OrganizationCode(2),
            Organization::Unknown => OrganizationCode::UNKNOWN,
        }
    }

    pub fn advertisement_id(self) -> Uuid {
        match self {
            Organization::Nhs => NHS_ADVERTISEMENT_ID,
            Organization::Nhsa => NHSA_ADVERTISEMENT_ID,
            Organization::Unknown => Uuid::nil(),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Organization::Nhs => "National Honor Society",
            Organization::Nhsa => "National Honor Society of Arts",
            Organization::Unknown => "Unknown",
        }
    }

    pub fn is_known(self) -> bool {
        self != Organization::Unknown
    }

    /// Every registered tenant, in code order
    pub fn known() -> &'static [Organization] {
        &[Organization::Nhs, Organization::Nhsa]
    }
}

impl fmt::Display for Organization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

/// Organization code for a slug; `0` for anything unregistered
pub fn code_for(org_slug: &str) -> OrganizationCode {
    Organization::from_slug(org_slug).code()
}

/// Advertisement identifier for a slug; the nil UUID for anything unregistered
pub fn advertisement_identifier_for(org_slug: &str) -> Uuid {
    Organization::from_slug(org_slug).advertisement_id()
}
