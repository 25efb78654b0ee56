//! Target peripheral matching.
//!
//! Pure decision functions: given an advertisement or a bonded-device list,
//! decide whether a candidate is the peripheral described by a
//! [`TargetSpec`]. No hardware is involved.

use std::collections::BTreeSet;
use uuid::Uuid;

use crate::ble::uuids::matches_short;
use crate::config::TargetSpec;

/// A candidate peripheral, as observed during scanning or bonded listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// Advertised or resolved device name.
    pub name: Option<String>,
    /// Transport address.
    pub address: String,
    /// Service UUIDs present in the advertisement.
    pub advertised_services: BTreeSet<Uuid>,
}

impl DeviceIdentity {
    /// Identity with only an address known (e.g. from the address cache).
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
            advertised_services: BTreeSet::new(),
        }
    }

    /// Identity with a name and address.
    pub fn named(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            address: address.into(),
            advertised_services: BTreeSet::new(),
        }
    }

    /// Add an advertised service UUID.
    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.advertised_services.insert(uuid);
        self
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Why a candidate matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    /// The advertised services include the target short UUID.
    ServiceUuid,
    /// The name equals the target name.
    ExactName,
    /// The name contains the target substring (bonded listing only).
    NameSubstring,
}

/// Decide whether an advertisement belongs to the target.
///
/// Service UUID is checked first, then the exact name. Substring matching
/// is deliberately not applied to live advertisements.
pub fn match_advertisement(candidate: &DeviceIdentity, target: &TargetSpec) -> Option<MatchReason> {
    if let Some(gatt) = &target.gatt {
        if candidate
            .advertised_services
            .iter()
            .any(|uuid| matches_short(uuid, gatt.service))
        {
            return Some(MatchReason::ServiceUuid);
        }
    }

    if candidate.name.as_deref() == Some(target.exact_name.as_str()) {
        return Some(MatchReason::ExactName);
    }

    None
}

/// Boolean form of [`match_advertisement`].
pub fn matches(candidate: &DeviceIdentity, target: &TargetSpec) -> bool {
    match_advertisement(candidate, target).is_some()
}

/// Pick the target from a bonded-device listing.
///
/// An exact name match anywhere in the list wins over a substring match.
pub fn find_bonded<'a>(
    devices: &'a [DeviceIdentity],
    target: &TargetSpec,
) -> Option<(&'a DeviceIdentity, MatchReason)> {
    let exact = devices
        .iter()
        .find(|d| d.name.as_deref() == Some(target.exact_name.as_str()));
    if let Some(device) = exact {
        return Some((device, MatchReason::ExactName));
    }

    let needle = target.name_substring.as_deref()?;
    devices
        .iter()
        .find(|d| d.name.as_deref().is_some_and(|n| n.contains(needle)))
        .map(|d| (d, MatchReason::NameSubstring))
}
