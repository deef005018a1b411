//! Wire/data types: `Registration`, `Health`, `Prometheus`, `HeartbeatMessage`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum HeartbeatError {
    #[error("non-finite coordinate: {0}")]
    NonFiniteCoordinate(f64),
}

/// Degrees latitude or longitude. Construction rejects non-finite values so
/// the "marshalling fails on non-finite coordinates" invariant (§8) holds at
/// the type level rather than being re-checked by every caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Coordinate(f64);

impl Coordinate {
    pub fn new(value: f64) -> Result<Self, HeartbeatError> {
        if !value.is_finite() {
            return Err(HeartbeatError::NonFiniteCoordinate(value));
        }
        Ok(Coordinate(value))
    }

    pub fn get(&self) -> f64 {
        self.0
    }
}

impl<'de> Deserialize<'de> for Coordinate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Coordinate::new(value).map_err(serde::de::Error::custom)
    }
}

/// An ordered list of URL templates a service is reachable at.
pub type ServiceMap = HashMap<String, Vec<String>>;

/// Identity of a measurement node. Stable across reloads unless siteinfo
/// changes; destroyed when the registry key's TTL lapses with no refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub city: String,
    pub country: String,
    pub continent: String,
    pub experiment: String,
    pub hostname: String,
    pub latitude: Coordinate,
    pub longitude: Coordinate,
    pub machine: String,
    pub metro: String,
    pub project: String,
    pub site: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub uplink: String,
    pub probability: f64,
    pub services: ServiceMap,
}

/// Health score in `[0, 1]`: 1 means every declared service port accepted a
/// TCP dial, 0 means at least one failed. Rewritten every heartbeat period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub score: f64,
}

/// Boolean health reported by an external collector. Write path is the same
/// conditional upsert as `Health`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prometheus {
    pub healthy: bool,
}

/// A frame carrying exactly one of {registration, health, prometheus} from a
/// client's point of view. In the registry store, all three coexist as
/// fields under one hostname-keyed hash — `GetAll` may legitimately return a
/// value with more than one field populated; that's the purpose of the hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(
        rename = "Registration",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub registration: Option<Registration>,
    #[serde(rename = "Health", skip_serializing_if = "Option::is_none", default)]
    pub health: Option<Health>,
    #[serde(
        rename = "Prometheus",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub prometheus: Option<Prometheus>,
}

impl HeartbeatMessage {
    pub fn registration(reg: Registration) -> Self {
        let msg = HeartbeatMessage {
            registration: Some(reg),
            health: None,
            prometheus: None,
        };
        debug_assert_eq!(msg.populated_count(), 1);
        msg
    }

    pub fn health(health: Health) -> Self {
        let msg = HeartbeatMessage {
            registration: None,
            health: Some(health),
            prometheus: None,
        };
        debug_assert_eq!(msg.populated_count(), 1);
        msg
    }

    pub fn prometheus(prometheus: Prometheus) -> Self {
        let msg = HeartbeatMessage {
            registration: None,
            health: None,
            prometheus: Some(prometheus),
        };
        debug_assert_eq!(msg.populated_count(), 1);
        msg
    }

    fn populated_count(&self) -> usize {
        [
            self.registration.is_some(),
            self.health.is_some(),
            self.prometheus.is_some(),
        ]
        .into_iter()
        .filter(|populated| *populated)
        .count()
    }

    /// Merge another frame's fields into this one — used by the registry
    /// store's `GetAll` to assemble the three-field hash into one value, and
    /// by the instance handler to apply a field-level write to a snapshot
    /// entry without clobbering the other two fields.
    pub fn merge(&mut self, other: HeartbeatMessage) {
        if other.registration.is_some() {
            self.registration = other.registration;
        }
        if other.health.is_some() {
            self.health = other.health;
        }
        if other.prometheus.is_some() {
            self.prometheus = other.prometheus;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_rejects_non_finite() {
        assert!(Coordinate::new(f64::INFINITY).is_err());
        assert!(Coordinate::new(f64::NAN).is_err());
        assert!(Coordinate::new(40.7667).is_ok());
    }

    #[test]
    fn registration_construction_fails_on_non_finite_latitude() {
        // JSON itself has no literal for infinity, so the invariant is
        // enforced where it actually arises: constructing a Coordinate.
        let latitude = Coordinate::new(f64::INFINITY);
        assert!(latitude.is_err());
    }

    #[test]
    fn heartbeat_message_merge_does_not_clobber_other_fields() {
        let mut msg = HeartbeatMessage::health(Health { score: 1.0 });
        msg.merge(HeartbeatMessage::prometheus(Prometheus { healthy: true }));
        assert!(msg.health.is_some());
        assert!(msg.prometheus.is_some());
        assert!(msg.registration.is_none());
    }

    #[test]
    fn heartbeat_message_round_trips_with_single_field() {
        let msg = HeartbeatMessage::health(Health { score: 0.5 });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("Registration"));
        let back: HeartbeatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.health, Some(Health { score: 0.5 }));
    }
}
