//! Closed vocabularies shared by devices, entities and transports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Payloads carried on an availability topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Online => "online",
            Availability::Offline => "offline",
        }
    }

    /// Parses an availability payload as seen on the wire.
    pub fn from_payload(payload: &str) -> Option<Self> {
        match payload {
            "online" => Some(Availability::Online),
            "offline" => Some(Availability::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default `state_on` / `state_off` payloads of a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchState {
    On,
    Off,
}

impl SwitchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchState::On => "ON",
            SwitchState::Off => "OFF",
        }
    }
}

impl fmt::Display for SwitchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SwitchState> for String {
    fn from(state: SwitchState) -> Self {
        state.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

impl EntityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityCategory::Config => "config",
            EntityCategory::Diagnostic => "diagnostic",
        }
    }
}

/// MQTT delivery guarantee, independent of the client library in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(&self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS level {}", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        qos.level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_payloads() {
        assert_eq!(Availability::Online.as_str(), "online");
        assert_eq!(Availability::Offline.as_str(), "offline");
        assert_eq!(Availability::from_payload("online"), Some(Availability::Online));
        assert_eq!(Availability::from_payload("ONLINE"), None);
    }

    #[test]
    fn switch_and_category_payloads() {
        assert_eq!(SwitchState::On.as_str(), "ON");
        assert_eq!(SwitchState::Off.as_str(), "OFF");
        assert_eq!(EntityCategory::Diagnostic.as_str(), "diagnostic");
        assert_eq!(EntityCategory::Config.as_str(), "config");
    }

    #[test]
    fn qos_levels() {
        assert_eq!(Qos::AtMostOnce.level(), 0);
        assert_eq!(Qos::AtLeastOnce.level(), 1);
        assert_eq!(Qos::ExactlyOnce.level(), 2);
        assert_eq!(Qos::try_from(1), Ok(Qos::AtLeastOnce));
        assert!(Qos::try_from(3).is_err());
    }
}
