//! Canonical topic names derived from one base path.

use serde::{Deserialize, Serialize};

/// The four topics of a device or entity.
///
/// Built once, when the owner registers its discovery, and never changed after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    pub base: String,
    pub config: String,
    pub availability: String,
    pub state: String,
    pub command: String,
}

/// Caller supplied replacements; used verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicOverrides {
    pub config: Option<String>,
    pub availability: Option<String>,
    pub state: Option<String>,
    pub command: Option<String>,
}

impl Topics {
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_overrides(base, &TopicOverrides::default())
    }

    pub fn with_overrides(base: impl Into<String>, overrides: &TopicOverrides) -> Self {
        let base = base.into();
        let pick = |custom: &Option<String>, suffix: &str| match custom {
            Some(topic) if !topic.is_empty() => topic.clone(),
            _ => format!("{}/{}", base, suffix),
        };
        Self {
            config: pick(&overrides.config, "config"),
            availability: pick(&overrides.availability, "availability"),
            state: pick(&overrides.state, "state"),
            command: pick(&overrides.command, "command"),
            base,
        }
    }

    /// `{prefix}/{component_type}/{object_id}`
    pub fn discovery_base(prefix: &str, component_type: &str, object_id: &str) -> String {
        format!("{}/{}/{}", prefix, component_type, object_id)
    }

    /// All four topics, in subscription order.
    pub fn all(&self) -> [&str; 4] {
        [&self.command, &self.state, &self.availability, &self.config]
    }
}
