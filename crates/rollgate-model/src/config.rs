//! Proposed configuration payload
//!
//! Agents describe a change as a key/value bag. Known keys are lifted into
//! typed fields so downstream components can check shape without poking at
//! JSON; anything else lands in the [`ProposedConfiguration::extra`] bucket
//! and travels untouched to the config applier.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Newest configuration schema understood by this build
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

/// Typed, versioned configuration change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedConfiguration {
    /// Schema version the payload was written against
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Desired replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,

    /// Desired instance / machine type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,

    /// CPU request in millicores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millicores: Option<u32>,

    /// Memory request in MB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,

    /// Share of traffic routed to the new configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_weight_percent: Option<u8>,

    /// Keys this schema version does not know about
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Default for ProposedConfiguration {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            replicas: None,
            instance_type: None,
            cpu_millicores: None,
            memory_mb: None,
            traffic_weight_percent: None,
            extra: BTreeMap::new(),
        }
    }
}

impl ProposedConfiguration {
    /// Empty configuration at the current schema version
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an untyped JSON object, lifting known keys into typed fields
    ///
    /// # Errors
    /// - [`ConfigError::NotAnObject`] if the value is not a JSON object
    /// - [`ConfigError::InvalidJson`] if a known key has the wrong type
    /// - any error from [`ProposedConfiguration::validate`]
    pub fn from_json(value: JsonValue) -> Result<Self, ConfigError> {
        if !value.is_object() {
            return Err(ConfigError::NotAnObject);
        }
        let config: Self = serde_json::from_value(value).map_err(ConfigError::InvalidJson)?;
        config.validate()?;
        Ok(config)
    }

    /// Canonical JSON form (known keys and extras in one object)
    ///
    /// # Errors
    /// Returns error if an extra value cannot be serialized
    pub fn to_json(&self) -> Result<JsonValue, ConfigError> {
        serde_json::to_value(self).map_err(ConfigError::InvalidJson)
    }

    /// Check version and field ranges
    ///
    /// # Errors
    /// Returns the first violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version == 0 || self.schema_version > CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::UnsupportedVersion {
                found: self.schema_version,
                supported: CONFIG_SCHEMA_VERSION,
            });
        }
        if self.replicas == Some(0) {
            return Err(ConfigError::invalid_field("replicas", "must be at least 1"));
        }
        if self.memory_mb == Some(0) {
            return Err(ConfigError::invalid_field("memory_mb", "must be positive"));
        }
        if self.cpu_millicores == Some(0) {
            return Err(ConfigError::invalid_field("cpu_millicores", "must be positive"));
        }
        if let Some(weight) = self.traffic_weight_percent {
            if weight > 100 {
                return Err(ConfigError::invalid_field(
                    "traffic_weight_percent",
                    format!("{weight} exceeds 100"),
                ));
            }
        }
        if let Some(kind) = &self.instance_type {
            if kind.trim().is_empty() {
                return Err(ConfigError::invalid_field("instance_type", "must not be blank"));
            }
        }
        Ok(())
    }

    /// Whether the payload carries no change at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_none()
            && self.instance_type.is_none()
            && self.cpu_millicores.is_none()
            && self.memory_mb.is_none()
            && self.traffic_weight_percent.is_none()
            && self.extra.is_empty()
    }

    /// Set an unknown key
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Set replica count
    #[inline]
    #[must_use]
    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = Some(replicas);
        self
    }

    /// Set instance type
    #[inline]
    #[must_use]
    pub fn with_instance_type(mut self, kind: impl Into<String>) -> Self {
        self.instance_type = Some(kind.into());
        self
    }

    /// Set memory request
    #[inline]
    #[must_use]
    pub fn with_memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self
    }

    /// Keys set on both sides with different values
    #[must_use]
    pub fn conflicting_keys(&self, other: &Self) -> Vec<String> {
        let mut keys = Vec::new();
        if differs(&self.replicas, &other.replicas) {
            keys.push("replicas".to_string());
        }
        if differs(&self.instance_type, &other.instance_type) {
            keys.push("instance_type".to_string());
        }
        if differs(&self.cpu_millicores, &other.cpu_millicores) {
            keys.push("cpu_millicores".to_string());
        }
        if differs(&self.memory_mb, &other.memory_mb) {
            keys.push("memory_mb".to_string());
        }
        if differs(&self.traffic_weight_percent, &other.traffic_weight_percent) {
            keys.push("traffic_weight_percent".to_string());
        }
        for (key, value) in &self.extra {
            if other.extra.get(key).is_some_and(|v| v != value) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Overlay `self` on `other`; keys set in `self` win
    #[must_use]
    pub fn merged_over(&self, other: &Self) -> Self {
        let mut extra = other.extra.clone();
        extra.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            schema_version: self.schema_version.max(other.schema_version),
            replicas: self.replicas.or(other.replicas),
            instance_type: self
                .instance_type
                .clone()
                .or_else(|| other.instance_type.clone()),
            cpu_millicores: self.cpu_millicores.or(other.cpu_millicores),
            memory_mb: self.memory_mb.or(other.memory_mb),
            traffic_weight_percent: self.traffic_weight_percent.or(other.traffic_weight_percent),
            extra,
        }
    }
}

fn differs<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x != y)
}

/// Configuration payload errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Payload is not a JSON object
    #[error("configuration must be a JSON object")]
    NotAnObject,

    /// A known key has the wrong JSON type
    #[error("invalid configuration: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Schema version outside the supported range
    #[error("unsupported schema version {found} (supported up to {supported})")]
    UnsupportedVersion {
        /// Version found in the payload
        found: u32,
        /// Newest supported version
        supported: u32,
    },

    /// A typed field is out of range
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Human-readable reason
        reason: String,
    },
}

impl ConfigError {
    fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_lifts_known_keys_and_keeps_unknown() {
        let config = ProposedConfiguration::from_json(json!({
            "replicas": 4,
            "instance_type": "m5.large",
            "autoscaler_profile": {"min": 2, "max": 8}
        }))
        .unwrap();

        assert_eq!(config.replicas, Some(4));
        assert_eq!(config.instance_type.as_deref(), Some("m5.large"));
        assert_eq!(config.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(
            config.extra.get("autoscaler_profile"),
            Some(&json!({"min": 2, "max": 8}))
        );
    }

    #[test]
    fn from_json_rejects_non_object() {
        let result = ProposedConfiguration::from_json(json!([1, 2, 3]));
        assert!(matches!(result, Err(ConfigError::NotAnObject)));
    }

    #[test]
    fn from_json_rejects_wrong_type_for_known_key() {
        let result = ProposedConfiguration::from_json(json!({"replicas": "four"}));
        assert!(matches!(result, Err(ConfigError::InvalidJson(_))));
    }

    #[test]
    fn validate_rejects_future_schema() {
        let result = ProposedConfiguration::from_json(json!({"schema_version": 9}));
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_traffic() {
        let config = ProposedConfiguration {
            traffic_weight_percent: Some(120),
            ..ProposedConfiguration::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidField {
                field: "traffic_weight_percent",
                ..
            })
        ));
    }

    #[test]
    fn to_json_flattens_extras() {
        let config = ProposedConfiguration::new()
            .with_replicas(3)
            .with_extra("zone", json!("eu-west-1a"));
        let value = config.to_json().unwrap();
        assert_eq!(value["replicas"], json!(3));
        assert_eq!(value["zone"], json!("eu-west-1a"));
    }

    #[test]
    fn conflicting_keys_only_reports_disagreements() {
        let a = ProposedConfiguration::new()
            .with_replicas(3)
            .with_instance_type("m5.large");
        let b = ProposedConfiguration::new()
            .with_replicas(5)
            .with_instance_type("m5.large")
            .with_memory_mb(2048);
        assert_eq!(a.conflicting_keys(&b), vec!["replicas".to_string()]);
    }

    #[test]
    fn merged_over_prefers_self() {
        let winner = ProposedConfiguration::new().with_replicas(3);
        let other = ProposedConfiguration::new()
            .with_replicas(6)
            .with_memory_mb(1024);
        let merged = winner.merged_over(&other);
        assert_eq!(merged.replicas, Some(3));
        assert_eq!(merged.memory_mb, Some(1024));
    }

    #[test]
    fn empty_configuration() {
        assert!(ProposedConfiguration::new().is_empty());
        assert!(!ProposedConfiguration::new().with_replicas(1).is_empty());
    }
}
