// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! YAML QoS profile loader.
//!
//! # Example YAML
//!
//! ```yaml
//! default_profile: reliable_sensor
//! profiles:
//!   reliable_sensor:
//!     reliability: RELIABLE
//!     durability: TRANSIENT_LOCAL
//!     history:
//!       kind: KEEP_LAST
//!       depth: 100
//!     heartbeat_period_ms: 50
//!     flow_controller:
//!       name: uplink
//!       bytes_per_period: 131072
//!       period_ms: 10
//!       scheduler: ROUND_ROBIN
//! ```

use super::{
    Durability, FlowControllerConfig, FlowScheduler, History, PublishMode, QosProfile,
    Reliability, LENGTH_UNLIMITED,
};
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Root YAML document structure.
#[derive(Debug, Deserialize)]
pub struct YamlQosDocument {
    /// Named QoS profiles.
    #[serde(default)]
    pub profiles: HashMap<String, YamlQosProfile>,

    /// Default profile name (optional).
    #[serde(default)]
    pub default_profile: Option<String>,
}

/// A single QoS profile in YAML format. Missing fields keep `QosProfile::default()`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlQosProfile {
    /// RELIABLE or BEST_EFFORT
    pub reliability: Option<String>,
    /// VOLATILE or TRANSIENT_LOCAL
    pub durability: Option<String>,
    /// History configuration
    pub history: Option<YamlHistory>,
    /// Resource limits (-1 or absent = unlimited)
    pub resource_limits: Option<YamlResourceLimits>,
    /// SYNCHRONOUS or ASYNCHRONOUS
    pub publish_mode: Option<String>,
    pub max_blocking_time_ms: Option<u64>,
    pub heartbeat_period_ms: Option<u64>,
    pub nack_response_delay_ms: Option<u64>,
    pub nack_suppression_duration_ms: Option<u64>,
    pub heartbeat_response_delay_ms: Option<u64>,
    pub lease_duration_ms: Option<u64>,
    /// Flow controller (implies ASYNCHRONOUS)
    pub flow_controller: Option<YamlFlowController>,
}

/// History QoS in YAML.
#[derive(Debug, Deserialize)]
pub struct YamlHistory {
    /// KEEP_LAST or KEEP_ALL
    pub kind: String,
    /// Depth for KEEP_LAST
    #[serde(default = "default_history_depth")]
    pub depth: u32,
}

fn default_history_depth() -> u32 {
    1
}

/// Resource limits in YAML.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlResourceLimits {
    pub max_samples: Option<i64>,
    pub max_instances: Option<i64>,
    pub max_samples_per_instance: Option<i64>,
}

/// Flow controller in YAML.
#[derive(Debug, Deserialize)]
pub struct YamlFlowController {
    pub name: String,
    pub bytes_per_period: usize,
    pub period_ms: u64,
    /// FIFO or ROUND_ROBIN
    #[serde(default)]
    pub scheduler: Option<String>,
}

fn limit(value: Option<i64>) -> usize {
    match value {
        Some(v) if v >= 0 => v as usize,
        _ => LENGTH_UNLIMITED,
    }
}

impl YamlQosDocument {
    /// Parse a YAML document.
    pub fn parse(yaml_content: &str) -> Result<Self> {
        serde_yaml::from_str(yaml_content)
            .map_err(|e| Error::InvalidQos(format!("Failed to parse YAML: {}", e)))
    }

    /// Load and parse a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|_| Error::ConfigFileNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Resolve a named profile, or the default profile when `name` is `None`.
    pub fn profile(&self, name: Option<&str>) -> Result<QosProfile> {
        let name = match name {
            Some(n) => n,
            None => self.default_profile.as_deref().ok_or_else(|| {
                Error::InvalidQos("no profile name and no default_profile".to_string())
            })?,
        };
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| Error::InvalidQos(format!("Profile '{}' not found", name)))?;
        profile.to_qos()
    }
}

impl YamlQosProfile {
    /// Convert to a validated `QosProfile`.
    pub fn to_qos(&self) -> Result<QosProfile> {
        let mut qos = QosProfile::default();

        if let Some(rel) = &self.reliability {
            qos.reliability = match rel.to_uppercase().as_str() {
                "RELIABLE" => Reliability::Reliable,
                "BEST_EFFORT" => Reliability::BestEffort,
                other => {
                    return Err(Error::InvalidQos(format!("Unknown reliability: {}", other)))
                }
            };
        }

        if let Some(dur) = &self.durability {
            qos.durability = match dur.to_uppercase().as_str() {
                "VOLATILE" => Durability::Volatile,
                "TRANSIENT_LOCAL" => Durability::TransientLocal,
                other => {
                    return Err(Error::InvalidQos(format!("Unknown durability: {}", other)))
                }
            };
        }

        if let Some(hist) = &self.history {
            qos.history = match hist.kind.to_uppercase().as_str() {
                "KEEP_LAST" => History::KeepLast(hist.depth),
                "KEEP_ALL" => History::KeepAll,
                other => return Err(Error::InvalidQos(format!("Unknown history: {}", other))),
            };
        }

        if let Some(rl) = &self.resource_limits {
            qos.resource_limits.max_samples = limit(rl.max_samples);
            qos.resource_limits.max_instances = limit(rl.max_instances);
            qos.resource_limits.max_samples_per_instance = limit(rl.max_samples_per_instance);
        }

        if let Some(mode) = &self.publish_mode {
            qos.publish_mode = match mode.to_uppercase().as_str() {
                "SYNCHRONOUS" => PublishMode::Synchronous,
                "ASYNCHRONOUS" => PublishMode::Asynchronous,
                other => {
                    return Err(Error::InvalidQos(format!("Unknown publish mode: {}", other)))
                }
            };
        }

        let ms = Duration::from_millis;
        if let Some(v) = self.max_blocking_time_ms {
            qos.max_blocking_time = ms(v);
        }
        if let Some(v) = self.heartbeat_period_ms {
            qos.heartbeat_period = ms(v);
        }
        if let Some(v) = self.nack_response_delay_ms {
            qos.nack_response_delay = ms(v);
        }
        if let Some(v) = self.nack_suppression_duration_ms {
            qos.nack_suppression_duration = ms(v);
        }
        if let Some(v) = self.heartbeat_response_delay_ms {
            qos.heartbeat_response_delay = ms(v);
        }
        if let Some(v) = self.lease_duration_ms {
            qos.lease_duration = ms(v);
        }

        if let Some(fc) = &self.flow_controller {
            let scheduler = match fc.scheduler.as_deref().map(str::to_uppercase).as_deref() {
                None | Some("FIFO") => FlowScheduler::Fifo,
                Some("ROUND_ROBIN") => FlowScheduler::RoundRobin,
                Some(other) => {
                    return Err(Error::InvalidQos(format!(
                        "Unknown flow scheduler: {}",
                        other
                    )))
                }
            };
            qos.publish_mode = PublishMode::Asynchronous;
            qos.flow_controller = Some(FlowControllerConfig {
                name: fc.name.clone(),
                bytes_per_period: fc.bytes_per_period,
                period: ms(fc.period_ms),
                scheduler,
            });
        }

        qos.validate()?;
        Ok(qos)
    }
}

impl QosProfile {
    /// Parse `yaml` and return profile `name` (or the document default).
    pub fn from_yaml_str(yaml: &str, name: Option<&str>) -> Result<Self> {
        YamlQosDocument::parse(yaml)?.profile(name)
    }

    /// Load profile `name` (or the document default) from a YAML file.
    pub fn load_yaml<P: AsRef<Path>>(path: P, name: Option<&str>) -> Result<Self> {
        YamlQosDocument::load(path)?.profile(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
default_profile: sensor
profiles:
  sensor:
    reliability: reliable
    durability: TRANSIENT_LOCAL
    history:
      kind: KEEP_LAST
      depth: 8
    resource_limits:
      max_samples: 64
    heartbeat_period_ms: 20
  bulk:
    reliability: RELIABLE
    history:
      kind: KEEP_ALL
    flow_controller:
      name: uplink
      bytes_per_period: 131072
      period_ms: 10
      scheduler: ROUND_ROBIN
"#;

    #[test]
    fn test_default_profile() {
        let qos = QosProfile::from_yaml_str(DOC, None).expect("default profile should load");
        assert_eq!(qos.reliability, Reliability::Reliable);
        assert_eq!(qos.durability, Durability::TransientLocal);
        assert_eq!(qos.history, History::KeepLast(8));
        assert_eq!(qos.resource_limits.max_samples, 64);
        assert_eq!(qos.resource_limits.max_instances, LENGTH_UNLIMITED);
        assert_eq!(qos.heartbeat_period, Duration::from_millis(20));
    }

    #[test]
    fn test_flow_controller_profile() {
        let qos = QosProfile::from_yaml_str(DOC, Some("bulk")).expect("bulk should load");
        assert_eq!(qos.publish_mode, PublishMode::Asynchronous);
        let fc = qos.flow_controller.expect("flow controller configured");
        assert_eq!(fc.scheduler, FlowScheduler::RoundRobin);
        assert_eq!(fc.period, Duration::from_millis(10));
    }

    #[test]
    fn test_unknown_profile() {
        assert!(matches!(
            QosProfile::from_yaml_str(DOC, Some("nope")),
            Err(Error::InvalidQos(_))
        ));
    }

    #[test]
    fn test_invalid_reliability() {
        let doc = "profiles:\n  p:\n    reliability: SOMETIMES\n";
        assert!(QosProfile::from_yaml_str(doc, Some("p")).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            QosProfile::load_yaml("/nonexistent/qos.yaml", None),
            Err(Error::ConfigFileNotFound(_))
        ));
    }
}
