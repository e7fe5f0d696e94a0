//! Alertmanager webhook types and alert identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Label carrying the alert's name.
pub const ALERT_NAME_LABEL: &str = "alertname";

/// Separator written after every label name and value when hashing.
const LABEL_SEPARATOR: u8 = 0xff;

/// Alertmanager webhook payload.
///
/// Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    /// Version of the payload format
    #[serde(default)]
    pub version: String,
    /// Unique identifier for this group of alerts
    #[serde(default)]
    pub group_key: String,
    /// Number of truncated alerts (if any)
    #[serde(default)]
    pub truncated_alerts: u32,
    /// Status: "firing" or "resolved"
    #[serde(default)]
    pub status: String,
    /// Receiver that matched this alert
    #[serde(default)]
    pub receiver: String,
    /// Labels common to all alerts in this group
    #[serde(default)]
    pub group_labels: HashMap<String, String>,
    /// Labels common to all alerts
    #[serde(default)]
    pub common_labels: HashMap<String, String>,
    /// Annotations common to all alerts
    #[serde(default)]
    pub common_annotations: HashMap<String, String>,
    /// External URL for Alertmanager
    #[serde(default, rename = "externalURL")]
    pub external_url: String,
    /// List of alerts in this notification
    pub alerts: Vec<Alert>,
}

/// Alert state as reported by Alertmanager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Individual alert from Alertmanager.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Firing or resolved
    pub status: AlertStatus,
    /// Alert labels
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Alert annotations
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// When the alert started firing
    pub starts_at: DateTime<Utc>,
    /// When the alert ended; Alertmanager sends the zero time while firing
    #[serde(default)]
    pub ends_at: DateTime<Utc>,
    /// URL of the rule that generated the alert
    #[serde(default, rename = "generatorURL")]
    pub generator_url: String,
    /// Alertmanager fingerprint
    #[serde(default)]
    pub fingerprint: String,
}

impl Alert {
    /// Get the alert name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get(ALERT_NAME_LABEL).map_or("N/A", String::as_str)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }

    /// Check whether the alert carries `label`, whatever its value.
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    /// Identity of this alert for debouncing.
    #[must_use]
    pub fn key(&self) -> AlertKey {
        AlertKey::from_labels(&self.labels)
    }
}

/// Deterministic SHA-256 identity of an alert's label set.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlertKey([u8; 32]);

impl AlertKey {
    /// Hash a label set. Labels are sorted first so map iteration order
    /// never changes the key.
    #[must_use]
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        let mut sorted: Vec<(&String, &String)> = labels.iter().collect();
        sorted.sort_unstable();

        let mut hasher = Sha256::new();
        for (name, value) in sorted {
            hasher.update(name.as_bytes());
            hasher.update([LABEL_SEPARATOR]);
            hasher.update(value.as_bytes());
            hasher.update([LABEL_SEPARATOR]);
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlertKey({})", &hex::encode(self.0)[..12])
    }
}
