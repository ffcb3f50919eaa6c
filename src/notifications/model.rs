use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How loudly a notification should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Info,
  Success,
  Warning,
  Error,
}

impl Severity {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Info => "info",
      Self::Success => "success",
      Self::Warning => "warning",
      Self::Error => "error",
    }
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Severity {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "info" => Ok(Self::Info),
      "success" => Ok(Self::Success),
      "warning" | "warn" => Ok(Self::Warning),
      "error" => Ok(Self::Error),
      other => Err(eyre!("Unknown severity: {}", other)),
    }
  }
}

/// A user-facing alert.
///
/// Serialized in camelCase with `type`/`timestamp` field names so rows stay
/// readable by the web client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub id: String,
  pub title: String,
  pub message: String,
  #[serde(rename = "type")]
  pub severity: Severity,
  #[serde(rename = "timestamp")]
  pub created_at: DateTime<Utc>,
  pub read: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub action_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub action_label: Option<String>,
  /// Server-originated alerts that should stay until dismissed
  #[serde(default)]
  pub persistent: bool,
}

impl Notification {
  pub fn new(
    id: impl Into<String>,
    title: impl Into<String>,
    message: impl Into<String>,
    severity: Severity,
  ) -> Self {
    Self {
      id: id.into(),
      title: title.into(),
      message: message.into(),
      severity,
      created_at: Utc::now(),
      read: false,
      action_url: None,
      action_label: None,
      persistent: false,
    }
  }

  pub fn with_action(mut self, url: impl Into<String>, label: Option<String>) -> Self {
    self.action_url = Some(url.into());
    self.action_label = label;
    self
  }

  pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
    self.created_at = created_at;
    self
  }
}

/// Short relative age, e.g. "5m ago". Older than a week falls back to the date.
pub fn format_relative(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let diff = now - created;
  let minutes = diff.num_minutes();
  let hours = diff.num_hours();
  let days = diff.num_days();

  if minutes < 1 {
    "Just now".to_string()
  } else if minutes < 60 {
    format!("{}m ago", minutes)
  } else if hours < 24 {
    format!("{}h ago", hours)
  } else if days < 7 {
    format!("{}d ago", days)
  } else {
    created.format("%Y-%m-%d").to_string()
  }
}

/// Demo notifications used by `notify seed`.
pub fn sample_notifications(now: DateTime<Utc>) -> Vec<Notification> {
  vec![
    Notification::new(
      "sample-1",
      "Crop Health Alert",
      "Tomato crop in Field A showing signs of early blight. Immediate action recommended.",
      Severity::Warning,
    )
    .with_created_at(now - Duration::minutes(30))
    .with_action("/farms/field-a", Some("View Field".to_string())),
    Notification::new(
      "sample-2",
      "Weather Update",
      "Heavy rainfall expected in the next 24 hours. Consider protective measures.",
      Severity::Info,
    )
    .with_created_at(now - Duration::hours(2)),
    Notification {
      read: true,
      ..Notification::new(
        "sample-3",
        "Harvest Ready",
        "Corn in Field B has reached optimal harvest conditions.",
        Severity::Success,
      )
      .with_created_at(now - Duration::hours(6))
    },
  ]
}
