//! Push payload rendering and notification click routing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

const NOTIFICATION_ICON: &str = "/logo.svg";

/// Incoming push message body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
  pub title: String,
  #[serde(default)]
  pub body: String,
  #[serde(default)]
  pub data: Value,
  #[serde(default)]
  pub actions: Vec<PushAction>,
  #[serde(default)]
  pub require_interaction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAction {
  pub action: String,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
}

/// What gets handed to the platform notification API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformNotification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub data: Value,
  pub actions: Vec<PushAction>,
  pub require_interaction: bool,
}

impl From<PushPayload> for PlatformNotification {
  fn from(payload: PushPayload) -> Self {
    Self {
      title: payload.title,
      body: payload.body,
      icon: NOTIFICATION_ICON.to_string(),
      badge: NOTIFICATION_ICON.to_string(),
      data: payload.data,
      actions: payload.actions,
      require_interaction: payload.require_interaction,
    }
  }
}

/// Render a push message. No payload means nothing to show; a payload that
/// doesn't parse is logged and dropped.
pub fn handle_push(payload: Option<&[u8]>) -> Option<PlatformNotification> {
  let bytes = payload?;

  match serde_json::from_slice::<PushPayload>(bytes) {
    Ok(payload) => Some(payload.into()),
    Err(e) => {
      warn!("Dropping malformed push payload: {}", e);
      None
    }
  }
}

/// An open application window.
#[derive(Debug, Clone)]
pub struct ClientWindow {
  pub id: String,
  pub url: String,
  pub focusable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
  /// Bring an existing window to the front
  Focus { client_id: String },
  /// Open a new window at `url`
  OpenWindow { url: String },
}

/// Decide what a notification click does: focus a window already on our
/// origin, otherwise open `data.url` (or `/`).
pub fn resolve_click(data: &Value, clients: &[ClientWindow], origin: &str) -> ClickAction {
  if let Some(client) = clients
    .iter()
    .find(|c| c.focusable && c.url.contains(origin))
  {
    return ClickAction::Focus {
      client_id: client.id.clone(),
    };
  }

  let url = data
    .get("url")
    .and_then(Value::as_str)
    .unwrap_or("/")
    .to_string();
  ClickAction::OpenWindow { url }
}
