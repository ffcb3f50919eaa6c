//! User-facing notifications: local store, realtime alerts and push handling.

mod alerts;
mod model;
mod push;
mod store;

pub use alerts::{spawn_alert_listener, AlertEvent};
pub use model::{format_relative, sample_notifications, Notification, Severity};
pub use push::{handle_push, resolve_click, ClickAction, ClientWindow, PlatformNotification};
pub use store::{NotificationStore, Toast, ToastAction};

#[cfg(test)]
mod tests {
  use super::{Notification, Severity, Toast, ToastAction};

  #[test]
  fn test_toast_action_is_public() {
    let notification = Notification::new("n1", "Harvest ready", "Field 3", Severity::Success)
      .with_action("/farms/3", None);
    let toast = Toast::from(&notification);
    assert_eq!(
      toast.action,
      Some(ToastAction {
        label: "View".to_string(),
        url: "/farms/3".to_string(),
      })
    );
  }
}
