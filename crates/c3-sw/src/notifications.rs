//! Push display and notification click routing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::config::WorkerConfig;
use crate::error::{Result, ServiceWorkerError};

/// Action identifier that closes without navigating.
pub const ACTION_DISMISS: &str = "dismiss";
/// Action identifier that opens the notification URL.
pub const ACTION_OPEN: &str = "open";

/// Most notifications kept on screen; showing another closes the oldest.
pub const MAX_SHOWN: usize = 50;

/// Push message body. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
}

impl PushPayload {
    /// Decode a push message. Missing or malformed data yields an empty payload.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let Some(bytes) = data.filter(|b| !b.is_empty()) else {
            return Self::default();
        };
        match serde_json::from_slice(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Malformed push payload, using defaults");
                Self::default()
            }
        }
    }
}

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// Data carried to the click handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationData {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationOptions {
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
    pub actions: Vec<NotificationAction>,
}

/// A displayed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub options: NotificationOptions,
}

/// Result of a notification click.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Closed with no navigation.
    Dismissed,
    /// An existing window was focused.
    Focused(String),
    /// A new window was opened.
    Opened(String),
}

/// Notifications currently on screen.
pub struct Notifications {
    config: Arc<WorkerConfig>,
    shown: HashMap<String, Notification>,
    /// Shown IDs, oldest first.
    order: VecDeque<String>,
}

impl Notifications {
    pub fn new(config: Arc<WorkerConfig>) -> Self {
        Self {
            config,
            shown: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Build and show a notification for a push message.
    pub fn show_push(&mut self, data: Option<&[u8]>) -> Notification {
        let payload = PushPayload::parse(data);
        let defaults = &self.config.notifications;

        let notification = Notification {
            id: next_notification_id(),
            title: payload.title.unwrap_or_else(|| defaults.title.clone()),
            options: NotificationOptions {
                body: payload.body.unwrap_or_else(|| defaults.body.clone()),
                icon: defaults.icon.clone(),
                badge: defaults.badge.clone(),
                vibrate: defaults.vibrate.clone(),
                data: NotificationData {
                    url: payload.url.unwrap_or_else(|| defaults.url.clone()),
                },
                actions: vec![
                    NotificationAction {
                        action: ACTION_OPEN.to_string(),
                        title: "Open".to_string(),
                    },
                    NotificationAction {
                        action: ACTION_DISMISS.to_string(),
                        title: "Dismiss".to_string(),
                    },
                ],
            },
        };

        info!(id = %notification.id, title = %notification.title, "Showing notification");
        self.shown
            .insert(notification.id.clone(), notification.clone());
        self.order.push_back(notification.id.clone());
        while self.order.len() > MAX_SHOWN {
            if let Some(oldest) = self.order.pop_front() {
                self.shown.remove(&oldest);
                debug!(id = %oldest, "Closed oldest notification");
            }
        }
        notification
    }

    fn take(&mut self, id: &str) -> Option<Notification> {
        let notification = self.shown.remove(id)?;
        self.order.retain(|shown| shown != id);
        Some(notification)
    }

    /// Handle a click on a notification or one of its actions.
    ///
    /// The notification is closed first. Any action other than
    /// [`ACTION_DISMISS`], including a click on the body (`None`), routes to
    /// the notification URL.
    pub fn click(
        &mut self,
        id: &str,
        action: Option<&str>,
        clients: &mut Clients,
    ) -> Result<ClickOutcome> {
        let notification = self
            .take(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {id}")))?;

        if action == Some(ACTION_DISMISS) {
            debug!(id, "Notification dismissed");
            return Ok(ClickOutcome::Dismissed);
        }

        let target = self.config.resolve(&notification.options.data.url)?;
        let windows = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        };
        let existing = clients
            .match_all(&windows)
            .into_iter()
            .find(|c| c.url == target)
            .map(|c| c.id.clone());

        match existing {
            Some(client_id) => {
                clients.focus(&client_id)?;
                info!(id, client_id = %client_id, url = %target, "Focused existing window");
                Ok(ClickOutcome::Focused(client_id))
            }
            None => {
                let client = clients.open_window(target);
                info!(id, client_id = %client.id, url = %client.url, "Opened window");
                Ok(ClickOutcome::Opened(client.id))
            }
        }
    }

    /// Close without a click.
    pub fn close(&mut self, id: &str) -> bool {
        self.take(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.shown.get(id)
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

fn next_notification_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("notification-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
