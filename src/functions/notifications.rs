//! Notification store of the functions service.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::StoreError;

/// Recipient id for notifications addressed to every user.
pub const BROADCAST: &str = "broadcast";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewEvent,
    EventUpdate,
    NewReview,
    NewInterest,
    FriendGoing,
    EventReminder,
    EventCancelled,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 7] = [
        NotificationKind::NewEvent,
        NotificationKind::EventUpdate,
        NotificationKind::NewReview,
        NotificationKind::NewInterest,
        NotificationKind::FriendGoing,
        NotificationKind::EventReminder,
        NotificationKind::EventCancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::NewEvent => "new_event",
            NotificationKind::EventUpdate => "event_update",
            NotificationKind::NewReview => "new_review",
            NotificationKind::NewInterest => "new_interest",
            NotificationKind::FriendGoing => "friend_going",
            NotificationKind::EventReminder => "event_reminder",
            NotificationKind::EventCancelled => "event_cancelled",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown notification type {:?}, expected one of {}", s, valid.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub user_id: String,
    pub event_id: Option<i64>,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        id: impl Into<String>,
        kind: NotificationKind,
        user_id: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            user_id: user_id.into(),
            event_id: None,
            title: title.into(),
            message: message.into(),
            data: Value::Object(Default::default()),
            read: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_event_id(mut self, event_id: i64) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Id of the notification caused by `source_event_id` for `recipient`.
///
/// The same envelope always yields the same id, so a redelivered event
/// does not notify twice.
pub fn notification_id(source_event_id: &str, recipient: &str) -> String {
    format!("{}:{}", source_event_id, recipient)
}

/// A user's notifications with counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserNotifications {
    pub total: usize,
    pub unread: usize,
    pub notifications: Vec<Notification>,
}

/// Where handlers deliver notifications.
pub trait NotificationSink: Send + Sync {
    /// Store `notification`. Returns `false` if one with the same id exists.
    fn send(&self, notification: Notification) -> Result<bool, StoreError>;
}

/// In-memory notification store. Clone-friendly via Arc.
#[derive(Clone, Default)]
pub struct InMemoryNotifications {
    storage: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications addressed to `user_id`, oldest first.
    pub fn for_user(&self, user_id: &str) -> Result<UserNotifications, StoreError> {
        let storage = self
            .storage
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        let notifications: Vec<Notification> = storage
            .iter()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        Ok(UserNotifications {
            total: notifications.len(),
            unread: notifications.iter().filter(|n| !n.read).count(),
            notifications,
        })
    }

    /// Mark one of `user_id`'s notifications as read.
    pub fn mark_read(&self, user_id: &str, id: &str) -> Result<(), StoreError> {
        let mut storage = self
            .storage
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        let notification = storage
            .iter_mut()
            .find(|n| n.id == id && n.user_id == user_id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        notification.read = true;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.storage.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationSink for InMemoryNotifications {
    fn send(&self, notification: Notification) -> Result<bool, StoreError> {
        let mut storage = self
            .storage
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".into()))?;
        if storage.iter().any(|n| n.id == notification.id) {
            return Ok(false);
        }
        storage.push(notification);
        Ok(true)
    }
}
