use std::collections::VecDeque;

use uuid::Uuid;

use crate::models::{Notification, NotificationType};

pub const INBOX_CAPACITY: usize = 100;

/// In-memory notification list, newest first, holding at most `capacity` entries.
#[derive(Debug, Clone)]
pub struct Inbox {
    items: VecDeque<Notification>,
    capacity: usize,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::with_capacity(INBOX_CAPACITY)
    }
}

impl Inbox {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Inserts by timestamp. A notification sharing a timestamp with existing
    /// ones lands in front of them. Overflow evicts from the old end.
    pub fn push(&mut self, notification: Notification) {
        let position = self
            .items
            .iter()
            .position(|existing| existing.timestamp <= notification.timestamp)
            .unwrap_or(self.items.len());
        self.items.insert(position, notification);
        self.items.truncate(self.capacity);
    }

    pub fn extend(&mut self, notifications: impl IntoIterator<Item = Notification>) {
        for notification in notifications {
            self.push(notification);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn of_type(&self, notification_type: NotificationType) -> Vec<&Notification> {
        self.items
            .iter()
            .filter(|n| n.notification_type == notification_type)
            .collect()
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.read).count()
    }

    pub fn mark_read(&mut self, id: Uuid) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&mut self) {
        self.items.iter_mut().for_each(|n| n.read = true);
    }
}
