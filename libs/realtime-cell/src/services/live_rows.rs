use uuid::Uuid;

use crate::{Notification, RowChange, TableRow};

/// Consumer-side copy of a watched table slice, newest first.
///
/// Both push events and polling snapshots funnel through [`LiveRows::apply`],
/// which reports whether anything actually changed so repeated identical
/// snapshots don't cause redundant re-renders.
#[derive(Debug, Clone)]
pub struct LiveRows<T> {
    rows: Vec<T>,
}

impl<T: TableRow + PartialEq> LiveRows<T> {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn apply(&mut self, change: RowChange<T>) -> bool {
        match change {
            RowChange::Inserted(row) | RowChange::Updated(row) => self.upsert(row),
            RowChange::Deleted(id) => {
                let before = self.rows.len();
                self.rows.retain(|row| row.row_id() != id);
                self.rows.len() != before
            }
            RowChange::Snapshot(rows) => {
                let mut deduped: Vec<T> = Vec::with_capacity(rows.len());
                for row in rows {
                    if !deduped.iter().any(|seen| seen.row_id() == row.row_id()) {
                        deduped.push(row);
                    }
                }

                if deduped == self.rows {
                    false
                } else {
                    self.rows = deduped;
                    true
                }
            }
        }
    }

    fn upsert(&mut self, row: T) -> bool {
        match self.rows.iter_mut().find(|existing| existing.row_id() == row.row_id()) {
            Some(existing) if *existing == row => false,
            Some(existing) => {
                *existing = row;
                true
            }
            None => {
                self.rows.insert(0, row);
                true
            }
        }
    }

    pub fn rows(&self) -> &[T] {
        &self.rows
    }

    pub fn get(&self, id: Uuid) -> Option<&T> {
        self.rows.iter().find(|row| row.row_id() == id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<T: TableRow + PartialEq> Default for LiveRows<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveRows<Notification> {
    pub fn unread_count(&self) -> usize {
        self.rows.iter().filter(|notification| !notification.is_read).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn notification(id: Uuid, minutes_ago: i64, is_read: bool) -> Notification {
        Notification {
            id,
            user_id: Uuid::nil(),
            title: "Reminder".to_string(),
            message: "Appointment in one hour".to_string(),
            notification_type: Some("appointment".to_string()),
            link: None,
            is_read,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[test]
    fn test_insert_is_prepended_and_deduplicated() {
        let mut feed = LiveRows::new();
        let first = notification(Uuid::new_v4(), 10, false);
        let second = notification(Uuid::new_v4(), 1, false);

        assert!(feed.apply(RowChange::Inserted(first.clone())));
        assert!(feed.apply(RowChange::Inserted(second.clone())));
        assert!(!feed.apply(RowChange::Inserted(second.clone())));

        assert_eq!(feed.len(), 2);
        assert_eq!(feed.rows()[0].id, second.id);
    }

    #[test]
    fn test_update_and_unread_count() {
        let mut feed = LiveRows::new();
        let id = Uuid::new_v4();
        let unread = notification(id, 5, false);

        feed.apply(RowChange::Inserted(unread.clone()));
        assert_eq!(feed.unread_count(), 1);

        let mut read = unread;
        read.is_read = true;
        assert!(feed.apply(RowChange::Updated(read)));
        assert_eq!(feed.unread_count(), 0);
        assert_eq!(feed.len(), 1);
    }

    #[test]
    fn test_delete() {
        let mut feed = LiveRows::new();
        let id = Uuid::new_v4();
        feed.apply(RowChange::Inserted(notification(id, 5, false)));

        assert!(feed.apply(RowChange::Deleted(id)));
        assert!(!feed.apply(RowChange::Deleted(id)));
        assert!(feed.is_empty());
    }

    #[test]
    fn test_identical_snapshot_is_not_a_change() {
        let mut feed = LiveRows::new();
        let rows = vec![
            notification(Uuid::new_v4(), 1, false),
            notification(Uuid::new_v4(), 2, true),
        ];

        assert!(feed.apply(RowChange::Snapshot(rows.clone())));
        assert!(!feed.apply(RowChange::Snapshot(rows.clone())));
        assert_eq!(feed.get(rows[1].id).map(|n| n.is_read), Some(true));
    }

    #[test]
    fn test_snapshot_drops_duplicate_ids() {
        let mut feed = LiveRows::new();
        let row = notification(Uuid::new_v4(), 1, false);

        feed.apply(RowChange::Snapshot(vec![row.clone(), row]));
        assert_eq!(feed.len(), 1);
    }
}
