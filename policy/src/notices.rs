//! User-visible notices
//!
//! A short newest-first strip of messages ("Expert assigned", "Request
//! escalated", transient failures). Older entries fall off the end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entries kept in a `NoticeLog`
pub const NOTICE_CAPACITY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub id: u64,
    pub message: String,
    pub kind: NoticeKind,
    pub timestamp: DateTime<Utc>,
}

/// Bounded newest-first notice log
#[derive(Debug)]
pub struct NoticeLog {
    entries: Mutex<VecDeque<Notice>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl NoticeLog {
    pub fn new() -> Self {
        Self::with_capacity(NOTICE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            next_id: AtomicU64::new(1),
            capacity,
        }
    }

    /// Push a notice to the front, trimming the oldest past capacity
    fn push(&self, message: impl Into<String>, kind: NoticeKind) -> Notice {
        let notice = Notice {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            message: message.into(),
            kind,
            timestamp: Utc::now(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.push_front(notice.clone());
        entries.truncate(self.capacity);
        notice
    }

    pub fn info(&self, message: impl Into<String>) -> Notice {
        self.push(message, NoticeKind::Info)
    }

    pub fn success(&self, message: impl Into<String>) -> Notice {
        self.push(message, NoticeKind::Success)
    }

    pub fn warning(&self, message: impl Into<String>) -> Notice {
        self.push(message, NoticeKind::Warning)
    }

    pub fn error(&self, message: impl Into<String>) -> Notice {
        self.push(message, NoticeKind::Error)
    }

    /// Newest first
    pub fn snapshot(&self) -> Vec<Notice> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<Notice> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .front()
            .cloned()
    }
}

impl Default for NoticeLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_first_and_bounded() {
        let log = NoticeLog::new();
        for i in 0..7 {
            log.info(format!("notice {}", i));
        }
        let notices = log.snapshot();
        assert_eq!(notices.len(), NOTICE_CAPACITY);
        assert_eq!(notices[0].message, "notice 6");
        assert_eq!(notices[4].message, "notice 2");
    }

    #[test]
    fn test_ids_increase() {
        let log = NoticeLog::new();
        let a = log.success("assigned");
        let b = log.warning("escalating");
        assert!(b.id > a.id);
        assert_eq!(log.latest().map(|n| n.kind), Some(NoticeKind::Warning));
        assert!(NoticeLog::new().latest().is_none());
    }
}
