//! Batch window.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub data: T,
    pub added_at: Instant,
    pub request_id: Option<String>,
}

impl<T> BatchItem<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            added_at: Instant::now(),
            request_id: None,
        }
    }
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Members waiting for one joint provider call, in submission order.
///
/// A window is open from its first member until `max_wait` has elapsed or
/// `max_members` have joined, whichever comes first.
#[derive(Debug)]
pub struct BatchWindow<T> {
    items: Vec<BatchItem<T>>,
    opened_at: Instant,
    max_wait: Duration,
    max_members: usize,
}

impl<T> BatchWindow<T> {
    pub fn open(max_wait: Duration, max_members: usize) -> Self {
        Self {
            items: Vec::new(),
            opened_at: Instant::now(),
            max_wait,
            max_members: max_members.max(1),
        }
    }

    pub fn add(&mut self, item: BatchItem<T>) -> BatchAddResult {
        self.items.push(item);
        let count = self.items.len();
        if count >= self.max_members {
            BatchAddResult::ShouldFlush { count }
        } else {
            BatchAddResult::Added { count }
        }
    }

    pub fn add_data(&mut self, data: T) -> BatchAddResult {
        self.add(BatchItem::new(data))
    }

    /// When the window must flush regardless of fill.
    pub fn deadline(&self) -> Instant {
        self.opened_at + self.max_wait
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn should_flush(&self) -> bool {
        !self.items.is_empty()
            && (self.items.len() >= self.max_members || Instant::now() >= self.deadline())
    }

    pub fn into_items(self) -> Vec<BatchItem<T>> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAddResult {
    Added { count: usize },
    ShouldFlush { count: usize },
}

impl BatchAddResult {
    pub fn should_flush(&self) -> bool {
        matches!(self, BatchAddResult::ShouldFlush { .. })
    }
    pub fn count(&self) -> usize {
        match self {
            BatchAddResult::Added { count } | BatchAddResult::ShouldFlush { count } => *count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_item_creation() {
        let item = BatchItem::new("test data").with_request_id("req-001");
        assert_eq!(item.data, "test data");
        assert_eq!(item.request_id, Some("req-001".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_empty() {
        let window: BatchWindow<String> = BatchWindow::open(Duration::from_millis(10), 5);
        assert!(window.is_empty());
        assert_eq!(window.len(), 0);
        tokio::time::advance(Duration::from_millis(20)).await;
        // nothing to flush
        assert!(!window.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_fills_to_max_members() {
        let mut window = BatchWindow::open(Duration::from_secs(1), 3);
        assert!(!window.add_data(1).should_flush());
        assert!(!window.add_data(2).should_flush());
        let result = window.add_data(3);
        assert!(result.should_flush());
        assert_eq!(result.count(), 3);
        assert!(window.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_flushes_at_deadline_with_one_member() {
        let mut window = BatchWindow::open(Duration::from_millis(25), 10);
        window.add_data("only");
        assert!(!window.should_flush());
        assert_eq!(window.deadline(), window.opened_at() + Duration::from_millis(25));
        tokio::time::advance(Duration::from_millis(25)).await;
        assert!(window.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_keep_submission_order() {
        let mut window = BatchWindow::open(Duration::from_secs(1), 10);
        window.add_data("a");
        window.add_data("b");
        window.add_data("c");
        let items: Vec<_> = window.into_items().into_iter().map(|i| i.data).collect();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_batch_add_result_methods() {
        let added = BatchAddResult::Added { count: 5 };
        let should_flush = BatchAddResult::ShouldFlush { count: 10 };
        assert!(!added.should_flush());
        assert_eq!(added.count(), 5);
        assert!(should_flush.should_flush());
        assert_eq!(should_flush.count(), 10);
    }
}
