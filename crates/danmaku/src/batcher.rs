//! Streaming merge windows.
//!
//! Live messages arrive one at a time while the merge engine works on
//! batches. [`MergeBatcher`] buffers display items for a batch window, merges
//! each closed window, and keeps the highlights it already scheduled so that
//! highlights of the next window are placed after them instead of on top.

use tracing::debug;

use crate::merge::{DanmakuMerger, HighlightEvent, MergeConfig, MergedBatchResult, resolve_overlaps};
use crate::message::DisplayMessage;

/// Default length of a batch window in milliseconds.
pub const DEFAULT_BATCH_WINDOW_MS: i64 = 1000;

#[derive(Debug)]
pub struct MergeBatcher {
    merger: DanmakuMerger,
    batch_window_ms: i64,
    pending: Vec<DisplayMessage>,
    /// Highlights handed out earlier that are still on screen
    scheduled: Vec<HighlightEvent>,
}

impl MergeBatcher {
    pub fn new(config: MergeConfig, batch_window_ms: i64) -> Self {
        Self {
            merger: DanmakuMerger::new(config),
            batch_window_ms: batch_window_ms.max(1),
            pending: Vec::new(),
            scheduled: Vec::new(),
        }
    }

    /// Queue an item for the current window.
    pub fn push(&mut self, item: DisplayMessage) {
        self.pending.push(item);
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Highlights still on screen at the last flush.
    pub fn scheduled(&self) -> &[HighlightEvent] {
        &self.scheduled
    }

    pub fn batch_window_ms(&self) -> i64 {
        self.batch_window_ms
    }

    /// Whether the window opened by the oldest pending item has elapsed.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.pending
            .first()
            .is_some_and(|first| now_ms.saturating_sub(first.show_at) >= self.batch_window_ms)
    }

    /// Merge everything pending.
    ///
    /// Returned highlights are already moved clear of highlights returned by
    /// earlier flushes that are still running at `now_ms`.
    pub fn flush(&mut self, now_ms: i64) -> MergedBatchResult {
        self.scheduled.retain(|event| event.end_time() > now_ms);

        if self.pending.is_empty() {
            return MergedBatchResult::default();
        }

        let mut batch = std::mem::take(&mut self.pending);
        // Arrival order can disagree with timestamps by a few ms
        batch.sort_by_key(|item| item.show_at);

        let mut result = self.merger.merge(&batch);
        if !result.highlight_items.is_empty() {
            let carried = self.scheduled.len();
            self.scheduled.append(&mut result.highlight_items);
            resolve_overlaps(&mut self.scheduled, self.merger.config().min_gap_ms);
            result.highlight_items = self.scheduled[carried..].to_vec();
        }

        debug!(
            items = batch.len(),
            standard = result.standard_items.len(),
            highlights = result.highlight_items.len(),
            "Flushed merge window"
        );
        result
    }

    /// Flush only when the current window has elapsed.
    pub fn poll(&mut self, now_ms: i64) -> Option<MergedBatchResult> {
        self.is_due(now_ms).then(|| self.flush(now_ms))
    }
}

impl Default for MergeBatcher {
    fn default() -> Self {
        Self::new(MergeConfig::default(), DEFAULT_BATCH_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst(batcher: &mut MergeBatcher, content: &str, start: i64, count: i64) {
        for i in 0..count {
            batcher.push(DisplayMessage::text(content, start + i * 50));
        }
    }

    #[test]
    fn test_window_due() {
        let mut batcher = MergeBatcher::default();
        assert!(!batcher.is_due(10_000));

        batcher.push(DisplayMessage::text("a", 100));
        assert!(!batcher.is_due(1099));
        assert!(batcher.is_due(1100));
        assert!(batcher.poll(500).is_none());

        let result = batcher.poll(1100).unwrap();
        assert_eq!(result.standard_items.len(), 1);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_highlights_across_windows_do_not_overlap() {
        let mut batcher = MergeBatcher::default();

        burst(&mut batcher, "first", 0, 5);
        let first = batcher.flush(1000);
        assert_eq!(first.highlight_items.len(), 1);
        let first = &first.highlight_items[0];
        assert_eq!((first.start_time, first.duration), (0, 4500));

        burst(&mut batcher, "second", 1000, 6);
        let second = batcher.flush(2000);
        assert_eq!(second.highlight_items.len(), 1);
        assert_eq!(second.highlight_items[0].start_time, 5000);
        assert_eq!(batcher.scheduled().len(), 2);
    }

    #[test]
    fn test_finished_highlights_are_forgotten() {
        let mut batcher = MergeBatcher::default();

        burst(&mut batcher, "first", 0, 5);
        batcher.flush(1000);

        burst(&mut batcher, "second", 20_000, 5);
        let result = batcher.flush(21_000);
        assert_eq!(result.highlight_items[0].start_time, 20_000);
        assert_eq!(batcher.scheduled().len(), 1);
    }

    #[test]
    fn test_flush_sorts_late_arrivals() {
        let mut batcher = MergeBatcher::default();
        batcher.push(DisplayMessage::text("b", 200));
        batcher.push(DisplayMessage::text("a", 100));

        let result = batcher.flush(2000);
        let order: Vec<_> = result
            .standard_items
            .iter()
            .map(|item| item.content.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }
}
