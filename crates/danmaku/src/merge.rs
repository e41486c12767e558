//! Danmaku merge engine.
//!
//! Folds repeated chat text in a batch of [`DisplayMessage`]s. Identical texts
//! are grouped, the best scoring groups are treated as high-energy bursts, and
//! every group is clustered in time. Ordinary clusters collapse into a single
//! `"<text> x<N>"` item; large high-energy clusters are promoted to
//! [`HighlightEvent`]s while their source items keep scrolling.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::message::{DisplayKind, DisplayMessage};

/// Tuning knobs of the merge engine. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Number of top-ranked groups treated as high-energy
    pub top_groups: usize,
    /// Clustering window for high-energy groups
    pub high_energy_window_ms: i64,
    /// Clustering window for every other group
    pub window_ms: i64,
    /// Minimum cluster size promoted to a highlight
    pub promotion_threshold: usize,
    /// Lower bound of a highlight's counter animation
    pub min_accumulation_ms: i64,
    /// Time a highlight stays after its counter settles
    pub hold_ms: i64,
    /// Minimum gap between consecutive highlights
    pub min_gap_ms: i64,
    /// Weight contribution to a group's score
    pub weight_factor: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            top_groups: 2,
            high_energy_window_ms: 3000,
            window_ms: 500,
            promotion_threshold: 5,
            min_accumulation_ms: 1500,
            hold_ms: 3000,
            min_gap_ms: 500,
            weight_factor: 0.5,
        }
    }
}

/// A promoted, screen-centered aggregation of repeated messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightEvent {
    pub content: String,
    pub start_time: i64,
    pub duration: i64,
    /// Number of source messages folded in
    pub count: u32,
    /// How long the on-screen counter takes to reach `count`
    pub accumulation_duration: i64,
}

impl HighlightEvent {
    pub fn end_time(&self) -> i64 {
        self.start_time.saturating_add(self.duration)
    }
}

/// Output of one merge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedBatchResult {
    pub standard_items: Vec<DisplayMessage>,
    pub highlight_items: Vec<HighlightEvent>,
}

impl MergedBatchResult {
    pub fn is_empty(&self) -> bool {
        self.standard_items.is_empty() && self.highlight_items.is_empty()
    }
}

/// Items sharing one exact text, in input order.
struct Group<'a> {
    content: &'a str,
    items: Vec<(usize, &'a DisplayMessage)>,
}

impl Group<'_> {
    fn score(&self, weight_factor: f64) -> f64 {
        let max_weight = self
            .items
            .iter()
            .filter_map(|(_, item)| item.weight)
            .max()
            .unwrap_or(0);
        self.items.len() as f64 + weight_factor * f64::from(max_weight)
    }
}

/// Merges batches with a fixed configuration.
#[derive(Debug, Clone, Default)]
pub struct DanmakuMerger {
    config: MergeConfig,
}

impl DanmakuMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge one time-ordered batch.
    pub fn merge(&self, batch: &[DisplayMessage]) -> MergedBatchResult {
        if batch.is_empty() {
            return MergedBatchResult::default();
        }

        let config = &self.config;
        // (sort key, input position of the first source item, item)
        let mut standard: Vec<(i64, usize, DisplayMessage)> = Vec::with_capacity(batch.len());
        let mut highlights = Vec::new();

        // Groups in order of first appearance, so equal scores rank stably
        let mut groups: Vec<Group<'_>> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (position, item) in batch.iter().enumerate() {
            if !item.is_mergeable() {
                standard.push((item.show_at, position, item.clone()));
                continue;
            }
            let slot = *index.entry(item.content.as_str()).or_insert_with(|| {
                groups.push(Group {
                    content: &item.content,
                    items: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot].items.push((position, item));
        }

        let mut ranked: Vec<(usize, f64)> = groups
            .iter()
            .enumerate()
            .filter(|(_, group)| group.items.len() >= 2)
            .map(|(slot, group)| (slot, group.score(config.weight_factor)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let mut high_energy = vec![false; groups.len()];
        for (slot, _) in ranked.into_iter().take(config.top_groups) {
            high_energy[slot] = true;
        }

        for (slot, group) in groups.iter().enumerate() {
            if group.items.len() == 1 {
                let (position, item) = group.items[0];
                standard.push((item.show_at, position, item.clone()));
                continue;
            }

            let is_high_energy = high_energy[slot];
            let window = if is_high_energy {
                config.high_energy_window_ms
            } else {
                config.window_ms
            };

            for cluster in cluster_by_gap(&group.items, window) {
                self.emit_cluster(
                    group.content,
                    cluster,
                    is_high_energy,
                    &mut standard,
                    &mut highlights,
                );
            }
        }

        standard.sort_by_key(|(show_at, position, _)| (*show_at, *position));
        highlights.sort_by_key(|event: &HighlightEvent| event.start_time);
        resolve_overlaps(&mut highlights, config.min_gap_ms);

        trace!(
            input = batch.len(),
            standard = standard.len(),
            highlights = highlights.len(),
            "Merged batch"
        );

        MergedBatchResult {
            standard_items: standard.into_iter().map(|(_, _, item)| item).collect(),
            highlight_items: highlights,
        }
    }

    fn emit_cluster(
        &self,
        content: &str,
        cluster: &[(usize, &DisplayMessage)],
        is_high_energy: bool,
        standard: &mut Vec<(i64, usize, DisplayMessage)>,
        highlights: &mut Vec<HighlightEvent>,
    ) {
        let (first_position, first) = cluster[0];

        if cluster.len() == 1 {
            standard.push((first.show_at, first_position, first.clone()));
            return;
        }

        let count = u32::try_from(cluster.len()).unwrap_or(u32::MAX);

        if is_high_energy && cluster.len() >= self.config.promotion_threshold {
            let last = cluster[cluster.len() - 1].1;
            let span = last.show_at.saturating_sub(first.show_at);
            let accumulation = span.max(self.config.min_accumulation_ms);
            highlights.push(HighlightEvent {
                content: content.to_string(),
                start_time: first.show_at,
                duration: accumulation.saturating_add(self.config.hold_ms),
                count,
                accumulation_duration: accumulation,
            });
            standard.extend(
                cluster
                    .iter()
                    .map(|(position, item)| (item.show_at, *position, (*item).clone())),
            );
            return;
        }

        let weight = cluster.iter().filter_map(|(_, item)| item.weight).max();
        let merged = DisplayMessage {
            content: format!("{content} x{count}"),
            show_at: first.show_at,
            weight,
            kind: DisplayKind::Text,
            merge_count: count,
        };
        standard.push((first.show_at, first_position, merged));
    }
}

/// Split a time-ordered run into clusters. An item joins the current cluster
/// when it follows the cluster's last item by at most `window_ms`.
fn cluster_by_gap<'a, 'b>(
    items: &'b [(usize, &'a DisplayMessage)],
    window_ms: i64,
) -> Vec<&'b [(usize, &'a DisplayMessage)]> {
    let mut clusters = Vec::new();
    let mut start = 0;
    for i in 1..items.len() {
        let gap = items[i].1.show_at.saturating_sub(items[i - 1].1.show_at);
        if gap > window_ms {
            clusters.push(&items[start..i]);
            start = i;
        }
    }
    if start < items.len() {
        clusters.push(&items[start..]);
    }
    clusters
}

/// Merge `batch` with the default configuration, clustering ordinary groups
/// with `interval_ms`.
pub fn merge(batch: &[DisplayMessage], interval_ms: i64) -> MergedBatchResult {
    DanmakuMerger::new(MergeConfig {
        window_ms: interval_ms,
        ..MergeConfig::default()
    })
    .merge(batch)
}

/// Push highlights apart so consecutive windows are at least `min_gap_ms`
/// apart.
///
/// Walks `events` in order (they are expected sorted by start time). An event
/// starting before the previous event's end plus the gap is moved to exactly
/// that point; durations never change. Already separated prefixes are left
/// untouched, so appending new events to a resolved list and resolving again
/// only moves the new ones.
pub fn resolve_overlaps(events: &mut [HighlightEvent], min_gap_ms: i64) {
    for i in 1..events.len() {
        let earliest = events[i - 1].end_time().saturating_add(min_gap_ms);
        if events[i].start_time < earliest {
            trace!(
                content = %events[i].content,
                from = events[i].start_time,
                to = earliest,
                "Deferring overlapping highlight"
            );
            events[i].start_time = earliest;
        }
    }
}
