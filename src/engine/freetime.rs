use chrono::{DateTime, Utc};

use crate::model::{Time, TimePeriod};

/// Half-open busy/free interval `[start, end)`.
pub type Window = (DateTime<Utc>, DateTime<Utc>);

// ── Free-window algorithm ────────────────────────────────────────

/// Chronological complement of the busy intervals within `[from, to)`.
/// Busy intervals may be unsorted and overlapping; anything outside the query
/// window is clamped away. Zero-length free windows are never produced.
pub fn free_windows(mut busy: Vec<Window>, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<TimePeriod> {
    if to <= from {
        return Vec::new();
    }

    busy.retain(|w| w.1 > from && w.0 < to);
    for w in &mut busy {
        w.0 = w.0.max(from);
        w.1 = w.1.min(to);
    }
    busy.sort_by_key(|w| w.0);
    let merged = merge_overlapping(&busy);

    subtract_windows(&[(from, to)], &merged)
        .into_iter()
        .map(|(start, end)| TimePeriod {
            from: Time::new(start),
            to: Time::new(end),
        })
        .collect()
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[Window]) -> Vec<Window> {
    let mut merged: Vec<Window> = Vec::new();
    for &window in sorted {
        if let Some(last) = merged.last_mut()
            && window.0 <= last.1
        {
            last.1 = last.1.max(window.1);
            continue;
        }
        merged.push(window);
    }
    merged
}

/// Subtract sorted disjoint `to_remove` windows from sorted `base` windows.
pub fn subtract_windows(base: &[Window], to_remove: &[Window]) -> Vec<Window> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.0;
        let current_end = b.1;

        while ri < to_remove.len() && to_remove[ri].1 <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].0 < current_end {
            let r = &to_remove[j];
            if r.0 > current_start {
                result.push((current_start, r.0));
            }
            current_start = current_start.max(r.1);
            j += 1;
        }

        if current_start < current_end {
            result.push((current_start, current_end));
        }
    }

    result
}
