use chrono::NaiveDate;

use crate::calendar::{slot_span, Calendar};
use crate::model::*;

/// Free time inside `window` once every reserva on the given canchas is
/// removed. Pass the cancha together with its linked neighbors.
pub fn free_spans(canchas: &[&CanchaState], window: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = canchas
        .iter()
        .flat_map(|cs| cs.overlapping(window))
        .map(|r| r.span)
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);
    subtract_intervals(&[*window], &busy)
}

/// Start hours on `date` where a `hours`-long slot fits in `free` and hasn't started yet.
pub fn free_start_hours(cal: &Calendar, free: &[Span], date: NaiveDate, hours: u32, now: Ms) -> Vec<u32> {
    cal.start_hours()
        .filter(|&h| cal.within_hours(h, hours))
        .filter(|&h| {
            let slot = slot_span(date, h, hours);
            slot.start >= now && free.iter().any(|f| f.start <= slot.start && slot.end <= f.end)
        })
        .collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}
