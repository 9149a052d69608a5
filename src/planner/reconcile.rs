//! Plan reconciliation (`cleanup_plan`): sort, consolidate
//! overlapping segments by priority, then shift adjacent segments together
//! to close small gaps.

use chrono::{DateTime, Duration, Utc};

use crate::models::ChargePlanSegment;

fn start_key(seg: &ChargePlanSegment) -> DateTime<Utc> {
    seg.charge_start.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn stop_key(seg: &ChargePlanSegment) -> DateTime<Utc> {
    seg.charge_stop.unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn to_start_opt(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if ts == DateTime::<Utc>::MIN_UTC { None } else { Some(ts) }
}

fn to_stop_opt(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if ts == DateTime::<Utc>::MAX_UTC { None } else { Some(ts) }
}

/// Idempotent: `cleanup_plan(cleanup_plan(p)) == cleanup_plan(p)`.
pub fn cleanup_plan(mut segments: Vec<ChargePlanSegment>) -> Vec<ChargePlanSegment> {
    if segments.is_empty() {
        return segments;
    }
    sort_segments(&mut segments);
    consolidate(&mut segments);
    if shift_pass(&mut segments) {
        consolidate(&mut segments);
    }
    segments
}

fn sort_segments(segs: &mut [ChargePlanSegment]) {
    segs.sort_by(|a, b| {
        start_key(a)
            .cmp(&start_key(b))
            .then_with(|| stop_key(b).cmp(&stop_key(a)))
            .then_with(|| a.charge_type.priority().cmp(&b.charge_type.priority()))
    });
}

fn consolidate(segs: &mut Vec<ChargePlanSegment>) {
    let mut i = 0;
    while i + 1 < segs.len() {
        let a_stop = stop_key(&segs[i]);
        let b_start = start_key(&segs[i + 1]);

        if b_start > a_stop {
            i += 1;
            continue;
        }

        let same_type = segs[i].charge_type == segs[i + 1].charge_type;
        let b_stop = stop_key(&segs[i + 1]);

        if same_type || b_stop <= a_stop {
            let new_stop = a_stop.max(b_stop);
            segs[i].charge_stop = to_stop_opt(new_stop);
            segs[i].level = segs[i].level.max(segs[i + 1].level);
            segs.remove(i + 1);
            if i > 0 {
                i -= 1;
            }
        } else if segs[i].level >= segs[i + 1].level {
            segs[i + 1].charge_start = to_start_opt(a_stop);
            i += 1;
        } else {
            segs[i].charge_stop = to_stop_opt(b_start);
            i += 1;
        }
    }
}

fn shift_pass(segs: &mut [ChargePlanSegment]) -> bool {
    let mut shifted = false;
    for i in 0..segs.len().saturating_sub(1) {
        let a_start = start_key(&segs[i]);
        let a_stop = stop_key(&segs[i]);
        let b_start = start_key(&segs[i + 1]);

        let gap_to_next = b_start - a_stop;
        let own_span_plus_hour = a_start - a_stop + Duration::hours(1);
        let shift = gap_to_next.min(own_span_plus_hour);

        if shift > Duration::zero() && a_stop + shift >= b_start {
            segs[i].charge_stop = to_stop_opt(b_start);
            segs[i].charge_start = to_start_opt(a_start + shift);
            shifted = true;
        }
    }
    shifted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChargeType;

    fn seg(start: Option<&str>, stop: Option<&str>, level: i32, t: ChargeType) -> ChargePlanSegment {
        ChargePlanSegment {
            charge_start: start.map(parse),
            charge_stop: stop.map(parse),
            level,
            charge_type: t,
            comment: String::new(),
        }
    }

    fn parse(s: &str) -> DateTime<Utc> {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap().and_utc()
    }

    #[test]
    fn overlap_with_lower_priority_truncates_the_earlier_segment() {
        let input = vec![
            seg(Some("2026-01-01 08:00"), Some("2026-01-01 10:00"), 70, ChargeType::Fill),
            seg(Some("2026-01-01 09:00"), Some("2026-01-01 11:00"), 80, ChargeType::Routine),
        ];
        let out = cleanup_plan(input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].charge_stop, Some(parse("2026-01-01 09:00")));
        assert_eq!(out[1].charge_start, Some(parse("2026-01-01 09:00")));
    }

    #[test]
    fn shift_pass_closes_small_gap() {
        let input = vec![
            seg(Some("2026-01-01 07:00"), Some("2026-01-01 07:30"), 60, ChargeType::Fill),
            seg(Some("2026-01-01 08:00"), Some("2026-01-01 09:00"), 70, ChargeType::Routine),
        ];
        let out = cleanup_plan(input);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].charge_start, Some(parse("2026-01-01 07:30")));
        assert_eq!(out[0].charge_stop, Some(parse("2026-01-01 08:00")));
    }

    #[test]
    fn cleanup_plan_is_idempotent() {
        let input = vec![
            seg(Some("2026-01-01 08:00"), Some("2026-01-01 10:00"), 70, ChargeType::Fill),
            seg(Some("2026-01-01 09:00"), Some("2026-01-01 11:00"), 80, ChargeType::Routine),
            seg(None, Some("2026-01-01 06:00"), 50, ChargeType::Minimum),
        ];
        let once = cleanup_plan(input);
        let twice = cleanup_plan(once.clone());
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.charge_start, b.charge_start);
            assert_eq!(a.charge_stop, b.charge_stop);
            assert_eq!(a.level, b.level);
        }
    }

    #[test]
    fn same_type_overlap_merges() {
        let input = vec![
            seg(Some("2026-01-01 08:00"), Some("2026-01-01 09:00"), 60, ChargeType::Fill),
            seg(Some("2026-01-01 08:30"), Some("2026-01-01 10:00"), 70, ChargeType::Fill),
        ];
        let out = cleanup_plan(input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].charge_stop, Some(parse("2026-01-01 10:00")));
        assert_eq!(out[0].level, 70);
    }
}
