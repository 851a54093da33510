use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::model::*;

use super::EngineError;

// ── Block generation ──────────────────────────────────────────────

/// Expand the active rules for `date`'s weekday into 30-minute base blocks.
///
/// `week[d]` holds the rules for weekday `d` (Sunday = 0). Active rules for a
/// day never overlap, so the output is sorted and disjoint. A rule whose
/// length is not a multiple of 30 ends in a shorter, clipped block.
///
/// Fails with `NoAvailabilityRules` when no active rule applies, which is
/// distinct from an `Ok` with no blocks.
pub fn generate_base_blocks(
    week: &[Vec<Rule>; 7],
    date: NaiveDate,
) -> Result<Vec<TimeBlock>, EngineError> {
    let mut rules: Vec<&Rule> = week[usize::from(day_of_week(date))]
        .iter()
        .filter(|r| r.active)
        .collect();
    if rules.is_empty() {
        return Err(EngineError::NoAvailabilityRules(date));
    }
    rules.sort_by_key(|r| r.span.start);

    let mut blocks = Vec::new();
    for rule in rules {
        let mut start = rule.span.start;
        while start < rule.span.end {
            let end = (start + BLOCK_MINUTES).min(rule.span.end);
            blocks.push(Span::new(start, end));
            start = end;
        }
    }
    Ok(blocks)
}

// ── Exclusion filtering ───────────────────────────────────────────

/// Subtract the union of `exclusions` from every block.
///
/// Each block yields zero, one or two pieces per exclusion that falls inside
/// it. The exclusions are merged first, so their order never matters.
pub fn filter_blocks(blocks: &[TimeBlock], exclusions: &[Span]) -> Vec<TimeBlock> {
    if exclusions.is_empty() {
        return blocks.to_vec();
    }
    let mut sorted = exclusions.to_vec();
    sorted.sort_by_key(|s| s.start);
    let merged = merge_overlapping(&sorted);
    subtract_intervals(blocks, &merged)
}

/// Parts of `range` not covered by `coverage` (any order, may overlap).
pub fn uncovered(range: &Span, coverage: &[Span]) -> Vec<Span> {
    let mut sorted = coverage.to_vec();
    sorted.sort_by_key(|s| s.start);
    subtract_intervals(&[*range], &merge_overlapping(&sorted))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove sorted, disjoint `to_remove` spans from sorted `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

// ── Slot composition ──────────────────────────────────────────────

pub fn check_duration(duration: i64) -> Result<Minute, EngineError> {
    let block = i64::from(BLOCK_MINUTES);
    if duration <= 0 || duration % block != 0 || duration > i64::from(Minute::MAX) {
        return Err(EngineError::InvalidDuration(duration));
    }
    Ok(duration as Minute)
}

/// Every `duration`-minute window inside the free blocks, stepping 30
/// minutes from the first grid minute of each contiguous run.
///
/// Blocks with `a.end == b.start` form one run. A grid-aligned run of length
/// `L` yields `(L - duration) / 30 + 1` slots when `L >= duration`, so
/// neighbouring slots overlap (10:00-11:30 and 10:30-12:00 for 90 minutes).
/// A run starting off the grid (a 09:15 rule, a blocked range ending at
/// 10:10) starts at the next multiple of 30, so every slot is reservable.
pub fn compose_slots(free: &[TimeBlock], duration: Minute) -> Result<Vec<Slot>, EngineError> {
    let duration = check_duration(i64::from(duration))?;
    let mut sorted = free.to_vec();
    sorted.sort_by_key(|b| b.start);

    let mut slots = Vec::new();
    for window in merge_overlapping(&sorted) {
        let mut start = u32::from(window.start).next_multiple_of(u32::from(BLOCK_MINUTES));
        while start + u32::from(duration) <= u32::from(window.end) {
            let s = start as Minute;
            slots.push(Slot {
                start: s,
                end: s + duration,
                duration,
            });
            start += u32::from(BLOCK_MINUTES);
        }
    }
    Ok(slots)
}

/// Batched `compose_slots`, keyed by duration.
pub fn compose_multiple(
    free: &[TimeBlock],
    durations: &[Minute],
) -> Result<BTreeMap<Minute, Vec<Slot>>, EngineError> {
    let mut out = BTreeMap::new();
    for &d in durations {
        if !out.contains_key(&d) {
            out.insert(d, compose_slots(free, d)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    // 2026-10-19 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn rule(day: DayOfWeek, start: Minute, end: Minute) -> Rule {
        Rule {
            id: Ulid::new(),
            court_id: Ulid::nil(),
            day_of_week: day,
            span: Span::new(start, end),
            price_override: None,
            active: true,
        }
    }

    fn week(rules: Vec<Rule>) -> [Vec<Rule>; 7] {
        let mut w: [Vec<Rule>; 7] = Default::default();
        for r in rules {
            w[usize::from(r.day_of_week)].push(r);
        }
        w
    }

    fn starts(slots: &[Slot]) -> Vec<Minute> {
        slots.iter().map(|s| s.start).collect()
    }

    // ── generate_base_blocks ──────────────────────────────

    #[test]
    fn monday_nine_to_six_yields_eighteen_blocks() {
        let w = week(vec![rule(1, 540, 1080)]);
        let blocks = generate_base_blocks(&w, monday()).unwrap();
        assert_eq!(blocks.len(), 18);
        assert_eq!(blocks[0], Span::new(540, 570));
        assert_eq!(blocks[17], Span::new(1050, 1080));
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn no_rule_for_weekday_is_an_error() {
        let w = week(vec![rule(2, 540, 1080)]);
        assert_eq!(
            generate_base_blocks(&w, monday()),
            Err(EngineError::NoAvailabilityRules(monday()))
        );
    }

    #[test]
    fn inactive_rules_do_not_generate() {
        let mut r = rule(1, 540, 1080);
        r.active = false;
        let w = week(vec![r]);
        assert!(matches!(
            generate_base_blocks(&w, monday()),
            Err(EngineError::NoAvailabilityRules(_))
        ));
    }

    #[test]
    fn two_rules_same_day_sorted_and_disjoint() {
        let w = week(vec![rule(1, 840, 960), rule(1, 540, 600)]);
        let blocks = generate_base_blocks(&w, monday()).unwrap();
        assert_eq!(
            blocks,
            vec![
                Span::new(540, 570),
                Span::new(570, 600),
                Span::new(840, 870),
                Span::new(870, 900),
                Span::new(900, 930),
                Span::new(930, 960),
            ]
        );
    }

    #[test]
    fn trailing_partial_block_is_clipped() {
        let w = week(vec![rule(1, 540, 615)]);
        let blocks = generate_base_blocks(&w, monday()).unwrap();
        assert_eq!(
            blocks,
            vec![Span::new(540, 570), Span::new(570, 600), Span::new(600, 615)]
        );
    }

    #[test]
    fn generation_is_deterministic() {
        let w = week(vec![rule(1, 540, 720), rule(1, 780, 1320)]);
        let a = generate_base_blocks(&w, monday()).unwrap();
        let b = generate_base_blocks(&w, monday()).unwrap();
        assert_eq!(a, b);
    }

    // ── filter_blocks ─────────────────────────────────────

    #[test]
    fn booking_splits_blocks() {
        let w = week(vec![rule(1, 540, 1080)]);
        let blocks = generate_base_blocks(&w, monday()).unwrap();
        let free = filter_blocks(&blocks, &[Span::new(600, 690)]);
        let runs = merge_overlapping(&free);
        assert_eq!(runs, vec![Span::new(540, 600), Span::new(690, 1080)]);
        assert!(free.iter().all(|b| !b.overlaps(&Span::new(600, 690))));
    }

    #[test]
    fn exclusion_inside_a_block_leaves_two_pieces() {
        let free = filter_blocks(&[Span::new(600, 630)], &[Span::new(610, 620)]);
        assert_eq!(free, vec![Span::new(600, 610), Span::new(620, 630)]);
    }

    #[test]
    fn exclusion_covering_block_leaves_nothing() {
        let free = filter_blocks(&[Span::new(600, 630)], &[Span::new(590, 640)]);
        assert!(free.is_empty());
    }

    #[test]
    fn exclusion_order_does_not_matter() {
        let w = week(vec![rule(1, 540, 1080)]);
        let blocks = generate_base_blocks(&w, monday()).unwrap();
        let excl = vec![
            Span::new(900, 960),
            Span::new(600, 690),
            Span::new(640, 700),
            Span::new(1000, 1010),
        ];
        let mut reversed = excl.clone();
        reversed.reverse();
        assert_eq!(filter_blocks(&blocks, &excl), filter_blocks(&blocks, &reversed));
    }

    #[test]
    fn uncovered_reports_gaps() {
        let coverage = vec![Span::new(780, 900), Span::new(540, 720)];
        assert!(uncovered(&Span::new(600, 660), &coverage).is_empty());
        assert_eq!(
            uncovered(&Span::new(690, 810), &coverage),
            vec![Span::new(720, 780)]
        );
    }

    #[test]
    fn adjacent_rules_cover_jointly() {
        let coverage = vec![Span::new(540, 720), Span::new(720, 900)];
        assert!(uncovered(&Span::new(690, 750), &coverage).is_empty());
    }

    // ── compose_slots ─────────────────────────────────────

    #[test]
    fn sixty_minute_slots_after_booking() {
        let w = week(vec![rule(1, 540, 1080)]);
        let blocks = generate_base_blocks(&w, monday()).unwrap();
        let free = filter_blocks(&blocks, &[Span::new(600, 690)]);
        let after: Vec<_> = free.into_iter().filter(|b| b.start >= 690).collect();
        let slots = compose_slots(&after, 60).unwrap();
        // 690..=1020 step 30
        assert_eq!(starts(&slots), (0..12).map(|i| 690 + i * 30).collect::<Vec<_>>());
        assert!(slots.iter().all(|s| s.start >= 690 && s.end <= 1080 && s.duration == 60));
    }

    #[test]
    fn ninety_minute_slots_overlap() {
        let slots = compose_slots(&[Span::new(600, 630), Span::new(630, 660), Span::new(660, 690), Span::new(690, 720)], 90).unwrap();
        assert_eq!(
            slots,
            vec![
                Slot { start: 600, end: 690, duration: 90 },
                Slot { start: 630, end: 720, duration: 90 },
            ]
        );
    }

    #[test]
    fn composition_count_matches_window_length() {
        for len in (30..=600).step_by(30) {
            for d in (30..=300).step_by(30) {
                let free = [Span::new(480, 480 + len)];
                let slots = compose_slots(&free, d).unwrap();
                let expected = if len >= d { (len - d) / 30 + 1 } else { 0 };
                assert_eq!(slots.len(), usize::from(expected), "L={len} d={d}");
            }
        }
    }

    #[test]
    fn off_grid_runs_snap_to_the_next_half_hour() {
        // free after a 09:00-10:10 blocked range
        let slots = compose_slots(&[Span::new(610, 630), Span::new(630, 780)], 60).unwrap();
        assert_eq!(starts(&slots), vec![630, 660, 690, 720]);

        // a 09:15-12:15 rule
        let w = week(vec![rule(1, 555, 735)]);
        let blocks = generate_base_blocks(&w, monday()).unwrap();
        let slots = compose_slots(&blocks, 60).unwrap();
        assert_eq!(starts(&slots), vec![570, 600, 630, 660]);
        assert!(slots.iter().all(|s| s.start % 30 == 0 && s.end <= 735));

        // too short once snapped
        assert!(compose_slots(&[Span::new(545, 620)], 60).unwrap().is_empty());
    }

    #[test]
    fn gap_breaks_contiguity() {
        let free = [Span::new(540, 570), Span::new(600, 630)];
        assert!(compose_slots(&free, 60).unwrap().is_empty());
        assert_eq!(compose_slots(&free, 30).unwrap().len(), 2);
    }

    #[test]
    fn invalid_durations_rejected() {
        let free = [Span::new(540, 600)];
        assert_eq!(compose_slots(&free, 0), Err(EngineError::InvalidDuration(0)));
        assert_eq!(compose_slots(&free, 45), Err(EngineError::InvalidDuration(45)));
        assert_eq!(check_duration(-30), Err(EngineError::InvalidDuration(-30)));
        assert_eq!(check_duration(90), Ok(90));
    }

    #[test]
    fn compose_multiple_keys_by_duration() {
        let free = [Span::new(540, 660)];
        let map = compose_multiple(&free, &[60, 30, 60]).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&30].len(), 4);
        assert_eq!(map[&60].len(), 3);
        assert!(compose_multiple(&free, &[60, 50]).is_err());
    }

    // ── merge / subtract ──────────────────────────────────

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn merge_adjacent_and_overlapping() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300), Span::new(250, 400), Span::new(500, 600)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_and_subtract_empty() {
        assert!(merge_overlapping(&[]).is_empty());
        assert!(subtract_intervals(&[], &[Span::new(0, 10)]).is_empty());
        assert_eq!(subtract_intervals(&[Span::new(0, 10)], &[]), vec![Span::new(0, 10)]);
    }
}
