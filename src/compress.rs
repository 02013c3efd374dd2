//! Interval compression for nightly rates.
//!
//! Given overlapping, prioritized price ranges, produce the minimal ordered
//! list of non-overlapping ranges that tells the channel what each night
//! costs. Day boundaries are the only points where the winner can change, so
//! the window is cut at every clipped range edge and each elementary segment
//! is decided independently.

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;

use crate::session::Key;

/// Half-open date span `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Overlapping or sharing an edge.
    pub fn touches(&self, other: &DateSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn clip(&self, window: &DateSpan) -> Option<DateSpan> {
        let clipped = DateSpan::new(self.start.max(window.start), self.end.min(window.end));
        (!clipped.is_empty()).then_some(clipped)
    }

    pub fn covers(&self, other: &DateSpan) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Merge spans that overlap or touch into disjoint, ordered spans.
pub fn merge_spans(mut spans: Vec<DateSpan>) -> Vec<DateSpan> {
    spans.retain(|s| !s.is_empty());
    spans.sort();
    let mut merged: Vec<DateSpan> = Vec::new();
    for span in spans {
        if let Some(last) = merged.last_mut() {
            if span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        }
        merged.push(span);
    }
    merged
}

/// Where a winning price came from.
///
/// Ordering doubles as the recency tie-break: a higher id was created later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceId {
    Base(Key),
    Rule(Key),
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Base(resource) => write!(f, "base:{resource}"),
            SourceId::Rule(rule) => write!(f, "rule:{rule}"),
        }
    }
}

impl Serialize for SourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedRange {
    pub span: DateSpan,
    pub price: i64,
    pub min_stay: i32,
    pub currency: String,
    pub important: bool,
    pub weight: i32,
    pub source: SourceId,
}

/// Resource-level default rate used where no range applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseRule {
    pub resource: Key,
    pub price: i64,
    pub min_stay: i32,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveRange {
    pub span: DateSpan,
    pub price: i64,
    pub min_stay: i32,
    pub currency: String,
    pub source: SourceId,
}

impl EffectiveRange {
    fn same_winner(&self, other: &EffectiveRange) -> bool {
        self.source == other.source
            && self.price == other.price
            && self.min_stay == other.min_stay
            && self.currency == other.currency
    }
}

/// Important beats unimportant, then higher weight, then the newer source.
fn rank(range: &WeightedRange) -> (bool, i32, SourceId) {
    (range.important, range.weight, range.source)
}

/// Compress `ranges` over `window`.
///
/// Sub-spans with no covering range take `fallback` when given and are left
/// out otherwise. Output spans are ordered, disjoint and maximal: two adjacent
/// outputs never carry the same winner.
pub fn compress(
    ranges: &[WeightedRange],
    window: DateSpan,
    fallback: Option<&BaseRule>,
) -> Vec<EffectiveRange> {
    if window.is_empty() {
        return Vec::new();
    }

    let clipped: Vec<(DateSpan, &WeightedRange)> = ranges
        .iter()
        .filter_map(|r| r.span.clip(&window).map(|span| (span, r)))
        .collect();

    let mut cuts = vec![window.start, window.end];
    for (span, _) in &clipped {
        cuts.push(span.start);
        cuts.push(span.end);
    }
    cuts.sort();
    cuts.dedup();

    let mut out: Vec<EffectiveRange> = Vec::new();
    for pair in cuts.windows(2) {
        let segment = DateSpan::new(pair[0], pair[1]);
        let winner = clipped
            .iter()
            .filter(|(span, _)| span.covers(&segment))
            .map(|(_, r)| *r)
            .max_by_key(|r| rank(r));

        let effective = match (winner, fallback) {
            (Some(r), _) => EffectiveRange {
                span: segment,
                price: r.price,
                min_stay: r.min_stay,
                currency: r.currency.clone(),
                source: r.source,
            },
            (None, Some(base)) => EffectiveRange {
                span: segment,
                price: base.price,
                min_stay: base.min_stay,
                currency: base.currency.clone(),
                source: SourceId::Base(base.resource),
            },
            (None, None) => continue,
        };

        match out.last_mut() {
            Some(last) if last.span.end == segment.start && last.same_winner(&effective) => {
                last.span.end = segment.end;
            }
            _ => out.push(effective),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, d).unwrap()
    }

    fn range(start: NaiveDate, end: NaiveDate, price: i64, weight: i32, important: bool, id: i64) -> WeightedRange {
        WeightedRange {
            span: DateSpan::new(start, end),
            price,
            min_stay: 1,
            currency: "EUR".into(),
            important,
            weight,
            source: SourceId::Rule(Key::Stored(id)),
        }
    }

    #[test]
    fn important_heavier_rule_takes_the_overlap() {
        let a = range(day(1, 1), day(1, 10), 100, 1, false, 1);
        let b = range(day(1, 5), day(1, 15), 80, 5, true, 2);
        let out = compress(&[a, b], DateSpan::new(day(1, 1), day(1, 15)), None);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].span, DateSpan::new(day(1, 1), day(1, 5)));
        assert_eq!(out[0].price, 100);
        assert_eq!(out[1].span, DateSpan::new(day(1, 5), day(1, 15)));
        assert_eq!(out[1].price, 80);
    }

    #[test]
    fn base_rate_fills_an_empty_window() {
        let base = BaseRule {
            resource: Key::Stored(7),
            price: 50,
            min_stay: 2,
            currency: "EUR".into(),
        };
        let out = compress(&[], DateSpan::new(day(3, 1), day(3, 3)), Some(&base));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].span, DateSpan::new(day(3, 1), day(3, 3)));
        assert_eq!(out[0].price, 50);
        assert_eq!(out[0].source.to_string(), "base:7");
    }

    #[test]
    fn gaps_without_fallback_are_omitted() {
        let a = range(day(1, 1), day(1, 3), 10, 0, false, 1);
        let b = range(day(1, 5), day(1, 7), 10, 0, false, 2);
        let out = compress(&[a, b], DateSpan::new(day(1, 1), day(1, 10)), None);
        let spans: Vec<_> = out.iter().map(|r| r.span).collect();
        assert_eq!(
            spans,
            vec![
                DateSpan::new(day(1, 1), day(1, 3)),
                DateSpan::new(day(1, 5), day(1, 7)),
            ]
        );
    }

    #[test]
    fn equal_rank_goes_to_newest_source() {
        let old = range(day(1, 1), day(1, 5), 10, 3, false, 4);
        let new = range(day(1, 1), day(1, 5), 20, 3, false, 9);
        let window = DateSpan::new(day(1, 1), day(1, 5));
        assert_eq!(compress(&[old.clone(), new.clone()], window, None)[0].price, 20);
        assert_eq!(compress(&[new, old], window, None)[0].price, 20);
    }

    #[test]
    fn split_ranges_of_one_winner_merge_back() {
        let base = range(day(1, 1), day(1, 20), 10, 0, false, 1);
        let mid = range(day(1, 5), day(1, 8), 30, 0, false, 2);
        // a lower-ranked range inside `base` must not split it
        let shadowed = range(day(1, 10), day(1, 12), 99, -1, false, 3);
        let out = compress(&[base, mid, shadowed], DateSpan::new(day(1, 1), day(1, 20)), None);
        let prices: Vec<_> = out.iter().map(|r| (r.span.start, r.span.end, r.price)).collect();
        assert_eq!(
            prices,
            vec![
                (day(1, 1), day(1, 5), 10),
                (day(1, 5), day(1, 8), 30),
                (day(1, 8), day(1, 20), 10),
            ]
        );
    }

    #[test]
    fn ranges_are_clipped_to_the_window() {
        let a = range(day(1, 1), day(2, 1), 10, 0, false, 1);
        let out = compress(&[a], DateSpan::new(day(1, 10), day(1, 12)), None);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].span, DateSpan::new(day(1, 10), day(1, 12)));
    }

    #[test]
    fn merge_spans_joins_touching_spans() {
        let merged = merge_spans(vec![
            DateSpan::new(day(1, 5), day(1, 8)),
            DateSpan::new(day(1, 1), day(1, 5)),
            DateSpan::new(day(1, 10), day(1, 11)),
        ]);
        assert_eq!(
            merged,
            vec![
                DateSpan::new(day(1, 1), day(1, 8)),
                DateSpan::new(day(1, 10), day(1, 11)),
            ]
        );
    }

    fn random_input(rng: &mut StdRng) -> Vec<WeightedRange> {
        let origin = day(1, 1);
        (0..rng.random_range(0..8))
            .map(|i| {
                let start = origin + chrono::Duration::days(rng.random_range(0..40));
                let end = start + chrono::Duration::days(rng.random_range(1..15));
                range(
                    start,
                    end,
                    rng.random_range(1..5) * 10,
                    rng.random_range(0..3),
                    rng.random_bool(0.3),
                    i + 1,
                )
            })
            .collect()
    }

    #[test]
    fn randomized_output_is_deterministic_disjoint_and_exact() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let base = BaseRule {
            resource: Key::Stored(1),
            price: 5,
            min_stay: 1,
            currency: "EUR".into(),
        };
        for round in 0..300 {
            let ranges = random_input(&mut rng);
            let window = DateSpan::new(day(1, 5), day(2, 10));
            let fallback = (round % 2 == 0).then_some(&base);

            let first = compress(&ranges, window, fallback);
            let second = compress(&ranges, window, fallback);
            assert_eq!(first, second, "round {round}");

            for pair in first.windows(2) {
                assert!(pair[0].span.end <= pair[1].span.start, "overlap in round {round}");
                if pair[0].span.end == pair[1].span.start {
                    assert!(!pair[0].same_winner(&pair[1]), "unmerged neighbours in round {round}");
                }
            }

            // Night by night, output must match a brute-force winner.
            let mut night = window.start;
            while night < window.end {
                let next = night.succ_opt().unwrap();
                let segment = DateSpan::new(night, next);
                let expected = ranges
                    .iter()
                    .filter(|r| r.span.covers(&segment))
                    .max_by_key(|r| rank(r))
                    .map(|r| r.price)
                    .or(fallback.map(|b| b.price));
                let actual = first
                    .iter()
                    .find(|r| r.span.covers(&segment))
                    .map(|r| r.price);
                assert_eq!(actual, expected, "night {night} in round {round}");
                night = next;
            }
        }
    }
}
