//! Cross-detector span merging: dedup, per-type overlap resolution, and
//! provenance tagging.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use super::types::{PiiType, Span, SpanKey};

/// Relationship between the last kept span and the current candidate during
/// the overlap sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Overlap {
    None,
    KeptContainsCurrent,
    CurrentContainsKept,
    Partial,
}

/// Merges span lists coming from independent detectors into one consistent,
/// deterministic result.
///
/// Two stages run in order:
///
/// 1. Key-based dedup: spans with the same `(start, end, type, text)` key
///    collapse to the one with the highest score; score ties keep the first
///    seen in the stable detector iteration order.
/// 2. Per-type overlap resolution: within each type, contained spans are
///    dropped in favour of their container, and partial overlaps keep the
///    span that started earlier. Types are independent, so an EMAIL and a
///    TELEPHONENUM covering the same bytes both survive.
///
/// The output is sorted by `(start, end)`.
pub struct DetectionMerger {
    log_provenance: bool,
}

impl DetectionMerger {
    /// Build a merger; `log_provenance` additionally records discarded rivals
    /// in the winners' provenance sets and emits merge events.
    pub fn new(log_provenance: bool) -> Self {
        Self { log_provenance }
    }

    /// Merge per-detector span lists into the final ordered set.
    pub fn merge(&self, results: Vec<(String, Vec<Span>)>) -> Vec<Span> {
        let deduped = self.dedupe(results);
        let mut merged = self.resolve_overlapping(deduped);
        merged.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
        merged
    }

    fn dedupe(&self, results: Vec<(String, Vec<Span>)>) -> Vec<Span> {
        let mut order: Vec<SpanKey> = Vec::new();
        let mut kept: HashMap<SpanKey, (Span, String)> = HashMap::new();

        for (detector, spans) in results {
            for span in spans {
                let key = span.key();
                match kept.entry(key.clone()) {
                    Entry::Vacant(slot) => {
                        order.push(key);
                        slot.insert((span, detector.clone()));
                    }
                    Entry::Occupied(mut slot) => {
                        let (existing, holder) = slot.get_mut();
                        if span.score > existing.score {
                            if self.log_provenance {
                                tracing::info!(
                                    start = span.start,
                                    end = span.end,
                                    pii_type = existing.pii_type.name(),
                                    dropped = %holder,
                                    winner = %detector,
                                    old_score = existing.score,
                                    new_score = span.score,
                                    "Duplicate entity replaced by higher score"
                                );
                            }
                            let mut winner = span;
                            winner.provenance.append(&mut existing.provenance);
                            if self.log_provenance {
                                winner.provenance.push(holder.clone());
                            }
                            *existing = winner;
                            *holder = detector.clone();
                        } else if self.log_provenance {
                            tracing::info!(
                                start = span.start,
                                end = span.end,
                                pii_type = existing.pii_type.name(),
                                dropped = %detector,
                                winner = %holder,
                                "Duplicate entity discarded"
                            );
                            existing.provenance.push(detector.clone());
                        }
                    }
                }
            }
        }

        order
            .into_iter()
            .filter_map(|key| kept.remove(&key))
            .map(|(span, _)| span)
            .collect()
    }

    fn resolve_overlapping(&self, spans: Vec<Span>) -> Vec<Span> {
        let total = spans.len();
        let mut groups: BTreeMap<PiiType, Vec<Span>> = BTreeMap::new();
        for span in spans {
            groups.entry(span.pii_type).or_default().push(span);
        }

        let mut resolved = Vec::with_capacity(total);
        for (_, mut group) in groups {
            // Longer-first within equal starts so containment is a single
            // backwards comparison.
            group.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));

            let mut kept: Vec<Span> = Vec::new();
            for current in group {
                let Some(last) = kept.last_mut() else {
                    kept.push(current);
                    continue;
                };
                match check_overlap(last, &current) {
                    Overlap::None => kept.push(current),
                    Overlap::KeptContainsCurrent | Overlap::Partial => {
                        // Partial overlaps keep the earlier start, which the
                        // sort guarantees is the span already kept.
                        self.absorb(last, current);
                    }
                    Overlap::CurrentContainsKept => {
                        let loser = std::mem::replace(last, current);
                        self.absorb(last, loser);
                    }
                }
            }
            resolved.extend(kept);
        }

        if self.log_provenance && resolved.len() < total {
            tracing::info!(
                before = total,
                after = resolved.len(),
                "Overlap resolution removed entities"
            );
        }
        resolved
    }

    /// Record a dropped span on the winner's provenance set.
    fn absorb(&self, winner: &mut Span, mut loser: Span) {
        if self.log_provenance {
            winner.provenance.append(&mut loser.provenance);
            winner.provenance.push(loser.source.name().to_string());
        }
    }
}

fn check_overlap(kept: &Span, current: &Span) -> Overlap {
    if current.start >= kept.end || kept.start >= current.end {
        Overlap::None
    } else if kept.start <= current.start && current.end <= kept.end {
        Overlap::KeptContainsCurrent
    } else if current.start <= kept.start && kept.end <= current.end {
        Overlap::CurrentContainsKept
    } else {
        Overlap::Partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::DetectorSource;

    fn entity(text: &str, pii_type: PiiType, start: usize, end: usize, score: f32) -> Span {
        Span::new(text, pii_type, pii_type.name(), start, end, score, DetectorSource::Ml)
    }

    #[test]
    fn merges_entities_from_multiple_detectors() {
        let merger = DetectionMerger::new(false);
        let first = entity("test1", PiiType::Email, 0, 5, 0.9);
        let second = entity("test2", PiiType::Telephone, 10, 15, 0.8);
        let merged = merger.merge(vec![
            ("model1".into(), vec![first.clone()]),
            ("model2".into(), vec![second.clone()]),
        ]);
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&first));
        assert!(merged.contains(&second));
    }

    #[test]
    fn deduplicates_identical_entities_keeping_highest_score() {
        let merger = DetectionMerger::new(false);
        let merged = merger.merge(vec![
            ("model1".into(), vec![entity("test", PiiType::Email, 0, 4, 0.9)]),
            ("model2".into(), vec![entity("test", PiiType::Email, 0, 4, 0.8)]),
        ]);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn score_tie_keeps_first_detector_seen() {
        let merger = DetectionMerger::new(false);
        let mut first = entity("test", PiiType::Email, 0, 4, 0.9);
        first.detector_label = "first".into();
        let mut second = entity("test", PiiType::Email, 0, 4, 0.9);
        second.detector_label = "second".into();
        let merged = merger.merge(vec![
            ("model1".into(), vec![first]),
            ("model2".into(), vec![second]),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].detector_label, "first");
    }

    #[test]
    fn keeps_longer_span_when_contained() {
        let merger = DetectionMerger::new(false);
        let merged = merger.merge(vec![(
            "model1".into(),
            vec![
                entity("test", PiiType::Email, 0, 4, 0.9),
                entity("test@example.com", PiiType::Email, 0, 16, 0.8),
            ],
        )]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "test@example.com");
    }

    #[test]
    fn keeps_non_overlapping_entities() {
        let merger = DetectionMerger::new(false);
        let merged = merger.merge(vec![(
            "model1".into(),
            vec![
                entity("test1", PiiType::Email, 0, 5, 0.9),
                entity("test2", PiiType::Email, 10, 15, 0.8),
            ],
        )]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn partial_overlap_keeps_earlier_start() {
        let merger = DetectionMerger::new(false);
        let merged = merger.merge(vec![(
            "model1".into(),
            vec![
                entity("test1", PiiType::Email, 0, 8, 0.9),
                entity("test2", PiiType::Email, 5, 13, 0.95),
            ],
        )]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, 0);
    }

    #[test]
    fn types_resolve_independently() {
        let merger = DetectionMerger::new(false);
        let merged = merger.merge(vec![(
            "model1".into(),
            vec![
                entity("test", PiiType::Email, 0, 4, 0.9),
                entity("test@example.com", PiiType::Email, 0, 16, 0.8),
                entity("555-1234", PiiType::Telephone, 0, 8, 0.7),
            ],
        )]);
        assert_eq!(merged.len(), 2);
        let types: Vec<PiiType> = merged.iter().map(|span| span.pii_type).collect();
        assert!(types.contains(&PiiType::Email));
        assert!(types.contains(&PiiType::Telephone));
    }

    #[test]
    fn output_is_sorted_by_start_then_end() {
        let merger = DetectionMerger::new(false);
        let merged = merger.merge(vec![(
            "model1".into(),
            vec![
                entity("b", PiiType::Telephone, 20, 25, 0.8),
                entity("a", PiiType::Email, 3, 9, 0.9),
                entity("c", PiiType::City, 3, 5, 0.7),
            ],
        )]);
        let offsets: Vec<(usize, usize)> = merged.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(offsets, vec![(3, 5), (3, 9), (20, 25)]);
    }

    #[test]
    fn empty_input_merges_to_empty() {
        let merger = DetectionMerger::new(false);
        assert!(merger.merge(Vec::new()).is_empty());
    }

    #[test]
    fn provenance_records_discarded_detectors_when_enabled() {
        let merger = DetectionMerger::new(true);
        let merged = merger.merge(vec![
            ("model1".into(), vec![entity("test", PiiType::Email, 0, 4, 0.8)]),
            ("model2".into(), vec![entity("test", PiiType::Email, 0, 4, 0.9)]),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].provenance, vec!["model1".to_string()]);
    }

    #[test]
    fn provenance_stays_empty_when_disabled() {
        let merger = DetectionMerger::new(false);
        let merged = merger.merge(vec![
            ("model1".into(), vec![entity("test", PiiType::Email, 0, 4, 0.8)]),
            ("model2".into(), vec![entity("test", PiiType::Email, 0, 4, 0.9)]),
        ]);
        assert!(merged[0].provenance.is_empty());
    }

    #[test]
    fn overlap_classification_covers_all_cases() {
        let a = entity("a", PiiType::Email, 0, 5, 0.9);
        let b = entity("b", PiiType::Email, 10, 15, 0.8);
        assert_eq!(check_overlap(&a, &b), Overlap::None);

        let outer = entity("a", PiiType::Email, 0, 20, 0.9);
        let inner = entity("b", PiiType::Email, 5, 15, 0.8);
        assert_eq!(check_overlap(&outer, &inner), Overlap::KeptContainsCurrent);
        assert_eq!(check_overlap(&inner, &outer), Overlap::CurrentContainsKept);

        let left = entity("a", PiiType::Email, 0, 10, 0.9);
        let right = entity("b", PiiType::Email, 5, 15, 0.8);
        assert_eq!(check_overlap(&left, &right), Overlap::Partial);
    }
}
