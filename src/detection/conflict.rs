//! Deterministic type assignment when one position carries multiple labels.
//!
//! A single detector can tag the same span with several candidate types: a
//! bare number may satisfy both the social-security and phone patterns, and
//! the NER backend emits dual labels for ambiguous numeric runs. Resolution
//! must be reproducible across runs, so the strategy is strictly ordered:
//!
//! 1. Match the span text against a coarse group pattern (e.g. "mostly
//!    numeric, 8-24 chars").
//! 2. Within the matched group, test each candidate type's narrow pattern;
//!    if exactly one matches, that type wins.
//! 3. Otherwise fall back to a static priority table ordered by category
//!    risk (payment cards above government ids above phone numbers).
//! 4. Remaining ties go to the highest score, then to the lexicographically
//!    smallest type name.
//!
//! Validation here is regex-only; checksum validation (Luhn, IBAN mod-97) is
//! a detector-side concern that runs earlier.

use regex::Regex;
use std::collections::BTreeMap;

use super::types::{DetectorSource, PiiType, Span};

/// Narrow pattern identifying one candidate type inside a group.
struct TypeCandidate {
    pii_type: PiiType,
    pattern: Regex,
}

/// Coarse shape pattern with the narrow patterns that discriminate inside it.
struct ConflictGroup {
    group_pattern: Regex,
    candidates: Vec<TypeCandidate>,
}

/// Resolves multi-label conflicts deterministically.
pub struct ConflictResolver {
    groups: Vec<ConflictGroup>,
    priority: Vec<PiiType>,
}

impl ConflictResolver {
    /// Build a resolver with the built-in groups and risk priority table.
    pub fn new() -> Self {
        Self::with_priority(default_priority())
    }

    /// Build a resolver with a custom risk priority table (highest risk
    /// first); the group patterns stay built-in.
    pub fn with_priority(priority: Vec<PiiType>) -> Self {
        Self {
            groups: default_groups(),
            priority,
        }
    }

    /// Collapse multi-type span groups at identical positions.
    ///
    /// Spans are grouped by `(start, end, source)`; a group carrying more
    /// than one distinct type is replaced by the single winning span. Spans
    /// without rivals pass through untouched.
    pub fn resolve_conflicts(&self, spans: Vec<Span>) -> Vec<Span> {
        let mut groups: BTreeMap<(usize, usize, DetectorSource), Vec<Span>> = BTreeMap::new();
        for span in spans {
            groups
                .entry((span.start, span.end, span.source))
                .or_default()
                .push(span);
        }

        let mut resolved = Vec::new();
        for (_, mut group) in groups {
            let distinct_types = {
                let mut types: Vec<PiiType> = group.iter().map(|s| s.pii_type).collect();
                types.sort();
                types.dedup();
                types.len()
            };
            if distinct_types <= 1 {
                resolved.append(&mut group);
                continue;
            }

            let winner_index = self.pick(&group);
            let winner = group.swap_remove(winner_index);
            tracing::debug!(
                start = winner.start,
                end = winner.end,
                chosen = winner.pii_type.name(),
                discarded = group.len(),
                "Resolved multi-label conflict"
            );
            resolved.push(winner);
        }

        resolved.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
        resolved
    }

    /// Pick the winning candidate index for one conflicted position.
    fn pick(&self, candidates: &[Span]) -> usize {
        let text = &candidates[0].text;

        if let Some(group) = self
            .groups
            .iter()
            .find(|group| group.group_pattern.is_match(text))
        {
            let narrow_matches: Vec<usize> = candidates
                .iter()
                .enumerate()
                .filter(|(_, span)| {
                    group
                        .candidates
                        .iter()
                        .any(|candidate| {
                            candidate.pii_type == span.pii_type
                                && candidate.pattern.is_match(text)
                        })
                })
                .map(|(index, _)| index)
                .collect();
            if narrow_matches.len() == 1 {
                return narrow_matches[0];
            }
        }

        let rank = |span: &Span| {
            self.priority
                .iter()
                .position(|candidate| *candidate == span.pii_type)
                .unwrap_or(usize::MAX)
        };

        let mut best = 0;
        for index in 1..candidates.len() {
            let challenger = &candidates[index];
            let incumbent = &candidates[best];
            let challenger_rank = rank(challenger);
            let incumbent_rank = rank(incumbent);
            if challenger_rank < incumbent_rank {
                best = index;
            } else if challenger_rank == incumbent_rank {
                if challenger.score > incumbent.score {
                    best = index;
                } else if challenger.score == incumbent.score
                    && challenger.pii_type.name() < incumbent.pii_type.name()
                {
                    best = index;
                }
            }
        }
        best
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Risk-ordered fallback priority: payment cards, then government ids, then
/// phone numbers, then generic numeric categories.
fn default_priority() -> Vec<PiiType> {
    vec![
        PiiType::CreditCard,
        PiiType::SocialNum,
        PiiType::Iban,
        PiiType::PassportNum,
        PiiType::DriverLicense,
        PiiType::Telephone,
        PiiType::ZipCode,
    ]
}

fn default_groups() -> Vec<ConflictGroup> {
    vec![
        ConflictGroup {
            group_pattern: compiled(r"^[0-9 .\-+()]{8,24}$"),
            candidates: vec![
                TypeCandidate {
                    pii_type: PiiType::SocialNum,
                    pattern: compiled(r"^756\.\d{4}\.\d{4}\.\d{2}$|^\d{3}-\d{2}-\d{4}$"),
                },
                TypeCandidate {
                    pii_type: PiiType::CreditCard,
                    pattern: compiled(r"^\d(?:[ -]?\d){12,18}$"),
                },
                TypeCandidate {
                    pii_type: PiiType::Telephone,
                    pattern: compiled(r"^(?:\+\d{1,3}[ .\-]?)?\d(?:[ .\-]?\d){6,12}$"),
                },
                TypeCandidate {
                    pii_type: PiiType::ZipCode,
                    pattern: compiled(r"^\d{4,5}$"),
                },
            ],
        },
        ConflictGroup {
            group_pattern: compiled(r"^[A-Z0-9]{6,12}$"),
            candidates: vec![
                TypeCandidate {
                    pii_type: PiiType::PassportNum,
                    pattern: compiled(r"^[A-Z]\d{7,8}$"),
                },
                TypeCandidate {
                    pii_type: PiiType::DriverLicense,
                    pattern: compiled(r"^[A-Z]{2}\d{5,9}$"),
                },
            ],
        },
    ]
}

fn compiled(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in conflict pattern compiles")
}
