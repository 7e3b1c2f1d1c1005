//! Placeholder substitution for masked renderings.

use super::types::Span;

/// Replace every span's range in `text` with its `[<TYPE>]` placeholder.
///
/// Substitution runs in descending start order so earlier offsets stay valid
/// while later ranges are rewritten. When several surviving spans cover the
/// same bytes (types are resolved independently), the first one substituted
/// wins and the rest are skipped rather than corrupting the rendering.
pub fn mask_spans(text: &str, spans: &[Span]) -> String {
    let mut ordered: Vec<&Span> = spans.iter().collect();
    ordered.sort_by(|a, b| b.start.cmp(&a.start).then(b.end.cmp(&a.end)));

    let mut masked = text.to_string();
    let mut masked_from = text.len().saturating_add(1);
    for span in ordered {
        if span.start >= span.end || span.end > text.len() {
            continue;
        }
        if span.end > masked_from {
            // Overlaps a range that was already replaced.
            continue;
        }
        if !masked.is_char_boundary(span.start) || !masked.is_char_boundary(span.end) {
            continue;
        }
        let placeholder = format!("[{}]", span.pii_type.name());
        masked.replace_range(span.start..span.end, &placeholder);
        masked_from = span.start;
    }
    masked
}
