//! Per-item workflow: one fetched message in, one finalised record out.
use tracing::warn;

use crate::model::{HashtagSpan, ProcessingRecord, RawItem};
use crate::pipeline::Pipeline;

/// Classify a single item. Holds no state shared with other invocations.
pub async fn process_item(pipeline: &Pipeline, item: RawItem) -> ProcessingRecord {
    let text = strip_hashtags(&item.full_text, &item.hashtags);
    let mut record = ProcessingRecord::new(item, text);
    pipeline.classify(&mut record).await;
    record
}

/// Remove hashtag spans (character offsets) from `text`.
///
/// Spans are removed right to left so earlier offsets stay valid. Spans that
/// fall outside the text or overlap an already removed span are skipped.
pub fn strip_hashtags(text: &str, spans: &[HashtagSpan]) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    let mut ordered: Vec<&HashtagSpan> = spans.iter().collect();
    ordered.sort_by_key(|s| s.start);

    let mut limit = chars.len();
    for span in ordered.into_iter().rev() {
        if span.start >= span.end || span.end > limit {
            warn!(
                start = span.start,
                end = span.end,
                tag = %span.text,
                "skipping hashtag span outside the text"
            );
            continue;
        }
        chars.drain(span.start..span.end);
        limit = span.start;
    }
    chars.into_iter().collect()
}
