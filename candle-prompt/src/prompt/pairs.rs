//! Pairing of positive and negative prompt variants.

use serde::Serialize;
use tracing::trace;

/// One positive prompt and its optional negative counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptPair {
    pub positive: String,
    pub negative: Option<String>,
}

impl PromptPair {
    pub fn new(positive: impl Into<String>, negative: Option<String>) -> Self {
        Self {
            positive: positive.into(),
            negative,
        }
    }
}

/// Extend `items` to `len` by cycling through its own elements from the start.
fn cycle_to_len(mut items: Vec<String>, len: usize) -> Vec<String> {
    let count = items.len();
    for i in count..len {
        let item = items[i % count].clone();
        items.push(item);
    }
    items
}

/// Zip positive and negative variants into pairs.
///
/// Without negatives every pair has `negative: None`. Otherwise the shorter
/// list is extended cyclically to the length of the longer one, so the result
/// always has `max(positive.len(), negative.len())` pairs.
pub fn reconcile_prompt_pairs(
    positive: Vec<String>,
    negative: Option<Vec<String>>,
) -> Vec<PromptPair> {
    // Expansion never yields an empty list; an empty one has nothing to cycle.
    let negative = match negative {
        Some(negative) if !negative.is_empty() => negative,
        _ => {
            return positive
                .into_iter()
                .map(|p| PromptPair::new(p, None))
                .collect()
        }
    };
    let positive = if positive.is_empty() {
        vec![String::new()]
    } else {
        positive
    };

    let count = positive.len().max(negative.len());
    let positive = cycle_to_len(positive, count);
    let negative = cycle_to_len(negative, count);
    trace!("generated prompts: {:?}, {:?}", positive, negative);

    positive
        .into_iter()
        .zip(negative)
        .map(|(p, n)| PromptPair::new(p, Some(n)))
        .collect()
}
