//! Prompt mini-language and chunked prompt encoding.
//!
//! A raw prompt goes through the following passes:
//!
//! ```text
//! raw prompt ──► <lora:..> ──► <inversion:..> ──► (a|b) alternatives ──► pairs
//!                directives     directives         variant list          with negatives
//!
//! pair ──► <clip:..> ──► tag-{0,3} ranges ──► tokenize ──► 77-token groups ──► embedding
//! ```
//!
//! The first row is [`parse_prompt`]; the second is [`encode_prompt_pairs`],
//! which needs a tokenizer and a text encoder from the caller.
//!
//! # Syntax
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `<lora:NAME:WEIGHT>` | Apply a LoRA adapter |
//! | `<inversion:NAME:WEIGHT>` | Apply a textual inversion |
//! | `<clip:NAME:LAYERS>` | Skip the last CLIP layers |
//! | `BASE-{START,END[,STEP]}` | Numbered tokens `BASE-START ...` up to `END` |
//! | `(A\|B\|C)` | One prompt variant per option |

pub mod alternative;
pub mod directive;
pub mod encode;
pub mod interval;
pub mod pairs;

pub use alternative::expand_alternative_ranges;
pub use directive::{
    extract_directives, get_clip_skip_from_prompt, get_inversions_from_prompt,
    get_loras_from_prompt, Directive, DirectiveKind,
};
pub use encode::{
    encode_prompt, encode_prompt_pairs, split_token_groups, unconditional_texts, EncodeOptions,
    EncoderOutput, Padding, PromptInput, PromptTokenizer, TextEncoder,
};
pub use interval::expand_interval_ranges;
pub use pairs::{reconcile_prompt_pairs, PromptPair};

use serde::Serialize;
use tracing::debug;

use crate::config::PromptConfig;

/// Result of [`parse_prompt`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedPrompt {
    /// Positive prompt with LoRA and inversion directives removed.
    pub prompt: String,
    /// Negative prompt with LoRA and inversion directives removed.
    pub negative_prompt: Option<String>,
    /// Prompt pairs to encode, one per variant.
    pub pairs: Vec<PromptPair>,
    /// LoRA directives, positive prompt first.
    pub loras: Vec<Directive>,
    /// Inversion directives, positive prompt first.
    pub inversions: Vec<Directive>,
}

fn negate(directives: &mut [Directive]) {
    for directive in directives {
        directive.weight = -directive.weight;
    }
}

/// Parse a raw prompt and optional negative prompt into encodable pairs.
///
/// LoRA directives are extracted before inversions. Directives from the
/// negative prompt are appended after the positive ones, sign-flipped when
/// `config.negate_negative_directives` is set. Both prompts are then expanded
/// into variants and paired up.
pub fn parse_prompt(
    prompt: &str,
    negative_prompt: Option<&str>,
    config: &PromptConfig,
) -> ParsedPrompt {
    let (prompt, mut loras) = get_loras_from_prompt(prompt);
    let (prompt, mut inversions) = get_inversions_from_prompt(&prompt);

    let negative_prompt = negative_prompt.map(|negative_prompt| {
        let (negative_prompt, mut neg_loras) = get_loras_from_prompt(negative_prompt);
        let (negative_prompt, mut neg_inversions) = get_inversions_from_prompt(&negative_prompt);
        if config.negate_negative_directives {
            negate(&mut neg_loras);
            negate(&mut neg_inversions);
        }
        loras.extend(neg_loras);
        inversions.extend(neg_inversions);
        negative_prompt
    });

    let prompts = expand_alternative_ranges(&prompt);
    let negative_prompts = negative_prompt.as_deref().map(expand_alternative_ranges);
    debug!(
        "expanded prompt into {} variants and negative prompt into {} variants",
        prompts.len(),
        negative_prompts.as_ref().map_or(0, Vec::len)
    );

    let pairs = reconcile_prompt_pairs(prompts, negative_prompts);
    ParsedPrompt {
        prompt,
        negative_prompt,
        pairs,
        loras,
        inversions,
    }
}
