//! Chunked prompt encoding for CLIP text encoders.
//!
//! CLIP only accepts 77 tokens per forward pass. Long prompts are tokenized
//! without truncation, split into consecutive 77-token groups, encoded group by
//! group, and the per-group embeddings are concatenated back along the
//! sequence axis:
//!
//! ```text
//! tokens:  [ 0 .. 77 )[ 77 .. 154 )[ 154 .. L )
//!              ↓            ↓            ↓
//! encoder: (B, 77, H)  (B, 77, H)   (B, L-154, H)
//!              └────────────┼────────────┘
//!                   cat on sequence axis
//!                           ↓
//!                      (B, L, H)
//! ```
//!
//! With classifier-free guidance the unconditional embedding is zero-padded to
//! the same sequence length and stacked in front of the conditional one.
//!
//! Tokenizer and text encoder are supplied by the caller through the
//! [`PromptTokenizer`] and [`TextEncoder`] traits, so this module stays free of
//! the `tokenizers` crate and of any particular model implementation.

use candle::{bail, DType, Device, Module, Result, Tensor, D};
use candle_nn::LayerNorm;
use tracing::{debug, info, trace};

use super::directive::get_clip_skip_from_prompt;
use super::interval::expand_interval_ranges;
use super::pairs::PromptPair;
use crate::config::{PromptConfig, MAX_TOKENS_PER_GROUP};

/// Epsilon of the normalization applied after skipping CLIP layers (PyTorch's default).
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Padding strategy for [`PromptTokenizer::tokenize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Leave every row at its natural length.
    None,
    /// Right-pad rows shorter than `model_max_length` with the pad token.
    MaxLength,
}

/// The tokenizer half of a text encoder.
pub trait PromptTokenizer {
    /// Context length of the text encoder (77 for CLIP).
    fn model_max_length(&self) -> usize;

    /// Token id used for padding.
    fn pad_token_id(&self) -> u32;

    /// Tokenize each text into one row of token ids.
    ///
    /// With `truncation` set, rows are cut to `model_max_length`.
    fn tokenize(&self, texts: &[String], padding: Padding, truncation: bool)
        -> Result<Vec<Vec<u32>>>;
}

/// Outputs of one text encoder forward pass.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Final hidden state, `(batch, seq, hidden)`.
    pub last_hidden_state: Tensor,
    /// Pooled output, unused by the prompt encoder.
    pub pooled_output: Tensor,
    /// Hidden state after every encoder layer, oldest first.
    pub hidden_states: Vec<Tensor>,
}

/// A text encoder mapping `(batch, seq)` token ids to embeddings.
pub trait TextEncoder {
    fn encode(&self, input_ids: &Tensor) -> Result<EncoderOutput>;
}

/// One prompt, or a batch of prompts encoded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Single(String),
    Batch(Vec<String>),
}

impl PromptInput {
    pub fn batch_size(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(texts) => texts.len(),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        match self {
            Self::Single(text) => vec![text.clone()],
            Self::Batch(texts) => texts.clone(),
        }
    }
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        Self::Single(text.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        Self::Single(text)
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(texts: Vec<String>) -> Self {
        Self::Batch(texts)
    }
}

/// Options for [`encode_prompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Number of images generated per prompt; each batch row is repeated this often.
    pub num_images_per_prompt: usize,
    /// Prepend the unconditional embedding for classifier-free guidance.
    pub do_classifier_free_guidance: bool,
    /// CLIP layers to skip unless the prompt carries a `<clip:...>` directive.
    pub skip_clip_states: usize,
    /// Width of each token group.
    pub max_tokens_per_group: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            num_images_per_prompt: 1,
            do_classifier_free_guidance: true,
            skip_clip_states: 0,
            max_tokens_per_group: MAX_TOKENS_PER_GROUP,
        }
    }
}

impl EncodeOptions {
    pub fn from_config(config: &PromptConfig) -> Self {
        Self {
            skip_clip_states: config.skip_clip_states,
            max_tokens_per_group: config.max_tokens_per_group,
            ..Self::default()
        }
    }
}

/// Create a parameter-free LayerNorm (equivalent to a freshly built `torch.nn.LayerNorm`).
fn layer_norm_no_affine(size: usize, device: &Device) -> Result<LayerNorm> {
    let weight = Tensor::ones(size, DType::F32, device)?;
    let bias = Tensor::zeros(size, DType::F32, device)?;
    Ok(LayerNorm::new(weight, bias, LAYER_NORM_EPS))
}

/// Texts for the unconditional embedding, one per batch row of `prompt`.
///
/// Fails when the negative prompt's shape does not match the positive one.
pub fn unconditional_texts(
    prompt: &PromptInput,
    negative: Option<&PromptInput>,
) -> Result<Vec<String>> {
    let batch_size = prompt.batch_size();
    match (prompt, negative) {
        (_, None) => Ok(vec![String::new(); batch_size]),
        (PromptInput::Single(_), Some(PromptInput::Single(negative))) => {
            Ok(vec![negative.clone(); batch_size])
        }
        (PromptInput::Batch(_), Some(PromptInput::Batch(negative))) => {
            if negative.len() != batch_size {
                bail!(
                    "negative prompt has batch size {}, but prompt has batch size {}",
                    negative.len(),
                    batch_size
                )
            }
            Ok(negative.clone())
        }
        (PromptInput::Single(_), Some(PromptInput::Batch(_))) => {
            bail!("negative prompt is a batch but prompt is a single string")
        }
        (PromptInput::Batch(_), Some(PromptInput::Single(_))) => {
            bail!("negative prompt is a single string but prompt is a batch")
        }
    }
}

/// Build a `(batch, len)` id tensor, right-padding rows to the longest one.
fn token_tensor(rows: &[Vec<u32>], pad_id: u32, device: &Device) -> Result<Tensor> {
    let len = rows.iter().map(Vec::len).max().unwrap_or(0);
    if len == 0 {
        bail!("tokenizer produced no tokens")
    }
    let mut ids = Vec::with_capacity(rows.len() * len);
    for row in rows {
        ids.extend_from_slice(row);
        ids.extend(std::iter::repeat(pad_id).take(len - row.len()));
    }
    Tensor::from_vec(ids, (rows.len(), len), device)
}

/// Split `(batch, len)` token ids into consecutive groups of at most `group_size` tokens.
///
/// Produces `ceil(len / group_size)` groups in order; the last one keeps its
/// natural length.
pub fn split_token_groups(input_ids: &Tensor, group_size: usize) -> Result<Vec<Tensor>> {
    if group_size == 0 {
        bail!("token group size must be positive")
    }
    let len = input_ids.dim(1)?;
    let groups_count = len.div_ceil(group_size);
    trace!(
        "splitting {:?} into {} groups",
        input_ids.dims(),
        groups_count
    );

    (0..groups_count)
        .map(|i| {
            let start = i * group_size;
            let end = (start + group_size).min(len);
            trace!("building group for token slice [{} : {}]", start, end);
            input_ids.narrow(1, start, end - start)
        })
        .collect()
}

/// Encode one token group, optionally swapping the final hidden state for a
/// normalized earlier layer.
fn encode_group<E>(encoder: &E, group: &Tensor, skip_clip_states: usize) -> Result<Tensor>
where
    E: TextEncoder + ?Sized,
{
    let output = encoder.encode(group)?;
    trace!(
        "text encoder produced {:?} and {} hidden states",
        output.last_hidden_state.dims(),
        output.hidden_states.len()
    );

    if skip_clip_states == 0 {
        return Ok(output.last_hidden_state);
    }

    let layers = output.hidden_states.len();
    if skip_clip_states > layers {
        bail!("cannot skip {skip_clip_states} CLIP layers, encoder returned {layers} hidden states")
    }
    let hidden = &output.hidden_states[layers - skip_clip_states];
    let norm = layer_norm_no_affine(hidden.dim(D::Minus1)?, hidden.device())?;
    let normed = norm.forward(&hidden.to_dtype(DType::F32)?)?;
    trace!(
        "normalized results after skipping {} layers: {:?}",
        skip_clip_states,
        normed.dims()
    );
    normed.to_dtype(hidden.dtype())
}

/// Repeat every batch row `n` times, keeping copies of a row adjacent.
fn repeat_rows(xs: &Tensor, n: usize) -> Result<Tensor> {
    if n == 1 {
        return Ok(xs.clone());
    }
    let (batch, seq, hidden) = xs.dims3()?;
    xs.unsqueeze(1)?
        .repeat((1, n, 1, 1))?
        .reshape((batch * n, seq, hidden))
}

/// Encode a prompt of any length into a `(batch, seq, hidden)` embedding.
///
/// The sequence length is the padded token count of the prompt, which may
/// exceed the encoder's context. With guidance enabled the result holds the
/// unconditional rows first and has twice the batch size.
pub fn encode_prompt<T, E>(
    tokenizer: &T,
    encoder: &E,
    prompt: &PromptInput,
    negative: Option<&PromptInput>,
    options: &EncodeOptions,
    device: &Device,
) -> Result<Tensor>
where
    T: PromptTokenizer + ?Sized,
    E: TextEncoder + ?Sized,
{
    if options.num_images_per_prompt == 0 {
        bail!("num_images_per_prompt must be positive")
    }
    let uncond_texts = unconditional_texts(prompt, negative)?;

    let mut skip_clip_states = options.skip_clip_states;
    let mut texts = Vec::with_capacity(prompt.batch_size());
    let mut clip_skip_found = false;
    for text in prompt.texts() {
        let (text, skip) = get_clip_skip_from_prompt(&text);
        if let Some(skip) = skip.filter(|_| !clip_skip_found) {
            info!("skipping {} CLIP layers", skip);
            skip_clip_states = skip;
            clip_skip_found = true;
        }
        texts.push(expand_interval_ranges(&text));
    }

    let rows = tokenizer.tokenize(&texts, Padding::MaxLength, false)?;
    let input_ids = token_tensor(&rows, tokenizer.pad_token_id(), device)?;
    let seq_len = input_ids.dim(1)?;

    let groups = split_token_groups(&input_ids, options.max_tokens_per_group)?;
    let mut group_embeds = Vec::with_capacity(groups.len());
    for (index, group) in groups.iter().enumerate() {
        let span = tracing::span!(tracing::Level::TRACE, "encode-group", index);
        let _enter = span.enter();
        trace!("encoding group: {:?}", group.dims());
        group_embeds.push(encode_group(encoder, group, skip_clip_states)?);
    }

    let prompt_embeds = Tensor::cat(&group_embeds, 1)?;
    let prompt_embeds = repeat_rows(&prompt_embeds, options.num_images_per_prompt)?;

    if !options.do_classifier_free_guidance {
        debug!("expanded prompt shape: {:?}", prompt_embeds.dims());
        return Ok(prompt_embeds);
    }

    let uncond_rows = tokenizer.tokenize(&uncond_texts, Padding::MaxLength, true)?;
    let uncond_ids = token_tensor(&uncond_rows, tokenizer.pad_token_id(), device)?;
    let negative_embeds = encoder.encode(&uncond_ids)?.last_hidden_state;

    let negative_len = negative_embeds.dim(1)?;
    if negative_len > seq_len {
        bail!("unconditional embedding has {negative_len} tokens, more than the prompt's {seq_len}")
    }
    let negative_padding = seq_len - negative_len;
    trace!(
        "padding negative prompt to match input: {:?}, {:?}, {} extra tokens",
        input_ids.dims(),
        negative_embeds.dims(),
        negative_padding
    );
    let negative_embeds = if negative_padding > 0 {
        negative_embeds.pad_with_zeros(1, 0, negative_padding)?
    } else {
        negative_embeds
    };
    let negative_embeds = repeat_rows(&negative_embeds, options.num_images_per_prompt)?;

    let embeds = Tensor::cat(&[&negative_embeds, &prompt_embeds], 0)?;
    debug!("expanded prompt shape: {:?}", embeds.dims());
    Ok(embeds)
}

/// Encode every prompt pair, in order, returning one embedding per pair.
///
/// Fails as a whole if any pair fails.
pub fn encode_prompt_pairs<T, E>(
    tokenizer: &T,
    encoder: &E,
    pairs: &[PromptPair],
    options: &EncodeOptions,
    device: &Device,
) -> Result<Vec<Tensor>>
where
    T: PromptTokenizer + ?Sized,
    E: TextEncoder + ?Sized,
{
    pairs
        .iter()
        .map(|pair| {
            let prompt = PromptInput::from(pair.positive.as_str());
            let negative = pair.negative.as_deref().map(PromptInput::from);
            encode_prompt(
                tokenizer,
                encoder,
                &prompt,
                negative.as_ref(),
                options,
                device,
            )
        })
        .collect()
}
