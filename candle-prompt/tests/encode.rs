//! Chunked prompt encoding against mock CLIP collaborators.
//!
//! The mock tokenizer splits on whitespace and maps numeric words to their
//! value, so token ids can be read back out of the embeddings. The mock
//! encoder embeds each id `t` as `[t, t + 0.25, t + 0.5, t + 0.75]`, which
//! makes the original token order visible in every embedding. Hidden state
//! `l` adds `l` to the first feature only, so layers stay distinguishable after
//! layer normalization.

use std::cell::RefCell;

use candle::{bail, DType, Device, IndexOp, Result, Tensor};
use candle_prompt::prompt::{
    encode_prompt, encode_prompt_pairs, parse_prompt, EncodeOptions, EncoderOutput, Padding,
    PromptInput, PromptTokenizer, TextEncoder,
};
use candle_prompt::PromptConfig;

const BOS: u32 = 49406;
const EOS: u32 = 49407;
const HIDDEN: usize = 4;
const LAYERS: usize = 3;

struct MockTokenizer;

impl MockTokenizer {
    fn word_id(word: &str) -> u32 {
        word.parse()
            .unwrap_or_else(|_| 1000 + word.bytes().map(u32::from).sum::<u32>())
    }
}

impl PromptTokenizer for MockTokenizer {
    fn model_max_length(&self) -> usize {
        77
    }

    fn pad_token_id(&self) -> u32 {
        EOS
    }

    fn tokenize(
        &self,
        texts: &[String],
        padding: Padding,
        truncation: bool,
    ) -> Result<Vec<Vec<u32>>> {
        let max = self.model_max_length();
        Ok(texts
            .iter()
            .map(|text| {
                let mut ids = vec![BOS];
                ids.extend(text.split_whitespace().map(Self::word_id));
                ids.push(EOS);
                if truncation {
                    ids.truncate(max);
                }
                if padding == Padding::MaxLength && ids.len() < max {
                    ids.resize(max, EOS);
                }
                ids
            })
            .collect())
    }
}

#[derive(Default)]
struct MockEncoder {
    calls: RefCell<Vec<Vec<usize>>>,
}

impl MockEncoder {
    fn call_dims(&self) -> Vec<Vec<usize>> {
        self.calls.borrow().clone()
    }
}

impl TextEncoder for MockEncoder {
    fn encode(&self, input_ids: &Tensor) -> Result<EncoderOutput> {
        self.calls.borrow_mut().push(input_ids.dims().to_vec());
        let offsets = Tensor::new(&[0f32, 0.25, 0.5, 0.75], input_ids.device())?;
        let embed = input_ids
            .to_dtype(DType::F32)?
            .unsqueeze(2)?
            .broadcast_add(&offsets)?;
        let hidden_states = (0..LAYERS)
            .map(|layer| {
                let shift = Tensor::new(&[layer as f32, 0., 0., 0.], input_ids.device())?;
                embed.broadcast_add(&shift)
            })
            .collect::<Result<Vec<_>>>()?;
        let pooled_output = Tensor::zeros((input_ids.dim(0)?, HIDDEN), DType::F32, input_ids.device())?;
        Ok(EncoderOutput {
            last_hidden_state: embed,
            pooled_output,
            hidden_states,
        })
    }
}

struct FailingEncoder;

impl TextEncoder for FailingEncoder {
    fn encode(&self, _input_ids: &Tensor) -> Result<EncoderOutput> {
        bail!("encoder offline")
    }
}

fn numbered_prompt(words: usize) -> String {
    (1..=words)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

fn no_guidance() -> EncodeOptions {
    EncodeOptions {
        do_classifier_free_guidance: false,
        ..EncodeOptions::default()
    }
}

/// First hidden feature of every position in batch row `row`, i.e. the token ids.
fn token_column(embeds: &Tensor, row: usize) -> Result<Vec<f32>> {
    embeds.i((row, .., 0))?.to_vec1::<f32>()
}

#[test]
fn long_prompt_is_split_into_ordered_groups() -> Result<()> {
    let encoder = MockEncoder::default();
    // 148 words plus BOS and EOS is exactly 150 tokens.
    let prompt = PromptInput::from(numbered_prompt(148));

    let embeds = encode_prompt(
        &MockTokenizer,
        &encoder,
        &prompt,
        None,
        &no_guidance(),
        &Device::Cpu,
    )?;

    assert_eq!(encoder.call_dims(), vec![vec![1, 77], vec![1, 73]]);
    assert_eq!(embeds.dims(), &[1, 150, HIDDEN]);

    let mut expected = vec![BOS as f32];
    expected.extend((1..=148).map(|i| i as f32));
    expected.push(EOS as f32);
    assert_eq!(token_column(&embeds, 0)?, expected);
    Ok(())
}

#[test]
fn short_prompt_is_padded_to_one_group() -> Result<()> {
    let encoder = MockEncoder::default();
    let embeds = encode_prompt(
        &MockTokenizer,
        &encoder,
        &PromptInput::from("1 2 3"),
        None,
        &no_guidance(),
        &Device::Cpu,
    )?;

    assert_eq!(encoder.call_dims(), vec![vec![1, 77]]);
    assert_eq!(embeds.dims(), &[1, 77, HIDDEN]);
    let column = token_column(&embeds, 0)?;
    assert_eq!(&column[..5], &[BOS as f32, 1., 2., 3., EOS as f32]);
    assert!(column[5..].iter().all(|&t| t == EOS as f32));
    Ok(())
}

#[test]
fn guidance_prepends_padded_unconditional_embedding() -> Result<()> {
    let encoder = MockEncoder::default();
    let embeds = encode_prompt(
        &MockTokenizer,
        &encoder,
        &PromptInput::from(numbered_prompt(148)),
        Some(&PromptInput::from("7 8")),
        &EncodeOptions::default(),
        &Device::Cpu,
    )?;

    assert_eq!(
        encoder.call_dims(),
        vec![vec![1, 77], vec![1, 73], vec![1, 77]]
    );
    assert_eq!(embeds.dims(), &[2, 150, HIDDEN]);

    let uncond = token_column(&embeds, 0)?;
    assert_eq!(&uncond[..4], &[BOS as f32, 7., 8., EOS as f32]);
    assert!(uncond[4..77].iter().all(|&t| t == EOS as f32));
    assert!(uncond[77..].iter().all(|&t| t == 0.0));

    let padding = embeds.i((0, 77.., ..))?.abs()?.sum_all()?.to_scalar::<f32>()?;
    assert_eq!(padding, 0.0);

    let cond = token_column(&embeds, 1)?;
    assert_eq!(cond[1], 1.0);
    assert_eq!(cond[148], 148.0);
    Ok(())
}

#[test]
fn empty_negative_is_used_without_negative_prompt() -> Result<()> {
    let encoder = MockEncoder::default();
    let embeds = encode_prompt(
        &MockTokenizer,
        &encoder,
        &PromptInput::from("5"),
        None,
        &EncodeOptions::default(),
        &Device::Cpu,
    )?;
    let uncond = token_column(&embeds, 0)?;
    assert_eq!(&uncond[..2], &[BOS as f32, EOS as f32]);
    Ok(())
}

#[test]
fn images_per_prompt_repeats_rows() -> Result<()> {
    let encoder = MockEncoder::default();
    let options = EncodeOptions {
        num_images_per_prompt: 3,
        ..EncodeOptions::default()
    };
    let embeds = encode_prompt(
        &MockTokenizer,
        &encoder,
        &PromptInput::from("1 2"),
        Some(&PromptInput::from("9")),
        &options,
        &Device::Cpu,
    )?;

    assert_eq!(embeds.dims(), &[6, 77, HIDDEN]);
    for row in 0..3 {
        assert_eq!(token_column(&embeds, row)?[1], 9.0);
        assert_eq!(token_column(&embeds, row + 3)?[1], 1.0);
    }
    Ok(())
}

#[test]
fn batch_rows_repeat_consecutively() -> Result<()> {
    let encoder = MockEncoder::default();
    let options = EncodeOptions {
        num_images_per_prompt: 2,
        do_classifier_free_guidance: false,
        ..EncodeOptions::default()
    };
    let prompt = PromptInput::from(vec!["1".to_string(), "2".to_string()]);
    let embeds = encode_prompt(&MockTokenizer, &encoder, &prompt, None, &options, &Device::Cpu)?;

    assert_eq!(embeds.dims(), &[4, 77, HIDDEN]);
    let firsts: Vec<f32> = (0..4)
        .map(|row| token_column(&embeds, row).map(|c| c[1]))
        .collect::<Result<_>>()?;
    assert_eq!(firsts, vec![1., 1., 2., 2.]);
    Ok(())
}

/// Parameter-free layer norm of one hidden vector, eps 1e-5.
fn normalized(values: &[f32]) -> Vec<f32> {
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    values
        .iter()
        .map(|v| (v - mean) / (var + 1e-5).sqrt())
        .collect()
}

#[test]
fn clip_directive_selects_normalized_hidden_state() -> Result<()> {
    for skip in 1..=LAYERS {
        let encoder = MockEncoder::default();
        let embeds = encode_prompt(
            &MockTokenizer,
            &encoder,
            &PromptInput::from(format!("<clip:skip:{skip}> 1 2")),
            None,
            &no_guidance(),
            &Device::Cpu,
        )?;
        assert_eq!(embeds.dims(), &[1, 77, HIDDEN]);

        // Token `1` at position 1, read from hidden state `LAYERS - skip`.
        let layer = (LAYERS - skip) as f32;
        let expected = normalized(&[1. + layer, 1.25, 1.5, 1.75]);
        let position = embeds.i((0, 1))?.to_vec1::<f32>()?;
        for (got, want) in position.iter().zip(&expected) {
            assert!(
                (got - want).abs() < 1e-3,
                "skip {skip}: got {position:?}, expected {expected:?}"
            );
        }
    }
    Ok(())
}

#[test]
fn clip_directive_overrides_configured_skip() -> Result<()> {
    let options = EncodeOptions {
        skip_clip_states: LAYERS + 1,
        do_classifier_free_guidance: false,
        ..EncodeOptions::default()
    };

    let too_deep = encode_prompt(
        &MockTokenizer,
        &MockEncoder::default(),
        &PromptInput::from("1 2"),
        None,
        &options,
        &Device::Cpu,
    );
    assert!(too_deep.is_err());

    let embeds = encode_prompt(
        &MockTokenizer,
        &MockEncoder::default(),
        &PromptInput::from("<clip:skip:0> 1 2"),
        None,
        &options,
        &Device::Cpu,
    )?;
    assert_eq!(token_column(&embeds, 0)?[1], 1.0);
    Ok(())
}

#[test]
fn interval_ranges_are_expanded_before_tokenizing() -> Result<()> {
    let encoder = MockEncoder::default();
    let embeds = encode_prompt(
        &MockTokenizer,
        &encoder,
        &PromptInput::from("1 x-{0,3}"),
        None,
        &no_guidance(),
        &Device::Cpu,
    )?;
    let column = token_column(&embeds, 0)?;
    let x0 = MockTokenizer::word_id("x-0") as f32;
    let x2 = MockTokenizer::word_id("x-2") as f32;
    assert_eq!(column[2], x0);
    assert_eq!(column[4], x2);
    assert_eq!(column[5], EOS as f32);
    Ok(())
}

#[test]
fn shape_mismatch_fails_before_encoding() {
    let encoder = MockEncoder::default();
    let negative = PromptInput::from(vec!["a".to_string(), "b".to_string()]);
    let result = encode_prompt(
        &MockTokenizer,
        &encoder,
        &PromptInput::from("1 2"),
        Some(&negative),
        &EncodeOptions::default(),
        &Device::Cpu,
    );
    assert!(result.is_err());
    assert!(encoder.call_dims().is_empty());

    let batch = PromptInput::from(vec!["1".to_string(), "2".to_string()]);
    let short = PromptInput::from(vec!["a".to_string()]);
    let result = encode_prompt(
        &MockTokenizer,
        &encoder,
        &batch,
        Some(&short),
        &EncodeOptions::default(),
        &Device::Cpu,
    );
    assert!(result.is_err());
    assert!(encoder.call_dims().is_empty());
}

#[test]
fn encoder_failure_propagates() {
    let parsed = parse_prompt("(1|2)", None, &PromptConfig::default());
    let result = encode_prompt_pairs(
        &MockTokenizer,
        &FailingEncoder,
        &parsed.pairs,
        &EncodeOptions::default(),
        &Device::Cpu,
    );
    let err = result.unwrap_err();
    assert!(err.to_string().contains("encoder offline"));
}

#[test]
fn parsed_pairs_encode_to_guided_batches() -> Result<()> {
    let config = PromptConfig::default();
    let parsed = parse_prompt(
        "<lora:ink:0.5>(1|2|3) 4",
        Some("(8|9)"),
        &config,
    );
    assert_eq!(parsed.pairs.len(), 3);

    for (num_images, guidance) in [(1, true), (2, true), (2, false)] {
        let options = EncodeOptions {
            num_images_per_prompt: num_images,
            do_classifier_free_guidance: guidance,
            ..EncodeOptions::from_config(&config)
        };
        let encoder = MockEncoder::default();
        let embeds =
            encode_prompt_pairs(&MockTokenizer, &encoder, &parsed.pairs, &options, &Device::Cpu)?;

        assert_eq!(embeds.len(), parsed.pairs.len());
        let total: usize = embeds.iter().map(|e| e.dim(0)).sum::<Result<usize>>()?;
        let factor = if guidance { 2 } else { 1 };
        assert_eq!(total, factor * num_images * parsed.pairs.len());
    }

    let encoder = MockEncoder::default();
    let embeds = encode_prompt_pairs(
        &MockTokenizer,
        &encoder,
        &parsed.pairs,
        &EncodeOptions::default(),
        &Device::Cpu,
    )?;
    // Third pair cycles back to the first negative variant.
    assert_eq!(token_column(&embeds[2], 0)?[1], 8.0);
    assert_eq!(token_column(&embeds[2], 1)?[1], 3.0);
    assert_eq!(token_column(&embeds[2], 1)?[2], 4.0);
    Ok(())
}
