//! Shared helpers for the candle-prompt examples.
//!
//! - Device and tracing setup
//! - Tokenizer loading from the HuggingFace hub or a local file
//! - A [`PromptTokenizer`] implementation backed by the `tokenizers` crate

use anyhow::{anyhow, Result};
use candle::utils::{cuda_is_available, metal_is_available};
use candle::Device;
use candle_prompt::prompt::{Padding, PromptTokenizer};
use tokenizers::Tokenizer;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default HuggingFace model providing the CLIP tokenizer.
pub const DEFAULT_TOKENIZER_ID: &str = "openai/clip-vit-large-patch14";

/// End-of-text token, also used for padding by CLIP.
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Pick the first available accelerator unless `cpu` is set.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Install a stderr `fmt` subscriber filtered by `RUST_LOG` (default `info`),
/// plus a Chrome trace layer when `chrome` is set.
///
/// Returns a guard that must be kept alive for the duration of tracing.
pub fn setup_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (chrome_layer, guard) = if chrome {
        let (layer, guard) = ChromeLayerBuilder::new().build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(chrome_layer)
        .init();
    guard
}

/// Load `tokenizer.json` from a local path or from the hub.
pub fn load_tokenizer(tokenizer_path: Option<&str>, model_id: &str) -> Result<Tokenizer> {
    let path = match tokenizer_path {
        Some(p) => std::path::PathBuf::from(p),
        None => {
            let api = hf_hub::api::sync::Api::new()?;
            api.model(model_id.to_string()).get("tokenizer.json")?
        }
    };
    Tokenizer::from_file(&path).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))
}

/// CLIP tokenizer with the padding and truncation behaviour of `CLIPTokenizer`.
pub struct ClipTokenizer {
    tokenizer: Tokenizer,
    pad_id: u32,
    max_length: usize,
}

impl ClipTokenizer {
    pub fn new(tokenizer: Tokenizer, max_length: usize) -> Result<Self> {
        let pad_id = tokenizer
            .token_to_id(END_OF_TEXT)
            .ok_or_else(|| anyhow!("tokenizer has no {END_OF_TEXT} token"))?;
        Ok(Self {
            tokenizer,
            pad_id,
            max_length,
        })
    }
}

impl PromptTokenizer for ClipTokenizer {
    fn model_max_length(&self) -> usize {
        self.max_length
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    fn tokenize(
        &self,
        texts: &[String],
        padding: Padding,
        truncation: bool,
    ) -> candle::Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|text| {
                let encoding = self
                    .tokenizer
                    .encode(text.as_str(), true)
                    .map_err(candle::Error::msg)?;
                let mut ids = encoding.get_ids().to_vec();

                if truncation && ids.len() > self.max_length {
                    // Keep the end-of-text token, as CLIPTokenizer does.
                    let last = ids[ids.len() - 1];
                    ids.truncate(self.max_length - 1);
                    ids.push(last);
                }
                if padding == Padding::MaxLength && ids.len() < self.max_length {
                    ids.resize(self.max_length, self.pad_id);
                }
                Ok(ids)
            })
            .collect()
    }
}
