//! Prompt preprocessing for Stable Diffusion pipelines in Candle.
//!
//! This crate turns free-form prompts into the inputs a diffusion pipeline
//! needs:
//! - **Prompt parsing**: LoRA, inversion and CLIP-skip directives, numbered
//!   token ranges, and `(a|b)` alternatives expanded into prompt variants
//! - **Chunked encoding**: prompts longer than CLIP's 77-token window are
//!   encoded in groups and stitched back together, with the unconditional
//!   embedding for classifier-free guidance
//! - **Latents**: seeded, PyTorch-compatible noise fields, tiles and up-scaled
//!   variants
//! - **Pipeline cache**: an explicit, caller-owned cache for the last loaded
//!   pipeline
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example prompt -- parse \
//!     --prompt "a (red|blue) car, style-{1,3} <lora:ink:0.6>" \
//!     --negative-prompt "blurry"
//! ```

pub mod cache;
pub mod config;
pub mod latents;
pub mod prompt;

pub use cache::PipelineCache;
pub use config::{PromptConfig, Size, LATENT_CHANNELS, LATENT_FACTOR, MAX_TOKENS_PER_GROUP};
pub use latents::{
    get_latents_from_seed, get_scaled_latents, get_tile_latents, upscale_latents, MtBoxMullerRng,
};
pub use prompt::{
    encode_prompt, encode_prompt_pairs, parse_prompt, Directive, EncodeOptions, EncoderOutput,
    ParsedPrompt, PromptInput, PromptPair, PromptTokenizer, TextEncoder,
};
