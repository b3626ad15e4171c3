//! Configuration structures for prompt parsing and latent preparation.

use serde::Deserialize;

/// Maximum number of tokens the CLIP text encoder accepts in one forward pass.
pub const MAX_TOKENS_PER_GROUP: usize = 77;

/// Number of channels in the Stable Diffusion latent space.
pub const LATENT_CHANNELS: usize = 4;

/// VAE spatial compression factor (8x).
pub const LATENT_FACTOR: usize = 8;

/// Configuration for prompt parsing and encoding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptConfig {
    /// Width of each token group handed to the text encoder (default: 77).
    #[serde(default = "default_max_tokens_per_group")]
    pub max_tokens_per_group: usize,

    /// Flip the sign of LoRA and inversion weights found in the negative prompt
    /// before merging them with the positive ones (default: false).
    #[serde(default)]
    pub negate_negative_directives: bool,

    /// Number of CLIP layers to skip when no `<clip:...>` directive is present (default: 0).
    #[serde(default)]
    pub skip_clip_states: usize,
}

fn default_max_tokens_per_group() -> usize {
    MAX_TOKENS_PER_GROUP
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_group: MAX_TOKENS_PER_GROUP,
            negate_negative_directives: false,
            skip_clip_states: 0,
        }
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct Size {
    pub width: usize,
    pub height: usize,
}

impl Size {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Latent dimensions `(height / 8, width / 8)`.
    pub fn latent_dims(&self) -> (usize, usize) {
        (self.height / LATENT_FACTOR, self.width / LATENT_FACTOR)
    }

    /// Shape of the noise tensor for `batch` images: `(batch, 4, height / 8, width / 8)`.
    pub fn latent_shape(&self, batch: usize) -> (usize, usize, usize, usize) {
        let (h, w) = self.latent_dims();
        (batch, LATENT_CHANNELS, h, w)
    }
}
