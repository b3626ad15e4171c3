//! Prompt preprocessing CLI for Stable Diffusion pipelines.
//!
//! - **parse**: Expand a prompt into prompt pairs and collect its directives
//! - **tokens**: Show how each prompt pair is split into CLIP token groups
//! - **latents**: Generate seeded latent noise and save it as safetensors
//!
//! # Usage
//!
//! ```bash
//! # Prompt pairs and directives as JSON
//! cargo run --release --example prompt -- parse \
//!     --prompt "a (red|blue|green) car <lora:ink:0.6>" \
//!     --negative-prompt "(blurry|dark)"
//!
//! # Token groups per prompt pair
//! cargo run --release --example prompt -- tokens \
//!     --prompt "a castle, tower-{1,4}, (dawn|dusk)"
//!
//! # Latents for a 512x512 image
//! cargo run --release --example prompt -- latents \
//!     --seed 42 --width 512 --height 512 --output latents.safetensors
//! ```

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

use anyhow::{bail, Result};
use candle::{Device, Tensor};
use candle_prompt::prompt::{
    expand_interval_ranges, get_clip_skip_from_prompt, split_token_groups, Padding,
    PromptTokenizer,
};
use candle_prompt::{get_scaled_latents, parse_prompt, PromptConfig, Size, MAX_TOKENS_PER_GROUP};
use candle_prompt_examples::{ClipTokenizer, DEFAULT_TOKENIZER_ID};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "prompt",
    about = "Prompt parsing, token grouping and latent generation for diffusion pipelines",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Run on CPU instead of GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Enable Chrome tracing profiler.
    #[arg(long, global = true)]
    tracing: bool,

    /// JSON file with a prompt configuration.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Expand a prompt into prompt pairs and directives.
    Parse {
        /// The prompt to parse.
        #[arg(long)]
        prompt: String,

        /// Negative prompt describing what to avoid.
        #[arg(long)]
        negative_prompt: Option<String>,
    },

    /// Show the CLIP token groups of every prompt pair.
    Tokens {
        /// The prompt to tokenize.
        #[arg(long)]
        prompt: String,

        /// Negative prompt describing what to avoid.
        #[arg(long)]
        negative_prompt: Option<String>,

        /// Local path to tokenizer.json.
        #[arg(long)]
        tokenizer_path: Option<String>,

        /// HuggingFace model providing the tokenizer.
        #[arg(long, default_value = DEFAULT_TOKENIZER_ID)]
        tokenizer_id: String,
    },

    /// Generate seeded latent noise.
    Latents {
        /// Random seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Image width in pixels (must be divisible by 8).
        #[arg(long, default_value_t = 512)]
        width: usize,

        /// Image height in pixels (must be divisible by 8).
        #[arg(long, default_value_t = 512)]
        height: usize,

        /// Number of images.
        #[arg(long, default_value_t = 1)]
        batch: usize,

        /// Integer up-scaling factor applied to the latents.
        #[arg(long, default_value_t = 1)]
        scale: usize,

        /// Output safetensors file.
        #[arg(long, default_value = "latents.safetensors")]
        output: String,
    },
}

fn load_config(path: Option<&str>) -> Result<PromptConfig> {
    match path {
        Some(path) => {
            info!("Loading prompt config from {}", path);
            let file = std::fs::File::open(path)?;
            Ok(serde_json::from_reader(file)?)
        }
        None => Ok(PromptConfig::default()),
    }
}

fn run_parse(prompt: &str, negative_prompt: Option<&str>, config: &PromptConfig) -> Result<()> {
    let parsed = parse_prompt(prompt, negative_prompt, config);
    println!("{}", serde_json::to_string_pretty(&parsed)?);
    Ok(())
}

fn run_tokens(
    prompt: &str,
    negative_prompt: Option<&str>,
    tokenizer: &ClipTokenizer,
    config: &PromptConfig,
    device: &Device,
) -> Result<()> {
    let parsed = parse_prompt(prompt, negative_prompt, config);
    for (i, pair) in parsed.pairs.iter().enumerate() {
        let (text, skip) = get_clip_skip_from_prompt(&pair.positive);
        let text = expand_interval_ranges(&text);
        let rows = tokenizer.tokenize(&[text.clone()], Padding::MaxLength, false)?;
        let ids = Tensor::new(rows[0].as_slice(), device)?.unsqueeze(0)?;
        let groups = split_token_groups(&ids, config.max_tokens_per_group)?;

        println!("[{}] {}", i + 1, text);
        if let Some(negative) = &pair.negative {
            println!("    negative: {}", negative);
        }
        if let Some(skip) = skip {
            println!("    skipping {} CLIP layers", skip);
        }
        let sizes: Vec<usize> = groups.iter().map(|g| g.dim(1)).collect::<candle::Result<_>>()?;
        println!("    {} tokens in {} groups: {:?}", ids.dim(1)?, groups.len(), sizes);
    }
    Ok(())
}

fn run_latents(
    seed: u64,
    size: Size,
    batch: usize,
    scale: usize,
    output: &str,
    device: &Device,
) -> Result<()> {
    if size.width % 8 != 0 || size.height % 8 != 0 {
        bail!(
            "Width ({}) and height ({}) must be divisible by 8",
            size.width,
            size.height
        );
    }
    info!(seed, batch, scale, "Generating latents for {}x{}", size.width, size.height);
    let latents = get_scaled_latents(seed, size, batch, scale, device)?;
    println!("Latents: {:?}", latents.dims());
    latents.save_safetensors("latents", output)?;
    println!("Saved to {}", output);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = candle_prompt_examples::setup_tracing(cli.tracing);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Parse {
            prompt,
            negative_prompt,
        } => run_parse(&prompt, negative_prompt.as_deref(), &config),
        Command::Tokens {
            prompt,
            negative_prompt,
            tokenizer_path,
            tokenizer_id,
        } => {
            let device = candle_prompt_examples::device(cli.cpu)?;
            let tokenizer =
                candle_prompt_examples::load_tokenizer(tokenizer_path.as_deref(), &tokenizer_id)?;
            let tokenizer = ClipTokenizer::new(tokenizer, MAX_TOKENS_PER_GROUP)?;
            info!("Tokenizer loaded on {:?}", device);
            run_tokens(
                &prompt,
                negative_prompt.as_deref(),
                &tokenizer,
                &config,
                &device,
            )
        }
        Command::Latents {
            seed,
            width,
            height,
            batch,
            scale,
            output,
        } => {
            let device = candle_prompt_examples::device(cli.cpu)?;
            run_latents(seed, Size::new(width, height), batch, scale, &output, &device)
        }
    }
}
