//! Seeded latent noise for diffusion pipelines.
//!
//! Latents are drawn from a standard normal distribution with the same
//! MT19937 + Box-Muller algorithm `torch.randn()` uses on CPU, so a seed gives
//! the same noise field here as in a PyTorch pipeline:
//!
//! ```text
//! seed ──► MT19937 ──► Box-Muller ──► (batch, 4, height / 8, width / 8)
//! ```
//!
//! PyTorch switches algorithms on tensor size:
//! - **fewer than 16 values**: 53-bit double uniforms, one cached sample per pair
//! - **16 values or more**: 24-bit float uniforms, transformed in blocks of 16;
//!   a partial last block is redrawn over the final 16 values
//!
//! # References
//!
//! - PyTorch source: `aten/src/ATen/native/cpu/DistributionTemplates.h`
//! - PyTorch source: `aten/src/ATen/core/TransformationHelper.h`

use candle::{bail, DType, Device, Result, Shape, Tensor};
use rand_mt::Mt;
use tracing::trace;

use crate::config::{Size, LATENT_FACTOR};

/// Block width of PyTorch's vectorized normal sampler.
const NORMAL_BLOCK: usize = 16;

/// MT19937 + Box-Muller sampler reproducing `torch.randn()`.
#[derive(Debug, Clone)]
pub struct MtBoxMullerRng {
    rng: Mt,
    /// Second value of the last scalar Box-Muller pair.
    cached_value: Option<f32>,
}

impl MtBoxMullerRng {
    /// Seed the generator. MT19937 takes a 32-bit seed, as `torch.manual_seed` does on CPU.
    pub fn new(seed: u32) -> Self {
        Self {
            rng: Mt::new(seed),
            cached_value: None,
        }
    }

    /// Uniform double in [0, 1) from two draws, keeping 53 bits.
    #[inline]
    fn uniform_double(&mut self) -> f64 {
        const MASK_53BIT: u64 = 0x001F_FFFF_FFFF_FFFF;
        const DIVISOR: f64 = 9_007_199_254_740_992.0; // 2^53
        let lo = self.rng.next_u32() as u64;
        let hi = self.rng.next_u32() as u64;
        (((lo << 32) | hi) & MASK_53BIT) as f64 / DIVISOR
    }

    /// Uniform float in [0, 1) from one draw, keeping 24 bits.
    #[inline]
    fn uniform_float(&mut self) -> f32 {
        const MASK_24BIT: u32 = 0x00FF_FFFF;
        const DIVISOR: f32 = 16_777_216.0; // 2^24
        (self.rng.next_u32() & MASK_24BIT) as f32 / DIVISOR
    }

    /// One sample from N(0, 1) on the scalar path.
    pub fn sample_scalar(&mut self) -> f32 {
        if let Some(cached) = self.cached_value.take() {
            return cached;
        }

        let u1 = self.uniform_double();
        let u2 = self.uniform_double();
        // log(1 - u2) keeps the argument away from zero.
        let r = (-2.0_f64 * (1.0_f64 - u2).ln()).sqrt();
        let theta = 2.0_f64 * std::f64::consts::PI * u1;

        self.cached_value = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Transform 16 uniforms in place: 8 cosine samples followed by 8 sine samples.
    fn normal_fill_16(data: &mut [f32]) {
        let half = NORMAL_BLOCK / 2;
        for i in 0..half {
            let r = (-2.0_f32 * (1.0_f32 - data[i]).ln()).sqrt();
            let theta = 2.0_f32 * std::f32::consts::PI * data[half + i];
            data[i] = r * theta.cos();
            data[half + i] = r * theta.sin();
        }
    }

    /// `count >= 16` samples on the vectorized path.
    ///
    /// All uniforms are drawn first and transformed in blocks of 16. When
    /// `count` is not a multiple of 16, the last 16 values are redrawn and
    /// transformed again as one block.
    fn sample_vectorized(&mut self, count: usize) -> Vec<f32> {
        let mut output: Vec<f32> = (0..count).map(|_| self.uniform_float()).collect();
        for block in output.chunks_exact_mut(NORMAL_BLOCK) {
            Self::normal_fill_16(block);
        }

        if count % NORMAL_BLOCK != 0 && count >= NORMAL_BLOCK {
            let tail = &mut output[count - NORMAL_BLOCK..];
            for u in tail.iter_mut() {
                *u = self.uniform_float();
            }
            Self::normal_fill_16(tail);
        }
        output
    }

    /// A tensor of standard normal values, built on CPU and moved to `device`.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, device: &Device, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let count = shape.elem_count();
        let data = if count >= NORMAL_BLOCK {
            self.sample_vectorized(count)
        } else {
            (0..count).map(|_| self.sample_scalar()).collect()
        };

        Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_device(device)?
            .to_dtype(dtype)
    }
}

/// Noise latents for `batch` images of `size`, fully determined by `seed`.
///
/// Returns an f32 tensor of shape `(batch, 4, height / 8, width / 8)`. Seeds
/// above `u32::MAX` are rejected rather than truncated.
pub fn get_latents_from_seed(seed: u64, size: Size, batch: usize, device: &Device) -> Result<Tensor> {
    let seed = match u32::try_from(seed) {
        Ok(seed) => seed,
        Err(_) => bail!("seed {seed} does not fit in 32 bits"),
    };
    let shape = size.latent_shape(batch);
    trace!("generating latents {:?} from seed {}", shape, seed);
    MtBoxMullerRng::new(seed).randn(shape, device, DType::F32)
}

/// Index into a length-`n` axis for position `i` of numpy-style reflect padding.
fn reflect_index(i: usize, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let m = i % period;
    if m < n {
        m
    } else {
        period - m
    }
}

/// Extend `dim` of `xs` to `len` by reflecting around the last element.
fn reflect_pad(xs: &Tensor, dim: usize, len: usize) -> Result<Tensor> {
    let n = xs.dim(dim)?;
    if n >= len {
        return Ok(xs.clone());
    }
    let indices: Vec<u32> = (0..len).map(|i| reflect_index(i, n) as u32).collect();
    let indices = Tensor::new(indices.as_slice(), xs.device())?;
    // index_select needs a contiguous source; crops are strided views.
    xs.contiguous()?.index_select(&indices, dim)
}

/// Cut the latents for one square tile out of the full latent field.
///
/// `x`, `y` and `tile` are in pixels. Tiles that run over the right or bottom
/// edge are reflect-padded back to `tile / 8` latent pixels.
pub fn get_tile_latents(full_latents: &Tensor, x: usize, y: usize, tile: usize) -> Result<Tensor> {
    let (_, _, height, width) = full_latents.dims4()?;
    let t = tile / LATENT_FACTOR;
    let x = x / LATENT_FACTOR;
    let y = y / LATENT_FACTOR;
    if t == 0 {
        bail!("tile size {tile} is smaller than one latent pixel")
    }
    if x >= width || y >= height {
        bail!("tile origin ({x}, {y}) is outside the {width}x{height} latents")
    }

    let h = t.min(height - y);
    let w = t.min(width - x);
    let tile_latents = full_latents.narrow(2, y, h)?.narrow(3, x, w)?;
    if h == t && w == t {
        return Ok(tile_latents);
    }

    trace!("padding tile latents from {}x{} to {}x{}", w, h, t, t);
    let tile_latents = reflect_pad(&tile_latents, 2, t)?;
    reflect_pad(&tile_latents, 3, t)
}

/// `(output, input)` bilinear interpolation matrix with half-pixel centers
/// (`align_corners = false`).
fn bilinear_matrix(input: usize, output: usize, device: &Device) -> Result<Tensor> {
    let scale = input as f64 / output as f64;
    let mut weights = vec![0f32; output * input];
    for o in 0..output {
        let src = ((o as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(input - 1);
        let i1 = (i0 + 1).min(input - 1);
        let lambda = (src - i0 as f64) as f32;
        weights[o * input + i0] += 1.0 - lambda;
        weights[o * input + i1] += lambda;
    }
    Tensor::from_vec(weights, (output, input), device)
}

/// Bilinear up-scaling of `(batch, channels, height, width)` latents by an integer factor.
pub fn upscale_latents(latents: &Tensor, scale: usize) -> Result<Tensor> {
    if scale == 0 {
        bail!("latent scale must be positive")
    }
    if scale == 1 {
        return Ok(latents.clone());
    }
    let (_, _, height, width) = latents.dims4()?;
    let device = latents.device();
    let rows = bilinear_matrix(height, height * scale, device)?;
    let cols = bilinear_matrix(width, width * scale, device)?.t()?.contiguous()?;

    let xs = latents.to_dtype(DType::F32)?;
    let xs = xs.broadcast_matmul(&cols)?;
    let xs = rows.broadcast_matmul(&xs)?;
    xs.to_dtype(latents.dtype())
}

/// Seeded latents for `size`, up-scaled by `scale` in both spatial axes.
pub fn get_scaled_latents(
    seed: u64,
    size: Size,
    batch: usize,
    scale: usize,
    device: &Device,
) -> Result<Tensor> {
    let latents = get_latents_from_seed(seed, size, batch, device)?;
    upscale_latents(&latents, scale)
}
