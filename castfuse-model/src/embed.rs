//! Patch embedders for the three streams. The spatial stream patchifies one
//! frame out of each tubelet pair with a 2D convolution and prepends a class
//! token; the temporal stream patchifies tubelets (a stride-equals-kernel 3D
//! convolution is expressed exactly as a 2D convolution over the stacked
//! frame-pair channels); the audio stream patchifies the mel-spectrogram and
//! adds a grouped positional convolution.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{Conv1dConfig, Conv2dConfig, Init, LayerNorm, Linear, Module, VarBuilder};

use crate::config::{AudioConfig, ModelConfig};
use crate::error::ModelError;
use crate::layers::sinusoid_table;
use crate::streams::{AudioTokens, SpatialTokens, TemporalTokens};

fn check_video(cfg: &ModelConfig, video: &Tensor) -> Result<(usize, usize)> {
    let (b, c, t, h, w) = video.dims5()?;
    if c != cfg.in_chans || t != cfg.num_frames || h != cfg.img_size || w != cfg.img_size {
        return Err(ModelError::shape(
            "video input",
            format!(
                "(b, {}, {}, {}, {})",
                cfg.in_chans, cfg.num_frames, cfg.img_size, cfg.img_size
            ),
            format!("{:?}", video.dims()),
        )
        .into());
    }
    Ok((b, t))
}

/// Per-frame patch embedder for the spatial stream.
pub struct SpatialEmbed {
    conv: candle_nn::Conv2d,
    class_embedding: Tensor,
    positional_embedding: Tensor,
    ln_pre: LayerNorm,
    frame_stride: usize,
}

impl SpatialEmbed {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let scale = (cfg.embed_dim as f64).powf(-0.5);
        Ok(Self {
            conv: candle_nn::conv2d_no_bias(
                cfg.in_chans,
                cfg.embed_dim,
                cfg.patch_size,
                conv_cfg,
                vb.pp("conv"),
            )?,
            class_embedding: vb.get_with_hints(
                cfg.embed_dim,
                "class_embedding",
                Init::Randn { mean: 0.0, stdev: scale },
            )?,
            positional_embedding: vb.get_with_hints(
                (cfg.spatial_patches() + 1, cfg.embed_dim),
                "positional_embedding",
                Init::Randn { mean: 0.0, stdev: scale },
            )?,
            ln_pre: candle_nn::layer_norm(cfg.embed_dim, 1e-5, vb.pp("ln_pre"))?,
            frame_stride: cfg.tubelet_size,
        })
    }

    /// `video` is `(batch, channels, frames, height, width)`.
    pub fn forward(&self, cfg: &ModelConfig, video: &Tensor) -> Result<SpatialTokens> {
        let (b, t) = check_video(cfg, video)?;
        let frames = t / self.frame_stride;
        // second frame of each tubelet pair
        let idx: Vec<u32> = (0..frames)
            .map(|i| (i * self.frame_stride + self.frame_stride - 1) as u32)
            .collect();
        let idx = Tensor::from_vec(idx, frames, video.device())?;
        let x = video.index_select(&idx, 2)?;
        let x = x
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?
            .reshape((b * frames, cfg.in_chans, cfg.img_size, cfg.img_size))?;
        let x = self.conv.forward(&x)?; // (b*frames, d, g, g)
        let x = x.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let n = cfg.spatial_patches();
        let cls = self
            .class_embedding
            .reshape((1, 1, cfg.embed_dim))?
            .broadcast_as((b * frames, 1, cfg.embed_dim))?
            .contiguous()?;
        let x = Tensor::cat(&[&cls, &x], 1)?;
        let x = x.broadcast_add(&self.positional_embedding.unsqueeze(0)?)?;
        let x = self.ln_pre.forward(&x)?;
        SpatialTokens::new(x, b, frames, n, cfg.embed_dim)
    }
}

/// Tubelet embedder for the temporal stream with a fixed sinusoidal
/// position table.
pub struct TubeletEmbed {
    conv: candle_nn::Conv2d,
    pos_table: Tensor,
}

impl TubeletEmbed {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(
            cfg.in_chans * cfg.tubelet_size,
            cfg.embed_dim,
            cfg.patch_size,
            conv_cfg,
            vb.pp("conv"),
        )?;
        let tokens = cfg.temporal_chunks() * cfg.spatial_patches();
        let pos_table = sinusoid_table(tokens, cfg.embed_dim, vb.device())?;
        Ok(Self { conv, pos_table })
    }

    pub fn forward(&self, cfg: &ModelConfig, video: &Tensor) -> Result<TemporalTokens> {
        let (b, t) = check_video(cfg, video)?;
        let chunks = t / cfg.tubelet_size;
        let n = cfg.spatial_patches();
        let x = video
            .reshape((
                b,
                cfg.in_chans,
                chunks,
                cfg.tubelet_size,
                cfg.img_size,
                cfg.img_size,
            ))?
            .permute((0, 2, 1, 3, 4, 5))?
            .contiguous()?
            .reshape((
                b * chunks,
                cfg.in_chans * cfg.tubelet_size,
                cfg.img_size,
                cfg.img_size,
            ))?;
        let x = self.conv.forward(&x)?; // (b*chunks, d, g, g)
        let x = x
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, chunks * n, cfg.embed_dim))?;
        let x = x.broadcast_add(&self.pos_table.unsqueeze(0)?)?;
        TemporalTokens::new(x, b, chunks, n, cfg.embed_dim)
    }
}

/// Spectrogram patch embedder for the audio stream.
pub struct AudioEmbed {
    conv: candle_nn::Conv2d,
    norm: LayerNorm,
    proj: Linear,
    pos_conv: candle_nn::Conv1d,
    pos_trim: usize,
    ln: LayerNorm,
}

impl AudioEmbed {
    pub fn new(cfg: &ModelConfig, audio: &AudioConfig, vb: VarBuilder) -> Result<Self> {
        let conv_cfg = Conv2dConfig {
            stride: audio.patch_size,
            ..Default::default()
        };
        let pos_cfg = Conv1dConfig {
            padding: audio.pos_conv_kernel / 2,
            groups: audio.pos_conv_groups,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d_no_bias(
                1,
                audio.conv_dim,
                audio.patch_size,
                conv_cfg,
                vb.pp("conv"),
            )?,
            norm: candle_nn::layer_norm(audio.conv_dim, 1e-5, vb.pp("norm"))?,
            proj: candle_nn::linear(audio.conv_dim, cfg.embed_dim, vb.pp("proj"))?,
            pos_conv: candle_nn::conv1d(
                cfg.embed_dim,
                cfg.embed_dim,
                audio.pos_conv_kernel,
                pos_cfg,
                vb.pp("pos_conv"),
            )?,
            // even kernels with symmetric padding produce one extra position
            pos_trim: if audio.pos_conv_kernel % 2 == 0 { 1 } else { 0 },
            ln: candle_nn::layer_norm(cfg.embed_dim, 1e-5, vb.pp("ln"))?,
        })
    }

    /// `spec` is `(batch, 1, height, width)` for single-frame audio or
    /// `(batch, 1, frames, height, width)` for multi-frame audio.
    pub fn forward(&self, cfg: &ModelConfig, spec: &Tensor) -> Result<AudioTokens> {
        let audio = cfg
            .audio
            .as_ref()
            .ok_or(ModelError::AudioNotConfigured)?;
        let (b, frames, x) = match spec.rank() {
            4 => {
                let (b, c, h, w) = spec.dims4()?;
                self.check_spec(audio, c, h, w, spec.dims())?;
                (b, 1, spec.clone())
            }
            5 => {
                let (b, c, f, h, w) = spec.dims5()?;
                self.check_spec(audio, c, h, w, spec.dims())?;
                if f != audio.spec_frames {
                    return Err(ModelError::shape(
                        "spectrogram frames",
                        format!("{}", audio.spec_frames),
                        format!("{f}"),
                    )
                    .into());
                }
                let x = spec
                    .permute((0, 2, 1, 3, 4))?
                    .contiguous()?
                    .reshape((b * f, c, h, w))?;
                (b, f, x)
            }
            _ => {
                return Err(ModelError::shape(
                    "spectrogram input",
                    "rank 4 or 5".to_string(),
                    format!("rank {}", spec.rank()),
                )
                .into())
            }
        };
        let n = (audio.spec_height / audio.patch_size) * (audio.spec_width / audio.patch_size);
        let x = self.conv.forward(&x)?; // (b*frames, conv_dim, gh, gw)
        let x = x.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let x = self.norm.forward(&x)?;
        let x = self.proj.forward(&x)?;
        let x = x.reshape((b, frames * n, cfg.embed_dim))?;

        // grouped positional convolution over the token axis
        let h = x.transpose(1, 2)?.contiguous()?;
        let h = self.pos_conv.forward(&h)?;
        let h = if self.pos_trim > 0 {
            let len = h.dim(D::Minus1)?;
            h.narrow(D::Minus1, 0, len - self.pos_trim)?
        } else {
            h
        };
        let h = h.gelu_erf()?.transpose(1, 2)?.contiguous()?;
        let x = x.add(&h)?;
        let x = self.ln.forward(&x)?;
        AudioTokens::new(x, b, frames, n, cfg.embed_dim)
    }

    fn check_spec(
        &self,
        audio: &AudioConfig,
        c: usize,
        h: usize,
        w: usize,
        got: &[usize],
    ) -> Result<()> {
        if c != 1 || h != audio.spec_height || w != audio.spec_width {
            return Err(ModelError::shape(
                "spectrogram input",
                format!("(b, 1, {}, {})", audio.spec_height, audio.spec_width),
                format!("{got:?}"),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn small_cfg() -> ModelConfig {
        ModelConfig {
            img_size: 32,
            patch_size: 16,
            embed_dim: 32,
            num_heads: 4,
            num_frames: 8,
            audio: Some(AudioConfig {
                spec_height: 32,
                spec_width: 32,
                patch_size: 16,
                pos_conv_kernel: 8,
                pos_conv_groups: 4,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn test_spatial_embed_shapes() {
        let cfg = small_cfg();
        let (_map, vb) = vb();
        let embed = SpatialEmbed::new(&cfg, vb).unwrap();
        let video = Tensor::rand(0f32, 1f32, (2, 3, 8, 32, 32), &Device::Cpu).unwrap();
        let s = embed.forward(&cfg, &video).unwrap();
        // 4 kept frames, 4 patches + class token, width 32
        assert_eq!(s.tokens.dims(), &[2 * 4, 5, 32]);
    }

    #[test]
    fn test_tubelet_embed_shapes() {
        let cfg = small_cfg();
        let (_map, vb) = vb();
        let embed = TubeletEmbed::new(&cfg, vb).unwrap();
        let video = Tensor::rand(0f32, 1f32, (2, 3, 8, 32, 32), &Device::Cpu).unwrap();
        let t = embed.forward(&cfg, &video).unwrap();
        assert_eq!(t.tokens.dims(), &[2, 4 * 4, 32]);
    }

    #[test]
    fn test_audio_embed_shapes() {
        let cfg = small_cfg();
        let (_map, vb) = vb();
        let embed = AudioEmbed::new(&cfg, cfg.audio.as_ref().unwrap(), vb).unwrap();
        let spec = Tensor::rand(0f32, 1f32, (2, 1, 32, 32), &Device::Cpu).unwrap();
        let a = embed.forward(&cfg, &spec).unwrap();
        assert_eq!(a.tokens.dims(), &[2, 4, 32]);
    }

    #[test]
    fn test_wrong_video_size_rejected() {
        let cfg = small_cfg();
        let (_map, vb) = vb();
        let embed = SpatialEmbed::new(&cfg, vb).unwrap();
        let video = Tensor::zeros((2, 3, 8, 16, 16), DType::F32, &Device::Cpu).unwrap();
        assert!(embed.forward(&cfg, &video).is_err());
    }
}
