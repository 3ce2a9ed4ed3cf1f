//! One fusion layer: each stream runs its self-attention sublayer, the
//! cross-attention cells exchange information between the attended streams,
//! then each stream runs its feed-forward sublayer. The spatial and temporal
//! streams are pre-norm; the audio stream is post-norm with a depth-scaled
//! residual that straddles the cells (attention before, FFN after).

use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{linear, LayerNorm, Linear, Module, VarBuilder};

use crate::attention::{AudioAttention, ClipAttention, SelfAttention};
use crate::config::{LayerPlan, ModelConfig};
use crate::cross::{BcastCell, CellConfig};
use crate::layers::{Adapter, ClipMlp, DropPath, Mlp};
use crate::streams::{AudioTokens, SpatialTokens, TemporalTokens};

/// Post-norm audio sublayer. `alpha` scales the residual before each norm,
/// derived from model depth.
struct AudioSublayer {
    attn: AudioAttention,
    attn_adapter: Option<Adapter>,
    ln_att: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    ffn_adapter: Option<Adapter>,
    ln_ffn: LayerNorm,
    alpha: f64,
}

impl AudioSublayer {
    fn new(cfg: &ModelConfig, adapter: bool, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let hidden = dim * cfg.mlp_ratio;
        Ok(Self {
            attn: AudioAttention::new(dim, cfg.num_heads, vb.pp("attn"))?,
            attn_adapter: if adapter {
                Some(Adapter::new(dim, true, vb.pp("attn_adapter"))?)
            } else {
                None
            },
            ln_att: candle_nn::layer_norm(dim, 1e-5, vb.pp("ln_att"))?,
            fc1: linear(dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, dim, vb.pp("fc2"))?,
            ffn_adapter: if adapter {
                Some(Adapter::new(dim, false, vb.pp("ffn_adapter"))?)
            } else {
                None
            },
            ln_ffn: candle_nn::layer_norm(dim, 1e-5, vb.pp("ln_ffn"))?,
            alpha: (2.0 * cfg.depth as f64).powf(0.25),
        })
    }

    /// Attention half, applied before the cross-attention cells.
    fn attention_half(&self, x: &Tensor, pos_bias: Option<&Tensor>) -> Result<Tensor> {
        let residual = x;
        let mut attn_out = self.attn.forward(x, pos_bias)?;
        if let Some(adapter) = &self.attn_adapter {
            attn_out = adapter.forward(&attn_out)?;
        }
        Ok(self
            .ln_att
            .forward(&residual.affine(self.alpha, 0.0)?.add(&attn_out)?)?)
    }

    /// FFN half, applied after the cross-attention cells.
    fn ffn_half(&self, x: &Tensor, drop_path: &DropPath, train: bool) -> Result<Tensor> {
        let residual = x;
        let mut ffn_out = self.fc2.forward(&self.fc1.forward(x)?.gelu_erf()?)?;
        if let Some(adapter) = &self.ffn_adapter {
            let extra = adapter.forward(residual)?.affine(0.5, 0.0)?;
            ffn_out = ffn_out.add(&drop_path.forward(&extra, train)?)?;
        }
        Ok(self
            .ln_ffn
            .forward(&residual.affine(self.alpha, 0.0)?.add(&ffn_out)?)?)
    }
}

/// One layer of the fusion stack.
pub struct FusionBlock {
    // spatial stream
    ln_1: LayerNorm,
    clip_attn: ClipAttention,
    s_adapter: Option<Adapter>,
    ln_2: LayerNorm,
    clip_mlp: ClipMlp,
    s_mlp_adapter: Option<Adapter>,
    // temporal stream
    norm1: LayerNorm,
    t_attn: SelfAttention,
    t_adapter: Option<Adapter>,
    norm2: LayerNorm,
    mlp: Mlp,
    t_mlp_adapter: Option<Adapter>,
    // audio stream
    audio: Option<AudioSublayer>,
    // cross-attention cells
    st_cell: Option<BcastCell>,
    sa_cell: Option<BcastCell>,
    ta_cell: Option<BcastCell>,
    drop_path: DropPath,
}

impl FusionBlock {
    pub fn new(cfg: &ModelConfig, plan: &LayerPlan, vb: VarBuilder) -> Result<Self> {
        let dim = cfg.embed_dim;
        let hidden = dim * cfg.mlp_ratio;
        let video_frames = cfg.spatial_frames();
        let patches = cfg.spatial_patches();
        let adapter = plan.adapter;

        let cell = |left: (usize, usize),
                    right: (usize, usize),
                    time_mode,
                    vb: VarBuilder|
         -> Result<BcastCell> {
            BcastCell::new(
                CellConfig {
                    dim,
                    cross_dim: cfg.cross_dim(),
                    heads: cfg.num_heads,
                    left,
                    right,
                    attn_all_frame: cfg.attn_all_frame,
                    use_pos: cfg.use_st_pos,
                    time_mode,
                    drop_path: plan.drop_path,
                },
                vb,
            )
        };

        let st_cell = if plan.cross_st {
            Some(cell(
                (video_frames, patches),
                (cfg.temporal_chunks(), patches),
                cfg.time_encoding,
                vb.pp("st_cell"),
            )?)
        } else {
            None
        };
        let (sa_cell, ta_cell) = if plan.cross_audio {
            let spec_frames = cfg.audio.as_ref().map(|a| a.spec_frames).unwrap_or(1);
            let a_patches = cfg.audio_patches().unwrap_or(0);
            (
                Some(cell(
                    (video_frames, patches),
                    (spec_frames, a_patches),
                    crate::config::TimeEncoding::None,
                    vb.pp("sa_cell"),
                )?),
                Some(cell(
                    (cfg.temporal_chunks(), patches),
                    (spec_frames, a_patches),
                    crate::config::TimeEncoding::None,
                    vb.pp("ta_cell"),
                )?),
            )
        } else {
            (None, None)
        };

        let maybe_adapter = |skip: bool, vb: VarBuilder| -> Result<Option<Adapter>> {
            if adapter {
                Ok(Some(Adapter::new(dim, skip, vb)?))
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            ln_1: candle_nn::layer_norm(dim, 1e-5, vb.pp("ln_1"))?,
            clip_attn: ClipAttention::new(dim, cfg.num_heads, vb.pp("clip_attn"))?,
            s_adapter: maybe_adapter(true, vb.pp("s_adapter"))?,
            ln_2: candle_nn::layer_norm(dim, 1e-5, vb.pp("ln_2"))?,
            clip_mlp: ClipMlp::new(dim, hidden, vb.pp("clip_mlp"))?,
            s_mlp_adapter: maybe_adapter(false, vb.pp("s_mlp_adapter"))?,
            norm1: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            t_attn: SelfAttention::new(dim, cfg.num_heads, cfg.drop_rate, vb.pp("t_attn"))?,
            t_adapter: maybe_adapter(true, vb.pp("t_adapter"))?,
            norm2: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            mlp: Mlp::new(dim, hidden, cfg.drop_rate, vb.pp("mlp"))?,
            t_mlp_adapter: maybe_adapter(false, vb.pp("t_mlp_adapter"))?,
            audio: if cfg.audio.is_some() {
                Some(AudioSublayer::new(cfg, adapter, vb.pp("audio"))?)
            } else {
                None
            },
            st_cell,
            sa_cell,
            ta_cell,
            drop_path: DropPath::new(plan.drop_path),
        })
    }

    /// Per-stream self-attention, ahead of the cross-modal exchange.
    fn self_attention_phase(
        &self,
        s: SpatialTokens,
        t: TemporalTokens,
        a: Option<AudioTokens>,
        audio_pos_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<(SpatialTokens, TemporalTokens, Option<AudioTokens>)> {
        let xs = &s.tokens;
        let mut attn_out = self.clip_attn.forward(&self.ln_1.forward(xs)?)?;
        if let Some(adapter) = &self.s_adapter {
            attn_out = adapter.forward(&attn_out)?;
        }
        let s = s.with_tokens(xs.add(&attn_out)?)?;

        let xt = &t.tokens;
        let mut attn_out = self.t_attn.forward(&self.norm1.forward(xt)?, train)?;
        if let Some(adapter) = &self.t_adapter {
            attn_out = adapter.forward(&attn_out)?;
        }
        let t = t.with_tokens(xt.add(&attn_out)?)?;

        let a = match (&self.audio, a) {
            (Some(sublayer), Some(audio)) => {
                let xa = sublayer.attention_half(&audio.tokens, audio_pos_bias)?;
                Some(audio.with_tokens(xa)?)
            }
            (_, a) => a,
        };
        Ok((s, t, a))
    }

    /// Cross-modal exchange between the attended streams; the spatial class
    /// token sits out of every cell.
    fn cross_phase(
        &self,
        mut s: SpatialTokens,
        mut t: TemporalTokens,
        mut a: Option<AudioTokens>,
        time_enc: Option<(&Tensor, &Tensor)>,
        train: bool,
    ) -> Result<(SpatialTokens, TemporalTokens, Option<AudioTokens>)> {
        if let Some(cell) = &self.st_cell {
            let (cls, s_body) = s.split_class()?;
            let t_body = t.body()?;
            let (ds, dt) = cell.forward(&s_body, &t_body, time_enc, train)?;
            s = s.merge_class(&cls, &s_body.add(&ds)?)?;
            t = t.from_body(&t_body.add(&dt)?)?;
        }
        if let Some(cell) = &self.sa_cell {
            if let Some(audio) = &a {
                let (cls, s_body) = s.split_class()?;
                let a_body = audio.body()?;
                let (ds, da) = cell.forward(&s_body, &a_body, None, train)?;
                let new_s = s.merge_class(&cls, &s_body.add(&ds)?)?;
                let new_a = audio.from_body(&a_body.add(&da)?)?;
                s = new_s;
                a = Some(new_a);
            }
        }
        if let Some(cell) = &self.ta_cell {
            if let Some(audio) = &a {
                let t_body = t.body()?;
                let a_body = audio.body()?;
                let (dt, da) = cell.forward(&t_body, &a_body, None, train)?;
                let new_t = t.from_body(&t_body.add(&dt)?)?;
                let new_a = audio.from_body(&a_body.add(&da)?)?;
                t = new_t;
                a = Some(new_a);
            }
        }
        Ok((s, t, a))
    }

    /// Per-stream feed-forward, after the cross-modal exchange.
    fn feed_forward_phase(
        &self,
        s: SpatialTokens,
        t: TemporalTokens,
        a: Option<AudioTokens>,
        train: bool,
    ) -> Result<(SpatialTokens, TemporalTokens, Option<AudioTokens>)> {
        let xs = &s.tokens;
        let xn = self.ln_2.forward(xs)?;
        let mut ff = self.clip_mlp.forward(&xn)?;
        if let Some(adapter) = &self.s_mlp_adapter {
            let extra = adapter.forward(&xn)?.affine(0.5, 0.0)?;
            ff = ff.add(&self.drop_path.forward(&extra, train)?)?;
        }
        let s = s.with_tokens(xs.add(&ff)?)?;

        let xt = &t.tokens;
        let xn = self.norm2.forward(xt)?;
        let mut ff = self.mlp.forward(&xn, train)?;
        if let Some(adapter) = &self.t_mlp_adapter {
            let extra = adapter.forward(&xn)?.affine(0.5, 0.0)?;
            ff = ff.add(&self.drop_path.forward(&extra, train)?)?;
        }
        let t = t.with_tokens(xt.add(&ff)?)?;

        let a = match (&self.audio, a) {
            (Some(sublayer), Some(audio)) => {
                let xa = sublayer.ffn_half(&audio.tokens, &self.drop_path, train)?;
                Some(audio.with_tokens(xa)?)
            }
            (_, a) => a,
        };
        Ok((s, t, a))
    }

    pub fn forward(
        &self,
        s: &SpatialTokens,
        t: &TemporalTokens,
        a: Option<&AudioTokens>,
        time_enc: Option<(&Tensor, &Tensor)>,
        audio_pos_bias: Option<&Tensor>,
        train: bool,
    ) -> Result<(SpatialTokens, TemporalTokens, Option<AudioTokens>)> {
        let (s, t, a) =
            self.self_attention_phase(s.clone(), t.clone(), a.cloned(), audio_pos_bias, train)?;
        let (s, t, a) = self.cross_phase(s, t, a, time_enc, train)?;
        self.feed_forward_phase(s, t, a, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{layer_plans, AudioConfig};
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn small_cfg() -> ModelConfig {
        ModelConfig {
            img_size: 32,
            patch_size: 16,
            embed_dim: 32,
            depth: 2,
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

    #[test]
    fn test_block_preserves_stream_shapes() {
        let cfg = small_cfg();
        let plan = layer_plans(&cfg)[0];
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = FusionBlock::new(&cfg, &plan, vb).unwrap();

        let s_tokens = Tensor::rand(0f32, 1f32, (2 * 4, 5, 32), &Device::Cpu).unwrap();
        let s = SpatialTokens::new(s_tokens, 2, 4, 4, 32).unwrap();
        let t_tokens = Tensor::rand(0f32, 1f32, (2, 16, 32), &Device::Cpu).unwrap();
        let t = TemporalTokens::new(t_tokens, 2, 4, 4, 32).unwrap();
        let a_tokens = Tensor::rand(0f32, 1f32, (2, 4, 32), &Device::Cpu).unwrap();
        let a = AudioTokens::new(a_tokens, 2, 1, 4, 32).unwrap();

        let (s2, t2, a2) = block.forward(&s, &t, Some(&a), None, None, false).unwrap();
        assert_eq!(s2.tokens.dims(), s.tokens.dims());
        assert_eq!(t2.tokens.dims(), t.tokens.dims());
        assert_eq!(a2.unwrap().tokens.dims(), a.tokens.dims());
    }

    #[test]
    fn test_forward_runs_attention_then_cells_then_ffn() {
        let cfg = small_cfg();
        let plan = layer_plans(&cfg)[0];
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = FusionBlock::new(&cfg, &plan, vb).unwrap();

        let s_tokens = Tensor::rand(0f32, 1f32, (2 * 4, 5, 32), &Device::Cpu).unwrap();
        let s = SpatialTokens::new(s_tokens, 2, 4, 4, 32).unwrap();
        let t_tokens = Tensor::rand(0f32, 1f32, (2, 16, 32), &Device::Cpu).unwrap();
        let t = TemporalTokens::new(t_tokens, 2, 4, 4, 32).unwrap();
        let a_tokens = Tensor::rand(0f32, 1f32, (2, 4, 32), &Device::Cpu).unwrap();
        let a = AudioTokens::new(a_tokens, 2, 1, 4, 32).unwrap();

        let (s1, t1, a1) = block.forward(&s, &t, Some(&a), None, None, false).unwrap();
        let (s2, t2, a2) = block
            .self_attention_phase(s, t, Some(a), None, false)
            .unwrap();
        let (s2, t2, a2) = block.cross_phase(s2, t2, a2, None, false).unwrap();
        let (s2, t2, a2) = block.feed_forward_phase(s2, t2, a2, false).unwrap();

        let max_diff = |a: &Tensor, b: &Tensor| {
            (a - b)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap()
        };
        assert!(max_diff(&s1.tokens, &s2.tokens) < 1e-7);
        assert!(max_diff(&t1.tokens, &t2.tokens) < 1e-7);
        assert!(max_diff(&a1.unwrap().tokens, &a2.unwrap().tokens) < 1e-7);
    }

    #[test]
    fn test_only_zero_init_branches_are_stochastic() {
        // At initialization every drop-path guarded branch (cross deltas,
        // parallel MLP adapters) is exactly zero, so a high drop rate must
        // leave the layer deterministic: the attention deltas themselves are
        // never dropped.
        let cfg = small_cfg();
        let mut plan = layer_plans(&cfg)[0];
        plan.drop_path = 0.9;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = FusionBlock::new(&cfg, &plan, vb).unwrap();

        let s_tokens = Tensor::rand(0f32, 1f32, (2 * 4, 5, 32), &Device::Cpu).unwrap();
        let s = SpatialTokens::new(s_tokens, 2, 4, 4, 32).unwrap();
        let t_tokens = Tensor::rand(0f32, 1f32, (2, 16, 32), &Device::Cpu).unwrap();
        let t = TemporalTokens::new(t_tokens, 2, 4, 4, 32).unwrap();

        let (_, t_train, _) = block.forward(&s, &t, None, None, None, true).unwrap();
        let (_, t_eval, _) = block.forward(&s, &t, None, None, None, false).unwrap();
        let diff = (t_train.tokens - t_eval.tokens)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_block_runs_without_audio() {
        let cfg = ModelConfig {
            audio: None,
            ..small_cfg()
        };
        let plan = layer_plans(&cfg)[1];
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = FusionBlock::new(&cfg, &plan, vb).unwrap();

        let s_tokens = Tensor::rand(0f32, 1f32, (2 * 4, 5, 32), &Device::Cpu).unwrap();
        let s = SpatialTokens::new(s_tokens, 2, 4, 4, 32).unwrap();
        let t_tokens = Tensor::rand(0f32, 1f32, (2, 16, 32), &Device::Cpu).unwrap();
        let t = TemporalTokens::new(t_tokens, 2, 4, 4, 32).unwrap();

        let (s2, t2, a2) = block.forward(&s, &t, None, None, None, false).unwrap();
        assert_eq!(s2.tokens.dims(), s.tokens.dims());
        assert_eq!(t2.tokens.dims(), t.tokens.dims());
        assert!(a2.is_none());
    }
}
