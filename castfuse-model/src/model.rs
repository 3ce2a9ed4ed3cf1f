use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{linear, Dropout, LayerNorm, Linear, Module, VarBuilder};

use crate::attention::RelativePositionBias;
use crate::block::FusionBlock;
use crate::config::{layer_plans, ModelConfig, TimeEncoding};
use crate::embed::{AudioEmbed, SpatialEmbed, TubeletEmbed};
use crate::error::ModelError;
use crate::layers::{Adapter, BridgeAdapter, TimeMlp};
use crate::streams::{AudioTokens, SpatialTokens, TemporalTokens};

/// Inputs for one forward pass. `spec` and `spans` are optional; a model
/// built with an audio stream degrades to video-only when `spec` is absent.
pub struct ModelInput<'a> {
    pub video: &'a Tensor,
    pub spec: Option<&'a Tensor>,
    /// Per-clip `(start, end)` fractions in `[0, 1]`, shape `(batch, 2)`;
    /// required when time encoding is configured
    pub spans: Option<&'a Tensor>,
}

impl<'a> ModelInput<'a> {
    pub fn video_only(video: &'a Tensor) -> Self {
        Self { video, spec: None, spans: None }
    }
}

/// Classifier output.
pub enum ModelOutput {
    /// `(batch, num_classes)`
    Single(Tensor),
    /// `(batch, noun_classes)` and `(batch, verb_classes)`
    Composition { noun: Tensor, verb: Tensor },
}

/// Closed-head logits and (when the projections are configured)
/// prototype-space embeddings from a single composition forward pass.
pub struct CompositionScores {
    /// `(batch, noun_classes)`
    pub noun_logits: Tensor,
    /// `(batch, verb_classes)`
    pub verb_logits: Tensor,
    /// `(batch, prototype_dim)` when `prototype_dim` is configured
    pub noun_embed: Option<Tensor>,
    /// `(batch, prototype_dim)` when `prototype_dim` is configured
    pub verb_embed: Option<Tensor>,
}

enum Head {
    Single {
        noun_adapter: Adapter,
        verb_adapter: Adapter,
        audio_bridge: Option<BridgeAdapter>,
        head: Linear,
    },
    Composition {
        noun_adapter: Adapter,
        verb_adapter: Adapter,
        audio_noun: Option<BridgeAdapter>,
        audio_verb: Option<BridgeAdapter>,
        noun_norm: LayerNorm,
        verb_norm: LayerNorm,
        head_noun: Linear,
        head_verb: Linear,
        noun_proj: Option<Linear>,
        verb_proj: Option<Linear>,
    },
}

/// Three-stream B-CAST fusion transformer.
pub struct CastModel {
    cfg: ModelConfig,
    spatial_embed: SpatialEmbed,
    tubelet_embed: TubeletEmbed,
    audio_embed: Option<AudioEmbed>,
    audio_rel_bias: Option<RelativePositionBias>,
    time_mlp: Option<TimeMlp>,
    blocks: Vec<FusionBlock>,
    ln_post: LayerNorm,
    fc_norm: LayerNorm,
    head_drop: Dropout,
    head: Head,
}

impl CastModel {
    pub fn new(cfg: ModelConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let dim = cfg.embed_dim;
        tracing::info!(
            depth = cfg.depth,
            embed_dim = dim,
            audio = cfg.audio.is_some(),
            composition = cfg.composition,
            "building fusion model"
        );

        let (audio_embed, audio_rel_bias) = match &cfg.audio {
            Some(audio) => (
                Some(AudioEmbed::new(&cfg, audio, vb.pp("audio_embed"))?),
                Some(RelativePositionBias::new(
                    audio.rel_pos_buckets,
                    audio.rel_pos_max_distance,
                    cfg.num_heads,
                    vb.pp("audio_rel_bias"),
                )?),
            ),
            None => (None, None),
        };
        let time_mlp = if cfg.time_encoding != TimeEncoding::None {
            Some(TimeMlp::new(cfg.cross_dim(), vb.pp("time_mlp"))?)
        } else {
            None
        };

        let blocks = layer_plans(&cfg)
            .iter()
            .map(|plan| FusionBlock::new(&cfg, plan, vb.pp(format!("blocks.{}", plan.index))))
            .collect::<Result<Vec<_>>>()?;

        let head = if cfg.composition {
            let bridge = |vb: VarBuilder| -> Result<Option<BridgeAdapter>> {
                if cfg.audio.is_some() {
                    Ok(Some(BridgeAdapter::new(dim, dim, vb)?))
                } else {
                    Ok(None)
                }
            };
            let proj = |vb: VarBuilder| -> Result<Option<Linear>> {
                match cfg.prototype_dim {
                    Some(pd) => Ok(Some(linear(dim, pd, vb)?)),
                    None => Ok(None),
                }
            };
            Head::Composition {
                noun_adapter: Adapter::new(dim, true, vb.pp("noun_adapter"))?,
                verb_adapter: Adapter::new(dim, true, vb.pp("verb_adapter"))?,
                audio_noun: bridge(vb.pp("audio_noun"))?,
                audio_verb: bridge(vb.pp("audio_verb"))?,
                noun_norm: candle_nn::layer_norm(dim, 1e-5, vb.pp("noun_norm"))?,
                verb_norm: candle_nn::layer_norm(dim, 1e-5, vb.pp("verb_norm"))?,
                head_noun: linear(dim, cfg.noun_classes, vb.pp("head_noun"))?,
                head_verb: linear(dim, cfg.verb_classes, vb.pp("head_verb"))?,
                noun_proj: proj(vb.pp("noun_proj"))?,
                verb_proj: proj(vb.pp("verb_proj"))?,
            }
        } else {
            Head::Single {
                noun_adapter: Adapter::new(dim, true, vb.pp("noun_adapter"))?,
                verb_adapter: Adapter::new(dim, true, vb.pp("verb_adapter"))?,
                audio_bridge: if cfg.audio.is_some() {
                    Some(BridgeAdapter::new(dim, dim, vb.pp("audio_bridge"))?)
                } else {
                    None
                },
                head: linear(dim, cfg.num_classes, vb.pp("head"))?,
            }
        };

        let spatial_embed = SpatialEmbed::new(&cfg, vb.pp("spatial_embed"))?;
        let tubelet_embed = TubeletEmbed::new(&cfg, vb.pp("tubelet_embed"))?;
        let ln_post = candle_nn::layer_norm(dim, 1e-5, vb.pp("ln_post"))?;
        let fc_norm = candle_nn::layer_norm(dim, 1e-5, vb.pp("fc_norm"))?;
        let head_drop = Dropout::new(cfg.head_drop_rate);

        Ok(Self {
            cfg,
            spatial_embed,
            tubelet_embed,
            audio_embed,
            audio_rel_bias,
            time_mlp,
            blocks,
            ln_post,
            fc_norm,
            head_drop,
            head,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.cfg
    }

    /// Expand per-clip `(start, end)` spans into per-chunk segment spans of
    /// shape `(batch, chunks, 2)` and encode them.
    fn time_encoding(&self, spans: Option<&Tensor>) -> Result<Option<Tensor>> {
        let mlp = match &self.time_mlp {
            Some(mlp) => mlp,
            None => return Ok(None),
        };
        let spans = spans.ok_or(ModelError::MissingClipSpans)?;
        let (b, two) = spans.dims2()?;
        if two != 2 {
            return Err(ModelError::shape("clip spans", "(b, 2)", format!("{:?}", spans.dims())).into());
        }
        let chunks = self.cfg.temporal_chunks();
        let start = spans.narrow(1, 0, 1)?;
        let duration = spans.narrow(1, 1, 1)?.sub(&start)?;
        let lo: Vec<f32> = (0..chunks).map(|i| i as f32 / chunks as f32).collect();
        let hi: Vec<f32> = (0..chunks).map(|i| (i + 1) as f32 / chunks as f32).collect();
        let lo = Tensor::from_vec(lo, (1, chunks), spans.device())?;
        let hi = Tensor::from_vec(hi, (1, chunks), spans.device())?;
        let seg_lo = start.broadcast_add(&duration.broadcast_mul(&lo)?)?;
        let seg_hi = start.broadcast_add(&duration.broadcast_mul(&hi)?)?;
        let seg = Tensor::stack(&[&seg_lo, &seg_hi], 2)?; // (b, chunks, 2)
        let enc = mlp.forward(&seg)?; // (b, chunks, cross_dim)
        debug_assert_eq!(enc.dims()[0], b);
        Ok(Some(enc.unsqueeze(2)?))
    }

    /// Run the embedders and the fusion stack; returns pooled per-stream
    /// features, each `(batch, embed_dim)`.
    pub fn forward_features(
        &self,
        input: &ModelInput,
        train: bool,
    ) -> Result<(Tensor, Tensor, Option<Tensor>)> {
        let mut s = self.spatial_embed.forward(&self.cfg, input.video)?;
        let mut t = self.tubelet_embed.forward(&self.cfg, input.video)?;
        let mut a: Option<AudioTokens> = match input.spec {
            Some(spec) => {
                let embed = self
                    .audio_embed
                    .as_ref()
                    .ok_or(ModelError::AudioNotConfigured)?;
                Some(embed.forward(&self.cfg, spec)?)
            }
            None => None,
        };

        let time_enc = self.time_encoding(input.spans)?;
        let time_pair = time_enc.as_ref().map(|e| (e, e));
        let audio_pos_bias = match (&self.audio_rel_bias, &a) {
            (Some(rel), Some(audio)) => Some(rel.forward(audio.tokens.dim(1)?)?),
            _ => None,
        };

        for block in &self.blocks {
            let (s2, t2, a2) = block.forward(
                &s,
                &t,
                a.as_ref(),
                time_pair,
                audio_pos_bias.as_ref(),
                train,
            )?;
            s = s2;
            t = t2;
            a = a2;
        }

        let s_pool = self.pool_spatial(&s)?;
        let t_pool = self.pool_temporal(&t)?;
        let a_pool = match &a {
            Some(audio) => Some(audio.tokens.mean(1)?),
            None => None,
        };
        Ok((s_pool, t_pool, a_pool))
    }

    /// Mean of the per-frame class tokens after the post layer norm.
    fn pool_spatial(&self, s: &SpatialTokens) -> Result<Tensor> {
        let cls = s
            .tokens
            .narrow(1, 0, 1)?
            .reshape((s.batch, s.frames, s.width))?;
        let cls = self.ln_post.forward(&cls)?;
        Ok(cls.mean(1)?)
    }

    /// Mean of all tubelet tokens followed by the pooled-feature norm.
    fn pool_temporal(&self, t: &TemporalTokens) -> Result<Tensor> {
        Ok(self.fc_norm.forward(&t.tokens.mean(1)?)?)
    }

    fn composition_features(
        &self,
        s_pool: &Tensor,
        t_pool: &Tensor,
        a_pool: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let Head::Composition {
            noun_adapter,
            verb_adapter,
            audio_noun,
            audio_verb,
            noun_norm,
            verb_norm,
            ..
        } = &self.head
        else {
            return Err(
                ModelError::InvalidConfig("composition head not configured".into()).into(),
            );
        };
        let mut noun = noun_adapter.forward(s_pool)?;
        let mut verb = verb_adapter.forward(t_pool)?;
        if let Some(a_pool) = a_pool {
            if let (Some(an), Some(av)) = (audio_noun, audio_verb) {
                noun = noun.add(&an.forward(a_pool)?)?;
                verb = verb.add(&av.forward(a_pool)?)?;
            }
        }
        let noun = self.head_drop.forward(&noun_norm.forward(&noun)?, train)?;
        let verb = self.head_drop.forward(&verb_norm.forward(&verb)?, train)?;
        Ok((noun, verb))
    }

    /// Closed-vocabulary forward pass through the classifier heads.
    pub fn forward(&self, input: &ModelInput, train: bool) -> Result<ModelOutput> {
        let (s_pool, t_pool, a_pool) = self.forward_features(input, train)?;
        match &self.head {
            Head::Single {
                noun_adapter,
                verb_adapter,
                audio_bridge,
                head,
            } => {
                let mut x = noun_adapter
                    .forward(&s_pool)?
                    .add(&verb_adapter.forward(&t_pool)?)?
                    .affine(0.5, 0.0)?;
                if let (Some(bridge), Some(a_pool)) = (audio_bridge, &a_pool) {
                    x = x.add(&bridge.forward(a_pool)?)?;
                }
                let x = self.head_drop.forward(&x, train)?;
                Ok(ModelOutput::Single(head.forward(&x)?))
            }
            Head::Composition {
                head_noun,
                head_verb,
                ..
            } => {
                let (noun, verb) =
                    self.composition_features(&s_pool, &t_pool, a_pool.as_ref(), train)?;
                Ok(ModelOutput::Composition {
                    noun: head_noun.forward(&noun)?,
                    verb: head_verb.forward(&verb)?,
                })
            }
        }
    }

    /// Everything the evaluation paths need from one pass: closed head
    /// logits plus prototype-space embeddings where projections exist.
    pub fn forward_scores(&self, input: &ModelInput, train: bool) -> Result<CompositionScores> {
        let (s_pool, t_pool, a_pool) = self.forward_features(input, train)?;
        let (noun, verb) = self.composition_features(&s_pool, &t_pool, a_pool.as_ref(), train)?;
        let Head::Composition {
            head_noun,
            head_verb,
            noun_proj,
            verb_proj,
            ..
        } = &self.head
        else {
            return Err(
                ModelError::InvalidConfig("composition head not configured".into()).into(),
            );
        };
        Ok(CompositionScores {
            noun_logits: head_noun.forward(&noun)?,
            verb_logits: head_verb.forward(&verb)?,
            noun_embed: noun_proj.as_ref().map(|p| p.forward(&noun)).transpose()?,
            verb_embed: verb_proj.as_ref().map(|p| p.forward(&verb)).transpose()?,
        })
    }

    /// Prompt-mode forward: noun features projected into the prototype space
    /// (scored against text prototypes downstream) plus verb head logits.
    pub fn forward_prompt(&self, input: &ModelInput, train: bool) -> Result<(Tensor, Tensor)> {
        let scores = self.forward_scores(input, train)?;
        let noun_embed = scores.noun_embed.ok_or_else(|| {
            ModelError::InvalidConfig("prototype projection not configured".into())
        })?;
        Ok((noun_embed, scores.verb_logits))
    }

    /// Open-vocabulary forward: both noun and verb features projected into
    /// the prototype space.
    pub fn forward_open_vocab(
        &self,
        input: &ModelInput,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let scores = self.forward_scores(input, train)?;
        match (scores.noun_embed, scores.verb_embed) {
            (Some(noun), Some(verb)) => Ok((noun, verb)),
            _ => Err(ModelError::InvalidConfig(
                "prototype projections not configured".into(),
            )
            .into()),
        }
    }
}
