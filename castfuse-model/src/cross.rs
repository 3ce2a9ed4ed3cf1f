//! Bottlenecked bidirectional cross-attention. A [`BcastCell`] joins two
//! token streams: both are down-projected to a shared bottleneck width,
//! normalized, exchanged through two directed attentions (each side queries
//! the other), then activated, up-projected back to full width and returned
//! as residual deltas. The up-projections start at zero so a fresh cell is
//! an identity on both streams.

use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{linear, Init, LayerNorm, Linear, Module, VarBuilder};

use crate::config::TimeEncoding;
use crate::error::ModelError;
use crate::layers::{zero_linear, DropPath};

/// Projection widths for one directed attention. Channel-concatenated time
/// encodings double the input width; the query/key/value widths and the
/// softmax scale are derived from the doubled width while the output stays
/// at the bottleneck width.
#[derive(Debug, Clone, Copy)]
pub struct CrossDims {
    pub in_dim: usize,
    pub q_dim: usize,
    pub kv_dim: usize,
    pub out_dim: usize,
    pub heads: usize,
    pub scale: f64,
}

impl CrossDims {
    pub fn new(cross_dim: usize, heads: usize, concat_time: bool) -> Self {
        if concat_time {
            let in_dim = cross_dim * 2;
            let head_dim = in_dim / heads;
            Self {
                in_dim,
                q_dim: cross_dim,
                kv_dim: cross_dim,
                out_dim: cross_dim,
                heads,
                scale: (head_dim as f64).powf(-0.5),
            }
        } else {
            let head_dim = cross_dim / heads;
            Self {
                in_dim: cross_dim,
                q_dim: cross_dim,
                kv_dim: cross_dim,
                out_dim: cross_dim,
                heads,
                scale: (head_dim as f64).powf(-0.5),
            }
        }
    }
}

/// One direction of the exchange: the receiver supplies queries, the sender
/// supplies a fused key/value projection, and attention normalizes over the
/// sender's token axis.
pub struct DirectedCrossAttention {
    q: Linear,
    kv: Linear,
    proj: Linear,
    dims: CrossDims,
}

impl DirectedCrossAttention {
    pub fn new(dims: CrossDims, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q: linear(dims.in_dim, dims.q_dim, vb.pp("q"))?,
            kv: linear(dims.in_dim, dims.kv_dim * 2, vb.pp("kv"))?,
            proj: linear(dims.q_dim, dims.out_dim, vb.pp("proj"))?,
            dims,
        })
    }

    /// `receiver` is `(b, nq, in_dim)`, `sender` is `(b, nk, in_dim)`;
    /// returns `(b, nq, out_dim)`.
    pub fn forward(&self, receiver: &Tensor, sender: &Tensor) -> Result<Tensor> {
        let (b, nq, _) = receiver.dims3()?;
        let nk = sender.dim(1)?;
        let heads = self.dims.heads;
        let qh = self.dims.q_dim / heads;
        let kh = self.dims.kv_dim / heads;

        let q = self
            .q
            .forward(receiver)?
            .reshape((b, nq, heads, qh))?
            .transpose(1, 2)?
            .contiguous()?
            .affine(self.dims.scale, 0.0)?;
        let kv = self.kv.forward(sender)?;
        let k = kv
            .narrow(D::Minus1, 0, self.dims.kv_dim)?
            .reshape((b, nk, heads, kh))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = kv
            .narrow(D::Minus1, self.dims.kv_dim, self.dims.kv_dim)?
            .reshape((b, nk, heads, kh))?
            .transpose(1, 2)?
            .contiguous()?;

        let scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, nq, self.dims.q_dim))?;
        Ok(self.proj.forward(&out)?)
    }
}

/// Geometry and behavior of one cross-attention cell.
#[derive(Debug, Clone, Copy)]
pub struct CellConfig {
    /// Full stream width outside the cell
    pub dim: usize,
    /// Bottleneck width inside the cell
    pub cross_dim: usize,
    pub heads: usize,
    /// (frames, tokens-per-frame) of the left stream
    pub left: (usize, usize),
    /// (frames, tokens-per-frame) of the right stream
    pub right: (usize, usize),
    pub attn_all_frame: bool,
    pub use_pos: bool,
    pub time_mode: TimeEncoding,
    pub drop_path: f64,
}

/// Bidirectional bottleneck cross-attention cell over two streams laid out
/// as `(batch, frames, tokens, dim)`.
pub struct BcastCell {
    down_l: Linear,
    down_r: Linear,
    ln_l: LayerNorm,
    ln_r: LayerNorm,
    l2r: DirectedCrossAttention,
    r2l: DirectedCrossAttention,
    up_l: Linear,
    up_r: Linear,
    l_space_pos: Option<Tensor>,
    l_time_pos: Option<Tensor>,
    r_space_pos: Option<Tensor>,
    r_time_pos: Option<Tensor>,
    cfg: CellConfig,
    drop_path: DropPath,
}

impl BcastCell {
    pub fn new(cfg: CellConfig, vb: VarBuilder) -> Result<Self> {
        let concat = cfg.time_mode == TimeEncoding::Concat;
        let dims = CrossDims::new(cfg.cross_dim, cfg.heads, concat);
        let pos_scale = (dims.in_dim as f64).powf(-0.5);
        let pos = |len: usize, name: &str| -> Result<Tensor> {
            Ok(vb.get_with_hints(
                (len, dims.in_dim),
                name,
                Init::Randn { mean: 0.0, stdev: pos_scale },
            )?)
        };
        let (l_space_pos, l_time_pos, r_space_pos, r_time_pos) = if cfg.use_pos {
            (
                Some(pos(cfg.left.1, "l_space_pos")?),
                Some(pos(cfg.left.0, "l_time_pos")?),
                Some(pos(cfg.right.1, "r_space_pos")?),
                Some(pos(cfg.right.0, "r_time_pos")?),
            )
        } else {
            (None, None, None, None)
        };
        Ok(Self {
            down_l: linear(cfg.dim, cfg.cross_dim, vb.pp("down_l"))?,
            down_r: linear(cfg.dim, cfg.cross_dim, vb.pp("down_r"))?,
            ln_l: candle_nn::layer_norm(cfg.cross_dim, 1e-5, vb.pp("ln_l"))?,
            ln_r: candle_nn::layer_norm(cfg.cross_dim, 1e-5, vb.pp("ln_r"))?,
            l2r: DirectedCrossAttention::new(dims, vb.pp("l2r"))?,
            r2l: DirectedCrossAttention::new(dims, vb.pp("r2l"))?,
            up_l: zero_linear(cfg.cross_dim, cfg.dim, vb.pp("up_l"))?,
            up_r: zero_linear(cfg.cross_dim, cfg.dim, vb.pp("up_r"))?,
            l_space_pos,
            l_time_pos,
            r_space_pos,
            r_time_pos,
            cfg,
            drop_path: DropPath::new(cfg.drop_path),
        })
    }

    fn inject_time(&self, x: &Tensor, enc: Option<&Tensor>) -> Result<Tensor> {
        let enc = match enc {
            Some(e) => e,
            None => {
                if self.cfg.time_mode == TimeEncoding::None {
                    return Ok(x.clone());
                }
                return Err(ModelError::MissingClipSpans.into());
            }
        };
        match self.cfg.time_mode {
            TimeEncoding::None => Ok(x.clone()),
            TimeEncoding::Add => Ok(x.broadcast_add(enc)?),
            TimeEncoding::Concat => {
                let (b, t, n, d) = x.dims4()?;
                let enc = enc.broadcast_as((b, t, n, d))?.contiguous()?;
                Ok(Tensor::cat(&[x, &enc], D::Minus1)?)
            }
        }
    }

    fn add_pos(
        &self,
        x: &Tensor,
        space: &Option<Tensor>,
        time: &Option<Tensor>,
        with_space: bool,
    ) -> Result<Tensor> {
        let mut x = x.clone();
        if with_space {
            if let Some(sp) = space {
                // (n, d) broadcast over batch and frames
                x = x.broadcast_add(&sp.unsqueeze(0)?.unsqueeze(0)?)?;
            }
        }
        if let Some(tp) = time {
            // (t, d) broadcast over batch and tokens
            x = x.broadcast_add(&tp.unsqueeze(0)?.unsqueeze(2)?)?;
        }
        Ok(x)
    }

    /// Exchange between `left` and `right` bodies of shape
    /// `(batch, frames, tokens, dim)`. Time encodings, when configured, are
    /// `(batch, frames, 1, cross_dim)` per side. Returns the residual deltas
    /// for both streams, already stochastic-depth masked.
    pub fn forward(
        &self,
        left: &Tensor,
        right: &Tensor,
        time_enc: Option<(&Tensor, &Tensor)>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (b, tl, nl, _) = left.dims4()?;
        let (br, tr, nr, _) = right.dims4()?;
        if b != br {
            return Err(ModelError::shape(
                "cross cell batch",
                format!("{b}"),
                format!("{br}"),
            )
            .into());
        }

        let l_low = self.ln_l.forward(&self.down_l.forward(left)?)?;
        let r_low = self.ln_r.forward(&self.down_r.forward(right)?)?;
        let l_low = self.inject_time(&l_low, time_enc.map(|t| t.0))?;
        let r_low = self.inject_time(&r_low, time_enc.map(|t| t.1))?;

        let dc = self.cfg.cross_dim;
        let (dl, dr) = if self.cfg.attn_all_frame {
            let lq = self
                .add_pos(&l_low, &self.l_space_pos, &self.l_time_pos, true)?
                .reshape((b, tl * nl, ()))?;
            let rq = self
                .add_pos(&r_low, &self.r_space_pos, &self.r_time_pos, true)?
                .reshape((b, tr * nr, ()))?;
            let dr = self.l2r.forward(&rq, &lq)?.reshape((b, tr, nr, dc))?;
            let dl = self.r2l.forward(&lq, &rq)?.reshape((b, tl, nl, dc))?;
            (dl, dr)
        } else {
            // Per-frame attention. The side with fewer frames is repeated to
            // the common frame count and its deltas averaged back down.
            let common = tl.max(tr);
            if common % tl != 0 || common % tr != 0 {
                return Err(ModelError::shape(
                    "per-frame cross cell",
                    "commensurable frame counts",
                    format!("{tl} vs {tr}"),
                )
                .into());
            }
            let expand = |x: &Tensor, t: usize, n: usize| -> Result<Tensor> {
                let d = x.dim(D::Minus1)?;
                let rep = common / t;
                let x = if rep > 1 {
                    x.unsqueeze(2)?
                        .broadcast_as((b, t, rep, n, d))?
                        .contiguous()?
                        .reshape((b, common, n, d))?
                } else {
                    x.clone()
                };
                Ok(x.reshape((b * common, n, d))?)
            };
            let reduce = |x: &Tensor, t: usize, n: usize| -> Result<Tensor> {
                let x = x.reshape((b, common, n, dc))?;
                let rep = common / t;
                if rep > 1 {
                    Ok(x.reshape((b, t, rep, n, dc))?.mean(2)?)
                } else {
                    Ok(x)
                }
            };
            let lq = expand(
                &self.add_pos(&l_low, &self.l_space_pos, &self.l_time_pos, false)?,
                tl,
                nl,
            )?;
            let rq = expand(
                &self.add_pos(&r_low, &self.r_space_pos, &self.r_time_pos, false)?,
                tr,
                nr,
            )?;
            let dr = reduce(&self.l2r.forward(&rq, &lq)?, tr, nr)?;
            let dl = reduce(&self.r2l.forward(&lq, &rq)?, tl, nl)?;
            (dl, dr)
        };

        let dl = self.up_l.forward(&dl.gelu_erf()?)?;
        let dr = self.up_r.forward(&dr.gelu_erf()?)?;
        let dl = self.drop_path.forward(&dl, train)?;
        let dr = self.drop_path.forward(&dr, train)?;
        Ok((dl, dr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    fn cell_cfg(attn_all_frame: bool) -> CellConfig {
        CellConfig {
            dim: 32,
            cross_dim: 16,
            heads: 4,
            left: (4, 9),
            right: (8, 9),
            attn_all_frame,
            use_pos: true,
            time_mode: TimeEncoding::None,
            drop_path: 0.0,
        }
    }

    #[test]
    fn test_cell_preserves_shapes() {
        let (_map, vb) = vb();
        let cell = BcastCell::new(cell_cfg(true), vb).unwrap();
        let l = Tensor::rand(0f32, 1f32, (2, 4, 9, 32), &Device::Cpu).unwrap();
        let r = Tensor::rand(0f32, 1f32, (2, 8, 9, 32), &Device::Cpu).unwrap();
        let (dl, dr) = cell.forward(&l, &r, None, false).unwrap();
        assert_eq!(dl.dims(), l.dims());
        assert_eq!(dr.dims(), r.dims());
    }

    #[test]
    fn test_fresh_cell_is_identity() {
        // zero-initialized up-projections make both deltas vanish
        let (_map, vb) = vb();
        let cell = BcastCell::new(cell_cfg(true), vb).unwrap();
        let l = Tensor::rand(0f32, 1f32, (2, 4, 9, 32), &Device::Cpu).unwrap();
        let r = Tensor::rand(0f32, 1f32, (2, 8, 9, 32), &Device::Cpu).unwrap();
        let (dl, dr) = cell.forward(&l, &r, None, false).unwrap();
        let max_l = dl.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        let max_r = dr.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max_l < 1e-6 && max_r < 1e-6);
    }

    #[test]
    fn test_per_frame_mode_handles_frame_mismatch() {
        let (_map, vb) = vb();
        let cell = BcastCell::new(cell_cfg(false), vb).unwrap();
        let l = Tensor::rand(0f32, 1f32, (2, 4, 9, 32), &Device::Cpu).unwrap();
        let r = Tensor::rand(0f32, 1f32, (2, 8, 9, 32), &Device::Cpu).unwrap();
        let (dl, dr) = cell.forward(&l, &r, None, false).unwrap();
        assert_eq!(dl.dims(), &[2, 4, 9, 32]);
        assert_eq!(dr.dims(), &[2, 8, 9, 32]);
    }

    #[test]
    fn test_incommensurable_frames_rejected() {
        let (_map, vb) = vb();
        let mut cfg = cell_cfg(false);
        cfg.left = (3, 9);
        let cell = BcastCell::new(cfg, vb).unwrap();
        let l = Tensor::zeros((2, 3, 9, 32), DType::F32, &Device::Cpu).unwrap();
        let r = Tensor::zeros((2, 8, 9, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(cell.forward(&l, &r, None, false).is_err());
    }

    #[test]
    fn test_concat_time_mode_keeps_widths() {
        let (_map, vb) = vb();
        let mut cfg = cell_cfg(true);
        cfg.time_mode = TimeEncoding::Concat;
        let cell = BcastCell::new(cfg, vb).unwrap();
        let l = Tensor::rand(0f32, 1f32, (2, 4, 9, 32), &Device::Cpu).unwrap();
        let r = Tensor::rand(0f32, 1f32, (2, 8, 9, 32), &Device::Cpu).unwrap();
        let enc_l = Tensor::rand(0f32, 1f32, (2, 4, 1, 16), &Device::Cpu).unwrap();
        let enc_r = Tensor::rand(0f32, 1f32, (2, 8, 1, 16), &Device::Cpu).unwrap();
        let (dl, dr) = cell
            .forward(&l, &r, Some((&enc_l, &enc_r)), false)
            .unwrap();
        assert_eq!(dl.dims(), l.dims());
        assert_eq!(dr.dims(), r.dims());
    }

    #[test]
    fn test_time_mode_requires_spans() {
        let (_map, vb) = vb();
        let mut cfg = cell_cfg(true);
        cfg.time_mode = TimeEncoding::Add;
        let cell = BcastCell::new(cfg, vb).unwrap();
        let l = Tensor::zeros((1, 4, 9, 32), DType::F32, &Device::Cpu).unwrap();
        let r = Tensor::zeros((1, 8, 9, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(cell.forward(&l, &r, None, false).is_err());
    }
}
