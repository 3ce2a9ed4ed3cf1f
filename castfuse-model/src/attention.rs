use anyhow::Result;
use candle_core::{DType, Tensor, D};
use candle_nn::{linear, Dropout, Init, Linear, Module, VarBuilder};

/// Multi-head self-attention for the temporal stream. The fused QKV
/// projection carries no bias of its own; instead learned bias vectors are
/// added to the query and value after projection while the key stays
/// bias-free.
pub struct SelfAttention {
    qkv: Linear,
    q_bias: Tensor,
    v_bias: Tensor,
    proj: Linear,
    heads: usize,
    head_dim: usize,
    scale: f64,
    attn_drop: Dropout,
    proj_drop: Dropout,
}

impl SelfAttention {
    pub fn new(dim: usize, heads: usize, drop: f32, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / heads;
        let qkv = candle_nn::linear_no_bias(dim, dim * 3, vb.pp("qkv"))?;
        let q_bias = vb.get_with_hints(dim, "q_bias", Init::Const(0.))?;
        let v_bias = vb.get_with_hints(dim, "v_bias", Init::Const(0.))?;
        Ok(Self {
            qkv,
            q_bias,
            v_bias,
            proj: linear(dim, dim, vb.pp("proj"))?,
            heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
            attn_drop: Dropout::new(drop),
            proj_drop: Dropout::new(drop),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (b, n, d) = x.dims3()?;
        let qkv = self.qkv.forward(x)?;
        let q = qkv.narrow(D::Minus1, 0, d)?.broadcast_add(&self.q_bias)?;
        let k = qkv.narrow(D::Minus1, d, d)?;
        let v = qkv.narrow(D::Minus1, 2 * d, d)?.broadcast_add(&self.v_bias)?;

        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, n, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(q)?.affine(self.scale, 0.0)?;
        let k = split(k)?;
        let v = split(v)?;

        let scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let attn = self.attn_drop.forward(&attn, train)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, d))?;
        let out = self.proj.forward(&out)?;
        Ok(self.proj_drop.forward(&out, train)?)
    }
}

/// Standard multi-head self-attention with per-projection biases, used on
/// the spatial stream.
pub struct ClipAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    heads: usize,
    head_dim: usize,
    scale: f64,
}

impl ClipAttention {
    pub fn new(dim: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / heads;
        Ok(Self {
            q: linear(dim, dim, vb.pp("q"))?,
            k: linear(dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            out: linear(dim, dim, vb.pp("out"))?,
            heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, n, d) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, n, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(self.q.forward(x)?)?.affine(self.scale, 0.0)?;
        let k = split(self.k.forward(x)?)?;
        let v = split(self.v.forward(x)?)?;

        let scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, d))?;
        Ok(self.out.forward(&out)?)
    }
}

/// Audio-stream self-attention. Identical projection layout to
/// [`ClipAttention`] but accepts an additive relative position bias on the
/// attention scores.
pub struct AudioAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    out: Linear,
    heads: usize,
    head_dim: usize,
    scale: f64,
}

impl AudioAttention {
    pub fn new(dim: usize, heads: usize, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / heads;
        Ok(Self {
            q: linear(dim, dim, vb.pp("q"))?,
            k: linear(dim, dim, vb.pp("k"))?,
            v: linear(dim, dim, vb.pp("v"))?,
            out: linear(dim, dim, vb.pp("out"))?,
            heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    pub fn forward(&self, x: &Tensor, pos_bias: Option<&Tensor>) -> Result<Tensor> {
        let (b, n, d) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, n, self.heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(self.q.forward(x)?)?.affine(self.scale, 0.0)?;
        let k = split(self.k.forward(x)?)?;
        let v = split(self.v.forward(x)?)?;

        let mut scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        if let Some(bias) = pos_bias {
            scores = scores.broadcast_add(bias)?;
        }
        let attn = candle_nn::ops::softmax_last_dim(&scores)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, d))?;
        Ok(self.out.forward(&out)?)
    }
}

/// Bucketed relative position bias for audio self-attention. The bias table
/// is owned by the first audio sublayer; the computed `(1, heads, n, n)`
/// tensor is carried through the remaining layers unchanged.
pub struct RelativePositionBias {
    table: Tensor,
    num_buckets: usize,
    max_distance: usize,
    heads: usize,
}

impl RelativePositionBias {
    pub fn new(
        num_buckets: usize,
        max_distance: usize,
        heads: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let table = vb.get_with_hints(
            (num_buckets, heads),
            "table",
            Init::Randn { mean: 0.0, stdev: 0.02 },
        )?;
        Ok(Self { table, num_buckets, max_distance, heads })
    }

    fn bucket(&self, relative: i64) -> u32 {
        let num_buckets = self.num_buckets as i64 / 2;
        let mut bucket = if relative > 0 { num_buckets } else { 0 };
        let n = relative.abs();
        let max_exact = num_buckets / 2;
        if n < max_exact {
            bucket += n;
        } else {
            let log_ratio = (n as f64 / max_exact as f64).ln()
                / (self.max_distance as f64 / max_exact as f64).ln();
            let large = max_exact + (log_ratio * (num_buckets - max_exact) as f64) as i64;
            bucket += large.min(num_buckets - 1);
        }
        bucket as u32
    }

    /// Bias of shape `(1, heads, n, n)` for a sequence of `n` tokens.
    pub fn forward(&self, n: usize) -> Result<Tensor> {
        let mut idx = Vec::with_capacity(n * n);
        for q in 0..n {
            for k in 0..n {
                idx.push(self.bucket(k as i64 - q as i64));
            }
        }
        let idx = Tensor::from_vec(idx, n * n, self.table.device())?.to_dtype(DType::U32)?;
        let bias = self.table.index_select(&idx, 0)?; // (n*n, heads)
        Ok(bias
            .reshape((n, n, self.heads))?
            .permute((2, 0, 1))?
            .contiguous()?
            .unsqueeze(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    #[test]
    fn test_self_attention_shape() {
        let (_map, vb) = vb();
        let attn = SelfAttention::new(32, 4, 0.0, vb).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 10, 32), &Device::Cpu).unwrap();
        let y = attn.forward(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 10, 32]);
    }

    #[test]
    fn test_clip_attention_shape() {
        let (_map, vb) = vb();
        let attn = ClipAttention::new(32, 4, vb).unwrap();
        let x = Tensor::rand(0f32, 1f32, (3, 7, 32), &Device::Cpu).unwrap();
        let y = attn.forward(&x).unwrap();
        assert_eq!(y.dims(), &[3, 7, 32]);
    }

    #[test]
    fn test_relative_bias_shape_and_symmetry_of_buckets() {
        let (_map, vb) = vb();
        let bias = RelativePositionBias::new(32, 64, 4, vb).unwrap();
        let b = bias.forward(6).unwrap();
        assert_eq!(b.dims(), &[1, 4, 6, 6]);
        // identical relative offsets land in identical buckets
        assert_eq!(bias.bucket(3), bias.bucket(3));
        assert_ne!(bias.bucket(3), bias.bucket(-3));
    }

    #[test]
    fn test_audio_attention_accepts_bias() {
        let (_map, vb) = vb();
        let attn = AudioAttention::new(32, 4, vb.pp("attn")).unwrap();
        let rel = RelativePositionBias::new(32, 64, 4, vb.pp("rel")).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 6, 32), &Device::Cpu).unwrap();
        let pos = rel.forward(6).unwrap();
        let y = attn.forward(&x, Some(&pos)).unwrap();
        assert_eq!(y.dims(), &[2, 6, 32]);
    }
}
