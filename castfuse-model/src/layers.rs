use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{linear, Dropout, Init, LayerNorm, Linear, Module, VarBuilder};

/// CLIP's sigmoid-based GELU approximation: `x * sigmoid(1.702 x)`
pub fn quick_gelu(x: &Tensor) -> Result<Tensor> {
    let gate = candle_nn::ops::sigmoid(&(x * 1.702f64)?)?;
    Ok(x.mul(&gate)?)
}

/// Linear layer whose weight and bias start at zero, so the module it feeds
/// is a no-op at initialization and the surrounding residual path dominates
/// early training.
pub fn zero_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", Init::Const(0.))?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Bottleneck adapter: down-project to `dim / 4`, GELU, zero-initialized
/// up-projection, optional internal residual.
pub struct Adapter {
    down: Linear,
    up: Linear,
    skip_connect: bool,
}

impl Adapter {
    pub fn new(dim: usize, skip_connect: bool, vb: VarBuilder) -> Result<Self> {
        let hidden = dim / 4;
        Ok(Self {
            down: linear(dim, hidden, vb.pp("down"))?,
            up: zero_linear(hidden, dim, vb.pp("up"))?,
            skip_connect,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.down.forward(x)?.gelu_erf()?;
        let h = self.up.forward(&h)?;
        if self.skip_connect {
            Ok(x.add(&h)?)
        } else {
            Ok(h)
        }
    }
}

/// Cross-width adapter used to fold the audio stream into the noun/verb
/// feature spaces: `in_dim -> in_dim/4 -> out_dim` with QuickGELU.
pub struct BridgeAdapter {
    down: Linear,
    up: Linear,
}

impl BridgeAdapter {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            down: linear(in_dim, in_dim / 4, vb.pp("down"))?,
            up: linear(in_dim / 4, out_dim, vb.pp("up"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = quick_gelu(&self.down.forward(x)?)?;
        Ok(self.up.forward(&h)?)
    }
}

/// Transformer MLP with erf-GELU and dropout, used on the temporal stream.
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
    drop: Dropout,
}

impl Mlp {
    pub fn new(dim: usize, hidden: usize, drop: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, dim, vb.pp("fc2"))?,
            drop: Dropout::new(drop),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.gelu_erf()?;
        let h = self.drop.forward(&h, train)?;
        let h = self.fc2.forward(&h)?;
        Ok(self.drop.forward(&h, train)?)
    }
}

/// CLIP-style MLP with QuickGELU, used on the spatial stream.
pub struct ClipMlp {
    fc: Linear,
    proj: Linear,
}

impl ClipMlp {
    pub fn new(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc: linear(dim, hidden, vb.pp("c_fc"))?,
            proj: linear(hidden, dim, vb.pp("c_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = quick_gelu(&self.fc.forward(x)?)?;
        Ok(self.proj.forward(&h)?)
    }
}

/// Maps a `(start, end)` clip-span pair in `[0, 1]` to a `dim`-wide encoding:
/// three Linear+ReLU stages followed by LayerNorm.
pub struct TimeMlp {
    l1: Linear,
    l2: Linear,
    l3: Linear,
    norm: LayerNorm,
}

impl TimeMlp {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            l1: linear(2, dim, vb.pp("l1"))?,
            l2: linear(dim, dim, vb.pp("l2"))?,
            l3: linear(dim, dim, vb.pp("l3"))?,
            norm: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm"))?,
        })
    }

    /// `spans` is `(batch, segments, 2)`; returns `(batch, segments, dim)`.
    pub fn forward(&self, spans: &Tensor) -> Result<Tensor> {
        let h = self.l1.forward(spans)?.relu()?;
        let h = self.l2.forward(&h)?.relu()?;
        let h = self.l3.forward(&h)?.relu()?;
        Ok(self.norm.forward(&h)?)
    }
}

/// Stochastic depth on the residual branch. Scales the surviving paths by
/// `1 / keep_prob`; identity at eval time or at rate zero.
pub struct DropPath {
    prob: f64,
}

impl DropPath {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.prob <= 0.0 {
            return Ok(x.clone());
        }
        let keep = 1.0 - self.prob;
        let batch = x.dim(0)?;
        let mut mask_shape = vec![batch];
        mask_shape.extend(std::iter::repeat(1).take(x.rank() - 1));
        let mask = Tensor::rand(0f32, 1f32, mask_shape, x.device())?
            .to_dtype(x.dtype())?
            .affine(1.0, keep)?
            .floor()?;
        Ok(x.broadcast_mul(&mask)?.affine(1.0 / keep, 0.0)?)
    }
}

/// Fixed sinusoidal position table of shape `(positions, dim)`.
pub fn sinusoid_table(positions: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut data = Vec::with_capacity(positions * dim);
    for pos in 0..positions {
        for i in 0..dim {
            let angle = pos as f64 / 10000f64.powf(2.0 * (i / 2) as f64 / dim as f64);
            let v = if i % 2 == 0 { angle.sin() } else { angle.cos() };
            data.push(v as f32);
        }
    }
    Ok(Tensor::from_vec(data, (positions, dim), device)?.to_dtype(DType::F32)?)
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
    fn test_quick_gelu_matches_formula() {
        let x = Tensor::new(&[[-1.0f32, 0.0, 2.0]], &Device::Cpu).unwrap();
        let y = quick_gelu(&x).unwrap().to_vec2::<f32>().unwrap();
        for (xi, yi) in [-1.0f32, 0.0, 2.0].iter().zip(&y[0]) {
            let expect = xi * (1.0 / (1.0 + (-1.702 * xi).exp()));
            assert!((yi - expect).abs() < 1e-5);
        }
    }

    #[test]
    fn test_adapter_starts_as_identity() {
        let (_map, vb) = vb();
        let adapter = Adapter::new(32, true, vb).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 5, 32), &Device::Cpu).unwrap();
        let y = adapter.forward(&x).unwrap();
        let diff = (x - y).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_non_skip_adapter_starts_at_zero() {
        let (_map, vb) = vb();
        let adapter = Adapter::new(32, false, vb).unwrap();
        let x = Tensor::rand(0f32, 1f32, (2, 32), &Device::Cpu).unwrap();
        let y = adapter.forward(&x).unwrap();
        assert!(y.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_drop_path_identity_at_eval() {
        let dp = DropPath::new(0.5);
        let x = Tensor::rand(0f32, 1f32, (4, 3), &Device::Cpu).unwrap();
        let y = dp.forward(&x, false).unwrap();
        let diff = (x - y).unwrap().abs().unwrap().max_all().unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-7);
    }

    #[test]
    fn test_drop_path_masks_whole_samples() {
        let dp = DropPath::new(0.5);
        let x = Tensor::ones((64, 8), DType::F32, &Device::Cpu).unwrap();
        let y = dp.forward(&x, true).unwrap().to_vec2::<f32>().unwrap();
        for row in &y {
            let first = row[0];
            assert!(first.abs() < 1e-6 || (first - 2.0).abs() < 1e-5);
            assert!(row.iter().all(|v| (v - first).abs() < 1e-6));
        }
    }

    #[test]
    fn test_time_mlp_shape() {
        let (_map, vb) = vb();
        let mlp = TimeMlp::new(48, vb).unwrap();
        let spans = Tensor::rand(0f32, 1f32, (2, 8, 2), &Device::Cpu).unwrap();
        let enc = mlp.forward(&spans).unwrap();
        assert_eq!(enc.dims(), &[2, 8, 48]);
    }

    #[test]
    fn test_sinusoid_table_bounded() {
        let t = sinusoid_table(10, 16, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[10, 16]);
        let max = t.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0 + 1e-6);
    }
}
