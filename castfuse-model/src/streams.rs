//! Named token-stream types. Each stream records its own layout so that
//! reshapes between the flat per-stream layout and the `(batch, time, tokens,
//! width)` layout used by cross-attention cells are checked conversions
//! rather than bare `reshape` calls.

use anyhow::Result;
use candle_core::Tensor;

use crate::error::ModelError;

/// Spatial stream: per-frame patch tokens plus one class token per frame,
/// stored batch-first as `(batch * frames, patches + 1, width)`.
#[derive(Clone)]
pub struct SpatialTokens {
    pub tokens: Tensor,
    pub batch: usize,
    pub frames: usize,
    pub patches: usize,
    pub width: usize,
}

impl SpatialTokens {
    pub fn new(
        tokens: Tensor,
        batch: usize,
        frames: usize,
        patches: usize,
        width: usize,
    ) -> Result<Self> {
        let expected = [batch * frames, patches + 1, width];
        if tokens.dims() != expected {
            return Err(ModelError::shape(
                "spatial stream",
                format!("{expected:?}"),
                format!("{:?}", tokens.dims()),
            )
            .into());
        }
        Ok(Self { tokens, batch, frames, patches, width })
    }

    pub fn with_tokens(&self, tokens: Tensor) -> Result<Self> {
        Self::new(tokens, self.batch, self.frames, self.patches, self.width)
    }

    /// Split off the class token. Returns the class tokens as
    /// `(batch * frames, 1, width)` and the patch body as
    /// `(batch, frames, patches, width)`.
    pub fn split_class(&self) -> Result<(Tensor, Tensor)> {
        let cls = self.tokens.narrow(1, 0, 1)?;
        let body = self
            .tokens
            .narrow(1, 1, self.patches)?
            .reshape((self.batch, self.frames, self.patches, self.width))?;
        Ok((cls, body))
    }

    /// Reattach a class token to a patch body produced by [`split_class`].
    pub fn merge_class(&self, cls: &Tensor, body: &Tensor) -> Result<Self> {
        let body = body.reshape((self.batch * self.frames, self.patches, self.width))?;
        let tokens = Tensor::cat(&[cls, &body], 1)?;
        self.with_tokens(tokens)
    }
}

/// Temporal stream: tubelet tokens stored as
/// `(batch, chunks * patches, width)`.
#[derive(Clone)]
pub struct TemporalTokens {
    pub tokens: Tensor,
    pub batch: usize,
    pub chunks: usize,
    pub patches: usize,
    pub width: usize,
}

impl TemporalTokens {
    pub fn new(
        tokens: Tensor,
        batch: usize,
        chunks: usize,
        patches: usize,
        width: usize,
    ) -> Result<Self> {
        let expected = [batch, chunks * patches, width];
        if tokens.dims() != expected {
            return Err(ModelError::shape(
                "temporal stream",
                format!("{expected:?}"),
                format!("{:?}", tokens.dims()),
            )
            .into());
        }
        Ok(Self { tokens, batch, chunks, patches, width })
    }

    pub fn with_tokens(&self, tokens: Tensor) -> Result<Self> {
        Self::new(tokens, self.batch, self.chunks, self.patches, self.width)
    }

    /// View as `(batch, chunks, patches, width)`.
    pub fn body(&self) -> Result<Tensor> {
        Ok(self
            .tokens
            .reshape((self.batch, self.chunks, self.patches, self.width))?)
    }

    pub fn from_body(&self, body: &Tensor) -> Result<Self> {
        let tokens = body.reshape((self.batch, self.chunks * self.patches, self.width))?;
        self.with_tokens(tokens)
    }
}

/// Audio stream: spectrogram patch tokens stored as
/// `(batch, frames * patches, width)`.
#[derive(Clone)]
pub struct AudioTokens {
    pub tokens: Tensor,
    pub batch: usize,
    pub frames: usize,
    pub patches: usize,
    pub width: usize,
}

impl AudioTokens {
    pub fn new(
        tokens: Tensor,
        batch: usize,
        frames: usize,
        patches: usize,
        width: usize,
    ) -> Result<Self> {
        let expected = [batch, frames * patches, width];
        if tokens.dims() != expected {
            return Err(ModelError::shape(
                "audio stream",
                format!("{expected:?}"),
                format!("{:?}", tokens.dims()),
            )
            .into());
        }
        Ok(Self { tokens, batch, frames, patches, width })
    }

    pub fn with_tokens(&self, tokens: Tensor) -> Result<Self> {
        Self::new(tokens, self.batch, self.frames, self.patches, self.width)
    }

    /// View as `(batch, frames, patches, width)`.
    pub fn body(&self) -> Result<Tensor> {
        Ok(self
            .tokens
            .reshape((self.batch, self.frames, self.patches, self.width))?)
    }

    pub fn from_body(&self, body: &Tensor) -> Result<Self> {
        let tokens = body.reshape((self.batch, self.frames * self.patches, self.width))?;
        self.with_tokens(tokens)
    }
}
