use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// How continuous clip-span time encodings enter the spatial/temporal
/// cross-attention cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeEncoding {
    /// No time conditioning
    #[default]
    None,
    /// Encoding is added to the down-projected tokens
    Add,
    /// Encoding is concatenated on the channel axis; the affected
    /// cross-attention projections statically widen to accept it
    Concat,
}

/// Audio stream geometry. The spectrogram is patchified like an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Mel-spectrogram height (mel bins)
    pub spec_height: usize,
    /// Mel-spectrogram width (time bins)
    pub spec_width: usize,
    /// Square patch edge for the audio patchifier
    pub patch_size: usize,
    /// Number of spectrogram frames fed per clip
    pub spec_frames: usize,
    /// Width of the audio patchifier output before projection to `embed_dim`
    pub conv_dim: usize,
    /// Kernel size of the grouped positional convolution
    pub pos_conv_kernel: usize,
    /// Group count of the positional convolution
    pub pos_conv_groups: usize,
    /// Bucket count for relative position bias in audio self-attention
    pub rel_pos_buckets: usize,
    /// Maximum distance for relative position bucketing
    pub rel_pos_max_distance: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            spec_height: 128,
            spec_width: 128,
            patch_size: 16,
            spec_frames: 1,
            conv_dim: 512,
            pos_conv_kernel: 128,
            pos_conv_groups: 16,
            rel_pos_buckets: 320,
            rel_pos_max_distance: 800,
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub img_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
    /// Channel bottleneck applied inside every cross-attention cell:
    /// tokens are down-projected to `embed_dim / down_ratio`
    pub down_ratio: usize,
    pub num_frames: usize,
    pub tubelet_size: usize,
    pub drop_rate: f32,
    pub drop_path_rate: f64,
    pub head_drop_rate: f32,
    /// Single-head class count (ignored when `composition` is set)
    pub num_classes: usize,
    /// Split the classifier into separate noun and verb heads
    pub composition: bool,
    pub noun_classes: usize,
    pub verb_classes: usize,
    /// Feature width of text prototypes; enables the prompt/open-vocabulary
    /// projections when set
    pub prototype_dim: Option<usize>,
    /// Audio stream; `None` builds a two-stream video-only model
    pub audio: Option<AudioConfig>,
    /// First layer index at which audio cross-attention cells are active
    pub first_cross_layer: usize,
    /// Layer index from which adapters are forced on
    pub late_fusion: usize,
    /// Adapters active at every layer regardless of `late_fusion`
    pub use_adapter: bool,
    /// Gate the spatial/temporal cell on the audio schedule instead of
    /// running it at every layer
    pub st_follows_cross_schedule: bool,
    /// Cross-attention covers all frames jointly; when false each frame
    /// attends only within its own time step
    pub attn_all_frame: bool,
    /// Learned space/time positional biases inside cross-attention cells
    pub use_st_pos: bool,
    pub time_encoding: TimeEncoding,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            img_size: 224,
            patch_size: 16,
            in_chans: 3,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            mlp_ratio: 4,
            down_ratio: 2,
            num_frames: 16,
            tubelet_size: 2,
            drop_rate: 0.0,
            drop_path_rate: 0.1,
            head_drop_rate: 0.0,
            num_classes: 400,
            composition: false,
            noun_classes: 300,
            verb_classes: 97,
            prototype_dim: None,
            audio: None,
            first_cross_layer: 0,
            late_fusion: 0,
            use_adapter: true,
            st_follows_cross_schedule: false,
            attn_all_frame: true,
            use_st_pos: true,
            time_encoding: TimeEncoding::None,
        }
    }
}

impl ModelConfig {
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Patch grid edge of one video frame
    pub fn grid_size(&self) -> usize {
        self.img_size / self.patch_size
    }

    /// Patch tokens per frame (class token excluded)
    pub fn spatial_patches(&self) -> usize {
        let g = self.grid_size();
        g * g
    }

    /// Frames kept in the spatial stream (one out of each tubelet pair)
    pub fn spatial_frames(&self) -> usize {
        self.num_frames / self.tubelet_size
    }

    /// Tubelet chunks along time in the temporal stream
    pub fn temporal_chunks(&self) -> usize {
        self.num_frames / self.tubelet_size
    }

    /// Audio patch tokens per spectrogram frame
    pub fn audio_patches(&self) -> Option<usize> {
        self.audio
            .as_ref()
            .map(|a| (a.spec_height / a.patch_size) * (a.spec_width / a.patch_size))
    }

    /// Cross-attention bottleneck width
    pub fn cross_dim(&self) -> usize {
        self.embed_dim / self.down_ratio
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.img_size % self.patch_size != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "img_size {} not divisible by patch_size {}",
                self.img_size, self.patch_size
            )));
        }
        if self.num_frames % self.tubelet_size != 0 {
            return Err(ModelError::InvalidConfig(format!(
                "num_frames {} not divisible by tubelet_size {}",
                self.num_frames, self.tubelet_size
            )));
        }
        if self.embed_dim % self.num_heads != 0 {
            return Err(ModelError::IndivisibleWidth {
                width: self.embed_dim,
                divisor: self.num_heads,
                what: "attention heads".into(),
            });
        }
        if self.embed_dim % self.down_ratio != 0 {
            return Err(ModelError::IndivisibleWidth {
                width: self.embed_dim,
                divisor: self.down_ratio,
                what: "cross-attention bottleneck".into(),
            });
        }
        if self.cross_dim() % self.num_heads != 0 {
            return Err(ModelError::IndivisibleWidth {
                width: self.cross_dim(),
                divisor: self.num_heads,
                what: "cross-attention heads".into(),
            });
        }
        if let Some(audio) = &self.audio {
            if audio.spec_height % audio.patch_size != 0 || audio.spec_width % audio.patch_size != 0
            {
                return Err(ModelError::InvalidConfig(format!(
                    "spectrogram {}x{} not divisible by audio patch_size {}",
                    audio.spec_height, audio.spec_width, audio.patch_size
                )));
            }
        }
        if self.time_encoding != TimeEncoding::None && self.cross_dim() % 2 != 0 {
            return Err(ModelError::InvalidConfig(
                "time encoding requires an even cross-attention width".into(),
            ));
        }
        Ok(())
    }
}

/// Static per-layer schedule resolved once at construction. Blocks consult
/// their plan instead of re-deriving gating arithmetic in the forward pass.
#[derive(Debug, Clone, Copy)]
pub struct LayerPlan {
    pub index: usize,
    /// Adapters active in the self-attention and feed-forward sublayers
    pub adapter: bool,
    /// Spatial/temporal cross-attention cell runs at this layer
    pub cross_st: bool,
    /// Audio cross-attention cells (spatial/audio, temporal/audio) run
    pub cross_audio: bool,
    /// Stochastic depth rate for this layer
    pub drop_path: f64,
}

/// Resolve the layer schedule for a configuration.
pub fn layer_plans(cfg: &ModelConfig) -> Vec<LayerPlan> {
    (0..cfg.depth)
        .map(|i| {
            let drop_path = if cfg.depth > 1 {
                cfg.drop_path_rate * i as f64 / (cfg.depth - 1) as f64
            } else {
                0.0
            };
            let in_cross_window = i >= cfg.first_cross_layer;
            LayerPlan {
                index: i,
                adapter: cfg.use_adapter || i >= cfg.late_fusion,
                cross_st: !cfg.st_follows_cross_schedule || in_cross_window,
                cross_audio: cfg.audio.is_some() && in_cross_window,
                drop_path,
            }
        })
        .collect()
}
