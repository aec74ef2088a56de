use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{self as nn, BatchNormConfig, Conv2dConfig, VarBuilder};

use crate::config::JepaConfig;
use crate::error::JepaResult;

/// One stride-2 downsampling stage: conv 4x4 -> [BatchNorm] -> GELU.
struct DownsampleStage {
    conv: nn::Conv2d,
    norm: Option<nn::BatchNorm>,
}

impl DownsampleStage {
    fn new(vb: VarBuilder<'_>, in_channels: usize, out_channels: usize, normalize: bool) -> JepaResult<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        };
        let conv = nn::conv2d(in_channels, out_channels, 4, cfg, vb.pp("conv"))?;
        let norm = if normalize {
            Some(nn::batch_norm(out_channels, BatchNormConfig::default(), vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self { conv, norm })
    }

    fn forward_t(&self, x: &Tensor, train: bool) -> JepaResult<Tensor> {
        let mut h = self.conv.forward(x)?;
        if let Some(norm) = &self.norm {
            h = norm.forward_t(&h, train)?;
        }
        Ok(h.gelu_erf()?)
    }
}

/// Convolutional encoder shared by the online and target encoders.
///
/// Frames `(N, C, H, W)` go through the downsampling stages, are flattened and
/// projected to `state_dim`, then reshaped onto the latent grid.
pub(crate) struct EncoderBackbone {
    stages: Vec<DownsampleStage>,
    fc: nn::Linear,
    latent: (usize, usize, usize),
}

impl EncoderBackbone {
    pub(crate) fn new(vb: VarBuilder<'_>, config: &JepaConfig) -> JepaResult<Self> {
        let mut stages = Vec::with_capacity(config.encoder_channels.len());
        let mut in_channels = config.in_channels;
        for (i, &out_channels) in config.encoder_channels.iter().enumerate() {
            stages.push(DownsampleStage::new(
                vb.pp(format!("stage_{}", i)),
                in_channels,
                out_channels,
                config.normalization,
            )?);
            in_channels = out_channels;
        }
        let (fh, fw) = config.encoder_feature_size();
        let fc = nn::linear(in_channels * fh * fw, config.state_dim, vb.pp("fc"))?;
        Ok(Self {
            stages,
            fc,
            latent: config.latent_shape(),
        })
    }

    /// Frames `(N, C, H, W)` -> latent grids `(N, c, h, w)`.
    pub(crate) fn forward_frames(&self, x: &Tensor, train: bool) -> JepaResult<Tensor> {
        let n = x.dim(0)?;
        let mut h = x.clone();
        for stage in &self.stages {
            h = stage.forward_t(&h, train)?;
        }
        let h = h.flatten_from(1)?;
        let s = self.fc.forward(&h)?;
        let (c, lh, lw) = self.latent;
        Ok(s.reshape((n, c, lh, lw))?)
    }
}
