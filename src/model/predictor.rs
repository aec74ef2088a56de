use candle_core::{Module, Tensor};
use candle_nn::{self as nn, Conv2dConfig, VarBuilder};

use crate::config::JepaConfig;
use crate::error::{JepaError, JepaResult};

/// LayerNorm over a whole `(C, H, W)` grid.
fn norm_grid(ln: &nn::LayerNorm, x: &Tensor) -> JepaResult<Tensor> {
    let (b, c, h, w) = x.dims4()?;
    let flat = ln.forward(&x.reshape((b, c * h * w))?)?;
    Ok(flat.reshape((b, c, h, w))?)
}

fn apply_norm(ln: Option<&nn::LayerNorm>, x: Tensor) -> JepaResult<Tensor> {
    match ln {
        Some(ln) => Ok(ln.forward(&x)?),
        None => Ok(x),
    }
}

fn apply_grid_norm(ln: Option<&nn::LayerNorm>, x: Tensor) -> JepaResult<Tensor> {
    match ln {
        Some(ln) => norm_grid(ln, &x),
        None => Ok(x),
    }
}

/// Predicts the next latent grid from the current one and an action.
///
/// The action goes through a two-layer MLP onto a tensor with the latent
/// grid's shape, is concatenated with the state along channels, and a 3x3
/// conv stack maps the `2c` channels back down to `c`. Output shape always
/// equals input shape, so the predictor can be applied repeatedly. It keeps
/// no state between calls.
pub struct RecurrentPredictor {
    action_fc1: nn::Linear,
    action_ln1: Option<nn::LayerNorm>,
    action_fc2: nn::Linear,
    action_ln2: Option<nn::LayerNorm>,
    conv1: nn::Conv2d,
    conv_ln1: Option<nn::LayerNorm>,
    conv2: nn::Conv2d,
    conv_ln2: Option<nn::LayerNorm>,
    latent: (usize, usize, usize),
    action_dim: usize,
}

impl RecurrentPredictor {
    pub fn new(vb: VarBuilder<'_>, config: &JepaConfig) -> JepaResult<Self> {
        let (c, h, w) = config.latent_shape();
        let state_dim = c * h * w;
        let hidden = config.hidden_dim;
        let cnn = config.cnn_channels;
        let norm = config.normalization;
        let eps = 1e-5;

        let action_vb = vb.pp("action_mlp");
        let action_fc1 = nn::linear(config.action_dim, hidden, action_vb.pp("fc1"))?;
        let action_fc2 = nn::linear(hidden, state_dim, action_vb.pp("fc2"))?;
        let (action_ln1, action_ln2) = if norm {
            (
                Some(nn::layer_norm(hidden, eps, action_vb.pp("ln1"))?),
                Some(nn::layer_norm(state_dim, eps, action_vb.pp("ln2"))?),
            )
        } else {
            (None, None)
        };

        let refine_vb = vb.pp("refine");
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = nn::conv2d(2 * c, cnn, 3, same, refine_vb.pp("conv1"))?;
        let conv2 = nn::conv2d(cnn, c, 3, same, refine_vb.pp("conv2"))?;
        let (conv_ln1, conv_ln2) = if norm {
            (
                Some(nn::layer_norm(cnn * h * w, eps, refine_vb.pp("ln1"))?),
                Some(nn::layer_norm(state_dim, eps, refine_vb.pp("ln2"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            action_fc1,
            action_ln1,
            action_fc2,
            action_ln2,
            conv1,
            conv_ln1,
            conv2,
            conv_ln2,
            latent: (c, h, w),
            action_dim: config.action_dim,
        })
    }

    pub fn latent_shape(&self) -> (usize, usize, usize) {
        self.latent
    }

    /// One transition: state `(B, c, h, w)` and action `(B, action_dim)` ->
    /// next state `(B, c, h, w)`.
    pub fn forward(&self, state: &Tensor, action: &Tensor) -> JepaResult<Tensor> {
        let (c, h, w) = self.latent;
        let dims = state.dims();
        if dims.len() != 4 || dims[1..] != [c, h, w] {
            return Err(JepaError::shape_mismatch(
                "predictor state",
                format!("(B, {c}, {h}, {w})"),
                format!("{:?}", dims),
            ));
        }
        let b = dims[0];
        if action.dims() != [b, self.action_dim] {
            return Err(JepaError::shape_mismatch(
                "predictor action",
                format!("({b}, {})", self.action_dim),
                format!("{:?}", action.dims()),
            ));
        }

        let a = self.action_fc1.forward(action)?;
        let a = apply_norm(self.action_ln1.as_ref(), a)?.gelu_erf()?;
        let a = self.action_fc2.forward(&a)?;
        let a = apply_norm(self.action_ln2.as_ref(), a)?;
        let action_grid = a.reshape((b, c, h, w))?;

        let x = Tensor::cat(&[state, &action_grid], 1)?;
        let x = self.conv1.forward(&x)?;
        let x = apply_grid_norm(self.conv_ln1.as_ref(), x)?.gelu_erf()?;
        let x = self.conv2.forward(&x)?;
        apply_grid_norm(self.conv_ln2.as_ref(), x)
    }

    /// Autoregressive rollout from `seed` `(B, c, h, w)` over actions
    /// `(B, K, action_dim)`. Step `k` sees only the output of step `k-1` and
    /// action `k`. Returns `K` states, each shaped like `seed`.
    pub fn rollout(&self, seed: &Tensor, actions: &Tensor) -> JepaResult<Vec<Tensor>> {
        let (b, k, a) = actions.dims3().map_err(|_| {
            JepaError::shape_mismatch(
                "rollout actions",
                format!("(B, K, {})", self.action_dim),
                format!("{:?}", actions.dims()),
            )
        })?;
        if a != self.action_dim || b != seed.dim(0)? {
            return Err(JepaError::shape_mismatch(
                "rollout actions",
                format!("({}, K, {})", seed.dim(0)?, self.action_dim),
                format!("{:?}", actions.dims()),
            ));
        }
        let mut states = Vec::with_capacity(k);
        let mut state = seed.clone();
        for t in 0..k {
            let action = actions.narrow(1, t, 1)?.squeeze(1)?.contiguous()?;
            let next = self.forward(&state, &action)?;
            states.push(next.clone());
            state = next;
        }
        Ok(states)
    }
}
