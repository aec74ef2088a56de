use std::path::Path;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::npy::NpyArray;
use crate::config::JepaConfig;
use crate::context::ExecutionContext;
use crate::error::{JepaError, JepaResult};

/// One mini-batch of trajectories: observations `(B, T, C, H, W)` and the
/// actions between consecutive frames `(B, T-1, A)`.
#[derive(Debug, Clone)]
pub struct TrajectoryBatch {
    observations: Tensor,
    actions: Tensor,
}

impl TrajectoryBatch {
    pub fn new(observations: Tensor, actions: Tensor) -> JepaResult<Self> {
        if observations.rank() != 5 {
            return Err(JepaError::shape_mismatch(
                "batch observations",
                "(B, T, C, H, W)",
                format!("{:?}", observations.dims()),
            ));
        }
        let (b, t, _, _, _) = observations.dims5()?;
        if t == 0 {
            return Err(JepaError::shape_mismatch("batch observations", "T >= 1", "T = 0"));
        }
        if actions.rank() != 3 || actions.dim(0)? != b || actions.dim(1)? != t - 1 {
            return Err(JepaError::shape_mismatch(
                "batch actions",
                format!("({b}, {}, A)", t - 1),
                format!("{:?}", actions.dims()),
            ));
        }
        Ok(Self { observations, actions })
    }

    pub fn observations(&self) -> &Tensor {
        &self.observations
    }

    pub fn actions(&self) -> &Tensor {
        &self.actions
    }

    pub fn batch_size(&self) -> usize {
        self.observations.dims()[0]
    }

    pub fn trajectory_len(&self) -> usize {
        self.observations.dims()[1]
    }
}

/// Paired `states.npy` / `actions.npy` trajectory dumps.
pub struct TrajectoryDataset {
    states: NpyArray,
    actions: NpyArray,
}

impl TrajectoryDataset {
    /// `states` must be `(N, T, C, H, W)` and `actions` `(N, T-1, A)`.
    pub fn open(states_path: impl AsRef<Path>, actions_path: impl AsRef<Path>) -> JepaResult<Self> {
        let states = NpyArray::open(states_path)?;
        let actions = NpyArray::open(actions_path)?;

        let (s, a) = (states.shape(), actions.shape());
        if s.len() != 5 {
            return Err(JepaError::data(format!(
                "{}: states must be (N, T, C, H, W), got {s:?}",
                states.path().display()
            )));
        }
        if a.len() != 3 {
            return Err(JepaError::data(format!(
                "{}: actions must be (N, T-1, A), got {a:?}",
                actions.path().display()
            )));
        }
        if s[0] != a[0] {
            return Err(JepaError::data(format!(
                "{} trajectories of states but {} of actions",
                s[0], a[0]
            )));
        }
        if s[1] == 0 || a[1] + 1 != s[1] {
            return Err(JepaError::data(format!(
                "trajectories have {} frames but {} actions; expected one action per transition",
                s[1], a[1]
            )));
        }
        Ok(Self { states, actions })
    }

    pub fn len(&self) -> usize {
        self.states.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn trajectory_len(&self) -> usize {
        self.states.shape()[1]
    }

    /// `(C, H, W)` of one frame.
    pub fn observation_shape(&self) -> (usize, usize, usize) {
        let s = self.states.shape();
        (s[2], s[3], s[4])
    }

    pub fn action_dim(&self) -> usize {
        self.actions.shape()[2]
    }

    /// Fail unless the frames and actions fit a model built from `config`.
    pub fn check_config(&self, config: &JepaConfig) -> JepaResult<()> {
        let expected = (config.in_channels, config.observation_height, config.observation_width);
        if self.observation_shape() != expected {
            return Err(JepaError::shape_mismatch(
                "dataset frames",
                format!("{expected:?}"),
                format!("{:?}", self.observation_shape()),
            ));
        }
        if self.action_dim() != config.action_dim {
            return Err(JepaError::shape_mismatch(
                "dataset actions",
                format!("action_dim {}", config.action_dim),
                self.action_dim().to_string(),
            ));
        }
        Ok(())
    }

    /// Gather the trajectories at `indices` into one batch on `ctx`.
    pub fn batch(&self, indices: &[usize], ctx: &ExecutionContext) -> JepaResult<TrajectoryBatch> {
        let b = indices.len();
        let mut states = Vec::with_capacity(b * self.states.row_len());
        let mut actions = Vec::with_capacity(b * self.actions.row_len());
        for &i in indices {
            self.states.extend_row(i, &mut states)?;
            self.actions.extend_row(i, &mut actions)?;
        }
        let (c, h, w) = self.observation_shape();
        let t = self.trajectory_len();
        let observations =
            Tensor::from_vec(states, (b, t, c, h, w), ctx.device())?.to_dtype(ctx.dtype())?;
        let actions =
            Tensor::from_vec(actions, (b, t - 1, self.action_dim()), ctx.device())?.to_dtype(ctx.dtype())?;
        TrajectoryBatch::new(observations, actions)
    }
}

/// Shuffled mini-batches over a [`TrajectoryDataset`]. The order for each
/// epoch is a pure function of `seed` and the epoch index.
pub struct TrajectoryLoader<'a> {
    dataset: &'a TrajectoryDataset,
    batch_size: usize,
    seed: u64,
}

impl<'a> TrajectoryLoader<'a> {
    pub fn new(dataset: &'a TrajectoryDataset, batch_size: usize, seed: u64) -> JepaResult<Self> {
        if batch_size == 0 {
            return Err(JepaError::invalid_config("batch_size must be non-zero"));
        }
        Ok(Self {
            dataset,
            batch_size,
            seed,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Index groups for `epoch`; the last one may be short.
    pub fn epoch_indices(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }

    pub fn batches<'s>(
        &'s self,
        epoch: usize,
        ctx: &'s ExecutionContext,
    ) -> impl Iterator<Item = JepaResult<TrajectoryBatch>> + 's {
        let dataset = self.dataset;
        self.epoch_indices(epoch)
            .into_iter()
            .map(move |indices| dataset.batch(&indices, ctx))
    }
}
