//! Snapshots of the full parameter set and the sinks that persist them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use tracing::{info, warn};

use crate::context::ExecutionContext;
use crate::error::{JepaError, JepaResult};
use crate::model::WorldModel;

/// Named tensors covering the online encoder, target encoder and predictor,
/// keyed `"{component}.{parameter}"`.
#[derive(Debug, Clone, Default)]
pub struct ModelSnapshot {
    tensors: HashMap<String, Tensor>,
}

impl ModelSnapshot {
    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Sorted tensor names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Destination for trained parameters.
pub trait CheckpointSink {
    fn save(&mut self, snapshot: &ModelSnapshot) -> JepaResult<()>;
}

/// Writes snapshots to one safetensors file, overwriting it each time.
#[derive(Debug, Clone)]
pub struct SafetensorsSink {
    path: PathBuf,
}

impl SafetensorsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointSink for SafetensorsSink {
    fn save(&mut self, snapshot: &ModelSnapshot) -> JepaResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        candle_core::safetensors::save(&snapshot.tensors, &self.path)?;
        info!(path = %self.path.display(), tensors = snapshot.len(), "saved checkpoint");
        Ok(())
    }
}

/// Read a snapshot written by [`SafetensorsSink`] onto `ctx`'s device.
pub fn load_snapshot(path: impl AsRef<Path>, ctx: &ExecutionContext) -> JepaResult<ModelSnapshot> {
    let tensors = candle_core::safetensors::load(path.as_ref(), ctx.device())?;
    Ok(ModelSnapshot::from_tensors(tensors))
}

impl WorldModel {
    /// Copy every parameter into a [`ModelSnapshot`].
    pub fn snapshot(&self) -> JepaResult<ModelSnapshot> {
        let mut tensors = HashMap::new();
        for (component, params) in self.components()? {
            for (name, var) in params {
                tensors.insert(format!("{component}.{name}"), var.as_tensor().copy()?);
            }
        }
        Ok(ModelSnapshot::from_tensors(tensors))
    }

    /// Overwrite every parameter from `snapshot`.
    ///
    /// All names and shapes are checked before any variable is written, so a
    /// failed restore leaves the model untouched.
    pub fn restore(&mut self, snapshot: &ModelSnapshot) -> JepaResult<()> {
        let mut updates = Vec::new();
        for (component, params) in self.components()? {
            for (name, var) in params {
                let key = format!("{component}.{name}");
                let tensor = snapshot
                    .get(&key)
                    .ok_or_else(|| JepaError::parameter_mismatch(format!("snapshot is missing {key}")))?;
                if tensor.dims() != var.dims() {
                    return Err(JepaError::shape_mismatch(
                        key,
                        format!("{:?}", var.dims()),
                        format!("{:?}", tensor.dims()),
                    ));
                }
                let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
                updates.push((var, tensor));
            }
        }
        if snapshot.len() > updates.len() {
            warn!(
                extra = snapshot.len() - updates.len(),
                "snapshot holds tensors the model does not use"
            );
        }
        for (var, tensor) in updates {
            var.set(&tensor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JepaConfig;
    use candle_core::{DType, Device};

    fn small_config() -> JepaConfig {
        JepaConfig {
            observation_height: 16,
            observation_width: 16,
            encoder_channels: vec![4, 8],
            state_dim: 32,
            latent_channels: 2,
            latent_height: 4,
            latent_width: 4,
            hidden_dim: 16,
            cnn_channels: 8,
            ..JepaConfig::default()
        }
    }

    #[test]
    fn snapshot_names_every_component() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let model = WorldModel::new(&small_config(), &ctx)?;
        let snapshot = model.snapshot()?;

        let count = |prefix: &str| snapshot.names().iter().filter(|n| n.starts_with(prefix)).count();
        let encoder_params = model.online_encoder().named_parameters()?.len();
        assert_eq!(count("online_encoder."), encoder_params);
        assert_eq!(count("target_encoder."), encoder_params);
        assert_eq!(count("predictor."), model.predictor_parameters()?.len());
        Ok(())
    }

    #[test]
    fn restore_overwrites_parameters() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let source = WorldModel::new(&small_config(), &ctx)?;
        let mut dest = WorldModel::new(&small_config(), &ctx)?;
        dest.restore(&source.snapshot()?)?;

        let (a, b) = (source.snapshot()?, dest.snapshot()?);
        for name in a.names() {
            let (x, y) = (a.get(name), b.get(name));
            let diff = match (x, y) {
                (Some(x), Some(y)) => (x - y)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?,
                _ => f32::INFINITY,
            };
            assert_eq!(diff, 0.0, "{name}");
        }
        Ok(())
    }

    #[test]
    fn restore_rejects_incomplete_or_misshapen_snapshots() -> JepaResult<()> {
        let ctx = ExecutionContext::cpu();
        let mut model = WorldModel::new(&small_config(), &ctx)?;
        let full = model.snapshot()?;

        let mut missing = full.tensors().clone();
        let victim = full.names()[0].to_string();
        missing.remove(&victim);
        assert!(matches!(
            model.restore(&ModelSnapshot::from_tensors(missing)),
            Err(JepaError::ParameterMismatch(_))
        ));

        let mut misshapen = full.tensors().clone();
        misshapen.insert(victim, Tensor::zeros((3, 3, 3), DType::F32, &Device::Cpu)?);
        assert!(matches!(
            model.restore(&ModelSnapshot::from_tensors(misshapen)),
            Err(JepaError::ShapeMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn safetensors_sink_round_trips() -> JepaResult<()> {
        let dir = tempfile::tempdir()?;
        let ctx = ExecutionContext::cpu();
        let model = WorldModel::new(&small_config(), &ctx)?;
        let mut sink = SafetensorsSink::new(dir.path().join("ckpt").join("model.safetensors"));
        let snapshot = model.snapshot()?;
        sink.save(&snapshot)?;

        let loaded = load_snapshot(sink.path(), &ctx)?;
        assert_eq!(loaded.names(), snapshot.names());
        Ok(())
    }
}
