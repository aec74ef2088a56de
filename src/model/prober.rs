use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};

use crate::error::{JepaError, JepaResult};

/// Parse a dash-separated list of hidden widths, e.g. `"512-256"`. Empty means
/// no hidden layers.
pub fn parse_arch(arch: &str) -> JepaResult<Vec<usize>> {
    if arch.trim().is_empty() {
        return Ok(Vec::new());
    }
    arch.split('-')
        .map(|part| match part.trim().parse::<usize>() {
            Ok(0) | Err(_) => Err(JepaError::invalid_config(format!(
                "prober arch {arch:?}: {part:?} is not a positive width"
            ))),
            Ok(width) => Ok(width),
        })
        .collect()
}

/// MLP head trained on frozen latents to read out ground-truth quantities.
pub struct Prober {
    layers: Vec<nn::Linear>,
    output_shape: Vec<usize>,
}

impl Prober {
    pub fn new(vb: VarBuilder<'_>, embedding: usize, arch: &str, output_shape: &[usize]) -> JepaResult<Self> {
        let output_dim: usize = output_shape.iter().product();
        if embedding == 0 || output_dim == 0 {
            return Err(JepaError::invalid_config(
                "prober embedding and output sizes must be non-zero",
            ));
        }
        let mut widths = vec![embedding];
        widths.extend(parse_arch(arch)?);
        widths.push(output_dim);

        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, pair)| nn::linear(pair[0], pair[1], vb.pp(format!("layer_{}", i))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            output_shape: output_shape.to_vec(),
        })
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    /// `(N, embedding)` -> `(N, prod(output_shape))`.
    pub fn forward(&self, e: &Tensor) -> JepaResult<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = e.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i < last {
                h = h.relu()?;
            }
        }
        Ok(h)
    }
}
