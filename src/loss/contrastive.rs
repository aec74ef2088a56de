use candle_core::{DType, Tensor, D};

use crate::error::{JepaError, JepaResult};

/// Scale each row to unit L2 norm (`eps` guards all-zero rows).
pub fn normalize_latents(latents: &Tensor) -> JepaResult<Tensor> {
    let norm = (latents.sqr()?.sum_keepdim(D::Minus1)?.sqrt()? + 1e-8)?;
    Ok(latents.broadcast_div(&norm)?)
}

/// InfoNCE-style alignment between predicted and target latents.
///
/// Both `(B, T, D)` tensors are pooled into `B*T` vectors and normalized; the
/// logits are all-pairs cosine similarities over `temperature`, and each
/// prediction's positive is the target at the same `(batch, timestep)` index.
pub fn contrastive_loss(predicted: &Tensor, target: &Tensor, temperature: f64) -> JepaResult<Tensor> {
    if predicted.rank() != 3 || predicted.dims() != target.dims() {
        return Err(JepaError::shape_mismatch(
            "contrastive_loss",
            format!("matching (B, T, D) tensors, predicted {:?}", predicted.dims()),
            format!("{:?}", target.dims()),
        ));
    }
    let (b, t, d) = predicted.dims3()?;
    let n = b * t;
    if n == 0 {
        return Err(JepaError::shape_mismatch(
            "contrastive_loss",
            "at least one (batch, timestep) pair",
            format!("{:?}", predicted.dims()),
        ));
    }
    let p = normalize_latents(&predicted.reshape((n, d))?)?;
    let z = normalize_latents(&target.reshape((n, d))?)?;
    let logits = (p.matmul(&z.t()?.contiguous()?)? / temperature)?;
    let labels = Tensor::arange(0u32, n as u32, predicted.device())?;
    let logits = logits.to_dtype(DType::F32)?;
    Ok(candle_nn::loss::cross_entropy(&logits, &labels)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn identical_pools_give_diagonal_baseline() -> JepaResult<()> {
        // B*T = 2 orthonormal vectors: logits = I / temperature.
        let pool = Tensor::new(&[[[1f32, 0.0]], [[0.0, 1.0]]], &Device::Cpu)?;
        let temperature = 0.1;
        let loss = contrastive_loss(&pool, &pool, temperature)?.to_scalar::<f32>()?;

        // -log(e^{1/tau} / (e^{1/tau} + e^0)) = log(1 + e^{-1/tau})
        let expected = (1.0 + (-1.0 / temperature).exp()).ln() as f32;
        assert!((loss - expected).abs() < 1e-6, "{loss} vs {expected}");
        Ok(())
    }

    #[test]
    fn swapped_targets_cost_more_than_matched() -> JepaResult<()> {
        let pred = Tensor::new(&[[[1f32, 0.0], [0.0, 1.0]]], &Device::Cpu)?;
        let swapped = Tensor::new(&[[[0f32, 1.0], [1.0, 0.0]]], &Device::Cpu)?;
        let matched = contrastive_loss(&pred, &pred, 0.1)?.to_scalar::<f32>()?;
        let crossed = contrastive_loss(&pred, &swapped, 0.1)?.to_scalar::<f32>()?;
        assert!(crossed > matched);
        Ok(())
    }

    #[test]
    fn normalized_rows_have_unit_norm() -> JepaResult<()> {
        let x = Tensor::new(&[[3f32, 4.0], [0.0, 2.0]], &Device::Cpu)?;
        let norms = normalize_latents(&x)?.sqr()?.sum(1)?.to_vec1::<f32>()?;
        for n in norms {
            assert!((n - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn shape_disagreement_is_rejected() -> JepaResult<()> {
        let a = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((2, 2, 4), DType::F32, &Device::Cpu)?;
        assert!(matches!(
            contrastive_loss(&a, &b, 0.1),
            Err(JepaError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
