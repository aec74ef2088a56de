//! Anti-collapse regularizers over a batch of latents.
//!
//! Both take latents with the batch on dim 0 and any trailing shape; trailing
//! dims are flattened into features. Statistics use the unbiased `B - 1`
//! denominator, so a batch of one is rejected.

use candle_core::Tensor;

use crate::error::{JepaError, JepaResult};

fn as_batch_features(latents: &Tensor, op: &'static str) -> JepaResult<(usize, Tensor)> {
    if latents.rank() < 2 {
        return Err(JepaError::shape_mismatch(
            op,
            "(B, ...) with at least one feature dim",
            format!("{:?}", latents.dims()),
        ));
    }
    let batch = latents.dim(0)?;
    if batch < 2 {
        return Err(JepaError::DegenerateBatch { op, batch });
    }
    Ok((batch, latents.flatten_from(1)?))
}

/// Mean over features of `max(0, floor - var)`, with `var` the per-feature
/// variance across the batch. Zero once every feature varies more than
/// `floor`; equals `floor` for a fully collapsed batch.
pub fn variance_regularization(latents: &Tensor, floor: f64) -> JepaResult<Tensor> {
    let (batch, x) = as_batch_features(latents, "variance_regularization")?;
    let centered = x.broadcast_sub(&x.mean_keepdim(0)?)?;
    let var = (centered.sqr()?.sum(0)? / (batch - 1) as f64)?;
    Ok(var.affine(-1.0, floor)?.relu()?.mean_all()?)
}

/// Sum of squared off-diagonal entries of the batch covariance matrix.
pub fn covariance_regularization(latents: &Tensor) -> JepaResult<Tensor> {
    let (batch, x) = as_batch_features(latents, "covariance_regularization")?;
    let features = x.dim(1)?;
    let centered = x.broadcast_sub(&x.mean_keepdim(0)?)?;
    let cov = (centered.t()?.contiguous()?.matmul(&centered)? / (batch - 1) as f64)?;
    let idx = Tensor::arange(0u32, features as u32, cov.device())?;
    let off_diag_mask = idx
        .unsqueeze(1)?
        .broadcast_ne(&idx.unsqueeze(0)?)?
        .to_dtype(cov.dtype())?;
    Ok(cov.mul(&off_diag_mask)?.sqr()?.sum_all()?)
}
