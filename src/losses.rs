//! GAN and VQ losses
//!
//! Pure per-step functions over discriminator outputs and latents:
//! - Least-squares adversarial losses for the discriminators and the generator
//! - Feature matching over discriminator activations
//! - Masked KL divergence between diagonal Gaussians
//! - VQ commitment and codebook terms

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor};

use crate::error::VcError;
use crate::nn::zero_scalar;
use crate::utils::tensor_utils::mse;

/// Weight of the feature-matching sum
const FEATURE_LOSS_SCALE: f64 = 2.0;

fn scalar(t: &Tensor) -> Result<f32> {
    t.to_dtype(DType::F32)?.to_scalar::<f32>().map_err(Into::into)
}

/// Least-squares discriminator loss
///
/// `sum_d mean((1 - real_d)^2) + mean(fake_d^2)`. Also returns the real
/// and fake terms of every discriminator as plain numbers.
pub fn discriminator_loss(
    real_scores: &[Tensor],
    fake_scores: &[Tensor],
) -> Result<(Tensor, Vec<f32>, Vec<f32>)> {
    ensure!(
        !real_scores.is_empty() && real_scores.len() == fake_scores.len(),
        "{} real scores but {} fake scores",
        real_scores.len(),
        fake_scores.len()
    );

    let mut total: Option<Tensor> = None;
    let mut real_losses = Vec::with_capacity(real_scores.len());
    let mut fake_losses = Vec::with_capacity(fake_scores.len());
    for (dr, dg) in real_scores.iter().zip(fake_scores.iter()) {
        let dr = dr.to_dtype(DType::F32)?;
        let dg = dg.to_dtype(DType::F32)?;
        let r_loss = dr.affine(-1.0, 1.0)?.sqr()?.mean_all()?;
        let g_loss = dg.sqr()?.mean_all()?;
        real_losses.push(scalar(&r_loss)?);
        fake_losses.push(scalar(&g_loss)?);

        let term = (r_loss + g_loss)?;
        total = Some(match total {
            Some(acc) => (acc + term)?,
            None => term,
        });
    }
    let total = total.ok_or_else(|| VcError::InvalidInput("no discriminator scores".to_string()))?;
    Ok((total, real_losses, fake_losses))
}

/// Least-squares generator loss
///
/// `sum_d mean((1 - fake_d)^2)`, plus the per-discriminator terms.
pub fn generator_loss(fake_scores: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
    let losses = fake_scores
        .iter()
        .map(|dg| {
            dg.to_dtype(DType::F32)?
                .affine(-1.0, 1.0)?
                .sqr()?
                .mean_all()
                .map_err(Into::into)
        })
        .collect::<Result<Vec<_>>>()?;
    let first = losses
        .first()
        .ok_or_else(|| VcError::InvalidInput("no discriminator scores".to_string()))?;
    let mut total = first.clone();
    for l in &losses[1..] {
        total = (total + l)?;
    }
    Ok((total, losses))
}

/// Feature-matching loss
///
/// `2 * sum mean|real - fake|` over every layer of every discriminator.
/// The real activations are detached.
pub fn feature_loss(real_fmaps: &[Vec<Tensor>], fake_fmaps: &[Vec<Tensor>]) -> Result<Tensor> {
    ensure!(
        real_fmaps.len() == fake_fmaps.len(),
        "{} real feature map sets but {} fake",
        real_fmaps.len(),
        fake_fmaps.len()
    );

    let mut total: Option<Tensor> = None;
    for (dr, dg) in real_fmaps.iter().zip(fake_fmaps.iter()) {
        ensure!(dr.len() == dg.len(), "feature map depth {} vs {}", dr.len(), dg.len());
        for (rl, gl) in dr.iter().zip(dg.iter()) {
            let rl = rl.to_dtype(DType::F32)?.detach();
            let gl = gl.to_dtype(DType::F32)?;
            let term = (rl - gl)?.abs()?.mean_all()?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
    }

    let total = total.ok_or_else(|| VcError::InvalidInput("no feature maps".to_string()))?;
    (total * FEATURE_LOSS_SCALE).map_err(Into::into)
}

/// Masked KL divergence between a posterior sample and a Gaussian prior
///
/// All latents are (batch, channels, time); `mask` broadcasts against them,
/// typically (batch, 1, time). The sum over valid positions is divided by
/// the mask sum, so an all-zero mask is rejected.
pub fn kl_loss(
    z_p: &Tensor,
    logs_q: &Tensor,
    m_p: &Tensor,
    logs_p: &Tensor,
    mask: &Tensor,
) -> Result<Tensor> {
    let z_p = z_p.to_dtype(DType::F32)?;
    let logs_q = logs_q.to_dtype(DType::F32)?;
    let m_p = m_p.to_dtype(DType::F32)?;
    let logs_p = logs_p.to_dtype(DType::F32)?;
    let mask = mask.to_dtype(DType::F32)?;

    let mask_sum = mask.sum_all()?;
    if scalar(&mask_sum)? <= 0.0 {
        return Err(VcError::InvalidInput("kl_loss mask has no valid positions".to_string()).into());
    }

    let kl = ((&logs_p - &logs_q)? - 0.5)?;
    let spread = ((z_p - m_p)?.sqr()? * (logs_p * -2.0)?.exp()?)?;
    let kl = (kl + (spread * 0.5)?)?;
    let kl = kl.broadcast_mul(&mask)?.sum_all()?;
    (kl / mask_sum)?.to_dtype(DType::F32).map_err(Into::into)
}

/// Commitment and codebook terms of vector quantization
///
/// `commitment = commitment_lambda * mse(x, sg(q))`. The codebook term is
/// `codebook_lambda * mse(sg(target), q)` with `target = posterior` when
/// given and `x` otherwise, and a zero scalar when `codebook_lambda == 0`.
pub fn vq_loss(
    x: &Tensor,
    quantized: &Tensor,
    commitment_lambda: f64,
    codebook_lambda: f64,
    posterior: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    if x.dims() != quantized.dims() {
        return Err(VcError::shape_mismatch(x.dims(), quantized.dims()).into());
    }
    let commitment = (mse(x, &quantized.detach())? * commitment_lambda)?;
    let codebook = if codebook_lambda == 0.0 {
        zero_scalar(x)?
    } else {
        let target = posterior.unwrap_or(x).detach();
        (mse(&target, quantized)? * codebook_lambda)?
    };
    Ok((commitment, codebook))
}
