//! Binarization primitives: binary sign, straight-through sign, ±1 checks.
//!
//! `candle`'s own `Tensor::sign` is three-valued (`sign(0) = 0`). Binary
//! networks need a two-valued sign, so [`sign`] maps zero to `+1`. Both are
//! used by the Bop update rule: the three-valued one for the flip test, the
//! binary one for the final value.

use candle_core::{Result, Tensor};

// ── Sign ────────────────────────────────────────────────────────────────────

/// Binary sign: `-1` for negative inputs, `+1` otherwise (including zero).
///
/// Output has the dtype of the input. Not differentiable; see [`ste_sign`].
pub fn sign(x: &Tensor) -> Result<Tensor> {
    x.ge(0f64)?.to_dtype(x.dtype())?.affine(2.0, -1.0)
}

/// Straight-through sign: `forward = sign(x)`, `backward = identity`.
///
/// The trick: `sign(x).detach() + (x - x.detach())`. The residual is zero in
/// the forward pass and has unit derivative in the backward pass.
#[inline]
pub fn ste_sign(x: &Tensor) -> Result<Tensor> {
    let sign_x = sign(x)?.detach();
    let residual = (x - &x.detach())?;
    &sign_x + &residual
}

// ── Inspection ──────────────────────────────────────────────────────────────

/// Count {-1, +1} occurrences in the binarized view of `w`.
pub fn binary_distribution(w: &Tensor) -> Result<(u64, u64)> {
    let flat = w.flatten_all()?.to_vec1::<f32>()?;
    let (mut n_neg, mut n_pos) = (0u64, 0u64);
    for &v in &flat {
        if v < 0.0 {
            n_neg += 1;
        } else {
            n_pos += 1;
        }
    }
    Ok((n_neg, n_pos))
}

/// True iff every element of `w` is exactly `-1` or `+1`.
pub fn is_binary(w: &Tensor) -> Result<bool> {
    let flat = w.flatten_all()?.to_vec1::<f32>()?;
    Ok(flat.iter().all(|&v| v == 1.0 || v == -1.0))
}

// ── Tests ───────────────────────────────────────────────────────────────────
