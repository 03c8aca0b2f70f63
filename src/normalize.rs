//! Per-channel normalization and per-sample min-max rescaling.

use candle_core::{DType, Tensor};

use crate::check::check_float;
use crate::error::{Error, Result};

/// Default `eps` for [`normalize_min_max`], keeps constant images finite.
pub const MIN_MAX_EPS: f64 = 1.0e-6;

/// Mean or standard deviation used by [`normalize`] / [`denormalize`].
///
/// A tensor statistic may have shape `()`, `(1)`, `(C)`, `(1, C)` or `(B, C)`.
#[derive(Clone, Debug)]
pub enum Stat {
    Scalar(f64),
    List(Vec<f64>),
    Tensor(Tensor),
}

impl From<f64> for Stat {
    fn from(v: f64) -> Self {
        Stat::Scalar(v)
    }
}

impl From<f32> for Stat {
    fn from(v: f32) -> Self {
        Stat::Scalar(v as f64)
    }
}

impl From<i32> for Stat {
    fn from(v: i32) -> Self {
        Stat::Scalar(v as f64)
    }
}

impl From<Vec<f64>> for Stat {
    fn from(v: Vec<f64>) -> Self {
        Stat::List(v)
    }
}

impl From<&[f64]> for Stat {
    fn from(v: &[f64]) -> Self {
        Stat::List(v.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Stat {
    fn from(v: [f64; N]) -> Self {
        Stat::List(v.to_vec())
    }
}

impl From<Tensor> for Stat {
    fn from(t: Tensor) -> Self {
        Stat::Tensor(t)
    }
}

impl From<&Tensor> for Stat {
    fn from(t: &Tensor) -> Self {
        Stat::Tensor(t.clone())
    }
}

impl std::fmt::Display for Stat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stat::Scalar(v) => write!(f, "[{v:?}]"),
            Stat::List(v) => write!(f, "{v:?}"),
            Stat::Tensor(t) => {
                let vals = t
                    .flatten_all()
                    .and_then(|t| t.to_dtype(DType::F64))
                    .and_then(|t| t.to_vec1::<f64>());
                match vals {
                    Ok(v) => write!(f, "{v:?}"),
                    Err(_) => write!(f, "Tensor{:?}", t.dims()),
                }
            }
        }
    }
}

impl Stat {
    /// Shape the statistic as `(b, c, 1)` so that it broadcasts against `data`
    /// viewed as `(B, C, H*W)`.
    fn broadcast_for(&self, data: &Tensor, name: &str) -> Result<Tensor> {
        let (dev, dtype) = (data.device(), data.dtype());
        let (b, c) = (data.dim(0)?, data.dim(1)?);
        let t = match self {
            Stat::Scalar(v) => Tensor::new(&[*v], dev)?.to_dtype(dtype)?,
            Stat::List(v) => Tensor::new(v.as_slice(), dev)?.to_dtype(dtype)?,
            Stat::Tensor(t) => {
                check_float(t)?;
                t.to_device(dev)?.to_dtype(dtype)?
            }
        };
        let t = match *t.dims() {
            [] => t.reshape((1, 1, 1))?,
            [l] if l == 1 || l == c => t.reshape((1, l, 1))?,
            [bb, l] if (bb == 1 || bb == b) && (l == 1 || l == c) => t.reshape((bb, l, 1))?,
            _ => {
                return Err(Error::Value(format!(
                    "{name} length and number of channels do not match. Got {:?} and {:?}.",
                    t.dims(),
                    data.dims()
                )))
            }
        };
        Ok(t)
    }
}

/// Returns `data` viewed as `(B, C, N)`.
fn as_bcn(data: &Tensor) -> Result<Tensor> {
    check_float(data)?;
    if data.rank() < 2 {
        return Err(Error::shape("input size", "(B, C, *)", data.dims()));
    }
    let (b, c) = (data.dim(0)?, data.dim(1)?);
    let n = if b * c == 0 { 0 } else { data.elem_count() / (b * c) };
    Ok(data.reshape((b, c, n))?)
}

/// `(data - mean) / std`, broadcast over the channel dimension (dim 1).
pub fn normalize(data: &Tensor, mean: impl Into<Stat>, std: impl Into<Stat>) -> Result<Tensor> {
    let flat = as_bcn(data)?;
    tracing::trace!(dims = ?data.dims(), "normalize");
    let mean = mean.into().broadcast_for(data, "mean")?;
    let std = std.into().broadcast_for(data, "std")?;
    let out = flat.broadcast_sub(&mean)?.broadcast_div(&std)?;
    Ok(out.reshape(data.shape())?)
}

/// `data * std + mean`, the inverse of [`normalize`].
pub fn denormalize(data: &Tensor, mean: impl Into<Stat>, std: impl Into<Stat>) -> Result<Tensor> {
    let flat = as_bcn(data)?;
    let mean = mean.into().broadcast_for(data, "mean")?;
    let std = std.into().broadcast_for(data, "std")?;
    let out = flat.broadcast_mul(&std)?.broadcast_add(&mean)?;
    Ok(out.reshape(data.shape())?)
}

/// Rescale every batch element so that its minimum maps to `min_val` and its
/// maximum to `max_val`. `x` must be at least `(B, C, H)`.
pub fn normalize_min_max(x: &Tensor, min_val: f64, max_val: f64, eps: f64) -> Result<Tensor> {
    check_float(x)?;
    if x.rank() < 3 {
        return Err(Error::shape("input size", "(B, C, H, *)", x.dims()));
    }
    if !min_val.is_finite() || !max_val.is_finite() {
        return Err(Error::Value(format!(
            "min_val and max_val must be finite. Got {min_val} and {max_val}"
        )));
    }
    let b = x.dim(0)?;
    let n = if b == 0 { 0 } else { x.elem_count() / b };
    let flat = x.reshape((b, n))?;
    let x_min = flat.min_keepdim(1)?;
    let x_max = flat.max_keepdim(1)?;
    let range = (x_max - &x_min)?.affine(1., eps)?;
    let out = flat
        .broadcast_sub(&x_min)?
        .broadcast_div(&range)?
        .affine(max_val - min_val, min_val)?;
    Ok(out.reshape(x.shape())?)
}

/// Module form of [`normalize`].
#[derive(Clone, Debug)]
pub struct Normalize {
    pub mean: Stat,
    pub std: Stat,
}

impl Normalize {
    pub fn new(mean: impl Into<Stat>, std: impl Into<Stat>) -> Self {
        Self { mean: mean.into(), std: std.into() }
    }

    /// ImageNet statistics for RGB input in `[0, 1]`.
    pub fn imagenet() -> Self {
        Self::new([0.485, 0.456, 0.406], [0.229, 0.224, 0.225])
    }
}

impl candle_core::Module for Normalize {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        normalize(xs, self.mean.clone(), self.std.clone()).map_err(candle_core::Error::wrap)
    }
}

impl std::fmt::Display for Normalize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Normalize(mean={}, std={})", self.mean, self.std)
    }
}

/// Module form of [`denormalize`].
#[derive(Clone, Debug)]
pub struct Denormalize {
    pub mean: Stat,
    pub std: Stat,
}

impl Denormalize {
    pub fn new(mean: impl Into<Stat>, std: impl Into<Stat>) -> Self {
        Self { mean: mean.into(), std: std.into() }
    }
}

impl candle_core::Module for Denormalize {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        denormalize(xs, self.mean.clone(), self.std.clone()).map_err(candle_core::Error::wrap)
    }
}

impl std::fmt::Display for Denormalize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Denormalize(mean={}, std={})", self.mean, self.std)
    }
}
