//! Dominant orientation of local features and its application to LAFs.

use std::f64::consts::PI;

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};

use crate::check::{check_float, check_shape};
use crate::error::{Error, Result};
use crate::img_laf_to_patches::extract_patches;
use crate::laf::{check_laf, rotate_laf};
use crate::yx_to_angle::atan2_tensor;

/// Estimates one angle (radians) per `(B, 1, PS, PS)` patch.
pub trait AngleDetector {
    fn patch_size(&self) -> usize;

    /// Returns a `(B)` tensor of angles in radians.
    fn detect(&self, patches: &Tensor) -> Result<Tensor>;
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct OrientationConfig {
    pub patch_size: usize,
    pub num_angular_bins: usize,
    pub eps: f64,
}

impl Default for OrientationConfig {
    fn default() -> Self {
        OrientationConfig {
            patch_size: 32,
            num_angular_bins: 36,
            eps: 1.0e-8,
        }
    }
}

/// Normalized Gaussian taps centred on `(size - 1) / 2`.
fn gaussian_kernel1d(size: usize, sigma: f64) -> Vec<f64> {
    let mid = (size as f64 - 1.) / 2.;
    let taps: Vec<f64> = (0..size)
        .map(|i| (-(i as f64 - mid).powi(2) / (2. * sigma * sigma)).exp())
        .collect();
    let sum: f64 = taps.iter().sum();
    taps.iter().map(|v| v / sum).collect()
}

/// Modified Bessel function of the first kind `I_n(t)`, by its power series.
fn bessel_i(n: usize, t: f64) -> f64 {
    let half = t / 2.;
    let mut term = (1..=n).fold(1., |acc, k| acc * half / k as f64);
    let mut sum = term;
    for k in 1..100 {
        term *= half * half / (k * (k + n)) as f64;
        sum += term;
        if term < sum * f64::EPSILON {
            break;
        }
    }
    sum
}

/// Discrete Gaussian `e^{-t} I_|n|(t)` with `t = sigma^2`, normalized.
fn gaussian_discrete_kernel1d(size: usize, sigma: f64) -> Vec<f64> {
    let t = sigma * sigma;
    let half = size / 2;
    let taps: Vec<f64> = (0..size)
        .map(|i| (-t).exp() * bessel_i(i.abs_diff(half), t))
        .collect();
    let sum: f64 = taps.iter().sum();
    taps.iter().map(|v| v / sum).collect()
}

/// Histogram of gradient orientations weighted by magnitude, peak refined
/// by fitting a parabola through the neighbouring bins.
#[derive(Clone, Debug)]
pub struct PatchDominantGradientOrientation {
    patch_size: usize,
    num_angular_bins: usize,
    eps: f64,
    window: Vec<f64>,
    smoothing: Vec<f64>,
}

impl PatchDominantGradientOrientation {
    pub fn new(patch_size: usize, num_angular_bins: usize, eps: f64) -> Result<Self> {
        if patch_size == 0 {
            return Err(Error::Value("patch_size must be positive".to_string()));
        }
        if num_angular_bins < 2 {
            return Err(Error::Value(format!(
                "num_angular_bins must be at least 2. Got {num_angular_bins}"
            )));
        }
        let g = gaussian_kernel1d(patch_size, patch_size as f64 / 2f64.sqrt());
        let window = g
            .iter()
            .flat_map(|gy| g.iter().map(move |gx| gy * gx))
            .collect();
        tracing::debug!(patch_size, num_angular_bins, "dominant gradient orientation");
        Ok(PatchDominantGradientOrientation {
            patch_size,
            num_angular_bins,
            eps,
            window,
            smoothing: gaussian_discrete_kernel1d(5, 1.6),
        })
    }

    pub fn from_config(config: &OrientationConfig) -> Result<Self> {
        Self::new(config.patch_size, config.num_angular_bins, config.eps)
    }

    pub fn num_angular_bins(&self) -> usize {
        self.num_angular_bins
    }

    /// `(2, 1, 3, 3)` normalized sobel kernels, x then y.
    fn sobel_kernel(dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        let kx = [-1., 0., 1., -2., 0., 2., -1., 0., 1.];
        let ky = [-1., -2., -1., 0., 0., 0., 1., 2., 1.];
        let k: Vec<f64> = kx.iter().chain(ky.iter()).map(|v| v / 8.).collect();
        Tensor::from_vec(k, (2, 1, 3, 3), device)?.to_dtype(dtype)
    }

    /// Circular smoothing of `(B, nbins)` histograms.
    fn smooth(&self, bins: &Tensor) -> candle_core::Result<Tensor> {
        let n = self.num_angular_bins;
        let half = self.smoothing.len() / 2;
        let wrapped = Tensor::cat(&[&bins.narrow(1, n - half, half)?, bins, &bins.narrow(1, 0, half)?], 1)?;
        let kernel = Tensor::from_vec(self.smoothing.clone(), (1, 1, self.smoothing.len()), bins.device())?
            .to_dtype(bins.dtype())?;
        wrapped.unsqueeze(1)?.conv1d(&kernel, 0, 1, 1, 1)?.squeeze(1)
    }

    /// `(B, nbins)` angular histogram of the patches.
    fn histogram(&self, patch: &Tensor) -> candle_core::Result<Tensor> {
        let (b, _, ps, _) = patch.dims4()?;
        let (dtype, device) = (patch.dtype(), patch.device());
        let nb = self.num_angular_bins as f64;
        let padded = patch.pad_with_same(2, 1, 1)?.pad_with_same(3, 1, 1)?;
        let grads = padded.conv2d(&Self::sobel_kernel(dtype, device)?, 0, 1, 1, 1)?;
        let gx = grads.narrow(1, 0, 1)?;
        let gy = grads.narrow(1, 1, 1)?;
        let mag = ((gx.sqr()? + gy.sqr()?)? + self.eps)?.sqrt()?;
        let window = Tensor::from_vec(self.window.clone(), (1, 1, ps, ps), device)?.to_dtype(dtype)?;
        let mag = mag.broadcast_mul(&window)?.reshape((b, ps * ps))?;
        let ori = (atan2_tensor(&gy, &(gx + self.eps)?)? + 2. * PI)?;
        let o_big = ((ori + PI)? * (nb / (2. * PI)))?.reshape((b, ps * ps))?;
        // bin indices are piecewise constant in the input, only the weights carry gradient
        let o_vals = o_big.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        let n = self.num_angular_bins as u32;
        let mut floor = Vec::with_capacity(o_vals.len());
        let mut bo0 = Vec::with_capacity(o_vals.len());
        let mut bo1 = Vec::with_capacity(o_vals.len());
        for o in o_vals {
            let f = o.floor();
            let i0 = f.rem_euclid(nb) as u32 % n;
            floor.push(f);
            bo0.push(i0);
            bo1.push((i0 + 1) % n);
        }
        let floor = Tensor::from_vec(floor, (b, ps * ps), device)?.to_dtype(dtype)?;
        let bo0 = Tensor::from_vec(bo0, (b, ps * ps), device)?;
        let bo1 = Tensor::from_vec(bo1, (b, ps * ps), device)?;
        let wo1 = (o_big - floor)?;
        let wo0 = wo1.affine(-1., 1.)?.mul(&mag)?;
        let wo1 = wo1.mul(&mag)?;
        let bins = Tensor::zeros((b, self.num_angular_bins), dtype, device)?
            .scatter_add(&bo0, &wo0, 1)?
            .scatter_add(&bo1, &wo1, 1)?;
        bins / (ps * ps) as f64
    }

    /// Angle of the smoothed histogram peak, `(B)`.
    fn peak_angle(&self, bins: &Tensor) -> candle_core::Result<Tensor> {
        let b = bins.dim(0)?;
        let device = bins.device();
        let n = self.num_angular_bins as u32;
        let idx = bins.argmax_keepdim(1)?;
        let idx_v = idx.flatten_all()?.to_vec1::<u32>()?;
        let left: Vec<u32> = idx_v.iter().map(|&i| (i + n - 1) % n).collect();
        let right: Vec<u32> = idx_v.iter().map(|&i| (i + 1) % n).collect();
        let left = bins.gather(&Tensor::from_vec(left, (b, 1), device)?, 1)?;
        let right = bins.gather(&Tensor::from_vec(right, (b, 1), device)?, 1)?;
        let center = bins.gather(&idx, 1)?;
        let den = ((&left + &right)? - (center * 2.)?)?;
        // flat neighbourhood: keep the bin centre
        let flat = den.eq(0.)?;
        let den = flat.where_cond(&den.ones_like()?, &den)?;
        let c = ((left - right)? * 0.5)?.div(&den)?;
        let c = flat.where_cond(&c.zeros_like()?, &c)?;
        let pos = (idx.to_dtype(bins.dtype())? + c)?;
        pos.affine(-2. * PI / self.num_angular_bins as f64, PI)?.squeeze(1)
    }
}

impl AngleDetector for PatchDominantGradientOrientation {
    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn detect(&self, patch: &Tensor) -> Result<Tensor> {
        check_float(patch)?;
        let ps = self.patch_size.to_string();
        check_shape(patch, &["B", "1", &ps, &ps])?;
        tracing::trace!(dims = ?patch.dims(), "dominant gradient orientation");
        if patch.dim(0)? == 0 {
            return Ok(Tensor::zeros(0, patch.dtype(), patch.device())?);
        }
        let bins = self.histogram(patch)?;
        let bins = self.smooth(&bins)?;
        Ok(self.peak_angle(&bins)?)
    }
}

impl Module for PatchDominantGradientOrientation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.detect(xs).map_err(candle_core::Error::wrap)
    }
}

/// Learned orientation estimator for 32x32 patches.
///
/// Parameters follow the `features.{i}` layout of the published OriNet
/// checkpoints: convolutions at 0, 3, 6, 9, 12, 15 (no bias), non-affine
/// batch norms right after each, and the 8x8 head at 19.
pub struct OriNet {
    blocks: Vec<(Conv2d, BatchNorm)>,
    head: Conv2d,
    eps: f64,
}

impl OriNet {
    pub const PATCH_SIZE: usize = 32;

    pub fn new(vb: VarBuilder) -> candle_core::Result<Self> {
        let vb = vb.pp("features");
        let mut blocks = Vec::with_capacity(6);
        let layers = [(1, 16, 1), (16, 16, 1), (16, 32, 2), (32, 32, 1), (32, 64, 2), (64, 64, 1)];
        for (i_block, &(c_in, c_out, stride)) in layers.iter().enumerate() {
            let cfg = Conv2dConfig {
                padding: 1,
                stride,
                ..Default::default()
            };
            let conv = candle_nn::conv2d_no_bias(c_in, c_out, 3, cfg, vb.pp(3 * i_block))?;
            let bn_cfg = BatchNormConfig {
                eps: 1.0e-5,
                remove_mean: true,
                affine: false,
                momentum: 0.1,
            };
            let bn = candle_nn::batch_norm(c_out, bn_cfg, vb.pp(3 * i_block + 1))?;
            blocks.push((conv, bn));
        }
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let head = candle_nn::conv2d(64, 2, 8, cfg, vb.pp(19))?;
        tracing::debug!("OriNet with {} conv blocks", blocks.len());
        Ok(OriNet { blocks, head, eps: 1.0e-8 })
    }

    /// Load from a local safetensors checkpoint.
    pub fn from_safetensors<P: AsRef<std::path::Path>>(path: P, device: &Device) -> Result<Self> {
        tracing::debug!(path = %path.as_ref().display(), "loading OriNet weights");
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path.as_ref()], DType::F32, device)? };
        Ok(Self::new(vb)?)
    }

    /// Zero mean, unit (unbiased) std per patch.
    fn normalize_input(x: &Tensor, eps: f64) -> candle_core::Result<Tensor> {
        let flat = x.flatten_from(1)?;
        let n = flat.dim(1)?;
        let mean = flat.mean_keepdim(1)?;
        let centered = flat.broadcast_sub(&mean)?;
        let var = (centered.sqr()?.sum_keepdim(1)? / n.saturating_sub(1).max(1) as f64)?;
        let std = (var.sqrt()? + eps)?;
        centered.broadcast_div(&std)?.reshape(x.shape())
    }

    /// Raw `(B, 2)` head output.
    fn forward_xy(&self, patch: &Tensor) -> candle_core::Result<Tensor> {
        let mut x = Self::normalize_input(patch, 1.0e-6)?;
        for (conv, bn) in self.blocks.iter() {
            x = bn.forward_t(&conv.forward(&x)?, false)?.relu()?;
        }
        let x = self.head.forward(&x)?.tanh()?;
        x.mean_keepdim(3)?.mean_keepdim(2)?.flatten_from(1)
    }
}

impl AngleDetector for OriNet {
    fn patch_size(&self) -> usize {
        Self::PATCH_SIZE
    }

    fn detect(&self, patch: &Tensor) -> Result<Tensor> {
        check_float(patch)?;
        check_shape(patch, &["B", "1", "32", "32"])?;
        tracing::trace!(dims = ?patch.dims(), "OriNet");
        let xy = self.forward_xy(patch)?;
        let x = (xy.narrow(1, 0, 1)? + self.eps)?;
        let y = (xy.narrow(1, 1, 1)? + self.eps)?;
        Ok(atan2_tensor(&x, &y)?.squeeze(1)?)
    }
}

impl Module for OriNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.detect(xs).map_err(candle_core::Error::wrap)
    }
}

fn check_batch(laf: &Tensor, img: &Tensor) -> Result<()> {
    check_laf(laf)?;
    check_shape(img, &["B", "C", "H", "W"])?;
    let (b_laf, b_img) = (laf.dim(0)?, img.dim(0)?);
    if b_laf != b_img {
        return Err(Error::Value(format!(
            "Batch size of laf and img should be the same. Got {b_laf}, {b_img}"
        )));
    }
    Ok(())
}

/// Leaves the frames untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassLaf;

impl PassLaf {
    pub fn forward(&self, laf: &Tensor, img: &Tensor) -> Result<Tensor> {
        check_batch(laf, img)?;
        Ok(laf.clone())
    }
}

/// Rotates every frame by the angle `D` detects on the patch it covers.
pub struct LafOrienter<D: AngleDetector> {
    pub detector: D,
}

impl<D: AngleDetector> LafOrienter<D> {
    pub fn new(detector: D) -> Self {
        LafOrienter { detector }
    }

    /// `laf` `(B, N, 2, 3)`, `img` `(B, C, H, W)`. Multi-channel patches
    /// are averaged to intensity before detection.
    pub fn forward(&self, laf: &Tensor, img: &Tensor) -> Result<Tensor> {
        check_batch(laf, img)?;
        check_float(img)?;
        let (b, n, _, _) = laf.dims4()?;
        if n == 0 {
            return Ok(laf.clone());
        }
        let ps = self.detector.patch_size();
        let mut patches = extract_patches(img, laf, ps)?;
        if patches.dim(1)? != 1 {
            patches = patches.mean_keepdim(1)?;
        }
        tracing::trace!(num_laf = b * n, patch_size = ps, "orienting frames");
        let angles = self.detector.detect(&patches)?;
        let angles = (angles.reshape((b, n))? * (180. / PI))?;
        rotate_laf(laf, &angles)
    }
}

impl LafOrienter<PatchDominantGradientOrientation> {
    pub fn from_config(config: &OrientationConfig) -> Result<Self> {
        Ok(Self::new(PatchDominantGradientOrientation::from_config(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_close, rand_tensor};

    fn half_bright(rows: bool) -> candle_core::Result<Tensor> {
        let mut v = vec![0f32; 19 * 19];
        for i in 0..19 {
            for j in 0..19 {
                if (rows && i < 10) || (!rows && j < 10) {
                    v[i * 19 + j] = 1.;
                }
            }
        }
        Tensor::from_vec(v, (1, 1, 19, 19), &Device::Cpu)
    }

    #[test]
    fn dominant_gradient_shapes() -> anyhow::Result<()> {
        let ori = PatchDominantGradientOrientation::from_config(&OrientationConfig::default())?;
        for b in [1, 10] {
            let patch = rand_tensor(&[b, 1, 32, 32], b as u64)?;
            let angle = ori.detect(&patch)?;
            assert_eq!(angle.dims(), &[b]);
        }
        let wrong = rand_tensor(&[1, 1, 31, 31], 0)?;
        assert!(matches!(ori.detect(&wrong), Err(Error::Shape { .. })));
        let wrong = rand_tensor(&[1, 3, 32, 32], 0)?;
        assert!(matches!(ori.detect(&wrong), Err(Error::Shape { .. })));
        Ok(())
    }

    #[test]
    fn dominant_gradient_toy() -> anyhow::Result<()> {
        let ori = PatchDominantGradientOrientation::new(19, 36, 1.0e-8)?;
        let angle = ori.forward(&half_bright(true)?)?;
        let degrees = (angle * (180. / PI))?;
        assert_close(&degrees, &Tensor::new(&[90f32], &Device::Cpu)?, 1.0e-2)?;
        Ok(())
    }

    #[test]
    fn discrete_smoothing_kernel() {
        let k = gaussian_discrete_kernel1d(5, 1.6);
        let expected = [0.1190625032, 0.2311235920, 0.2996278095, 0.2311235920, 0.1190625032];
        for (a, b) in k.iter().zip(expected) {
            assert!((a - b).abs() < 1.0e-8, "{k:?}");
        }
        assert!((k.iter().sum::<f64>() - 1.).abs() < 1.0e-12);
        // heavier centre than the sampled gaussian of the same sigma
        assert!(k[2] > gaussian_kernel1d(5, 1.6)[2] + 0.01);
    }

    /// Smooth, non-constant test image.
    fn wavy(h: usize, w: usize) -> Vec<f64> {
        (0..h * w)
            .map(|k| {
                let (y, x) = ((k / w) as f64, (k % w) as f64);
                (0.7 * x + 0.3 * y).sin() + 0.5 * (0.4 * x - 0.9 * y).cos() + 0.05 * x
            })
            .collect()
    }

    /// Central differences of `f` at `x`, one entry at a time.
    fn finite_difference<F>(x: &[f64], shape: &[usize], f: F) -> anyhow::Result<Vec<f64>>
    where
        F: Fn(&Tensor) -> anyhow::Result<f64>,
    {
        let eps = 1.0e-6;
        let mut fd = Vec::with_capacity(x.len());
        for k in 0..x.len() {
            let mut plus = x.to_vec();
            plus[k] += eps;
            let mut minus = x.to_vec();
            minus[k] -= eps;
            let plus = f(&Tensor::from_vec(plus, shape, &Device::Cpu)?)?;
            let minus = f(&Tensor::from_vec(minus, shape, &Device::Cpu)?)?;
            fd.push((plus - minus) / (2. * eps));
        }
        Ok(fd)
    }

    fn assert_gradient(fd: &[f64], grad: &Tensor) -> anyhow::Result<()> {
        let grad = grad.flatten_all()?.to_vec1::<f64>()?;
        assert_eq!(fd.len(), grad.len());
        for (k, (a, b)) in fd.iter().zip(grad.iter()).enumerate() {
            assert!((a - b).abs() < 1.0e-5 * a.abs().max(1.), "{k}: {a} {b}");
        }
        Ok(())
    }

    #[test]
    fn dominant_gradient_backward() -> anyhow::Result<()> {
        let ori = PatchDominantGradientOrientation::new(13, 36, 1.0e-8)?;
        let x = wavy(13, 13);
        let patch = candle_core::Var::from_vec(x.clone(), (1, 1, 13, 13), &Device::Cpu)?;
        let grads = ori.detect(&patch)?.sum_all()?.backward()?;
        let fd = finite_difference(&x, &[1, 1, 13, 13], |p| Ok(ori.detect(p)?.sum_all()?.to_vec0::<f64>()?))?;
        assert_gradient(&fd, grads.get(&patch).unwrap())
    }

    #[test]
    fn orienter_backward() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let orienter = LafOrienter::new(PatchDominantGradientOrientation::new(8, 36, 1.0e-8)?);
        let weights = Tensor::new(&[[[[0.3f64, -1.1, 0.7], [0.9, 0.4, -0.6]]]], &dev)?;
        let loss = |laf: &Tensor, img: &Tensor| -> anyhow::Result<Tensor> {
            Ok(orienter.forward(laf, img)?.mul(&weights)?.sum_all()?)
        };
        let laf_v = vec![3.1, 0.23, 10.37, 0.13, 2.9, 10.61];
        let img_v = wavy(21, 21);
        let laf = candle_core::Var::from_vec(laf_v.clone(), (1, 1, 2, 3), &dev)?;
        let img = candle_core::Var::from_vec(img_v.clone(), (1, 1, 21, 21), &dev)?;
        let grads = loss(laf.as_tensor(), img.as_tensor())?.backward()?;

        let img_t = Tensor::from_vec(img_v.clone(), (1, 1, 21, 21), &dev)?;
        let fd = finite_difference(&laf_v, &[1, 1, 2, 3], |l| Ok(loss(l, &img_t)?.to_vec0::<f64>()?))?;
        assert_gradient(&fd, grads.get(&laf).unwrap())?;

        let laf_t = Tensor::from_vec(laf_v, (1, 1, 2, 3), &dev)?;
        let fd = finite_difference(&img_v, &[1, 1, 21, 21], |i| Ok(loss(&laf_t, i)?.to_vec0::<f64>()?))?;
        assert_gradient(&fd, grads.get(&img).unwrap())
    }

    #[test]
    fn uniform_patch_is_deterministic() -> anyhow::Result<()> {
        let ori = PatchDominantGradientOrientation::new(16, 36, 1.0e-8)?;
        let patch = Tensor::ones((2, 1, 16, 16), DType::F32, &Device::Cpu)?;
        let a = ori.detect(&patch)?.to_vec1::<f32>()?;
        let b = ori.detect(&patch)?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn orienter_toy() -> anyhow::Result<()> {
        let orienter = LafOrienter::from_config(&OrientationConfig::default())?;
        let laf = Tensor::new(&[[[[5f32, 0., 8.], [0., 5., 8.]]]], &Device::Cpu)?;
        let new_laf = orienter.forward(&laf, &half_bright(false)?)?;
        let expected = Tensor::new(&[[[[-5f32, 0., 8.], [0., -5., 8.]]]], &Device::Cpu)?;
        assert_close(&new_laf, &expected, 1.0e-3)?;
        Ok(())
    }

    #[test]
    fn orienter_shapes() -> anyhow::Result<()> {
        let orienter = LafOrienter::new(PatchDominantGradientOrientation::new(16, 36, 1.0e-8)?);
        let img = rand_tensor(&[2, 3, 40, 30], 5)?;
        let laf = Tensor::new(&[[[4f32, 1., 10.], [-1., 4., 20.]]], &Device::Cpu)?
            .unsqueeze(0)?
            .repeat((2, 4, 1, 1))?;
        let out = orienter.forward(&laf, &img)?;
        assert_eq!(out.dims(), &[2, 4, 2, 3]);
        // rotation keeps centres and scale
        assert_close(&out.narrow(3, 2, 1)?, &laf.narrow(3, 2, 1)?, 0.)?;
        let det = |t: &Tensor| -> candle_core::Result<Tensor> {
            let a = t.narrow(3, 0, 1)?.narrow(2, 0, 1)?;
            let b = t.narrow(3, 1, 1)?.narrow(2, 0, 1)?;
            let c = t.narrow(3, 0, 1)?.narrow(2, 1, 1)?;
            let d = t.narrow(3, 1, 1)?.narrow(2, 1, 1)?;
            a.mul(&d)? - b.mul(&c)?
        };
        assert_close(&det(&out)?, &det(&laf)?, 1.0e-3)?;
        Ok(())
    }

    #[test]
    fn batch_mismatch() -> anyhow::Result<()> {
        let img = rand_tensor(&[2, 1, 20, 20], 1)?;
        let laf = Tensor::zeros((1, 3, 2, 3), DType::F32, &Device::Cpu)?;
        let orienter = LafOrienter::from_config(&OrientationConfig::default())?;
        assert!(matches!(orienter.forward(&laf, &img), Err(Error::Value(_))));
        assert!(matches!(PassLaf.forward(&laf, &img), Err(Error::Value(_))));
        Ok(())
    }

    #[test]
    fn pass_laf_is_identity() -> anyhow::Result<()> {
        let img = rand_tensor(&[1, 1, 20, 20], 1)?;
        let laf = rand_tensor(&[1, 5, 2, 3], 2)?;
        assert_close(&PassLaf.forward(&laf, &img)?, &laf, 0.)?;
        Ok(())
    }

    #[test]
    fn orinet_random_init() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let orinet = OriNet::new(vb)?;
        assert!(varmap.data().lock().unwrap().contains_key("features.19.weight"));
        let patches = rand_tensor(&[3, 1, 32, 32], 9)?;
        let angles = orinet.detect(&patches)?;
        assert_eq!(angles.dims(), &[3]);
        for a in angles.to_vec1::<f32>()? {
            assert!(a.abs() <= std::f32::consts::PI + 1.0e-6);
        }
        let orienter = LafOrienter::new(orinet);
        let img = rand_tensor(&[1, 1, 64, 64], 4)?;
        let laf = Tensor::new(&[[[[8f32, 0., 32.], [0., 8., 32.]]]], &dev)?;
        assert_eq!(orienter.forward(&laf, &img)?.dims(), &[1, 1, 2, 3]);
        Ok(())
    }
}
