use candle_core::{CpuStorage, Layout, Shape, Tensor, WithDType};
use num_traits::{AsPrimitive, Float};
use rayon::prelude::*;

/// Samples a `patch_size` x `patch_size` patch for every LAF from a
/// `(B, C, H, W)` image, giving `(B * N, C, PS, PS)`. The frames `(B, N, 2, 3)`
/// are the second argument of `apply_op2` and receive gradients too.
///
/// Patch pixel `(i, j)` sits at `u = (2j + 1) / PS - 1`, `v = (2i + 1) / PS - 1`
/// in the frame and is read at `A [u, v]^T + t` with bilinear interpolation,
/// clamping to the image border.
pub struct Layer {
    pub patch_size: usize,
}

/// Bilinear footprint of one patch pixel.
struct Sample {
    u: f64,
    v: f64,
    x0: usize,
    x1: usize,
    y0: usize,
    y1: usize,
    rx: f64,
    ry: f64,
    /// false when the coordinate was clamped to the border
    free_x: bool,
    free_y: bool,
}

impl Sample {
    fn new(a: &[f64], ps: usize, i: usize, j: usize, h: usize, w: usize) -> Self {
        let u = (2 * j + 1) as f64 / ps as f64 - 1.0;
        let v = (2 * i + 1) as f64 / ps as f64 - 1.0;
        let (xmax, ymax) = ((w - 1) as f64, (h - 1) as f64);
        let x = a[0] * u + a[1] * v + a[2];
        let y = a[3] * u + a[4] * v + a[5];
        let (free_x, free_y) = ((0.0..=xmax).contains(&x), (0.0..=ymax).contains(&y));
        let (x, y) = (x.clamp(0.0, xmax), y.clamp(0.0, ymax));
        let (x0, y0) = (x.floor() as usize, y.floor() as usize);
        Sample {
            u,
            v,
            x0,
            x1: (x0 + 1).min(w - 1),
            y0,
            y1: (y0 + 1).min(h - 1),
            rx: x - x0 as f64,
            ry: y - y0 as f64,
            free_x,
            free_y,
        }
    }

    /// Four (pixel offset, weight) taps.
    fn taps(&self, w: usize) -> [(usize, f64); 4] {
        let (rx, ry) = (self.rx, self.ry);
        [
            (self.y0 * w + self.x0, (1.0 - rx) * (1.0 - ry)),
            (self.y0 * w + self.x1, rx * (1.0 - ry)),
            (self.y1 * w + self.x0, (1.0 - rx) * ry),
            (self.y1 * w + self.x1, rx * ry),
        ]
    }

    /// Derivative of the sampled value with respect to the image-space `(x, y)`.
    fn slope(&self, chan: &[f64], w: usize) -> (f64, f64) {
        let p00 = chan[self.y0 * w + self.x0];
        let p01 = chan[self.y0 * w + self.x1];
        let p10 = chan[self.y1 * w + self.x0];
        let p11 = chan[self.y1 * w + self.x1];
        let (rx, ry) = (self.rx, self.ry);
        let dx = if self.free_x { (1.0 - ry) * (p01 - p00) + ry * (p11 - p10) } else { 0.0 };
        let dy = if self.free_y { (1.0 - rx) * (p10 - p00) + rx * (p11 - p01) } else { 0.0 };
        (dx, dy)
    }
}

fn as_f64<T: AsPrimitive<f64>>(v: &[T]) -> Vec<f64> {
    v.iter().map(|&v| v.as_()).collect()
}

fn cpu_vec<T: WithDType>(t: &Tensor) -> candle_core::Result<Vec<T>> {
    t.flatten_all()?.to_vec1::<T>()
}

impl Layer {
    fn fwd<T>(&self, img: &[T], laf: &[f64], (b, c, h, w): (usize, usize, usize, usize)) -> Vec<T>
    where
        T: Float + Send + Sync + 'static,
        f64: AsPrimitive<T>,
    {
        let ps = self.patch_size;
        let num_laf = if b == 0 { 0 } else { laf.len() / (6 * b) };
        let mut patches = vec![T::zero(); b * num_laf * c * ps * ps];
        if patches.is_empty() {
            return patches;
        }
        patches
            .par_chunks_mut(c * ps * ps)
            .enumerate()
            .for_each(|(i_patch, patch)| {
                let i_batch = i_patch / num_laf;
                let img = &img[i_batch * c * h * w..(i_batch + 1) * c * h * w];
                let a = &laf[i_patch * 6..i_patch * 6 + 6];
                for i in 0..ps {
                    for j in 0..ps {
                        let taps = Sample::new(a, ps, i, j, h, w).taps(w);
                        for i_ch in 0..c {
                            let chan = &img[i_ch * h * w..(i_ch + 1) * h * w];
                            let mut v = T::zero();
                            for &(idx, weight) in taps.iter() {
                                v = v + chan[idx] * weight.as_();
                            }
                            patch[(i_ch * ps + i) * ps + j] = v;
                        }
                    }
                }
            });
        patches
    }

    fn bwd_img(&self, laf: &[f64], dw_patches: &[f64], (b, c, h, w): (usize, usize, usize, usize)) -> Vec<f64> {
        let ps = self.patch_size;
        let mut dw_img = vec![0f64; b * c * h * w];
        if dw_img.is_empty() {
            return dw_img;
        }
        let num_laf = laf.len() / (6 * b);
        // every batch element only receives gradient from its own frames
        dw_img
            .par_chunks_mut(c * h * w)
            .enumerate()
            .for_each(|(i_batch, dw_img)| {
                for i_laf in i_batch * num_laf..(i_batch + 1) * num_laf {
                    let a = &laf[i_laf * 6..i_laf * 6 + 6];
                    let dw_patch = &dw_patches[i_laf * c * ps * ps..(i_laf + 1) * c * ps * ps];
                    for i in 0..ps {
                        for j in 0..ps {
                            let taps = Sample::new(a, ps, i, j, h, w).taps(w);
                            for i_ch in 0..c {
                                let dw = dw_patch[(i_ch * ps + i) * ps + j];
                                for &(idx, weight) in taps.iter() {
                                    dw_img[i_ch * h * w + idx] += dw * weight;
                                }
                            }
                        }
                    }
                }
            });
        dw_img
    }

    /// `x = a0 u + a1 v + a2`, `y = a3 u + a4 v + a5`, chained with the bilinear slope.
    fn bwd_laf(
        &self,
        img: &[f64],
        laf: &[f64],
        dw_patches: &[f64],
        (b, c, h, w): (usize, usize, usize, usize),
    ) -> Vec<f64> {
        let ps = self.patch_size;
        let mut dw_laf = vec![0f64; laf.len()];
        if dw_laf.is_empty() {
            return dw_laf;
        }
        let num_laf = laf.len() / (6 * b);
        dw_laf
            .par_chunks_mut(6)
            .enumerate()
            .for_each(|(i_laf, dw_a)| {
                let i_batch = i_laf / num_laf;
                let img = &img[i_batch * c * h * w..(i_batch + 1) * c * h * w];
                let a = &laf[i_laf * 6..i_laf * 6 + 6];
                let dw_patch = &dw_patches[i_laf * c * ps * ps..(i_laf + 1) * c * ps * ps];
                for i in 0..ps {
                    for j in 0..ps {
                        let s = Sample::new(a, ps, i, j, h, w);
                        for i_ch in 0..c {
                            let dw = dw_patch[(i_ch * ps + i) * ps + j];
                            let (dx, dy) = s.slope(&img[i_ch * h * w..(i_ch + 1) * h * w], w);
                            let (gx, gy) = (dw * dx, dw * dy);
                            dw_a[0] += gx * s.u;
                            dw_a[1] += gx * s.v;
                            dw_a[2] += gx;
                            dw_a[3] += gy * s.u;
                            dw_a[4] += gy * s.v;
                            dw_a[5] += gy;
                        }
                    }
                }
            });
        dw_laf
    }

    fn bwd_typed<T>(&self, img: &Tensor, laf: &Tensor, dw_patches: &Tensor) -> candle_core::Result<(Tensor, Tensor)>
    where
        T: WithDType + Float + AsPrimitive<f64>,
        f64: AsPrimitive<T>,
    {
        let dims = img.dims4()?;
        let img_vals = as_f64(&cpu_vec::<T>(img)?);
        let laf_vals = as_f64(&cpu_vec::<T>(laf)?);
        let dw_vals = as_f64(&cpu_vec::<T>(dw_patches)?);
        let dw_img: Vec<T> = self.bwd_img(&laf_vals, &dw_vals, dims).iter().map(|v| v.as_()).collect();
        let dw_laf: Vec<T> = self
            .bwd_laf(&img_vals, &laf_vals, &dw_vals, dims)
            .iter()
            .map(|v| v.as_())
            .collect();
        Ok((
            Tensor::from_vec(dw_img, img.shape(), img.device())?,
            Tensor::from_vec(dw_laf, laf.shape(), laf.device())?,
        ))
    }
}

impl candle_core::CustomOp2 for Layer {
    fn name(&self) -> &'static str {
        "img_laf_to_patches"
    }

    fn cpu_fwd(
        &self,
        s_img: &CpuStorage,
        l_img: &Layout,
        s_laf: &CpuStorage,
        l_laf: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        let (b, c, h, w) = l_img.shape().dims4()?;
        if h == 0 || w == 0 {
            candle_core::bail!("img_laf_to_patches: empty image {h}x{w}");
        }
        let (b_laf, num_laf, two, three) = l_laf.shape().dims4()?;
        if b_laf != b || two != 2 || three != 3 {
            candle_core::bail!("img_laf_to_patches: frames {:?} for a batch of {b}", l_laf.shape());
        }
        let (Some((i0, i1)), Some((a0, a1))) = (l_img.contiguous_offsets(), l_laf.contiguous_offsets())
        else {
            candle_core::bail!("img_laf_to_patches expects contiguous inputs");
        };
        let storage = match (s_img, s_laf) {
            (CpuStorage::F32(img), CpuStorage::F32(laf)) => WithDType::to_cpu_storage_owned(
                self.fwd(&img[i0..i1], &as_f64(&laf[a0..a1]), (b, c, h, w)),
            ),
            (CpuStorage::F64(img), CpuStorage::F64(laf)) => WithDType::to_cpu_storage_owned(
                self.fwd(&img[i0..i1], &laf[a0..a1], (b, c, h, w)),
            ),
            _ => candle_core::bail!("img_laf_to_patches only supports f32 or f64 pairs"),
        };
        let ps = self.patch_size;
        let shape = Shape::from((b * num_laf, c, ps, ps));
        Ok((storage, shape))
    }

    fn bwd(
        &self,
        img: &Tensor,
        laf: &Tensor,
        _patches: &Tensor,
        dw_patches: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>)> {
        let (dw_img, dw_laf) = match img.dtype() {
            candle_core::DType::F32 => self.bwd_typed::<f32>(img, laf, dw_patches)?,
            candle_core::DType::F64 => self.bwd_typed::<f64>(img, laf, dw_patches)?,
            dtype => candle_core::bail!("img_laf_to_patches: unsupported dtype {dtype:?}"),
        };
        Ok((Some(dw_img), Some(dw_laf)))
    }
}

/// Extract `(B * N, C, PS, PS)` patches for the frames `laf` `(B, N, 2, 3)` of `img` `(B, C, H, W)`.
/// Differentiable with respect to both.
pub fn extract_patches(img: &Tensor, laf: &Tensor, patch_size: usize) -> candle_core::Result<Tensor> {
    let laf = laf.to_dtype(img.dtype())?.contiguous()?;
    img.contiguous()?.apply_op2(&laf, Layer { patch_size })
}

#[test]
fn identity_frame_reproduces_image() -> anyhow::Result<()> {
    let dev = candle_core::Device::Cpu;
    let img = Tensor::arange(0f32, 32., &dev)?.reshape((1, 2, 4, 4))?;
    // a frame of half-width 2 centred at (1.5, 1.5) hits the pixel centres exactly
    let laf = Tensor::new(&[[[[2f32, 0., 1.5], [0., 2., 1.5]]]], &dev)?;
    let patches = extract_patches(&img, &laf, 4)?;
    assert_eq!(patches.dims(), &[1, 2, 4, 4]);
    let diff = (patches - &img)?.abs()?.flatten_all()?.max(0)?.to_vec0::<f32>()?;
    assert!(diff < 1.0e-5, "{diff}");
    Ok(())
}

#[test]
fn batches_use_their_own_image() -> anyhow::Result<()> {
    let dev = candle_core::Device::Cpu;
    let img = Tensor::cat(
        &[
            Tensor::zeros((1, 1, 8, 8), candle_core::DType::F32, &dev)?,
            Tensor::ones((1, 1, 8, 8), candle_core::DType::F32, &dev)?,
        ],
        0,
    )?;
    let laf = Tensor::new(&[[2f32, 0., 4.], [0., 2., 4.]], &dev)?
        .unsqueeze(0)?
        .unsqueeze(0)?
        .repeat((2, 3, 1, 1))?;
    let patches = extract_patches(&img, &laf, 5)?;
    assert_eq!(patches.dims(), &[6, 1, 5, 5]);
    let sums = patches.sum_keepdim(3)?.sum_keepdim(2)?.flatten_all()?.to_vec1::<f32>()?;
    for (sum, expected) in sums.iter().zip([0f32, 0., 0., 25., 25., 25.]) {
        assert!((sum - expected).abs() < 1.0e-4, "{sums:?}");
    }
    Ok(())
}

#[cfg(test)]
const TEST_LAF: [f64; 12] = [3., 1., 3.3, -0.5, 2., 4.1, 1.5, 0., 6.2, 0., 3.7, 2.3];

#[test]
fn gradient_is_adjoint_of_sampling() -> anyhow::Result<()> {
    // <P x, y> == <x, P^T y> for the linear sampling operator P
    let dev = candle_core::Device::Cpu;
    let img = candle_core::Var::from_tensor(
        &Tensor::arange(0f64, 2. * 9. * 7., &dev)?.reshape((2, 1, 9, 7))?.affine(0.1, 0.)?,
    )?;
    let laf = Tensor::from_vec(TEST_LAF.to_vec(), (2, 1, 2, 3), &dev)?;
    let patches = extract_patches(&img, &laf, 6)?;
    let y = Tensor::arange(0f64, patches.elem_count() as f64, &dev)?
        .reshape(patches.shape())?
        .cos()?;
    let loss = patches.mul(&y)?.sum_all()?;
    let grads = loss.backward()?;
    let dw_img = grads.get(&img).unwrap();
    let lhs = loss.to_vec0::<f64>()?;
    let rhs = dw_img.mul(img.as_tensor())?.sum_all()?.to_vec0::<f64>()?;
    assert!((lhs - rhs).abs() < 1.0e-9 * lhs.abs().max(1.0), "{lhs} {rhs}");
    Ok(())
}

#[test]
fn frame_gradient_matches_finite_difference() -> anyhow::Result<()> {
    let dev = candle_core::Device::Cpu;
    let img: Vec<f64> = (0..2 * 2 * 9 * 7)
        .map(|k| {
            let (x, y) = ((k % 7) as f64, ((k / 7) % 9) as f64);
            (0.7 * x + 0.3 * y).sin() + 0.5 * (0.4 * x - 0.9 * y + k as f64 / 63.).cos()
        })
        .collect();
    let img = Tensor::from_vec(img, (2, 2, 9, 7), &dev)?;
    let weights = Tensor::arange(0f64, (2 * 2 * 6 * 6) as f64, &dev)?
        .reshape((2, 2, 6, 6))?
        .affine(0.37, 0.)?
        .sin()?;
    let loss = |laf: &Tensor| -> anyhow::Result<Tensor> {
        Ok(extract_patches(&img, laf, 6)?.mul(&weights)?.sum_all()?)
    };
    let laf = candle_core::Var::from_tensor(&Tensor::from_vec(TEST_LAF.to_vec(), (2, 1, 2, 3), &dev)?)?;
    let grads = loss(&laf)?.backward()?;
    let dw_laf = grads.get(&laf).unwrap().flatten_all()?.to_vec1::<f64>()?;
    let eps = 1.0e-6;
    for k in 0..TEST_LAF.len() {
        let shifted = |d: f64| -> anyhow::Result<f64> {
            let mut v = TEST_LAF.to_vec();
            v[k] += d;
            Ok(loss(&Tensor::from_vec(v, (2, 1, 2, 3), &dev)?)?.to_vec0::<f64>()?)
        };
        let fd = (shifted(eps)? - shifted(-eps)?) / (2. * eps);
        assert!((fd - dw_laf[k]).abs() < 1.0e-5 * fd.abs().max(1.0), "{k}: {fd} {}", dw_laf[k]);
    }
    Ok(())
}
