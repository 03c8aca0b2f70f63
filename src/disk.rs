//! DISK keypoints and descriptors on top of a dense backbone.
//!
//! The backbone (a U-Net in the published model) is any `candle_core::Module`
//! mapping `(B, 3, H, W)` to `(B, desc_dim + 1, H, W)`: the first `desc_dim`
//! channels are dense descriptors, the last one is the detection heatmap.

use candle_core::{DType, Module, Tensor};
use rayon::prelude::*;

use crate::check::{check_float, check_shape, fit_to_stride};
use crate::error::{Error, Result};

/// Spatial size granularity of the backbone.
pub const STRIDE: usize = 16;

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct DiskConfig {
    pub desc_dim: usize,
    /// NMS window, odd
    pub window_size: usize,
    pub score_threshold: f64,
    pub pad_if_not_divisible: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            desc_dim: 128,
            window_size: 5,
            score_threshold: 0.0,
            pad_if_not_divisible: false,
        }
    }
}

/// Detections of one image.
#[derive(Clone, Debug)]
pub struct DiskFeatures {
    /// `(K, 2)` pixel coordinates as `(x, y)`
    pub keypoints: Tensor,
    /// `(K, D)` unit length
    pub descriptors: Tensor,
    /// `(K)`
    pub detection_scores: Tensor,
}

impl DiskFeatures {
    pub fn len(&self) -> usize {
        self.detection_scores.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn x(&self) -> candle_core::Result<Tensor> {
        self.keypoints.narrow(1, 0, 1)?.squeeze(1)
    }

    pub fn y(&self) -> candle_core::Result<Tensor> {
        self.keypoints.narrow(1, 1, 1)?.squeeze(1)
    }
}

/// Flat indices of the local maxima of a `h x w` heatmap above `threshold`,
/// highest score first.
///
/// A pixel survives when it is the first maximum (raster order) of the
/// `window_size` window centred on it. This departs from the max-pool rule
/// (`heat == max_pool(heat)`), which keeps every tied maximum in raster order.
fn local_maxima(heat: &[f32], h: usize, w: usize, window_size: usize, threshold: f32) -> Vec<usize> {
    let r = window_size / 2;
    let mut kept: Vec<usize> = (0..h * w)
        .filter(|&ip| {
            let v = heat[ip];
            if !(v > threshold) {
                return false;
            }
            let (iy, ix) = (ip / w, ip % w);
            for jy in iy.saturating_sub(r)..(iy + r + 1).min(h) {
                for jx in ix.saturating_sub(r)..(ix + r + 1).min(w) {
                    let jp = jy * w + jx;
                    let u = heat[jp];
                    if u > v || (u == v && jp < ip) {
                        return false;
                    }
                }
            }
            true
        })
        .collect();
    kept.sort_by(|&a, &b| heat[b].total_cmp(&heat[a]).then(a.cmp(&b)));
    kept
}

/// Pick the detections of one image from its heatmap `(1, H, W)` and
/// dense descriptors `(D, H, W)`.
fn sample_features(heatmap: &Tensor, descriptors: &Tensor, kept: &[usize], w: usize) -> Result<DiskFeatures> {
    let device = heatmap.device();
    let dtype = descriptors.dtype();
    let d = descriptors.dim(0)?;
    if kept.is_empty() {
        return Ok(DiskFeatures {
            keypoints: Tensor::zeros((0, 2), dtype, device)?,
            descriptors: Tensor::zeros((0, d), dtype, device)?,
            detection_scores: Tensor::zeros(0, heatmap.dtype(), device)?,
        });
    }
    let xy: Vec<f32> = kept
        .iter()
        .flat_map(|&ip| [(ip % w) as f32, (ip / w) as f32])
        .collect();
    let keypoints = Tensor::from_vec(xy, (kept.len(), 2), device)?.to_dtype(dtype)?;
    let idx: Vec<u32> = kept.iter().map(|&ip| ip as u32).collect();
    let idx = Tensor::from_vec(idx, kept.len(), device)?;
    let detection_scores = heatmap.flatten_all()?.index_select(&idx, 0)?;
    let desc = descriptors.flatten_from(1)?.index_select(&idx, 1)?.t()?;
    let norm = desc.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1.0e-12)?;
    let descriptors = desc.broadcast_div(&norm)?;
    Ok(DiskFeatures {
        keypoints,
        descriptors,
        detection_scores,
    })
}

pub struct Disk<M: Module> {
    backbone: M,
    config: DiskConfig,
}

impl<M: Module> Disk<M> {
    pub fn new(backbone: M, config: DiskConfig) -> Result<Self> {
        if config.window_size % 2 != 1 {
            return Err(Error::Value(format!(
                "window_size has to be odd, got {}",
                config.window_size
            )));
        }
        tracing::debug!(?config, "DISK");
        Ok(Disk { backbone, config })
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    /// Run the backbone on `(B, 3, H, W)` images with `H`, `W` multiples of 16,
    /// returning the heatmaps `(B, 1, H, W)` and dense descriptors `(B, D, H, W)`.
    pub fn heatmap_and_dense_descriptors(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        let out = self.backbone.forward(images)?;
        let desc_dim = self.config.desc_dim;
        let (_b, c, _h, _w) = out.dims4()?;
        if c != desc_dim + 1 {
            return Err(Error::Value(format!(
                "U-Net output has {c} channels, but expected desc_dim={desc_dim} + 1."
            )));
        }
        let descriptors = out.narrow(1, 0, desc_dim)?;
        let heatmaps = out.narrow(1, desc_dim, 1)?;
        Ok((heatmaps, descriptors))
    }

    /// Detect keypoints in every image, keeping at most `n` per image when given.
    pub fn detect(&self, images: &Tensor, n: Option<usize>) -> Result<Vec<DiskFeatures>> {
        check_float(images)?;
        check_shape(images, &["B", "C", "H", "W"])?;
        let (b, c, h, w) = images.dims4()?;
        if c != 3 {
            return Err(Error::Value(format!(
                "DISK expects 3 channel images. Got {c}"
            )));
        }
        if h == 0 || w == 0 {
            return Err(Error::Value(format!("empty image {h}x{w}")));
        }
        let padded = fit_to_stride(images, STRIDE, self.config.pad_if_not_divisible)?;
        let (heatmaps, descriptors) = self.heatmap_and_dense_descriptors(&padded)?;
        let heatmaps = heatmaps.narrow(2, 0, h)?.narrow(3, 0, w)?;
        let descriptors = descriptors.narrow(2, 0, h)?.narrow(3, 0, w)?;

        let heat = heatmaps.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let (window_size, threshold) = (self.config.window_size, self.config.score_threshold as f32);
        let kept: Vec<Vec<usize>> = heat
            .par_chunks(h * w)
            .map(|heat| {
                let mut kept = local_maxima(heat, h, w, window_size, threshold);
                if let Some(n) = n {
                    kept.truncate(n);
                }
                kept
            })
            .collect();
        tracing::trace!(batch = b, counts = ?kept.iter().map(|k| k.len()).collect::<Vec<_>>(), "DISK detections");

        (0..b)
            .map(|i_b| {
                let kept = kept.get(i_b).map(|k| k.as_slice()).unwrap_or(&[]);
                sample_features(&heatmaps.get(i_b)?, &descriptors.get(i_b)?, kept, w)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_close, rand_tensor};
    use candle_core::Device;

    /// Red channel as heatmap, descriptors `1..=D` at every pixel.
    struct RedHeatmap {
        desc_dim: usize,
        extra: usize,
    }

    impl Module for RedHeatmap {
        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            let (b, _, h, w) = xs.dims4()?;
            let d = self.desc_dim + self.extra;
            let desc = Tensor::arange(1f32, d as f32 + 1., xs.device())?
                .to_dtype(xs.dtype())?
                .reshape((1, d, 1, 1))?
                .broadcast_as((b, d, h, w))?;
            Tensor::cat(&[&desc, &xs.narrow(1, 0, 1)?], 1)
        }
    }

    fn disk(desc_dim: usize, pad: bool) -> Result<Disk<RedHeatmap>> {
        let config = DiskConfig {
            desc_dim,
            pad_if_not_divisible: pad,
            ..Default::default()
        };
        Disk::new(RedHeatmap { desc_dim, extra: 0 }, config)
    }

    fn image_with_peaks(h: usize, w: usize, peaks: &[(usize, usize, f32)]) -> candle_core::Result<Tensor> {
        let mut v = vec![0f32; 3 * h * w];
        for &(x, y, s) in peaks {
            v[y * w + x] = s;
        }
        Tensor::from_vec(v, (1, 3, h, w), &Device::Cpu)
    }

    #[test]
    fn heatmap_split() -> anyhow::Result<()> {
        let disk = disk(8, false)?;
        let images = rand_tensor(&[2, 3, 32, 16], 3)?.to_dtype(DType::F64)?;
        let (heatmaps, descriptors) = disk.heatmap_and_dense_descriptors(&images)?;
        assert_eq!(heatmaps.dims(), &[2, 1, 32, 16]);
        assert_eq!(descriptors.dims(), &[2, 8, 32, 16]);
        assert_eq!(heatmaps.dtype(), DType::F64);
        assert_eq!(descriptors.dtype(), DType::F64);
        assert_close(&heatmaps, &images.narrow(1, 0, 1)?, 0.)?;
        Ok(())
    }

    #[test]
    fn backbone_channel_mismatch() -> anyhow::Result<()> {
        let config = DiskConfig { desc_dim: 8, ..Default::default() };
        let disk = Disk::new(RedHeatmap { desc_dim: 8, extra: 1 }, config)?;
        let images = rand_tensor(&[1, 3, 16, 16], 0)?;
        assert!(matches!(disk.detect(&images, None), Err(Error::Value(_))));
        Ok(())
    }

    #[test]
    fn input_validation() -> anyhow::Result<()> {
        let disk = disk(4, false)?;
        let gray = rand_tensor(&[1, 1, 16, 16], 0)?;
        assert!(matches!(disk.detect(&gray, None), Err(Error::Value(_))));
        let odd = rand_tensor(&[1, 3, 20, 16], 0)?;
        assert!(matches!(disk.detect(&odd, None), Err(Error::Value(_))));
        let config = DiskConfig { window_size: 4, ..Default::default() };
        assert!(Disk::new(RedHeatmap { desc_dim: 128, extra: 0 }, config).is_err());
        Ok(())
    }

    #[test]
    fn detections_sorted_and_suppressed() -> anyhow::Result<()> {
        let disk = disk(4, false)?;
        let peaks = [(3, 4, 0.9), (12, 2, 0.7), (10, 12, 0.5), (4, 4, 0.8), (12, 13, 0.5)];
        let images = image_with_peaks(16, 16, &peaks)?;
        let features = disk.detect(&images, None)?;
        assert_eq!(features.len(), 1);
        let f = &features[0];
        // (4, 4) and (12, 13) lose against stronger or earlier neighbours
        assert_eq!(f.len(), 3);
        assert_eq!(f.keypoints.to_vec2::<f32>()?, vec![vec![3., 4.], vec![12., 2.], vec![10., 12.]]);
        assert_eq!(f.detection_scores.to_vec1::<f32>()?, vec![0.9, 0.7, 0.5]);
        assert_eq!(f.x()?.to_vec1::<f32>()?, vec![3., 12., 10.]);
        let norms = f.descriptors.sqr()?.sum_keepdim(1)?.sqrt()?;
        assert_close(&norms, &Tensor::ones((3, 1), DType::F32, &Device::Cpu)?, 1.0e-6)?;

        let top = disk.detect(&images, Some(2))?;
        assert_eq!(top[0].keypoints.to_vec2::<f32>()?, vec![vec![3., 4.], vec![12., 2.]]);
        Ok(())
    }

    #[test]
    fn tied_maxima_keep_the_first() {
        let mut heat = vec![0f32; 5 * 8];
        heat[2 * 8 + 1] = 0.4;
        heat[2 * 8 + 3] = 0.4;
        heat[4 * 8 + 7] = 0.6;
        assert_eq!(local_maxima(&heat, 5, 8, 3, 0.), vec![4 * 8 + 7, 2 * 8 + 1, 2 * 8 + 3]);
        // the max-pool rule would keep both 0.4 pixels here
        assert_eq!(local_maxima(&heat, 5, 8, 5, 0.), vec![4 * 8 + 7, 2 * 8 + 1]);
    }

    #[test]
    fn padding_is_cropped() -> anyhow::Result<()> {
        let disk = disk(4, true)?;
        let images = image_with_peaks(20, 17, &[(16, 19, 0.3), (2, 2, 0.6)])?;
        let features = disk.detect(&images, None)?;
        assert_eq!(features[0].keypoints.to_vec2::<f32>()?, vec![vec![2., 2.], vec![16., 19.]]);
        Ok(())
    }

    #[test]
    fn empty_heatmap() -> anyhow::Result<()> {
        let disk = disk(4, false)?;
        let images = Tensor::zeros((2, 3, 16, 32), DType::F32, &Device::Cpu)?;
        let features = disk.detect(&images, Some(10))?;
        assert_eq!(features.len(), 2);
        assert!(features.iter().all(|f| f.is_empty()));
        assert_eq!(features[0].descriptors.dims(), &[0, 4]);
        Ok(())
    }
}
