//! Segment Anything wrapper.
//!
//! The image encoder, prompt encoder and mask decoder live behind
//! [`SamBackend`]; this module validates the batch, pads it to the encoder
//! stride and packs the decoder output per image.

use candle_core::Tensor;

use crate::check::{check_float, check_shape, fit_to_stride};
use crate::error::{Error, Result};

/// Side length of the square input the image encoder is trained on.
pub const ENCODER_IMG_SIZE: usize = 1024;

/// Stride of the image encoder, ViT patches or the TinyViT stages alike.
pub const ENCODER_PATCH_SIZE: usize = 16;

/// Side length of the low resolution masks produced by the decoder.
pub const LOW_RES_MASK_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamModelType {
    VitB,
    VitL,
    VitH,
    /// TinyViT encoder distilled from `vit_h`.
    MobileSam,
}

/// Per-stage hyper-parameters of the hierarchical TinyViT encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TinyVitStages {
    pub embed_dims: [usize; 4],
    pub depths: [usize; 4],
    pub num_heads: [usize; 4],
    pub window_sizes: [usize; 4],
}

impl SamModelType {
    /// Channel width of the last encoder block.
    pub fn encoder_embed_dim(&self) -> usize {
        match self {
            SamModelType::VitB => 768,
            SamModelType::VitL => 1024,
            SamModelType::VitH => 1280,
            SamModelType::MobileSam => 320,
        }
    }

    /// Number of encoder blocks, summed over stages for TinyViT.
    pub fn encoder_depth(&self) -> usize {
        match self {
            SamModelType::VitB | SamModelType::MobileSam => 12,
            SamModelType::VitL => 24,
            SamModelType::VitH => 32,
        }
    }

    pub fn encoder_num_heads(&self) -> usize {
        match self {
            SamModelType::VitB => 12,
            SamModelType::VitL | SamModelType::VitH => 16,
            SamModelType::MobileSam => 10,
        }
    }

    /// Blocks using global instead of windowed attention. TinyViT has none.
    pub fn encoder_global_attn_indexes(&self) -> &'static [usize] {
        match self {
            SamModelType::VitB => &[2, 5, 8, 11],
            SamModelType::VitL => &[5, 11, 17, 23],
            SamModelType::VitH => &[7, 15, 23, 31],
            SamModelType::MobileSam => &[],
        }
    }

    pub fn tiny_vit_stages(&self) -> Option<TinyVitStages> {
        match self {
            SamModelType::MobileSam => Some(TinyVitStages {
                embed_dims: [64, 128, 160, 320],
                depths: [2, 2, 6, 2],
                num_heads: [2, 4, 5, 10],
                window_sizes: [7, 7, 14, 7],
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SamConfig {
    pub model_type: SamModelType,
    pub mask_threshold: f64,
    pub pad_if_not_divisible: bool,
}

impl Default for SamConfig {
    fn default() -> Self {
        SamConfig {
            model_type: SamModelType::VitH,
            mask_threshold: 0.0,
            pad_if_not_divisible: false,
        }
    }
}

/// Prompts of one image. `K` is shared by every prompt kind given.
#[derive(Clone, Debug, Default)]
pub struct Prompts {
    /// `(K, N, 2)` coordinates and `(K, N)` labels (1 foreground, 0 background)
    pub points: Option<(Tensor, Tensor)>,
    /// `(K, 4)` as `x1, y1, x2, y2`
    pub boxes: Option<Tensor>,
    /// `(K, 1, 256, 256)` low resolution mask logits from a previous pass
    pub masks: Option<Tensor>,
}

impl Prompts {
    pub fn from_points(coords: Tensor, labels: Tensor) -> Self {
        Prompts {
            points: Some((coords, labels)),
            ..Default::default()
        }
    }

    pub fn from_boxes(boxes: Tensor) -> Self {
        Prompts {
            boxes: Some(boxes),
            ..Default::default()
        }
    }

    /// Validate the prompt shapes and return `K`; one mask is predicted
    /// when no prompt is given.
    pub fn num_prompts(&self) -> Result<usize> {
        let mut counts = vec![];
        if let Some((coords, labels)) = &self.points {
            check_shape(coords, &["K", "N", "2"])?;
            let (k, n, _) = coords.dims3()?;
            if labels.dims() != [k, n] {
                return Err(Error::shape("point labels", format!("[{k}, {n}]"), labels.dims()));
            }
            counts.push(("points", k));
        }
        if let Some(boxes) = &self.boxes {
            check_shape(boxes, &["K", "4"])?;
            counts.push(("boxes", boxes.dim(0)?));
        }
        if let Some(masks) = &self.masks {
            check_shape(masks, &["K", "1", "H", "W"])?;
            counts.push(("masks", masks.dim(0)?));
        }
        match counts.split_first() {
            None => Ok(1),
            Some((&(_, k), rest)) => {
                if let Some((what, k_other)) = rest.iter().find(|(_, k_other)| *k_other != k) {
                    return Err(Error::Value(format!(
                        "{what} carry {k_other} prompts while {} carry {k}",
                        counts[0].0
                    )));
                }
                Ok(k)
            }
        }
    }
}

/// Encoder and decoder of a SAM model.
pub trait SamBackend {
    /// `(B, 3, H, W)` images to `(B, C, h, w)` embeddings.
    fn encode(&self, images: &Tensor) -> Result<Tensor>;

    /// Decode the `(1, C, h, w)` embedding of one image, returning mask
    /// logits `(K, M, 256, 256)` and predicted IoU `(K, M)` with `M = 3`
    /// for multimask output and `1` otherwise.
    fn decode(&self, embedding: &Tensor, prompts: &Prompts, multimask_output: bool) -> Result<(Tensor, Tensor)>;
}

/// Decoder output of one image.
#[derive(Clone, Debug)]
pub struct SegmentationResults {
    /// `(K, M, 256, 256)`
    pub logits: Tensor,
    /// `(K, M)`
    pub scores: Tensor,
    pub mask_threshold: f64,
}

impl SegmentationResults {
    /// `logits > mask_threshold` as a `u8` tensor.
    pub fn binary_masks(&self) -> Result<Tensor> {
        self.threshold(&self.logits)
    }

    pub fn threshold(&self, logits: &Tensor) -> Result<Tensor> {
        Ok(logits.gt(self.mask_threshold)?)
    }

    /// Bring the logits back to the resolution of the image before resizing.
    ///
    /// `input_size` is the size of the resized image inside the (padded)
    /// encoder input; when `encoder_size` is given the logits are first
    /// upsampled to it.
    pub fn original_res_logits(
        &self,
        input_size: (usize, usize),
        original_size: (usize, usize),
        encoder_size: Option<(usize, usize)>,
    ) -> Result<Tensor> {
        let mut x = self.logits.clone();
        if let Some((h, w)) = encoder_size {
            x = x.upsample_nearest2d(h, w)?;
        }
        let (_, _, h, w) = x.dims4()?;
        if input_size.0 > h || input_size.1 > w {
            return Err(Error::Value(format!(
                "input_size {input_size:?} exceeds the logits size ({h}, {w})"
            )));
        }
        let x = x.narrow(2, 0, input_size.0)?.narrow(3, 0, input_size.1)?;
        Ok(x.upsample_nearest2d(original_size.0, original_size.1)?)
    }
}

pub struct Sam<B: SamBackend> {
    backend: B,
    config: SamConfig,
}

impl<B: SamBackend> Sam<B> {
    pub fn new(backend: B, config: SamConfig) -> Self {
        tracing::debug!(?config, "SAM");
        Sam { backend, config }
    }

    pub fn config(&self) -> &SamConfig {
        &self.config
    }

    /// Segment `(B, 3, H, W)` images with one prompt set per image.
    pub fn forward(
        &self,
        images: &Tensor,
        prompts: &[Prompts],
        multimask_output: bool,
    ) -> Result<Vec<SegmentationResults>> {
        check_shape(images, &["B", "3", "H", "W"])?;
        check_float(images)?;
        let b = images.dim(0)?;
        if b != prompts.len() {
            return Err(Error::PromptCount {
                images: b,
                prompts: prompts.len(),
            });
        }
        let images = fit_to_stride(images, ENCODER_PATCH_SIZE, self.config.pad_if_not_divisible)?;
        let embeddings = self.backend.encode(&images)?;
        if embeddings.dims().first() != Some(&b) {
            return Err(Error::shape("image embeddings", format!("[{b}, C, h, w]"), embeddings.dims()));
        }
        let num_masks = if multimask_output { 3 } else { 1 };
        let mut results = Vec::with_capacity(b);
        for (i_img, prompts) in prompts.iter().enumerate() {
            let k = prompts.num_prompts()?;
            let embedding = embeddings.narrow(0, i_img, 1)?;
            let (logits, scores) = self.backend.decode(&embedding, prompts, multimask_output)?;
            check_shape(&logits, &["K", "M", "H", "W"])?;
            if logits.dims()[..2] != [k, num_masks] {
                return Err(Error::shape(
                    "mask logits",
                    format!("[{k}, {num_masks}, H, W]"),
                    logits.dims(),
                ));
            }
            if scores.dims() != [k, num_masks] {
                return Err(Error::shape("iou predictions", format!("[{k}, {num_masks}]"), scores.dims()));
            }
            tracing::trace!(image = i_img, prompts = k, "decoded masks");
            results.push(SegmentationResults {
                logits,
                scores,
                mask_threshold: self.config.mask_threshold,
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::rand_tensor;
    use candle_core::{DType, Device};

    /// Pools the image by the patch stride and predicts empty masks.
    struct Pooling;

    impl SamBackend for Pooling {
        fn encode(&self, images: &Tensor) -> Result<Tensor> {
            let (_, _, h, w) = images.dims4()?;
            assert_eq!((h % ENCODER_PATCH_SIZE, w % ENCODER_PATCH_SIZE), (0, 0));
            Ok(images.avg_pool2d(ENCODER_PATCH_SIZE)?)
        }

        fn decode(&self, embedding: &Tensor, prompts: &Prompts, multimask_output: bool) -> Result<(Tensor, Tensor)> {
            let k = prompts.num_prompts()?;
            let m = if multimask_output { 3 } else { 1 };
            let s = LOW_RES_MASK_SIZE;
            let level = embedding.mean_all()?.to_dtype(DType::F32)?;
            let logits = level.broadcast_as((k, m, s, s))?.contiguous()?;
            let scores = Tensor::ones((k, m), DType::F32, embedding.device())?;
            Ok((logits, scores))
        }
    }

    fn points(k: usize, n: usize) -> candle_core::Result<Prompts> {
        let dev = Device::Cpu;
        let coords = Tensor::ones((k, n, 2), DType::F32, &dev)?;
        let labels = Tensor::ones((k, n), DType::F32, &dev)?;
        Ok(Prompts::from_points(coords, labels))
    }

    #[test]
    fn wrong_shape() -> anyhow::Result<()> {
        let sam = Sam::new(Pooling, SamConfig::default());
        let images = rand_tensor(&[3, 1, 2], 0)?;
        let err = sam.forward(&images, &[], false).unwrap_err();
        assert_eq!(err.to_string(), "shape must be [B, 3, H, W]. Got [3, 1, 2]");
        Ok(())
    }

    #[test]
    fn prompt_count_mismatch() -> anyhow::Result<()> {
        let sam = Sam::new(Pooling, SamConfig::default());
        let images = rand_tensor(&[2, 3, 32, 32], 0)?;
        let err = sam.forward(&images, &[points(1, 1)?], false).unwrap_err();
        assert!(matches!(err, Error::PromptCount { images: 2, prompts: 1 }));
        assert!(err
            .to_string()
            .starts_with("The number of images (`B`) should match with the length of prompts!"));
        Ok(())
    }

    #[test]
    fn cardinality() -> anyhow::Result<()> {
        let sam = Sam::new(Pooling, SamConfig::default());
        let images = rand_tensor(&[2, 3, 32, 48], 1)?;
        let boxes = Tensor::new(&[[0f32, 0., 10., 10.], [5., 5., 20., 30.], [1., 2., 3., 4.]], &Device::Cpu)?;
        let prompts = [points(2, 4)?, Prompts::from_boxes(boxes)];
        for multimask in [false, true] {
            let m = if multimask { 3 } else { 1 };
            let results = sam.forward(&images, &prompts, multimask)?;
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].logits.dims(), &[2, m, 256, 256]);
            assert_eq!(results[1].logits.dims(), &[3, m, 256, 256]);
            assert_eq!(results[1].scores.dims(), &[3, m]);
        }
        Ok(())
    }

    #[test]
    fn inconsistent_prompts() -> anyhow::Result<()> {
        let mut prompts = points(2, 1)?;
        prompts.boxes = Some(Tensor::zeros((3, 4), DType::F32, &Device::Cpu)?);
        assert!(matches!(prompts.num_prompts(), Err(Error::Value(_))));
        let labels = Tensor::ones((2, 2), DType::F32, &Device::Cpu)?;
        let prompts = Prompts::from_points(Tensor::ones((2, 1, 2), DType::F32, &Device::Cpu)?, labels);
        assert!(matches!(prompts.num_prompts(), Err(Error::Shape { .. })));
        assert_eq!(Prompts::default().num_prompts()?, 1);
        Ok(())
    }

    #[test]
    fn padding() -> anyhow::Result<()> {
        let images = rand_tensor(&[1, 3, 30, 40], 2)?;
        let sam = Sam::new(Pooling, SamConfig::default());
        assert!(matches!(sam.forward(&images, &[Prompts::default()], false), Err(Error::Value(_))));
        let config = SamConfig {
            pad_if_not_divisible: true,
            ..Default::default()
        };
        let sam = Sam::new(Pooling, config);
        let results = sam.forward(&images, &[Prompts::default()], false)?;
        assert_eq!(results[0].logits.dims(), &[1, 1, 256, 256]);
        Ok(())
    }

    #[test]
    fn masks_at_original_resolution() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        // left half positive
        let row: Vec<f32> = (0..256).map(|j| if j < 128 { 1. } else { -1. }).collect();
        let logits = Tensor::new(row.as_slice(), &dev)?
            .reshape((1, 1, 1, 256))?
            .broadcast_as((1, 1, 256, 256))?
            .contiguous()?;
        let res = SegmentationResults {
            logits,
            scores: Tensor::ones((1, 1), DType::F32, &dev)?,
            mask_threshold: 0.0,
        };
        let masks = res.binary_masks()?;
        assert_eq!(masks.dtype(), DType::U8);
        assert_eq!(masks.to_dtype(DType::F32)?.sum_all()?.to_vec0::<f32>()?, 128. * 256.);
        // a 1024x512 image resized into the 1024 encoder input occupies its left half
        let x = res.original_res_logits((1024, 512), (200, 100), Some((1024, 1024)))?;
        assert_eq!(x.dims(), &[1, 1, 200, 100]);
        let positive = res.threshold(&x)?.to_dtype(DType::F32)?.sum_all()?.to_vec0::<f32>()?;
        assert_eq!(positive, 200. * 100.);
        assert!(res.original_res_logits((2048, 10), (10, 10), None).is_err());
        Ok(())
    }

    #[test]
    fn config_from_json() -> anyhow::Result<()> {
        let config: SamConfig = serde_json::from_str(r#"{"model_type": "vit_l", "mask_threshold": 0.5}"#)?;
        assert_eq!(config.model_type, SamModelType::VitL);
        assert_eq!(config.model_type.encoder_global_attn_indexes(), &[5, 11, 17, 23]);
        assert!(config.model_type.tiny_vit_stages().is_none());
        assert!(!config.pad_if_not_divisible);

        let config: SamConfig = serde_json::from_str(r#"{"model_type": "mobile_sam"}"#)?;
        assert_eq!(config.model_type, SamModelType::MobileSam);
        assert!(config.model_type.encoder_global_attn_indexes().is_empty());
        let stages = config.model_type.tiny_vit_stages().unwrap();
        assert_eq!(stages.embed_dims[3], config.model_type.encoder_embed_dim());
        assert_eq!(stages.depths.iter().sum::<usize>(), config.model_type.encoder_depth());
        assert_eq!(stages.num_heads[3], config.model_type.encoder_num_heads());
        assert_eq!(stages.window_sizes, [7, 7, 14, 7]);
        assert_eq!(serde_json::to_string(&SamModelType::MobileSam)?, r#""mobile_sam""#);
        Ok(())
    }
}
