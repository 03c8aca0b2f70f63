//! Image files and JSON configs.

use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Load an image as a `(3, H, W)` f32 tensor in `[0, 1]`.
pub fn load_image<P: AsRef<Path>>(path: P, device: &Device) -> Result<Tensor> {
    let img = image::open(path.as_ref())?.to_rgb32f();
    let (width, height) = img.dimensions();
    let (width, height) = (width as usize, height as usize);
    tracing::debug!(path = %path.as_ref().display(), width, height, "loaded image");
    let img = Tensor::from_vec(img.into_raw(), (height, width, 3), device)?;
    Ok(img.permute((2, 0, 1))?.contiguous()?)
}

/// Save a `(3, H, W)` or `(1, H, W)` float tensor in `[0, 1]` as 8 bit image.
pub fn save_image<P: AsRef<Path>>(path: P, img: &Tensor) -> Result<()> {
    let (c, h, w) = img.dims3()?;
    let bytes = img
        .clamp(0f32, 1f32)?
        .affine(255., 0.5)?
        .permute((1, 2, 0))?
        .to_dtype(DType::U8)?
        .flatten_all()?
        .to_vec1::<u8>()?;
    let (w, h) = (w as u32, h as u32);
    match c {
        3 => image::RgbImage::from_raw(w, h, bytes).map(|v| v.save(path.as_ref())),
        1 => image::GrayImage::from_raw(w, h, bytes).map(|v| v.save(path.as_ref())),
        _ => return Err(Error::shape("image", "[3, H, W] or [1, H, W]", img.dims())),
    }
    .ok_or_else(|| Error::Value("image buffer does not match its size".to_string()))??;
    tracing::debug!(path = %path.as_ref().display(), "saved image");
    Ok(())
}

/// Read a JSON config, missing fields take their defaults.
pub fn load_config<T: serde::de::DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[test]
fn image_round_trip() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let img = crate::testing::rand_tensor(&[3, 7, 5], 11)?;
    let path = std::env::temp_dir().join("candle_imgproc_round_trip.png");
    save_image(&path, &img)?;
    let loaded = load_image(&path, &dev)?;
    assert_eq!(loaded.dims(), &[3, 7, 5]);
    crate::testing::assert_close(&loaded, &img, 0.5 / 255. + 1.0e-6)?;
    let gray = img.narrow(0, 0, 1)?;
    save_image(&path, &gray)?;
    let loaded = load_image(&path, &dev)?;
    crate::testing::assert_close(&loaded.narrow(0, 2, 1)?, &gray, 0.5 / 255. + 1.0e-6)?;
    assert!(matches!(save_image(&path, &crate::testing::rand_tensor(&[2, 3, 3], 0)?), Err(Error::Shape { .. })));
    Ok(())
}

#[test]
fn config_file() -> anyhow::Result<()> {
    let path = std::env::temp_dir().join("candle_imgproc_disk.json");
    std::fs::write(&path, r#"{"desc_dim": 64, "pad_if_not_divisible": true}"#)?;
    let config: crate::disk::DiskConfig = load_config(&path)?;
    assert_eq!(config.desc_dim, 64);
    assert_eq!(config.window_size, 5);
    assert!(config.pad_if_not_divisible);
    let missing = load_config::<crate::disk::DiskConfig, _>(std::env::temp_dir().join("no_such_config.json"));
    assert!(matches!(missing, Err(Error::Io(_))));
    Ok(())
}
