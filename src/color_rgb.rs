//! Conversions between RGB, BGR, RGBA, linear RGB, 8-bit range RGB and
//! normal maps. Every image is a float tensor laid out as `(*, C, H, W)`.

use candle_core::{DType, Tensor};

use crate::check::check_float;
use crate::error::{Error, Result};

/// Alpha channel appended by [`rgb_to_rgba`]: a constant or a `(*, 1, H, W)` map.
#[derive(Clone, Debug)]
pub enum Alpha {
    Value(f64),
    Map(Tensor),
}

impl From<f64> for Alpha {
    fn from(v: f64) -> Self {
        Alpha::Value(v)
    }
}

impl From<f32> for Alpha {
    fn from(v: f32) -> Self {
        Alpha::Value(v as f64)
    }
}

impl From<Tensor> for Alpha {
    fn from(t: Tensor) -> Self {
        Alpha::Map(t)
    }
}

impl From<&Tensor> for Alpha {
    fn from(t: &Tensor) -> Self {
        Alpha::Map(t.clone())
    }
}

/// Returns the index of the channel dimension after checking `(*, channels, H, W)`.
fn check_color(image: &Tensor, channels: usize) -> Result<usize> {
    check_float(image)?;
    let dims = image.dims();
    if dims.len() < 3 || dims[dims.len() - 3] != channels {
        return Err(Error::shape(
            "input size",
            format!("(*, {channels}, H, W)"),
            dims,
        ));
    }
    Ok(dims.len() - 3)
}

pub fn rgb_to_bgr(image: &Tensor) -> Result<Tensor> {
    let c = check_color(image, 3)?;
    let bgr = Tensor::cat(
        &[image.narrow(c, 2, 1)?, image.narrow(c, 1, 1)?, image.narrow(c, 0, 1)?],
        c,
    )?;
    Ok(bgr)
}

/// The channel swap is its own inverse.
pub fn bgr_to_rgb(image: &Tensor) -> Result<Tensor> {
    rgb_to_bgr(image)
}

pub fn rgb_to_rgba(image: &Tensor, alpha: impl Into<Alpha>) -> Result<Tensor> {
    let c = check_color(image, 3)?;
    let first = image.narrow(c, 0, 1)?;
    let a = match alpha.into() {
        Alpha::Value(v) => (first.ones_like()? * v)?,
        Alpha::Map(a) => {
            check_float(&a)?;
            if a.dims() != first.dims() {
                return Err(Error::Shape {
                    what: "alpha map".to_string(),
                    expected: format!("{:?}", first.dims()),
                    actual: format!("{:?}", a.dims()),
                });
            }
            if a.dtype() != image.dtype() {
                return Err(Error::Type(format!(
                    "alpha map dtype {:?} does not match image dtype {:?}",
                    a.dtype(),
                    image.dtype()
                )));
            }
            a
        }
    };
    Ok(Tensor::cat(&[image, &a], c)?)
}

pub fn bgr_to_rgba(image: &Tensor, alpha: impl Into<Alpha>) -> Result<Tensor> {
    rgb_to_rgba(&bgr_to_rgb(image)?, alpha)
}

pub fn rgba_to_rgb(image: &Tensor) -> Result<Tensor> {
    let c = check_color(image, 4)?;
    Ok(image.narrow(c, 0, 3)?)
}

pub fn rgba_to_bgr(image: &Tensor) -> Result<Tensor> {
    rgb_to_bgr(&rgba_to_rgb(image)?)
}

/// The curve op runs in f32 for half precision inputs and casts back.
fn apply_curve(image: &Tensor, curve: crate::rgb_to_linear::Curve) -> Result<Tensor> {
    check_color(image, 3)?;
    let dtype = image.dtype();
    let image = match dtype {
        DType::F16 | DType::BF16 => image.to_dtype(DType::F32)?,
        _ => image.contiguous()?,
    };
    let layer = crate::rgb_to_linear::Layer { curve, derivative: false };
    Ok(image.apply_op1(layer)?.to_dtype(dtype)?)
}

/// Removes the sRGB gamma curve.
pub fn rgb_to_linear_rgb(image: &Tensor) -> Result<Tensor> {
    apply_curve(image, crate::rgb_to_linear::Curve::Decode)
}

/// Applies the sRGB gamma curve.
pub fn linear_rgb_to_rgb(image: &Tensor) -> Result<Tensor> {
    apply_curve(image, crate::rgb_to_linear::Curve::Encode)
}

/// `[0, 1]` -> `[0, 255]`
pub fn rgb_to_rgb255(image: &Tensor) -> Result<Tensor> {
    check_color(image, 3)?;
    Ok(image.affine(255., 0.)?)
}

/// `[0, 255]` -> `[0, 1]`
pub fn rgb255_to_rgb(image: &Tensor) -> Result<Tensor> {
    check_color(image, 3)?;
    Ok((image / 255.)?)
}

/// Unit normals in `[-1, 1]` to colors in `[0, 255]`.
pub fn normals_to_rgb255(image: &Tensor) -> Result<Tensor> {
    check_color(image, 3)?;
    Ok(image.affine(0.5 * 255., 0.5 * 255.)?)
}

pub fn rgb255_to_normals(image: &Tensor) -> Result<Tensor> {
    check_color(image, 3)?;
    Ok(((image / 255.)? * 2.)?.affine(1., -1.)?)
}

macro_rules! color_module {
    ($(#[$doc:meta])* $name:ident, $func:path) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, Default)]
        pub struct $name;

        impl candle_core::Module for $name {
            fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
                $func(xs).map_err(candle_core::Error::wrap)
            }
        }
    };
}

color_module!(RgbToBgr, rgb_to_bgr);
color_module!(BgrToRgb, bgr_to_rgb);
color_module!(RgbaToRgb, rgba_to_rgb);
color_module!(RgbaToBgr, rgba_to_bgr);
color_module!(RgbToLinearRgb, rgb_to_linear_rgb);
color_module!(LinearRgbToRgb, linear_rgb_to_rgb);
color_module!(RgbToRgb255, rgb_to_rgb255);
color_module!(Rgb255ToRgb, rgb255_to_rgb);
color_module!(NormalsToRgb255, normals_to_rgb255);
color_module!(Rgb255ToNormals, rgb255_to_normals);

/// Module form of [`rgb_to_rgba`] with a fixed alpha.
#[derive(Clone, Debug)]
pub struct RgbToRgba {
    pub alpha: Alpha,
}

impl RgbToRgba {
    pub fn new(alpha: impl Into<Alpha>) -> Self {
        Self { alpha: alpha.into() }
    }
}

impl candle_core::Module for RgbToRgba {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        rgb_to_rgba(xs, self.alpha.clone()).map_err(candle_core::Error::wrap)
    }
}

#[derive(Clone, Debug)]
pub struct BgrToRgba {
    pub alpha: Alpha,
}

impl BgrToRgba {
    pub fn new(alpha: impl Into<Alpha>) -> Self {
        Self { alpha: alpha.into() }
    }
}

impl candle_core::Module for BgrToRgba {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        bgr_to_rgba(xs, self.alpha.clone()).map_err(candle_core::Error::wrap)
    }
}
