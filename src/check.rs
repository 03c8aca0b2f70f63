//! Eager validation helpers used at the entry of every transform.

use candle_core::Tensor;

use crate::error::{Error, Result};

/// Check `x` against a symbolic shape such as `["B", "3", "H", "W"]`.
///
/// Numeric entries must match exactly, other entries match any size.
/// A leading `"*"` accepts any number of extra leading dimensions.
pub fn check_shape(x: &Tensor, pattern: &[&str]) -> Result<()> {
    let dims = x.dims();
    let expected = format!("[{}]", pattern.join(", "));
    let (pattern, dims) = match pattern.split_first() {
        Some((&"*", rest)) => {
            if dims.len() < rest.len() {
                return Err(Error::shape("shape", expected, dims));
            }
            (rest, &dims[dims.len() - rest.len()..])
        }
        _ => {
            if dims.len() != pattern.len() {
                return Err(Error::shape("shape", expected, dims));
            }
            (pattern, dims)
        }
    };
    for (sym, &d) in pattern.iter().zip(dims.iter()) {
        if let Ok(v) = sym.parse::<usize>() {
            if v != d {
                return Err(Error::shape("shape", expected, x.dims()));
            }
        }
    }
    Ok(())
}

/// Floating point tensors only; integer tensors are a type error.
pub fn check_float(x: &Tensor) -> Result<()> {
    if !x.dtype().is_float() {
        return Err(Error::Type(format!(
            "Input type is not a float tensor. Got {:?}",
            x.dtype()
        )));
    }
    Ok(())
}

/// Make the two trailing (spatial) dims of `images` multiples of `stride`.
///
/// With `pad` set the image is zero padded on the right and bottom,
/// otherwise an indivisible size is a value error.
pub fn fit_to_stride(images: &Tensor, stride: usize, pad: bool) -> Result<Tensor> {
    let rank = images.rank();
    if rank < 2 {
        return Err(Error::shape("shape", "[*, H, W]", images.dims()));
    }
    let (h, w) = (images.dim(rank - 2)?, images.dim(rank - 1)?);
    let pd_h = (stride - h % stride) % stride;
    let pd_w = (stride - w % stride) % stride;
    if pd_h == 0 && pd_w == 0 {
        return Ok(images.clone());
    }
    if !pad {
        return Err(Error::Value(format!(
            "input height and width must be divisible by {stride}, got {h}x{w}. \
             Pass pad_if_not_divisible to pad the image"
        )));
    }
    tracing::trace!(pd_h, pd_w, "padding image to stride {stride}");
    let out = images
        .pad_with_zeros(rank - 2, 0, pd_h)?
        .pad_with_zeros(rank - 1, 0, pd_w)?;
    Ok(out)
}

#[test]
fn shape_pattern() -> anyhow::Result<()> {
    let dev = candle_core::Device::Cpu;
    let x = Tensor::zeros((2, 3, 4, 5), candle_core::DType::F32, &dev)?;
    check_shape(&x, &["B", "3", "H", "W"])?;
    check_shape(&x, &["*", "3", "H", "W"])?;
    check_shape(&x, &["*", "H", "W"])?;
    assert!(check_shape(&x, &["B", "1", "H", "W"]).is_err());
    assert!(check_shape(&x, &["3", "H", "W"]).is_err());
    let y = Tensor::zeros((3, 1, 2), candle_core::DType::F32, &dev)?;
    let err = check_shape(&y, &["B", "3", "H", "W"]).unwrap_err();
    assert_eq!(err.to_string(), "shape must be [B, 3, H, W]. Got [3, 1, 2]");
    Ok(())
}

#[test]
fn stride_padding() -> anyhow::Result<()> {
    let dev = candle_core::Device::Cpu;
    let x = Tensor::ones((1, 3, 72, 64), candle_core::DType::F32, &dev)?;
    assert!(matches!(fit_to_stride(&x, 16, false), Err(Error::Value(_))));
    let y = fit_to_stride(&x, 16, true)?;
    assert_eq!(y.dims(), &[1, 3, 80, 64]);
    // original content kept, padding is zero
    assert_eq!(y.narrow(2, 0, 72)?.sum_all()?.to_vec0::<f32>()?, 3. * 72. * 64.);
    assert_eq!(y.narrow(2, 72, 8)?.sum_all()?.to_vec0::<f32>()?, 0.);
    let z = fit_to_stride(&y, 16, false)?;
    assert_eq!(z.dims(), y.dims());
    Ok(())
}

#[test]
fn integer_tensor_is_type_error() -> anyhow::Result<()> {
    let x = Tensor::new(&[1u32, 2, 3], &candle_core::Device::Cpu)?;
    assert!(matches!(check_float(&x), Err(Error::Type(_))));
    Ok(())
}
