//! Local affine frames (LAF): `(B, N, 2, 3)` tensors, `[.., :2]` is the linear
//! part and `[.., 2]` the centre in pixel coordinates. Angles are in degrees.

use candle_core::{Tensor, D};

use crate::check::check_shape;
use crate::error::{Error, Result};

pub fn check_laf(laf: &Tensor) -> Result<()> {
    check_shape(laf, &["B", "N", "2", "3"])
}

/// Orientation of every frame, `atan2(a01, a00)` in degrees, shape `(B, N)`.
pub fn get_laf_orientation(laf: &Tensor) -> Result<Tensor> {
    check_laf(laf)?;
    let row0 = laf.narrow(2, 0, 1)?.squeeze(2)?;
    let a00 = row0.narrow(2, 0, 1)?.squeeze(2)?;
    let a01 = row0.narrow(2, 1, 1)?.squeeze(2)?;
    let angle = crate::yx_to_angle::atan2_tensor(&a01, &a00)?;
    Ok((angle * (180. / std::f64::consts::PI))?)
}

/// `[[cos, sin], [-sin, cos]]` for every angle, shape `(*, 2, 2)`.
pub fn angle_to_rotation_matrix(angle: &Tensor) -> Result<Tensor> {
    let rad = (angle * (std::f64::consts::PI / 180.))?;
    let (c, s) = (rad.cos()?, rad.sin()?);
    let mut dims = angle.dims().to_vec();
    dims.extend([2, 2]);
    let rot = Tensor::stack(&[&c, &s, &s.neg()?, &c], D::Minus1)?;
    Ok(rot.reshape(dims)?)
}

/// Right-multiply the linear part of every frame by the rotation of `angles` `(B, N)`.
pub fn rotate_laf(laf: &Tensor, angles: &Tensor) -> Result<Tensor> {
    check_laf(laf)?;
    let (b, n, _, _) = laf.dims4()?;
    if angles.dims() != [b, n] {
        return Err(Error::Shape {
            what: "angles".to_string(),
            expected: format!("[{b}, {n}]"),
            actual: format!("{:?}", angles.dims()),
        });
    }
    let rot = angle_to_rotation_matrix(&angles.to_dtype(laf.dtype())?)?;
    let linear = laf.narrow(3, 0, 2)?.contiguous()?.matmul(&rot.contiguous()?)?;
    let center = laf.narrow(3, 2, 1)?;
    Ok(Tensor::cat(&[&linear, &center], 3)?)
}

/// Rotate every frame so that its orientation becomes `angles` `(B, N)`.
pub fn set_laf_orientation(laf: &Tensor, angles: &Tensor) -> Result<Tensor> {
    let current = get_laf_orientation(laf)?;
    rotate_laf(laf, &(angles.to_dtype(laf.dtype())? - current)?)
}

/// Frames from centres `(B, N, 2)`, isotropic scales `(B, N)` and orientations `(B, N)`.
pub fn laf_from_center_scale_ori(xy: &Tensor, scale: &Tensor, ori: &Tensor) -> Result<Tensor> {
    check_shape(xy, &["B", "N", "2"])?;
    let (b, n, _) = xy.dims3()?;
    for (what, t) in [("scale", scale), ("ori", ori)] {
        if t.dims() != [b, n] {
            return Err(Error::Shape {
                what: what.to_string(),
                expected: format!("[{b}, {n}]"),
                actual: format!("{:?}", t.dims()),
            });
        }
    }
    let rot = angle_to_rotation_matrix(ori)?;
    let linear = rot.broadcast_mul(&scale.reshape((b, n, 1, 1))?)?;
    Ok(Tensor::cat(&[&linear, &xy.unsqueeze(3)?], 3)?)
}
