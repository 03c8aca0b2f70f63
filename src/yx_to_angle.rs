use candle_core::{CpuStorage, Layout, Shape, Tensor};
use num_traits::Float;

/// `atan2(y, x)` elementwise, `y` is the first argument of `apply_op2`.
pub struct Layer {}

fn atan2<T: Float>(y: &[T], x: &[T]) -> Vec<T> {
    y.iter().zip(x.iter()).map(|(&y, &x)| y.atan2(x)).collect()
}

impl candle_core::CustomOp2 for Layer {
    fn name(&self) -> &'static str {
        "yx_to_angle"
    }

    fn cpu_fwd(
        &self,
        s_y: &CpuStorage,
        l_y: &Layout,
        s_x: &CpuStorage,
        l_x: &Layout,
    ) -> candle_core::Result<(CpuStorage, Shape)> {
        if l_y.shape() != l_x.shape() {
            candle_core::bail!("yx_to_angle: shape mismatch {:?} {:?}", l_y.shape(), l_x.shape());
        }
        let (Some((y0, y1)), Some((x0, x1))) = (l_y.contiguous_offsets(), l_x.contiguous_offsets())
        else {
            candle_core::bail!("yx_to_angle expects contiguous tensors");
        };
        let storage = match (s_y, s_x) {
            (CpuStorage::F32(y), CpuStorage::F32(x)) => {
                candle_core::WithDType::to_cpu_storage_owned(atan2(&y[y0..y1], &x[x0..x1]))
            }
            (CpuStorage::F64(y), CpuStorage::F64(x)) => {
                candle_core::WithDType::to_cpu_storage_owned(atan2(&y[y0..y1], &x[x0..x1]))
            }
            _ => candle_core::bail!("yx_to_angle only supports f32 or f64 pairs"),
        };
        Ok((storage, l_y.shape().clone()))
    }

    /// d/dy = x / (x^2 + y^2), d/dx = -y / (x^2 + y^2)
    fn bwd(
        &self,
        y: &Tensor,
        x: &Tensor,
        _angle: &Tensor,
        dw_angle: &Tensor,
    ) -> candle_core::Result<(Option<Tensor>, Option<Tensor>)> {
        let r2 = (x.sqr()? + y.sqr()?)?;
        let dw_y = x.div(&r2)?.mul(dw_angle)?;
        let dw_x = y.neg()?.div(&r2)?.mul(dw_angle)?;
        Ok((Some(dw_y), Some(dw_x)))
    }
}

/// `atan2(y, x)` with autodiff, inputs of equal shape.
pub fn atan2_tensor(y: &Tensor, x: &Tensor) -> candle_core::Result<Tensor> {
    y.contiguous()?.apply_op2(&x.contiguous()?, Layer {})
}

#[test]
fn quadrants() -> anyhow::Result<()> {
    let dev = candle_core::Device::Cpu;
    let y = Tensor::new(&[0f32, 1., 0., -1., 0.], &dev)?;
    let x = Tensor::new(&[1f32, 0., -1., 0., 0.], &dev)?;
    let a = atan2_tensor(&y, &x)?.to_vec1::<f32>()?;
    let pi = std::f32::consts::PI;
    let expected = [0., pi / 2., pi, -pi / 2., 0.];
    for (a, b) in a.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1.0e-6);
    }
    Ok(())
}

#[test]
fn gradient() -> anyhow::Result<()> {
    let dev = candle_core::Device::Cpu;
    let y = candle_core::Var::new(&[0.3f64, -1.2], &dev)?;
    let x = candle_core::Var::new(&[0.7f64, 0.4], &dev)?;
    let angle = atan2_tensor(&y, &x)?;
    let grads = angle.sum_all()?.backward()?;
    let dw_y = grads.get(&y).unwrap().to_vec1::<f64>()?;
    let dw_x = grads.get(&x).unwrap().to_vec1::<f64>()?;
    let eps = 1.0e-6;
    for (i, (&yy, &xx)) in [0.3f64, -1.2].iter().zip([0.7f64, 0.4].iter()).enumerate() {
        let fd_y = ((yy + eps).atan2(xx) - (yy - eps).atan2(xx)) / (2. * eps);
        let fd_x = (yy.atan2(xx + eps) - yy.atan2(xx - eps)) / (2. * eps);
        assert!((fd_y - dw_y[i]).abs() < 1.0e-6);
        assert!((fd_x - dw_x[i]).abs() < 1.0e-6);
    }
    Ok(())
}
