use candle_core::{CpuStorage, Layout, Shape, Tensor};
use num_traits::AsPrimitive;

/// Direction of the sRGB transfer curve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Curve {
    /// gamma encoded sRGB -> linear light
    Decode,
    /// linear light -> gamma encoded sRGB
    Encode,
}

const DECODE_THRESHOLD: f64 = 0.04045;
const ENCODE_THRESHOLD: f64 = 0.0031308;
const GAMMA: f64 = 2.4;

/// Elementwise sRGB transfer curve. With `derivative` set the layer evaluates
/// the slope of the curve, which is what the backward pass needs.
pub struct Layer {
    pub curve: Curve,
    pub derivative: bool,
}

impl Layer {
    fn eval(&self, x: f64) -> f64 {
        match (self.curve, self.derivative) {
            (Curve::Decode, false) => {
                if x > DECODE_THRESHOLD {
                    ((x + 0.055) / 1.055).powf(GAMMA)
                } else {
                    x / 12.92
                }
            }
            (Curve::Decode, true) => {
                if x > DECODE_THRESHOLD {
                    GAMMA / 1.055 * ((x + 0.055) / 1.055).powf(GAMMA - 1.0)
                } else {
                    1.0 / 12.92
                }
            }
            (Curve::Encode, false) => {
                if x > ENCODE_THRESHOLD {
                    1.055 * x.max(ENCODE_THRESHOLD).powf(1.0 / GAMMA) - 0.055
                } else {
                    12.92 * x
                }
            }
            (Curve::Encode, true) => {
                if x > ENCODE_THRESHOLD {
                    1.055 / GAMMA * x.powf(1.0 / GAMMA - 1.0)
                } else {
                    12.92
                }
            }
        }
    }

    fn map<T>(&self, vals: &[T]) -> Vec<T>
    where
        T: Copy + AsPrimitive<f64>,
        f64: AsPrimitive<T>,
    {
        vals.iter().map(|&v| self.eval(v.as_()).as_()).collect()
    }
}

impl candle_core::CustomOp1 for Layer {
    fn name(&self) -> &'static str {
        match self.curve {
            Curve::Decode => "rgb_to_linear",
            Curve::Encode => "linear_to_rgb",
        }
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout)
               -> candle_core::Result<(CpuStorage, Shape)>
    {
        let Some((start, end)) = layout.contiguous_offsets() else {
            candle_core::bail!("{} expects a contiguous tensor", self.name());
        };
        let storage = match storage {
            CpuStorage::F32(vals) => {
                candle_core::WithDType::to_cpu_storage_owned(self.map(&vals[start..end]))
            }
            CpuStorage::F64(vals) => {
                candle_core::WithDType::to_cpu_storage_owned(self.map(&vals[start..end]))
            }
            _ => candle_core::bail!("{} only supports f32 and f64", self.name()),
        };
        Ok((storage, layout.shape().clone()))
    }

    fn bwd(&self, rgb: &Tensor, _res: &Tensor, dw_res: &Tensor)
           -> candle_core::Result<Option<Tensor>> {
        let slope = rgb.apply_op1(Layer { curve: self.curve, derivative: true })?;
        Ok(Some(slope.mul(dw_res)?))
    }
}

#[test]
fn known_values() -> anyhow::Result<()> {
    let x = Tensor::new(&[1.0f32, 0.0, 0.5, 0.1, 0.2, 0.3], &candle_core::Device::Cpu)?;
    let lin = x.apply_op1(Layer { curve: Curve::Decode, derivative: false })?;
    let lin = lin.to_vec1::<f32>()?;
    let expected = [1.0f32, 0.0, 0.21404116, 0.01002283, 0.03310477, 0.07323898];
    for (a, b) in lin.iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1.0e-6, "{a} {b}");
    }
    Ok(())
}

#[test]
fn curve_is_continuous_at_threshold() {
    for curve in [Curve::Decode, Curve::Encode] {
        let layer = Layer { curve, derivative: false };
        let th = match curve {
            Curve::Decode => DECODE_THRESHOLD,
            Curve::Encode => ENCODE_THRESHOLD,
        };
        let below = layer.eval(th - 1.0e-9);
        let above = layer.eval(th + 1.0e-9);
        assert!((below - above).abs() < 1.0e-5, "{curve:?} {below} {above}");
    }
}

#[test]
fn gradient_matches_finite_difference() -> anyhow::Result<()> {
    let vals = vec![0.01f64, 0.03, 0.2, 0.5, 0.9];
    for curve in [Curve::Decode, Curve::Encode] {
        let x = candle_core::Var::from_slice(vals.as_slice(), vals.len(), &candle_core::Device::Cpu)?;
        let y = x.apply_op1(Layer { curve, derivative: false })?;
        let grad = y.sum_all()?.backward()?;
        let dw_x = grad.get(&x).unwrap().to_vec1::<f64>()?;
        let layer = Layer { curve, derivative: false };
        let eps = 1.0e-6;
        for (i, &v) in vals.iter().enumerate() {
            let fd = (layer.eval(v + eps) - layer.eval(v - eps)) / (2.0 * eps);
            assert!((fd - dw_x[i]).abs() < 1.0e-5, "{curve:?} {v} {fd} {}", dw_x[i]);
        }
    }
    Ok(())
}
