//! Layer normalization that stays on the autograd tape.
//!
//! `candle_nn::LayerNorm` dispatches to a fused kernel without a backward
//! pass, which would silently freeze every parameter below it during
//! fine-tuning. This version is composed of primitive ops so gradients reach
//! the embeddings and every encoder layer.
//!
//! The statistics are always computed in f32 and the result is cast back to
//! the input dtype, so half-precision activations normalize stably.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use twinhead_rs::normalization::LayerNorm;
//!
//! # fn main() -> twinhead_rs::Result<()> {
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let norm = LayerNorm::new(8, 1e-12, vb.pp("LayerNorm"))?;
//!
//! let x = Tensor::arange(0f32, 16f32, &Device::Cpu)?.reshape((2, 8))?;
//! let y = norm.forward(&x)?;
//! assert_eq!(y.dims(), &[2, 8]);
//! # Ok(())
//! # }
//! ```

use candle_core::{DType, Tensor, D};
use candle_nn::{Init, VarBuilder};

use crate::error::Result;

/// Layer normalization over the last dimension with learned scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Create the layer with parameters `weight` (ones) and `bias` (zeros).
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    /// Normalize `x` over its last dimension.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        let normed = centered.broadcast_div(&std)?;
        let out = normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(out.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    fn norm(size: usize) -> (VarMap, LayerNorm) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LayerNorm::new(size, 1e-12, vb).unwrap();
        (varmap, layer)
    }

    #[test]
    fn test_output_has_zero_mean_unit_variance() {
        let (_varmap, layer) = norm(4);
        let x = Tensor::new(&[[1f32, 2., 3., 4.], [10., 10., 12., 8.]], &Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap();
        let rows = y.to_vec2::<f32>().unwrap();
        for row in rows {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_gradients_reach_input_and_parameters() {
        let (varmap, layer) = norm(3);
        let x = Var::new(&[[0.5f32, -1.0, 2.0]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[1f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let y = layer.forward(x.as_tensor()).unwrap();
        let loss = (y - target).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(x.as_tensor()).is_some());
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_half_precision_input_keeps_dtype() {
        let (_varmap, layer) = norm(2);
        let x = Tensor::new(&[[1f32, 3.]], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dtype(), DType::F16);
    }
}
