use crate::{DType, EmberError, Result, Shape};
use half::{bf16, f16};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Host tensor with `f32` storage and a logical dtype tag.
///
/// The planner never interprets the values; reduced-precision dtypes round
/// the stored values through the corresponding half format so that numeric
/// behavior matches what a device holding real F16/BF16 buffers would see.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: Vec<f32>,
    shape: Shape,
    dtype: DType,
}

impl Tensor {
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(EmberError::InvalidArgument(format!(
                "data length {} does not match shape {} ({} elements)",
                data.len(),
                shape,
                shape.elem_count()
            )));
        }
        Ok(Self {
            data,
            shape,
            dtype: DType::F32,
        })
    }

    pub fn zeros(shape: Shape) -> Self {
        let data = vec![0.0; shape.elem_count()];
        Self {
            data,
            shape,
            dtype: DType::F32,
        }
    }

    pub fn zeros_with_dtype(shape: Shape, dtype: DType) -> Self {
        let data = vec![0.0; shape.elem_count()];
        Self { data, shape, dtype }
    }

    pub fn randn(shape: Shape, mean: f32, std: f32) -> Result<Self> {
        let normal = Normal::new(mean, std)
            .map_err(|e| EmberError::InvalidArgument(format!("bad normal params: {}", e)))?;
        let mut rng = rand::thread_rng();
        let data = (0..shape.elem_count())
            .map(|_| normal.sample(&mut rng))
            .collect();
        Ok(Self {
            data,
            shape,
            dtype: DType::F32,
        })
    }

    /// Uniform values in [lo, hi); handy for building test inputs.
    pub fn rand_uniform(shape: Shape, lo: f32, hi: f32) -> Self {
        let mut rng = rand::thread_rng();
        let data = (0..shape.elem_count())
            .map(|_| rng.gen_range(lo..hi))
            .collect();
        Self {
            data,
            shape,
            dtype: DType::F32,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Retag the tensor, rounding storage through the target half format so
    /// the values are representable in that precision.
    pub fn to_dtype(&self, dtype: DType) -> Result<Tensor> {
        let data = match dtype {
            DType::F16 => self
                .data
                .iter()
                .map(|&v| f16::from_f32(v).to_f32())
                .collect(),
            DType::BF16 => self
                .data
                .iter()
                .map(|&v| bf16::from_f32(v).to_f32())
                .collect(),
            DType::F32 | DType::F64 => self.data.clone(),
        };
        Ok(Tensor {
            data,
            shape: self.shape.clone(),
            dtype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randn_fills_the_shape_with_the_requested_distribution() -> crate::Result<()> {
        let t = Tensor::randn(Shape::from_dims(&[50, 40, 5]), 2.0, 0.5)?;
        assert_eq!(t.elem_count(), 10_000);
        assert_eq!(t.dtype(), DType::F32);
        let mean = t.data().iter().sum::<f32>() / t.elem_count() as f32;
        assert!((mean - 2.0).abs() < 0.1, "sample mean {} too far from 2.0", mean);
        let var = t.data().iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
            / t.elem_count() as f32;
        assert!((var.sqrt() - 0.5).abs() < 0.1, "sample std {} too far from 0.5", var.sqrt());
        Ok(())
    }

    #[test]
    fn randn_rejects_a_negative_spread() {
        assert!(Tensor::randn(Shape::from_dims(&[4]), 0.0, -1.0).is_err());
    }
}
