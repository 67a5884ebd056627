//! Low-rank adapters for parameter-efficient fine-tuning

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{init::DEFAULT_KAIMING_NORMAL, Dropout, Init, Linear, VarBuilder};

/// LoRA hyperparameters. Defaults follow the usual preference-tuning recipe
/// (rank 8, alpha 16, dropout 0.05).
#[derive(Debug, Clone, Copy)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
        }
    }
}

/// A frozen base linear plus a trainable low-rank update:
/// `y = x W + (alpha / r) * x A B`.
///
/// `A` is Kaiming-initialized and `B` starts at zero, so a freshly wrapped
/// layer computes exactly the base projection.
#[derive(Clone, Debug)]
pub struct LoraLinear {
    base: Linear,
    lora_a: Tensor,
    lora_b: Tensor,
    scale: f64,
    dropout: Dropout,
}

impl LoraLinear {
    pub fn wrap(base: Linear, cfg: &LoraConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let (d_out, d_in) = base.weight().dims2()?;
        let lora_a = vb.get_with_hints((d_in, cfg.rank), "lora_a", DEFAULT_KAIMING_NORMAL)?;
        let lora_b = vb.get_with_hints((cfg.rank, d_out), "lora_b", Init::Const(0.))?;
        Ok(Self {
            base,
            lora_a,
            lora_b,
            scale: cfg.alpha / cfg.rank as f64,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    pub fn base(&self) -> &Linear {
        &self.base
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Folds the adapter into the base weight, returning a plain linear with
    /// `W' = W + (alpha / r) * (A B)^T`.
    pub fn merged(&self) -> Result<Linear> {
        let delta = self.lora_a.matmul(&self.lora_b)?.t()?.contiguous()?;
        let weight = (self.base.weight() + (delta * self.scale)?)?;
        Ok(Linear::new(weight, self.base.bias().cloned()))
    }
}

impl ModuleT for LoraLinear {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let base_out = self.base.forward(xs)?;
        let xs = self.dropout.forward(xs, train)?;
        let update = xs
            .broadcast_matmul(&self.lora_a)?
            .broadcast_matmul(&self.lora_b)?;
        base_out + (update * self.scale)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{linear_b, VarBuilder, VarMap};
    use rstest::*;

    #[fixture]
    fn base_linear() -> Linear {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        linear_b(6, 4, true, vb.pp("base")).unwrap()
    }

    #[rstest]
    fn test_zero_initialized_adapter_matches_base(base_linear: Linear) -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let lora = LoraLinear::wrap(base_linear.clone(), &LoraConfig::default(), vb.pp("lora"))?;

        let xs = Tensor::rand(0f32, 1f32, (2, 3, 6), &Device::Cpu)?;
        let base_out = base_linear.forward(&xs)?.to_vec3::<f32>()?;
        let lora_out = lora.forward_t(&xs, false)?.to_vec3::<f32>()?;

        assert_eq!(base_out, lora_out);
        Ok(())
    }

    #[rstest]
    fn test_nonzero_b_changes_output(base_linear: Linear) -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = LoraConfig {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
        };
        let lora = LoraLinear::wrap(base_linear.clone(), &cfg, vb.pp("lora"))?;

        // overwrite B with ones to make the update visible
        let vars = varmap.all_vars();
        for var in vars.iter() {
            if var.dims() == [2, 4] {
                var.set(&Tensor::ones((2, 4), DType::F32, &Device::Cpu)?)?;
            }
        }

        let xs = Tensor::rand(0f32, 1f32, (1, 2, 6), &Device::Cpu)?;
        let base_out = base_linear.forward(&xs)?.to_vec3::<f32>()?;
        let lora_out = lora.forward_t(&xs, false)?.to_vec3::<f32>()?;

        assert_ne!(base_out, lora_out);
        assert_eq!(lora.scale(), 2.0);
        Ok(())
    }

    #[rstest]
    fn test_merged_matches_adapter_forward(base_linear: Linear) -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = LoraConfig {
            rank: 2,
            alpha: 4.0,
            dropout: 0.0,
        };
        let lora = LoraLinear::wrap(base_linear, &cfg, vb.pp("lora"))?;
        for var in varmap.all_vars() {
            if var.dims() == [2, 4] {
                var.set(&Tensor::ones((2, 4), DType::F32, &Device::Cpu)?)?;
            }
        }

        let xs = Tensor::rand(0f32, 1f32, (1, 3, 6), &Device::Cpu)?;
        let adapter_out = lora.forward_t(&xs, false)?.to_vec3::<f32>()?;
        let merged_out = lora.merged()?.forward(&xs)?.to_vec3::<f32>()?;

        for (a_row, m_row) in adapter_out[0].iter().zip(merged_out[0].iter()) {
            for (a, m) in a_row.iter().zip(m_row.iter()) {
                assert!((a - m).abs() < 1e-5);
            }
        }
        Ok(())
    }

    #[rstest]
    fn test_adapter_var_shapes(base_linear: Linear) -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = LoraConfig::default();
        let _lora = LoraLinear::wrap(base_linear, &cfg, vb.pp("lora"))?;

        let mut dims: Vec<Vec<usize>> = varmap
            .all_vars()
            .iter()
            .map(|v| v.dims().to_vec())
            .collect();
        dims.sort();
        assert_eq!(dims, vec![vec![6, 8], vec![8, 4]]);
        Ok(())
    }
}
