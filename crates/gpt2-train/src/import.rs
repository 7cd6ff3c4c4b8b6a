//! Import published GPT-2 weights (HuggingFace safetensors layout).
//!
//! The published checkpoints store the four projection matrices as Conv1D
//! weights of shape `(in, out)`; linear layers here hold `(out, in)`, so those
//! are transposed on the way in. Attention mask buffers and the tied
//! `lm_head.weight` are not parameters and are dropped.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;

use crate::error::{TrainError, TrainResult};

const PREFIX: &str = "transformer.";

const TRANSPOSED: [&str; 4] = [
    "attn.c_attn.weight",
    "attn.c_proj.weight",
    "mlp.c_fc.weight",
    "mlp.c_proj.weight",
];

fn is_buffer(name: &str) -> bool {
    name.ends_with(".attn.bias") || name.ends_with(".attn.masked_bias")
}

fn normalize_name(name: &str) -> String {
    if name.starts_with(PREFIX) {
        name.to_string()
    } else {
        format!("{}{}", PREFIX, name)
    }
}

/// Keep parameters only, normalized to the model's naming.
fn filter_keys(tensors: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    tensors
        .into_iter()
        .filter(|(name, _)| !is_buffer(name) && name != "lm_head.weight")
        .map(|(name, t)| (normalize_name(&name), t))
        .collect()
}

/// Copy `tensors` into the var map. The name sets must match exactly.
///
/// Returns the number of tensors copied.
pub fn import_tensors(tensors: HashMap<String, Tensor>, varmap: &VarMap) -> TrainResult<usize> {
    let source = filter_keys(tensors);
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Candle("var map lock poisoned".to_string()))?;

    let mut missing: Vec<&String> = data.keys().filter(|k| !source.contains_key(*k)).collect();
    let mut unexpected: Vec<&String> = source.keys().filter(|k| !data.contains_key(*k)).collect();
    if !missing.is_empty() || !unexpected.is_empty() {
        missing.sort();
        unexpected.sort();
        return Err(TrainError::Import(format!(
            "parameter names differ: missing {:?}, unexpected {:?}",
            missing, unexpected
        )));
    }

    let mut names: Vec<&String> = source.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        let mut tensor = source[name].to_dtype(DType::F32)?;
        if TRANSPOSED.iter().any(|suffix| name.ends_with(suffix)) {
            tensor = tensor.t()?.contiguous()?;
        }
        if tensor.dims() != var.dims() {
            return Err(TrainError::Import(format!(
                "shape mismatch for {}: checkpoint {:?}, model {:?}",
                name,
                tensor.dims(),
                var.dims()
            )));
        }
        var.set(&tensor.to_device(var.device())?)?;
    }

    tracing::info!(tensors = source.len(), "Imported pretrained weights");
    Ok(source.len())
}

/// Load a published `model.safetensors` into the var map.
pub fn import_safetensors(path: &Path, varmap: &VarMap, device: &Device) -> TrainResult<usize> {
    let tensors = candle_core::safetensors::load(path, device)
        .map_err(|e| TrainError::Import(format!("read {}: {}", path.display(), e)))?;
    import_tensors(tensors, varmap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_gpt_config;
    use crate::model::{Gpt, LanguageModel};

    /// Export a var map the way the published checkpoints lay it out.
    fn to_published(varmap: &VarMap) -> HashMap<String, Tensor> {
        let data = varmap.data().lock().unwrap();
        let mut out = HashMap::new();
        for (name, var) in data.iter() {
            let mut t = var.as_tensor().clone();
            if TRANSPOSED.iter().any(|s| name.ends_with(s)) {
                t = t.t().unwrap().contiguous().unwrap();
            }
            out.insert(name.trim_start_matches(PREFIX).to_string(), t);
        }
        let bias = Tensor::ones((1, 1, 16, 16), DType::F32, &Device::Cpu).unwrap();
        out.insert("h.0.attn.bias".to_string(), bias.clone());
        out.insert("h.1.attn.masked_bias".to_string(), bias);
        out.insert(
            "lm_head.weight".to_string(),
            data["transformer.wte.weight"].as_tensor().clone(),
        );
        out
    }

    #[test]
    fn test_import_reproduces_source_model() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (src, src_vars) = Gpt::build(&cfg, &Device::Cpu, 1)?;
        let (dst, dst_vars) = Gpt::build(&cfg, &Device::Cpu, 2)?;

        let copied = import_tensors(to_published(&src_vars), &dst_vars)?;
        assert_eq!(copied, src_vars.all_vars().len());

        let x = Tensor::new(&[[3u32, 1, 4, 1, 5]], &Device::Cpu)?;
        let diff = (src.forward(&x)? - dst.forward(&x)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-6, "{}", diff);
        Ok(())
    }

    #[test]
    fn test_missing_key_is_import_error() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (_src, src_vars) = Gpt::build(&cfg, &Device::Cpu, 1)?;
        let (_dst, dst_vars) = Gpt::build(&cfg, &Device::Cpu, 2)?;
        let mut published = to_published(&src_vars);
        published.remove("ln_f.bias");
        let err = import_tensors(published, &dst_vars).unwrap_err();
        assert!(matches!(err, TrainError::Import(ref m) if m.contains("ln_f.bias")));
        Ok(())
    }

    #[test]
    fn test_untransposed_projection_is_shape_error() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (_src, src_vars) = Gpt::build(&cfg, &Device::Cpu, 1)?;
        let (_dst, dst_vars) = Gpt::build(&cfg, &Device::Cpu, 2)?;
        let mut published = to_published(&src_vars);
        // (out, in) = (48, 16) left as-is reads back as (16, 48)
        let w = src_vars.data().lock().unwrap()["transformer.h.0.attn.c_attn.weight"]
            .as_tensor()
            .clone();
        published.insert("h.0.attn.c_attn.weight".to_string(), w);
        let err = import_tensors(published, &dst_vars).unwrap_err();
        assert!(matches!(err, TrainError::Import(ref m) if m.contains("shape mismatch")));
        Ok(())
    }

    #[test]
    fn test_prefixed_keys_accepted() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (_src, src_vars) = Gpt::build(&cfg, &Device::Cpu, 1)?;
        let (_dst, dst_vars) = Gpt::build(&cfg, &Device::Cpu, 2)?;
        let prefixed: HashMap<String, Tensor> = to_published(&src_vars)
            .into_iter()
            .map(|(k, v)| {
                if k == "lm_head.weight" {
                    (k, v)
                } else {
                    (format!("transformer.{}", k), v)
                }
            })
            .collect();
        import_tensors(prefixed, &dst_vars)?;
        Ok(())
    }
}
