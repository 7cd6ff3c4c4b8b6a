//! Training checkpoint save/load.
//!
//! One file per checkpoint: `<log_dir>/model_<step:05>.safetensors`. The
//! safetensors header metadata carries the model config (JSON), the step and
//! the most recent validation loss.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use safetensors::tensor::{Dtype, View};
use safetensors::SafeTensors;

use crate::config::GptConfig;
use crate::error::{checkpoint_error, IoResultExt, TrainError, TrainResult};

const META_CONFIG: &str = "config";
const META_STEP: &str = "step";
const META_VAL_LOSS: &str = "val_loss";

/// Metadata stored alongside model weights.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    pub config: GptConfig,
    pub step: usize,
    pub val_loss: Option<f64>,
}

impl CheckpointMeta {
    fn to_header(&self) -> TrainResult<HashMap<String, String>> {
        let config = serde_json::to_string(&self.config)
            .map_err(|e| TrainError::Config(format!("serialize model config: {}", e)))?;
        let mut meta = HashMap::new();
        meta.insert(META_CONFIG.to_string(), config);
        meta.insert(META_STEP.to_string(), self.step.to_string());
        if let Some(loss) = self.val_loss {
            meta.insert(META_VAL_LOSS.to_string(), loss.to_string());
        }
        Ok(meta)
    }

    fn from_header(header: &HashMap<String, String>, path: &Path) -> TrainResult<Self> {
        let get = |key: &str| {
            header
                .get(key)
                .ok_or_else(|| checkpoint_error(format!("missing '{}' metadata", key), path))
        };
        let config = serde_json::from_str(get(META_CONFIG)?)
            .map_err(|e| checkpoint_error(format!("bad config metadata: {}", e), path))?;
        let step = get(META_STEP)?
            .parse()
            .map_err(|_| checkpoint_error("bad step metadata", path))?;
        let val_loss = match header.get(META_VAL_LOSS) {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| checkpoint_error("bad val_loss metadata", path))?,
            ),
            None => None,
        };
        Ok(Self {
            config,
            step,
            val_loss,
        })
    }
}

/// Host copy of one f32 tensor in safetensors layout.
struct HostTensor {
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl HostTensor {
    fn from_tensor(t: &Tensor) -> candle_core::Result<Self> {
        let values = t
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            shape: t.dims().to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        })
    }
}

impl View for &HostTensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

pub fn checkpoint_path(log_dir: &Path, step: usize) -> PathBuf {
    log_dir.join(format!("model_{:05}.safetensors", step))
}

/// Write every var plus metadata to `<log_dir>/model_<step:05>.safetensors`.
pub fn save_checkpoint(
    varmap: &VarMap,
    meta: &CheckpointMeta,
    log_dir: &Path,
) -> TrainResult<PathBuf> {
    fs::create_dir_all(log_dir).with_path(log_dir)?;
    let path = checkpoint_path(log_dir, meta.step);

    let host: Vec<(String, HostTensor)> = {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| checkpoint_error("var map lock poisoned", &path))?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| Ok((name.clone(), HostTensor::from_tensor(data[name].as_tensor())?)))
            .collect::<candle_core::Result<_>>()?
    };
    let views: Vec<(&str, &HostTensor)> = host.iter().map(|(n, t)| (n.as_str(), t)).collect();

    safetensors::serialize_to_file(views, &Some(meta.to_header()?), &path)
        .map_err(|e| checkpoint_error(e.to_string(), &path))?;
    Ok(path)
}

/// Weights and metadata read back from a checkpoint file.
pub struct LoadedCheckpoint {
    pub meta: CheckpointMeta,
    pub tensors: HashMap<String, Tensor>,
}

pub fn load_checkpoint(path: &Path, device: &Device) -> TrainResult<LoadedCheckpoint> {
    let buffer = fs::read(path).with_path(path)?;
    let (_, metadata) = SafeTensors::read_metadata(&buffer)
        .map_err(|e| checkpoint_error(format!("bad header: {}", e), path))?;
    let header = metadata
        .metadata()
        .as_ref()
        .ok_or_else(|| checkpoint_error("no metadata", path))?;
    let meta = CheckpointMeta::from_header(header, path)?;
    let tensors = candle_core::safetensors::load_buffer(&buffer, device)
        .map_err(|e| checkpoint_error(e.to_string(), path))?;
    Ok(LoadedCheckpoint { meta, tensors })
}

/// Copy checkpoint tensors into a var map with the same names and shapes.
pub fn restore_vars(
    varmap: &VarMap,
    tensors: &HashMap<String, Tensor>,
    path: &Path,
) -> TrainResult<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| checkpoint_error("var map lock poisoned", path))?;
    if data.len() != tensors.len() {
        return Err(checkpoint_error(
            format!("{} tensors in file, model has {}", tensors.len(), data.len()),
            path,
        ));
    }
    for (name, var) in data.iter() {
        let t = tensors
            .get(name)
            .ok_or_else(|| checkpoint_error(format!("missing tensor {}", name), path))?;
        if t.dims() != var.dims() {
            return Err(checkpoint_error(
                format!("shape mismatch for {}: {:?} vs {:?}", name, t.dims(), var.dims()),
                path,
            ));
        }
        var.set(&t.to_dtype(var.dtype())?.to_device(var.device())?)?;
    }
    Ok(())
}

/// Delete all but the newest `keep_last` step checkpoints in `log_dir`.
///
/// Returns the number removed.
pub fn prune_checkpoints(log_dir: &Path, keep_last: usize) -> TrainResult<usize> {
    if keep_last == 0 || !log_dir.exists() {
        return Ok(0);
    }

    let mut checkpoints: Vec<(PathBuf, usize)> = Vec::new();
    for entry in fs::read_dir(log_dir).with_path(log_dir)? {
        let path = entry.with_path(log_dir)?.path();
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("model_"))
            .and_then(|n| n.strip_suffix(".safetensors"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(step) = step {
            checkpoints.push((path, step));
        }
    }

    // oldest first
    checkpoints.sort_by_key(|(_, step)| *step);
    let to_remove = checkpoints.len().saturating_sub(keep_last);

    for (path, step) in checkpoints.iter().take(to_remove) {
        tracing::info!(step, path = %path.display(), "Removing old checkpoint");
        fs::remove_file(path).with_path(path)?;
    }
    Ok(to_remove)
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::tiny_gpt_config;
    use crate::model::{Gpt, LanguageModel};

    #[test]
    fn test_checkpoint_save_load_roundtrip() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (model, varmap) = Gpt::build(&cfg, &Device::Cpu, 11)?;
        let dir = tempfile::tempdir().unwrap();

        let meta = CheckpointMeta {
            config: cfg.clone(),
            step: 250,
            val_loss: Some(3.2831),
        };
        let path = save_checkpoint(&varmap, &meta, dir.path())?;
        assert_eq!(path.file_name().unwrap(), "model_00250.safetensors");

        let loaded = load_checkpoint(&path, &Device::Cpu)?;
        assert_eq!(loaded.meta, meta);

        let (fresh, fresh_vars) = Gpt::build(&loaded.meta.config, &Device::Cpu, 99)?;
        restore_vars(&fresh_vars, &loaded.tensors, &path)?;
        let x = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu)?;
        let diff = (model.forward(&x)? - fresh.forward(&x)?)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_missing_val_loss_is_none() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (_model, varmap) = Gpt::build(&cfg, &Device::Cpu, 0)?;
        let dir = tempfile::tempdir().unwrap();
        let meta = CheckpointMeta {
            config: cfg,
            step: 7,
            val_loss: None,
        };
        let path = save_checkpoint(&varmap, &meta, dir.path())?;
        assert_eq!(load_checkpoint(&path, &Device::Cpu)?.meta.val_loss, None);
        Ok(())
    }

    #[test]
    fn test_restore_rejects_other_architecture() -> TrainResult<()> {
        let cfg = tiny_gpt_config();
        let (_model, varmap) = Gpt::build(&cfg, &Device::Cpu, 0)?;
        let dir = tempfile::tempdir().unwrap();
        let meta = CheckpointMeta {
            config: cfg.clone(),
            step: 1,
            val_loss: None,
        };
        let path = save_checkpoint(&varmap, &meta, dir.path())?;
        let loaded = load_checkpoint(&path, &Device::Cpu)?;

        let wider = GptConfig { n_embd: 32, ..cfg };
        let (_m, other) = Gpt::build(&wider, &Device::Cpu, 0)?;
        let err = restore_vars(&other, &loaded.tensors, &path).unwrap_err();
        assert!(matches!(err, TrainError::Checkpoint { .. }));
        Ok(())
    }

    #[test]
    fn test_unwritable_dir_is_checkpoint_or_io_error() {
        let cfg = tiny_gpt_config();
        let (_model, varmap) = Gpt::build(&cfg, &Device::Cpu, 0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let meta = CheckpointMeta {
            config: cfg,
            step: 1,
            val_loss: None,
        };
        let err = save_checkpoint(&varmap, &meta, &blocker.join("sub")).unwrap_err();
        assert!(err.path().is_some());
    }

    #[test]
    fn test_prune_keeps_newest() -> TrainResult<()> {
        let dir = tempfile::tempdir().unwrap();
        for step in [5000, 250, 10000, 750] {
            fs::write(checkpoint_path(dir.path(), step), b"").unwrap();
        }
        fs::write(dir.path().join("log.txt"), b"").unwrap();

        assert_eq!(prune_checkpoints(dir.path(), 2)?, 2);
        assert!(checkpoint_path(dir.path(), 5000).exists());
        assert!(checkpoint_path(dir.path(), 10000).exists());
        assert!(!checkpoint_path(dir.path(), 250).exists());
        assert!(dir.path().join("log.txt").exists());
        assert_eq!(prune_checkpoints(dir.path(), 0)?, 0);
        Ok(())
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00MB");
    }
}
