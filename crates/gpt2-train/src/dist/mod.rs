//! Run context and collective communication.
//!
//! The launch mode is decided once from the environment: `RANK` present means
//! a multi-process run, which then requires `LOCAL_RANK` and `WORLD_SIZE` and
//! rendezvous at `MASTER_ADDR:MASTER_PORT`. Rank 0 is the master.

pub mod local;
pub mod tcp;

use candle_core::Device;

use crate::error::{config_error, TrainError, TrainResult};

pub use local::LocalGroup;
pub use tcp::TcpCollective;

pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// Reduction applied element-wise across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Avg,
}

impl ReduceOp {
    pub(crate) fn code(self) -> u8 {
        match self {
            ReduceOp::Sum => 0,
            ReduceOp::Avg => 1,
        }
    }
}

/// Blocking collectives over a fixed group of ranks.
///
/// Every rank must issue the same sequence of calls with equal lengths; a
/// rank that never arrives blocks the others.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    fn all_reduce_f32(&self, values: &mut [f32], op: ReduceOp) -> TrainResult<()>;
    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> TrainResult<()>;

    fn barrier(&self) -> TrainResult<()> {
        self.all_reduce_f64(&mut [0.0], ReduceOp::Sum)
    }

    fn all_reduce_scalar(&self, value: f64, op: ReduceOp) -> TrainResult<f64> {
        let mut buf = [value];
        self.all_reduce_f64(&mut buf, op)?;
        Ok(buf[0])
    }

    /// Replace `values` on every rank with rank 0's copy.
    fn broadcast_from_master(&self, values: &mut [f32]) -> TrainResult<()> {
        if self.rank() != 0 {
            values.fill(0.0);
        }
        self.all_reduce_f32(values, ReduceOp::Sum)
    }

    fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

/// World of one: every collective is the identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_f32(&self, _values: &mut [f32], _op: ReduceOp) -> TrainResult<()> {
        Ok(())
    }

    fn all_reduce_f64(&self, _values: &mut [f64], _op: ReduceOp) -> TrainResult<()> {
        Ok(())
    }
}

/// Which accelerator to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    /// CUDA, then Metal, then CPU.
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            other => Err(config_error(format!(
                "unknown device '{}', use auto, cpu, cuda or metal",
                other
            ))),
        }
    }
}

fn resolve_device(pref: DevicePreference, ordinal: usize) -> TrainResult<Device> {
    let cuda = |ordinal| {
        Device::new_cuda(ordinal)
            .map_err(|e| config_error(format!("failed to initialize CUDA device {}: {}", ordinal, e)))
    };
    match pref {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Cuda => cuda(ordinal),
        DevicePreference::Metal => Device::new_metal(ordinal)
            .map_err(|e| config_error(format!("failed to initialize Metal device: {}", e))),
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                cuda(ordinal)
            } else if candle_core::utils::metal_is_available() {
                Ok(Device::new_metal(ordinal).unwrap_or(Device::Cpu))
            } else {
                Ok(Device::Cpu)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    SingleProcess,
    MultiProcess { master_addr: String, master_port: u16 },
}

/// Identity of this process within the run; built once at startup.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub rank: usize,
    pub local_rank: usize,
    pub world_size: usize,
    pub is_master: bool,
    pub device: Device,
    pub launch: LaunchMode,
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> TrainResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| config_error(format!("{}={:?} is not a valid number", name, raw)))
}

impl RunContext {
    /// Single process on `device`.
    pub fn single(device: Device) -> Self {
        Self {
            rank: 0,
            local_rank: 0,
            world_size: 1,
            is_master: true,
            device,
            launch: LaunchMode::SingleProcess,
        }
    }

    pub fn from_env(device: DevicePreference) -> TrainResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok(), device)
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F, device: DevicePreference) -> TrainResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(rank_raw) = lookup("RANK") else {
            let device = resolve_device(device, 0)?;
            tracing::info!(device = ?device, "Single-process run");
            return Ok(Self::single(device));
        };

        let require = |name: &str| {
            lookup(name).ok_or_else(|| {
                config_error(format!("RANK is set but {} is missing", name))
            })
        };
        let rank: usize = parse_var("RANK", &rank_raw)?;
        let local_rank: usize = parse_var("LOCAL_RANK", &require("LOCAL_RANK")?)?;
        let world_size: usize = parse_var("WORLD_SIZE", &require("WORLD_SIZE")?)?;
        if world_size == 0 || rank >= world_size {
            return Err(config_error(format!(
                "RANK {} out of range for WORLD_SIZE {}",
                rank, world_size
            )));
        }
        let master_addr = lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string());
        let master_port = match lookup("MASTER_PORT") {
            Some(raw) => parse_var("MASTER_PORT", &raw)?,
            None => DEFAULT_MASTER_PORT,
        };

        let device = resolve_device(device, local_rank)?;
        tracing::info!(
            rank,
            local_rank,
            world_size,
            device = ?device,
            master = %format!("{}:{}", master_addr, master_port),
            "Multi-process run"
        );
        Ok(Self {
            rank,
            local_rank,
            world_size,
            is_master: rank == 0,
            device,
            launch: LaunchMode::MultiProcess {
                master_addr,
                master_port,
            },
        })
    }

    /// Bring up the collective backend for this launch mode.
    ///
    /// Multi-process runs fail with a synchronization error when the group
    /// cannot be formed; there is no single-process fallback.
    pub fn connect(&self) -> TrainResult<Box<dyn Collective>> {
        match &self.launch {
            LaunchMode::SingleProcess => Ok(Box::new(SingleProcess)),
            LaunchMode::MultiProcess {
                master_addr,
                master_port,
            } => Ok(Box::new(TcpCollective::connect(
                master_addr,
                *master_port,
                self.rank,
                self.world_size,
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_no_rank_means_single_process() -> TrainResult<()> {
        let ctx = RunContext::from_lookup(env(&[("WORLD_SIZE", "8")]), DevicePreference::Cpu)?;
        assert_eq!(ctx.launch, LaunchMode::SingleProcess);
        assert_eq!((ctx.rank, ctx.world_size), (0, 1));
        assert!(ctx.is_master);
        Ok(())
    }

    #[test]
    fn test_multi_process_fields_and_defaults() -> TrainResult<()> {
        let ctx = RunContext::from_lookup(
            env(&[("RANK", "3"), ("LOCAL_RANK", "1"), ("WORLD_SIZE", "4")]),
            DevicePreference::Cpu,
        )?;
        assert_eq!((ctx.rank, ctx.local_rank, ctx.world_size), (3, 1, 4));
        assert!(!ctx.is_master);
        assert_eq!(
            ctx.launch,
            LaunchMode::MultiProcess {
                master_addr: "127.0.0.1".to_string(),
                master_port: 29500
            }
        );
        Ok(())
    }

    #[test]
    fn test_rank_without_world_size_is_config_error() {
        let err = RunContext::from_lookup(
            env(&[("RANK", "0"), ("LOCAL_RANK", "0")]),
            DevicePreference::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::Config(ref m) if m.contains("WORLD_SIZE")));
    }

    #[test]
    fn test_rank_out_of_range() {
        let err = RunContext::from_lookup(
            env(&[("RANK", "4"), ("LOCAL_RANK", "0"), ("WORLD_SIZE", "4")]),
            DevicePreference::Cpu,
        );
        assert!(matches!(err, Err(TrainError::Config(_))));
    }

    #[test]
    fn test_single_process_collectives_are_identity() -> TrainResult<()> {
        let c = SingleProcess;
        let mut v = [1.5f32, -2.0];
        c.all_reduce_f32(&mut v, ReduceOp::Avg)?;
        c.broadcast_from_master(&mut v)?;
        assert_eq!(v, [1.5, -2.0]);
        assert_eq!(c.all_reduce_scalar(3.0, ReduceOp::Sum)?, 3.0);
        c.barrier()?;
        Ok(())
    }

    #[test]
    fn test_device_preference_parse() {
        assert_eq!("mps".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }
}
