//! In-process collective group: one handle per thread.
//!
//! Each rank writes its contribution into its own slot, waits, sums all slots
//! in rank order, then waits again before slots may be overwritten. Every rank
//! computes the same sum in the same order, so results are bit-identical.

use std::sync::{Arc, Barrier, Mutex};

use super::{Collective, ReduceOp};
use crate::error::{sync_error, TrainResult};

struct Shared {
    slots: Mutex<Vec<Vec<f64>>>,
    barrier: Barrier,
    world_size: usize,
}

/// A rank's handle into a [`LocalGroup`].
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Handles for ranks `0..world_size`; hand one to each thread.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            slots: Mutex::new(vec![Vec::new(); world_size]),
            barrier: Barrier::new(world_size),
            world_size,
        });
        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn reduce(&self, values: &[f64], op: ReduceOp) -> TrainResult<Vec<f64>> {
        {
            let mut slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| sync_error("local group poisoned"))?;
            slots[self.rank] = values.to_vec();
        }
        self.shared.barrier.wait();

        let result = {
            let slots = self
                .shared
                .slots
                .lock()
                .map_err(|_| sync_error("local group poisoned"))?;
            if let Some(bad) = slots.iter().position(|s| s.len() != values.len()) {
                Err(sync_error(format!(
                    "rank {} contributed {} values, rank {} expected {}",
                    bad,
                    slots[bad].len(),
                    self.rank,
                    values.len()
                )))
            } else {
                let mut sum = vec![0.0f64; values.len()];
                for slot in slots.iter() {
                    for (acc, v) in sum.iter_mut().zip(slot) {
                        *acc += v;
                    }
                }
                if op == ReduceOp::Avg {
                    let n = self.shared.world_size as f64;
                    sum.iter_mut().for_each(|v| *v /= n);
                }
                Ok(sum)
            }
        };
        self.shared.barrier.wait();
        result
    }
}

impl Collective for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_f32(&self, values: &mut [f32], op: ReduceOp) -> TrainResult<()> {
        let wide: Vec<f64> = values.iter().map(|&v| v as f64).collect();
        let out = self.reduce(&wide, op)?;
        for (dst, src) in values.iter_mut().zip(out) {
            *dst = src as f32;
        }
        Ok(())
    }

    fn all_reduce_f64(&self, values: &mut [f64], op: ReduceOp) -> TrainResult<()> {
        let out = self.reduce(values, op)?;
        values.copy_from_slice(&out);
        Ok(())
    }
}
