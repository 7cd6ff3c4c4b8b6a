//! Step-keyed cadence for periodic work inside the training loop.

use crate::config::TrainConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Validate,
    HellaSwag,
    Sample,
    Checkpoint,
}

/// Fires every `every` steps, optionally never at step 0, optionally always
/// on the final step. `every == 0` disables the periodic part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicTask {
    pub kind: TaskKind,
    pub every: usize,
    pub skip_step_zero: bool,
    pub include_last: bool,
}

impl PeriodicTask {
    pub fn due(&self, step: usize, last_step: bool) -> bool {
        if self.include_last && last_step {
            return true;
        }
        if self.every == 0 || step % self.every != 0 {
            return false;
        }
        !(self.skip_step_zero && step == 0)
    }
}

/// The four periodic tasks of a run.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub validate: PeriodicTask,
    pub hellaswag: PeriodicTask,
    pub sample: PeriodicTask,
    pub checkpoint: PeriodicTask,
}

impl Cadence {
    pub fn from_config(config: &TrainConfig) -> Self {
        let task = |kind, every, skip_step_zero| PeriodicTask {
            kind,
            every,
            skip_step_zero,
            include_last: true,
        };
        Self {
            validate: task(TaskKind::Validate, config.eval_interval, false),
            hellaswag: task(TaskKind::HellaSwag, config.eval_interval, false),
            // step 0 samples are noise
            sample: task(TaskKind::Sample, config.sample_interval, true),
            checkpoint: task(TaskKind::Checkpoint, config.checkpoint_interval, true),
        }
    }

    /// Tasks due at `step`, in execution order.
    pub fn due(&self, step: usize, last_step: bool) -> Vec<TaskKind> {
        [self.validate, self.checkpoint, self.hellaswag, self.sample]
            .iter()
            .filter(|t| t.due(step, last_step))
            .map(|t| t.kind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_cadence() {
        let cadence = Cadence::from_config(&TrainConfig::gpt2_124m());
        let last = 76291;
        assert_eq!(
            cadence.due(0, false),
            vec![TaskKind::Validate, TaskKind::HellaSwag]
        );
        assert_eq!(
            cadence.due(250, false),
            vec![TaskKind::Validate, TaskKind::HellaSwag, TaskKind::Sample]
        );
        assert!(cadence.due(251, false).is_empty());
        assert_eq!(
            cadence.due(5000, false),
            vec![
                TaskKind::Validate,
                TaskKind::Checkpoint,
                TaskKind::HellaSwag,
                TaskKind::Sample
            ]
        );
        assert_eq!(cadence.due(last, true).len(), 4);
    }

    #[test]
    fn test_zero_interval_only_fires_on_last() {
        let task = PeriodicTask {
            kind: TaskKind::Checkpoint,
            every: 0,
            skip_step_zero: true,
            include_last: true,
        };
        assert!(!task.due(0, false));
        assert!(!task.due(10, false));
        assert!(task.due(10, true));
    }

    #[test]
    fn test_checkpoint_never_at_step_zero() {
        let cadence = Cadence::from_config(&TrainConfig::gpt2_124m());
        assert!(!cadence.checkpoint.due(0, false));
        // a one-step run still saves at its last step
        assert!(cadence.checkpoint.due(0, true));
    }
}
