//! Switch actor: routes values along the branch selected by a condition.
//!
//! Output `b * values + j` carries value `j` on branch `b`. Every value
//! arrives holding the references of all branches; the switch keeps the
//! taken branch's share alive and drops the rest itself, so untaken
//! consumers never hold anything.

use std::sync::Arc;

use tracing::debug;

use super::base::ActorContext;
use super::ActorBehavior;
use crate::arrow::ControlArrow;
use crate::device::DeviceTensor;
use crate::error::{EngineError, Result};
use crate::message::Payload;
use crate::types::{DType, HostTensor};

/// Switch actor.
pub struct SwitchActor {
    /// Number of branches.
    pub branches: usize,
    /// Number of switched values.
    pub values: usize,
    /// Control arrows that fire only with their branch.
    pub branch_control_arrows: Vec<Vec<ControlArrow>>,
}

impl SwitchActor {
    /// Create a switch with no branch control arrows.
    pub fn new(branches: usize, values: usize) -> Self {
        Self {
            branches,
            values,
            branch_control_arrows: vec![Vec::new(); branches],
        }
    }

    /// Output index of value `value` on `branch`.
    pub fn output_index(&self, branch: usize, value: usize) -> usize {
        branch * self.values + value
    }

    /// Map a condition tensor to a branch index.
    ///
    /// Booleans select branch 0 when true and branch 1 when false; integers
    /// select the branch by index.
    pub fn select_branch(&self, actor: &str, condition: &HostTensor) -> Result<usize> {
        let bad = |message: String| EngineError::protocol(actor, message);
        let index: i64 = match condition.meta.dtype {
            DType::Bool | DType::U8 => {
                let byte = *condition
                    .data
                    .first()
                    .ok_or_else(|| bad("empty switch condition".to_string()))?;
                if byte != 0 {
                    0
                } else {
                    1
                }
            }
            DType::I32 => condition
                .to_vec::<i32>()
                .first()
                .map(|&v| i64::from(v))
                .ok_or_else(|| bad("empty switch condition".to_string()))?,
            DType::I64 => condition
                .to_vec::<i64>()
                .first()
                .copied()
                .ok_or_else(|| bad("empty switch condition".to_string()))?,
            other => {
                return Err(bad(format!(
                    "switch condition must be bool or integer, got {}",
                    other.as_str()
                )))
            }
        };
        usize::try_from(index)
            .ok()
            .filter(|&b| b < self.branches)
            .ok_or_else(|| {
                bad(format!(
                    "branch {} out of range for {} branches",
                    index, self.branches
                ))
            })
    }

    fn fanout(&self, ctx: &ActorContext<'_>, branch: usize, value: usize) -> usize {
        ctx.base
            .output_fanout
            .get(self.output_index(branch, value))
            .copied()
            .unwrap_or(0)
    }
}

impl ActorBehavior for SwitchActor {
    fn run(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        let actor = ctx.base.id.as_str();
        let condition = inputs
            .first()
            .cloned()
            .flatten()
            .ok_or_else(|| EngineError::protocol(actor, "switch has no condition"))?;
        condition
            .device()
            .synchronize_stream()
            .map_err(|f| EngineError::DeviceSync {
                device: condition.device().key().to_string(),
                op: "switch_condition".to_string(),
                message: f.message,
            })?;
        let branch = self.select_branch(actor, &condition.to_host()?)?;
        debug!(actor = %ctx.base.id, iteration = ctx.iteration, branch, "switch branch selected");

        for value in 0..self.values {
            let tensor = inputs.get(value + 1).cloned().flatten();
            for b in 0..self.branches {
                let payload = match (&tensor, b == branch) {
                    (Some(t), true) => Payload::Tensor(Arc::clone(t)),
                    _ => Payload::Skipped,
                };
                ctx.forward_output(self.output_index(b, value), &payload)?;
            }
            if let Some(t) = tensor {
                // Drop the shares held for untaken branches.
                let total: usize = (0..self.branches).map(|b| self.fanout(ctx, b, value)).sum();
                let untaken = total.max(1) - self.fanout(ctx, branch, value);
                t.release_by(untaken)?;
            }
        }

        ctx.send_output_controls()?;
        for (b, arrows) in self.branch_control_arrows.iter().enumerate() {
            ctx.send_controls(arrows, b != branch)?;
        }
        condition.release()?;
        Ok(())
    }

    fn skip(&self, ctx: &ActorContext<'_>, inputs: Vec<Option<Arc<DeviceTensor>>>) -> Result<()> {
        ctx.release_inputs(&inputs)?;
        ctx.skip_all()?;
        for arrows in &self.branch_control_arrows {
            ctx.send_controls(arrows, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_condition_mapping() {
        let switch = SwitchActor::new(2, 1);
        assert_eq!(switch.select_branch("sw", &HostTensor::scalar_bool(true)).unwrap(), 0);
        assert_eq!(switch.select_branch("sw", &HostTensor::scalar_bool(false)).unwrap(), 1);
    }

    #[test]
    fn test_index_condition() {
        let switch = SwitchActor::new(3, 1);
        let two = HostTensor::from_slice(DType::I32, Vec::<usize>::new(), &[2i32]).unwrap();
        assert_eq!(switch.select_branch("sw", &two).unwrap(), 2);

        let out_of_range = HostTensor::from_slice(DType::I64, Vec::<usize>::new(), &[3i64]).unwrap();
        assert!(switch.select_branch("sw", &out_of_range).unwrap_err().is_protocol());

        let negative = HostTensor::from_slice(DType::I32, Vec::<usize>::new(), &[-1i32]).unwrap();
        assert!(switch.select_branch("sw", &negative).is_err());
    }

    #[test]
    fn test_float_condition_rejected() {
        let switch = SwitchActor::new(2, 1);
        assert!(switch
            .select_branch("sw", &HostTensor::from_f32(&[1.0]))
            .is_err());
    }

    #[test]
    fn test_output_index() {
        let switch = SwitchActor::new(2, 3);
        assert_eq!(switch.output_index(0, 2), 2);
        assert_eq!(switch.output_index(1, 0), 3);
    }
}
