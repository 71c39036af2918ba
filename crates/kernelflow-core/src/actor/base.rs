//! Fields and protocol shared by every actor.

use std::collections::HashMap;
use std::sync::Arc;

use crate::arrow::{ControlArrow, DataArrow, InputDataArrow, ResultArrow};
use crate::device::{DeviceContext, DeviceTensor};
use crate::error::{EngineError, Result};
use crate::message::{ActorMessage, Payload};
use crate::router::ActorRouter;
use crate::run::RunContext;
use crate::types::{ActorId, RunId, TensorMeta};

/// Static description of one input slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputSlot {
    /// Data arrows targeting the slot. Zero for store-fed slots.
    pub expected: usize,
    /// References a value delivered here accounts for.
    pub release_weight: usize,
}

/// Topology and device bindings common to all actors.
///
/// Built by the compiler, immutable afterwards.
pub struct ActorBase {
    /// Actor id.
    pub id: ActorId,
    /// Devices the actor works on. The first is its home device.
    pub device_contexts: Vec<Arc<dyn DeviceContext>>,
    /// Store-fed inputs as `(input index, key)`.
    pub device_tensor_store_keys: Vec<(usize, String)>,
    /// Reverse index of incoming data arrows.
    pub input_data_arrows: Vec<InputDataArrow>,
    /// Actors this actor waits for a control signal from.
    pub input_control_arrows: Vec<ActorId>,
    /// Outgoing data arrows.
    pub output_data_arrows: Vec<DataArrow>,
    /// Outgoing control arrows.
    pub output_control_arrows: Vec<ControlArrow>,
    /// Outgoing result arrows.
    pub output_result_arrows: Vec<ResultArrow>,
    /// Input slots by index.
    pub input_slots: Vec<InputSlot>,
    /// Weighted consumer count per output.
    pub output_fanout: Vec<usize>,
    /// Output sizes in bytes, when known statically.
    pub output_sizes: Vec<Option<usize>>,
    /// Deliveries required before `run` fires.
    pub running_dependent_msg_count: usize,
}

impl ActorBase {
    /// Create an unconnected actor base.
    pub fn new(id: ActorId, device_contexts: Vec<Arc<dyn DeviceContext>>) -> Self {
        Self {
            id,
            device_contexts,
            device_tensor_store_keys: Vec::new(),
            input_data_arrows: Vec::new(),
            input_control_arrows: Vec::new(),
            output_data_arrows: Vec::new(),
            output_control_arrows: Vec::new(),
            output_result_arrows: Vec::new(),
            input_slots: Vec::new(),
            output_fanout: Vec::new(),
            output_sizes: Vec::new(),
            running_dependent_msg_count: 0,
        }
    }

    /// Home device.
    pub fn device(&self) -> Result<&Arc<dyn DeviceContext>> {
        self.device_contexts
            .first()
            .ok_or_else(|| EngineError::protocol(self.id.as_str(), "actor has no device context"))
    }

    /// Number of outputs.
    pub fn num_outputs(&self) -> usize {
        self.output_fanout.len()
    }

    /// `original_ref_count` for a tensor produced on output `index`.
    pub fn original_ref_count(&self, index: usize) -> usize {
        self.output_fanout.get(index).copied().unwrap_or(0).max(1)
    }

    /// Check if output `index` has no consumer at all.
    pub fn is_unconsumed(&self, index: usize) -> bool {
        self.output_fanout.get(index).copied().unwrap_or(0) == 0
    }

    /// Store key feeding input `index`.
    pub fn store_key(&self, index: usize) -> Option<&str> {
        self.device_tensor_store_keys
            .iter()
            .find(|(i, _)| *i == index)
            .map(|(_, k)| k.as_str())
    }

    /// Recompute the readiness threshold from slots and control arrows.
    pub fn update_dependent_count(&mut self) {
        self.running_dependent_msg_count = self
            .input_slots
            .iter()
            .map(|s| s.expected)
            .sum::<usize>()
            + self.input_control_arrows.len();
    }
}

impl std::fmt::Debug for ActorBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorBase")
            .field("id", &self.id)
            .field("inputs", &self.input_slots.len())
            .field("outputs", &self.num_outputs())
            .finish()
    }
}

/// Per-iteration readiness bookkeeping of one actor.
#[derive(Debug)]
pub struct InputTracker {
    slots: Vec<SlotState>,
    controls: usize,
    control_skipped: bool,
    received: usize,
}

#[derive(Debug, Default)]
struct SlotState {
    arrivals: usize,
    value: Option<Arc<DeviceTensor>>,
}

/// Inputs handed to `run` once an actor is ready.
#[derive(Debug)]
pub struct Inputs {
    /// Delivered value per slot. `None` for store-fed or dead slots.
    pub values: Vec<Option<Arc<DeviceTensor>>>,
    /// Some dependency was skipped this iteration.
    pub dead: bool,
}

impl InputTracker {
    /// Empty tracker for `base`.
    pub fn new(base: &ActorBase) -> Self {
        Self {
            slots: base.input_slots.iter().map(|_| SlotState::default()).collect(),
            controls: 0,
            control_skipped: false,
            received: 0,
        }
    }

    /// Count a data delivery.
    pub fn on_data(&mut self, base: &ActorBase, iteration: u64, input_index: usize, payload: Payload) -> Result<()> {
        let spec = base.input_slots.get(input_index).copied().unwrap_or_default();
        if spec.expected == 0 {
            return Err(EngineError::protocol(
                base.id.as_str(),
                format!("data delivered to input {} which has no producer", input_index),
            ));
        }
        let duplicate = || EngineError::DuplicateDelivery {
            actor: base.id.to_string(),
            input: format!("input {}", input_index),
            iteration,
        };
        let slot = &mut self.slots[input_index];
        if slot.arrivals >= spec.expected {
            return Err(duplicate());
        }
        if let Payload::Tensor(tensor) = payload {
            // A merge slot carries at most one real value per iteration.
            if slot.value.is_some() {
                return Err(duplicate());
            }
            slot.value = Some(tensor);
        }
        slot.arrivals += 1;
        self.received += 1;
        Ok(())
    }

    /// Count a control delivery.
    pub fn on_control(&mut self, base: &ActorBase, iteration: u64, skipped: bool) -> Result<()> {
        if self.controls >= base.input_control_arrows.len() {
            return Err(EngineError::DuplicateDelivery {
                actor: base.id.to_string(),
                input: "control".to_string(),
                iteration,
            });
        }
        self.controls += 1;
        self.control_skipped |= skipped;
        self.received += 1;
        Ok(())
    }

    /// Check if every dependency of the iteration has arrived.
    pub fn is_ready(&self, base: &ActorBase) -> bool {
        self.received == base.running_dependent_msg_count
    }

    /// Consume the tracker.
    pub fn into_inputs(self, base: &ActorBase) -> Inputs {
        let dead = self.control_skipped
            || self
                .slots
                .iter()
                .zip(&base.input_slots)
                .any(|(state, spec)| spec.expected > 0 && state.value.is_none());
        Inputs {
            values: self.slots.into_iter().map(|s| s.value).collect(),
            dead,
        }
    }
}

/// Pending iterations of one actor within one run.
#[derive(Debug, Default)]
pub struct PendingInputs {
    run: Option<RunId>,
    next_iteration: u64,
    trackers: HashMap<u64, InputTracker>,
}

impl PendingInputs {
    /// Tracker for `iteration`, rejecting iterations that already fired.
    pub fn tracker(&mut self, base: &ActorBase, run: RunId, iteration: u64, input: &str) -> Result<&mut InputTracker> {
        if self.run != Some(run) {
            self.run = Some(run);
            self.next_iteration = 0;
            self.trackers.clear();
        }
        if iteration < self.next_iteration {
            return Err(EngineError::DuplicateDelivery {
                actor: base.id.to_string(),
                input: input.to_string(),
                iteration,
            });
        }
        Ok(self
            .trackers
            .entry(iteration)
            .or_insert_with(|| InputTracker::new(base)))
    }

    /// Remove the tracker of `iteration` if it is ready.
    pub fn take_ready(&mut self, base: &ActorBase, iteration: u64) -> Option<InputTracker> {
        let ready = self
            .trackers
            .get(&iteration)
            .is_some_and(|t| t.is_ready(base));
        if !ready {
            return None;
        }
        self.next_iteration = self.next_iteration.max(iteration + 1);
        self.trackers.remove(&iteration)
    }

    /// Number of iterations waiting for inputs.
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

/// Everything an actor needs while handling one message.
pub struct ActorContext<'a> {
    /// The actor's topology.
    pub base: &'a ActorBase,
    /// Current run.
    pub run: &'a Arc<RunContext>,
    /// Message router.
    pub router: &'a ActorRouter,
    /// Iteration being handled.
    pub iteration: u64,
}

impl<'a> ActorContext<'a> {
    /// Send a message on behalf of this actor.
    pub fn send(&self, to: &ActorId, message: ActorMessage) -> Result<()> {
        self.router.send(self.run, to, message)
    }

    /// Send `payload` along every data and result arrow of output `index`.
    pub fn forward_output(&self, index: usize, payload: &Payload) -> Result<()> {
        for arrow in self
            .base
            .output_data_arrows
            .iter()
            .filter(|a| a.from_output_index == index)
        {
            self.send(
                &arrow.to_actor_id,
                ActorMessage::Data {
                    iteration: self.iteration,
                    from: self.base.id.clone(),
                    input_index: arrow.to_input_index,
                    payload: payload.clone(),
                },
            )?;
        }
        for arrow in self
            .base
            .output_result_arrows
            .iter()
            .filter(|a| a.from_output_index == index)
        {
            self.send(
                &arrow.to_actor_id,
                ActorMessage::Result {
                    iteration: self.iteration,
                    from: self.base.id.clone(),
                    position: arrow.position,
                    payload: payload.clone(),
                },
            )?;
        }
        Ok(())
    }

    /// Forward a freshly produced tensor, releasing it if nobody consumes it.
    pub fn publish_output(&self, index: usize, tensor: &Arc<DeviceTensor>) -> Result<()> {
        self.forward_output(index, &Payload::Tensor(Arc::clone(tensor)))?;
        if self.base.is_unconsumed(index) {
            tensor.release()?;
        }
        Ok(())
    }

    /// Signal `arrows`.
    pub fn send_controls(&self, arrows: &[ControlArrow], skipped: bool) -> Result<()> {
        for arrow in arrows {
            self.send(
                &arrow.to_actor_id,
                ActorMessage::Control {
                    iteration: self.iteration,
                    from: self.base.id.clone(),
                    skipped,
                },
            )?;
        }
        Ok(())
    }

    /// Signal every outgoing control arrow.
    pub fn send_output_controls(&self) -> Result<()> {
        self.send_controls(&self.base.output_control_arrows, false)
    }

    /// Send skip markers along every outgoing arrow.
    pub fn skip_all(&self) -> Result<()> {
        for index in 0..self.base.num_outputs() {
            self.forward_output(index, &Payload::Skipped)?;
        }
        self.send_controls(&self.base.output_control_arrows, true)
    }

    /// Allocate a tensor for this run on `device`.
    pub fn new_tensor(
        &self,
        device: &Arc<dyn DeviceContext>,
        size: usize,
        meta: TensorMeta,
        ref_count: usize,
    ) -> Result<Arc<DeviceTensor>> {
        let tensor = DeviceTensor::transient(Arc::clone(device), size, meta, ref_count);
        tensor.allocate(&self.base.id)?;
        self.run.track(&tensor);
        Ok(tensor)
    }

    /// Allocate the tensor for output `index`.
    pub fn new_output(
        &self,
        device: &Arc<dyn DeviceContext>,
        index: usize,
        size: usize,
        meta: TensorMeta,
    ) -> Result<Arc<DeviceTensor>> {
        self.new_tensor(device, size, meta, self.base.original_ref_count(index))
    }

    /// Drop this actor's references to its delivered inputs.
    pub fn release_inputs(&self, inputs: &[Option<Arc<DeviceTensor>>]) -> Result<()> {
        for (slot, value) in self.base.input_slots.iter().zip(inputs) {
            if let Some(tensor) = value {
                tensor.release_by(slot.release_weight)?;
            }
        }
        Ok(())
    }
}

/// Free tensors that never left the actor.
pub(crate) fn free_all(tensors: &[Arc<DeviceTensor>]) {
    for tensor in tensors {
        tensor.force_free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::TestDevice;

    fn base(slots: &[usize], controls: usize) -> ActorBase {
        let mut base = ActorBase::new(ActorId::new("k"), vec![TestDevice::new(0)]);
        base.input_slots = slots
            .iter()
            .map(|&expected| InputSlot {
                expected,
                release_weight: 1,
            })
            .collect();
        base.input_control_arrows = (0..controls).map(|i| ActorId::new(format!("c{}", i))).collect();
        base.update_dependent_count();
        base
    }

    fn tensor() -> Payload {
        Payload::Tensor(DeviceTensor::transient(TestDevice::new(0), 4, TensorMeta::bytes(4), 1))
    }

    #[derive(Clone, Copy, Debug)]
    enum Delivery {
        Data(usize),
        Control,
    }

    fn permutations(items: &[Delivery]) -> Vec<Vec<Delivery>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_ready_invariant_under_permutation() {
        let base = base(&[1, 2], 1);
        let deliveries = [
            Delivery::Data(0),
            Delivery::Data(1),
            Delivery::Data(1),
            Delivery::Control,
        ];

        for order in permutations(&deliveries) {
            let mut tracker = InputTracker::new(&base);
            // Slot 1 is a merge: one real value and one skip marker.
            let mut merge_seen = 0;
            for d in &order {
                assert!(!tracker.is_ready(&base), "ready early in {:?}", order);
                match d {
                    Delivery::Data(1) => {
                        let payload = if merge_seen == 0 { tensor() } else { Payload::Skipped };
                        merge_seen += 1;
                        tracker.on_data(&base, 0, 1, payload).unwrap();
                    }
                    Delivery::Data(i) => tracker.on_data(&base, 0, *i, tensor()).unwrap(),
                    Delivery::Control => tracker.on_control(&base, 0, false).unwrap(),
                }
            }
            assert!(tracker.is_ready(&base), "not ready after {:?}", order);
            assert!(!tracker.into_inputs(&base).dead);
        }
    }

    #[test]
    fn test_over_delivery_rejected() {
        let base = base(&[1], 1);
        let mut tracker = InputTracker::new(&base);
        tracker.on_data(&base, 4, 0, tensor()).unwrap();
        let err = tracker.on_data(&base, 4, 0, tensor()).unwrap_err();
        assert_eq!(
            err,
            EngineError::DuplicateDelivery {
                actor: "k".to_string(),
                input: "input 0".to_string(),
                iteration: 4,
            }
        );

        tracker.on_control(&base, 4, false).unwrap();
        assert!(tracker.on_control(&base, 4, false).is_err());
    }

    #[test]
    fn test_merge_slot_takes_one_value() {
        let base = base(&[2], 0);
        let mut tracker = InputTracker::new(&base);
        tracker.on_data(&base, 0, 0, tensor()).unwrap();
        assert!(tracker.on_data(&base, 0, 0, tensor()).is_err());

        let mut tracker = InputTracker::new(&base);
        tracker.on_data(&base, 0, 0, Payload::Skipped).unwrap();
        tracker.on_data(&base, 0, 0, tensor()).unwrap();
        let inputs = tracker.into_inputs(&base);
        assert!(!inputs.dead);
        assert!(inputs.values[0].is_some());
    }

    #[test]
    fn test_dead_inputs() {
        let base = base(&[1], 1);
        let mut tracker = InputTracker::new(&base);
        tracker.on_data(&base, 0, 0, Payload::Skipped).unwrap();
        tracker.on_control(&base, 0, false).unwrap();
        assert!(tracker.into_inputs(&base).dead);

        let mut tracker = InputTracker::new(&base);
        tracker.on_data(&base, 0, 0, tensor()).unwrap();
        tracker.on_control(&base, 0, true).unwrap();
        assert!(tracker.into_inputs(&base).dead);
    }

    #[test]
    fn test_store_slot_rejects_data() {
        let base = base(&[0, 1], 0);
        let mut tracker = InputTracker::new(&base);
        assert!(tracker.on_data(&base, 0, 0, tensor()).unwrap_err().is_protocol());
        assert!(tracker.on_data(&base, 0, 7, tensor()).unwrap_err().is_protocol());
    }

    #[test]
    fn test_pending_rejects_fired_iteration() {
        let base = base(&[], 1);
        let mut pending = PendingInputs::default();
        let run = RunId(1);

        pending
            .tracker(&base, run, 0, "control")
            .unwrap()
            .on_control(&base, 0, false)
            .unwrap();
        assert!(pending.take_ready(&base, 0).is_some());
        assert!(pending.tracker(&base, run, 0, "control").is_err());

        // A new run starts from iteration 0 again.
        assert!(pending.tracker(&base, RunId(2), 0, "control").is_ok());
    }
}
