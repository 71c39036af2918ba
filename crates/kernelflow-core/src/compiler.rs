//! Graph compiler: turns a [`GraphDescriptor`] into an [`ActorSet`].
//!
//! Compilation runs once per graph. It validates the descriptor, creates one
//! actor per node (host inputs on the same device share one data source),
//! wires data, control and result arrows, connects the loop actors, and
//! computes the static reference counts every produced tensor starts with.
//!
//! # Reference counts
//!
//! A consumer slot accounts for one reference. Relays (gather inputs and
//! switch value inputs) pass values through unchanged, so a slot feeding a
//! relay accounts for every reference the relay hands on: its weight is the
//! fan-out of the relayed output(s), and at least one. A producer output's
//! fan-out is the sum of the weights of the slots it feeds plus one per
//! result arrow.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info};

use crate::actor::{
    Actor, ActorBase, ActorKind, CopyActor, DataPrepareActor, DataSourceActor, GatherActor, InputSlot,
    KernelActor, LoopCountActor, OutputActor, SuperKernelActor, SuperKernelStep, SwitchActor,
};
use crate::arrow::{ControlArrow, DataArrow, InputDataArrow, ResultArrow};
use crate::device::{DeviceContext, DeviceRegistry};
use crate::error::{EngineError, Result};
use crate::graph::{ControlDep, GraphDescriptor, GraphNode, KernelRef, NodeInput, NodeKind, SinkGraph, SinkValue};
use crate::kernel::{Kernel, KernelRegistry};
use crate::queue::DataQueue;
use crate::types::{ActorId, DeviceContextKey, TensorMeta};

/// Id of the data prepare actor.
pub const DATA_PREPARE_ACTOR: &str = "DataPrepareActor";
/// Id of the loop count actor.
pub const LOOP_COUNT_ACTOR: &str = "LoopCountActor";
/// Id of the output actor.
pub const OUTPUT_ACTOR: &str = "OutputActor";
/// Suffix of host-queue data source ids, prefixed by the device key.
pub const HOST_SOURCE_SUFFIX: &str = "_HostDSActor";

/// Compiled, immutable actor topology of one graph.
pub struct ActorSet {
    /// Graph name.
    pub name: String,
    actors: Vec<Arc<Actor>>,
    index: HashMap<ActorId, usize>,
    /// Data prepare actor.
    pub data_prepare: ActorId,
    /// Loop count actor.
    pub loop_count: ActorId,
    /// Output actor.
    pub output: ActorId,
    /// Kernel and super kernel actors triggered only by data prepare.
    pub no_input_actors: Vec<ActorId>,
    /// Expected host input metadata by position.
    pub host_inputs: Vec<TensorMeta>,
    /// Devices the graph runs on.
    pub devices: Vec<Arc<dyn DeviceContext>>,
}

impl ActorSet {
    /// All actors in creation order.
    pub fn actors(&self) -> &[Arc<Actor>] {
        &self.actors
    }

    /// Look up an actor.
    pub fn get(&self, id: &ActorId) -> Option<&Arc<Actor>> {
        self.index.get(id).map(|&i| &self.actors[i])
    }

    /// Actors of one kind, by [`ActorKind::name`].
    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Arc<Actor>> + 'a {
        self.actors.iter().filter(move |a| a.kind.name() == kind)
    }

    /// Number of actors.
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    /// Check if the set has no actors.
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Number of user-visible outputs.
    pub fn num_outputs(&self) -> usize {
        self.get(&self.output)
            .and_then(|a| match &a.kind {
                ActorKind::Output(o) => Some(o.positions()),
                _ => None,
            })
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ActorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorSet")
            .field("name", &self.name)
            .field("actors", &self.actors.len())
            .field("host_inputs", &self.host_inputs.len())
            .finish()
    }
}

/// Node with its kernels and devices resolved.
struct Resolved {
    device: Arc<dyn DeviceContext>,
    kind: ResolvedKind,
}

enum ResolvedKind {
    HostInput { position: usize, meta: TensorMeta },
    DeviceQueue { queue: Arc<dyn DataQueue>, metas: Vec<TensorMeta> },
    Kernel(Arc<dyn Kernel>),
    SuperKernel { steps: Vec<SuperKernelStep>, outputs: Vec<SinkValue> },
    Copy(Arc<dyn DeviceContext>),
    Gather(usize),
    Switch { branches: usize, values: usize },
}

impl Resolved {
    fn num_inputs(&self, node: &GraphNode) -> usize {
        match &self.kind {
            ResolvedKind::HostInput { .. } | ResolvedKind::DeviceQueue { .. } => 0,
            ResolvedKind::Kernel(k) => k.input_size_list().len(),
            ResolvedKind::SuperKernel { .. } => node.inputs.len(),
            ResolvedKind::Copy(_) => 1,
            ResolvedKind::Gather(arity) => *arity,
            ResolvedKind::Switch { values, .. } => values + 1,
        }
    }

    fn num_outputs(&self) -> usize {
        match &self.kind {
            ResolvedKind::HostInput { .. } => 1,
            ResolvedKind::DeviceQueue { metas, .. } => metas.len(),
            ResolvedKind::Kernel(k) => k.output_size_list().len(),
            ResolvedKind::SuperKernel { outputs, .. } => outputs.len(),
            ResolvedKind::Copy(_) => 1,
            ResolvedKind::Gather(arity) => *arity,
            ResolvedKind::Switch { branches, values } => branches * values,
        }
    }
}

fn invalid(node: &str, message: impl std::fmt::Display) -> EngineError {
    EngineError::invalid_graph(format!("node '{}': {}", node, message))
}

fn lookup_device(devices: &DeviceRegistry, node: &str, key: &DeviceContextKey) -> Result<Arc<dyn DeviceContext>> {
    devices
        .get(key)
        .ok_or_else(|| invalid(node, format_args!("device {} is not registered", key)))
}

fn instantiate(kernels: &KernelRegistry, device: &DeviceContextKey, kernel: &KernelRef) -> Result<Arc<dyn Kernel>> {
    match kernel {
        KernelRef::Instance(k) => Ok(Arc::clone(k)),
        KernelRef::Registered { op, signature } => kernels.create(op, &device.device_name, signature),
    }
}

fn resolve_super_kernel(
    node: &GraphNode,
    kernels: &KernelRegistry,
    sink: &SinkGraph,
) -> Result<ResolvedKind> {
    let mut steps: Vec<SuperKernelStep> = Vec::with_capacity(sink.kernels.len());
    let check = |value: &SinkValue, steps: &[SuperKernelStep], what: &str| -> Result<()> {
        match *value {
            SinkValue::Input(n) if n >= node.inputs.len() => Err(invalid(
                &node.name,
                format_args!("{} reads input {} of {}", what, n, node.inputs.len()),
            )),
            SinkValue::Input(_) => Ok(()),
            SinkValue::Kernel { index, output_index } => {
                let step = steps.get(index).ok_or_else(|| {
                    invalid(&node.name, format_args!("{} reads kernel {} before it runs", what, index))
                })?;
                if output_index >= step.kernel.output_size_list().len() {
                    return Err(invalid(
                        &node.name,
                        format_args!("{} reads missing output {} of '{}'", what, output_index, step.name),
                    ));
                }
                Ok(())
            }
        }
    };

    for sink_kernel in &sink.kernels {
        for value in &sink_kernel.inputs {
            check(value, &steps, &format!("step '{}'", sink_kernel.name))?;
        }
        let kernel = instantiate(kernels, &node.device, &sink_kernel.kernel)?;
        if kernel.input_size_list().len() != sink_kernel.inputs.len() {
            return Err(invalid(
                &node.name,
                format_args!(
                    "step '{}' declares {} inputs, kernel takes {}",
                    sink_kernel.name,
                    sink_kernel.inputs.len(),
                    kernel.input_size_list().len()
                ),
            ));
        }
        steps.push(SuperKernelStep {
            name: sink_kernel.name.clone(),
            kernel,
            inputs: sink_kernel.inputs.clone(),
        });
    }
    for value in &sink.outputs {
        if matches!(value, SinkValue::Input(_)) {
            return Err(invalid(&node.name, "super kernel outputs must be kernel values"));
        }
        check(value, &steps, "output")?;
    }
    Ok(ResolvedKind::SuperKernel {
        steps,
        outputs: sink.outputs.clone(),
    })
}

fn resolve(node: &GraphNode, devices: &DeviceRegistry, kernels: &KernelRegistry) -> Result<Resolved> {
    let device = lookup_device(devices, &node.name, &node.device)?;
    let kind = match &node.kind {
        NodeKind::HostInput { position, meta } => ResolvedKind::HostInput {
            position: *position,
            meta: meta.clone(),
        },
        NodeKind::DeviceQueue { queue, metas } => {
            if metas.is_empty() {
                return Err(invalid(&node.name, "device queue has no outputs"));
            }
            ResolvedKind::DeviceQueue {
                queue: Arc::clone(queue),
                metas: metas.clone(),
            }
        }
        NodeKind::Kernel(kernel) => ResolvedKind::Kernel(instantiate(kernels, &node.device, kernel)?),
        NodeKind::SuperKernel(sink) => resolve_super_kernel(node, kernels, sink)?,
        NodeKind::Copy { target } => ResolvedKind::Copy(lookup_device(devices, &node.name, target)?),
        NodeKind::Gather { arity } => ResolvedKind::Gather(*arity),
        NodeKind::Switch { branches, values } => {
            if *branches < 2 {
                return Err(invalid(&node.name, "switch needs at least two branches"));
            }
            ResolvedKind::Switch {
                branches: *branches,
                values: *values,
            }
        }
    };
    let resolved = Resolved { device, kind };
    let expected = resolved.num_inputs(node);
    if node.inputs.len() != expected {
        return Err(invalid(
            &node.name,
            format_args!("{} takes {} inputs, got {}", node.kind.as_str(), expected, node.inputs.len()),
        ));
    }
    Ok(resolved)
}

/// Descriptor plus lookup tables shared by the compile passes.
struct Graph<'g> {
    desc: &'g GraphDescriptor,
    resolved: Vec<Resolved>,
    by_name: HashMap<&'g str, usize>,
}

impl<'g> Graph<'g> {
    fn node_index(&self, from: &str, name: &str) -> Result<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| invalid(from, format_args!("references unknown node '{}'", name)))
    }

    /// Check a value reference. Returns the producing node.
    fn check_source(&self, from: &str, input: &NodeInput) -> Result<usize> {
        match input {
            NodeInput::Node { name, output_index } => {
                let index = self.node_index(from, name)?;
                let resolved = &self.resolved[index];
                if matches!(resolved.kind, ResolvedKind::Switch { .. }) {
                    return Err(invalid(
                        from,
                        format_args!("switch '{}' outputs must be read per branch", name),
                    ));
                }
                if *output_index >= resolved.num_outputs() {
                    return Err(invalid(
                        from,
                        format_args!("'{}' has no output {}", name, output_index),
                    ));
                }
                Ok(index)
            }
            NodeInput::Branch {
                switch,
                branch,
                value_index,
            } => {
                let index = self.node_index(from, switch)?;
                match self.resolved[index].kind {
                    ResolvedKind::Switch { branches, values } if *branch < branches && *value_index < values => {
                        Ok(index)
                    }
                    ResolvedKind::Switch { .. } => Err(invalid(
                        from,
                        format_args!("switch '{}' has no branch {} value {}", switch, branch, value_index),
                    )),
                    _ => Err(invalid(from, format_args!("'{}' is not a switch", switch))),
                }
            }
            NodeInput::Store { .. } => Err(invalid(from, "store values are only valid as kernel inputs")),
            NodeInput::Merge(_) => Err(invalid(from, "merges cannot be nested")),
        }
    }

    /// Producers of one input, merges flattened.
    fn check_input(&self, from: &str, input: &NodeInput) -> Result<Vec<usize>> {
        match input {
            NodeInput::Merge(sources) if sources.is_empty() => Err(invalid(from, "empty merge")),
            NodeInput::Merge(sources) => sources.iter().map(|s| self.check_source(from, s)).collect(),
            other => self.check_source(from, other).map(|i| vec![i]),
        }
    }

    /// Validate references and return the nodes each node depends on.
    fn dependencies(&self) -> Result<Vec<Vec<usize>>> {
        let mut deps = Vec::with_capacity(self.desc.nodes.len());
        for (node, resolved) in self.desc.nodes.iter().zip(&self.resolved) {
            if matches!(resolved.kind, ResolvedKind::HostInput { .. }) && !node.control_deps.is_empty() {
                return Err(invalid(&node.name, "host inputs cannot have control dependencies"));
            }
            let mut node_deps = Vec::new();
            for input in &node.inputs {
                match input {
                    NodeInput::Store { key } => {
                        if !matches!(resolved.kind, ResolvedKind::Kernel(_) | ResolvedKind::SuperKernel { .. }) {
                            return Err(invalid(
                                &node.name,
                                format_args!("store key '{}' feeds a {} node", key, node.kind.as_str()),
                            ));
                        }
                    }
                    other => node_deps.extend(self.check_input(&node.name, other)?),
                }
            }
            for dep in &node.control_deps {
                let index = match dep {
                    ControlDep::Node(name) => self.node_index(&node.name, name)?,
                    ControlDep::Branch { switch, branch } => {
                        let index = self.node_index(&node.name, switch)?;
                        match self.resolved[index].kind {
                            ResolvedKind::Switch { branches, .. } if *branch < branches => index,
                            _ => {
                                return Err(invalid(
                                    &node.name,
                                    format_args!("control dependency on missing branch {} of '{}'", branch, switch),
                                ))
                            }
                        }
                    }
                };
                node_deps.push(index);
            }
            deps.push(node_deps);
        }
        for (position, output) in self.desc.outputs.iter().enumerate() {
            self.check_input(&format!("output {}", position), output)?;
        }
        Ok(deps)
    }

    /// Kahn's algorithm, stable with respect to declaration order.
    fn topological_order(&self, deps: &[Vec<usize>]) -> Result<Vec<usize>> {
        let n = self.desc.nodes.len();
        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut consumers: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, node_deps) in deps.iter().enumerate() {
            for &dep in node_deps {
                consumers[dep].push(node);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| pending[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &consumer in &consumers[node] {
                pending[consumer] -= 1;
                if pending[consumer] == 0 {
                    ready.push_back(consumer);
                }
            }
        }
        if order.len() != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|i| pending[*i] > 0)
                .map(|i| self.desc.nodes[i].name.as_str())
                .collect();
            return Err(EngineError::invalid_graph(format!(
                "graph '{}' has a cycle through {}",
                self.desc.name,
                stuck.join(", ")
            )));
        }
        Ok(order)
    }

    fn host_input_metas(&self) -> Result<Vec<TensorMeta>> {
        let mut metas: Vec<Option<TensorMeta>> = Vec::new();
        for (node, resolved) in self.desc.nodes.iter().zip(&self.resolved) {
            if let ResolvedKind::HostInput { position, meta } = &resolved.kind {
                if metas.len() <= *position {
                    metas.resize(*position + 1, None);
                }
                if metas[*position].replace(meta.clone()).is_some() {
                    return Err(invalid(&node.name, format_args!("host input position {} is taken", position)));
                }
            }
        }
        metas
            .into_iter()
            .enumerate()
            .map(|(position, meta)| {
                meta.ok_or_else(|| {
                    EngineError::invalid_graph(format!("no host input declared at position {}", position))
                })
            })
            .collect()
    }

    /// A queue has a single consumer, so no two sources may share one.
    fn check_queue_consumers(&self) -> Result<()> {
        let mut seen: Vec<(&str, &Arc<dyn DataQueue>)> = Vec::new();
        for (node, resolved) in self.desc.nodes.iter().zip(&self.resolved) {
            if let ResolvedKind::DeviceQueue { queue, .. } = &resolved.kind {
                if let Some((other, _)) = seen.iter().find(|(_, q)| Arc::ptr_eq(*q, queue)) {
                    return Err(invalid(&node.name, format_args!("queue already consumed by '{}'", other)));
                }
                seen.push((node.name.as_str(), queue));
            }
        }
        Ok(())
    }
}

fn check_names(graph: &GraphDescriptor) -> Result<HashMap<&str, usize>> {
    let mut by_name = HashMap::with_capacity(graph.nodes.len());
    for (index, node) in graph.nodes.iter().enumerate() {
        let name = node.name.as_str();
        if name.is_empty() {
            return Err(EngineError::invalid_graph(format!("node {} has an empty name", index)));
        }
        if [DATA_PREPARE_ACTOR, LOOP_COUNT_ACTOR, OUTPUT_ACTOR].contains(&name) || name.ends_with(HOST_SOURCE_SUFFIX) {
            return Err(invalid(name, "name is reserved"));
        }
        if by_name.insert(name, index).is_some() {
            return Err(invalid(name, "duplicate node name"));
        }
    }
    Ok(by_name)
}

/// Actor under construction.
struct Draft {
    base: ActorBase,
    kind: ActorKind,
}

/// Mutable actor table used while wiring.
struct Wiring {
    drafts: Vec<Draft>,
    index: HashMap<ActorId, usize>,
}

impl Wiring {
    fn add(&mut self, base: ActorBase, kind: ActorKind, num_inputs: usize, num_outputs: usize) -> usize {
        let mut base = base;
        base.input_slots = vec![InputSlot::default(); num_inputs];
        base.output_fanout = vec![0; num_outputs];
        base.output_sizes = vec![None; num_outputs];
        let index = self.drafts.len();
        self.index.insert(base.id.clone(), index);
        self.drafts.push(Draft { base, kind });
        index
    }

    fn id(&self, actor: usize) -> ActorId {
        self.drafts[actor].base.id.clone()
    }

    fn connect_data(&mut self, from: (usize, usize), to: usize, input_index: usize) {
        let (producer, output) = from;
        let to_id = self.id(to);
        let from_id = self.id(producer);
        self.drafts[producer]
            .base
            .output_data_arrows
            .push(DataArrow::new(output, to_id, input_index));
        let consumer = &mut self.drafts[to].base;
        consumer.input_data_arrows.push(InputDataArrow {
            from_actor_id: from_id,
            from_output_index: output,
            to_input_index: input_index,
        });
        consumer.input_slots[input_index].expected += 1;
    }

    fn connect_control(&mut self, from: usize, to: usize) {
        let to_id = self.id(to);
        let from_id = self.id(from);
        self.drafts[from].base.output_control_arrows.push(ControlArrow::new(to_id));
        self.drafts[to].base.input_control_arrows.push(from_id);
    }

    fn is_worker(&self, actor: usize) -> bool {
        self.drafts[actor].kind.behavior().is_some()
    }

    /// Weighted fan-out pass, consumers before producers.
    fn compute_ref_counts(&mut self) {
        for actor in (0..self.drafts.len()).rev() {
            if !self.is_worker(actor) {
                continue;
            }
            let mut fanout = vec![0usize; self.drafts[actor].base.output_fanout.len()];
            for arrow in &self.drafts[actor].base.output_data_arrows {
                let consumer = self.index[&arrow.to_actor_id];
                fanout[arrow.from_output_index] += self.drafts[consumer].base.input_slots[arrow.to_input_index].release_weight;
            }
            for arrow in &self.drafts[actor].base.output_result_arrows {
                fanout[arrow.from_output_index] += 1;
            }

            let draft = &mut self.drafts[actor];
            for (index, slot) in draft.base.input_slots.iter_mut().enumerate() {
                slot.release_weight = if slot.expected == 0 {
                    0
                } else {
                    match &draft.kind {
                        ActorKind::Gather(_) => fanout[index].max(1),
                        ActorKind::Switch(s) if index > 0 => (0..s.branches)
                            .map(|b| fanout[s.output_index(b, index - 1)])
                            .sum::<usize>()
                            .max(1),
                        _ => 1,
                    }
                };
            }
            draft.base.output_fanout = fanout;
        }
    }

    /// Static output sizes, producers before consumers.
    fn compute_output_sizes(&mut self) {
        for actor in 0..self.drafts.len() {
            let input_size = |slot: usize| -> Option<usize> {
                let base = &self.drafts[actor].base;
                let mut sizes = base
                    .input_data_arrows
                    .iter()
                    .filter(|a| a.to_input_index == slot)
                    .map(|a| {
                        self.index
                            .get(&a.from_actor_id)
                            .and_then(|&p| self.drafts[p].base.output_sizes.get(a.from_output_index).copied().flatten())
                    });
                let first = sizes.next().flatten()?;
                sizes.all(|s| s == Some(first)).then_some(first)
            };
            let sizes: Vec<Option<usize>> = match &self.drafts[actor].kind {
                ActorKind::DataSource(s) => s.metas().iter().map(|m| Some(m.byte_size())).collect(),
                ActorKind::Kernel(k) => k.kernel.output_size_list().iter().map(|&s| Some(s)).collect(),
                ActorKind::SuperKernel(s) => s
                    .outputs
                    .iter()
                    .map(|v| match *v {
                        SinkValue::Kernel { index, output_index } => s
                            .steps
                            .get(index)
                            .and_then(|step| step.kernel.output_size_list().get(output_index).copied()),
                        SinkValue::Input(_) => None,
                    })
                    .collect(),
                ActorKind::Copy(_) => vec![input_size(0)],
                ActorKind::Gather(g) => (0..g.arity).map(input_size).collect(),
                ActorKind::Switch(s) => (0..s.branches)
                    .flat_map(|_| (0..s.values).map(|j| j + 1))
                    .map(input_size)
                    .collect(),
                ActorKind::DataPrepare(_) | ActorKind::LoopCount(_) | ActorKind::Output(_) => Vec::new(),
            };
            self.drafts[actor].base.output_sizes = sizes;
        }
    }
}

/// Compile `graph` against the given devices and kernel registry.
pub fn compile(graph: &GraphDescriptor, devices: &DeviceRegistry, kernels: &KernelRegistry) -> Result<ActorSet> {
    let by_name = check_names(graph)?;
    let resolved = graph
        .nodes
        .iter()
        .map(|n| resolve(n, devices, kernels))
        .collect::<Result<Vec<_>>>()?;
    let g = Graph {
        desc: graph,
        resolved,
        by_name,
    };
    let deps = g.dependencies()?;
    let order = g.topological_order(&deps)?;
    let host_inputs = g.host_input_metas()?;
    g.check_queue_consumers()?;

    let mut graph_devices: Vec<Arc<dyn DeviceContext>> = Vec::new();
    let mut seen_devices = HashSet::new();
    for r in &g.resolved {
        let targets = match &r.kind {
            ResolvedKind::Copy(target) => vec![&r.device, target],
            _ => vec![&r.device],
        };
        for device in targets {
            if seen_devices.insert(device.key().clone()) {
                graph_devices.push(Arc::clone(device));
            }
        }
    }

    let mut w = Wiring {
        drafts: Vec::new(),
        index: HashMap::new(),
    };
    let data_prepare = w.add(
        ActorBase::new(ActorId::new(DATA_PREPARE_ACTOR), Vec::new()),
        ActorKind::DataPrepare(DataPrepareActor),
        0,
        0,
    );

    // (actor, output offset) per node; host inputs map into their device's source.
    let mut node_actor: Vec<Option<(usize, usize)>> = vec![None; graph.nodes.len()];
    let mut host_sources: Vec<(DeviceContextKey, Vec<usize>)> = Vec::new();
    for &i in &order {
        if let ResolvedKind::HostInput { .. } = g.resolved[i].kind {
            let key = &graph.nodes[i].device;
            match host_sources.iter_mut().find(|(k, _)| k == key) {
                Some((_, nodes)) => nodes.push(i),
                None => host_sources.push((key.clone(), vec![i])),
            }
        }
    }
    for (key, nodes) in &host_sources {
        let mut positions = Vec::with_capacity(nodes.len());
        let mut metas = Vec::with_capacity(nodes.len());
        for (j, &i) in nodes.iter().enumerate() {
            if let ResolvedKind::HostInput { position, meta } = &g.resolved[i].kind {
                positions.push(*position);
                metas.push(meta.clone());
            }
            node_actor[i] = Some((w.drafts.len(), j));
        }
        let device = Arc::clone(&g.resolved[nodes[0]].device);
        let id = ActorId::new(format!("{}{}", key, HOST_SOURCE_SUFFIX));
        w.add(
            ActorBase::new(id, vec![device]),
            ActorKind::DataSource(DataSourceActor::host(positions, metas)),
            0,
            nodes.len(),
        );
    }

    for &i in &order {
        let node = &graph.nodes[i];
        let r = &g.resolved[i];
        let device = Arc::clone(&r.device);
        let (contexts, kind) = match &r.kind {
            ResolvedKind::HostInput { .. } => continue,
            ResolvedKind::DeviceQueue { queue, metas } => (
                vec![device],
                ActorKind::DataSource(DataSourceActor::device_queue(Arc::clone(queue), metas.clone())),
            ),
            ResolvedKind::Kernel(k) => (vec![device], ActorKind::Kernel(KernelActor::new(Arc::clone(k)))),
            ResolvedKind::SuperKernel { steps, outputs } => {
                let steps = steps
                    .iter()
                    .map(|s| SuperKernelStep {
                        name: s.name.clone(),
                        kernel: Arc::clone(&s.kernel),
                        inputs: s.inputs.clone(),
                    })
                    .collect();
                (
                    vec![device],
                    ActorKind::SuperKernel(SuperKernelActor::new(steps, outputs.clone())),
                )
            }
            ResolvedKind::Copy(target) => (
                vec![device, Arc::clone(target)],
                ActorKind::Copy(CopyActor::new(Arc::clone(target))),
            ),
            ResolvedKind::Gather(arity) => (vec![device], ActorKind::Gather(GatherActor { arity: *arity })),
            ResolvedKind::Switch { branches, values } => {
                (vec![device], ActorKind::Switch(SwitchActor::new(*branches, *values)))
            }
        };
        node_actor[i] = Some((w.drafts.len(), 0));
        w.add(
            ActorBase::new(ActorId::new(node.name.as_str()), contexts),
            kind,
            r.num_inputs(node),
            r.num_outputs(),
        );
    }

    let loop_count = w.add(
        ActorBase::new(ActorId::new(LOOP_COUNT_ACTOR), Vec::new()),
        ActorKind::LoopCount(LoopCountActor {
            data_prepare: ActorId::new(DATA_PREPARE_ACTOR),
            output: ActorId::new(OUTPUT_ACTOR),
        }),
        0,
        0,
    );
    let expected: Vec<usize> = graph
        .outputs
        .iter()
        .map(|o| match o {
            NodeInput::Merge(sources) => sources.len(),
            _ => 1,
        })
        .collect();
    let output = w.add(
        ActorBase::new(ActorId::new(OUTPUT_ACTOR), graph_devices.clone()),
        ActorKind::Output(OutputActor { expected }),
        0,
        0,
    );

    let source_of = |input: &NodeInput| -> Result<(usize, usize)> {
        let (name, output_index) = match input {
            NodeInput::Node { name, output_index } => (name, *output_index),
            NodeInput::Branch {
                switch,
                branch,
                value_index,
            } => {
                let values = match g.resolved[g.by_name[switch.as_str()]].kind {
                    ResolvedKind::Switch { values, .. } => values,
                    _ => 0,
                };
                (switch, branch * values + value_index)
            }
            NodeInput::Store { .. } | NodeInput::Merge(_) => {
                return Err(EngineError::Internal("unflattened node input".to_string()))
            }
        };
        let (actor, offset) = node_actor[g.by_name[name.as_str()]]
            .ok_or_else(|| EngineError::Internal(format!("node '{}' has no actor", name)))?;
        Ok((actor, offset + output_index))
    };
    let flatten = |input: &NodeInput| -> Vec<NodeInput> {
        match input {
            NodeInput::Merge(sources) => sources.clone(),
            other => vec![other.clone()],
        }
    };

    for &i in &order {
        let node = &graph.nodes[i];
        let Some((actor, _)) = node_actor[i] else {
            continue;
        };
        if matches!(g.resolved[i].kind, ResolvedKind::HostInput { .. }) {
            continue;
        }
        for (input_index, input) in node.inputs.iter().enumerate() {
            if let NodeInput::Store { key } = input {
                w.drafts[actor]
                    .base
                    .device_tensor_store_keys
                    .push((input_index, key.clone()));
                continue;
            }
            for source in flatten(input) {
                let from = source_of(&source)?;
                w.connect_data(from, actor, input_index);
            }
        }
        for dep in &node.control_deps {
            match dep {
                ControlDep::Node(name) => {
                    let (from, _) = node_actor[g.by_name[name.as_str()]]
                        .ok_or_else(|| EngineError::Internal(format!("node '{}' has no actor", name)))?;
                    w.connect_control(from, actor);
                }
                ControlDep::Branch { switch, branch } => {
                    let (from, _) = node_actor[g.by_name[switch.as_str()]]
                        .ok_or_else(|| EngineError::Internal(format!("node '{}' has no actor", switch)))?;
                    let to_id = w.id(actor);
                    let from_id = w.id(from);
                    if let ActorKind::Switch(s) = &mut w.drafts[from].kind {
                        s.branch_control_arrows[*branch].push(ControlArrow::new(to_id));
                    }
                    w.drafts[actor].base.input_control_arrows.push(from_id);
                }
            }
        }
    }

    let output_id = w.id(output);
    for (position, out) in graph.outputs.iter().enumerate() {
        for source in flatten(out) {
            let (actor, index) = source_of(&source)?;
            w.drafts[actor]
                .base
                .output_result_arrows
                .push(ResultArrow::new(index, output_id.clone(), position));
        }
    }

    // Loop wiring.
    let mut no_input_actors = Vec::new();
    let mut sinks = Vec::new();
    for actor in 0..w.drafts.len() {
        if !w.is_worker(actor) {
            continue;
        }
        let draft = &w.drafts[actor];
        let has_inputs =
            draft.base.input_slots.iter().any(|s| s.expected > 0) || !draft.base.input_control_arrows.is_empty();
        let has_branch_controls = match &draft.kind {
            ActorKind::Switch(s) => s.branch_control_arrows.iter().any(|a| !a.is_empty()),
            _ => false,
        };
        let is_sink =
            draft.base.output_data_arrows.is_empty() && draft.base.output_control_arrows.is_empty() && !has_branch_controls;
        if !has_inputs && matches!(draft.kind, ActorKind::Kernel(_) | ActorKind::SuperKernel(_)) {
            no_input_actors.push(draft.base.id.clone());
        }
        if is_sink {
            sinks.push(actor);
        }
        if !has_inputs {
            w.connect_control(data_prepare, actor);
        }
    }
    if sinks.is_empty() {
        w.connect_control(data_prepare, loop_count);
    }
    for sink in sinks {
        w.connect_control(sink, loop_count);
    }
    w.connect_control(loop_count, output);
    w.connect_control(loop_count, data_prepare);

    w.compute_ref_counts();
    w.compute_output_sizes();

    let actors: Vec<Arc<Actor>> = w
        .drafts
        .into_iter()
        .map(|mut d| {
            d.base.update_dependent_count();
            debug!(
                actor = %d.base.id,
                kind = d.kind.name(),
                dependents = d.base.running_dependent_msg_count,
                fanout = ?d.base.output_fanout,
                "actor compiled"
            );
            Arc::new(Actor::new(d.base, d.kind))
        })
        .collect();

    info!(
        graph = %graph.name,
        actors = actors.len(),
        host_inputs = host_inputs.len(),
        outputs = graph.outputs.len(),
        "actor set compiled"
    );

    Ok(ActorSet {
        name: graph.name.clone(),
        index: w.index,
        actors,
        data_prepare: ActorId::new(DATA_PREPARE_ACTOR),
        loop_count: ActorId::new(LOOP_COUNT_ACTOR),
        output: ActorId::new(OUTPUT_ACTOR),
        no_input_actors,
        host_inputs,
        devices: graph_devices,
    })
}
