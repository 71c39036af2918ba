//! Compiled-graph descriptor consumed by the engine.
//!
//! The descriptor is the hand-off point from the graph compiler: kernels are
//! already selected and placed on devices. It is immutable once built; the
//! [`compiler`](crate::compiler) turns it into an actor set.
//!
//! Nodes refer to each other by name. Switch outputs are addressed per
//! branch with [`NodeInput::Branch`]; a [`NodeInput::Merge`] joins values
//! coming from mutually exclusive branches into one input.

use std::fmt;
use std::sync::Arc;

use crate::kernel::{Kernel, KernelSignature};
use crate::queue::DataQueue;
use crate::types::{DeviceContextKey, TensorMeta};

/// Kernel attached to a node.
#[derive(Clone)]
pub enum KernelRef {
    /// Ready kernel instance.
    Instance(Arc<dyn Kernel>),
    /// Kernel created from the registry for the node's device family.
    Registered {
        /// Operator name.
        op: String,
        /// Instantiation signature.
        signature: KernelSignature,
    },
}

impl KernelRef {
    /// Reference a registered operator.
    pub fn registered(op: impl Into<String>, signature: KernelSignature) -> Self {
        Self::Registered {
            op: op.into(),
            signature,
        }
    }
}

impl From<Arc<dyn Kernel>> for KernelRef {
    fn from(kernel: Arc<dyn Kernel>) -> Self {
        Self::Instance(kernel)
    }
}

impl fmt::Debug for KernelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(k) => f.debug_tuple("Instance").field(&k.name()).finish(),
            Self::Registered { op, .. } => f.debug_tuple("Registered").field(op).finish(),
        }
    }
}

/// Where an input value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeInput {
    /// Output `output_index` of node `name`.
    Node {
        /// Producer node.
        name: String,
        /// Output index on the producer.
        output_index: usize,
    },
    /// Value `value_index` of a switch, when `branch` is taken.
    Branch {
        /// Switch node.
        switch: String,
        /// Branch index.
        branch: usize,
        /// Switched value index.
        value_index: usize,
    },
    /// Persistent tensor from the device-tensor store.
    Store {
        /// Store key.
        key: String,
    },
    /// Exactly one of the listed sources produces a value per iteration.
    Merge(Vec<NodeInput>),
}

impl NodeInput {
    /// Output of another node.
    pub fn node(name: impl Into<String>, output_index: usize) -> Self {
        Self::Node {
            name: name.into(),
            output_index,
        }
    }

    /// Switch value on one branch.
    pub fn branch(switch: impl Into<String>, branch: usize, value_index: usize) -> Self {
        Self::Branch {
            switch: switch.into(),
            branch,
            value_index,
        }
    }

    /// Store lookup.
    pub fn store(key: impl Into<String>) -> Self {
        Self::Store { key: key.into() }
    }

    /// Merge of exclusive sources.
    pub fn merge(sources: impl IntoIterator<Item = NodeInput>) -> Self {
        Self::Merge(sources.into_iter().collect())
    }
}

/// Control dependency without data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDep {
    /// Run after node `name`.
    Node(String),
    /// Run only when `branch` of `switch` is taken.
    Branch {
        /// Switch node.
        switch: String,
        /// Branch index.
        branch: usize,
    },
}

/// Value inside a super kernel's subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkValue {
    /// Input of the super kernel node.
    Input(usize),
    /// Output of an earlier kernel in the subgraph.
    Kernel {
        /// Kernel position in execution order.
        index: usize,
        /// Output index on that kernel.
        output_index: usize,
    },
}

/// One kernel of a super kernel's subgraph.
#[derive(Debug, Clone)]
pub struct SinkKernel {
    /// Kernel name inside the subgraph.
    pub name: String,
    /// Kernel.
    pub kernel: KernelRef,
    /// Input values.
    pub inputs: Vec<SinkValue>,
}

/// Pre-scheduled subgraph executed as one unit.
#[derive(Debug, Clone, Default)]
pub struct SinkGraph {
    /// Kernels in execution order.
    pub kernels: Vec<SinkKernel>,
    /// Values exposed as the node's outputs.
    pub outputs: Vec<SinkValue>,
}

impl SinkGraph {
    /// Create an empty subgraph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a kernel. Returns `self` for chaining.
    pub fn kernel(
        mut self,
        name: impl Into<String>,
        kernel: impl Into<KernelRef>,
        inputs: impl IntoIterator<Item = SinkValue>,
    ) -> Self {
        self.kernels.push(SinkKernel {
            name: name.into(),
            kernel: kernel.into(),
            inputs: inputs.into_iter().collect(),
        });
        self
    }

    /// Expose a value as a node output.
    pub fn output(mut self, value: SinkValue) -> Self {
        self.outputs.push(value);
        self
    }
}

/// What a node does.
#[derive(Clone)]
pub enum NodeKind {
    /// Host-resident run input at `position`.
    HostInput {
        /// Position in the `execute` input list.
        position: usize,
        /// Expected tensor metadata.
        meta: TensorMeta,
    },
    /// Batches pulled from a data queue, one tensor per output.
    DeviceQueue {
        /// Source queue.
        queue: Arc<dyn DataQueue>,
        /// Metadata per output.
        metas: Vec<TensorMeta>,
    },
    /// Single kernel.
    Kernel(KernelRef),
    /// Fused subgraph.
    SuperKernel(SinkGraph),
    /// Copy of the single input onto `target`.
    Copy {
        /// Destination device.
        target: DeviceContextKey,
    },
    /// Relay of `arity` inputs as one positional list.
    Gather {
        /// Number of inputs and outputs.
        arity: usize,
    },
    /// Routes `values` inputs to one of `branches` branches. Input 0 is the
    /// condition.
    Switch {
        /// Number of branches.
        branches: usize,
        /// Number of switched values.
        values: usize,
    },
}

impl NodeKind {
    /// Short kind name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostInput { .. } => "host_input",
            Self::DeviceQueue { .. } => "device_queue",
            Self::Kernel(_) => "kernel",
            Self::SuperKernel(_) => "super_kernel",
            Self::Copy { .. } => "copy",
            Self::Gather { .. } => "gather",
            Self::Switch { .. } => "switch",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostInput { position, meta } => f
                .debug_struct("HostInput")
                .field("position", position)
                .field("meta", meta)
                .finish(),
            Self::DeviceQueue { queue, metas } => f
                .debug_struct("DeviceQueue")
                .field("capacity", &queue.capacity())
                .field("metas", metas)
                .finish(),
            Self::Kernel(k) => f.debug_tuple("Kernel").field(k).finish(),
            Self::SuperKernel(g) => f.debug_tuple("SuperKernel").field(g).finish(),
            Self::Copy { target } => f.debug_struct("Copy").field("target", target).finish(),
            Self::Gather { arity } => f.debug_struct("Gather").field("arity", arity).finish(),
            Self::Switch { branches, values } => f
                .debug_struct("Switch")
                .field("branches", branches)
                .field("values", values)
                .finish(),
        }
    }
}

/// One node of the compiled graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// Unique node name; becomes the actor id.
    pub name: String,
    /// Placement.
    pub device: DeviceContextKey,
    /// Behavior.
    pub kind: NodeKind,
    /// Data inputs by position.
    pub inputs: Vec<NodeInput>,
    /// Extra ordering constraints.
    pub control_deps: Vec<ControlDep>,
}

/// Immutable compiled-graph descriptor.
#[derive(Debug, Clone)]
pub struct GraphDescriptor {
    /// Graph name, used for the dump file.
    pub name: String,
    /// Nodes.
    pub nodes: Vec<GraphNode>,
    /// User-visible outputs by position.
    pub outputs: Vec<NodeInput>,
}

impl GraphDescriptor {
    /// Find a node by name.
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Fluent constructor for [`GraphDescriptor`].
pub struct GraphBuilder {
    name: String,
    nodes: Vec<GraphNode>,
    outputs: Vec<NodeInput>,
}

impl GraphBuilder {
    /// Start a graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Add a fully described node.
    pub fn node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    fn push(
        self,
        name: impl Into<String>,
        device: DeviceContextKey,
        kind: NodeKind,
        inputs: Vec<NodeInput>,
    ) -> Self {
        self.node(GraphNode {
            name: name.into(),
            device,
            kind,
            inputs,
            control_deps: Vec::new(),
        })
    }

    /// Host input at `position` of the `execute` input list.
    pub fn host_input(
        self,
        name: impl Into<String>,
        device: DeviceContextKey,
        position: usize,
        meta: TensorMeta,
    ) -> Self {
        self.push(name, device, NodeKind::HostInput { position, meta }, Vec::new())
    }

    /// Queue-fed source with one output per entry of `metas`.
    pub fn device_queue(
        self,
        name: impl Into<String>,
        device: DeviceContextKey,
        queue: Arc<dyn DataQueue>,
        metas: Vec<TensorMeta>,
    ) -> Self {
        self.push(name, device, NodeKind::DeviceQueue { queue, metas }, Vec::new())
    }

    /// Kernel node.
    pub fn kernel(
        self,
        name: impl Into<String>,
        device: DeviceContextKey,
        kernel: impl Into<KernelRef>,
        inputs: impl IntoIterator<Item = NodeInput>,
    ) -> Self {
        self.push(
            name,
            device,
            NodeKind::Kernel(kernel.into()),
            inputs.into_iter().collect(),
        )
    }

    /// Super kernel node.
    pub fn super_kernel(
        self,
        name: impl Into<String>,
        device: DeviceContextKey,
        graph: SinkGraph,
        inputs: impl IntoIterator<Item = NodeInput>,
    ) -> Self {
        self.push(
            name,
            device,
            NodeKind::SuperKernel(graph),
            inputs.into_iter().collect(),
        )
    }

    /// Copy `input` from `from` onto `to`.
    pub fn copy(
        self,
        name: impl Into<String>,
        from: DeviceContextKey,
        to: DeviceContextKey,
        input: NodeInput,
    ) -> Self {
        self.push(name, from, NodeKind::Copy { target: to }, vec![input])
    }

    /// Gather node.
    pub fn gather(
        self,
        name: impl Into<String>,
        device: DeviceContextKey,
        inputs: impl IntoIterator<Item = NodeInput>,
    ) -> Self {
        let inputs: Vec<NodeInput> = inputs.into_iter().collect();
        let arity = inputs.len();
        self.push(name, device, NodeKind::Gather { arity }, inputs)
    }

    /// Switch node routing `values` by `condition`.
    pub fn switch(
        self,
        name: impl Into<String>,
        device: DeviceContextKey,
        branches: usize,
        condition: NodeInput,
        values: impl IntoIterator<Item = NodeInput>,
    ) -> Self {
        let mut inputs = vec![condition];
        inputs.extend(values);
        let values = inputs.len() - 1;
        self.push(name, device, NodeKind::Switch { branches, values }, inputs)
    }

    /// Add a control dependency to the most recently added node named `node`.
    pub fn control_dep(mut self, node: &str, dep: ControlDep) -> Self {
        if let Some(n) = self.nodes.iter_mut().rev().find(|n| n.name == node) {
            n.control_deps.push(dep);
        }
        self
    }

    /// Append a user-visible output.
    pub fn output(mut self, source: NodeInput) -> Self {
        self.outputs.push(source);
        self
    }

    /// Finish the descriptor. Structural checks happen at compile time.
    pub fn build(self) -> GraphDescriptor {
        GraphDescriptor {
            name: self.name,
            nodes: self.nodes,
            outputs: self.outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DType;

    #[test]
    fn test_builder_shapes_switch() {
        let cpu = DeviceContextKey::cpu(0);
        let graph = GraphBuilder::new("g")
            .host_input("cond", cpu.clone(), 0, TensorMeta::scalar(DType::Bool))
            .host_input("x", cpu.clone(), 1, TensorMeta::new(DType::F32, vec![2]))
            .switch("sw", cpu.clone(), 2, NodeInput::node("cond", 0), [NodeInput::node("x", 0)])
            .output(NodeInput::branch("sw", 0, 0))
            .build();

        let sw = graph.node("sw").unwrap();
        assert!(matches!(sw.kind, NodeKind::Switch { branches: 2, values: 1 }));
        assert_eq!(sw.inputs.len(), 2);
        assert_eq!(graph.outputs.len(), 1);
    }

    #[test]
    fn test_control_dep_attaches() {
        let cpu = DeviceContextKey::cpu(0);
        let graph = GraphBuilder::new("g")
            .host_input("a", cpu.clone(), 0, TensorMeta::bytes(4))
            .host_input("b", cpu, 1, TensorMeta::bytes(4))
            .control_dep("b", ControlDep::Node("a".to_string()))
            .build();
        assert_eq!(graph.node("b").unwrap().control_deps.len(), 1);
        assert!(graph.node("a").unwrap().control_deps.is_empty());
    }

    #[test]
    fn test_sink_graph_builder() {
        let sink = SinkGraph::new()
            .kernel(
                "k0",
                KernelRef::registered("Identity", KernelSignature::default()),
                [SinkValue::Input(0)],
            )
            .output(SinkValue::Kernel {
                index: 0,
                output_index: 0,
            });
        assert_eq!(sink.kernels.len(), 1);
        assert_eq!(sink.outputs.len(), 1);
    }
}
