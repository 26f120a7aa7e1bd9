//! Recording backward graph for the host backend.
//!
//! Every recorded node lists the nodes it was computed from. Running
//! [`Tape::backward`] visits nodes in reverse dependency order: a node runs
//! only after every reachable node that consumed it has run. Hooks attached
//! to nodes fire as the node is visited.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::error::{PipelineError, Result};

/// Callback fired when the backward pass reaches a node.
pub type Hook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Node {
    label: String,
    inputs: Vec<NodeId>,
    hook: Option<Hook>,
}

#[derive(Default)]
pub struct Tape {
    nodes: Mutex<Vec<Node>>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    fn nodes(&self) -> MutexGuard<'_, Vec<Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a node computed from `inputs`. Missing inputs (tensors created
    /// while recording was off) are skipped.
    pub fn record<I>(&self, label: impl Into<String>, inputs: I) -> NodeId
    where
        I: IntoIterator<Item = Option<NodeId>>,
    {
        self.push(label.into(), inputs.into_iter().flatten().collect(), None)
    }

    /// Record a node that fires `hook` during the backward pass.
    pub fn record_with_hook<I>(&self, label: impl Into<String>, inputs: I, hook: Hook) -> NodeId
    where
        I: IntoIterator<Item = Option<NodeId>>,
    {
        self.push(label.into(), inputs.into_iter().flatten().collect(), Some(hook))
    }

    fn push(&self, label: String, inputs: Vec<NodeId>, hook: Option<Hook>) -> NodeId {
        let mut nodes = self.nodes();
        let id = NodeId(nodes.len());
        nodes.push(Node { label, inputs, hook });
        id
    }

    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }

    pub fn label(&self, id: NodeId) -> Option<String> {
        self.nodes().get(id.0).map(|n| n.label.clone())
    }

    pub fn inputs(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes()
            .get(id.0)
            .map(|n| n.inputs.clone())
            .unwrap_or_default()
    }

    pub fn count_label(&self, label: &str) -> usize {
        self.nodes().iter().filter(|n| n.label == label).count()
    }

    /// Run the backward pass from `roots`, firing hooks along the way.
    ///
    /// Returns the visited nodes in execution order. Hooks are taken when
    /// fired, so a second pass over the same nodes fires nothing.
    pub fn backward(&self, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let (mut pending, mut ready) = {
            let nodes = self.nodes();
            let mut reachable = HashSet::new();
            let mut stack: Vec<NodeId> = roots.to_vec();
            while let Some(id) = stack.pop() {
                let node = nodes
                    .get(id.0)
                    .ok_or_else(|| PipelineError::Backend(format!("unknown tape node {id}")))?;
                if reachable.insert(id) {
                    stack.extend(node.inputs.iter().copied());
                }
            }

            let mut pending: HashMap<NodeId, usize> = HashMap::new();
            for id in &reachable {
                for input in &nodes[id.0].inputs {
                    *pending.entry(*input).or_default() += 1;
                }
            }

            let mut seen = HashSet::new();
            let ready: VecDeque<NodeId> = roots
                .iter()
                .copied()
                .filter(|id| !pending.contains_key(id) && seen.insert(*id))
                .collect();
            (pending, ready)
        };

        let mut order = Vec::new();
        while let Some(id) = ready.pop_front() {
            let (label, inputs, hook) = {
                let mut nodes = self.nodes();
                let node = &mut nodes[id.0];
                (node.label.clone(), node.inputs.clone(), node.hook.take())
            };

            if let Some(hook) = hook {
                debug!(node = %id, %label, "backward hook");
                hook().map_err(|e| {
                    PipelineError::Backend(format!("backward hook {label} {id} failed: {e:#}"))
                })?;
            }
            order.push(id);

            for input in inputs {
                if let Some(count) = pending.get_mut(&input) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(input);
                    }
                }
            }
        }
        Ok(order)
    }
}

impl fmt::Debug for Tape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tape").field("nodes", &self.len()).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
