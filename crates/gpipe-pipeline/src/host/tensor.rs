use std::sync::Arc;

use gpipe_types::Device;

use super::tape::NodeId;

/// A one-dimensional f32 tensor living in host memory.
///
/// The first (only) dimension is the batch dimension. Values are shared, so
/// cloning and device transport never copy data. `node` is the tape node
/// that produced the tensor, if recording was on.
#[derive(Debug, Clone)]
pub struct HostTensor {
    values: Arc<[f32]>,
    device: Device,
    node: Option<NodeId>,
}

impl HostTensor {
    pub(crate) fn new(values: Arc<[f32]>, device: Device, node: Option<NodeId>) -> Self {
        Self { values, device, node }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.values.to_vec()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub(crate) fn with_node(&self, node: Option<NodeId>) -> Self {
        Self {
            values: Arc::clone(&self.values),
            device: self.device,
            node,
        }
    }

    pub(crate) fn moved_to(&self, device: Device, node: Option<NodeId>) -> Self {
        Self {
            values: Arc::clone(&self.values),
            device,
            node,
        }
    }
}

/// Values and device only; graph identity is ignored.
impl PartialEq for HostTensor {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device && self.values == other.values
    }
}
