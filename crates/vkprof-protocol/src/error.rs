use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ProtocolError {
    #[error("region {child} referenced by {parent} is out of range ({len} nodes)")]
    RegionOutOfRange { parent: u32, child: u32, len: usize },

    #[error("region {child} is not ordered after its parent {parent}")]
    RegionOrder { parent: u32, child: u32 },

    #[error("region {0} has more than one parent")]
    RegionShared(u32),

    #[error("region {0} has no parent")]
    RegionOrphan(u32),

    #[error("region {0} ends before it begins")]
    InvertedTicks(u32),

    #[error("region tree is empty")]
    EmptyTree,
}
