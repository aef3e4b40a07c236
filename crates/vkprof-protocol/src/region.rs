//! Arena representation of the per-command-buffer region hierarchy.
//!
//! A [`RegionTree`] stores its nodes in a flat vector; the root is always at
//! index 0 and every node lists its children by [`RegionId`]. Children are
//! stored after their parent, so a reverse scan over the node vector visits
//! children before parents.

use std::collections::TryReserveError;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandStats, LabelColor};
use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RegionId(pub u32);

impl RegionId {
    pub const ROOT: RegionId = RegionId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum SubpassContents {
    #[default]
    Inline,
    SecondaryCommandBuffers,
    InlineAndSecondaryCommandBuffers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
    RayTracing,
}

/// Raw GPU timestamp pair, in device ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct TickRange {
    pub begin: u64,
    pub end: u64,
}

impl TickRange {
    /// Builds a range, swapping the bounds if the device reported them
    /// out of order.
    pub fn new(begin: u64, end: u64) -> Self {
        if begin <= end {
            Self { begin, end }
        } else {
            Self { begin: end, end: begin }
        }
    }

    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    pub fn encloses(&self, other: &TickRange) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    pub fn union(&self, other: &TickRange) -> TickRange {
        TickRange {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub enum RegionKind {
    /// A command buffer; the root of every tree, and a spliced secondary
    /// command buffer anywhere below it.
    CommandBuffer {
        handle: u64,
        level: CommandBufferLevel,
    },
    /// A render pass instance. `handle` is 0 for inherited render passes and
    /// dynamic rendering.
    RenderPass {
        handle: u64,
        dynamic: bool,
    },
    /// A subpass. `index` is -1 when the subpass was inherited by a
    /// secondary command buffer.
    Subpass {
        index: i32,
        contents: SubpassContents,
    },
    Pipeline {
        handle: u64,
        bind_point: PipelineBindPoint,
    },
    Command(Command),
}

impl RegionKind {
    pub fn name(&self) -> &'static str {
        match self {
            RegionKind::CommandBuffer { .. } => "CommandBuffer",
            RegionKind::RenderPass { .. } => "RenderPass",
            RegionKind::Subpass { .. } => "Subpass",
            RegionKind::Pipeline { .. } => "Pipeline",
            RegionKind::Command(cmd) => cmd.name(),
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self, RegionKind::Command(_))
    }
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::CommandBuffer { handle, level } => {
                write!(f, "{:?} command buffer {:#x}", level, handle)
            }
            RegionKind::RenderPass { dynamic: true, .. } => f.write_str("Dynamic rendering"),
            RegionKind::RenderPass { handle, .. } => write!(f, "Render pass {:#x}", handle),
            RegionKind::Subpass { index: -1, .. } => f.write_str("Inherited subpass"),
            RegionKind::Subpass { index, .. } => write!(f, "Subpass {}", index),
            RegionKind::Pipeline { handle, bind_point } => {
                write!(f, "{:?} pipeline {:#x}", bind_point, handle)
            }
            RegionKind::Command(cmd) => match cmd.label() {
                Some(label) => write!(f, "{} \"{}\"", cmd.name(), label),
                None => f.write_str(cmd.name()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RegionNode {
    pub kind: RegionKind,
    /// `None` when timestamps were unavailable for this region.
    pub ticks: Option<TickRange>,
    /// Aggregate statistics: own contribution plus all children.
    pub stats: CommandStats,
    pub children: Vec<RegionId>,
}

impl RegionNode {
    pub fn new(kind: RegionKind) -> Self {
        Self {
            kind,
            ticks: None,
            stats: CommandStats::default(),
            children: Vec::new(),
        }
    }

    /// Duration in ticks, 0 when unavailable.
    pub fn duration(&self) -> u64 {
        self.ticks.map(|t| t.duration()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,
         rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[serde(try_from = "RawRegionTree")]
pub struct RegionTree {
    nodes: Vec<RegionNode>,
}

/// Unchecked serde form of [`RegionTree`].
#[derive(Deserialize)]
struct RawRegionTree {
    nodes: Vec<RegionNode>,
}

impl TryFrom<RawRegionTree> for RegionTree {
    type Error = ProtocolError;

    fn try_from(raw: RawRegionTree) -> Result<Self, Self::Error> {
        RegionTree::from_nodes(raw.nodes)
    }
}

impl RegionTree {
    pub fn new(root: RegionNode) -> Self {
        Self { nodes: vec![root] }
    }

    /// Rebuilds a tree from raw nodes, checking the arena invariants.
    pub fn from_nodes(nodes: Vec<RegionNode>) -> Result<Self, ProtocolError> {
        let tree = Self { nodes };
        tree.validate()?;
        Ok(tree)
    }

    /// Checks the invariants every accessor relies on: a root exists, every
    /// child id is in range, ordered after its parent and owned by exactly
    /// one parent, and no tick range is inverted.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let nodes = &self.nodes;
        if nodes.is_empty() {
            return Err(ProtocolError::EmptyTree);
        }
        let mut seen = vec![false; nodes.len()];
        for (parent, node) in nodes.iter().enumerate() {
            if node.ticks.is_some_and(|t| t.begin > t.end) {
                return Err(ProtocolError::InvertedTicks(parent as u32));
            }
            for child in &node.children {
                if child.index() >= nodes.len() {
                    return Err(ProtocolError::RegionOutOfRange {
                        parent: parent as u32,
                        child: child.0,
                        len: nodes.len(),
                    });
                }
                if child.index() <= parent {
                    return Err(ProtocolError::RegionOrder {
                        parent: parent as u32,
                        child: child.0,
                    });
                }
                if std::mem::replace(&mut seen[child.index()], true) {
                    return Err(ProtocolError::RegionShared(child.0));
                }
            }
        }
        if let Some(orphan) = seen.iter().skip(1).position(|&s| !s) {
            return Err(ProtocolError::RegionOrphan(orphan as u32 + 1));
        }
        Ok(())
    }

    pub fn root(&self) -> &RegionNode {
        &self.nodes[0]
    }

    pub fn node(&self, id: RegionId) -> &RegionNode {
        &self.nodes[id.index()]
    }

    pub fn get(&self, id: RegionId) -> Option<&RegionNode> {
        self.nodes.get(id.index())
    }

    pub fn node_mut(&mut self, id: RegionId) -> &mut RegionNode {
        &mut self.nodes[id.index()]
    }

    pub fn nodes(&self) -> &[RegionNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        self.nodes.try_reserve(additional)
    }

    /// Appends `node` as the last child of `parent`.
    pub fn push_child(&mut self, parent: RegionId, node: RegionNode) -> RegionId {
        let id = RegionId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.nodes[parent.index()].children.push(id);
        id
    }

    /// Appends a copy of `subtree` as the last child of `parent` and returns
    /// the id of the copied root. Ids inside the copy are shifted, so the
    /// copy stays independent of `subtree`.
    pub fn graft(&mut self, parent: RegionId, subtree: &RegionTree) -> RegionId {
        let offset = self.nodes.len() as u32;
        self.nodes.extend(subtree.nodes.iter().map(|node| {
            let mut node = node.clone();
            for child in &mut node.children {
                child.0 += offset;
            }
            node
        }));
        let id = RegionId(offset);
        self.nodes[parent.index()].children.push(id);
        id
    }

    pub fn children(&self, id: RegionId) -> impl Iterator<Item = (RegionId, &RegionNode)> + '_ {
        self.nodes[id.index()]
            .children
            .iter()
            .map(move |&child| (child, &self.nodes[child.index()]))
    }

    /// Depth-first pre-order traversal yielding `(depth, id, node)`.
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            tree: self,
            stack: vec![(0, RegionId::ROOT)],
        }
    }

    /// Number of nodes matching `pred`.
    pub fn count(&self, pred: impl Fn(&RegionKind) -> bool) -> usize {
        self.nodes.iter().filter(|n| pred(&n.kind)).count()
    }

    /// Debug labels in recording order. Begin labels are paired with their
    /// end label; end labels closing a label begun in another command
    /// buffer are skipped.
    pub fn debug_labels(&self) -> Vec<DebugLabel<'_>> {
        let mut labels: Vec<DebugLabel<'_>> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        for node in &self.nodes {
            let RegionKind::Command(command) = &node.kind else {
                continue;
            };
            match command {
                Command::BeginDebugLabel { name, color } => {
                    open.push(labels.len());
                    labels.push(DebugLabel {
                        name,
                        color: *color,
                        depth: open.len() - 1,
                        ticks: node.ticks,
                        closed: false,
                    });
                }
                Command::InsertDebugLabel { name, color } => labels.push(DebugLabel {
                    name,
                    color: *color,
                    depth: open.len(),
                    ticks: node.ticks,
                    closed: true,
                }),
                Command::EndDebugLabel => {
                    let Some(index) = open.pop() else { continue };
                    let label = &mut labels[index];
                    label.closed = true;
                    label.ticks = match (label.ticks, node.ticks) {
                        (Some(begin), Some(end)) => Some(TickRange::new(begin.begin, end.end)),
                        _ => None,
                    };
                }
                _ => {}
            }
        }
        labels
    }
}

/// A debug label of a command buffer, see [`RegionTree::debug_labels`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugLabel<'a> {
    pub name: &'a str,
    pub color: LabelColor,
    /// Number of enclosing begin labels.
    pub depth: usize,
    /// Begin to end of a closed label, otherwise the label's own timestamp.
    pub ticks: Option<TickRange>,
    /// Inserted labels are always closed.
    pub closed: bool,
}

pub struct Walk<'a> {
    tree: &'a RegionTree,
    stack: Vec<(usize, RegionId)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, RegionId, &'a RegionNode);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, id) = self.stack.pop()?;
        let node = self.tree.node(id);
        self.stack
            .extend(node.children.iter().rev().map(|&child| (depth + 1, child)));
        Some((depth, id, node))
    }
}
