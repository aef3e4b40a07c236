//! Open-region bookkeeping for one recording command buffer.
//!
//! The stack always holds the command buffer scope at the bottom; render
//! passes, subpasses and pipeline regions are pushed above it. Every opened
//! scope brackets its region with a begin/end timestamp pair, and every
//! command region is bracketed by the pre/post command hooks.

use ash::vk;
use vkprof_protocol::{
    Command, PipelineBindPoint, RegionId, RegionKind, RegionNode, RegionTree, SubpassContents,
};

use crate::command_buffer::CommandBufferRecord;
use crate::error::ProfilerError;
use crate::timestamp::{Granularity, QuerySlot, TimestampWriter};

const TOP: vk::PipelineStageFlags = vk::PipelineStageFlags::TOP_OF_PIPE;
const BOTTOM: vk::PipelineStageFlags = vk::PipelineStageFlags::BOTTOM_OF_PIPE;

/// Timestamp slots bracketing one region node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSlots {
    pub begin: Option<QuerySlot>,
    pub end: Option<QuerySlot>,
    /// The slots were written by the executing command buffer around a
    /// spliced secondary; everything below is clamped into them.
    pub envelope: bool,
}

impl RegionSlots {
    fn shifted(mut self, offset: u32) -> Self {
        for slot in [&mut self.begin, &mut self.end].into_iter().flatten() {
            slot.block += offset;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    CommandBuffer,
    RenderPass { inherited: bool, dynamic: bool },
    Subpass { index: i32 },
    Pipeline(PipelineBindPoint),
}

impl ScopeKind {
    fn granularity(self) -> Granularity {
        match self {
            ScopeKind::CommandBuffer => Granularity::CommandBuffer,
            ScopeKind::RenderPass { .. } | ScopeKind::Subpass { .. } => Granularity::RenderPass,
            ScopeKind::Pipeline(_) => Granularity::Pipeline,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    id: RegionId,
    kind: ScopeKind,
}

#[derive(Debug)]
enum OpenCommand {
    Command(RegionId),
    /// Spliced secondaries of one execute call, sharing its envelope.
    Execute(Vec<RegionId>),
}

/// Finished tree of a command buffer.
pub(crate) struct FinishedRegions {
    pub tree: RegionTree,
    pub slots: Vec<RegionSlots>,
    pub render_pass_open: bool,
}

#[derive(Debug)]
pub(crate) struct RegionStack {
    handle: u64,
    tree: RegionTree,
    slots: Vec<RegionSlots>,
    scopes: Vec<Scope>,
    /// Currently bound pipeline per bind point.
    bound: [Option<u64>; 3],
    open: Option<OpenCommand>,
}

fn bind_point_index(bind_point: PipelineBindPoint) -> usize {
    match bind_point {
        PipelineBindPoint::Graphics => 0,
        PipelineBindPoint::Compute => 1,
        PipelineBindPoint::RayTracing => 2,
    }
}

impl RegionStack {
    pub(crate) fn new(handle: u64, root: RegionKind, ts: &mut TimestampWriter) -> Self {
        let begin = ts.write(Granularity::CommandBuffer, TOP);
        Self {
            handle,
            tree: RegionTree::new(RegionNode::new(root)),
            slots: vec![RegionSlots {
                begin,
                ..Default::default()
            }],
            scopes: vec![Scope {
                id: RegionId::ROOT,
                kind: ScopeKind::CommandBuffer,
            }],
            bound: [None; 3],
            open: None,
        }
    }

    fn top(&self) -> Scope {
        self.scopes.last().copied().unwrap_or(Scope {
            id: RegionId::ROOT,
            kind: ScopeKind::CommandBuffer,
        })
    }

    fn render_pass(&self) -> Option<(bool, bool)> {
        self.scopes.iter().rev().find_map(|s| match s.kind {
            ScopeKind::RenderPass { inherited, dynamic } => Some((inherited, dynamic)),
            _ => None,
        })
    }

    pub(crate) fn in_render_pass(&self) -> bool {
        self.render_pass().is_some()
    }

    fn push_node(
        &mut self,
        ts: &mut TimestampWriter,
        kind: RegionKind,
        granularity: Granularity,
    ) -> Result<RegionId, ProfilerError> {
        self.tree.try_reserve(1)?;
        self.slots.try_reserve(1)?;
        let parent = self.top().id;
        let begin = ts.write(granularity, TOP);
        let id = self.tree.push_child(parent, RegionNode::new(kind));
        self.slots.push(RegionSlots {
            begin,
            ..Default::default()
        });
        Ok(id)
    }

    fn push_scope(
        &mut self,
        ts: &mut TimestampWriter,
        kind: RegionKind,
        scope: ScopeKind,
    ) -> Result<RegionId, ProfilerError> {
        self.scopes.try_reserve(1)?;
        let id = self.push_node(ts, kind, scope.granularity())?;
        self.scopes.push(Scope { id, kind: scope });
        Ok(id)
    }

    fn close(&mut self, ts: &mut TimestampWriter, id: RegionId, granularity: Granularity) {
        let slots = &mut self.slots[id.index()];
        if slots.begin.is_some() && slots.end.is_none() {
            slots.end = ts.write(granularity, BOTTOM);
        }
    }

    /// Pops the top scope. The command buffer scope is never popped here.
    fn pop_scope(&mut self, ts: &mut TimestampWriter) {
        if self.scopes.len() <= 1 {
            return;
        }
        if let Some(scope) = self.scopes.pop() {
            self.close(ts, scope.id, scope.kind.granularity());
        }
    }

    fn close_pipeline(&mut self, ts: &mut TimestampWriter) {
        if matches!(self.top().kind, ScopeKind::Pipeline(_)) {
            self.pop_scope(ts);
        }
    }

    /// Synthesized render pass and subpass of a secondary command buffer
    /// recorded with render pass continuation.
    pub(crate) fn begin_inherited_render_pass(&mut self, ts: &mut TimestampWriter) -> Result<(), ProfilerError> {
        self.push_scope(
            ts,
            RegionKind::RenderPass {
                handle: 0,
                dynamic: false,
            },
            ScopeKind::RenderPass {
                inherited: true,
                dynamic: false,
            },
        )?;
        self.push_scope(
            ts,
            RegionKind::Subpass {
                index: -1,
                contents: SubpassContents::Inline,
            },
            ScopeKind::Subpass { index: -1 },
        )?;
        Ok(())
    }

    pub(crate) fn begin_render_pass(
        &mut self,
        ts: &mut TimestampWriter,
        handle: u64,
        contents: SubpassContents,
        dynamic: bool,
    ) -> Result<(), ProfilerError> {
        if self.in_render_pass() {
            return Err(ProfilerError::RenderPassOpen(self.handle));
        }
        self.close_open_command(ts);
        self.close_pipeline(ts);
        ts.preallocate();
        ts.set_in_render_pass(true);
        if let Err(e) = self.push_scope(
            ts,
            RegionKind::RenderPass { handle, dynamic },
            ScopeKind::RenderPass {
                inherited: false,
                dynamic,
            },
        ) {
            ts.set_in_render_pass(false);
            return Err(e);
        }
        self.push_scope(
            ts,
            RegionKind::Subpass { index: 0, contents },
            ScopeKind::Subpass { index: 0 },
        )?;
        Ok(())
    }

    pub(crate) fn next_subpass(
        &mut self,
        ts: &mut TimestampWriter,
        contents: SubpassContents,
    ) -> Result<(), ProfilerError> {
        match self.render_pass() {
            None => return Err(ProfilerError::NoRenderPass(self.handle)),
            Some((true, _)) => return Err(ProfilerError::InheritedRenderPass(self.handle)),
            Some(_) => {}
        }
        self.close_open_command(ts);
        self.close_pipeline(ts);
        let ScopeKind::Subpass { index } = self.top().kind else {
            return Err(ProfilerError::NoRenderPass(self.handle));
        };
        self.pop_scope(ts);
        let index = index + 1;
        self.push_scope(
            ts,
            RegionKind::Subpass { index, contents },
            ScopeKind::Subpass { index },
        )?;
        Ok(())
    }

    /// Closes the open render pass. A mismatch between `dynamic` and the way
    /// the pass was begun is reported after the pass has been closed.
    pub(crate) fn end_render_pass(&mut self, ts: &mut TimestampWriter, dynamic: bool) -> Result<(), ProfilerError> {
        let began_dynamic = match self.render_pass() {
            None => return Err(ProfilerError::NoRenderPass(self.handle)),
            Some((true, _)) => return Err(ProfilerError::InheritedRenderPass(self.handle)),
            Some((false, began_dynamic)) => began_dynamic,
        };
        self.close_open_command(ts);
        while !matches!(self.top().kind, ScopeKind::RenderPass { .. }) {
            self.pop_scope(ts);
        }
        self.pop_scope(ts);
        ts.set_in_render_pass(false);

        if began_dynamic != dynamic {
            tracing::debug!(
                "command buffer {:#x}: render pass begun with dynamic={} ended with dynamic={}",
                self.handle,
                began_dynamic,
                dynamic
            );
        }
        Ok(())
    }

    pub(crate) fn bind_pipeline(
        &mut self,
        ts: &mut TimestampWriter,
        bind_point: PipelineBindPoint,
        handle: u64,
    ) -> Result<(), ProfilerError> {
        self.bound[bind_point_index(bind_point)] = Some(handle);
        self.close_open_command(ts);
        self.close_pipeline(ts);
        self.push_scope(
            ts,
            RegionKind::Pipeline { handle, bind_point },
            ScopeKind::Pipeline(bind_point),
        )?;
        Ok(())
    }

    /// Region a command attaches to. Draws and dispatches reopen a region
    /// for the pipeline bound at their bind point when it is not the open one.
    fn sink_for(&mut self, ts: &mut TimestampWriter, command: &Command) -> Result<RegionId, ProfilerError> {
        let top = self.top();
        let Some(bind_point) = command.bind_point() else {
            return Ok(top.id);
        };
        if top.kind == ScopeKind::Pipeline(bind_point) {
            return Ok(top.id);
        }
        match self.bound[bind_point_index(bind_point)] {
            Some(handle) => {
                self.close_pipeline(ts);
                self.push_scope(
                    ts,
                    RegionKind::Pipeline { handle, bind_point },
                    ScopeKind::Pipeline(bind_point),
                )
            }
            None => Ok(top.id),
        }
    }

    /// Opens a command region. Returns an error if a previous command was
    /// never closed; that command is closed first.
    pub(crate) fn begin_command(&mut self, ts: &mut TimestampWriter, command: Command) -> Result<(), ProfilerError> {
        let unclosed = self.close_open_command(ts);

        let sink = self.sink_for(ts, &command)?;
        self.tree.try_reserve(1)?;
        self.slots.try_reserve(1)?;
        let begin = ts.write(Granularity::Command, TOP);
        let id = self.tree.push_child(sink, RegionNode::new(RegionKind::Command(command)));
        self.slots.push(RegionSlots {
            begin,
            ..Default::default()
        });
        self.open = Some(OpenCommand::Command(id));

        if unclosed {
            return Err(ProfilerError::CommandAlreadyOpen(self.handle));
        }
        Ok(())
    }

    /// Closes the open command or execute envelope. Returns whether one was open.
    pub(crate) fn close_open_command(&mut self, ts: &mut TimestampWriter) -> bool {
        match self.open.take() {
            None => false,
            Some(OpenCommand::Command(id)) => {
                self.close(ts, id, Granularity::Command);
                true
            }
            Some(OpenCommand::Execute(ids)) => {
                let opened = ids.first().and_then(|id| self.slots[id.index()].begin);
                let end = opened.and_then(|_| ts.write(Granularity::CommandBuffer, BOTTOM));
                for id in ids {
                    self.slots[id.index()].end = end;
                }
                true
            }
        }
    }

    /// Places a debug label below the current scope. A label carries one
    /// timestamp and never opens a pipeline region.
    pub(crate) fn debug_label(&mut self, ts: &mut TimestampWriter, command: Command) -> Result<(), ProfilerError> {
        self.close_open_command(ts);
        self.tree.try_reserve(1)?;
        self.slots.try_reserve(1)?;
        let stage = match command {
            Command::EndDebugLabel => BOTTOM,
            _ => TOP,
        };
        let parent = self.top().id;
        let slot = ts.write(Granularity::Command, stage);
        self.tree.push_child(parent, RegionNode::new(RegionKind::Command(command)));
        self.slots.push(RegionSlots {
            begin: slot,
            end: slot,
            envelope: false,
        });
        Ok(())
    }

    /// Splices copies of the executed secondaries below the current subpass
    /// (or the command buffer scope outside a render pass) and opens the
    /// execute envelope.
    pub(crate) fn execute(
        &mut self,
        ts: &mut TimestampWriter,
        secondaries: &[CommandBufferRecord],
    ) -> Result<(), ProfilerError> {
        self.close_open_command(ts);
        self.close_pipeline(ts);
        // Bound state is undefined after executing secondaries.
        self.bound = [None; 3];

        let sink = self.top().id;
        let begin = ts.write(Granularity::CommandBuffer, TOP);
        let mut spliced = Vec::new();
        spliced.try_reserve(secondaries.len())?;

        for secondary in secondaries {
            let offset = ts.adopt(&secondary.blocks)?;
            self.tree.try_reserve(secondary.tree.len())?;
            self.slots.try_reserve(secondary.slots.len())?;

            let id = self.tree.graft(sink, &secondary.tree);
            self.slots
                .extend(secondary.slots.iter().map(|slots| slots.shifted(offset)));
            self.slots[id.index()] = RegionSlots {
                begin,
                end: None,
                envelope: true,
            };
            spliced.push(id);
        }

        self.open = Some(OpenCommand::Execute(spliced));
        Ok(())
    }

    /// Closes everything still open, the command buffer scope included.
    pub(crate) fn finish(mut self, ts: &mut TimestampWriter) -> FinishedRegions {
        self.close_open_command(ts);
        let render_pass_open = matches!(self.render_pass(), Some((false, _)));
        while self.scopes.len() > 1 {
            self.pop_scope(ts);
        }
        self.close(ts, RegionId::ROOT, Granularity::CommandBuffer);
        FinishedRegions {
            tree: self.tree,
            slots: self.slots,
            render_pass_open,
        }
    }
}
