//! Integration test: region tree arena invariants and traversal.

use vkprof_protocol::*;

fn barrier() -> Command {
    Command::PipelineBarrier {
        memory_barrier_count: 1,
        buffer_barrier_count: 0,
        image_barrier_count: 2,
    }
}

fn root() -> RegionNode {
    RegionNode::new(RegionKind::CommandBuffer {
        handle: 1,
        level: CommandBufferLevel::Primary,
    })
}

#[test]
fn test_walk_is_pre_order() {
    let mut tree = RegionTree::new(root());
    let pass = tree.push_child(
        RegionId::ROOT,
        RegionNode::new(RegionKind::RenderPass {
            handle: 2,
            dynamic: false,
        }),
    );
    let subpass = tree.push_child(
        pass,
        RegionNode::new(RegionKind::Subpass {
            index: 0,
            contents: SubpassContents::Inline,
        }),
    );
    tree.push_child(subpass, RegionNode::new(RegionKind::Command(barrier())));
    tree.push_child(RegionId::ROOT, RegionNode::new(RegionKind::Command(barrier())));

    let order: Vec<(usize, &'static str)> = tree
        .walk()
        .map(|(depth, _, node)| (depth, node.kind.name()))
        .collect();
    assert_eq!(
        order,
        vec![
            (0, "CommandBuffer"),
            (1, "RenderPass"),
            (2, "Subpass"),
            (3, "vkCmdPipelineBarrier"),
            (1, "vkCmdPipelineBarrier"),
        ]
    );
    assert_eq!(tree.count(RegionKind::is_command), 2);
}

#[test]
fn test_from_nodes_validates_arena() {
    let mut parent = root();
    parent.children = vec![RegionId(1)];
    let child = RegionNode::new(RegionKind::Command(barrier()));
    assert!(RegionTree::from_nodes(vec![parent.clone(), child.clone()]).is_ok());

    let mut dangling = root();
    dangling.children = vec![RegionId(5)];
    match RegionTree::from_nodes(vec![dangling, child.clone()]) {
        Err(ProtocolError::RegionOutOfRange { child: 5, .. }) => {}
        other => panic!("expected RegionOutOfRange, got {:?}", other),
    }

    let mut backwards = RegionNode::new(RegionKind::Command(barrier()));
    backwards.children = vec![RegionId(0)];
    match RegionTree::from_nodes(vec![root(), backwards]) {
        Err(ProtocolError::RegionOrder { .. }) => {}
        other => panic!("expected RegionOrder, got {:?}", other),
    }

    let mut shared = root();
    shared.children = vec![RegionId(1), RegionId(1)];
    match RegionTree::from_nodes(vec![shared, child.clone()]) {
        Err(ProtocolError::RegionShared(1)) => {}
        other => panic!("expected RegionShared, got {:?}", other),
    }

    assert_eq!(RegionTree::from_nodes(Vec::new()), Err(ProtocolError::EmptyTree));

    assert_eq!(
        RegionTree::from_nodes(vec![root(), child.clone()]),
        Err(ProtocolError::RegionOrphan(1))
    );

    let mut parent = root();
    parent.children = vec![RegionId(1)];
    let mut inverted = child;
    inverted.ticks = Some(TickRange { begin: 50, end: 40 });
    assert_eq!(
        RegionTree::from_nodes(vec![parent, inverted]),
        Err(ProtocolError::InvertedTicks(1))
    );
}

#[test]
fn test_tick_range_helpers() {
    let outer = TickRange::new(10, 100);
    let inner = TickRange::new(20, 30);
    assert!(outer.encloses(&inner));
    assert!(!inner.encloses(&outer));
    assert_eq!(TickRange::new(50, 40), TickRange { begin: 40, end: 50 });
    assert_eq!(inner.union(&TickRange::new(25, 120)), TickRange::new(20, 120));
    assert_eq!(outer.duration(), 90);
    assert_eq!(TickRange { begin: 50, end: 40 }.duration(), 0);
}

#[test]
fn test_whole_size_fills_saturate_totals() {
    let fill = Command::FillBuffer {
        buffer: 1,
        offset: 0,
        size: WHOLE_SIZE,
        data: 0,
    };
    assert_eq!(fill.stats().bytes_transferred, 0);

    let mut total = CommandStats {
        bytes_transferred: u64::MAX - 1,
        ..Default::default()
    };
    total += Command::CopyBuffer {
        src_buffer: 1,
        dst_buffer: 2,
        size: 256,
    }
    .stats();
    total += fill.stats();
    assert_eq!(total.bytes_transferred, u64::MAX);
    assert_eq!(total.copy_count, 2);
}

#[test]
fn test_command_stats() {
    let copy = Command::CopyBuffer {
        src_buffer: 1,
        dst_buffer: 2,
        size: 256,
    };
    let stats = copy.stats() + barrier().stats() + copy.stats();
    assert_eq!(stats.copy_count, 2);
    assert_eq!(stats.barrier_count, 1);
    assert_eq!(stats.bytes_transferred, 512);
    assert_eq!(stats.command_count(), 3);
    assert!(CommandStats::default().is_empty());

    assert_eq!(
        Command::DrawIndirect {
            buffer: 1,
            offset: 0,
            draw_count: 4,
            stride: 16,
            indexed: true,
        }
        .name(),
        "vkCmdDrawIndexedIndirect"
    );
    assert_eq!(
        Command::Dispatch {
            group_count_x: 1,
            group_count_y: 1,
            group_count_z: 1,
        }
        .bind_point(),
        Some(PipelineBindPoint::Compute)
    );
    assert_eq!(copy.bind_point(), None);
}

#[test]
fn test_memory_resource_lookup() {
    let data = MemoryData {
        resources: vec![
            ResourceMemoryData {
                handle: 3,
                kind: ResourceKind::Image,
                size: 64,
                sparse: false,
                bindings: vec![],
            },
            ResourceMemoryData {
                handle: 9,
                kind: ResourceKind::Buffer,
                size: 128,
                sparse: true,
                bindings: vec![MemoryBindingInterval {
                    resource_offset: 64,
                    size: 64,
                    memory: 1,
                    memory_offset: 0,
                }],
            },
        ],
        ..Default::default()
    };
    assert_eq!(data.resource(9).map(|r| r.bound_size()), Some(64));
    assert!(data.resource(4).is_none());
}
