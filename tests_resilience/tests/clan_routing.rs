//! Clan Routing Integration Tests
//!
//! These tests validate id_nearest over a multi-level clan tree:
//!
//! ```text
//!   4 -> {5, 6}
//!   5 -> {8}
//!   8 -> {9}
//! ```

use core_types::{LThreadNo, TaskNo, ThreadId};
use kernel_api::{ClanRelation, KernelApi, KernelError, Nearest};
use sim_kernel::SimulatedKernel;
use std::collections::BTreeMap;
use tests_resilience::{build_clan_tree, test_bootstrap};

fn clan() -> (SimulatedKernel, BTreeMap<TaskNo, ThreadId>) {
    let (kernel, boot) = test_bootstrap();
    let members = build_clan_tree(
        &kernel,
        boot,
        &[
            (TaskNo(4), TaskNo(5)),
            (TaskNo(4), TaskNo(6)),
            (TaskNo(5), TaskNo(8)),
            (TaskNo(8), TaskNo(9)),
        ],
    )
    .unwrap();
    (kernel, members)
}

#[test]
fn test_nesting_depth_follows_chiefs() {
    let (kernel, members) = clan();
    let depths: Vec<u8> = [4, 5, 6, 8, 9]
        .iter()
        .map(|&n| members[&TaskNo(n)].nest)
        .collect();
    assert_eq!(depths, vec![0, 1, 1, 2, 3]);
    assert_eq!(kernel.chief_of(TaskNo(9)), Some(TaskNo(8)));
    assert_eq!(kernel.chief_of(TaskNo(4)), Some(TaskNo(4)));
}

#[test]
fn test_siblings_and_direct_subtasks_talk_directly() {
    let (kernel, members) = clan();
    let five = members[&TaskNo(5)];
    let six = members[&TaskNo(6)];
    let eight = members[&TaskNo(8)];

    assert_eq!(
        kernel.id_nearest(five, six).unwrap(),
        Nearest {
            id: six,
            relation: ClanRelation::SameClan
        }
    );
    assert_eq!(
        kernel.id_nearest(five, eight).unwrap(),
        Nearest {
            id: eight,
            relation: ClanRelation::SameClan
        }
    );

    // The answer names thread 0 of the destination with its real nest
    let sloppy = ThreadId::new(TaskNo(8), LThreadNo(3));
    let nearest = kernel.id_nearest(five, sloppy).unwrap();
    assert_eq!(nearest.relation, ClanRelation::SameClan);
    assert_eq!(nearest.id, eight);
    assert_eq!(nearest.id.nest, 2);
    assert_eq!(nearest.id.lthread, LThreadNo::MAIN);
}

#[test]
fn test_inner_clan_routes_through_subtask() {
    let (kernel, members) = clan();
    let boot = members[&TaskNo(4)];
    let nine = members[&TaskNo(9)];

    let nearest = kernel.id_nearest(boot, nine).unwrap();
    assert_eq!(nearest.relation, ClanRelation::InnerClan);
    assert_eq!(nearest.id, members[&TaskNo(5)]);
}

#[test]
fn test_outer_clan_routes_through_chief() {
    let (kernel, members) = clan();
    let nine = members[&TaskNo(9)];

    for target in [TaskNo(6), TaskNo(5), TaskNo(4)] {
        let nearest = kernel.id_nearest(nine, members[&target]).unwrap();
        assert_eq!(nearest.relation, ClanRelation::OuterClan, "towards {}", target);
        assert_eq!(nearest.id, members[&TaskNo(8)]);
    }
}

#[test]
fn test_every_hop_gets_closer() {
    let (kernel, members) = clan();
    let six = members[&TaskNo(6)];

    // Walk from 9 to 6 hop by hop
    let mut at = members[&TaskNo(9)];
    let mut path = vec![at.task];
    while at.task != six.task {
        let hop = kernel.id_nearest(at, six).unwrap();
        at = if hop.relation == ClanRelation::SameClan {
            six
        } else {
            hop.id
        };
        path.push(at.task);
        assert!(path.len() <= 5, "routing loops: {:?}", path);
    }
    assert_eq!(path, vec![TaskNo(9), TaskNo(8), TaskNo(5), TaskNo(6)]);
}

#[test]
fn test_sentinel_destinations() {
    let (kernel, members) = clan();
    let eight = members[&TaskNo(8)];

    assert_eq!(kernel.id_nearest(eight, ThreadId::NIL).unwrap().id, eight);
    let chief = kernel.id_nearest(eight, ThreadId::INVALID).unwrap();
    assert_eq!(chief.id, members[&TaskNo(5)]);
    assert_eq!(chief.relation, ClanRelation::OuterClan);
}

#[test]
fn test_dead_caller_is_rejected() {
    let (kernel, members) = clan();
    let ghost = members[&TaskNo(9)].with_lthread(LThreadNo(7));
    assert_eq!(
        kernel.id_nearest(ghost, members[&TaskNo(4)]),
        Err(KernelError::InvalidCaller(ghost))
    );
}
