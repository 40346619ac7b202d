//! End-to-end scenarios run against an in-process cluster of real
//! `DiskStorage`-backed nodes wired together by `fixtures::RaftRouter`.

mod fixtures;

use std::collections::BTreeSet;
use std::time::Duration;

use fixtures::RaftRouter;
use raftcabin::raft::ClientReadRequest;
use raftcabin::raft::ClientWriteRequest;
use raftcabin::state_machine::Command;
use raftcabin::state_machine::CommandResponse;
use raftcabin::tree::TreeOp;
use raftcabin::tree::TreeResult;

#[tokio::test]
async fn single_server_bootstraps_and_becomes_leader() {
    let router = RaftRouter::new(&[1]);
    router.initialize_single(1).await;
    tokio::time::timeout(Duration::from_secs(2), router.wait_for_leader(1)).await.unwrap();
    assert_eq!(router.node(1).current_leader(), Some(1));
}

#[tokio::test]
async fn leader_applies_a_session_backed_write_and_serves_the_read() {
    let router = RaftRouter::new(&[1]);
    router.initialize_single(1).await;
    tokio::time::timeout(Duration::from_secs(2), router.wait_for_leader(1)).await.unwrap();

    let node = router.node(1);
    let opened = node
        .client_write(ClientWriteRequest::new(Command::OpenSession))
        .await
        .unwrap();
    let CommandResponse::OpenSession { client_id } = opened.data else {
        panic!("expected OpenSession response");
    };

    let written = node
        .client_write(ClientWriteRequest::new(Command::Tree {
            client_id,
            first_outstanding_rpc: 0,
            rpc_number: 1,
            op: TreeOp::Write {
                path: "/greeting".into(),
                contents: b"hello".to_vec(),
            },
        }))
        .await
        .unwrap();
    assert!(matches!(written.data, CommandResponse::Tree(TreeResult::Ok)));

    let read = node
        .client_read(ClientReadRequest {
            query: TreeOp::Read { path: "/greeting".into() },
        })
        .await
        .unwrap();
    assert_eq!(read, TreeResult::Contents(b"hello".to_vec()));
}

#[tokio::test]
async fn duplicate_rpc_number_is_applied_exactly_once() {
    let router = RaftRouter::new(&[1]);
    router.initialize_single(1).await;
    tokio::time::timeout(Duration::from_secs(2), router.wait_for_leader(1)).await.unwrap();

    let node = router.node(1);
    let opened = node
        .client_write(ClientWriteRequest::new(Command::OpenSession))
        .await
        .unwrap();
    let CommandResponse::OpenSession { client_id } = opened.data else {
        panic!("expected OpenSession response");
    };

    let write = || Command::Tree {
        client_id,
        first_outstanding_rpc: 0,
        rpc_number: 7,
        op: TreeOp::Write {
            path: "/counter".into(),
            contents: b"1".to_vec(),
        },
    };

    let first = node.client_write(ClientWriteRequest::new(write())).await.unwrap();
    let retry = node.client_write(ClientWriteRequest::new(write())).await.unwrap();
    assert_eq!(first.data, retry.data);
}

#[tokio::test]
async fn multi_node_cluster_elects_exactly_one_leader() {
    let router = RaftRouter::new(&[1, 2, 3]);
    router.initialize_cluster(&[1, 2, 3]).await;

    for id in [1, 2, 3] {
        tokio::time::timeout(Duration::from_secs(5), router.wait_for_leader(id)).await.unwrap();
    }

    let leaders: BTreeSet<_> = [1, 2, 3].into_iter().map(|id| router.node(id).current_leader()).collect();
    assert_eq!(leaders.len(), 1, "every node should agree on the same leader: {leaders:?}");
    assert!(leaders.into_iter().next().unwrap().is_some());
}

#[tokio::test]
async fn partitioned_follower_catches_up_once_healed() {
    let router = RaftRouter::new(&[1, 2, 3]);
    router.initialize_cluster(&[1, 2, 3]).await;
    for id in [1, 2, 3] {
        tokio::time::timeout(Duration::from_secs(5), router.wait_for_leader(id)).await.unwrap();
    }
    let leader_id = router.node(1).current_leader().expect("cluster has a leader");
    let follower_id = [1, 2, 3].into_iter().find(|id| *id != leader_id).unwrap();

    router.partition(follower_id);

    let leader = router.node(leader_id);
    let opened = leader.client_write(ClientWriteRequest::new(Command::OpenSession)).await.unwrap();
    let CommandResponse::OpenSession { client_id } = opened.data else {
        panic!("expected OpenSession response");
    };
    let written = leader
        .client_write(ClientWriteRequest::new(Command::Tree {
            client_id,
            first_outstanding_rpc: 0,
            rpc_number: 1,
            op: TreeOp::Write {
                path: "/partitioned".into(),
                contents: b"before-heal".to_vec(),
            },
        }))
        .await
        .unwrap();
    let expected_index = written.log_id.index;

    let mut rx = router.node(follower_id).metrics();
    assert!(
        rx.borrow().last_applied < expected_index,
        "follower should not have applied the write while partitioned"
    );

    router.heal(follower_id);

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.borrow().last_applied >= expected_index {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn change_membership_admits_a_new_voter() {
    let router = RaftRouter::new(&[1, 2, 3, 4]);
    router.initialize_cluster(&[1, 2, 3]).await;
    for id in [1, 2, 3] {
        tokio::time::timeout(Duration::from_secs(5), router.wait_for_leader(id)).await.unwrap();
    }
    let leader_id = router.node(1).current_leader().expect("cluster has a leader");
    let leader = router.node(leader_id);

    leader.change_membership(BTreeSet::from([1, 2, 3, 4])).await.unwrap();

    let mut rx = router.node(4).metrics();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if rx.borrow().membership_config.all_servers().contains(&4) {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .unwrap();
    assert_eq!(rx.borrow().membership_config.all_servers(), BTreeSet::from([1, 2, 3, 4]));
}
