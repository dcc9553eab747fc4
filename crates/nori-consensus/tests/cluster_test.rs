//! Three-node groups over the in-memory network: election, replication,
//! partitions, leases, leadership transfer and membership changes.

mod common;

use bytes::Bytes;
use common::*;
use nori_consensus::*;
use std::time::Duration;

fn values(range: std::ops::Range<usize>) -> impl Iterator<Item = String> {
    range.map(|i| format!("value-{:02}", i))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_election() {
    let cluster = Cluster::start(&[7101, 7102, 7103]).await;
    let leader = cluster.wait_leader().await;

    let term = cluster.node(leader).raft.current_term();
    assert!(term >= Term(1));
    let leaders = cluster
        .nodes
        .iter()
        .filter(|n| n.raft.is_leader())
        .count();
    assert_eq!(leaders, 1);

    let meter = &cluster.node(leader).meter;
    assert!(meter.counter_value("raft_elections_won") >= 1);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_entries_applied_in_order_everywhere() {
    let cluster = Cluster::start(&[7111, 7112, 7113]).await;
    let leader = cluster.wait_leader().await;

    cluster.propose_all(leader, values(0..20)).await;
    let expected: Vec<Bytes> = values(0..20).map(Bytes::from).collect();
    for node in &cluster.nodes {
        cluster.wait_applied(node.peer, 20).await;
        assert_eq!(node.values(), expected);
    }

    let status = cluster.node(leader).raft.status();
    assert_eq!(status.commit_index, status.last_log_id.index);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_rejects_proposals() {
    let cluster = Cluster::start(&[7121, 7122, 7123]).await;
    let leader = cluster.wait_leader().await;
    let follower = cluster.nodes.iter().find(|n| n.peer != leader).unwrap();

    let err = follower.raft.propose(Bytes::from_static(b"x")).await.unwrap_err();
    match err {
        RaftError::NotLeader { leader: hint } => assert_eq!(hint, Some(leader)),
        other => panic!("expected NotLeader, got {:?}", other),
    }
    assert!(matches!(
        follower.raft.read_index().await,
        Err(RaftError::NotLeader { .. })
    ));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_index_covers_prior_writes() {
    let cluster = Cluster::start(&[7131, 7132, 7133]).await;
    let leader = cluster.wait_leader().await;
    let raft = &cluster.node(leader).raft;

    let written = raft.propose(Bytes::from_static(b"a")).await.unwrap();
    let read = raft.read_index().await.unwrap();
    assert!(read >= written);
    assert!(cluster.node(leader).fsm.last_applied() >= read);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_isolated_leader_cannot_commit() {
    let cluster = Cluster::start(&[7141, 7142, 7143]).await;
    let old = cluster.wait_leader().await;
    cluster.propose_all(old, values(0..3)).await;

    cluster.network.isolate(old.addr);
    let stuck = tokio::time::timeout(
        Duration::from_millis(500),
        cluster.node(old).raft.propose(Bytes::from_static(b"lost")),
    )
    .await;
    assert!(!matches!(stuck, Ok(Ok(_))), "minority leader committed");

    let majority: Vec<PeerAddress> = cluster
        .nodes
        .iter()
        .map(|n| n.peer)
        .filter(|p| *p != old)
        .collect();
    let new = cluster.wait_leader_among(&majority).await;
    assert!(cluster.node(new).raft.current_term() > cluster.node(old).raft.current_term());
    cluster.propose_all(new, values(3..6)).await;

    cluster.network.heal();
    let leader = cluster.wait_leader().await;
    assert_ne!(leader, old);

    let expected: Vec<Bytes> = values(0..6).map(Bytes::from).collect();
    for node in &cluster.nodes {
        cluster.wait_applied(node.peer, 6).await;
        assert_eq!(node.values(), expected);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follower_lease_rejects_disruptive_pre_vote() {
    let cluster = Cluster::start(&[7151, 7152, 7153]).await;
    let leader = cluster.wait_leader().await;
    let follower = cluster.nodes.iter().find(|n| n.peer != leader).unwrap();
    let term = follower.raft.current_term();

    let outsider = peer(7159);
    let client = InMemoryTransport::new(outsider.addr, cluster.network.clone());
    let response = client
        .pre_vote(
            &follower.peer,
            RequestVoteRequest {
                group_id: GROUP.to_string(),
                server_id: outsider,
                peer_id: follower.peer,
                term: term.next(),
                last_log_id: LogId::new(1_000, term.as_u64()),
            },
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert!(!response.granted);
    assert!(response.rejected_by_lease);
    assert_eq!(follower.raft.current_term(), term);
    assert_eq!(cluster.wait_leader().await, leader);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leadership_transfer() {
    let cluster = Cluster::start(&[7161, 7162, 7163]).await;
    let old = cluster.wait_leader().await;
    cluster.propose_all(old, values(0..5)).await;

    let target = cluster.nodes.iter().find(|n| n.peer != old).unwrap().peer;
    let old_term = cluster.node(old).raft.current_term();
    cluster
        .node(old)
        .raft
        .transfer_leadership_to(target)
        .await
        .unwrap();

    let new = cluster.wait_leader().await;
    assert_eq!(new, target);
    assert!(cluster.node(new).raft.current_term() > old_term);

    cluster.propose_all(new, values(5..7)).await;
    for node in &cluster.nodes {
        cluster.wait_applied(node.peer, 7).await;
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transfer_to_non_member_is_rejected() {
    let cluster = Cluster::start(&[7171, 7172, 7173]).await;
    let leader = cluster.wait_leader().await;

    let err = cluster
        .node(leader)
        .raft
        .transfer_leadership_to(peer(7179))
        .await
        .unwrap_err();
    assert!(matches!(err, RaftError::InvalidRequest { .. }));
    assert!(cluster.node(leader).raft.is_leader());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_change_peers_replaces_member() {
    let mut cluster = Cluster::start(&[7181, 7182, 7183]).await;
    let leader = cluster.wait_leader().await;
    cluster.propose_all(leader, values(0..5)).await;

    // the newcomer learns its membership from the log
    let old_conf = cluster.node(leader).raft.configuration().peers;
    cluster.add_node(7184, old_conf.clone()).await;
    let newcomer = peer(7184);

    let removed = old_conf.iter().copied().find(|p| *p != leader).unwrap();
    let new_conf = Configuration::new(
        old_conf
            .iter()
            .copied()
            .filter(|p| *p != removed)
            .chain([newcomer]),
    );
    cluster
        .node(leader)
        .raft
        .change_peers(new_conf.clone())
        .await
        .unwrap();

    let conf = cluster.node(leader).raft.configuration();
    assert!(!conf.is_joint());
    assert_eq!(conf.peers, new_conf);

    let members: Vec<PeerAddress> = new_conf.iter().copied().collect();
    let leader = cluster.wait_leader_among(&members).await;
    cluster.propose_all(leader, values(5..8)).await;
    cluster.wait_applied(newcomer, 8).await;
    assert_eq!(
        cluster.node(newcomer).values(),
        values(0..8).map(Bytes::from).collect::<Vec<_>>()
    );
    assert_eq!(cluster.node(newcomer).raft.configuration().peers, new_conf);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leader_removed_from_configuration_steps_down() {
    let cluster = Cluster::start(&[7191, 7192, 7193]).await;
    let leader = cluster.wait_leader().await;

    let rest: Vec<PeerAddress> = cluster
        .nodes
        .iter()
        .map(|n| n.peer)
        .filter(|p| *p != leader)
        .collect();
    cluster
        .node(leader)
        .raft
        .change_peers(Configuration::new(rest.iter().copied()))
        .await
        .unwrap();
    assert!(!cluster.node(leader).raft.is_leader());

    let new = cluster.wait_leader_among(&rest).await;
    assert_ne!(new, leader);
    cluster.propose_all(new, values(0..2)).await;

    cluster.shutdown().await;
}
