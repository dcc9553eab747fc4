use bytes::Bytes;
use nori_consensus::log::RaftLog;
use nori_consensus::{
    Configuration, ConfigurationEntry, LogEntry, LogId, LogIndex, MemoryLogStore, PeerAddress,
    SharedEntry,
};
use proptest::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;

// Terms never decrease along a log.
fn arb_terms(base: u64, max_len: usize) -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..2, 0..max_len).prop_map(move |steps| {
        let mut term = base;
        steps
            .into_iter()
            .map(|step| {
                term += step;
                term
            })
            .collect()
    })
}

// A leader log, the length of the prefix a follower shares with it, and
// the follower's divergent suffix (terms no leader ever used).
fn arb_logs() -> impl Strategy<Value = (Vec<u64>, usize, Vec<u64>)> {
    arb_terms(1, 40).prop_flat_map(|leader| {
        let len = leader.len();
        (Just(leader), 0..=len, arb_terms(1_000, 20))
    })
}

fn entries(terms: &[u64], first_index: u64) -> Vec<SharedEntry> {
    terms
        .iter()
        .enumerate()
        .map(|(i, term)| {
            let id = LogId::new(first_index + i as u64, *term);
            Arc::new(LogEntry::data(id, Bytes::from(format!("{}@{}", id.index, id.term))))
        })
        .collect()
}

async fn open_log(terms: &[u64]) -> RaftLog {
    let peer = PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], 1)));
    let conf = ConfigurationEntry::stable(Configuration::new([peer]));
    let log = RaftLog::open(Arc::new(MemoryLogStore::new()), None, conf)
        .await
        .unwrap();
    log.append(entries(terms, 1)).await.unwrap();
    log
}

async fn term_list(log: &RaftLog) -> Vec<u64> {
    let mut terms = Vec::new();
    for index in 1..=log.last_index().as_u64() {
        terms.push(log.term_at(LogIndex(index)).await.unwrap().unwrap().as_u64());
    }
    terms
}

#[test]
fn test_property_follower_converges_on_leader_log() {
    let rt = tokio::runtime::Runtime::new().unwrap();

    proptest!(|((leader, shared, divergent) in arb_logs(), from in 0usize..=40)| {
        rt.block_on(async {
            let mut follower_terms = leader[..shared].to_vec();
            follower_terms.extend(&divergent);
            let follower = open_log(&follower_terms).await;

            // the leader backs up to any point inside the shared prefix
            let from = from.min(shared);
            let batch = entries(&leader[from..], from as u64 + 1);
            follower
                .append_from_leader(batch, LogIndex(from as u64))
                .await
                .unwrap();

            let terms = term_list(&follower).await;
            prop_assert!(terms.len() >= leader.len());
            prop_assert_eq!(&terms[..leader.len()], &leader[..]);
            // a suffix past the batch is only dropped when something conflicted
            if shared < leader.len() || divergent.is_empty() {
                prop_assert_eq!(follower.last_index(), LogIndex(leader.len() as u64));
            }
            Ok(())
        })?;
    });
}

#[test]
fn test_property_stale_batch_never_truncates() {
    let rt = tokio::runtime::Runtime::new().unwrap();

    proptest!(|(leader in arb_terms(1, 40), a in 0usize..40, b in 0usize..40)| {
        rt.block_on(async {
            let log = open_log(&leader).await;
            let (lo, hi) = (a.min(b).min(leader.len()), a.max(b).min(leader.len()));

            // a delayed copy of an older, matching batch
            log.append_from_leader(entries(&leader[lo..hi], lo as u64 + 1), LogIndex::ZERO)
                .await
                .unwrap();

            prop_assert_eq!(term_list(&log).await, leader.clone());
            Ok(())
        })?;
    });
}

#[test]
fn test_property_entries_respect_limits() {
    let rt = tokio::runtime::Runtime::new().unwrap();

    proptest!(|(leader in arb_terms(1, 40), max_count in 1usize..10, max_bytes in 1usize..256)| {
        rt.block_on(async {
            let log = open_log(&leader).await;
            let got = log
                .entries(LogIndex(1), log.last_index(), max_count, max_bytes)
                .await
                .unwrap();

            prop_assert!(got.len() <= max_count);
            if !leader.is_empty() {
                prop_assert!(!got.is_empty());
            }
            for (i, entry) in got.iter().enumerate() {
                prop_assert_eq!(entry.id, LogId::new(i as u64 + 1, leader[i]));
            }
            Ok(())
        })?;
    });
}
