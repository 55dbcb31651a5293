//! Work queue contract, exercised against the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use skillq::error::Error;
use skillq::model::{ItemId, NewTicket, SourceRecord, Status};
use skillq::store::{MemoryStore, QueueReader, WorkQueue};

const NO_LIMIT: u32 = u32::MAX;

fn ticket(id: i64, text: &str) -> NewTicket {
    NewTicket::from_record(&SourceRecord {
        ticket_id: id,
        summary: Some(text.to_string()),
        ..Default::default()
    })
    .unwrap()
}

async fn seeded(n: i64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for id in 1..=n {
        assert!(store.insert_if_absent(&ticket(id, "printer offline")).await.unwrap());
    }
    store
}

#[tokio::test]
async fn insert_is_idempotent_per_source_ticket() {
    let store = MemoryStore::new();
    assert!(store.insert_if_absent(&ticket(7, "vpn drops")).await.unwrap());
    assert!(!store.insert_if_absent(&ticket(7, "vpn drops again")).await.unwrap());

    let items = store.list_items(None, 10).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].raw_text, "vpn drops\n---\n\n---\n");
    assert_eq!(items[0].status, Status::Pending);
    assert_eq!(items[0].attempt_count, 0);
}

#[tokio::test]
async fn claims_split_across_callers_oldest_first() {
    let store = seeded(3).await;

    let first = store.claim_batch("w1", 2, NO_LIMIT).await.unwrap();
    let second = store.claim_batch("w2", 2, NO_LIMIT).await.unwrap();
    let third = store.claim_batch("w3", 2, NO_LIMIT).await.unwrap();

    assert_eq!(
        first.iter().map(|i| i.source_ticket_id).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(
        second.iter().map(|i| i.source_ticket_id).collect::<Vec<_>>(),
        vec![3]
    );
    assert!(third.is_empty());
    assert!(first.iter().all(|i| i.claimed_by.as_deref() == Some("w1")));
    assert!(second[0].claimed_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() {
    let store = seeded(200).await;

    let handles: Vec<_> = (0..8)
        .map(|w| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let worker = format!("w{w}");
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(&worker, 7, NO_LIMIT).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|i| i.id));
                    tokio::task::yield_now().await;
                }
                mine
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "item {id} claimed twice");
            total += 1;
        }
    }
    assert_eq!(total, 200);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn claim_skips_items_over_threshold() {
    let store = MemoryStore::new();
    store.insert_if_absent(&ticket(1, &"x".repeat(400))).await.unwrap();
    store.insert_if_absent(&ticket(2, "short")).await.unwrap();

    let batch = store.claim_batch("w1", 10, 50).await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].source_ticket_id, 2);
}

#[tokio::test]
async fn oversized_items_fail_without_a_claim() {
    let store = MemoryStore::new();
    store.insert_if_absent(&ticket(1, &"x".repeat(400))).await.unwrap();
    store.insert_if_absent(&ticket(2, "short")).await.unwrap();

    let failed = store.fail_oversized(50).await.unwrap();
    assert_eq!(failed.len(), 1);

    let item = store.get_item(failed[0].id).await.unwrap();
    assert_eq!(item.status, Status::Failed);
    assert!(item.claimed_by.is_none());
    assert!(item.failure_reason.unwrap().starts_with("oversized"));
    assert_eq!(item.attempt_count, 0);
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn sweep_returns_stale_claims_to_pending() {
    let store = seeded(2).await;
    let claimed = store.claim_batch("crashed", 1, NO_LIMIT).await.unwrap();
    let id = claimed[0].id;

    // A fresh claim is not stale yet.
    assert!(store.sweep_stale(Duration::from_secs(3600)).await.unwrap().is_empty());

    let recovered = store.sweep_stale(Duration::ZERO).await.unwrap();
    assert_eq!(recovered, vec![id]);

    let item = store.get_item(id).await.unwrap();
    assert_eq!(item.status, Status::Pending);
    assert!(item.claimed_by.is_none());
    assert!(item.claimed_at.is_none());

    let reclaimed = store.claim_batch("healthy", 5, NO_LIMIT).await.unwrap();
    assert_eq!(reclaimed.len(), 2);
}

#[tokio::test]
async fn sweep_leaves_terminal_items_alone() {
    let store = seeded(2).await;
    let batch = store.claim_batch("w1", 2, NO_LIMIT).await.unwrap();
    store
        .complete(batch[0].id, "w1", &["SQL".to_string()])
        .await
        .unwrap();
    store.fail(batch[1].id, "w1", "model call failed").await.unwrap();

    assert!(store.sweep_stale(Duration::ZERO).await.unwrap().is_empty());
    let counts = store.status_counts().await.unwrap();
    assert_eq!((counts.complete, counts.failed, counts.pending), (1, 1, 0));
}

#[tokio::test]
async fn complete_stores_skills_with_the_transition() {
    let store = seeded(1).await;
    let item = store.claim_batch("w1", 1, NO_LIMIT).await.unwrap().remove(0);
    let skills = vec!["Azure AD".to_string(), "MFA".to_string()];

    store.complete(item.id, "w1", &skills).await.unwrap();

    let done = store.get_item(item.id).await.unwrap();
    assert_eq!(done.status, Status::Complete);
    assert_eq!(done.result.unwrap()["skills"][1], "MFA");
    assert_eq!(store.skills_for_item(item.id).await.unwrap(), skills);
}

#[tokio::test]
async fn transitions_require_the_current_claim() {
    let store = seeded(1).await;
    let item = store.claim_batch("w1", 1, NO_LIMIT).await.unwrap().remove(0);

    let err = store.complete(item.id, "w2", &[]).await.unwrap_err();
    assert!(matches!(err, Error::ClaimLost { .. }));
    let err = store.record_attempt(item.id, "w2").await.unwrap_err();
    assert!(matches!(err, Error::ClaimLost { .. }));

    // Swept and reclaimed: the old owner can no longer finish it.
    store.sweep_stale(Duration::ZERO).await.unwrap();
    store.claim_batch("w2", 1, NO_LIMIT).await.unwrap();
    let err = store.fail(item.id, "w1", "late").await.unwrap_err();
    assert!(matches!(err, Error::ClaimLost { .. }));

    store.fail(item.id, "w2", "model call failed").await.unwrap();
    let err = store.complete(item.id, "w2", &[]).await.unwrap_err();
    assert!(matches!(err, Error::ClaimLost { .. }));
}

#[tokio::test]
async fn attempts_survive_a_reclaim() {
    let store = seeded(1).await;
    let item = store.claim_batch("w1", 1, NO_LIMIT).await.unwrap().remove(0);
    assert_eq!(store.record_attempt(item.id, "w1").await.unwrap(), 1);
    assert_eq!(store.record_attempt(item.id, "w1").await.unwrap(), 2);

    store.sweep_stale(Duration::ZERO).await.unwrap();
    let again = store.claim_batch("w2", 1, NO_LIMIT).await.unwrap().remove(0);
    assert_eq!(again.attempt_count, 2);
    assert_eq!(store.record_attempt(item.id, "w2").await.unwrap(), 3);
}

#[tokio::test]
async fn an_attempt_refreshes_every_claim_the_worker_holds() {
    let store = seeded(3).await;
    let batch = store.claim_batch("w1", 2, NO_LIMIT).await.unwrap();
    let other = store.claim_batch("w2", 1, NO_LIMIT).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    store.record_attempt(batch[0].id, "w1").await.unwrap();

    // Only w2, which has gone quiet, looks abandoned.
    let recovered = store.sweep_stale(Duration::from_millis(40)).await.unwrap();
    assert_eq!(recovered, vec![other[0].id]);
    for item in &batch {
        let held = store.get_item(item.id).await.unwrap();
        assert_eq!(held.status, Status::Claimed);
        assert_eq!(held.claimed_by.as_deref(), Some("w1"));
    }
}

#[tokio::test]
async fn reader_queries() {
    let store = seeded(3).await;
    let batch = store.claim_batch("w1", 2, NO_LIMIT).await.unwrap();
    store
        .complete(batch[0].id, "w1", &["SQL".to_string(), "DNS".to_string()])
        .await
        .unwrap();

    let in_flight = store.in_flight().await.unwrap();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].id, batch[1].id);

    let pending = store.list_items(Some(Status::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 1);

    let top = store.top_skills(5).await.unwrap();
    assert_eq!(top.len(), 2);
    assert!(top.iter().all(|s| s.frequency == 1));

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.total(), 3);

    let err = store.get_item(ItemId(999)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[test]
fn lifecycle_rejects_moves_out_of_terminal_states() {
    use skillq::model::QueueItem;

    let now = chrono::Utc::now();
    let mut item = QueueItem {
        id: ItemId(1),
        source_ticket_id: 10,
        raw_text: "text".to_string(),
        technician: None,
        closed_at: None,
        estimated_tokens: 1,
        status: Status::Pending,
        claimed_by: None,
        claimed_at: None,
        result: None,
        failure_reason: None,
        attempt_count: 0,
        created_at: now,
        updated_at: now,
    };

    assert!(matches!(
        item.transition(Status::Complete),
        Err(Error::InvalidTransition { .. })
    ));
    item.transition(Status::Claimed).unwrap();
    item.transition(Status::Pending).unwrap();
    item.transition(Status::Claimed).unwrap();
    item.transition(Status::Complete).unwrap();
    assert!(item.status.is_terminal());
    for to in [Status::Pending, Status::Claimed, Status::Failed] {
        assert!(item.transition(to).is_err());
    }
}
