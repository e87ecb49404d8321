//! Claim semantics against a file-backed database shared by many claimers.

use std::collections::HashSet;
use std::sync::Arc;

use memory_worker::memory_db::{MemoryDatabase, QueuePayload};
use proptest::prelude::*;
use tempfile::TempDir;

fn open_db() -> (TempDir, Arc<MemoryDatabase>) {
    let dir = TempDir::new().unwrap();
    let db = MemoryDatabase::new(&dir.path().join("memory.db")).unwrap();
    (dir, Arc::new(db))
}

fn payload(n: usize) -> QueuePayload {
    QueuePayload::Observation {
        tool_name: "Bash".into(),
        tool_input: format!(r#"{{"command":"echo {}"}}"#, n),
        tool_response: n.to_string(),
        cwd: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_each_item_claimed_at_most_once(claimers in 2usize..8, items in 1usize..40) {
        let (_dir, db) = open_db();
        let session = db.sessions.upsert("ext-claim", "proj", "").unwrap();
        for n in 0..items {
            db.queue.enqueue(session, "ext-claim", 1, &payload(n)).unwrap();
        }

        let claimed: Vec<i64> = tokio_test::block_on(async {
            let tasks: Vec<_> = (0..claimers)
                .map(|_| {
                    let db = Arc::clone(&db);
                    tokio::task::spawn_blocking(move || {
                        let mut mine = Vec::new();
                        while let Some(item) = db.queue.claim_next(session).unwrap() {
                            mine.push(item.id);
                        }
                        mine
                    })
                })
                .collect();
            let mut all = Vec::new();
            for task in tasks {
                all.extend(task.await.unwrap());
            }
            all
        });

        let unique: HashSet<i64> = claimed.iter().copied().collect();
        prop_assert_eq!(claimed.len(), items);
        prop_assert_eq!(unique.len(), items);
        prop_assert!(db.queue.claim_next(session).unwrap().is_none());
    }

    #[test]
    fn prop_single_claimer_sees_fifo_order(items in 1usize..30) {
        let (_dir, db) = open_db();
        let session = db.sessions.upsert("ext-fifo", "proj", "").unwrap();
        let mut enqueued = Vec::new();
        for n in 0..items {
            enqueued.push(db.queue.enqueue(session, "ext-fifo", 1, &payload(n)).unwrap());
        }

        let mut claimed = Vec::new();
        while let Some(item) = db.queue.claim_next(session).unwrap() {
            claimed.push(item.id);
        }
        prop_assert_eq!(claimed, enqueued);
    }
}

#[test]
fn test_claims_are_scoped_to_session() {
    let (_dir, db) = open_db();
    let a = db.sessions.upsert("ext-a", "proj", "").unwrap();
    let b = db.sessions.upsert("ext-b", "proj", "").unwrap();
    db.queue.enqueue(a, "ext-a", 1, &payload(1)).unwrap();

    assert!(db.queue.claim_next(b).unwrap().is_none());
    let item = db.queue.claim_next(a).unwrap().unwrap();
    assert_eq!(item.session_db_id, a);
}

#[test]
fn test_claimed_items_survive_reopen_as_pending() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("memory.db");
    let item_id = {
        let db = MemoryDatabase::new(&path).unwrap();
        let session = db.sessions.upsert("ext-1", "proj", "").unwrap();
        db.queue.enqueue(session, "ext-1", 1, &payload(0)).unwrap();
        db.queue.claim_next(session).unwrap().unwrap().id
    };

    let db = MemoryDatabase::new(&path).unwrap();
    assert_eq!(db.queue.reset_stale_processing(0).unwrap(), 1);
    let session = db.sessions.get_by_content_id("ext-1").unwrap().unwrap().id;
    assert_eq!(db.queue.claim_next(session).unwrap().unwrap().id, item_id);
}
