//! Scenario: Concurrent Appends Serialize Through the Advisory Lock
//!
//! # Invariant under test
//!
//! N writers × M appends each against one journal path must land exactly
//! N×M intact lines, with every entry id recomputable from its own content.
//! Each writer holds its own file descriptor, so every append genuinely
//! contends on the exclusive advisory lock — the same contention shape as
//! multiple OS processes sharing the path.

use keel_journal::Journal;
use serde_json::json;
use std::thread;

const WRITERS: usize = 4;
const APPENDS_PER_WRITER: usize = 25;

#[test]
fn concurrent_appends_yield_exactly_n_times_m_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contended.jsonl");

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let path = path.clone();
            thread::spawn(move || {
                // Each writer opens its own instance, as a separate process would.
                let mut journal = Journal::open(&path).unwrap();
                for i in 0..APPENDS_PER_WRITER {
                    journal
                        .append("contend", json!({"writer": w, "i": i}))
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let journal = Journal::open(&path).unwrap();
    let entries = journal.read_all().unwrap();
    assert_eq!(entries.len(), WRITERS * APPENDS_PER_WRITER);

    for entry in &entries {
        assert!(entry.id_is_consistent(), "entry {} corrupt", entry.entry_id);
    }
    assert!(journal.verify_integrity());

    // No interleaved writes: every (writer, i) pair appears exactly once.
    let mut seen = std::collections::HashSet::new();
    for entry in &entries {
        let w = entry.data["writer"].as_u64().unwrap();
        let i = entry.data["i"].as_u64().unwrap();
        assert!(seen.insert((w, i)), "duplicate payload ({w}, {i})");
    }
}

#[test]
fn reopened_instance_continues_past_concurrent_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resume.jsonl");

    {
        let mut a = Journal::open(&path).unwrap();
        let mut b = Journal::open(&path).unwrap();
        a.append("t", json!(1)).unwrap();
        b.append("t", json!(2)).unwrap();
        a.append("t", json!(3)).unwrap();
    }

    let reopened = Journal::open(&path).unwrap();
    assert_eq!(reopened.next_sequence(), 3);
    assert_eq!(reopened.read_all().unwrap().len(), 3);
}
