//! In-memory lookup table for DNS records. Answers cached from the upstream
//! land here, as do records registered through the admin service.

use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::BinaryHeap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics::STORE_ENTRIES;
use crate::packet::{QueryType, Question, Record};

/// Number of independently-locked partitions. Shard selection is a stable
/// hash of the qname modulo this constant.
pub const SHARD_COUNT: usize = 32;

/// Cadence at which the reaper sweeps the per-shard deadline heaps.
const REAPER_INTERVAL: Duration = Duration::from_millis(500);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct StoredRecord {
    record: Record,
    /// Last wall-clock second at which a reader (or the insert itself)
    /// acknowledged this record; queries decay the ttl by the elapsed gap.
    ttl_check: u64,
    /// Monotonic stamp identifying this insert. A superseded insert leaves a
    /// stale heap entry behind; the reaper matches on (deadline, seq) and
    /// discards entries whose stamp no longer belongs to a live record.
    seq: u64,
    /// Wall-clock second at which the reaper may remove this record.
    /// 0 means no removal is scheduled (ttl 0 at insert time).
    deadline: u64,
}

#[derive(Default)]
struct Shard {
    records: Vec<StoredRecord>,
    deadlines: BinaryHeap<Reverse<(u64, u64)>>,
}

/// Hash-sharded record cache with cooperative TTL expiry: queries hide
/// expired entries immediately, a single background reaper removes them.
pub struct RecordStore {
    shards: [Mutex<Shard>; SHARD_COUNT],
    seq: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl RecordStore {
    /// Creates the store and spawns its reaper task. The reaper wakes up on
    /// the shutdown signal and exits; `join` waits for it.
    pub fn new(shutdown_rx: watch::Receiver<bool>) -> Arc<Self> {
        let store = Arc::new(Self {
            shards: std::array::from_fn(|_| Mutex::new(Shard::default())),
            seq: AtomicU64::new(0),
            reaper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&store);
        let handle = tokio::spawn(run_reaper(weak, shutdown_rx));
        if let Ok(mut slot) = store.reaper.lock() {
            *slot = Some(handle);
        }
        store
    }

    fn shard_for(qname: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        qname.hash(&mut hasher);
        (hasher.finish() % SHARD_COUNT as u64) as usize
    }

    /// Inserts a record, or replaces the stored one sharing its
    /// (qname, qtype, data) identity. Returns true on update.
    pub fn insert_or_update(&self, record: Record) -> bool {
        let now = now_secs();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let deadline = if record.ttl > 0 {
            now + record.ttl as u64
        } else {
            0
        };

        let mut shard = self.shards[Self::shard_for(&record.qname)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut updated = false;
        for stored in shard.records.iter_mut() {
            if stored.record.qtype != record.qtype {
                continue;
            }
            if stored.record.qname != record.qname {
                continue;
            }
            if stored.record.data != record.data {
                continue;
            }
            stored.record = record.clone();
            stored.ttl_check = now;
            stored.seq = seq;
            stored.deadline = deadline;
            updated = true;
            break;
        }
        if !updated {
            shard.records.push(StoredRecord {
                record: record.clone(),
                ttl_check: now,
                seq,
                deadline,
            });
            STORE_ENTRIES.inc();
        }
        if deadline > 0 {
            shard.deadlines.push(Reverse((deadline, seq)));
        }
        drop(shard);

        if updated {
            info!("Updated record: {}", record);
        } else {
            info!("Inserted record: {}", record);
        }
        updated
    }

    /// Removes the stored record matching on (qname, qtype, data).
    pub fn remove(&self, record: &Record) -> bool {
        let mut shard = self.shards[Self::shard_for(&record.qname)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut found = None;
        for (i, stored) in shard.records.iter().enumerate() {
            if stored.record.qtype != record.qtype {
                continue;
            }
            if stored.record.qname != record.qname {
                continue;
            }
            if stored.record.data != record.data {
                continue;
            }
            found = Some(i);
            break;
        }
        let removed = match found {
            Some(i) => {
                shard.records.swap_remove(i);
                STORE_ENTRIES.dec();
                true
            }
            None => false,
        };
        drop(shard);

        if removed {
            info!("Removal succeeded for record: {}", record);
        } else {
            info!("Removal failed (not found) for record: {}", record);
        }
        removed
    }

    /// Returns copies of every live record matching the question, with ttls
    /// decayed by the time elapsed since they were last acknowledged. A
    /// stored CNAME matches questions of any qtype for its name. Entries
    /// whose ttl has lapsed are hidden, never removed here; the reaper owns
    /// removal.
    pub fn query(&self, question: &Question) -> Vec<Record> {
        let mut shard = self.shards[Self::shard_for(&question.qname)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = now_secs();
        let mut hits = Vec::new();
        for stored in shard.records.iter_mut() {
            let record = &mut stored.record;
            if question.qtype != record.qtype && record.qtype != QueryType::CNAME {
                continue;
            }
            if question.qname != record.qname {
                continue;
            }

            let ttl_delta =
                u16::try_from(now.saturating_sub(stored.ttl_check)).unwrap_or(u16::MAX);
            stored.ttl_check = now;
            if u32::from(ttl_delta) > record.ttl {
                // Expired; removal is in flight on the reaper.
                continue;
            }
            record.ttl -= u32::from(ttl_delta);
            hits.push(record.clone());
        }
        drop(shard);

        let hit_qnames: Vec<&str> = hits.iter().map(|hit| hit.qname.as_str()).collect();
        info!(
            "For question: {}, record store contained: [ {} ].",
            question,
            hit_qnames.join(", ")
        );
        hits
    }

    /// Total records across all shards, including expired-but-unreaped ones.
    pub fn entry_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .records
                    .len()
            })
            .sum()
    }

    /// Pops every due deadline and removes the records it still identifies.
    /// Stale entries from superseded inserts are dropped without touching
    /// the record that replaced them.
    fn sweep_expired(&self) {
        let now = now_secs();
        for shard in &self.shards {
            let mut shard = shard
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            while let Some(&Reverse((deadline, seq))) = shard.deadlines.peek() {
                if deadline > now {
                    break;
                }
                shard.deadlines.pop();

                let position = shard
                    .records
                    .iter()
                    .position(|stored| stored.seq == seq && stored.deadline == deadline);
                if let Some(i) = position {
                    let stored = shard.records.swap_remove(i);
                    STORE_ENTRIES.dec();
                    info!("Reaped expired record: {}", stored.record);
                }
            }
        }
    }

    /// Waits for the reaper to observe the shutdown signal and exit.
    pub async fn join(&self) {
        let handle = match self.reaper.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_reaper(store: Weak<RecordStore>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(REAPER_INTERVAL) => {}
        }
        let Some(store) = store.upgrade() else { break };
        store.sweep_expired();
    }
    debug!("record store reaper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RecordData;
    use tokio::time::sleep;

    fn a_record(qname: &str, ttl: u32, last_octet: u8) -> Record {
        Record {
            qname: qname.to_string(),
            qtype: QueryType::A,
            dns_class: 1,
            ttl,
            data: RecordData::A {
                addr: [10, 0, 0, last_octet],
            },
        }
    }

    fn store() -> (Arc<RecordStore>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (RecordStore::new(rx), tx)
    }

    #[tokio::test]
    async fn insert_then_matching_insert_is_an_update() {
        let (store, _tx) = store();
        assert!(!store.insert_or_update(a_record("a.example", 300, 1)));
        assert!(store.insert_or_update(a_record("a.example", 500, 1)));
        assert_eq!(store.entry_count(), 1);

        let hits = store.query(&Question::new("a.example", QueryType::A));
        assert_eq!(hits.len(), 1);
        assert!((499..=500).contains(&hits[0].ttl), "ttl was {}", hits[0].ttl);
    }

    #[tokio::test]
    async fn records_with_different_data_coexist() {
        let (store, _tx) = store();
        assert!(!store.insert_or_update(a_record("a.example", 300, 1)));
        assert!(!store.insert_or_update(a_record("a.example", 300, 2)));
        assert_eq!(store.entry_count(), 2);
        assert_eq!(
            store.query(&Question::new("a.example", QueryType::A)).len(),
            2
        );
    }

    #[tokio::test]
    async fn query_decays_ttl_once_per_elapsed_second() {
        let (store, _tx) = store();
        store.insert_or_update(a_record("decay.example", 300, 1));
        sleep(Duration::from_millis(2100)).await;

        let first = store.query(&Question::new("decay.example", QueryType::A));
        assert_eq!(first.len(), 1);
        assert!(
            (297..=299).contains(&first[0].ttl),
            "ttl was {}",
            first[0].ttl
        );

        // ttl_check advanced: an immediate second query must not decay again.
        let second = store.query(&Question::new("decay.example", QueryType::A));
        assert_eq!(second.len(), 1);
        assert!(second[0].ttl <= first[0].ttl);
        assert!(second[0].ttl >= first[0].ttl - 1);
    }

    #[tokio::test]
    async fn expired_record_is_hidden_and_then_reaped() {
        let (store, _tx) = store();
        store.insert_or_update(a_record("brief.example", 1, 1));

        sleep(Duration::from_millis(2200)).await;
        assert!(store
            .query(&Question::new("brief.example", QueryType::A))
            .is_empty());
        assert_eq!(store.entry_count(), 0, "reaper should have removed it");
    }

    #[tokio::test]
    async fn zero_ttl_record_is_never_scheduled_for_removal() {
        let (store, _tx) = store();
        store.insert_or_update(a_record("zero.example", 0, 1));
        // No deadline was scheduled; the reaper leaves the entry alone and
        // queries hide it as soon as a second has elapsed.
        sleep(Duration::from_millis(2200)).await;
        assert_eq!(store.entry_count(), 1);
        assert!(store
            .query(&Question::new("zero.example", QueryType::A))
            .is_empty());
    }

    #[tokio::test]
    async fn update_refreshes_the_removal_deadline() {
        let (store, _tx) = store();
        store.insert_or_update(a_record("refresh.example", 1, 1));
        store.insert_or_update(a_record("refresh.example", 5, 1));

        // Past the first insert's deadline: the stale heap entry must not
        // take the updated record with it.
        sleep(Duration::from_millis(1900)).await;
        let hits = store.query(&Question::new("refresh.example", QueryType::A));
        assert_eq!(hits.len(), 1);
        assert!(hits[0].ttl >= 2, "ttl was {}", hits[0].ttl);
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn remove_reports_whether_a_record_was_found() {
        let (store, _tx) = store();
        store.insert_or_update(a_record("gone.example", 60, 1));
        assert!(store.remove(&a_record("gone.example", 60, 1)));
        assert!(!store.remove(&a_record("gone.example", 60, 1)));
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn cname_matches_queries_of_any_type() {
        let (store, _tx) = store();
        store.insert_or_update(Record {
            qname: "alias.example".to_string(),
            qtype: QueryType::CNAME,
            dns_class: 1,
            ttl: 60,
            data: RecordData::CNAME {
                host: "target.example".to_string(),
            },
        });

        let hits = store.query(&Question::new("alias.example", QueryType::AAAA));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].qtype, QueryType::CNAME);
    }

    #[tokio::test]
    async fn shutdown_joins_the_reaper() {
        let (store, tx) = store();
        tx.send(true).expect("reaper should still be listening");
        tokio::time::timeout(Duration::from_secs(2), store.join())
            .await
            .expect("reaper did not exit after shutdown");
    }
}
