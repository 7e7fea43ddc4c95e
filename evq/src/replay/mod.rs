//! Write-ahead log replay: rebuilds the index queue after a restart.

mod record;

pub use self::record::{CommitKind, RecordKind, SkipSummary, TransactionEventRecord, TransactionLog};

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pointer::EventPointer;
use crate::queue::IndexQueue;
use crate::sequence::SequenceOracle;

/// How records from multiple logs are ordered during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayMode {
    /// Merge every log into one stream ordered by write-order ID. Required
    /// when a channel spans log directories: a transaction's commit can land
    /// in a different log than its puts and takes, and a take's commit can be
    /// written before the corresponding put's commit.
    #[default]
    WriteOrder,
    /// Deprecated: replay each log end-to-end in enumeration order. Kept for
    /// old logs whose write-order stamps cannot be trusted; for well-formed
    /// logs both modes end in the same state.
    PerFile,
}

/// Counters reported after a replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplayStats {
    /// Records past the checkpoint that were applied.
    pub applied: u64,
    /// Records at or before the checkpoint that were skipped.
    pub skipped: u64,
    pub puts: u64,
    pub takes: u64,
    pub commits: u64,
    pub rollbacks: u64,
    /// Committed takes whose put never committed. Non-zero means consumers
    /// may see duplicates after the restart.
    pub unmatched_takes: u64,
}

/// Head record of a live reader, ordered for the merge heap. Ties in write
/// order should not occur; the record's own location keeps the order total
/// and deterministic if they do.
struct Head<L> {
    record: TransactionEventRecord,
    log: L,
}

impl<L> Head<L> {
    fn key(&self) -> (u64, u32, u32) {
        (
            self.record.write_order_id,
            self.record.location.file_id(),
            self.record.location.offset(),
        )
    }
}

impl<L> PartialEq for Head<L> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<L> Eq for Head<L> {}

impl<L> PartialOrd for Head<L> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<L> Ord for Head<L> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Streams committed transactions out of the logs and into the [`IndexQueue`].
///
/// Runs single-threaded before the queue goes online, and must run to
/// completion: stopping mid-stream would leave the queue holding a partially
/// applied history. Puts and takes are staged per transaction until their
/// COMMIT or ROLLBACK arrives; a take committed ahead of its put (possible
/// across logs) parks in `pending_takes` until the put's commit catches up.
pub struct ReplayEngine<'a> {
    queue: &'a IndexQueue,
    transaction_ids: &'a SequenceOracle,
    write_orders: &'a SequenceOracle,
    mode: ReplayMode,
    pending: HashMap<u64, Vec<EventPointer>>,
    pending_takes: Vec<EventPointer>,
    stats: ReplayStats,
}

impl<'a> ReplayEngine<'a> {
    pub fn new(
        queue: &'a IndexQueue,
        transaction_ids: &'a SequenceOracle,
        write_orders: &'a SequenceOracle,
    ) -> Self {
        Self {
            queue,
            transaction_ids,
            write_orders,
            mode: ReplayMode::default(),
            pending: HashMap::new(),
            pending_takes: Vec::new(),
            stats: ReplayStats::default(),
        }
    }

    pub fn with_mode(mut self, mode: ReplayMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replays `logs` into the queue and returns the run's counters. Every
    /// reader is closed on every exit path, including early I/O failures.
    pub fn replay<L: TransactionLog>(mut self, logs: Vec<L>) -> Result<ReplayStats> {
        let checkpoint = self.queue.log_write_order_id();
        info!(
            checkpoint,
            logs = logs.len(),
            mode = ?self.mode,
            "replaying transaction logs"
        );

        match self.mode {
            ReplayMode::WriteOrder => self.replay_merged(logs, checkpoint)?,
            ReplayMode::PerFile => self.replay_per_file(logs, checkpoint)?,
        }

        self.stats.unmatched_takes = self.pending_takes.len() as u64;
        if !self.pending_takes.is_empty() {
            warn!(
                count = self.pending_takes.len(),
                "replayed takes whose puts never committed; consumers may see duplicates"
            );
        }
        if !self.pending.is_empty() {
            debug!(
                transactions = self.pending.len(),
                "dropped staged records of transactions that never resolved"
            );
        }
        info!(
            applied = self.stats.applied,
            skipped = self.stats.skipped,
            queue_size = self.queue.size(),
            "replay finished"
        );
        Ok(self.stats)
    }

    /// K-way merge: a min-heap keyed by each live reader's head record yields
    /// the globally next record; the originating reader is advanced and its
    /// new head re-inserted; an exhausted reader is dropped.
    fn replay_merged<L: TransactionLog>(&mut self, logs: Vec<L>, checkpoint: u64) -> Result<()> {
        let mut heap = BinaryHeap::with_capacity(logs.len());
        for mut log in logs {
            if let Some(record) = self.prime(&mut log, checkpoint)? {
                heap.push(Reverse(Head { record, log }));
            }
        }

        while let Some(Reverse(Head { record, mut log })) = heap.pop() {
            self.apply(record)?;
            if let Some(record) = self.advance(&mut log)? {
                heap.push(Reverse(Head { record, log }));
            }
        }
        Ok(())
    }

    /// Deprecated single-pass mode: each log end-to-end, `pending_takes`
    /// accumulating across files.
    fn replay_per_file<L: TransactionLog>(&mut self, logs: Vec<L>, checkpoint: u64) -> Result<()> {
        for mut log in logs {
            let mut head = self.prime(&mut log, checkpoint)?;
            while let Some(record) = head {
                self.apply(record)?;
                head = self.advance(&mut log)?;
            }
        }
        Ok(())
    }

    /// Skips a log past the checkpoint and peeks its first live record.
    fn prime<L: TransactionLog>(
        &mut self,
        log: &mut L,
        checkpoint: u64,
    ) -> Result<Option<TransactionEventRecord>> {
        let summary = match log.skip_to_checkpoint(checkpoint) {
            Ok(summary) => summary,
            Err(Error::TruncatedLog { file_id, offset }) => {
                warn!(file_id, offset, "log ends mid-record, dropping the rest of the file");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.stats.skipped += summary.skipped;
        self.transaction_ids.seed(summary.max_transaction_id);
        debug!(
            file_id = log.log_file_id(),
            skipped = summary.skipped,
            "positioned log past the checkpoint"
        );
        self.advance(log)
    }

    fn advance<L: TransactionLog>(
        &mut self,
        log: &mut L,
    ) -> Result<Option<TransactionEventRecord>> {
        match log.next() {
            Ok(record) => Ok(record),
            Err(Error::TruncatedLog { file_id, offset }) => {
                warn!(file_id, offset, "log ends mid-record, dropping the rest of the file");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn apply(&mut self, record: TransactionEventRecord) -> Result<()> {
        self.transaction_ids.seed(record.transaction_id);
        self.write_orders.seed(record.write_order_id);
        self.stats.applied += 1;

        let txn = record.transaction_id;
        match record.kind {
            RecordKind::Put => {
                self.stats.puts += 1;
                self.pending.entry(txn).or_default().push(record.location);
            }
            RecordKind::Take(target) => {
                self.stats.takes += 1;
                self.pending.entry(txn).or_default().push(target);
            }
            RecordKind::Rollback => {
                self.stats.rollbacks += 1;
                self.pending.remove(&txn);
            }
            RecordKind::Commit(kind) => {
                self.stats.commits += 1;
                let staged = self.pending.remove(&txn).unwrap_or_default();
                self.commit(txn, kind, staged)?;
            }
        }
        Ok(())
    }

    fn commit(&mut self, txn: u64, kind: CommitKind, staged: Vec<EventPointer>) -> Result<()> {
        for ptr in staged {
            match kind {
                CommitKind::Put => {
                    let added = self.queue.add_tail(ptr)?;
                    assert!(
                        added,
                        "index queue overflowed replaying transaction {txn}: \
                         the configured capacity is smaller than the committed backlog"
                    );
                    if let Some(at) = self.pending_takes.iter().position(|p| *p == ptr) {
                        // The take's commit was observed first; settle it now.
                        self.pending_takes.swap_remove(at);
                        let removed = self.queue.remove(ptr);
                        assert!(
                            removed,
                            "pointer {ptr} vanished between its put and its pending take"
                        );
                        debug!(%ptr, txn, "matched a take committed ahead of its put");
                    }
                }
                CommitKind::Take => {
                    if !self.queue.remove(ptr) {
                        // The committing put is later in the stream (or absent).
                        self.pending_takes.push(ptr);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;

    /// In-memory log for driving the engine without files.
    struct MemLog {
        file_id: u32,
        records: Vec<TransactionEventRecord>,
        at: usize,
    }

    impl MemLog {
        fn new(file_id: u32, records: Vec<TransactionEventRecord>) -> Self {
            Self {
                file_id,
                records,
                at: 0,
            }
        }
    }

    impl TransactionLog for MemLog {
        fn log_file_id(&self) -> u32 {
            self.file_id
        }

        fn skip_to_checkpoint(&mut self, checkpoint: u64) -> Result<SkipSummary> {
            let mut summary = SkipSummary::default();
            while let Some(record) = self.records.get(self.at) {
                if record.write_order_id > checkpoint {
                    break;
                }
                summary.skipped += 1;
                summary.max_transaction_id = summary.max_transaction_id.max(record.transaction_id);
                self.at += 1;
            }
            Ok(summary)
        }

        fn next(&mut self) -> Result<Option<TransactionEventRecord>> {
            let record = self.records.get(self.at).copied();
            self.at += 1;
            Ok(record)
        }
    }

    fn rec(
        transaction_id: u64,
        write_order_id: u64,
        location: (u32, u32),
        kind: RecordKind,
    ) -> TransactionEventRecord {
        TransactionEventRecord {
            transaction_id,
            write_order_id,
            location: EventPointer::new(location.0, location.1),
            kind,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        queue: IndexQueue,
        transaction_ids: SequenceOracle,
        write_orders: SequenceOracle,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let write_orders = SequenceOracle::new();
            let queue = IndexQueue::open(
                &dir.path().join("checkpoint"),
                32,
                Arc::new(SequenceOracle::new()),
            )
            .unwrap();
            Self {
                _dir: dir,
                queue,
                transaction_ids: SequenceOracle::new(),
                write_orders,
            }
        }

        fn engine(&self) -> ReplayEngine<'_> {
            ReplayEngine::new(&self.queue, &self.transaction_ids, &self.write_orders)
        }
    }

    #[test]
    fn committed_put_lands_in_the_queue() {
        let fx = Fixture::new();
        let log = MemLog::new(
            17,
            vec![
                rec(1, 1, (17, 0), RecordKind::Put),
                rec(1, 2, (17, 64), RecordKind::Commit(CommitKind::Put)),
            ],
        );
        fx.engine().replay(vec![log]).unwrap();
        assert_eq!(fx.queue.remove_head(), Some(EventPointer::new(17, 0)));
        assert_eq!(fx.queue.remove_head(), None);
    }

    #[test]
    fn rolled_back_put_leaves_nothing() {
        let fx = Fixture::new();
        let log = MemLog::new(
            17,
            vec![
                rec(1, 1, (17, 0), RecordKind::Put),
                rec(1, 2, (17, 64), RecordKind::Rollback),
            ],
        );
        let stats = fx.engine().replay(vec![log]).unwrap();
        assert_eq!(fx.queue.remove_head(), None);
        assert_eq!(stats.rollbacks, 1);
    }

    #[test]
    fn put_then_take_cancel_out() {
        let fx = Fixture::new();
        let log = MemLog::new(
            17,
            vec![
                rec(1, 1, (17, 0), RecordKind::Put),
                rec(1, 2, (17, 64), RecordKind::Commit(CommitKind::Put)),
                rec(2, 3, (17, 128), RecordKind::Take(EventPointer::new(17, 0))),
                rec(2, 4, (17, 192), RecordKind::Commit(CommitKind::Take)),
            ],
        );
        let stats = fx.engine().replay(vec![log]).unwrap();
        assert!(fx.queue.is_empty());
        assert_eq!(stats.unmatched_takes, 0);
    }

    #[test]
    fn rolled_back_take_keeps_the_event() {
        let fx = Fixture::new();
        let log = MemLog::new(
            17,
            vec![
                rec(1, 1, (17, 0), RecordKind::Put),
                rec(1, 2, (17, 64), RecordKind::Commit(CommitKind::Put)),
                rec(2, 3, (17, 128), RecordKind::Take(EventPointer::new(17, 0))),
                rec(2, 4, (17, 192), RecordKind::Rollback),
            ],
        );
        fx.engine().replay(vec![log]).unwrap();
        assert_eq!(fx.queue.remove_head(), Some(EventPointer::new(17, 0)));
        assert_eq!(fx.queue.remove_head(), None);
    }

    /// A take's commit can land in the merged stream before the commit of the
    /// put it references. The take parks until the put is applied, and nothing
    /// is left over.
    #[test]
    fn take_committed_ahead_of_its_put_settles() {
        let fx = Fixture::new();
        let log_a = MemLog::new(
            40,
            vec![
                rec(7, 1, (40, 16), RecordKind::Take(EventPointer::new(17, 0))),
                rec(7, 2, (40, 80), RecordKind::Commit(CommitKind::Take)),
            ],
        );
        let log_b = MemLog::new(
            17,
            vec![
                rec(3, 10, (17, 0), RecordKind::Put),
                rec(3, 11, (17, 64), RecordKind::Commit(CommitKind::Put)),
            ],
        );
        let stats = fx.engine().replay(vec![log_a, log_b]).unwrap();
        assert!(fx.queue.is_empty());
        assert_eq!(stats.unmatched_takes, 0);
    }

    #[test]
    fn take_of_an_uncommitted_put_is_reported() {
        let fx = Fixture::new();
        let log = MemLog::new(
            40,
            vec![
                rec(7, 1, (40, 16), RecordKind::Take(EventPointer::new(17, 0))),
                rec(7, 2, (40, 80), RecordKind::Commit(CommitKind::Take)),
            ],
        );
        let stats = fx.engine().replay(vec![log]).unwrap();
        assert!(fx.queue.is_empty());
        assert_eq!(stats.unmatched_takes, 1);
    }

    #[test]
    fn commit_with_nothing_staged_is_a_no_op() {
        let fx = Fixture::new();
        let log = MemLog::new(
            17,
            vec![rec(42, 1, (17, 0), RecordKind::Commit(CommitKind::Put))],
        );
        let stats = fx.engine().replay(vec![log]).unwrap();
        assert!(fx.queue.is_empty());
        assert_eq!(stats.commits, 1);
    }

    #[test]
    fn merge_order_is_independent_of_log_order() {
        let records_a = vec![
            rec(7, 100, (40, 16), RecordKind::Take(EventPointer::new(17, 0))),
            rec(7, 101, (40, 80), RecordKind::Commit(CommitKind::Take)),
        ];
        let records_b = vec![
            rec(3, 10, (17, 0), RecordKind::Put),
            rec(3, 11, (17, 64), RecordKind::Commit(CommitKind::Put)),
            rec(4, 12, (17, 128), RecordKind::Put),
            rec(4, 13, (17, 192), RecordKind::Commit(CommitKind::Put)),
        ];

        let mut outcomes = Vec::new();
        for logs in [
            vec![
                MemLog::new(40, records_a.clone()),
                MemLog::new(17, records_b.clone()),
            ],
            vec![
                MemLog::new(17, records_b.clone()),
                MemLog::new(40, records_a.clone()),
            ],
        ] {
            let fx = Fixture::new();
            fx.engine().replay(logs).unwrap();
            outcomes.push(fx.queue.ring_slots());
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[test]
    fn records_at_or_before_the_checkpoint_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint");
        let write_orders = Arc::new(SequenceOracle::new());

        // Simulate the online history: a put committed and checkpointed.
        let queue = IndexQueue::open(&path, 32, write_orders.clone()).unwrap();
        write_orders.seed(2);
        queue.add_tail(EventPointer::new(17, 0)).unwrap();
        queue.checkpoint(false).unwrap();
        let checkpoint = queue.log_write_order_id();

        let log = MemLog::new(
            17,
            vec![
                rec(1, 1, (17, 0), RecordKind::Put),
                rec(1, 2, (17, 64), RecordKind::Commit(CommitKind::Put)),
                rec(2, checkpoint + 1, (17, 128), RecordKind::Put),
                rec(
                    2,
                    checkpoint + 2,
                    (17, 192),
                    RecordKind::Commit(CommitKind::Put),
                ),
            ],
        );
        let transaction_ids = SequenceOracle::new();
        let stats = ReplayEngine::new(&queue, &transaction_ids, &write_orders)
            .replay(vec![log])
            .unwrap();

        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.applied, 2);
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.remove_head(), Some(EventPointer::new(17, 0)));
        assert_eq!(queue.remove_head(), Some(EventPointer::new(17, 128)));
    }

    #[test]
    fn oracles_clear_every_observed_id() {
        let fx = Fixture::new();
        let log = MemLog::new(
            17,
            vec![
                rec(900, 5, (17, 0), RecordKind::Put),
                rec(900, 6, (17, 64), RecordKind::Commit(CommitKind::Put)),
            ],
        );
        fx.engine().replay(vec![log]).unwrap();
        assert!(fx.transaction_ids.next() > 900);
        assert!(fx.write_orders.next() > 6);
    }

    #[test]
    fn skipped_records_still_seed_the_transaction_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let write_orders = Arc::new(SequenceOracle::new());
        let queue =
            IndexQueue::open(&dir.path().join("checkpoint"), 32, write_orders.clone()).unwrap();
        write_orders.seed(10);
        queue.checkpoint(true).unwrap();
        let checkpoint = queue.log_write_order_id();

        let log = MemLog::new(
            17,
            vec![
                rec(500, 1, (17, 0), RecordKind::Put),
                rec(500, 2, (17, 64), RecordKind::Rollback),
            ],
        );
        assert!(checkpoint >= 2, "fixture records must predate the checkpoint");
        let transaction_ids = SequenceOracle::new();
        let stats = ReplayEngine::new(&queue, &transaction_ids, &write_orders)
            .replay(vec![log])
            .unwrap();
        assert_eq!(stats.applied, 0);
        assert!(transaction_ids.next() > 500);
    }

    #[test]
    fn per_file_mode_matches_write_order_mode_on_well_formed_logs() {
        let records_a = vec![
            rec(1, 1, (17, 0), RecordKind::Put),
            rec(1, 2, (17, 64), RecordKind::Commit(CommitKind::Put)),
            rec(2, 5, (17, 128), RecordKind::Take(EventPointer::new(17, 0))),
            rec(2, 6, (17, 192), RecordKind::Commit(CommitKind::Take)),
        ];
        let records_b = vec![
            rec(3, 3, (18, 16), RecordKind::Put),
            rec(3, 4, (18, 80), RecordKind::Commit(CommitKind::Put)),
        ];

        let merged = {
            let fx = Fixture::new();
            fx.engine()
                .replay(vec![
                    MemLog::new(17, records_a.clone()),
                    MemLog::new(18, records_b.clone()),
                ])
                .unwrap();
            (fx.queue.ring_slots(), fx.write_orders.current())
        };
        let per_file = {
            let fx = Fixture::new();
            fx.engine()
                .with_mode(ReplayMode::PerFile)
                .replay(vec![
                    MemLog::new(17, records_a),
                    MemLog::new(18, records_b),
                ])
                .unwrap();
            (fx.queue.ring_slots(), fx.write_orders.current())
        };
        assert_eq!(merged, per_file);
    }
}
