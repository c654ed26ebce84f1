use super::log::PersistentLog;
use super::storage::Storage;
use super::{LogIndex, Term};

/// The replicated application. Payloads arrive here in log order, once each, after they are committed.
pub trait StateMachine {
    type Error: std::fmt::Display;

    fn apply(&mut self, payload: &[u8]) -> Result<Vec<u8>, Self::Error>;
}

/// An entry that was handed to the state machine, with the state machine's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub index: LogIndex,
    pub term: Term,
    pub output: Vec<u8>,
}

/// Delivers committed entries to the [`StateMachine`].
/// If commitIndex > lastApplied: increment lastApplied, apply log[lastApplied] to state machine.
#[derive(Debug, Default)]
pub struct CommitPublisher {
    last_applied: LogIndex,
}

impl CommitPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Apply every entry in `lastApplied+1..=commit_index` in order.
    /// A failed delivery stops publication at that entry; the next call retries it, nothing after it is applied
    /// before it succeeds.
    pub fn publish<S: Storage, M: StateMachine>(
        &mut self,
        log: &PersistentLog<S>,
        commit_index: LogIndex,
        state_machine: &mut M,
    ) -> Vec<Applied> {
        assert!(
            commit_index <= log.last_index(),
            "commit index {} is past the end of the log {}",
            commit_index,
            log.last_index()
        );
        let mut applied = vec![];
        while self.last_applied < commit_index {
            let entry = &log[self.last_applied + 1];
            match state_machine.apply(&entry.payload) {
                Ok(output) => {
                    self.last_applied = entry.index;
                    applied.push(Applied {
                        index: entry.index,
                        term: entry.term,
                        output,
                    });
                }
                Err(e) => {
                    log::warn!("applying entry {} failed, will retry: {}", entry.index, e);
                    break;
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod test_commit_publisher {
    use super::*;
    use crate::log::LogEntry;
    use crate::storage::MemoryStorage;

    #[derive(Default)]
    struct Flaky {
        seen: Vec<Vec<u8>>,
        failures_left: usize,
    }

    impl StateMachine for Flaky {
        type Error = String;

        fn apply(&mut self, payload: &[u8]) -> Result<Vec<u8>, String> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err("busy".to_string());
            }
            self.seen.push(payload.to_vec());
            Ok(vec![payload.len() as u8])
        }
    }

    fn log_of(n: u8) -> PersistentLog<MemoryStorage> {
        let entries = (1..=n).map(|i| LogEntry::new(i as LogIndex, 1, vec![i; i as usize])).collect();
        PersistentLog::recover(MemoryStorage::with_state(1, None, entries)).unwrap()
    }

    #[test]
    fn applies_up_to_commit_index_in_order() {
        let log = log_of(4);
        let mut publisher = CommitPublisher::new();
        let mut sm = Flaky::default();
        let applied = publisher.publish(&log, 3, &mut sm);
        assert_eq!(applied.iter().map(|a| a.index).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(applied[2].output, vec![3]);
        assert_eq!(publisher.last_applied(), 3);
        assert_eq!(sm.seen, vec![vec![1], vec![2, 2], vec![3, 3, 3]]);
        assert!(publisher.publish(&log, 3, &mut sm).is_empty(), "exactly once");
    }

    #[test]
    fn failed_delivery_blocks_until_retried() {
        let log = log_of(3);
        let mut publisher = CommitPublisher::new();
        let mut sm = Flaky {
            failures_left: 1,
            ..Flaky::default()
        };
        assert!(publisher.publish(&log, 3, &mut sm).is_empty());
        assert_eq!(publisher.last_applied(), 0);
        let applied = publisher.publish(&log, 3, &mut sm);
        assert_eq!(applied.len(), 3);
        assert_eq!(sm.seen.len(), 3, "no entry skipped or duplicated");
    }

    #[test]
    #[should_panic]
    fn commit_past_log_end() {
        let log = log_of(1);
        CommitPublisher::new().publish(&log, 2, &mut Flaky::default());
    }
}
