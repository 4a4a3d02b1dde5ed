use std::sync::Arc;

use hollow_model::{Blob, ObjectId};
use hollow_store::{BlobInterestHandle, StoreError};
use tokio::sync::watch;

use crate::coverage::CoverageSet;
use crate::metadata::InodeMetadata;

/// Which leg of the automaton the inode is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StateTag {
    /// Source-control backed, no fetch in flight.
    NotLoading,
    /// Source-control backed, blob fetch in flight.
    Loading,
    /// Authoritative bytes live in the overlay. Terminal.
    Materialized,
}

/// What a fulfilled loading promise delivers.
///
/// `Ok(None)` is the sentinel for "the state changed while you waited —
/// re-examine it"; it is sent when a truncation materializes the inode out
/// from under an in-flight load.
pub(crate) type LoadOutcome = Result<Option<Arc<Blob>>, StoreError>;

/// Write-once, many-reader completion handle for an in-flight blob load.
///
/// Fulfillment consumes the promise, so a promise can be completed at most
/// once by construction. Dropping it unfulfilled closes the channel, which
/// subscribers observe as [`StoreError::LoadInterrupted`] — no one is left
/// waiting forever.
#[derive(Debug)]
pub(crate) struct LoadingPromise {
    id: ObjectId,
    tx: watch::Sender<Option<LoadOutcome>>,
}

impl LoadingPromise {
    pub(crate) fn new(id: ObjectId) -> Self {
        let (tx, _rx) = watch::channel(None);
        LoadingPromise { id, tx }
    }

    pub(crate) fn subscribe(&self) -> LoadSubscription {
        LoadSubscription {
            id: self.id.clone(),
            rx: self.tx.subscribe(),
        }
    }

    pub(crate) fn fulfill(self, outcome: LoadOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

/// One subscriber's handle on an in-flight load.
pub(crate) struct LoadSubscription {
    id: ObjectId,
    rx: watch::Receiver<Option<LoadOutcome>>,
}

impl LoadSubscription {
    pub(crate) async fn wait(mut self) -> LoadOutcome {
        match self.rx.wait_for(|slot| slot.is_some()).await {
            Ok(value) => value.clone().expect("wait_for only returns filled slots"),
            Err(_) => Err(StoreError::LoadInterrupted(self.id)),
        }
    }
}

/// The source-control identity of a not-yet-materialized file.
#[derive(Debug, Clone)]
pub(crate) struct NonMaterializedState {
    pub(crate) hash: ObjectId,
    /// Blob size, memoized after the first object-store size query.
    pub(crate) size: Option<u64>,
}

/// The state record guarded by the inode lock.
///
/// Field presence per tag is an invariant, checked on every unlock:
///
/// | tag          | non_materialized | loading | read_byte_ranges |
/// |--------------|------------------|---------|------------------|
/// | NotLoading   | present          | absent  | any              |
/// | Loading      | present          | present | empty            |
/// | Materialized | absent           | absent  | empty            |
#[derive(Debug)]
pub(crate) struct FileInodeState {
    tag: StateTag,
    pub(crate) non_materialized: Option<NonMaterializedState>,
    pub(crate) loading: Option<LoadingPromise>,
    pub(crate) interest_handle: BlobInterestHandle,
    pub(crate) read_byte_ranges: CoverageSet,
    pub(crate) metadata: InodeMetadata,
}

impl FileInodeState {
    pub(crate) fn new(hash: Option<ObjectId>, metadata: InodeMetadata) -> Self {
        let state = match hash {
            Some(hash) => FileInodeState {
                tag: StateTag::NotLoading,
                non_materialized: Some(NonMaterializedState { hash, size: None }),
                loading: None,
                interest_handle: BlobInterestHandle::none(),
                read_byte_ranges: CoverageSet::new(),
                metadata,
            },
            None => FileInodeState {
                tag: StateTag::Materialized,
                non_materialized: None,
                loading: None,
                interest_handle: BlobInterestHandle::none(),
                read_byte_ranges: CoverageSet::new(),
                metadata,
            },
        };
        state.check_invariants();
        state
    }

    pub(crate) fn tag(&self) -> StateTag {
        self.tag
    }

    pub(crate) fn is_materialized(&self) -> bool {
        self.tag == StateTag::Materialized
    }

    /// Move to MATERIALIZED, dropping everything tied to the source-control
    /// identity. There is no way back.
    pub(crate) fn set_materialized(&mut self) {
        self.non_materialized = None;
        self.tag = StateTag::Materialized;
        self.interest_handle.reset();
        self.read_byte_ranges.clear();
    }

    /// Install a fresh loading promise and flip to LOADING.
    pub(crate) fn set_loading(&mut self, promise: LoadingPromise) {
        assert_eq!(self.tag, StateTag::NotLoading, "load already in flight");
        self.loading = Some(promise);
        self.tag = StateTag::Loading;
    }

    /// Extract the promise and return to NOT_LOADING; the caller fulfills
    /// it once the lock is released.
    pub(crate) fn finish_loading(&mut self) -> LoadingPromise {
        assert_eq!(self.tag, StateTag::Loading);
        self.tag = StateTag::NotLoading;
        self.loading.take().expect("LOADING state carries a promise")
    }

    pub(crate) fn take_loading_promise(&mut self) -> Option<LoadingPromise> {
        self.loading.take()
    }

    /// The §3.2 table. Violations are process bugs, not recoverable errors.
    pub(crate) fn check_invariants(&self) {
        match self.tag {
            StateTag::NotLoading => {
                assert!(
                    self.non_materialized.is_some(),
                    "NOT_LOADING requires a source-control identity"
                );
                assert!(self.loading.is_none(), "NOT_LOADING must not carry a promise");
            }
            StateTag::Loading => {
                assert!(
                    self.non_materialized.is_some(),
                    "LOADING requires a source-control identity"
                );
                assert!(self.loading.is_some(), "LOADING must carry a promise");
                assert!(
                    self.read_byte_ranges.is_empty(),
                    "LOADING must not track read coverage"
                );
            }
            StateTag::Materialized => {
                assert!(
                    self.non_materialized.is_none(),
                    "MATERIALIZED must not keep a source-control identity"
                );
                assert!(self.loading.is_none(), "MATERIALIZED must not carry a promise");
                assert!(
                    self.interest_handle.is_none(),
                    "MATERIALIZED must not hold blob interest"
                );
                assert!(
                    self.read_byte_ranges.is_empty(),
                    "MATERIALIZED must not track read coverage"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InodeTimestamps;
    use std::time::SystemTime;

    fn metadata() -> InodeMetadata {
        InodeMetadata {
            mode: libc::S_IFREG as u32 | 0o644,
            uid: 0,
            gid: 0,
            timestamps: InodeTimestamps::all(SystemTime::UNIX_EPOCH),
        }
    }

    #[test]
    fn test_initial_state_with_hash() {
        let state = FileInodeState::new(Some(ObjectId::from_bytes(vec![1])), metadata());
        assert_eq!(state.tag(), StateTag::NotLoading);
        assert!(!state.is_materialized());
    }

    #[test]
    fn test_initial_state_without_hash() {
        let state = FileInodeState::new(None, metadata());
        assert_eq!(state.tag(), StateTag::Materialized);
    }

    #[test]
    fn test_materialization_clears_identity() {
        let mut state = FileInodeState::new(Some(ObjectId::from_bytes(vec![1])), metadata());
        state.read_byte_ranges.add(0, 10);
        state.set_materialized();
        assert!(state.non_materialized.is_none());
        assert!(state.read_byte_ranges.is_empty());
        state.check_invariants();
    }

    #[tokio::test]
    async fn test_promise_fans_out_to_all_subscribers() {
        let promise = LoadingPromise::new(ObjectId::from_bytes(vec![1]));
        let sub_a = promise.subscribe();
        let sub_b = promise.subscribe();
        promise.fulfill(Ok(None));
        assert!(matches!(sub_a.wait().await, Ok(None)));
        assert!(matches!(sub_b.wait().await, Ok(None)));
    }

    #[tokio::test]
    async fn test_dropped_promise_interrupts_subscribers() {
        let promise = LoadingPromise::new(ObjectId::from_bytes(vec![1]));
        let sub = promise.subscribe();
        drop(promise);
        assert!(matches!(sub.wait().await, Err(StoreError::LoadInterrupted(_))));
    }

    #[test]
    #[should_panic(expected = "MATERIALIZED must not keep")]
    fn test_invariant_violation_panics() {
        let mut state = FileInodeState::new(Some(ObjectId::from_bytes(vec![1])), metadata());
        // Force an inconsistent record: materialized tag with identity left
        // behind.
        state.tag = StateTag::Materialized;
        state.check_invariants();
    }
}
