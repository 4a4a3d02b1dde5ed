use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hollow_model::{Blob, FetchContext, Hash20, ObjectId};
use hollow_store::{Interest, StoreError};
use tracing::{debug, trace};

use crate::error::InodeError;
use crate::metadata::{
    entry_type_from_mode, DesiredMetadata, EntryType, FileType, InodeMetadata, InodeStat,
    InodeTimestamps,
};
use crate::mount::{FileAccess, FileParent, InodeNumber, Mount, ROOT_INODE};
use crate::state::{FileInodeState, LoadSubscription, LoadingPromise, StateTag};

/// The one extended attribute hollowfs serves: the file's content SHA-1.
pub const XATTR_SHA1: &str = "user.hollowfs.sha1";

/// How long the caller expects to want blob data it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHint {
    NotNeededAgain,
    LikelyNeededAgain,
}

/// Where this inode sits in the directory tree.
///
/// The parent reference is non-owning; the directory tree owns inodes and
/// updates this record on rename and unlink.
struct InodeLocation {
    parent: Weak<dyn FileParent>,
    parent_ino: InodeNumber,
    name: String,
    unlinked: bool,
}

/// A file in the mounted working copy.
///
/// Non-materialized files answer reads from lazily fetched blobs; any
/// mutation migrates the contents into the overlay first. All operations
/// are linearizable per inode in lock-acquisition order; the inode lock is
/// never held across the (single) blob-load suspension point.
pub struct FileInode {
    ino: InodeNumber,
    file_type: FileType,
    mount: Arc<dyn Mount>,
    location: Mutex<InodeLocation>,
    state: Mutex<FileInodeState>,
}

/// Inode state with the lock held.
///
/// The state invariants are re-checked every time the lock is released,
/// wherever that happens.
pub(crate) struct LockedState<'a> {
    guard: MutexGuard<'a, FileInodeState>,
}

impl Deref for LockedState<'_> {
    type Target = FileInodeState;

    fn deref(&self) -> &FileInodeState {
        &self.guard
    }
}

impl DerefMut for LockedState<'_> {
    fn deref_mut(&mut self) -> &mut FileInodeState {
        &mut self.guard
    }
}

impl Drop for LockedState<'_> {
    fn drop(&mut self) {
        self.guard.check_invariants();
    }
}

impl LockedState<'_> {
    /// If a cached copy of the blob is still reachable, take it.
    ///
    /// Tries the inode's own interest handle first, then the mount-wide
    /// cache. A miss means the blob was evicted underneath us, so the read
    /// coverage no longer reflects what the kernel has cached; start over.
    fn get_cached_blob(&mut self, mount: &dyn Mount, interest: Interest) -> Option<Arc<Blob>> {
        assert!(
            !self.is_materialized(),
            "cached blobs only exist for non-materialized files"
        );

        if let Some(blob) = self.interest_handle.get_object() {
            return Some(blob);
        }
        let hash = self
            .non_materialized
            .as_ref()
            .expect("non-materialized state present")
            .hash
            .clone();
        let lookup = mount.blob_cache().get(&hash, interest);
        if let Some(blob) = lookup.blob {
            self.interest_handle = lookup.interest_handle;
            return Some(blob);
        }

        self.interest_handle.reset();
        self.read_byte_ranges.clear();
        None
    }
}

impl FileInode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mount: Arc<dyn Mount>,
        ino: InodeNumber,
        parent: Weak<dyn FileParent>,
        parent_ino: InodeNumber,
        name: impl Into<String>,
        file_type: FileType,
        perms: u32,
        hash: Option<ObjectId>,
    ) -> Arc<FileInode> {
        let template = mount.init_stat();
        let metadata = InodeMetadata {
            mode: file_type.mode_bits() | (perms & 0o7777),
            uid: template.uid,
            gid: template.gid,
            timestamps: InodeTimestamps::all(mount.clock().now()),
        };
        Arc::new(FileInode {
            ino,
            file_type,
            mount,
            location: Mutex::new(InodeLocation {
                parent,
                parent_ino,
                name: name.into(),
                unlinked: false,
            }),
            state: Mutex::new(FileInodeState::new(hash, metadata)),
        })
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// The source-control object id, while not materialized.
    pub fn blob_hash(&self) -> Option<ObjectId> {
        self.lock_state()
            .non_materialized
            .as_ref()
            .map(|nm| nm.hash.clone())
    }

    pub fn is_materialized(&self) -> bool {
        self.lock_state().is_materialized()
    }

    pub fn mode(&self) -> u32 {
        self.lock_state().metadata.mode
    }

    pub fn permissions(&self) -> u32 {
        self.mode() & 0o7777
    }

    /// Called by the directory layer on rename.
    pub fn set_location(
        &self,
        parent: Weak<dyn FileParent>,
        parent_ino: InodeNumber,
        name: impl Into<String>,
    ) {
        let mut location = self.location.lock().unwrap();
        location.parent = parent;
        location.parent_ino = parent_ino;
        location.name = name.into();
    }

    /// Called by the directory layer on unlink.
    pub fn mark_unlinked(&self) {
        self.location.lock().unwrap().unlinked = true;
    }

    // ---------------------------------------------------------------------
    // Kernel-facing operations
    // ---------------------------------------------------------------------

    /// Read up to `size` bytes at `off`, reporting EOF.
    pub async fn read(
        self: &Arc<Self>,
        size: u64,
        off: u64,
        ctx: &FetchContext,
    ) -> Result<(Vec<u8>, bool), InodeError> {
        let this = Arc::clone(self);
        self.run_while_data_loaded(Interest::WantHandle, ctx, None, move |state, blob| {
            if state.is_materialized() {
                let buf = this.mount.overlay().read(this.ino, size, off)?;
                let eof = size != 0 && buf.is_empty();
                state.metadata.timestamps.atime = this.mount.clock().now();
                return Ok((buf, eof));
            }

            let blob = blob.expect("blob present after load while not materialized");
            state
                .read_byte_ranges
                .add(off, off.saturating_add(size));
            if state.read_byte_ranges.covers(0, blob.size()) {
                debug!(
                    ino = this.ino,
                    blob = %blob.id(),
                    "dropping blob interest: fully read"
                );
                state.interest_handle.reset();
                state.read_byte_ranges.clear();
            }

            let contents = blob.contents();
            let len = contents.len() as u64;
            state.metadata.timestamps.atime = this.mount.clock().now();
            if off >= len {
                return Ok((Vec::new(), true));
            }
            let end = off.saturating_add(size).min(len);
            let data = contents[off as usize..end as usize].to_vec();
            Ok((data, end == len))
        })
        .await
    }

    /// Read the entire contents.
    pub async fn read_all(
        self: &Arc<Self>,
        ctx: &FetchContext,
        hint: CacheHint,
    ) -> Result<Vec<u8>, InodeError> {
        let interest = match hint {
            CacheHint::NotNeededAgain => Interest::UnlikelyNeededAgain,
            // Mostly internal readers (ignore files, symlink targets on
            // kernels that don't cache readlink); keep the blob while the
            // inode is loaded.
            CacheHint::LikelyNeededAgain => Interest::WantHandle,
        };
        let this = Arc::clone(self);
        self.run_while_data_loaded(interest, ctx, None, move |state, blob| {
            let result = if state.is_materialized() {
                debug_assert!(blob.is_none());
                this.mount.overlay().read_all(this.ino)?
            } else {
                blob.expect("blob present after load while not materialized")
                    .contents()
                    .to_vec()
            };
            state.metadata.timestamps.atime = this.mount.clock().now();
            Ok(result)
        })
        .await
    }

    /// Symlink target bytes; the contents of a symlink are its target.
    pub async fn readlink(
        self: &Arc<Self>,
        ctx: &FetchContext,
        hint: CacheHint,
    ) -> Result<Vec<u8>, InodeError> {
        if self.file_type != FileType::Symlink {
            return Err(InodeError::NotASymlink);
        }
        self.read_all(ctx, hint).await
    }

    /// Write `data` at `off`, materializing first if needed.
    pub async fn write(
        self: &Arc<Self>,
        data: &[u8],
        off: u64,
        ctx: &FetchContext,
    ) -> Result<u64, InodeError> {
        let this = Arc::clone(self);
        // The continuation may run after a suspension; it needs its own copy.
        let data = data.to_vec();
        let written = self
            .run_while_materialized(
                None,
                move |state| {
                    let n = this.mount.overlay().write(this.ino, &data, off)?;
                    let now = this.mount.clock().now();
                    state.metadata.timestamps.mtime = now;
                    state.metadata.timestamps.ctime = now;
                    Ok(n)
                },
                ctx,
            )
            .await?;
        self.mount.update_journal(self.ino);
        Ok(written)
    }

    /// Update metadata, truncating or resizing as requested.
    ///
    /// Truncation to zero never fetches the blob. Entries under the
    /// administrative directory are immutable.
    pub async fn setattr(
        self: &Arc<Self>,
        desired: DesiredMetadata,
        ctx: &FetchContext,
    ) -> Result<InodeStat, InodeError> {
        {
            let location = self.location.lock().unwrap();
            if !location.unlinked && location.parent_ino == self.mount.control_dir_ino() {
                return Err(InodeError::PermissionDenied);
            }
        }

        let this = Arc::clone(self);
        let desired_for_apply = desired.clone();
        let apply = move |state: &mut LockedState<'_>| -> Result<InodeStat, InodeError> {
            debug_assert!(
                state.is_materialized(),
                "setattr continuation requires an overlay file"
            );
            if let Some(size) = desired_for_apply.size {
                this.mount.overlay().truncate(this.ino, size)?;
            }
            let now = this.mount.clock().now();
            state.metadata.apply_desired(&desired_for_apply, now);

            // Always report the real overlay size: a truncate just changed
            // it, and any stale size in the request must not leak through.
            let size = this.mount.overlay().file_size(this.ino)?;
            let mut stat = this.mount.init_stat();
            stat.ino = this.ino;
            state.metadata.apply_to_stat(&mut stat);
            stat.size = size;
            stat.nlink = 1;
            stat.update_block_count();
            Ok(stat)
        };

        let result = if desired.is_truncate_to_zero() {
            // The contents are being discarded wholesale; skip the fetch.
            let state = self.lock_state();
            self.truncate_and_run(state, apply)
        } else {
            self.run_while_materialized(None, apply, ctx).await
        }?;
        self.mount.update_journal(self.ino);
        Ok(result)
    }

    /// Answer a stat request without materializing.
    ///
    /// Materialized files report the overlay size; otherwise the memoized
    /// blob size is used, fetched from the object store at most once.
    pub async fn stat(self: &Arc<Self>, ctx: &FetchContext) -> Result<InodeStat, InodeError> {
        let mut stat = self.mount.init_stat();
        stat.ino = self.ino;
        stat.nlink = 1; // hard links are rejected at the protocol boundary

        let hash = {
            let state = self.lock_state();
            state.metadata.apply_to_stat(&mut stat);

            if state.is_materialized() {
                stat.size = self.mount.overlay().file_size(self.ino)?;
                stat.update_block_count();
                return Ok(stat);
            }
            let non_materialized = state
                .non_materialized
                .as_ref()
                .expect("non-materialized state present");
            if let Some(size) = non_materialized.size {
                stat.size = size;
                stat.update_block_count();
                return Ok(stat);
            }
            non_materialized.hash.clone()
        };

        // Size unknown: ask the object store with the lock released, then
        // memoize unless a materialization won the race meanwhile.
        let size = self.mount.object_store().get_blob_size(&hash, ctx).await?;
        {
            let mut state = self.lock_state();
            if let Some(non_materialized) = state.non_materialized.as_mut() {
                non_materialized.size = Some(size);
            }
        }
        stat.size = size;
        stat.update_block_count();
        Ok(stat)
    }

    /// SHA-1 of the current contents: from the overlay when materialized,
    /// from object-store metadata otherwise.
    pub async fn sha1(self: &Arc<Self>, ctx: &FetchContext) -> Result<Hash20, InodeError> {
        let hash = {
            let state = self.lock_state();
            self.log_access(ctx);
            if state.is_materialized() {
                return Ok(self.mount.overlay().sha1(self.ino)?);
            }
            state
                .non_materialized
                .as_ref()
                .expect("non-materialized state present")
                .hash
                .clone()
        };
        Ok(self.mount.object_store().get_blob_sha1(&hash, ctx).await?)
    }

    pub fn listxattr(&self) -> Vec<String> {
        // Advertising the synthetic attribute made copy tools try to
        // preserve it, so the listing stays empty; getxattr still answers.
        Vec::new()
    }

    pub async fn getxattr(
        self: &Arc<Self>,
        name: &str,
        ctx: &FetchContext,
    ) -> Result<String, InodeError> {
        if name != XATTR_SHA1 {
            return Err(InodeError::NoAttribute);
        }
        Ok(self.sha1(ctx).await?.to_hex())
    }

    /// Flush overlay contents. A no-op for non-materialized files: their
    /// authoritative bytes already live in the object store.
    pub fn fsync(&self, datasync: bool) -> Result<(), InodeError> {
        let state = self.lock_state();
        if state.is_materialized() {
            self.mount.overlay().fsync(self.ino, datasync)?;
        }
        Ok(())
    }

    /// Reserve space, materializing first if needed.
    pub async fn fallocate(
        self: &Arc<Self>,
        off: u64,
        len: u64,
        ctx: &FetchContext,
    ) -> Result<(), InodeError> {
        let this = Arc::clone(self);
        self.run_while_materialized(
            None,
            move |_state| {
                this.mount.overlay().fallocate(this.ino, off, len)?;
                Ok(())
            },
            ctx,
        )
        .await
    }

    // ---------------------------------------------------------------------
    // Content identity comparison
    // ---------------------------------------------------------------------

    /// Compare against a tree entry by object id.
    pub async fn is_same_as_id(
        self: &Arc<Self>,
        id: &ObjectId,
        entry_type: EntryType,
        ctx: &FetchContext,
    ) -> bool {
        if let Some(answer) = self.is_same_as_fast(id, entry_type) {
            return answer;
        }
        let (mine, theirs) = tokio::join!(
            self.sha1(ctx),
            self.mount.object_store().get_blob_sha1(id, ctx)
        );
        match (mine, theirs) {
            (Ok(a), Ok(b)) => a == b,
            (Err(err), _) => {
                debug!(error = %err, "assuming changed");
                false
            }
            (_, Err(err)) => {
                debug!(error = %err, "assuming changed");
                false
            }
        }
    }

    /// Compare against a tree entry whose SHA-1 is already known.
    pub async fn is_same_as_id_with_sha1(
        self: &Arc<Self>,
        id: &ObjectId,
        expected_sha1: Hash20,
        entry_type: EntryType,
        ctx: &FetchContext,
    ) -> bool {
        if let Some(answer) = self.is_same_as_fast(id, entry_type) {
            return answer;
        }
        self.is_same_as_slow(expected_sha1, ctx).await
    }

    /// Compare against an already-loaded blob.
    pub async fn is_same_as_blob(
        self: &Arc<Self>,
        blob: &Blob,
        entry_type: EntryType,
        ctx: &FetchContext,
    ) -> bool {
        if let Some(answer) = self.is_same_as_fast(blob.id(), entry_type) {
            return answer;
        }
        self.is_same_as_slow(blob.content_sha1(), ctx).await
    }

    fn is_same_as_fast(&self, id: &ObjectId, entry_type: EntryType) -> Option<bool> {
        let state = self.lock_state();
        if entry_type != entry_type_from_mode(state.metadata.mode) {
            return Some(false);
        }
        if let Some(non_materialized) = &state.non_materialized {
            // Object ids bake in history metadata, so distinct ids can name
            // identical contents; only a match is conclusive.
            if &non_materialized.hash == id {
                return Some(true);
            }
        }
        None
    }

    async fn is_same_as_slow(self: &Arc<Self>, expected_sha1: Hash20, ctx: &FetchContext) -> bool {
        match self.sha1(ctx).await {
            Ok(actual) => actual == expected_sha1,
            Err(err) => {
                debug!(error = %err, "assuming changed");
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Continuation runners
    // ---------------------------------------------------------------------

    fn lock_state(&self) -> LockedState<'_> {
        LockedState {
            guard: self.state.lock().unwrap(),
        }
    }

    /// Run `f` with the state locked and, if not materialized, with the blob
    /// in hand.
    ///
    /// A trampoline: each pass locks the state and either runs `f` or
    /// subscribes to the in-flight load and suspends with the lock released.
    /// After a resume the state is NOT_LOADING or MATERIALIZED again (the
    /// sentinel outcome means "re-examine"), so the loop settles on the next
    /// pass.
    async fn run_while_data_loaded<R, F>(
        self: &Arc<Self>,
        interest: Interest,
        ctx: &FetchContext,
        mut blob: Option<Arc<Blob>>,
        f: F,
    ) -> Result<R, InodeError>
    where
        F: FnOnce(&mut LockedState<'_>, Option<Arc<Blob>>) -> Result<R, InodeError>,
    {
        let mut f = Some(f);
        loop {
            let subscription = {
                let mut state = self.lock_state();
                match state.tag() {
                    StateTag::Materialized => {
                        self.log_access(ctx);
                        let f = f.take().expect("continuation runs once");
                        return f(&mut state, None);
                    }
                    StateTag::NotLoading => {
                        let cached = blob
                            .take()
                            .or_else(|| state.get_cached_blob(self.mount.as_ref(), interest));
                        match cached {
                            Some(cached) => {
                                self.log_access(ctx);
                                let f = f.take().expect("continuation runs once");
                                return f(&mut state, Some(cached));
                            }
                            None => self.start_loading_data(&mut state, interest, ctx),
                        }
                    }
                    StateTag::Loading => state
                        .loading
                        .as_ref()
                        .expect("LOADING state carries a promise")
                        .subscribe(),
                }
            };
            blob = subscription.wait().await?;
        }
    }

    /// Run `f` with the state locked and the file materialized.
    ///
    /// On a fresh materialization the parent directory is notified after `f`
    /// returns and the state lock is dropped — on the error path too. A
    /// crash between the two leaves at most one recent edit looking
    /// non-materialized after restart.
    async fn run_while_materialized<R, F>(
        self: &Arc<Self>,
        mut blob: Option<Arc<Blob>>,
        f: F,
        ctx: &FetchContext,
    ) -> Result<R, InodeError>
    where
        F: FnOnce(&mut LockedState<'_>) -> Result<R, InodeError>,
    {
        let mut f = Some(f);
        loop {
            let subscription = {
                let mut state = self.lock_state();
                match state.tag() {
                    StateTag::Materialized => {
                        self.log_access(ctx);
                        let f = f.take().expect("continuation runs once");
                        return f(&mut state);
                    }
                    StateTag::NotLoading => {
                        // The blob goes straight into the overlay; there is
                        // no point keeping it cached beyond that.
                        let cached = blob.take().or_else(|| {
                            state.get_cached_blob(
                                self.mount.as_ref(),
                                Interest::UnlikelyNeededAgain,
                            )
                        });
                        match cached {
                            Some(cached) => {
                                self.materialize_now(&mut state, &cached)?;
                                self.log_access(ctx);
                                let f = f.take().expect("continuation runs once");
                                let result = f(&mut state);
                                drop(state);
                                self.materialize_in_parent();
                                return result;
                            }
                            None => self.start_loading_data(
                                &mut state,
                                Interest::UnlikelyNeededAgain,
                                ctx,
                            ),
                        }
                    }
                    StateTag::Loading => state
                        .loading
                        .as_ref()
                        .expect("LOADING state carries a promise")
                        .subscribe(),
                }
            };
            blob = subscription.wait().await?;
        }
    }

    /// Fast path for operations that discard the contents: materialize as an
    /// empty overlay file without ever fetching the blob, then run `f`.
    ///
    /// If a load is in flight its promise is fulfilled with the sentinel —
    /// after the lock is released — so existing subscribers unblock and
    /// observe the materialized state when they re-examine it.
    fn truncate_and_run<R, F>(
        self: &Arc<Self>,
        mut state: LockedState<'_>,
        f: F,
    ) -> Result<R, InodeError>
    where
        F: FnOnce(&mut LockedState<'_>) -> Result<R, InodeError>,
    {
        match state.tag() {
            StateTag::NotLoading | StateTag::Loading => {
                self.materialize_and_truncate(&mut state)?;
                // Extracted only after the truncation committed; an error
                // above leaves the pending load untouched.
                let promise = state.take_loading_promise();
                let result = f(&mut state);
                drop(state);
                self.materialize_in_parent();
                if let Some(promise) = promise {
                    promise.fulfill(Ok(None));
                }
                result
            }
            StateTag::Materialized => {
                self.truncate_in_overlay(&mut state)?;
                f(&mut state)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Loading
    // ---------------------------------------------------------------------

    /// Transition NOT_LOADING → LOADING and kick off the blob fetch on its
    /// own task. Returns a subscription to the new loading promise.
    ///
    /// The fetch task completes the promise via [`Self::complete_load`];
    /// callers (and anyone else who latches on) resume from the
    /// subscription.
    fn start_loading_data(
        self: &Arc<Self>,
        state: &mut LockedState<'_>,
        interest: Interest,
        ctx: &FetchContext,
    ) -> LoadSubscription {
        debug_assert_eq!(state.tag(), StateTag::NotLoading);
        let hash = state
            .non_materialized
            .as_ref()
            .expect("non-materialized state present")
            .hash
            .clone();

        let promise = LoadingPromise::new(hash.clone());
        let subscription = promise.subscribe();
        state.set_loading(promise);

        trace!(ino = self.ino, blob = %hash, "starting blob load");
        let this = Arc::clone(self);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let result = this
                .mount
                .blob_access()
                .get_blob(&hash, &ctx, interest)
                .await;
            this.complete_load(result);
        });
        subscription
    }

    /// The load completion protocol. Runs with no lock held on entry; the
    /// promise is always fulfilled with the lock released.
    fn complete_load(
        &self,
        result: Result<(Arc<Blob>, hollow_store::BlobInterestHandle), StoreError>,
    ) {
        let mut state = self.lock_state();
        match state.tag() {
            StateTag::NotLoading => {
                // No way to finish a load the state machine doesn't know
                // about; subscribers would be stranded. Unrecoverable.
                panic!("blob load finished while the inode was not loading");
            }
            StateTag::Loading => {
                let promise = state.finish_loading();
                match result {
                    Ok((blob, handle)) => {
                        state.interest_handle = handle;
                        drop(state);
                        promise.fulfill(Ok(Some(blob)));
                    }
                    Err(err) => {
                        drop(state);
                        promise.fulfill(Err(err));
                    }
                }
            }
            StateTag::Materialized => {
                // Lost the race with a truncation, which already fulfilled
                // the promise with the sentinel. Nothing to do.
                debug_assert!(state.loading.is_none());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Materialization
    // ---------------------------------------------------------------------

    /// Copy the blob into the overlay and flip to MATERIALIZED.
    ///
    /// The overlay write happens first: if it fails, no state has changed.
    fn materialize_now(
        &self,
        state: &mut LockedState<'_>,
        blob: &Arc<Blob>,
    ) -> Result<(), InodeError> {
        debug_assert_eq!(state.tag(), StateTag::NotLoading);

        // Opportunistic only: a SHA-1 already at hand is recorded with the
        // overlay file, but materialization never waits on a metadata fetch.
        let sha1 = self
            .mount
            .object_store()
            .blob_sha1_if_ready(
                &state
                    .non_materialized
                    .as_ref()
                    .expect("non-materialized state present")
                    .hash,
            );

        self.mount.overlay().create_file(self.ino, blob, sha1)?;
        state.set_materialized();
        Ok(())
    }

    /// Create an empty overlay file and flip to MATERIALIZED.
    fn materialize_and_truncate(&self, state: &mut LockedState<'_>) -> Result<(), InodeError> {
        debug_assert_ne!(state.tag(), StateTag::Materialized);
        self.mount.overlay().create_empty_file(self.ino)?;
        state.set_materialized();
        Ok(())
    }

    /// Zero an existing overlay file.
    fn truncate_in_overlay(&self, state: &mut LockedState<'_>) -> Result<(), InodeError> {
        debug_assert_eq!(state.tag(), StateTag::Materialized);
        debug_assert!(state.non_materialized.is_none());
        self.mount.overlay().truncate(self.ino, 0)?;
        Ok(())
    }

    /// Tell the parent directory this child is now materialized.
    ///
    /// Takes the mount rename lock, which must never be acquired while the
    /// inode state lock is held — directory operations descend the other
    /// way. Best-effort: an unlinked or already-reclaimed parent is fine.
    fn materialize_in_parent(&self) {
        let rename_lock = self.mount.acquire_rename_lock();
        let (parent, name) = {
            let location = self.location.lock().unwrap();
            if location.unlinked {
                return;
            }
            match location.parent.upgrade() {
                Some(parent) => (parent, location.name.clone()),
                None => return,
            }
        };
        parent.child_materialized(&rename_lock, &name);
    }

    fn log_access(&self, ctx: &FetchContext) {
        if self.ino == ROOT_INODE {
            return;
        }
        self.mount.log_file_access(FileAccess {
            ino: self.ino,
            cause: ctx.cause(),
            detail: ctx.cause_detail().map(String::from),
        });
    }
}

impl std::fmt::Debug for FileInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileInode")
            .field("ino", &self.ino)
            .field("file_type", &self.file_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::OverlayFileAccess;
    use crate::testing::TestMount;
    use hollow_model::HASH20_RAW_SIZE;

    fn object_id(byte: u8) -> ObjectId {
        let mut bytes = [0u8; HASH20_RAW_SIZE];
        bytes[HASH20_RAW_SIZE - 1] = byte;
        ObjectId::from_bytes(bytes.to_vec())
    }

    #[tokio::test]
    async fn test_read_whole_blob_releases_interest() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        let (inode, _parent) = mount.new_regular_file(2, Some(id));

        let (data, eof) = inode.read(4096, 0, &FetchContext::fs()).await.unwrap();
        assert_eq!(data, b"hello");
        assert!(eof);

        let state = inode.lock_state();
        assert_eq!(state.tag(), StateTag::NotLoading);
        // The read covered [0, 5) == the whole blob, so the interest was
        // dropped and the coverage reset along with it.
        assert!(state.interest_handle.is_none());
        assert!(state.read_byte_ranges.is_empty());
    }

    #[tokio::test]
    async fn test_partial_read_keeps_interest_and_coverage() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount
            .fake_store()
            .add_blob(id.clone(), vec![0xAB; 8192]);
        let (inode, _parent) = mount.new_regular_file(2, Some(id));

        let (data, eof) = inode.read(100, 0, &FetchContext::fs()).await.unwrap();
        assert_eq!(data.len(), 100);
        assert!(!eof);

        let state = inode.lock_state();
        assert_eq!(state.tag(), StateTag::NotLoading);
        assert!(!state.interest_handle.is_none());
        assert!(state.read_byte_ranges.covers(0, 100));
        assert!(!state.read_byte_ranges.covers(0, 8192));
    }

    #[tokio::test]
    async fn test_truncate_to_zero_materializes_without_fetch() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        let (inode, parent) = mount.new_regular_file(2, Some(id.clone()));

        let stat = inode
            .setattr(DesiredMetadata::truncate(0), &FetchContext::fs())
            .await
            .unwrap();
        assert_eq!(stat.size, 0);

        assert!(inode.is_materialized());
        assert_eq!(mount.memory_overlay().read_all(2).unwrap(), b"");
        assert_eq!(mount.journal_entries(), vec![2]);
        assert_eq!(parent.materialized_children().len(), 1);
        // The blob was never needed.
        assert_eq!(mount.fake_store().blob_access_count(&id), 0);
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_one_fetch() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        mount.fake_store().hold_fetches();
        let (inode, _parent) = mount.new_regular_file(2, Some(id.clone()));

        let a = {
            let inode = Arc::clone(&inode);
            tokio::spawn(async move { inode.read(4096, 0, &FetchContext::fs()).await })
        };
        let b = {
            let inode = Arc::clone(&inode);
            tokio::spawn(async move { inode.read(4096, 0, &FetchContext::fs()).await })
        };

        // Both requests reach the loading state before the fetch resolves.
        tokio::task::yield_now().await;
        mount.fake_store().release_fetches();

        let (data_a, eof_a) = a.await.unwrap().unwrap();
        let (data_b, eof_b) = b.await.unwrap().unwrap();
        assert_eq!(data_a, b"hello");
        assert_eq!(data_b, b"hello");
        assert!(eof_a && eof_b);
        assert_eq!(mount.fake_store().blob_access_count(&id), 1);
    }

    #[tokio::test]
    async fn test_truncate_during_load_unblocks_reader_with_sentinel() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        mount.fake_store().hold_fetches();
        let (inode, _parent) = mount.new_regular_file(2, Some(id));

        let read_task = {
            let inode = Arc::clone(&inode);
            tokio::spawn(async move { inode.read(4096, 0, &FetchContext::fs()).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(inode.lock_state().tag(), StateTag::Loading);

        // Truncation wins the race: the pending reader observes the
        // sentinel, retries, and sees an empty materialized file.
        inode
            .setattr(DesiredMetadata::truncate(0), &FetchContext::fs())
            .await
            .unwrap();

        let (data, eof) = read_task.await.unwrap().unwrap();
        assert!(data.is_empty());
        assert!(eof);

        // Let the stale fetch finish; its completion must tolerate the
        // materialized state.
        mount.fake_store().release_fetches();
        tokio::task::yield_now().await;
        assert!(inode.is_materialized());
    }

    #[tokio::test]
    async fn test_fetch_error_fans_out_and_is_retryable() {
        let mount = TestMount::new();
        let id = object_id(9); // never added to the store
        mount.fake_store().hold_fetches();
        let (inode, _parent) = mount.new_regular_file(2, Some(id.clone()));

        let a = {
            let inode = Arc::clone(&inode);
            tokio::spawn(async move { inode.read(10, 0, &FetchContext::fs()).await })
        };
        let b = {
            let inode = Arc::clone(&inode);
            tokio::spawn(async move { inode.read(10, 0, &FetchContext::fs()).await })
        };
        tokio::task::yield_now().await;
        mount.fake_store().release_fetches();

        assert!(a.await.unwrap().is_err());
        assert!(b.await.unwrap().is_err());
        assert_eq!(inode.lock_state().tag(), StateTag::NotLoading);

        // The blob appears later; the next caller just retries.
        mount.fake_store().add_blob(id.clone(), b"late".to_vec());
        let (data, eof) = inode.read(10, 0, &FetchContext::fs()).await.unwrap();
        assert_eq!(data, b"late");
        assert!(eof);
    }

    #[tokio::test]
    async fn test_read_past_eof_returns_empty() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        let (inode, _parent) = mount.new_regular_file(2, Some(id));

        let (data, eof) = inode.read(4096, 100, &FetchContext::fs()).await.unwrap();
        assert!(data.is_empty());
        assert!(eof);
    }

    #[tokio::test]
    async fn test_read_spanning_eof_returns_tail() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        let (inode, _parent) = mount.new_regular_file(2, Some(id));

        let (data, eof) = inode.read(100, 3, &FetchContext::fs()).await.unwrap();
        assert_eq!(data, b"lo");
        assert!(eof);
    }

    #[tokio::test]
    async fn test_write_materializes_and_touches_journal() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        let (inode, parent) = mount.new_regular_file(2, Some(id));

        let written = inode
            .write(b"HELLO world", 0, &FetchContext::fs())
            .await
            .unwrap();
        assert_eq!(written, 11);
        assert!(inode.is_materialized());
        assert!(inode.blob_hash().is_none());
        assert_eq!(parent.materialized_children(), vec!["file2".to_string()]);
        assert_eq!(mount.journal_entries(), vec![2]);

        let (data, eof) = inode.read(4096, 0, &FetchContext::fs()).await.unwrap();
        assert_eq!(data, b"HELLO world");
        // Materialized files only report EOF once a read comes back empty.
        assert!(!eof);
    }

    #[tokio::test]
    async fn test_stat_memoizes_unknown_size() {
        let mount = TestMount::new();
        let id = object_id(1);
        mount.fake_store().add_blob(id.clone(), b"hello".to_vec());
        let (inode, _parent) = mount.new_regular_file(2, Some(id.clone()));

        let stat = inode.stat(&FetchContext::fs()).await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(stat.blocks, 1);
        assert_eq!(stat.nlink, 1);
        assert_eq!(mount.fake_store().size_access_count(&id), 1);

        // Memoized: no refetch.
        let stat = inode.stat(&FetchContext::fs()).await.unwrap();
        assert_eq!(stat.size, 5);
        assert_eq!(mount.fake_store().size_access_count(&id), 1);
    }
}
