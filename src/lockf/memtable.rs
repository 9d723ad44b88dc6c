//! In-memory advisory byte-range lock table.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::lockf::{
    AsyncAcquire, CancelOutcome, CancelToken, FileLock, FileRef,
    GrantCallback, LockError, LockKind, LockOwner, LockPrimitive, LockRange,
    Sysid,
};

use rangemap::RangeMap;

/// A queued asynchronous acquisition.
struct Waiter {
    token: CancelToken,
    file: FileRef,
    lock: FileLock,
    on_grant: GrantCallback,
}

/// Locks held on a single file, per owner. Range maps give POSIX semantics
/// for free: inserting overwrites the owner's overlapping ranges, removing
/// splits them, adjacent ranges of the same type coalesce.
#[derive(Default)]
struct FileLocks {
    held: BTreeMap<LockOwner, RangeMap<u64, LockKind>>,
}

impl FileLocks {
    /// Iterates over every lock of another owner that conflicts with `lock`
    /// within `range`, the half-open form of `lock.range`.
    fn conflicts<'a>(
        &'a self,
        lock: &'a FileLock,
        range: &'a Range<u64>,
    ) -> impl Iterator<Item = FileLock> + 'a {
        let me = lock.owner();
        self.held
            .iter()
            .filter(move |(owner, _)| **owner != me)
            .flat_map(move |(owner, ranges)| {
                ranges
                    .overlapping(range)
                    .filter(move |(_, kind)| kind.conflicts_with(lock.kind))
                    .map(move |(r, kind)| FileLock {
                        range: LockRange::from_bounds(r.start, r.end),
                        pid: owner.pid,
                        sysid: owner.sysid,
                        kind: *kind,
                    })
            })
    }

    fn count(&self) -> usize {
        self.held.values().map(|ranges| ranges.iter().count()).sum()
    }
}

#[derive(Default)]
struct LockTable {
    files: HashMap<FileRef, FileLocks>,
    waiters: VecDeque<Waiter>,
}

impl LockTable {
    fn first_conflict(
        &self,
        file: FileRef,
        lock: &FileLock,
    ) -> Option<FileLock> {
        let range = lock.range.as_range()?;
        self.files
            .get(&file)
            .and_then(|locks| locks.conflicts(lock, &range).next())
    }

    /// Owners currently holding locks that block `lock`.
    fn blockers(&self, file: FileRef, lock: &FileLock) -> Vec<LockOwner> {
        let (Some(locks), Some(range)) =
            (self.files.get(&file), lock.range.as_range())
        else {
            return vec![];
        };
        locks.conflicts(lock, &range).map(|l| l.owner()).collect()
    }

    fn total_locks(&self) -> usize {
        self.files.values().map(|locks| locks.count()).sum()
    }

    fn insert(
        &mut self,
        file: FileRef,
        lock: &FileLock,
        max_locks: Option<usize>,
    ) -> Result<(), LockError> {
        let range = lock.range.as_range().ok_or(LockError::Invalid)?;
        let owner = lock.owner();

        // only a grown range count is charged against the cap
        let mut ranges = self
            .files
            .get(&file)
            .and_then(|locks| locks.held.get(&owner))
            .cloned()
            .unwrap_or_else(RangeMap::new);
        let before = ranges.iter().count();
        ranges.insert(range, lock.kind);
        let after = ranges.iter().count();
        if after > before
            && max_locks
                .is_some_and(|max| self.total_locks() - before + after > max)
        {
            return Err(LockError::NoResources);
        }

        self.files.entry(file).or_default().held.insert(owner, ranges);
        Ok(())
    }

    fn remove(
        &mut self,
        file: FileRef,
        lock: &FileLock,
    ) -> Result<(), LockError> {
        let range = lock.range.as_range().ok_or(LockError::Invalid)?;
        let owner = lock.owner();

        if let Some(locks) = self.files.get_mut(&file) {
            if let Some(ranges) = locks.held.get_mut(&owner) {
                ranges.remove(range);
                if ranges.iter().next().is_none() {
                    locks.held.remove(&owner);
                }
            }
            if locks.held.is_empty() {
                self.files.remove(&file);
            }
        }
        Ok(())
    }

    /// Walks the waits-for graph starting from the owners blocking `lock`;
    /// reaching the requesting owner again means waiting would deadlock.
    fn would_deadlock(&self, file: FileRef, lock: &FileLock) -> bool {
        let me = lock.owner();
        let mut frontier = self.blockers(file, lock);
        let mut visited = HashSet::new();

        while let Some(owner) = frontier.pop() {
            if owner == me {
                return true;
            }
            if !visited.insert(owner) {
                continue;
            }
            let waiting =
                self.waiters.iter().filter(|w| w.lock.owner() == owner);
            for waiter in waiting {
                frontier.extend(self.blockers(waiter.file, &waiter.lock));
            }
        }

        false
    }

    /// Grants every queued waiter that no longer conflicts, in FIFO order.
    /// Returns their callbacks, to be fired after the table is unlocked.
    fn grant_waiters(
        &mut self,
        max_locks: Option<usize>,
    ) -> Vec<GrantCallback> {
        let mut granted = vec![];
        let mut idx = 0;

        while idx < self.waiters.len() {
            let waiter = &self.waiters[idx];
            if self.first_conflict(waiter.file, &waiter.lock).is_some() {
                idx += 1;
                continue;
            }

            let (file, lock) = (waiter.file, waiter.lock);
            match self.insert(file, &lock, max_locks) {
                Ok(()) => {
                    if let Some(waiter) = self.waiters.remove(idx) {
                        granted.push(waiter.on_grant);
                    }
                }
                Err(_) => idx += 1, // stays queued until resources free up
            }
        }

        granted
    }
}

/// In-memory implementation of the lock primitive with POSIX advisory
/// semantics, FIFO wakeup of queued requests and deadlock detection.
pub struct MemLockTable {
    table: Mutex<LockTable>,

    /// Optional cap on the total number of held ranges.
    max_locks: Option<usize>,
}

impl MemLockTable {
    /// Creates an empty lock table without capacity limit.
    pub fn new() -> Self {
        MemLockTable {
            table: Mutex::new(LockTable::default()),
            max_locks: None,
        }
    }

    /// Creates an empty lock table refusing to hold more than `max_locks`
    /// ranges at a time.
    pub fn with_max_locks(max_locks: usize) -> Self {
        MemLockTable {
            table: Mutex::new(LockTable::default()),
            max_locks: Some(max_locks),
        }
    }

    /// Number of queued asynchronous requests.
    pub fn num_waiting(&self) -> usize {
        self.table().waiters.len()
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        // table stays consistent even if a holder panicked midway
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(callbacks: Vec<GrantCallback>) {
        for on_grant in callbacks {
            on_grant();
        }
    }
}

impl Default for MemLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockPrimitive for MemLockTable {
    fn test(
        &self,
        file: FileRef,
        lock: &FileLock,
    ) -> Result<Option<FileLock>, LockError> {
        if lock.range.as_range().is_none() {
            return Err(LockError::Invalid);
        }
        Ok(self.table().first_conflict(file, lock))
    }

    fn acquire_sync(
        &self,
        file: FileRef,
        lock: &FileLock,
    ) -> Result<(), LockError> {
        let mut table = self.table();
        if lock.range.as_range().is_none() {
            return Err(LockError::Invalid);
        }
        if table.first_conflict(file, lock).is_some() {
            return Err(LockError::WouldBlock);
        }
        table.insert(file, lock, self.max_locks)
    }

    fn acquire_async(
        &self,
        file: FileRef,
        lock: &FileLock,
        token: CancelToken,
        on_grant: GrantCallback,
    ) -> Result<AsyncAcquire, LockError> {
        let mut table = self.table();
        if lock.range.as_range().is_none() {
            return Err(LockError::Invalid);
        }

        if table.first_conflict(file, lock).is_none() {
            table.insert(file, lock, self.max_locks)?;
            return Ok(AsyncAcquire::Granted);
        }
        if table.would_deadlock(file, lock) {
            return Err(LockError::Deadlock);
        }

        table.waiters.push_back(Waiter {
            token,
            file,
            lock: *lock,
            on_grant,
        });
        Ok(AsyncAcquire::Pending)
    }

    fn cancel(&self, file: FileRef, token: CancelToken) -> CancelOutcome {
        let mut table = self.table();
        match table
            .waiters
            .iter()
            .position(|w| w.token == token && w.file == file)
        {
            Some(idx) => {
                // dropping the waiter drops its callback uncalled
                table.waiters.remove(idx);
                CancelOutcome::Cancelled
            }
            None => CancelOutcome::AlreadyCompleted,
        }
    }

    fn release(&self, file: FileRef, lock: &FileLock) -> Result<(), LockError> {
        let callbacks = {
            let mut table = self.table();
            table.remove(file, lock)?;
            table.grant_waiters(self.max_locks)
        };
        Self::fire(callbacks);
        Ok(())
    }

    fn release_all(&self, sysid: Sysid) {
        let callbacks = {
            let mut table = self.table();
            for locks in table.files.values_mut() {
                locks.held.retain(|owner, _| owner.sysid != sysid);
            }
            table.files.retain(|_, locks| !locks.held.is_empty());
            table.grant_waiters(self.max_locks)
        };
        Self::fire(callbacks);
    }

    fn count_held(&self, sysid: Sysid) -> usize {
        self.table()
            .files
            .values()
            .flat_map(|locks| locks.held.iter())
            .filter(|(owner, _)| owner.sysid == sysid)
            .map(|(_, ranges)| ranges.iter().count())
            .sum()
    }
}
