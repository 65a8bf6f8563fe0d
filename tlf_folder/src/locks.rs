//! Leveled locks.
//!
//! Every engine lock has a [`LockLevel`], and one flow of calls threads a
//! single [`LockState`] through everything it does. Acquiring a lock at a
//! level that is not strictly above every level the flow already holds
//! panics, so an ordering bug shows up on the first run that hits it
//! rather than as an occasional deadlock.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{MutexGuard, RwLockReadGuard, RwLockWriteGuard};

/// Acquisition order, lowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    /// Serializes every operation that produces a new revision.
    MdWriter = 1,
    /// Guards the head revision and branch state.
    Head = 2,
    /// Guards staged directory and file blocks.
    Blocks = 3,
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockLevel::MdWriter => "md-writer",
            LockLevel::Head => "head",
            LockLevel::Blocks => "blocks",
        };
        f.write_str(name)
    }
}

/// The levels held by one flow of calls.
#[derive(Debug, Default)]
pub struct LockState {
    held: Mutex<Vec<LockLevel>>,
}

impl LockState {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self, level: LockLevel) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(top) = held.iter().max()
            && *top >= level
        {
            let top = *top;
            drop(held);
            panic!("lock order violation: acquiring {level} while holding {top}");
        }
        held.push(level);
    }

    fn release(&self, level: LockLevel) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pos) = held.iter().rposition(|l| *l == level) {
            held.remove(pos);
        }
    }

    pub fn holds(&self, level: LockLevel) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&level)
    }

    /// Panics unless this flow holds `level`.
    pub fn assert_held(&self, level: LockLevel) {
        assert!(self.holds(level), "{level} lock must be held");
    }
}

/// Records a level as held for as long as it lives, including while the
/// acquisition itself is still waiting.
struct LevelToken<'a> {
    state: &'a LockState,
    level: LockLevel,
}

impl<'a> LevelToken<'a> {
    fn new(state: &'a LockState, level: LockLevel) -> Self {
        state.acquire(level);
        Self { state, level }
    }
}

impl Drop for LevelToken<'_> {
    fn drop(&mut self) {
        self.state.release(self.level);
    }
}

#[derive(Debug)]
pub struct LeveledMutex<T> {
    level: LockLevel,
    inner: tokio::sync::Mutex<T>,
}

pub struct LeveledMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _token: LevelToken<'a>,
}

impl<T> LeveledMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: tokio::sync::Mutex::new(value),
        }
    }

    pub async fn lock<'a>(&'a self, state: &'a LockState) -> LeveledMutexGuard<'a, T> {
        let token = LevelToken::new(state, self.level);
        let guard = self.inner.lock().await;
        LeveledMutexGuard {
            guard,
            _token: token,
        }
    }
}

impl<T> Deref for LeveledMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[derive(Debug)]
pub struct LeveledRwLock<T> {
    level: LockLevel,
    inner: tokio::sync::RwLock<T>,
}

pub struct LeveledReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    _token: LevelToken<'a>,
}

pub struct LeveledWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _token: LevelToken<'a>,
}

impl<T> LeveledRwLock<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: tokio::sync::RwLock::new(value),
        }
    }

    pub async fn read<'a>(&'a self, state: &'a LockState) -> LeveledReadGuard<'a, T> {
        let token = LevelToken::new(state, self.level);
        let guard = self.inner.read().await;
        LeveledReadGuard {
            guard,
            _token: token,
        }
    }

    pub async fn write<'a>(&'a self, state: &'a LockState) -> LeveledWriteGuard<'a, T> {
        let token = LevelToken::new(state, self.level);
        let guard = self.inner.write().await;
        LeveledWriteGuard {
            guard,
            _token: token,
        }
    }

    /// Runs `f` with the read lock in `guard` released, then takes it
    /// again. When `guard` is empty the flow does not hold the lock and
    /// `f` simply runs.
    pub async fn do_unlocked_if_possible<'a, F, R>(
        &'a self,
        state: &'a LockState,
        guard: &mut Option<LeveledReadGuard<'a, T>>,
        f: F,
    ) -> R
    where
        F: Future<Output = R>,
    {
        let held = guard.take().is_some();
        let result = f.await;
        if held {
            *guard = Some(self.read(state).await);
        }
        result
    }
}

impl<T> Deref for LeveledReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Deref for LeveledWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for LeveledWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_order_acquisition_is_tracked() {
        let writer = LeveledMutex::new(LockLevel::MdWriter, ());
        let head = LeveledRwLock::new(LockLevel::Head, 1u32);
        let state = LockState::new();

        let w = writer.lock(&state).await;
        {
            let h = head.read(&state).await;
            assert_eq!(*h, 1);
            assert!(state.holds(LockLevel::Head));
        }
        assert!(!state.holds(LockLevel::Head));
        state.assert_held(LockLevel::MdWriter);
        drop(w);
        assert!(!state.holds(LockLevel::MdWriter));
    }

    #[tokio::test]
    #[should_panic(expected = "lock order violation")]
    async fn out_of_order_acquisition_panics() {
        let writer = LeveledMutex::new(LockLevel::MdWriter, ());
        let blocks = LeveledRwLock::new(LockLevel::Blocks, ());
        let state = LockState::new();

        let _b = blocks.write(&state).await;
        let _w = writer.lock(&state).await;
    }

    #[tokio::test]
    #[should_panic(expected = "lock order violation")]
    async fn reacquiring_the_same_level_panics() {
        let head = LeveledRwLock::new(LockLevel::Head, ());
        let state = LockState::new();

        let _a = head.read(&state).await;
        let _b = head.read(&state).await;
    }

    #[tokio::test]
    async fn unlocked_section_releases_and_reacquires() {
        let blocks = LeveledRwLock::new(LockLevel::Blocks, 7u8);
        let state = LockState::new();
        let mut guard = Some(blocks.read(&state).await);

        let seen = blocks
            .do_unlocked_if_possible(&state, &mut guard, async {
                // Another flow can write while this one waits.
                let other = LockState::new();
                *blocks.write(&other).await = 9;
                state.holds(LockLevel::Blocks)
            })
            .await;
        assert!(!seen);
        assert_eq!(guard.as_deref().copied(), Some(9));
        assert!(state.holds(LockLevel::Blocks));

        let mut none = None;
        let value = blocks
            .do_unlocked_if_possible(&state, &mut none, async { 3 })
            .await;
        assert_eq!(value, 3);
        assert!(none.is_none());
    }
}
