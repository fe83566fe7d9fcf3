//! Semaphore-backed sync channel for roles running as tasks in one process.
//!
//! Each (state, role) pair is a binary semaphore. Posting makes one permit available
//! (posting twice does not stack), a consuming wait takes the permit. Semaphore sets
//! live in a process-wide registry keyed by namespace, so two handles opened with the
//! same name talk to each other the way two processes would through a named
//! semaphore.

use super::{poll_until, Role, SyncChannel, SyncState, SYNC_TICK};
use crate::error::AppResult;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<SemaphoreSet>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// One binary semaphore per signalling state and role. Idle has none; it is the
/// absence of any permit.
#[derive(Debug)]
struct SemaphoreSet {
    semaphores: [[Semaphore; 3]; 2],
}

impl SemaphoreSet {
    fn new() -> Self {
        Self {
            semaphores: std::array::from_fn(|_| std::array::from_fn(|_| Semaphore::new(0))),
        }
    }

    fn get(&self, state: SyncState, role: Role) -> Option<&Semaphore> {
        let index = (state as usize).checked_sub(1)?;
        self.semaphores[role.index()].get(index)
    }

    fn drain(&self, role: Role) {
        for semaphore in &self.semaphores[role.index()] {
            while let Ok(permit) = semaphore.try_acquire() {
                permit.forget();
            }
        }
    }
}

/// In-process [`SyncChannel`] over named binary semaphores.
#[derive(Debug, Clone)]
pub struct SemaphoreChannel {
    namespace: String,
    set: Arc<SemaphoreSet>,
    tick: Duration,
}

impl SemaphoreChannel {
    /// Open (creating if needed) the semaphore set named `namespace`.
    pub fn open(namespace: &str) -> Self {
        let set = REGISTRY
            .lock()
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(SemaphoreSet::new()))
            .clone();
        debug!(namespace, "semaphore channel attached");
        Self {
            namespace: namespace.to_string(),
            set,
            tick: SYNC_TICK,
        }
    }

    /// Registry name of this channel.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn is_idle(&self, role: Role) -> bool {
        self.set.semaphores[role.index()]
            .iter()
            .all(|s| s.available_permits() == 0)
    }
}

#[async_trait]
impl SyncChannel for SemaphoreChannel {
    fn post(&self, state: SyncState, role: Role) {
        debug!(namespace = %self.namespace, %state, %role, "post");
        match self.set.get(state, role) {
            Some(semaphore) => {
                if semaphore.available_permits() == 0 {
                    semaphore.add_permits(1);
                }
            }
            None => self.set.drain(role),
        }
    }

    fn peek(&self, role: Role) -> SyncState {
        SyncState::ALL
            .into_iter()
            .skip(1)
            .find(|&state| {
                self.set
                    .get(state, role)
                    .is_some_and(|s| s.available_permits() > 0)
            })
            .unwrap_or(SyncState::Idle)
    }

    async fn wait(&self, state: SyncState, role: Role, timeout: Duration, reset: bool) -> bool {
        let seen = match self.set.get(state, role) {
            None => poll_until(timeout, self.tick, || self.is_idle(role)).await,
            Some(semaphore) => {
                poll_until(timeout, self.tick, || {
                    if !reset {
                        return semaphore.available_permits() > 0;
                    }
                    match semaphore.try_acquire() {
                        Ok(permit) => {
                            permit.forget();
                            true
                        }
                        Err(_) => false,
                    }
                })
                .await
            }
        };
        if !seen {
            warn!(namespace = %self.namespace, %state, %role, ?timeout, "wait timed out");
        }
        seen
    }

    fn unlink(&self) -> AppResult<()> {
        REGISTRY.lock().remove(&self.namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn handles_with_the_same_name_share_state() {
        let a = SemaphoreChannel::open("sem-test-share");
        let b = SemaphoreChannel::open("sem-test-share");
        a.post(SyncState::Trigger, Role::Slave);
        a.post(SyncState::Trigger, Role::Slave);
        assert_eq!(b.peek(Role::Slave), SyncState::Trigger);

        let t = Duration::from_millis(5);
        assert!(b.wait(SyncState::Trigger, Role::Slave, t, true).await);
        // binary: the second post did not stack
        assert!(!b.wait(SyncState::Trigger, Role::Slave, t, true).await);
        a.unlink().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_without_post_times_out_at_the_boundary() {
        let channel = SemaphoreChannel::open("sem-test-timeout");
        let start = Instant::now();
        let timeout = Duration::from_millis(300);
        assert!(!channel.wait(SyncState::Stable, Role::Master, timeout, true).await);
        assert_eq!(start.elapsed(), timeout);
        channel.unlink().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_means_every_signal_was_consumed() {
        let channel = SemaphoreChannel::open("sem-test-idle");
        let t = Duration::from_millis(5);
        channel.post(SyncState::Stable, Role::Master);
        assert!(!channel.wait(SyncState::Idle, Role::Master, t, false).await);
        assert!(channel.wait(SyncState::Stable, Role::Master, t, false).await);
        assert_eq!(channel.peek(Role::Master), SyncState::Stable);

        channel.post(SyncState::Idle, Role::Master);
        assert!(channel.wait(SyncState::Idle, Role::Master, t, false).await);
        assert!(channel.hand_over(SyncState::RotateStart, Role::Master, t).await);
        assert_eq!(channel.peek(Role::Master), SyncState::RotateStart);
        channel.unlink().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unlinked_names_start_fresh() {
        let old = SemaphoreChannel::open("sem-test-unlink");
        old.post(SyncState::Stable, Role::Slave);
        old.unlink().unwrap();
        let fresh = SemaphoreChannel::open("sem-test-unlink");
        assert_eq!(fresh.peek(Role::Slave), SyncState::Idle);
        fresh.unlink().unwrap();
    }
}
