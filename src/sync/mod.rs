//! Cross-process signalling between the master and slave camera processes.
//!
//! Each role owns one slot holding a [`SyncState`]. A process signals by posting a
//! state into a slot and the other side polls the slot until it sees that state,
//! optionally consuming it (resetting the slot to [`SyncState::Idle`]). Every wait is
//! bounded; a `false` return means the timeout expired.
//!
//! Two backends implement [`SyncChannel`]:
//!
//! - [`shm::SharedMemoryChannel`] - a file-backed shared mapping, for two OS processes.
//! - [`semaphore::SemaphoreChannel`] - named binary semaphores in a process-wide
//!   registry, for two cooperating tasks inside one process.

pub mod semaphore;
pub mod shm;

pub use semaphore::SemaphoreChannel;
pub use shm::SharedMemoryChannel;

use crate::config::{ProcessConfig, SyncBackend};
use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Polling interval of every wait.
pub const SYNC_TICK: Duration = Duration::from_millis(1);

/// Signal carried by a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SyncState {
    /// Nothing pending.
    Idle = 0,
    /// Camera cooled and buffers queued.
    Stable = 1,
    /// The rotator is about to start moving.
    RotateStart = 2,
    /// The rotator reached the next static angle.
    Trigger = 3,
}

impl SyncState {
    /// All states, in slot value order.
    pub const ALL: [SyncState; 4] = [Self::Idle, Self::Stable, Self::RotateStart, Self::Trigger];

    /// Decode a raw slot value.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Stable => "stable",
            Self::RotateStart => "rotate-start",
            Self::Trigger => "trigger",
        };
        f.write_str(name)
    }
}

/// Process role. Also selects the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(usize)]
pub enum Role {
    /// Owns the rotator and drives the observation.
    Master = 0,
    /// Follows the master's signals.
    Slave = 1,
}

impl Role {
    /// The other role.
    pub fn peer(self) -> Self {
        match self {
            Self::Master => Self::Slave,
            Self::Slave => Self::Master,
        }
    }

    /// Slot index of this role.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Slave => f.write_str("slave"),
        }
    }
}

/// Signalling channel shared by both roles.
#[async_trait]
pub trait SyncChannel: Send + Sync {
    /// Unconditionally set the slot of `role` to `state`.
    fn post(&self, state: SyncState, role: Role);

    /// Current state of the slot of `role`.
    fn peek(&self, role: Role) -> SyncState;

    /// Poll the slot of `role` every [`SYNC_TICK`] until it holds `state`.
    ///
    /// With `reset`, a successful wait consumes the signal by setting the slot back
    /// to [`SyncState::Idle`]. Returns `false` once `timeout` has elapsed.
    async fn wait(&self, state: SyncState, role: Role, timeout: Duration, reset: bool) -> bool;

    /// Wait until the previous signal in the slot of `role` was consumed, then post.
    ///
    /// Returns `false`, without posting, if the slot did not drain within `timeout`.
    async fn hand_over(&self, state: SyncState, role: Role, timeout: Duration) -> bool {
        if !self.wait(SyncState::Idle, role, timeout, false).await {
            return false;
        }
        self.post(state, role);
        true
    }

    /// Release the named resource backing the channel.
    ///
    /// Called once by the master at teardown. Handles already open stay usable.
    fn unlink(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Open the channel selected in `config`.
///
/// # Errors
/// Returns [`crate::error::DaqError::Sync`] if the shared memory region cannot be
/// mapped.
pub fn open(config: &ProcessConfig) -> AppResult<Arc<dyn SyncChannel>> {
    Ok(match config.sync_backend {
        SyncBackend::SharedMemory => Arc::new(SharedMemoryChannel::open(
            &config.sync_dir.join(&config.sync_name),
        )?),
        SyncBackend::Semaphore => Arc::new(SemaphoreChannel::open(&config.sync_name)),
    })
}

/// Poll `ready` every `tick` until it returns `true` or `timeout` elapses.
///
/// `ready` is evaluated once more at the deadline, so a signal posted during the
/// final tick is still seen.
pub(crate) async fn poll_until<F>(timeout: Duration, tick: Duration, mut ready: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if ready() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(tick.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn configured_backend_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProcessConfig {
            sync_dir: dir.path().to_path_buf(),
            sync_name: "open_backend_test".into(),
            ..ProcessConfig::default()
        };
        let shm = open(&config).unwrap();
        shm.post(SyncState::Stable, Role::Slave);
        assert!(dir.path().join("open_backend_test").exists());
        assert_eq!(shm.peek(Role::Slave), SyncState::Stable);

        let config = ProcessConfig {
            sync_backend: SyncBackend::Semaphore,
            ..config
        };
        let sem = open(&config).unwrap();
        assert_eq!(sem.peek(Role::Slave), SyncState::Idle);
        sem.unlink().unwrap();
    }

    #[test]
    fn raw_states_decode() {
        assert_eq!(SyncState::from_raw(0), Some(SyncState::Idle));
        assert_eq!(SyncState::from_raw(3), Some(SyncState::Trigger));
        assert_eq!(SyncState::from_raw(4), None);
        assert_eq!(SyncState::RotateStart as u32, 2);
    }

    #[test]
    fn roles_pair_up() {
        assert_eq!(Role::Master.peer(), Role::Slave);
        assert_eq!(Role::Slave.peer(), Role::Master);
        assert_eq!(Role::Slave.index(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_gives_up_exactly_at_the_deadline() {
        let start = Instant::now();
        let seen = poll_until(Duration::from_millis(250), SYNC_TICK, || false).await;
        assert!(!seen);
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_returns_as_soon_as_ready() {
        let start = Instant::now();
        let mut polls = 0;
        let seen = poll_until(Duration::from_secs(1), SYNC_TICK, || {
            polls += 1;
            polls == 5
        })
        .await;
        assert!(seen);
        assert_eq!(start.elapsed(), Duration::from_millis(4));
    }
}
