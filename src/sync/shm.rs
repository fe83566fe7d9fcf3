//! Shared-memory sync channel for two camera processes.
//!
//! The region is a small file (by default under `/dev/shm`) mapped read-write by both
//! processes. It holds a `#[repr(C)]` header with one atomic 32-bit slot per role:
//!
//! ```text
//! offset  0  magic   u32
//! offset  4  version u32
//! offset  8  slot[0] u32  (master)
//! offset 12  slot[1] u32  (slave)
//! offset 16  padding to 64 bytes
//! ```
//!
//! Whichever process creates the file resets both slots to idle. A process that
//! opens an existing file with a bad magic number initialises it the same way.
#![allow(unsafe_code)]

use super::{poll_until, Role, SyncChannel, SyncState, SYNC_TICK};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Magic number for header validation ("MPSY").
const MAGIC: u32 = 0x4D50_5359;

/// Layout version.
const VERSION: u32 = 1;

/// Size of the mapped region in bytes (one cache line).
const HEADER_SIZE: usize = 64;

#[repr(C)]
struct SyncHeader {
    magic: AtomicU32,
    version: AtomicU32,
    slots: [AtomicU32; 2],
    _padding: [u8; 48],
}

const _: () = assert!(
    std::mem::size_of::<SyncHeader>() == HEADER_SIZE,
    "SyncHeader size must equal HEADER_SIZE (64 bytes)"
);

/// File-backed [`SyncChannel`].
pub struct SharedMemoryChannel {
    #[expect(
        dead_code,
        reason = "mmap must be kept alive to maintain memory mapping validity"
    )]
    mmap: MmapMut,

    /// SAFETY: Points to the start of mmap, valid as long as mmap exists
    header: *const SyncHeader,

    path: PathBuf,
    created: bool,
    tick: Duration,
}

impl std::fmt::Debug for SharedMemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryChannel")
            .field("path", &self.path)
            .field("created", &self.created)
            .field("master", &self.peek(Role::Master))
            .field("slave", &self.peek(Role::Slave))
            .finish()
    }
}

// SAFETY: The header is only accessed through atomics, and the mapping it points into
// is owned by the channel and lives as long as it does.
unsafe impl Send for SharedMemoryChannel {}

// SAFETY: All shared state is atomic; there is no non-atomic interior mutation.
unsafe impl Sync for SharedMemoryChannel {}

impl SharedMemoryChannel {
    /// Create or attach to the region at `path`.
    ///
    /// # Arguments
    /// * `path` - Backing file, e.g. `/dev/shm/polar_daq_sync`
    ///
    /// # Errors
    /// Returns [`DaqError::Sync`] if the file cannot be created, sized or mapped.
    pub fn open(path: &Path) -> AppResult<Self> {
        let sync_err = |what: &str, e: std::io::Error| {
            DaqError::Sync(format!("{what} {}: {e}", path.display()))
        };

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => (file, true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| sync_err("failed to open", e))?;
                (file, false)
            }
            Err(e) => return Err(sync_err("failed to create", e)),
        };

        let len = file
            .metadata()
            .map_err(|e| sync_err("failed to stat", e))?
            .len();
        if len < HEADER_SIZE as u64 {
            file.set_len(HEADER_SIZE as u64)
                .map_err(|e| sync_err("failed to size", e))?;
        }

        // SAFETY: The file is at least HEADER_SIZE bytes long. Other processes only
        // touch the region through the same atomic header layout.
        let mmap = unsafe {
            MmapOptions::new()
                .len(HEADER_SIZE)
                .map_mut(&file)
                .map_err(|e| sync_err("failed to map", e))?
        };
        // Mappings are page aligned, which satisfies the header's alignment.
        let header = mmap.as_ptr() as *const SyncHeader;

        let channel = Self {
            mmap,
            header,
            path: path.to_path_buf(),
            created,
            tick: SYNC_TICK,
        };
        channel.initialise(created);
        info!(path = %path.display(), created, "sync channel attached");
        Ok(channel)
    }

    fn header(&self) -> &SyncHeader {
        // SAFETY: header points into self.mmap, which lives as long as self
        unsafe { &*self.header }
    }

    fn initialise(&self, created: bool) {
        let header = self.header();
        if created {
            self.reset();
            header.version.store(VERSION, Ordering::Release);
            header.magic.store(MAGIC, Ordering::Release);
            return;
        }
        let magic = header.magic.load(Ordering::Acquire);
        if magic != MAGIC
            && header
                .magic
                .compare_exchange(magic, MAGIC, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(path = %self.path.display(), magic, "sync region had no valid header, initialising");
            self.reset();
            header.version.store(VERSION, Ordering::Release);
        }
    }

    /// Set both slots to idle.
    pub fn reset(&self) {
        for slot in &self.header().slots {
            slot.store(SyncState::Idle as u32, Ordering::Release);
        }
    }

    /// Whether this handle created the backing file.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn slot(&self, role: Role) -> &AtomicU32 {
        &self.header().slots[role.index()]
    }
}

#[async_trait]
impl SyncChannel for SharedMemoryChannel {
    fn post(&self, state: SyncState, role: Role) {
        debug!(%state, %role, "post");
        self.slot(role).store(state as u32, Ordering::Release);
    }

    fn peek(&self, role: Role) -> SyncState {
        SyncState::from_raw(self.slot(role).load(Ordering::Acquire)).unwrap_or(SyncState::Idle)
    }

    async fn wait(&self, state: SyncState, role: Role, timeout: Duration, reset: bool) -> bool {
        let slot = self.slot(role);
        let want = state as u32;
        let seen = poll_until(timeout, self.tick, || {
            if !reset || state == SyncState::Idle {
                return slot.load(Ordering::Acquire) == want;
            }
            slot.compare_exchange(
                want,
                SyncState::Idle as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        })
        .await;
        if seen {
            debug!(%state, %role, reset, "wait satisfied");
        } else {
            warn!(%state, %role, ?timeout, "wait timed out");
        }
        seen
    }

    fn unlink(&self) -> AppResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "sync channel removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DaqError::Sync(format!(
                "failed to remove {}: {e}",
                self.path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn post_is_seen_by_a_second_mapping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync");
        let master = SharedMemoryChannel::open(&path).unwrap();
        let slave = SharedMemoryChannel::open(&path).unwrap();
        assert!(master.created());
        assert!(!slave.created());

        master.post(SyncState::RotateStart, Role::Master);
        assert!(
            slave
                .wait(SyncState::RotateStart, Role::Master, Duration::from_millis(10), true)
                .await
        );
        assert_eq!(master.peek(Role::Master), SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_without_post_times_out_at_the_boundary() {
        let dir = tempdir().unwrap();
        let channel = SharedMemoryChannel::open(&dir.path().join("sync")).unwrap();
        let start = Instant::now();
        let timeout = Duration::from_millis(500);
        assert!(!channel.wait(SyncState::Stable, Role::Slave, timeout, true).await);
        assert_eq!(start.elapsed(), timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_without_reset_leaves_the_signal() {
        let dir = tempdir().unwrap();
        let channel = SharedMemoryChannel::open(&dir.path().join("sync")).unwrap();
        channel.post(SyncState::Stable, Role::Slave);
        assert!(channel.wait(SyncState::Stable, Role::Slave, Duration::ZERO, false).await);
        assert_eq!(channel.peek(Role::Slave), SyncState::Stable);
        assert_eq!(channel.peek(Role::Master), SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn hand_over_waits_for_the_slot_to_drain() {
        let dir = tempdir().unwrap();
        let channel = SharedMemoryChannel::open(&dir.path().join("sync")).unwrap();
        channel.post(SyncState::Stable, Role::Master);
        let timeout = Duration::from_millis(20);
        assert!(!channel.hand_over(SyncState::RotateStart, Role::Master, timeout).await);
        assert_eq!(channel.peek(Role::Master), SyncState::Stable);

        assert!(channel.wait(SyncState::Stable, Role::Master, timeout, true).await);
        assert!(channel.hand_over(SyncState::RotateStart, Role::Master, timeout).await);
        assert_eq!(channel.peek(Role::Master), SyncState::RotateStart);
    }

    #[test]
    fn creator_resets_stale_slots_and_unlink_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync");
        std::fs::write(&path, [0xFFu8; HEADER_SIZE]).unwrap();

        let channel = SharedMemoryChannel::open(&path).unwrap();
        assert!(!channel.created());
        assert_eq!(channel.peek(Role::Master), SyncState::Idle);
        assert_eq!(channel.peek(Role::Slave), SyncState::Idle);

        channel.unlink().unwrap();
        assert!(!path.exists());
        channel.unlink().unwrap();
    }
}
