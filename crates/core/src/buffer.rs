use std::{
    fmt,
    io::{self, Read, Write},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};

use crate::metrics::Metrics;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);
static DEFAULT_POOL: OnceLock<Pool> = OnceLock::new();

/// Errors raised by the pool and its buffers.
///
/// Lifecycle violations (`UnknownBuffer`, `RetainAfterRelease`, `AlreadyReleased`)
/// are programming errors in the caller and are reported as distinct variants so
/// they can be asserted on individually.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("invalid pool geometry: {buffer_capacity} bytes x {pool_capacity} buffers")]
    InvalidCapacity {
        buffer_capacity: usize,
        pool_capacity: usize,
    },
    #[error("buffer size {requested} not supported (pool buffers hold {capacity} bytes)")]
    BufferSizeNotSupported { requested: usize, capacity: usize },
    #[error("no free buffers")]
    NoFreeBuffers,
    #[error("buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("buffer {0} is not known to this pool")]
    UnknownBuffer(BufferId),
    #[error("buffer {0} retained after release")]
    RetainAfterRelease(BufferId),
    #[error("buffer {0} already released")]
    AlreadyReleased(BufferId),
    #[error("buffer {0} is shared and cannot be written")]
    SharedWrite(BufferId),
    #[error("default pool already installed")]
    DefaultPoolInstalled,
    #[error("default pool not installed")]
    DefaultPoolMissing,
    #[error("buffer i/o: {0}")]
    Io(#[from] io::Error),
}

impl PoolError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::InvalidCapacity { .. } => "invalid_capacity",
            PoolError::BufferSizeNotSupported { .. } => "buffer_size_not_supported",
            PoolError::NoFreeBuffers => "no_free_buffers",
            PoolError::BufferTooSmall { .. } => "buffer_too_small",
            PoolError::UnknownBuffer(_) => "unknown_buffer",
            PoolError::RetainAfterRelease(_) => "retain_after_release",
            PoolError::AlreadyReleased(_) => "already_released",
            PoolError::SharedWrite(_) => "shared_write",
            PoolError::DefaultPoolInstalled => "default_pool_installed",
            PoolError::DefaultPoolMissing => "default_pool_missing",
            PoolError::Io(_) => "io",
        }
    }
}

/// Identity of a pool slot: the owning pool plus the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    pool: u64,
    slot: u32,
}

impl BufferId {
    /// Slot index inside the owning pool.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pool, self.slot)
    }
}

struct Slot {
    bytes: Box<[u8]>,
    len: usize,
    limit: usize,
}

impl Slot {
    fn reset(&mut self) {
        self.len = 0;
        self.limit = self.bytes.len();
    }
}

struct CountTable {
    counts: Vec<u32>,
    next: usize,
}

struct PoolInner {
    id: u64,
    buffer_capacity: usize,
    slots: Box<[RwLock<Slot>]>,
    counts: Mutex<CountTable>,
    metrics: Arc<Metrics>,
}

impl PoolInner {
    fn buffer_id(&self, slot: usize) -> BufferId {
        BufferId {
            pool: self.id,
            slot: slot as u32,
        }
    }

    fn slot_index(&self, id: BufferId) -> Result<usize, PoolError> {
        if id.pool != self.id || id.slot() >= self.slots.len() {
            return Err(PoolError::UnknownBuffer(id));
        }
        Ok(id.slot())
    }

    fn ref_count(&self, slot: usize) -> u32 {
        self.counts.lock().counts[slot]
    }

    fn retain(&self, slot: usize) -> Result<u32, PoolError> {
        let mut table = self.counts.lock();
        let count = &mut table.counts[slot];
        if *count == 0 {
            return Err(PoolError::RetainAfterRelease(self.buffer_id(slot)));
        }
        *count += 1;
        Ok(*count)
    }

    fn release(&self, slot: usize) -> Result<u32, PoolError> {
        let mut table = self.counts.lock();
        let count = &mut table.counts[slot];
        if *count == 0 {
            return Err(PoolError::AlreadyReleased(self.buffer_id(slot)));
        }
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            // Reset under the count lock so the next borrower always sees an empty slot.
            self.slots[slot].write().reset();
            self.metrics.recycle();
        }
        Ok(remaining)
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of slots in the pool.
    pub capacity: usize,
    /// Slots with a reference count of zero.
    pub idle: usize,
    /// Slots currently borrowed.
    pub outstanding: usize,
}

/// Fixed-size pool of equally sized frame buffers.
///
/// All buffers are allocated up front; borrowing never allocates. The pool only
/// synchronizes reference counts and slot selection.
///
/// # Example
/// ```rust
/// use hdcap_core::prelude::*;
///
/// let pool = Pool::new(4, 2).unwrap();
/// let a = pool.borrow(4).unwrap();
/// let b = pool.borrow(4).unwrap();
/// assert!(matches!(pool.borrow(1), Err(PoolError::NoFreeBuffers)));
/// a.release().unwrap();
/// let c = pool.borrow(1).unwrap();
/// # drop((b, c));
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool of `pool_capacity` buffers, each `buffer_capacity` bytes long.
    pub fn new(buffer_capacity: usize, pool_capacity: usize) -> Result<Self, PoolError> {
        if buffer_capacity == 0 || pool_capacity == 0 || pool_capacity > u32::MAX as usize {
            return Err(PoolError::InvalidCapacity {
                buffer_capacity,
                pool_capacity,
            });
        }
        let slots = (0..pool_capacity)
            .map(|_| {
                RwLock::new(Slot {
                    bytes: vec![0; buffer_capacity].into_boxed_slice(),
                    len: 0,
                    limit: buffer_capacity,
                })
            })
            .collect();
        Ok(Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                buffer_capacity,
                slots,
                counts: Mutex::new(CountTable {
                    counts: vec![0; pool_capacity],
                    next: 0,
                }),
                metrics: Arc::new(Metrics::default()),
            }),
        })
    }

    /// Borrow an idle buffer able to hold `size` bytes.
    ///
    /// Which idle slot is returned is unspecified.
    pub fn borrow(&self, size: usize) -> Result<FrameBuffer, PoolError> {
        if size > self.inner.buffer_capacity {
            return Err(PoolError::BufferSizeNotSupported {
                requested: size,
                capacity: self.inner.buffer_capacity,
            });
        }
        let mut table = self.inner.counts.lock();
        let slots = table.counts.len();
        let start = table.next;
        let Some(slot) = (0..slots)
            .map(|offset| (start + offset) % slots)
            .find(|&idx| table.counts[idx] == 0)
        else {
            self.inner.metrics.exhausted();
            return Err(PoolError::NoFreeBuffers);
        };
        table.counts[slot] = 1;
        table.next = (slot + 1) % slots;
        self.inner.slots[slot].write().limit = size;
        drop(table);
        self.inner.metrics.borrowed();
        Ok(FrameBuffer {
            pool: self.inner.clone(),
            slot,
            live: true,
        })
    }

    /// Increment the reference count of a raw buffer identity.
    pub fn retain_raw(&self, id: BufferId) -> Result<(), PoolError> {
        let slot = self.inner.slot_index(id)?;
        self.inner.retain(slot).map(|_| ())
    }

    /// Decrement the reference count of a raw buffer identity.
    pub fn release_raw(&self, id: BufferId) -> Result<(), PoolError> {
        let slot = self.inner.slot_index(id)?;
        self.inner.release(slot).map(|_| ())
    }

    /// Rebuild a handle from an identity produced by [`FrameBuffer::into_raw`].
    ///
    /// The reference count is not changed; the returned handle takes over the
    /// reference the raw identity stood for.
    pub fn from_raw(&self, id: BufferId) -> Result<FrameBuffer, PoolError> {
        let slot = self.inner.slot_index(id)?;
        if self.inner.ref_count(slot) == 0 {
            return Err(PoolError::AlreadyReleased(id));
        }
        Ok(FrameBuffer {
            pool: self.inner.clone(),
            slot,
            live: true,
        })
    }

    /// Current reference count of a buffer identity.
    pub fn ref_count(&self, id: BufferId) -> Result<u32, PoolError> {
        let slot = self.inner.slot_index(id)?;
        Ok(self.inner.ref_count(slot))
    }

    /// Byte capacity of every buffer in the pool.
    pub fn buffer_capacity(&self) -> usize {
        self.inner.buffer_capacity
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let table = self.inner.counts.lock();
        let idle = table.counts.iter().filter(|c| **c == 0).count();
        PoolStats {
            capacity: table.counts.len(),
            idle,
            outstanding: table.counts.len() - idle,
        }
    }

    /// Access metrics counters for this pool.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics(self.inner.metrics.clone())
    }

    /// Whether two handles refer to the same pool.
    pub fn same_pool(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("buffer_capacity", &self.inner.buffer_capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Observability for pool behavior.
#[derive(Clone)]
pub struct PoolMetrics(Arc<Metrics>);

impl PoolMetrics {
    pub fn borrows(&self) -> u64 {
        self.0.borrows()
    }

    pub fn exhausted(&self) -> u64 {
        self.0.exhausted_count()
    }

    pub fn recycles(&self) -> u64 {
        self.0.recycles()
    }
}

/// Move-only handle to one reference on a pooled buffer.
///
/// `retain` creates an additional co-owning handle; `release` consumes the
/// handle. A handle that is dropped without `release` releases its reference
/// on drop. Writes require the caller to be the only owner.
pub struct FrameBuffer {
    pool: Arc<PoolInner>,
    slot: usize,
    live: bool,
}

impl FrameBuffer {
    /// Identity of the underlying slot.
    pub fn id(&self) -> BufferId {
        self.pool.buffer_id(self.slot)
    }

    /// Maximum number of bytes this borrow may hold.
    pub fn capacity(&self) -> usize {
        self.pool.slots[self.slot].read().limit
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.pool.slots[self.slot].read().len
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count of the underlying slot.
    pub fn ref_count(&self) -> u32 {
        self.pool.ref_count(self.slot)
    }

    /// Borrow the stored bytes.
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.pool.slots[self.slot].read(), |slot| {
            &slot.bytes[..slot.len]
        })
    }

    /// Copy the stored bytes into a new vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data().to_vec()
    }

    /// Append `bytes` after the current contents.
    ///
    /// Fails with `BufferTooSmall` without touching the buffer when the bytes do
    /// not fit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), PoolError> {
        self.ensure_exclusive()?;
        let mut slot = self.pool.slots[self.slot].write();
        let available = slot.limit - slot.len;
        if bytes.len() > available {
            return Err(PoolError::BufferTooSmall {
                needed: bytes.len(),
                available,
            });
        }
        let start = slot.len;
        slot.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        slot.len += bytes.len();
        Ok(())
    }

    /// Append from `reader` until the reader is exhausted or the buffer is full.
    ///
    /// Returns the number of bytes transferred.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, PoolError> {
        self.ensure_exclusive()?;
        let mut slot = self.pool.slots[self.slot].write();
        let mut total = 0;
        while slot.len < slot.limit {
            let (start, end) = (slot.len, slot.limit);
            match reader.read(&mut slot.bytes[start..end]) {
                Ok(0) => break,
                Ok(n) => {
                    slot.len += n;
                    total += n;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(total)
    }

    /// Write the stored bytes into `writer`, returning the count written.
    pub fn write_into<W: Write>(&self, writer: &mut W) -> Result<usize, PoolError> {
        let data = self.data();
        writer.write_all(&data)?;
        Ok(data.len())
    }

    /// Add a co-owner, returning its handle.
    pub fn retain(&self) -> Result<FrameBuffer, PoolError> {
        self.pool.retain(self.slot)?;
        Ok(FrameBuffer {
            pool: self.pool.clone(),
            slot: self.slot,
            live: true,
        })
    }

    /// Give up this handle's reference.
    ///
    /// When the last reference goes away the buffer is emptied and becomes
    /// available for the next borrow.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.live = false;
        self.pool.release(self.slot).map(|_| ())
    }

    /// Convert into a raw identity without releasing the reference.
    ///
    /// Use [`Pool::from_raw`] or [`Pool::release_raw`] to give it back.
    pub fn into_raw(mut self) -> BufferId {
        self.live = false;
        self.id()
    }

    fn ensure_exclusive(&self) -> Result<(), PoolError> {
        if self.pool.ref_count(self.slot) != 1 {
            return Err(PoolError::SharedWrite(self.id()));
        }
        Ok(())
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("id", &self.id())
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if self.live
            && let Err(err) = self.pool.release(self.slot)
        {
            tracing::warn!(buffer = %self.id(), error = %err, "release on drop failed");
        }
    }
}

/// Zero-argument lookup of the installed default pool.
pub type PoolProvider = fn() -> Result<Pool, PoolError>;

/// Install the process-wide default pool. Only the first call succeeds.
pub fn install_default_pool(pool: Pool) -> Result<(), PoolError> {
    DEFAULT_POOL
        .set(pool)
        .map_err(|_| PoolError::DefaultPoolInstalled)
}

/// Fetch the process-wide default pool.
pub fn default_pool() -> Result<Pool, PoolError> {
    DEFAULT_POOL.get().cloned().ok_or(PoolError::DefaultPoolMissing)
}
