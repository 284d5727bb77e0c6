//! Pooled byte buffers
//!
//! Chunks are handed out by an [`Arena`] and go back to their pool on
//! [`Chunk::release`] (or drop). An empty pool never blocks: it allocates.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Capacity of a small chunk (handshake messages, short writes)
pub const SMALL_CHUNK_SIZE: usize = 2 * 1024;
/// Capacity of a large chunk (relay reads, datagrams)
pub const LARGE_CHUNK_SIZE: usize = 8 * 1024;

const SMALL_POOL_LIMIT: usize = 512;
const LARGE_POOL_LIMIT: usize = 256;

/// Size class of a pooled chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 2 KiB
    Small,
    /// 8 KiB
    Large,
}

impl SizeClass {
    pub fn capacity(self) -> usize {
        match self {
            SizeClass::Small => SMALL_CHUNK_SIZE,
            SizeClass::Large => LARGE_CHUNK_SIZE,
        }
    }
}

struct Pool {
    class: SizeClass,
    idle: Mutex<Vec<BytesMut>>,
    max_idle: usize,
    allocated: AtomicU64,
}

impl Pool {
    fn new(class: SizeClass, max_idle: usize) -> Self {
        Self {
            class,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            allocated: AtomicU64::new(0),
        }
    }

    fn take(&self) -> BytesMut {
        let reused = match self.idle.lock() {
            Ok(mut idle) => idle.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        };
        reused.unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            BytesMut::with_capacity(self.class.capacity())
        })
    }

    fn put(&self, mut buf: BytesMut) {
        // A chunk that grew or was split no longer fits its class
        if buf.capacity() < self.class.capacity() || buf.capacity() > self.class.capacity() * 2 {
            return;
        }
        buf.clear();
        let mut idle = match self.idle.lock() {
            Ok(idle) => idle,
            Err(poisoned) => poisoned.into_inner(),
        };
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }

    fn idle_count(&self) -> usize {
        match self.idle.lock() {
            Ok(idle) => idle.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Two-class buffer arena
#[derive(Clone)]
pub struct Arena {
    small: Arc<Pool>,
    large: Arc<Pool>,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        Self::with_limits(SMALL_POOL_LIMIT, LARGE_POOL_LIMIT)
    }

    /// Create an arena retaining at most the given number of idle chunks per class
    pub fn with_limits(small_idle: usize, large_idle: usize) -> Self {
        Self {
            small: Arc::new(Pool::new(SizeClass::Small, small_idle)),
            large: Arc::new(Pool::new(SizeClass::Large, large_idle)),
        }
    }

    fn pool(&self, class: SizeClass) -> &Arc<Pool> {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Large => &self.large,
        }
    }

    /// Take an empty chunk of the given class
    pub fn acquire(&self, class: SizeClass) -> Chunk {
        let pool = self.pool(class);
        Chunk {
            buf: Some(pool.take()),
            pool: Arc::clone(pool),
        }
    }

    /// Number of idle chunks waiting in the pool of `class`
    pub fn idle(&self, class: SizeClass) -> usize {
        self.pool(class).idle_count()
    }

    /// Number of chunks ever allocated fresh for `class`
    pub fn allocated(&self, class: SizeClass) -> u64 {
        self.pool(class).allocated.load(Ordering::Relaxed)
    }
}

static DEFAULT_ARENA: Lazy<Arena> = Lazy::new(Arena::new);

/// Process-wide arena
pub fn arena() -> &'static Arena {
    &DEFAULT_ARENA
}

/// Take a chunk from the process-wide arena
pub fn acquire(class: SizeClass) -> Chunk {
    DEFAULT_ARENA.acquire(class)
}

/// Pooled byte buffer with a single owner
///
/// `release` consumes the chunk, so releasing twice or touching a released
/// chunk does not compile. Dropping an unreleased chunk releases it.
pub struct Chunk {
    buf: Option<BytesMut>,
    pool: Arc<Pool>,
}

impl Chunk {
    /// Return the buffer to its pool
    pub fn release(mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }

    pub fn size_class(&self) -> SizeClass {
        self.pool.class
    }

    /// Mutable access to the underlying buffer
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        self.buf.get_or_insert_with(BytesMut::new)
    }

    /// Bytes still writable without reallocating
    pub fn remaining_capacity(&self) -> usize {
        self.buf
            .as_ref()
            .map(|b| b.capacity() - b.len())
            .unwrap_or(0)
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf_mut().extend_from_slice(data);
    }

    /// Read once from `reader` into the free capacity, returning the byte count (0 = EOF)
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let buf = self.buf_mut();
        if buf.capacity() == buf.len() {
            return Ok(0);
        }
        reader.read_buf(buf).await
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("class", &self.pool.class)
            .field("len", &self.len())
            .finish()
    }
}
