//! Splits a producer byte stream into fixed-size blocks, with an optional
//! max-latency flush mode.
//!
//! Both modes run entirely inside the single task that owns the producer
//! stream: there is no separate flush-timer thread racing the reader, so the
//! "never duplicate or lose bytes across the interleaving of the reader task
//! and the flush timer" invariant holds by construction rather than
//! by a guarded critical section.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// One payload fragment of a buffer. Index 0 is always the first block;
/// a zero-length payload marks the terminal block of the stream.
#[derive(Clone, Debug)]
pub struct Block {
    pub index: u64,
    pub payload: Bytes,
}

impl Block {
    pub fn is_terminal(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A simple size-classed pool of reusable payload buffers. Workers acquire a buffer before reading into it and release it on
/// every exit path — success, error, or cancellation.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Acquires a buffer with at least `capacity` bytes, zeroed and sized to
    /// exactly `capacity`; reuses a pooled buffer when one is large enough.
    pub fn acquire(&self, capacity: usize) -> BytesMut {
        let mut pool = self.inner.lock().expect("buffer pool mutex poisoned");
        if let Some(pos) = pool.iter().position(|b| b.capacity() >= capacity) {
            let mut buf = pool.swap_remove(pos);
            buf.clear();
            buf.resize(capacity, 0);
            return buf;
        }
        BytesMut::zeroed(capacity)
    }

    /// Returns a buffer to the pool for reuse.
    pub fn release(&self, buf: BytesMut) {
        let mut pool = self.inner.lock().expect("buffer pool mutex poisoned");
        pool.push(buf);
    }

    /// Number of buffers currently idle in the pool, for metrics.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer pool mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces the finite sequence of blocks for one transfer.
pub struct BlockReader<R> {
    inner: R,
    block_size: usize,
    flush_interval: Option<Duration>,
    next_index: u64,
    finished: bool,
    pool: BufferPool,
}

impl<R> BlockReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, block_size: usize, flush_interval: Option<Duration>, pool: BufferPool) -> Self {
        Self {
            inner,
            block_size,
            flush_interval,
            next_index: 0,
            finished: false,
            pool,
        }
    }

    /// Returns the next block, or `None` once the terminal zero-length block
    /// has already been returned.
    pub async fn next_block(&mut self) -> std::io::Result<Option<Block>> {
        if self.finished {
            return Ok(None);
        }

        let mut buf = self.pool.acquire(self.block_size);
        let filled = match self.flush_interval {
            None => self.read_fixed(&mut buf).await?,
            Some(interval) => self.read_max_interval(&mut buf, interval).await?,
        };

        buf.truncate(filled);
        let block = Block {
            index: self.next_index,
            payload: buf.freeze(),
        };
        self.next_index += 1;
        if filled == 0 {
            self.finished = true;
        }
        Ok(Some(block))
    }

    /// Returns the buffer pool backing this reader, for callers that want to
    /// release payload buffers back to it after a block has been consumed.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Fixed-block mode: read exactly `block_size` bytes using read-full
    /// semantics, or fewer at end-of-stream.
    async fn read_fixed(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Max-interval mode: emit as soon as `block_size` is reached or
    /// `flush_interval` elapses with a non-empty accumulator.
    async fn read_max_interval(&mut self, buf: &mut BytesMut, flush_interval: Duration) -> std::io::Result<usize> {
        let mut filled = 0;
        let deadline = tokio::time::sleep(flush_interval);
        tokio::pin!(deadline);

        loop {
            if filled == buf.len() {
                return Ok(filled);
            }
            tokio::select! {
                biased;
                result = self.inner.read(&mut buf[filled..]) => {
                    let n = result?;
                    if n == 0 {
                        return Ok(filled);
                    }
                    filled += n;
                }
                () = &mut deadline, if filled > 0 => {
                    return Ok(filled);
                }
            }
        }
    }
}
