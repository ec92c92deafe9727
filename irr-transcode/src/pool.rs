//! Bounded pool of reusable raw-image buffers.
//!
//! A buffer is checked out with [`FramePool::try_acquire`] and goes back to the
//! pool when its [`PooledBuffer`] guard drops, on every exit path. Freezing a
//! guard into [`Bytes`] keeps it checked out until the last clone is released.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::error::{Result, TranscodeError};

struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
}

#[derive(Clone)]
pub struct FramePool {
    state: Arc<Mutex<PoolState>>,
    buffer_size: usize,
    max_outstanding: usize,
}

impl FramePool {
    pub fn new(buffer_size: usize, max_outstanding: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                free: Vec::with_capacity(max_outstanding),
                outstanding: 0,
            })),
            buffer_size,
            max_outstanding: max_outstanding.max(1),
        }
    }

    pub fn try_acquire(&self) -> Result<PooledBuffer> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.outstanding >= self.max_outstanding {
            return Err(TranscodeError::PoolExhausted {
                count: state.outstanding,
            });
        }
        let buf = state
            .free
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        state.outstanding += 1;
        Ok(PooledBuffer {
            buf,
            pool: Arc::clone(&self.state),
        })
    }

    /// Buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outstanding
    }
}

/// A checked-out buffer. Returns itself to the pool on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<Mutex<PoolState>>,
}

impl PooledBuffer {
    /// Turns the buffer into shared bytes; the pool slot is released once every
    /// clone has been dropped.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut state = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        state.outstanding = state.outstanding.saturating_sub(1);
        state.free.push(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_at_max_outstanding() {
        let pool = FramePool::new(16, 2);
        let a = pool.try_acquire().unwrap();
        let _b = pool.try_acquire().unwrap();
        match pool.try_acquire() {
            Err(TranscodeError::PoolExhausted { count }) => assert_eq!(count, 2),
            other => panic!("Expected PoolExhausted, got {:?}", other.map(|b| b.len())),
        }
        drop(a);
        assert_eq!(pool.outstanding(), 1);
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn frozen_bytes_release_after_last_clone() {
        let pool = FramePool::new(8, 1);
        let mut buf = pool.try_acquire().unwrap();
        buf[0] = 7;
        let bytes = buf.freeze();
        let clone = bytes.clone();
        drop(bytes);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(clone[0], 7);
        drop(clone);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn returned_buffers_are_reused() {
        let pool = FramePool::new(8, 2);
        let mut buf = pool.try_acquire().unwrap();
        buf[3] = 5;
        drop(buf);
        let again = pool.try_acquire().unwrap();
        assert_eq!(again.len(), 8);
        assert_eq!(again[3], 5);
    }
}
