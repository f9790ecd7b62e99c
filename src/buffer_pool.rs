//! Pooled packet buffers.
//!
//! Packets passing through the scheduler carry payloads up to `LMAX_MAX`
//! bytes, so the pool keeps power-of-two stashes from 64 bytes to 2 KiB.
//! A buffer is leased by a producer, filled, and travels with the packet
//! until the sink drops it, at which point it returns to its stash. Unlike
//! a shared handle, a [`PacketBuf`] has a single owner for its whole life;
//! the scheduler moves packets, it never clones them.

use crate::fixed::LMAX_MAX;
use parking_lot::Mutex;
use std::sync::OnceLock;

const MIN_BUFFER_SIZE: usize = 64;
const BUFFER_SIZES: [usize; 6] = [64, 128, 256, 512, 1024, 2048];
const STASH_PER_SIZE: usize = 64;

static STASHES: OnceLock<Vec<Mutex<Vec<Vec<u8>>>>> = OnceLock::new();

fn stashes() -> &'static [Mutex<Vec<Vec<u8>>>] {
    STASHES.get_or_init(|| {
        BUFFER_SIZES
            .iter()
            .map(|&size| {
                let mut bufs = Vec::with_capacity(STASH_PER_SIZE);
                for _ in 0..STASH_PER_SIZE {
                    bufs.push(vec![0u8; size]);
                }
                Mutex::new(bufs)
            })
            .collect()
    })
}

#[inline]
fn size_class_for(len: usize) -> usize {
    let capped = len.clamp(1, LMAX_MAX as usize);
    capped.next_power_of_two().max(MIN_BUFFER_SIZE)
}

#[inline]
fn class_index(size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    size.trailing_zeros() as usize - MIN_BUFFER_SIZE.trailing_zeros() as usize
}

/// Owned, pool-backed byte buffer.
pub struct PacketBuf {
    size_class: usize,
    len: usize,
    data: Option<Vec<u8>>,
}

impl PacketBuf {
    /// Valid payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref().expect("buffer already retired")[..self.len]
    }

    /// Writable view over the whole allocation.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_mut().expect("buffer already retired")
    }

    /// Set the number of valid bytes after filling the buffer.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.size_class);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let Some(mut data) = self.data.take() {
            data.clear();
            data.resize(self.size_class, 0);
            let stash = &stashes()[class_index(self.size_class)];
            let mut guard = stash.lock();
            if guard.len() < STASH_PER_SIZE {
                guard.push(data);
            }
        }
    }
}

impl std::fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuf")
            .field("len", &self.len)
            .field("size_class", &self.size_class)
            .finish()
    }
}

/// Lease a buffer large enough for `size_hint` bytes.
pub fn lease(size_hint: usize) -> PacketBuf {
    let size = size_class_for(size_hint);
    let data = stashes()[class_index(size)]
        .lock()
        .pop()
        .unwrap_or_else(|| vec![0u8; size]);
    PacketBuf {
        size_class: size,
        len: 0,
        data: Some(data),
    }
}

/// Lease a buffer and copy `payload` into it.
pub fn lease_copy(payload: &[u8]) -> PacketBuf {
    let len = payload.len().min(LMAX_MAX as usize);
    let mut buf = lease(len);
    buf.as_mut_slice()[..len].copy_from_slice(&payload[..len]);
    buf.set_len(len);
    buf
}
