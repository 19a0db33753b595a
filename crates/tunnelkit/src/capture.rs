//! Bounded capture of target output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Default capture size per stream.
pub const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024;

/// Byte buffer that keeps only the most recent `max` bytes.
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    max: usize,
    data: VecDeque<u8>,
}

impl BoundedBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            data: VecDeque::with_capacity(max.min(DEFAULT_CAPTURE_LIMIT)),
        }
    }

    /// Append `bytes`, dropping the oldest bytes beyond `max`.
    pub fn write(&mut self, bytes: &[u8]) {
        if self.max == 0 {
            return;
        }
        let tail = if bytes.len() > self.max {
            &bytes[bytes.len() - self.max..]
        } else {
            bytes
        };
        let overflow = (self.data.len() + tail.len()).saturating_sub(self.max);
        self.data.drain(..overflow);
        self.data.extend(tail);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.iter().copied().collect()
    }

    /// Contents decoded lossily as UTF-8.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_vec()).into_owned()
    }
}

impl Default for BoundedBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_LIMIT)
    }
}

/// A [`BoundedBuffer`] shared between a tee task and its reader.
pub type SharedBuffer = Arc<Mutex<BoundedBuffer>>;

pub(crate) fn shared(max: usize) -> SharedBuffer {
    Arc::new(Mutex::new(BoundedBuffer::new(max)))
}

pub(crate) fn snapshot(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .to_string_lossy()
}
