//! Shared pseudo-random payload.
//!
//! The payload is generated once at startup and never mutated afterwards.
//! Every chunk handed to the transport is a zero-copy view into it, so the
//! streaming hot path performs no allocation and no copying.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Size of the shared payload buffer (1 MiB).
pub const PAYLOAD_SIZE: usize = 1024 * 1024;

/// Immutable buffer of pseudo-random bytes.
///
/// Cloning is cheap: clones share the same reference-counted storage.
#[derive(Debug, Clone)]
pub struct Payload {
    data: Bytes,
}

impl Payload {
    /// Build the payload deterministically from `seed`.
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; PAYLOAD_SIZE];
        rng.fill_bytes(&mut data);

        Self {
            data: Bytes::from(data),
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// View of the first `chunk_size` bytes.
    ///
    /// A chunk larger than the payload is a configuration error, not a
    /// runtime fault; callers treat it as fatal.
    pub fn slice(&self, chunk_size: usize) -> Result<Bytes, PayloadError> {
        if chunk_size > self.data.len() {
            return Err(PayloadError::ChunkTooLarge {
                chunk_size,
                capacity: self.data.len(),
            });
        }
        Ok(self.data.slice(..chunk_size))
    }
}

/// Payload errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    ChunkTooLarge { chunk_size: usize, capacity: usize },
    EmptyChunk,
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::ChunkTooLarge {
                chunk_size,
                capacity,
            } => write!(
                f,
                "chunk size {} exceeds payload capacity {}",
                chunk_size, capacity
            ),
            PayloadError::EmptyChunk => write!(f, "chunk size must be at least one byte"),
        }
    }
}

impl std::error::Error for PayloadError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_bytes() {
        let a = Payload::new(42);
        let b = Payload::new(42);
        assert_eq!(a.capacity(), PAYLOAD_SIZE);
        assert_eq!(a.slice(PAYLOAD_SIZE).unwrap(), b.slice(PAYLOAD_SIZE).unwrap());
    }

    #[test]
    fn test_different_seed_different_bytes() {
        let a = Payload::new(1);
        let b = Payload::new(2);
        assert_ne!(a.slice(4096).unwrap(), b.slice(4096).unwrap());
    }

    #[test]
    fn test_slice_is_a_view() {
        let payload = Payload::new(7);
        let full = payload.slice(PAYLOAD_SIZE).unwrap();
        let chunk = payload.slice(32 * 1024).unwrap();

        assert_eq!(chunk.len(), 32 * 1024);
        assert_eq!(&full[..chunk.len()], &chunk[..]);
        // Same backing storage, no copy.
        assert_eq!(full.as_ptr(), chunk.as_ptr());
    }

    #[test]
    fn test_slice_bounds() {
        let payload = Payload::new(0);
        assert!(payload.slice(0).unwrap().is_empty());
        assert!(payload.slice(PAYLOAD_SIZE).is_ok());

        let err = payload.slice(PAYLOAD_SIZE + 1).unwrap_err();
        assert_eq!(
            err,
            PayloadError::ChunkTooLarge {
                chunk_size: PAYLOAD_SIZE + 1,
                capacity: PAYLOAD_SIZE,
            }
        );
        assert!(err.to_string().contains("exceeds payload capacity"));
    }
}
