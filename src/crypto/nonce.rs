//! GraphiVault - Nonce Sequencing
//!
//! Nonce layout: `key_epoch (u32 BE) || counter (u64 BE)`. Counter 0 of each
//! epoch is the manifest verifier; record counters start at 1.
//!
//! Counters are handed out from blocks whose upper bound is persisted before
//! the first nonce of the block is used. After a crash the next process
//! starts at the persisted bound, so counters can be skipped but never repeat.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::aead::{NonceBytes, NONCE_LEN};
use crate::error::{VaultError, VaultResult};

/// Counter reserved for the manifest verifier
pub const VERIFIER_COUNTER: u64 = 0;

/// First counter handed to records
pub const FIRST_RECORD_COUNTER: u64 = 1;

/// Counters reserved per persisted block
pub const DEFAULT_BLOCK: u64 = 1024;

/// Build a nonce from its parts
pub fn compose(epoch: u32, counter: u64) -> NonceBytes {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&epoch.to_be_bytes());
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Split a nonce into `(epoch, counter)`
pub fn decompose(nonce: &NonceBytes) -> (u32, u64) {
    let mut epoch = [0u8; 4];
    let mut counter = [0u8; 8];
    epoch.copy_from_slice(&nonce[..4]);
    counter.copy_from_slice(&nonce[4..]);
    (u32::from_be_bytes(epoch), u64::from_be_bytes(counter))
}

/// Nonce of the verifier sealed under `epoch`
pub fn verifier_nonce(epoch: u32) -> NonceBytes {
    compose(epoch, VERIFIER_COUNTER)
}

/// Durable high-water marks for counter blocks
pub trait ReservationStore: Send + Sync {
    /// Atomically advance the persisted bound of `epoch` by `block` and
    /// return the reserved half-open range `[start, end)`
    fn reserve(&self, epoch: u32, block: u64) -> VaultResult<(u64, u64)>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    next: u64,
    end: u64,
}

/// Hands out unique nonces per key epoch
pub struct NonceSequence {
    block: u64,
    windows: Mutex<HashMap<u32, Window>>,
}

impl Default for NonceSequence {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK)
    }
}

impl NonceSequence {
    pub fn new(block: u64) -> Self {
        Self {
            block: block.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Next nonce for `epoch`, reserving a fresh block when the window runs dry
    pub fn next(&self, epoch: u32, store: &dyn ReservationStore) -> VaultResult<NonceBytes> {
        let mut windows = self.windows.lock();
        let window = windows.entry(epoch).or_insert(Window { next: 0, end: 0 });

        if window.next >= window.end {
            let (start, end) = store.reserve(epoch, self.block)?;
            if start < FIRST_RECORD_COUNTER || end <= start {
                return Err(VaultError::Corrupted(format!(
                    "nonce reservation [{}, {}) for epoch {} is invalid",
                    start, end, epoch
                )));
            }
            log::debug!("Reserved nonce block [{}, {}) for epoch {}", start, end, epoch);
            *window = Window { next: start, end };
        }

        let counter = window.next;
        window.next = counter
            .checked_add(1)
            .ok_or(VaultError::NonceExhausted(epoch))?;

        Ok(compose(epoch, counter))
    }

    /// Drop in-memory windows; the unused tail of each block is abandoned
    pub fn forget(&self, epoch: u32) {
        self.windows.lock().remove(&epoch);
    }

    pub fn reset(&self) {
        self.windows.lock().clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;

    /// In-memory reservation store
    #[derive(Default)]
    pub(crate) struct MemoryReservations {
        bounds: Mutex<HashMap<u32, u64>>,
        pub calls: Mutex<usize>,
    }

    impl ReservationStore for MemoryReservations {
        fn reserve(&self, epoch: u32, block: u64) -> VaultResult<(u64, u64)> {
            *self.calls.lock() += 1;
            let mut bounds = self.bounds.lock();
            let start = *bounds.entry(epoch).or_insert(FIRST_RECORD_COUNTER);
            let end = start
                .checked_add(block)
                .ok_or(VaultError::NonceExhausted(epoch))?;
            bounds.insert(epoch, end);
            Ok((start, end))
        }
    }

    #[test]
    fn test_compose_roundtrip() {
        let nonce = compose(7, 0xDEAD_BEEF);
        assert_eq!(decompose(&nonce), (7, 0xDEAD_BEEF));
        assert_eq!(decompose(&verifier_nonce(3)), (3, VERIFIER_COUNTER));
    }

    #[test]
    fn test_unique_across_blocks_and_restarts() {
        let store = MemoryReservations::default();
        let mut seen = HashSet::new();

        // Three "processes" sharing one durable store
        for _ in 0..3 {
            let seq = NonceSequence::new(4);
            for _ in 0..10 {
                assert!(seen.insert(seq.next(1, &store).unwrap()));
            }
        }

        assert_eq!(seen.len(), 30);
        assert!(!seen.contains(&verifier_nonce(1)));
    }

    #[test]
    fn test_block_reservation_count() {
        let store = MemoryReservations::default();
        let seq = NonceSequence::new(8);
        for _ in 0..17 {
            seq.next(1, &store).unwrap();
        }
        assert_eq!(*store.calls.lock(), 3);
    }

    #[test]
    fn test_epochs_are_independent() {
        let store = MemoryReservations::default();
        let seq = NonceSequence::default();
        let a = seq.next(1, &store).unwrap();
        let b = seq.next(2, &store).unwrap();
        assert_ne!(a, b);
        assert_eq!(decompose(&a).1, decompose(&b).1);
    }

    #[test]
    fn test_forget_skips_rest_of_block() {
        let store = MemoryReservations::default();
        let seq = NonceSequence::new(4);
        let first = seq.next(1, &store).unwrap();
        seq.forget(1);
        let second = seq.next(1, &store).unwrap();
        assert_eq!(decompose(&first).1, 1);
        assert_eq!(decompose(&second).1, 5);
    }
}
