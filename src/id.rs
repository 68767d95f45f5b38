//! Time-ordered 64-bit identifiers.
//!
//! Layout, from the most significant bit: one unused sign bit, 41 bits of
//! milliseconds since [`EPOCH_MS`], 10 bits of worker id, 12 bits of
//! per-millisecond sequence. Ids from one generator are strictly increasing.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::message::MessageId;

/// 2024-01-01T00:00:00Z
pub const EPOCH_MS: i64 = 1_704_067_200_000;

const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

pub const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;

pub struct SnowflakeId {
    worker_id: u64,
    /// `(elapsed_ms << SEQUENCE_BITS) | sequence` of the last issued id.
    state: AtomicU64,
}

impl SnowflakeId {
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: u64::from(worker_id & MAX_WORKER_ID),
            state: AtomicU64::new(0),
        }
    }

    /// Generator with a random worker id, for single-node setups that don't
    /// configure one.
    pub fn random() -> Self {
        Self::new(rand::thread_rng().gen_range(0..=MAX_WORKER_ID))
    }

    pub fn worker_id(&self) -> u16 {
        self.worker_id as u16
    }

    pub fn next_id(&self) -> MessageId {
        loop {
            let now = elapsed_ms();
            let prev = self.state.load(Ordering::Acquire);
            let prev_ms = prev >> SEQUENCE_BITS;

            let next = if now > prev_ms {
                now << SEQUENCE_BITS
            } else if prev & SEQUENCE_MASK < SEQUENCE_MASK {
                prev + 1
            } else {
                // Sequence exhausted, or the wall clock went backwards: keep
                // counting on a logical millisecond.
                (prev_ms + 1) << SEQUENCE_BITS
            };

            if self
                .state
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let ms = next >> SEQUENCE_BITS;
                let sequence = next & SEQUENCE_MASK;
                let raw = (ms << (WORKER_BITS + SEQUENCE_BITS))
                    | (self.worker_id << SEQUENCE_BITS)
                    | sequence;
                return MessageId::new(raw as i64);
            }
        }
    }
}

impl std::fmt::Debug for SnowflakeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeId")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

fn elapsed_ms() -> u64 {
    (chrono::Utc::now().timestamp_millis() - EPOCH_MS).max(0) as u64
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids = SnowflakeId::new(7);
        let mut last = ids.next_id();
        for _ in 0..10_000 {
            let next = ids.next_id();
            assert!(next > last, "{next} should be greater than {last}");
            last = next;
        }
    }

    #[test]
    fn worker_id_is_embedded() {
        let ids = SnowflakeId::new(513);
        let id = ids.next_id().get() as u64;
        assert_eq!((id >> SEQUENCE_BITS) & u64::from(MAX_WORKER_ID), 513);
        assert_eq!(ids.worker_id(), 513);
    }

    #[test]
    fn concurrent_generation_never_repeats() {
        let ids = Arc::new(SnowflakeId::new(1));

        let handles = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..5_000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 40_000);
    }
}
