//! Word-granular accounting for the shared scratch arena.
//!
//! The bridge owns one statically sized scratch area that holds either the
//! translator-mode heaps or the updater-mode heaps, never both. The heaps
//! themselves are ordinary structs placed in an enum (Rust's union of
//! layouts); the [`Arena`] ledger enforces the capacity contract around
//! activation and yields the claimed words back on deactivation.

use core::mem;

/// Number of 32-bit words needed to hold a `T`.
pub const fn words_for<T>() -> usize {
    (mem::size_of::<T>() + 3) / 4
}

/// Activation failures against the arena ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArenaError {
    /// The activation asked for more words than remain free.
    InsufficientScratch {
        /// Words the activation needed.
        requested: usize,
        /// Words still unclaimed.
        free: usize,
    },
    /// A release did not match the outstanding claims.
    InvalidScratchOffset,
}

/// Receipt for claimed arena words; hand it back via [`Arena::release`].
#[must_use]
#[derive(Debug)]
pub struct ArenaClaim {
    words: usize,
}

impl ArenaClaim {
    /// Words this claim covers.
    pub fn words(&self) -> usize {
        self.words
    }
}

/// The scratch ledger: fixed capacity, claims outstanding.
#[derive(Debug)]
pub struct Arena {
    capacity: usize,
    used: usize,
}

impl Arena {
    /// A ledger over `capacity_words` words of scratch.
    pub const fn new(capacity_words: usize) -> Self {
        Self { capacity: capacity_words, used: 0 }
    }

    /// Total capacity in words.
    pub fn capacity_words(&self) -> usize {
        self.capacity
    }

    /// Unclaimed words.
    pub fn free_words(&self) -> usize {
        self.capacity - self.used
    }

    /// Claim `words` words for a module activation.
    pub fn claim(&mut self, words: usize) -> Result<ArenaClaim, ArenaError> {
        let free = self.free_words();
        if words > free {
            return Err(ArenaError::InsufficientScratch { requested: words, free });
        }
        self.used += words;
        Ok(ArenaClaim { words })
    }

    /// Return a claim to the pool.
    pub fn release(&mut self, claim: ArenaClaim) -> Result<(), ArenaError> {
        if claim.words > self.used {
            return Err(ArenaError::InvalidScratchOffset);
        }
        self.used -= claim.words;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_release_balance() {
        let mut arena = Arena::new(100);
        let a = arena.claim(60).unwrap();
        assert_eq!(arena.free_words(), 40);
        let b = arena.claim(40).unwrap();
        assert_eq!(arena.free_words(), 0);

        arena.release(a).unwrap();
        assert_eq!(arena.free_words(), 60);
        arena.release(b).unwrap();
        assert_eq!(arena.free_words(), 100);
    }

    #[test]
    fn oversized_claim_is_rejected() {
        let mut arena = Arena::new(10);
        let held = arena.claim(8).unwrap();
        let err = arena.claim(3).unwrap_err();
        assert_eq!(err, ArenaError::InsufficientScratch { requested: 3, free: 2 });
        arena.release(held).unwrap();
    }

    #[test]
    fn foreign_release_is_rejected() {
        let mut small = Arena::new(4);
        let mut big = Arena::new(100);
        let claim = big.claim(50).unwrap();
        assert_eq!(small.release(claim), Err(ArenaError::InvalidScratchOffset));
    }

    #[test]
    fn words_round_up() {
        assert_eq!(words_for::<u8>(), 1);
        assert_eq!(words_for::<[u8; 4]>(), 1);
        assert_eq!(words_for::<[u8; 5]>(), 2);
    }
}
