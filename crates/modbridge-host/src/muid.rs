//! Module identity allocation.
//!
//! Every loaded module instance gets a random 64-bit identity that scopes
//! its capability calls and owned routes. Identities are unique for the
//! process lifetime and never reused, even after the module is unloaded;
//! a fresh load of the same file gets a fresh identity.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;

use crate::error::LoadError;

/// Identity of one loaded module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Muid(u64);

impl Muid {
    /// Reserved invalid identity; never assigned to a module.
    pub const INVALID: Muid = Muid(0);

    pub const fn from_raw(raw: u64) -> Self {
        Muid(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Muid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

const ALLOC_ATTEMPTS: usize = 10;

/// Thread-safe allocator for module identities.
pub struct MuidAllocator {
    seen: Mutex<HashSet<u64>>,
}

impl MuidAllocator {
    pub fn new() -> Self {
        let mut seen = HashSet::new();
        // Seed the invalid identity so it can never be handed out.
        seen.insert(0);
        Self {
            seen: Mutex::new(seen),
        }
    }

    /// Draw a fresh identity, retrying a bounded number of times against
    /// every value handed out so far.
    pub fn allocate(&self) -> Result<Muid, LoadError> {
        let mut seen = self.seen.lock();
        for _ in 0..ALLOC_ATTEMPTS {
            let candidate: u64 = rand::random();
            if seen.insert(candidate) {
                return Ok(Muid(candidate));
            }
        }
        tracing::error!("could not allocate a unique module identity in {ALLOC_ATTEMPTS} tries");
        Err(LoadError::IdentityExhausted)
    }
}

impl Default for MuidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
