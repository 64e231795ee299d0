use std::collections::HashSet;
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Remembers recently seen client salts so a captured handshake cannot be
/// replayed. Two generations rotate when the current one fills, bounding
/// memory at roughly twice the capacity.
pub struct ReplayGuard {
    capacity: usize,
    inner: Mutex<Generations>,
}

struct Generations {
    current: HashSet<Box<[u8]>>,
    previous: HashSet<Box<[u8]>>,
}

impl ReplayGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Generations {
                current: HashSet::new(),
                previous: HashSet::new(),
            }),
        }
    }

    /// Returns true when the salt has not been seen recently, remembering
    /// it; false means a replay.
    pub fn check_and_remember(&self, salt: &[u8]) -> bool {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if g.current.contains(salt) || g.previous.contains(salt) {
            return false;
        }
        if g.current.len() >= self.capacity {
            g.previous = std::mem::take(&mut g.current);
        }
        g.current.insert(salt.into());
        true
    }
}

impl Default for ReplayGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
