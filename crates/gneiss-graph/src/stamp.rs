use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A cell timestamp: microseconds since the Unix epoch.
///
/// Readers at time `t` see, per column, the newest cell whose stamp is `<= t`. The stamp written
/// on a root's lock cell is the single logical time of the entire edit.
#[derive(
    Archive, Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord,
    Serialize,
)]
#[archive_attr(derive(Debug, Eq, PartialEq, PartialOrd, Ord))]
pub struct Stamp(pub u64);

impl Stamp {
    pub const ZERO: Self = Stamp(0);
    pub const MAX: Self = Stamp(u64::MAX);

    pub const fn from_micros(micros: u64) -> Self {
        Stamp(micros)
    }

    pub const fn micros(self) -> u64 {
        self.0
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Stamp(self.0.saturating_add(d.as_micros() as u64))
    }

    /// Key bytes ordered newest-first under the big-endian `Ord` that sled uses.
    pub const fn to_reverse_be_bytes(self) -> [u8; 8] {
        (!self.0).to_be_bytes()
    }

    pub fn from_reverse_be_bytes(bytes: [u8; 8]) -> Self {
        Stamp(!u64::from_be_bytes(bytes))
    }
}

/// Mints strictly increasing [`Stamp`]s.
///
/// sled assigns no server-side cell timestamps, so the store owns the authoritative clock: wall
/// time, bumped by at least one microsecond per call so that no two cells of one process tie.
#[derive(Default)]
pub struct MonotonicClock {
    last_micros: Mutex<u64>,
}

impl MonotonicClock {
    pub fn now(&self) -> Stamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let mut last = self.last_micros.lock();
        *last = wall.max(*last + 1);
        Stamp(*last)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_strictly_increase() {
        let clock = MonotonicClock::default();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn reverse_key_order_is_newest_first() {
        let older = Stamp(10).to_reverse_be_bytes();
        let newer = Stamp(20).to_reverse_be_bytes();
        assert!(newer < older);
        assert_eq!(Stamp::from_reverse_be_bytes(newer), Stamp(20));
    }
}
