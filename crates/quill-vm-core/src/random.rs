//! Session-owned random number source for `random`

/// Generator mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// xorshift seeded from the OS or a fixed seed
    Random,
    /// Counts 1, 2, ..., limit, 1, ... (small negative seeds)
    Sequence { limit: u16, next: u16 },
}

/// Random source with the predictable modes `random` supports
#[derive(Debug, Clone)]
pub struct RandomSource {
    state: u64,
    mode: Mode,
}

fn os_seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::fill(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(error) => {
            tracing::warn!(%error, "no OS randomness, using a fixed seed");
            0x2545_f491_4f6c_dd1d
        }
    }
}

impl RandomSource {
    /// Seeded from the OS.
    pub fn new() -> Self {
        Self::seeded(os_seed())
    }

    /// Deterministic generator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            state: seed.max(1),
            mode: Mode::Random,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Value in `1..=range` (`range` > 0).
    pub fn next_in(&mut self, range: u16) -> u16 {
        let range = range.max(1);
        match &mut self.mode {
            Mode::Sequence { limit, next } => {
                let value = (*next - 1) % range + 1;
                *next = if *next >= *limit { 1 } else { *next + 1 };
                value
            }
            Mode::Random => (self.next_u64() % range as u64) as u16 + 1,
        }
    }

    /// `random` with a non-positive argument: 0 reseeds from the OS,
    /// small magnitudes count sequentially, larger ones seed predictably.
    pub fn reseed(&mut self, argument: i16) {
        if argument == 0 {
            *self = Self::new();
            return;
        }
        let magnitude = argument.unsigned_abs();
        if magnitude < 1000 {
            self.mode = Mode::Sequence {
                limit: magnitude,
                next: 1,
            };
        } else {
            *self = Self::seeded(magnitude as u64);
        }
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_stay_in_range() {
        let mut random = RandomSource::seeded(42);
        for _ in 0..1000 {
            let value = random.next_in(6);
            assert!((1..=6).contains(&value));
        }
    }

    #[test]
    fn seeded_sequences_repeat() {
        let mut a = RandomSource::new();
        let mut b = RandomSource::new();
        a.reseed(-5000);
        b.reseed(-5000);
        let left: Vec<_> = (0..10).map(|_| a.next_in(100)).collect();
        let right: Vec<_> = (0..10).map(|_| b.next_in(100)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn small_seeds_count() {
        let mut random = RandomSource::seeded(1);
        random.reseed(-3);
        let values: Vec<_> = (0..5).map(|_| random.next_in(10)).collect();
        assert_eq!(values, vec![1, 2, 3, 1, 2]);
    }
}
