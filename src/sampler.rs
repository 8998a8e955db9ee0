//! Allocation sampling.
//!
//! Each thread cache counts down the bytes left until its next sample. The
//! gaps between samples are drawn from an exponential distribution with mean
//! `R` (the sample parameter), so every allocated byte is equally likely to
//! be picked and an allocation of `s` bytes is sampled with probability
//! `1 - exp(-s / R)`.

/// Countdown used while sampling is disabled, so a re-enabled parameter is
/// noticed eventually.
const DISABLED_INTERVAL: usize = 16 << 20;

const PRNG_MULT: u64 = 0x5DEECE66D;
const PRNG_ADD: u64 = 0xB;
const PRNG_MOD_SHIFT: u32 = 48;
const PRNG_MOD_MASK: u64 = (1 << PRNG_MOD_SHIFT) - 1;

/// Bits of the PRNG state turned into the uniform deviate.
const Q_BITS: u32 = 26;

/// Per-thread sampling state.
#[derive(Debug, Clone)]
pub struct Sampler {
    bytes_until_sample: usize,
    rnd: u64,
}

impl Sampler {
    /// A sampler that has not been seeded; it samples the first allocation
    /// it sees if `init` is never called.
    pub const fn new() -> Self {
        Sampler {
            bytes_until_sample: 0,
            rnd: 0,
        }
    }

    /// Seeds the PRNG and draws the first countdown.
    pub fn init(&mut self, seed: u64, sample_parameter: usize) {
        self.rnd = seed & PRNG_MOD_MASK;
        for _ in 0..20 {
            self.rnd = next_random(self.rnd);
        }
        self.bytes_until_sample = self.pick_next_sample_period(sample_parameter);
    }

    /// Bytes left before the next sample.
    #[cfg(test)]
    pub fn bytes_until_sample(&self) -> usize {
        self.bytes_until_sample
    }

    /// Counts an allocation of `bytes` and reports whether it is sampled.
    #[inline(always)]
    pub fn record_allocation(&mut self, bytes: usize, sample_parameter: usize) -> bool {
        if self.bytes_until_sample > bytes {
            self.bytes_until_sample -= bytes;
            false
        } else {
            self.record_allocation_slow(sample_parameter)
        }
    }

    #[cold]
    fn record_allocation_slow(&mut self, sample_parameter: usize) -> bool {
        self.bytes_until_sample = self.pick_next_sample_period(sample_parameter);
        sample_parameter != 0
    }

    /// Draws `-R * ln(u)` for `u` uniform in `(0, 1]`.
    fn pick_next_sample_period(&mut self, sample_parameter: usize) -> usize {
        if sample_parameter == 0 {
            return DISABLED_INTERVAL;
        }
        self.rnd = next_random(self.rnd);
        let q = (self.rnd >> (PRNG_MOD_SHIFT - Q_BITS)) + 1;
        let u = q as f64 / (1u64 << Q_BITS) as f64;
        let interval = -u.ln() * sample_parameter as f64;
        // The float to int cast saturates.
        (interval as usize).saturating_add(1)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Sampler::new()
    }
}

#[inline(always)]
fn next_random(rnd: u64) -> u64 {
    PRNG_MULT.wrapping_mul(rnd).wrapping_add(PRNG_ADD) & PRNG_MOD_MASK
}
