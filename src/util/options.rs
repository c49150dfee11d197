//! Per-arena tuning.
//!
//! Every knob lives on the arena that uses it; there is no process-global
//! configuration. Defaults can be overridden programmatically or, for the
//! common deployment knobs, from `AMCGC_`-prefixed environment variables.

use crate::util::address::ByteSize;
use crate::util::constants::*;

/// Parameters of one generation in a chain: how much new allocation it
/// tolerates before a collection is scheduled, and the fraction of its
/// content expected to die in that collection.
#[derive(Copy, Clone, Debug)]
pub struct GenParams {
    pub capacity: ByteSize,
    pub mortality: f64,
}

#[derive(Clone, Debug)]
pub struct ArenaOptions {
    /// Address space reserved for the arena at creation.
    pub reservation: ByteSize,
    /// Hard limit on committed memory. Allocation beyond it fails and the
    /// failure drives emergency tracing.
    pub commit_limit: ByteSize,
    /// Committed-but-free memory kept mapped for reuse before the arena
    /// returns pages to the OS.
    pub spare_commit_limit: ByteSize,
    /// Soft pause-time target in seconds, used to pace incremental scanning.
    pub pause_time: f64,
    /// Fraction of the triggering generation's capacity the collector may
    /// let the mutator allocate before an auto-started trace should finish.
    pub incrementality: f64,
    /// Zone shift override. By default the reservation is split into
    /// `ZONE_COUNT` equal stripes.
    pub zone_shift: Option<usize>,
    /// Default segment extension for AMC pools.
    pub extend_by: ByteSize,
    /// Requests at least this large get a segment of their own.
    pub large_size: ByteSize,
    /// Default pinning policy: pin an object when any nail lands in its
    /// interior (true), or only when its base is nailed (false).
    pub interior_pinning: bool,
    /// Generation parameters for the arena's default chain.
    pub default_chain: Vec<GenParams>,
}

impl Default for ArenaOptions {
    fn default() -> Self {
        ArenaOptions {
            #[cfg(target_pointer_width = "64")]
            reservation: 4 << 30,
            #[cfg(target_pointer_width = "32")]
            reservation: 256 << 20,
            commit_limit: usize::MAX,
            spare_commit_limit: 16 * BYTES_IN_MBYTE,
            pause_time: 0.1,
            incrementality: 0.5,
            zone_shift: None,
            extend_by: 8 * BYTES_IN_KBYTE,
            large_size: 32 * BYTES_IN_KBYTE,
            interior_pinning: true,
            default_chain: vec![
                GenParams {
                    capacity: 8 * BYTES_IN_MBYTE,
                    mortality: 0.85,
                },
                GenParams {
                    capacity: 32 * BYTES_IN_MBYTE,
                    mortality: 0.45,
                },
            ],
        }
    }
}

impl ArenaOptions {
    /// Read overrides from `AMCGC_*` environment variables. Unparsable
    /// values are ignored with a warning.
    pub fn read_env_var_settings(&mut self) {
        self.set_bytes_from_env("AMCGC_COMMIT_LIMIT", |o, v| o.commit_limit = v);
        self.set_bytes_from_env("AMCGC_SPARE_COMMIT_LIMIT", |o, v| o.spare_commit_limit = v);
        self.set_bytes_from_env("AMCGC_EXTEND_BY", |o, v| o.extend_by = v);
        self.set_bytes_from_env("AMCGC_LARGE_SIZE", |o, v| o.large_size = v);
        if let Ok(s) = std::env::var("AMCGC_PAUSE_TIME") {
            match s.parse::<f64>() {
                Ok(v) if v > 0.0 => self.pause_time = v,
                _ => warn!("ignoring unparsable AMCGC_PAUSE_TIME={:?}", s),
            }
        }
    }

    fn set_bytes_from_env(&mut self, key: &str, set: impl FnOnce(&mut Self, ByteSize)) {
        if let Ok(s) = std::env::var(key) {
            match s.parse::<usize>() {
                Ok(v) => set(self, v),
                Err(_) => warn!("ignoring unparsable {}={:?}", key, s),
            }
        }
    }

    /// The zone shift to use for a given reservation.
    pub fn effective_zone_shift(&self) -> usize {
        self.zone_shift.unwrap_or_else(|| {
            let stripe = (self.reservation / ZONE_COUNT).max(BYTES_IN_PAGE);
            stripe.next_power_of_two().trailing_zeros() as usize
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_zone_shift_covers_reservation() {
        let opts = ArenaOptions::default();
        let shift = opts.effective_zone_shift();
        // ZONE_COUNT stripes of 1 << shift must cover the reservation.
        assert!((ZONE_COUNT << shift) >= opts.reservation);
    }

    #[test]
    fn large_size_not_below_extend_by() {
        let opts = ArenaOptions::default();
        assert!(opts.large_size >= opts.extend_by);
    }
}
