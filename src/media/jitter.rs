//! Timestamp jitter correction
//!
//! Each consumer rebases the publisher's timestamps independently so that a
//! player joining mid-stream starts near zero and never sees time run
//! backwards. Corrected messages are copy-on-write; the payload is shared.

use super::message::{SharedMessage, MICROS_PER_MILLI};

/// Largest forward or backward step accepted as-is
const MAX_JITTER: i64 = 250 * MICROS_PER_MILLI;

/// Step substituted for an out-of-range delta
const DEFAULT_FRAME_TIME: i64 = 10 * MICROS_PER_MILLI;

/// Time jitter algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JitterAlgorithm {
    /// Start at zero and force monotonically increasing timestamps
    #[default]
    Full,
    /// Start at zero only
    Zero,
    /// Pass timestamps through untouched
    Off,
}

/// Per-consumer jitter state
#[derive(Debug, Clone)]
pub struct Jitter {
    last_pkt_time: i64,
    last_pkt_correct_time: Option<i64>,
}

impl Jitter {
    pub fn new() -> Self {
        Self {
            last_pkt_time: 0,
            last_pkt_correct_time: None,
        }
    }

    /// Correct a message, returning the message to deliver
    pub fn correct(&mut self, msg: &SharedMessage, algorithm: JitterAlgorithm) -> SharedMessage {
        match algorithm {
            JitterAlgorithm::Off => msg.clone(),
            JitterAlgorithm::Zero => {
                let base = *self.last_pkt_correct_time.get_or_insert(msg.timestamp());
                msg.with_timestamp(msg.timestamp() - base)
            }
            JitterAlgorithm::Full => {
                if !msg.is_av() {
                    return msg.with_timestamp(0);
                }

                let time = msg.timestamp();
                let mut delta = time - self.last_pkt_time;
                if !(-MAX_JITTER..=MAX_JITTER).contains(&delta) {
                    delta = DEFAULT_FRAME_TIME;
                }

                let corrected = (self.last_pkt_correct_time.unwrap_or(0) + delta).max(0);
                self.last_pkt_correct_time = Some(corrected);
                self.last_pkt_time = time;

                msg.with_timestamp(corrected)
            }
        }
    }

    /// Last corrected timestamp in microseconds
    pub fn time(&self) -> i64 {
        self.last_pkt_correct_time.unwrap_or(0)
    }
}

impl Default for Jitter {
    fn default() -> Self {
        Self::new()
    }
}
