//! Audio level metering
//!
//! Maps a buffer of samples onto a normalized `[0, 1]` loudness scalar.
//! Used for the live level display, for endpointing, and for barge-in.

/// Level below which a buffer is treated as silence, in dBFS
pub const DEFAULT_FLOOR_DB: f32 = -50.0;

/// Converts sample buffers into a normalized energy level
#[derive(Debug, Clone, Copy)]
pub struct AudioLevelMeter {
    floor_db: f32,
}

impl Default for AudioLevelMeter {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR_DB)
    }
}

impl AudioLevelMeter {
    /// Create a meter whose zero point sits at `floor_db` dBFS
    ///
    /// A non-negative floor is replaced by the default.
    #[must_use]
    pub fn new(floor_db: f32) -> Self {
        let floor_db = if floor_db < 0.0 { floor_db } else { DEFAULT_FLOOR_DB };
        Self { floor_db }
    }

    /// Normalized level of `samples`
    ///
    /// `0.0` at or below the floor, `1.0` at full scale.
    #[must_use]
    pub fn level(&self, samples: &[f32]) -> f32 {
        let rms = calculate_rms(samples);
        if rms <= f32::EPSILON {
            return 0.0;
        }

        let db = 20.0 * rms.log10();
        ((db - self.floor_db) / -self.floor_db).clamp(0.0, 1.0)
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
