//! Utility routines for working with decibels.

/// Convert a gain in dB to a linear factor.
#[inline]
pub fn from_db(db: f32) -> f32 {
    10.0f32.powf(db / 20.0)
}

/// Convert a linear factor to a gain in dB.
#[inline]
pub fn to_db(val: f32) -> f32 {
    20.0 * val.log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for db in [-60.0f32, -6.0, 0.0, 3.0, 12.0] {
            assert!((to_db(from_db(db)) - db).abs() < 1e-4);
        }
    }

    #[test]
    fn known_values() {
        assert!((from_db(0.0) - 1.0).abs() < 1e-6);
        assert!((from_db(-6.0) - 0.5012).abs() < 1e-3);
        assert!((to_db(2.0) - 6.0206).abs() < 1e-3);
    }
}
