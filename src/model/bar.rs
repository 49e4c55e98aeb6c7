use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct OhlcvBar {
    pub time: i64, // Unix seconds
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl OhlcvBar {
    /// Build a bar from a `[time, open, high, low, close, volume]` tuple.
    ///
    /// Returns `None` unless all six entries are finite numbers.
    pub fn from_tuple(values: &[Value]) -> Option<Self> {
        if values.len() != 6 {
            return None;
        }
        let mut nums = [0.0f64; 6];
        for (slot, v) in nums.iter_mut().zip(values) {
            let n = v.as_f64()?;
            if !n.is_finite() {
                return None;
            }
            *slot = n;
        }
        Some(Self {
            time: nums[0] as i64,
            open: nums[1],
            high: nums[2],
            low: nums[3],
            close: nums[4],
            volume: nums[5],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_tuple() {
        let v = json!([1700000000.0, 1.0, 2.0, 0.5, 1.5, 1000]);
        let bar = OhlcvBar::from_tuple(v.as_array().unwrap()).unwrap();
        assert_eq!(bar.time, 1700000000);
        assert_eq!(bar.volume, 1000.0);
    }

    #[test]
    fn test_rejects_invalid() {
        let short = json!([1700000000, 1.0, 2.0, 0.5, 1.5]);
        assert!(OhlcvBar::from_tuple(short.as_array().unwrap()).is_none());

        let non_numeric = json!([1700000000, 1.0, "x", 0.5, 1.5, 10]);
        assert!(OhlcvBar::from_tuple(non_numeric.as_array().unwrap()).is_none());

        let null_volume = json!([1700000000, 1.0, 2.0, 0.5, 1.5, null]);
        assert!(OhlcvBar::from_tuple(null_volume.as_array().unwrap()).is_none());
    }
}
