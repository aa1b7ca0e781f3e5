use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

pub const MIN_TEMPERATURE: i32 = 0;
pub const MAX_TEMPERATURE: i32 = 40;

/// One reading, as published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    #[serde(serialize_with = "serialize_number")]
    pub temperature: f64,
    pub timestamp: DateTime<Utc>,
}

impl TelemetrySample {
    pub fn new(temperature: f64, timestamp: DateTime<Utc>) -> Self {
        TelemetrySample {
            temperature,
            timestamp,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

// Whole numbers go out as `17`, not `17.0`.
fn serialize_number<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// Steps one degree at a time from 0 up to 40 and back down, forever.
#[derive(Clone, Debug)]
pub struct TriangleWave {
    value: i32,
    ascending: bool,
}

impl Default for TriangleWave {
    fn default() -> Self {
        TriangleWave {
            value: MIN_TEMPERATURE,
            ascending: true,
        }
    }
}

impl TriangleWave {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> f64 {
        f64::from(self.value)
    }

    pub fn advance(&mut self) {
        if self.ascending {
            self.value += 1;
            if self.value >= MAX_TEMPERATURE {
                self.ascending = false;
            }
        } else {
            self.value -= 1;
            if self.value <= MIN_TEMPERATURE {
                self.ascending = true;
            }
        }
    }
}

impl Iterator for TriangleWave {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let current = self.current();
        self.advance();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_wave_first_period() {
        let values: Vec<f64> = TriangleWave::new().take(81).collect();
        let expected: Vec<f64> = (0..=40i32).chain((0..40i32).rev()).map(f64::from).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_wave_is_periodic_and_bounded() {
        let values: Vec<f64> = TriangleWave::new().take(80 * 5 + 1).collect();
        for (i, value) in values.iter().enumerate() {
            assert!((0.0..=40.0).contains(value), "value {value} at {i}");
            if i >= 80 {
                assert_eq!(*value, values[i - 80], "period broken at {i}");
            }
        }
        assert_eq!(values[40], 40.0);
        assert_eq!(values[80], 0.0);
        assert_eq!(values[81], 1.0);
    }

    #[test]
    fn test_sample_serializes_whole_temperature_as_integer() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let sample = TelemetrySample::new(17.0, timestamp);

        let json = String::from_utf8(sample.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"temperature":17,"timestamp":"2024-05-01T12:30:00Z"}"#
        );

        let parsed: TelemetrySample = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sample);
    }

    #[test]
    fn test_sample_keeps_fractional_temperature() {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let value = serde_json::to_value(TelemetrySample::new(21.5, timestamp)).unwrap();
        assert_eq!(value["temperature"], serde_json::json!(21.5));
    }
}
