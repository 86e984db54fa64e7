//! Aggregate statistics over a device's readings.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::Reading;

/// Minimum, maximum and mean of one numeric field.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

/// Statistics computed over every stored reading of one device.
///
/// A device with no data yields `count == 0` and `None` for every field.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceStats {
    pub device_addr: String,
    pub count: u64,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub first_timestamp: Option<OffsetDateTime>,
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339::option"))]
    pub last_timestamp: Option<OffsetDateTime>,
    pub temp_c: Option<FieldStats>,
    pub temp_f: Option<FieldStats>,
    pub humidity: Option<FieldStats>,
    pub battery: Option<FieldStats>,
    pub rssi: Option<FieldStats>,
    pub dew_point_c: Option<FieldStats>,
    pub abs_humidity: Option<FieldStats>,
    pub steam_pressure: Option<FieldStats>,
}

impl DeviceStats {
    /// Zero-count stats for a device without data.
    pub fn empty(device_addr: impl Into<String>) -> Self {
        Self {
            device_addr: device_addr.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Running {
    min: f64,
    max: f64,
    sum: f64,
}

impl Running {
    fn new(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
        }
    }

    fn push(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
    }

    fn finish(self, count: u64) -> FieldStats {
        FieldStats {
            min: self.min,
            max: self.max,
            avg: self.sum / count as f64,
        }
    }
}

const FIELDS: usize = 8;

/// Folds readings into [`DeviceStats`] in a single pass.
///
/// ```
/// use hygro_types::{Reading, StatsAccumulator};
/// use time::macros::datetime;
///
/// let mut acc = StatsAccumulator::new("AA:BB");
/// acc.push(&Reading::new("AA:BB", datetime!(2024-01-01 00:00 UTC), 20.0, 40.0));
/// acc.push(&Reading::new("AA:BB", datetime!(2024-01-01 01:00 UTC), 22.0, 50.0));
/// let stats = acc.finish();
///
/// assert_eq!(stats.count, 2);
/// assert_eq!(stats.temp_c.unwrap().avg, 21.0);
/// ```
#[derive(Debug, Clone)]
pub struct StatsAccumulator {
    device_addr: String,
    count: u64,
    first: Option<OffsetDateTime>,
    last: Option<OffsetDateTime>,
    fields: Option<[Running; FIELDS]>,
}

impl StatsAccumulator {
    pub fn new(device_addr: impl Into<String>) -> Self {
        Self {
            device_addr: device_addr.into(),
            count: 0,
            first: None,
            last: None,
            fields: None,
        }
    }

    pub fn push(&mut self, reading: &Reading) {
        let values = [
            reading.temp_c,
            reading.temp_f,
            reading.humidity,
            f64::from(reading.battery),
            f64::from(reading.rssi),
            reading.dew_point_c,
            reading.abs_humidity,
            reading.steam_pressure,
        ];

        match &mut self.fields {
            Some(fields) => {
                for (field, value) in fields.iter_mut().zip(values) {
                    field.push(value);
                }
            }
            None => self.fields = Some(values.map(Running::new)),
        }

        self.count += 1;
        self.first = Some(self.first.map_or(reading.timestamp, |t| t.min(reading.timestamp)));
        self.last = Some(self.last.map_or(reading.timestamp, |t| t.max(reading.timestamp)));
    }

    pub fn finish(self) -> DeviceStats {
        let Some(fields) = self.fields else {
            return DeviceStats::empty(self.device_addr);
        };
        let [temp_c, temp_f, humidity, battery, rssi, dew_point_c, abs_humidity, steam_pressure] =
            fields.map(|f| Some(f.finish(self.count)));

        DeviceStats {
            device_addr: self.device_addr,
            count: self.count,
            first_timestamp: self.first,
            last_timestamp: self.last,
            temp_c,
            temp_f,
            humidity,
            battery,
            rssi,
            dew_point_c,
            abs_humidity,
            steam_pressure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_empty_accumulator() {
        let stats = StatsAccumulator::new("AA").finish();
        assert_eq!(stats, DeviceStats::empty("AA"));
        assert_eq!(stats.count, 0);
        assert!(stats.temp_c.is_none());
        assert!(stats.first_timestamp.is_none());
    }

    #[test]
    fn test_min_max_avg() {
        let mut acc = StatsAccumulator::new("AA");
        for (i, temp) in [18.0, 24.0, 21.0].into_iter().enumerate() {
            let ts = datetime!(2024-01-01 00:00 UTC) + time::Duration::hours(i as i64);
            acc.push(
                &Reading::new("AA", ts, temp, 50.0)
                    .with_battery(80 + i as u8)
                    .with_rssi(-60 - i as i16),
            );
        }
        let stats = acc.finish();
        let temp = stats.temp_c.unwrap();
        assert_eq!(temp.min, 18.0);
        assert_eq!(temp.max, 24.0);
        assert_eq!(temp.avg, 21.0);
        let battery = stats.battery.unwrap();
        assert_eq!(battery.min, 80.0);
        assert_eq!(battery.max, 82.0);
        assert_eq!(stats.rssi.unwrap().min, -62.0);
    }

    #[test]
    fn test_first_last_independent_of_order() {
        let mut acc = StatsAccumulator::new("AA");
        acc.push(&Reading::new("AA", datetime!(2024-02-01 00:00 UTC), 20.0, 50.0));
        acc.push(&Reading::new("AA", datetime!(2024-01-01 00:00 UTC), 20.0, 50.0));
        acc.push(&Reading::new("AA", datetime!(2024-03-01 00:00 UTC), 20.0, 50.0));
        let stats = acc.finish();
        assert_eq!(stats.first_timestamp, Some(datetime!(2024-01-01 00:00 UTC)));
        assert_eq!(stats.last_timestamp, Some(datetime!(2024-03-01 00:00 UTC)));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::datetime;

    proptest! {
        /// The mean always lies between the minimum and the maximum.
        #[test]
        fn avg_between_min_and_max(temps in proptest::collection::vec(-40.0f64..60.0, 1..50)) {
            let mut acc = StatsAccumulator::new("AA");
            for (i, temp) in temps.iter().enumerate() {
                let ts = datetime!(2024-01-01 00:00 UTC) + time::Duration::minutes(i as i64);
                acc.push(&Reading::new("AA", ts, *temp, 50.0));
            }
            let stats = acc.finish();
            let temp = stats.temp_c.unwrap();
            prop_assert_eq!(stats.count, temps.len() as u64);
            prop_assert!(temp.min <= temp.avg + 1e-9);
            prop_assert!(temp.avg <= temp.max + 1e-9);
        }
    }
}
