//! Core reading type for temperature and humidity sensors.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Magnus coefficient `a` (dimensionless).
const MAGNUS_A: f64 = 17.62;
/// Magnus coefficient `b` in °C.
const MAGNUS_B: f64 = 243.12;
/// Saturation vapour pressure at 0 °C in hPa.
const MAGNUS_C: f64 = 6.112;

/// Lowest relative humidity used for dew point math; `ln(0)` is undefined.
const MIN_HUMIDITY: f64 = 0.01;

/// One immutable measurement from a sensor.
///
/// Readings are write-once: storage backends never mutate a stored reading.
/// Ordering for queries is `(device_addr, timestamp)`.
///
/// The derived fields (`temp_f`, `dew_point_c`, `abs_humidity`,
/// `steam_pressure`) are computed by [`Reading::new`] from `temp_c` and
/// `humidity` and persisted alongside the raw values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// Stable identity of the device (usually a MAC address).
    pub device_addr: String,
    /// Advertised device name.
    pub device_name: String,
    /// Event time of the measurement.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Temperature in degrees Celsius.
    pub temp_c: f64,
    /// Temperature in degrees Fahrenheit.
    pub temp_f: f64,
    /// Relative humidity percentage (0-100).
    pub humidity: f64,
    /// Battery level percentage (0-100).
    pub battery: u8,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Identifier of the collector that received the reading.
    pub client_id: String,
    /// Dew point in degrees Celsius.
    pub dew_point_c: f64,
    /// Absolute humidity in g/m³.
    pub abs_humidity: f64,
    /// Partial water vapour pressure in hPa.
    pub steam_pressure: f64,
}

impl Reading {
    /// Create a reading and compute its derived fields.
    ///
    /// Name, battery, RSSI and client id start empty/zero; set them with the
    /// `with_*` methods.
    ///
    /// # Examples
    ///
    /// ```
    /// use hygro_types::Reading;
    /// use time::macros::datetime;
    ///
    /// let reading = Reading::new("A4:C1:38:00:11:22", datetime!(2024-05-01 12:00 UTC), 20.0, 50.0)
    ///     .with_name("GVH5075_1122")
    ///     .with_battery(87);
    ///
    /// assert_eq!(reading.temp_f, 68.0);
    /// assert!((reading.dew_point_c - 9.26).abs() < 0.05);
    /// ```
    #[must_use]
    pub fn new(
        device_addr: impl Into<String>,
        timestamp: OffsetDateTime,
        temp_c: f64,
        humidity: f64,
    ) -> Self {
        let steam_pressure = vapour_pressure(temp_c, humidity);
        Self {
            device_addr: device_addr.into(),
            device_name: String::new(),
            timestamp,
            temp_c,
            temp_f: celsius_to_fahrenheit(temp_c),
            humidity,
            battery: 0,
            rssi: 0,
            client_id: String::new(),
            dew_point_c: dew_point(temp_c, humidity),
            abs_humidity: absolute_humidity(temp_c, steam_pressure),
            steam_pressure,
        }
    }

    /// Set the advertised device name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the battery level.
    #[must_use]
    pub fn with_battery(mut self, battery: u8) -> Self {
        self.battery = battery;
        self
    }

    /// Set the signal strength.
    #[must_use]
    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = rssi;
        self
    }

    /// Set the collector identifier.
    #[must_use]
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Key that identifies a reading across backends.
    ///
    /// Two readings with the same identity are treated as the same fact:
    /// queries return one of them and migration skips the second.
    pub fn identity(&self) -> (&str, OffsetDateTime, &str) {
        (&self.device_addr, self.timestamp, &self.client_id)
    }
}

/// Convert Celsius to Fahrenheit.
#[must_use]
pub fn celsius_to_fahrenheit(temp_c: f64) -> f64 {
    temp_c * 9.0 / 5.0 + 32.0
}

/// Saturation vapour pressure over water in hPa (Magnus formula).
#[must_use]
pub fn saturation_vapour_pressure(temp_c: f64) -> f64 {
    MAGNUS_C * ((MAGNUS_A * temp_c) / (MAGNUS_B + temp_c)).exp()
}

/// Actual vapour pressure in hPa for a relative humidity.
#[must_use]
pub fn vapour_pressure(temp_c: f64, humidity: f64) -> f64 {
    saturation_vapour_pressure(temp_c) * humidity / 100.0
}

/// Dew point in °C.
#[must_use]
pub fn dew_point(temp_c: f64, humidity: f64) -> f64 {
    let rh = humidity.clamp(MIN_HUMIDITY, 100.0);
    let gamma = (rh / 100.0).ln() + (MAGNUS_A * temp_c) / (MAGNUS_B + temp_c);
    MAGNUS_B * gamma / (MAGNUS_A - gamma)
}

/// Absolute humidity in g/m³ from temperature and vapour pressure in hPa.
#[must_use]
pub fn absolute_humidity(temp_c: f64, vapour_pressure_hpa: f64) -> f64 {
    216.7 * vapour_pressure_hpa / (273.15 + temp_c)
}
