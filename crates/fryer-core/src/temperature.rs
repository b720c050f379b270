use crate::error::ParseError;
use crate::link::SerialLink;
use log::{debug, trace};
use serde::Serialize;

pub const MIN_TEMP_C: f64 = 20.0;
pub const MAX_TEMP_C: f64 = 250.0;

/// Oil temperature in °C, always within [`MIN_TEMP_C`, `MAX_TEMP_C`].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Temperature(f64);

impl Temperature {
    pub fn new(celsius: f64) -> Self {
        Self(clamp_celsius(celsius))
    }

    pub fn celsius(self) -> f64 {
        self.0
    }
}

/// Clamps a raw reading into the safe range. NaN maps to the lower bound.
pub fn clamp_celsius(celsius: f64) -> f64 {
    if celsius.is_nan() {
        MIN_TEMP_C
    } else {
        celsius.clamp(MIN_TEMP_C, MAX_TEMP_C)
    }
}

/// Extracts the first `<number>[ ][°]C` reading from a telemetry line.
pub fn parse_telemetry(line: &str) -> Result<f64, ParseError> {
    let chars: Vec<char> = line.chars().collect();
    let digits_before = |mut idx: usize| {
        while idx > 0 && chars[idx - 1].is_ascii_digit() {
            idx -= 1;
        }
        idx
    };

    for (marker, _) in chars.iter().enumerate().filter(|(_, c)| **c == 'C') {
        let mut end = marker;
        if end > 0 && chars[end - 1] == '°' {
            end -= 1;
        }
        while end > 0 && chars[end - 1].is_whitespace() {
            end -= 1;
        }

        let fraction_start = digits_before(end);
        let mut start = fraction_start;
        if fraction_start > 0 && chars[fraction_start - 1] == '.' {
            let integer_start = digits_before(fraction_start - 1);
            if integer_start < fraction_start - 1 {
                start = integer_start;
            }
        }
        if start == end {
            continue;
        }

        let number: String = chars[start..end].iter().collect();
        if let Ok(value) = number.parse::<f64>() {
            return Ok(value);
        }
    }

    Err(ParseError {
        line: line.to_string(),
    })
}

/// Turns telemetry into the published oil temperature.
///
/// With the link down it synthesizes a slow drift (up while heat is demanded,
/// down otherwise) so consumers always have a plausible value.
#[derive(Debug, Clone)]
pub struct TemperatureReader {
    current: Temperature,
    sim_step_c: f64,
    parse_failures: u64,
}

impl TemperatureReader {
    pub fn new(initial_c: f64, sim_step_c: f64) -> Self {
        Self {
            current: Temperature::new(initial_c),
            sim_step_c,
            parse_failures: 0,
        }
    }

    pub fn current(&self) -> Temperature {
        self.current
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    pub fn poll(&mut self, link: &SerialLink, heating_active: bool) -> Temperature {
        if link.is_connected() {
            if let Some(line) = link.read_line() {
                // Unparseable lines keep the last reading.
                let _ = self.ingest(&line);
            }
        } else {
            self.simulate(heating_active);
        }
        self.current
    }

    pub fn ingest(&mut self, line: &str) -> Result<Temperature, ParseError> {
        match parse_telemetry(line) {
            Ok(celsius) => {
                self.current = Temperature::new(celsius);
                trace!("Parsed temperature {:.1}°C from {:?}", celsius, line);
                Ok(self.current)
            }
            Err(e) => {
                self.parse_failures += 1;
                debug!("{}", e);
                Err(e)
            }
        }
    }

    fn simulate(&mut self, heating_active: bool) {
        let step = if heating_active {
            self.sim_step_c
        } else {
            -self.sim_step_c
        };
        self.current = Temperature::new(self.current.celsius() + step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal_sim::SimulatedFryer;
    use crate::link::LinkConfig;
    use crate::timebase::ManualClock;
    use std::sync::Arc;

    #[test]
    fn parses_common_firmware_formats() {
        assert_eq!(parse_telemetry("Temp: 172.5°C"), Ok(172.5));
        assert_eq!(parse_telemetry("180 C"), Ok(180.0));
        assert_eq!(parse_telemetry("T=99.25C ok"), Ok(99.25));
        assert_eq!(parse_telemetry("12.°C"), Ok(12.0));
    }

    #[test]
    fn skips_markers_without_a_number() {
        assert_eq!(parse_telemetry("ABC then 30°C"), Ok(30.0));
        assert!(parse_telemetry("ERR sensor open").is_err());
        assert!(parse_telemetry("Temp: --°C").is_err());
        assert!(parse_telemetry("").is_err());
    }

    #[test]
    fn clamps_out_of_range_readings() {
        assert_eq!(Temperature::new(400.0).celsius(), MAX_TEMP_C);
        assert_eq!(Temperature::new(-5.0).celsius(), MIN_TEMP_C);
        assert_eq!(Temperature::new(f64::NAN).celsius(), MIN_TEMP_C);
    }

    #[test]
    fn unparseable_line_keeps_previous_reading() {
        let mut reader = TemperatureReader::new(25.0, 0.1);
        reader.ingest("Temp: 150.0°C").unwrap();
        assert!(reader.ingest("garbage").is_err());
        assert_eq!(reader.current().celsius(), 150.0);
        assert_eq!(reader.parse_failures(), 1);
    }

    #[test]
    fn poll_reads_link_when_connected() {
        let clock = Arc::new(ManualClock::new());
        let sim = SimulatedFryer::new(clock.clone()).with_oil_temperature(142.0);
        let link = SerialLink::open(Box::new(sim.clone()), LinkConfig::default(), clock);
        let mut reader = TemperatureReader::new(25.0, 0.1);

        assert_eq!(reader.poll(&link, false).celsius(), 142.0);

        sim.set_garbage_telemetry(true);
        assert_eq!(reader.poll(&link, false).celsius(), 142.0);
    }

    #[test]
    fn poll_simulates_drift_when_disconnected() {
        let clock = Arc::new(ManualClock::new());
        let sim = SimulatedFryer::new(clock.clone());
        sim.set_refuse_open(true);
        let link = SerialLink::open(Box::new(sim), LinkConfig::default(), clock);
        let mut reader = TemperatureReader::new(100.0, 0.5);

        reader.poll(&link, true);
        reader.poll(&link, true);
        assert!((reader.current().celsius() - 101.0).abs() < 1e-9);

        reader.poll(&link, false);
        assert!((reader.current().celsius() - 100.5).abs() < 1e-9);
    }

    #[test]
    fn simulated_drift_stays_in_range() {
        let clock = Arc::new(ManualClock::new());
        let sim = SimulatedFryer::new(clock.clone());
        sim.set_refuse_open(true);
        let link = SerialLink::open(Box::new(sim), LinkConfig::default(), clock);
        let mut reader = TemperatureReader::new(20.05, 0.1);
        for _ in 0..10 {
            reader.poll(&link, false);
        }
        assert_eq!(reader.current().celsius(), MIN_TEMP_C);
    }
}
