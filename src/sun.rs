//! Sunrise/sunset calculation, an out-of-scope external collaborator behind
//! a narrow trait (spec §1). No example in the pack computes solar
//! position, so the dedicated `sunrise` crate is used directly rather than
//! hand-rolling the astronomical formula.

use chrono::{DateTime, NaiveDate, Utc};
use sunrise::{Coordinates, SolarDay, SolarEvent};

pub trait SunCalculator: Send + Sync {
    fn sunrise(&self, date: NaiveDate) -> DateTime<Utc>;
    fn sunset(&self, date: NaiveDate) -> DateTime<Utc>;
}

pub struct SolarPosition {
    coordinates: Coordinates,
}

impl SolarPosition {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        let coordinates = Coordinates::new(latitude, longitude)
            .unwrap_or_else(|| Coordinates::new(0.0, 0.0).expect("0,0 is always valid"));
        Self { coordinates }
    }
}

impl SunCalculator for SolarPosition {
    fn sunrise(&self, date: NaiveDate) -> DateTime<Utc> {
        SolarDay::new(self.coordinates, date).event_time(SolarEvent::Sunrise)
    }

    fn sunset(&self, date: NaiveDate) -> DateTime<Utc> {
        SolarDay::new(self.coordinates, date).event_time(SolarEvent::Sunset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sunrise_precedes_sunset() {
        let calc = SolarPosition::new(52.52, 13.405);
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        assert!(calc.sunrise(date) < calc.sunset(date));
    }
}
