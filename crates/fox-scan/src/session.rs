use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub angle_deg: f64,
    pub power_db: f64,
}

/// Readings of one scan, in sample order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSession {
    id: u64,
    readings: Vec<Reading>,
    peak: Option<Reading>,
}

impl ScanSession {
    pub fn new(id: u64) -> Self {
        Self { id, readings: Vec::new(), peak: None }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn last(&self) -> Option<Reading> {
        self.readings.last().copied()
    }

    /// Strongest reading; on a tie the earliest one stays.
    pub fn peak(&self) -> Option<Reading> {
        self.peak
    }

    pub fn record(&mut self, angle_deg: f64, power_db: f64) {
        let r = Reading { angle_deg, power_db };
        self.readings.push(r);
        // NaN never becomes the peak
        if self.peak.map_or(!power_db.is_nan(), |p| power_db > p.power_db) {
            self.peak = Some(r);
        }
    }
}

/// Heading reached after `elapsed` of a turn that takes `rotation` for a
/// full circle. Assumes the rover turns at a constant rate.
pub fn angle_at(elapsed: Duration, rotation: Duration) -> f64 {
    elapsed.as_secs_f64() / rotation.as_secs_f64() * 360.0
}
