//! Single-target driver location subscription decision core.
//!
//! The runtime owns the actual inactivity timer; this type holds the state
//! and decides when an arrival alert fires. The alert is a once-per
//! continuous-activity-burst guarantee: the notified flag is only cleared
//! when the push stream goes silent past the inactivity window, never by
//! the ETA rising back above the threshold.

use crate::types::GeoPoint;

/// Silence window after which the arrival flag re-arms.
pub const DEFAULT_INACTIVITY_WINDOW_MS: u64 = 120_000;
/// ETA threshold (minutes) below which the arrival alert fires.
pub const DEFAULT_ARRIVAL_ETA_THRESHOLD: u32 = 5;

/// Decision taken for one location/ETA push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverPushOutcome {
    /// Fire the arrival alert for this push.
    pub notify_arrival: bool,
}

/// State of the single active driver subscription.
#[derive(Debug, Clone)]
pub struct DriverWatch {
    driver_id: String,
    arrival_eta_threshold: u32,
    last_location: Option<GeoPoint>,
    eta_minutes: Option<u32>,
    last_activity_ms: u64,
    has_notified_arrival: bool,
}

impl DriverWatch {
    pub fn new(driver_id: impl Into<String>, arrival_eta_threshold: u32) -> Self {
        Self {
            driver_id: driver_id.into(),
            arrival_eta_threshold,
            last_location: None,
            eta_minutes: None,
            last_activity_ms: 0,
            has_notified_arrival: false,
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver_id
    }

    pub fn last_location(&self) -> Option<GeoPoint> {
        self.last_location
    }

    pub fn eta_minutes(&self) -> Option<u32> {
        self.eta_minutes
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms
    }

    pub fn has_notified_arrival(&self) -> bool {
        self.has_notified_arrival
    }

    /// Apply one push and decide whether the arrival alert fires.
    pub fn on_push(&mut self, location: GeoPoint, eta_minutes: u32, now_ms: u64) -> DriverPushOutcome {
        self.last_location = Some(location);
        self.eta_minutes = Some(eta_minutes);
        self.last_activity_ms = now_ms;

        let notify_arrival =
            eta_minutes < self.arrival_eta_threshold && !self.has_notified_arrival;
        if notify_arrival {
            self.has_notified_arrival = true;
        }

        DriverPushOutcome { notify_arrival }
    }

    /// Inactivity window elapsed with no pushes: re-arm the arrival alert.
    pub fn on_inactive(&mut self) {
        self.has_notified_arrival = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> GeoPoint {
        GeoPoint { lat: 52.1, lng: 4.3 }
    }

    #[test]
    fn fires_once_per_activity_burst() {
        // Scenario: eta 6, then 4 (notify), then 3 (no second notify);
        // after 125s of silence a push with eta 4 notifies again.
        let mut watch = DriverWatch::new("D1", DEFAULT_ARRIVAL_ETA_THRESHOLD);

        assert!(!watch.on_push(point(), 6, 0).notify_arrival);
        assert!(watch.on_push(point(), 4, 5_000).notify_arrival);
        assert!(!watch.on_push(point(), 3, 10_000).notify_arrival);

        watch.on_inactive();
        assert!(watch.on_push(point(), 4, 135_000).notify_arrival);
    }

    #[test]
    fn eta_rising_does_not_rearm_the_alert() {
        let mut watch = DriverWatch::new("D1", 5);
        assert!(watch.on_push(point(), 4, 0).notify_arrival);
        assert!(!watch.on_push(point(), 9, 1_000).notify_arrival);
        assert!(!watch.on_push(point(), 2, 2_000).notify_arrival);
    }

    #[test]
    fn tracks_latest_location_and_activity() {
        let mut watch = DriverWatch::new("D1", 5);
        watch.on_push(GeoPoint { lat: 1.0, lng: 2.0 }, 7, 42);

        assert_eq!(watch.eta_minutes(), Some(7));
        assert_eq!(watch.last_activity_ms(), 42);
        assert!(!watch.has_notified_arrival());
        let location = watch.last_location().expect("location recorded");
        assert_eq!(location.lat, 1.0);
        assert_eq!(location.lng, 2.0);
    }
}
