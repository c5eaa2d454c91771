use std::cmp::Ordering;

use crate::error::{invalid_argument, ReplicaResult};

/// Latitude and longitude pair stored in a document field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> ReplicaResult<Self> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid_argument(format!(
                "latitude {latitude} is outside [-90, 90]"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid_argument(format!(
                "longitude {longitude} is outside [-180, 180]"
            )));
        }
        Ok(Self { latitude, longitude })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Query ordering: latitude first, then longitude. Coordinates are
    /// range checked, so they are never NaN.
    pub fn compare(&self, other: &GeoPoint) -> Ordering {
        let by = |a: f64, b: f64| a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        by(self.latitude, other.latitude).then_with(|| by(self.longitude, other.longitude))
    }

    pub fn canonical_id(&self) -> String {
        format!("geo({},{})", self.latitude, self.longitude)
    }
}
