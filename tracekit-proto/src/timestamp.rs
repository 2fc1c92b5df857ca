//! Conversions between [`SystemTime`] and protobuf timestamps.

use prost_types::{Timestamp, TimestampError};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn from_system_time(t: SystemTime) -> Timestamp {
    Timestamp::from(t)
}

/// A missing timestamp decodes as the Unix epoch, matching the zero value
/// spans are stored with when a peer omits the field.
pub fn to_system_time(ts: Option<&Timestamp>) -> Result<SystemTime, TimestampError> {
    match ts {
        None => Ok(UNIX_EPOCH),
        Some(ts) => SystemTime::try_from(ts.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn round_trips() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let ts = from_system_time(t);
        assert_eq!(to_system_time(Some(&ts)).unwrap(), t);
    }

    #[test]
    fn missing_timestamps_decode_as_the_epoch() {
        assert_eq!(to_system_time(None).unwrap(), UNIX_EPOCH);
    }
}
