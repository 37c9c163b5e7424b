use crate::errors::{Error, Result};
use crate::model::{Numeric, Reading};

/// Validates a decoded reading before it reaches the relay
pub fn validate(reading: &Reading) -> Result<()> {
    if reading.device_id.trim().is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if reading.timestamp < 0 {
        return Err(Error::Validation(format!(
            "Timestamp {} is before the unix epoch",
            reading.timestamp
        )));
    }

    if let Numeric::Float(v) = reading.value {
        if !v.is_finite() {
            return Err(Error::Validation(format!("Value {} is not finite", v)));
        }
    }

    Ok(())
}
