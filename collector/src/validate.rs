use crate::errors::{Error, Result};
use crate::model::{NewDevice, NewReading, NewUser};

const NAME_MAX_LEN: usize = 255;

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Validation(format!("{} name cannot be empty", kind)));
    }

    if name.chars().count() > NAME_MAX_LEN {
        return Err(Error::Validation(format!(
            "{} name longer than {} characters",
            kind, NAME_MAX_LEN
        )));
    }

    Ok(())
}

pub fn validate_user(user: &NewUser) -> Result<()> {
    validate_name("User", &user.name)
}

pub fn validate_device(device: &NewDevice) -> Result<()> {
    validate_name("Device", &device.name)
}

/// Validates a reading before it is stored
pub fn validate_reading(reading: &NewReading) -> Result<()> {
    for (axis, value) in [("x", reading.x), ("y", reading.y), ("z", reading.z)] {
        if !value.is_finite() {
            return Err(Error::Validation(format!(
                "Axis {} value {} is not a finite number",
                axis, value
            )));
        }
    }

    Ok(())
}
