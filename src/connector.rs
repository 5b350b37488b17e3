use std::path::Path;

use nusb::{DeviceInfo, Speed};

use crate::device::{DeviceError, DslDevice};
use crate::profile::{find_profile, DeviceProfile};
use crate::usb_transport::{NusbTransport, TransportError};

#[derive(Debug, Clone)]
pub struct DslDeviceInfo {
    pub model: &'static str,
    pub bus: u8,
    pub address: u8,
    pub pid: u16,
    pub profile: &'static DeviceProfile,
    info: DeviceInfo,
}

impl DslDeviceInfo {
    /// `bus:address`, the way the device is addressed on the command line.
    pub fn location(&self) -> String {
        format!("{:03}:{:03}", self.bus, self.address)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("No DSLogic/DSCope device {name} found. Please connect one or specify its location")]
    DeviceNotFound { name: String },

    #[error("No supported device at {location}")]
    InvalidLocation { location: String },
}

pub struct DslConnector;

impl DslConnector {
    /// Open and initialise a device.
    ///
    /// `model` narrows discovery to one model name, `location` picks a
    /// device by `bus:address`. Firmware and bitstreams are loaded from
    /// `resources`.
    pub fn connect(
        model: Option<&str>,
        location: Option<&str>,
        resources: &Path,
    ) -> Result<DslDevice<NusbTransport>, ConnectorError> {
        let devices = Self::get_available_devices(model)?;
        let found = match location {
            Some(location) => devices
                .into_iter()
                .find(|d| d.location() == location)
                .ok_or_else(|| ConnectorError::InvalidLocation {
                    location: location.to_string(),
                })?,
            None => devices.into_iter().next().ok_or_else(|| ConnectorError::DeviceNotFound {
                name: model.unwrap_or("").to_string(),
            })?,
        };

        log::debug!("Connecting to {} at {}", found.model, found.location());
        let transport = NusbTransport::open(&found.info)?;
        let mut device = DslDevice::with_resources(transport, found.profile, resources);
        device.open()?;
        Ok(device)
    }

    /// Profile of a USB device, if it is one we drive and matches `name`.
    fn validate_device(name: Option<&str>, info: &DeviceInfo) -> Option<&'static DeviceProfile> {
        let super_speed = matches!(info.speed(), Some(Speed::Super | Speed::SuperPlus));
        let profile = find_profile(info.vendor_id(), info.product_id(), super_speed)?;
        Self::matches_name(name, profile).then_some(profile)
    }

    /// A name matches every model it is a prefix of, so "DSCope" covers the
    /// whole family.
    fn matches_name(name: Option<&str>, profile: &DeviceProfile) -> bool {
        name.is_none_or(|n| {
            profile
                .model
                .get(..n.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(n))
        })
    }

    /// All supported devices currently attached.
    pub fn get_available_devices(name: Option<&str>) -> Result<Vec<DslDeviceInfo>, ConnectorError> {
        let devices = nusb::list_devices()?
            .filter_map(|info| {
                let profile = Self::validate_device(name, &info)?;
                Some(DslDeviceInfo {
                    model: profile.model,
                    bus: info.bus_number(),
                    address: info.device_address(),
                    pid: profile.pid,
                    profile,
                    info,
                })
            })
            .collect::<Vec<_>>();
        log::debug!("Found {} supported device(s)", devices.len());
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DSL_VID;

    #[test]
    fn test_get_available_devices() {
        // Depends on what is plugged in; without USB access only IO errors
        // are acceptable.
        match DslConnector::get_available_devices(None) {
            Ok(devices) => {
                for device in devices {
                    assert!(!device.model.is_empty());
                    assert_eq!(device.location().len(), 7);
                }
            }
            Err(err) => assert!(matches!(err, ConnectorError::Io(_))),
        }
    }

    #[test]
    fn test_model_filter() {
        let profile = find_profile(DSL_VID, 0x0003, false).unwrap();
        assert!(DslConnector::matches_name(None, profile));
        assert!(DslConnector::matches_name(Some("dslogic pro"), profile));
        assert!(DslConnector::matches_name(Some("DSLogic"), profile));
        assert!(!DslConnector::matches_name(Some("DSCope"), profile));
        assert!(!DslConnector::matches_name(Some("DSLogic Pro 2"), profile));
    }
}
