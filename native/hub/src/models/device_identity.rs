use rinf::SignalPiece;
use serde::{Deserialize, Serialize};

/// Placeholder shown for a property the device reports as empty
pub(crate) const UNKNOWN_PROPERTY: &str = "-";

/// Identity of the connected device, read from system properties on connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub struct DeviceIdentity {
    /// `ro.product.manufacturer`
    pub manufacturer: String,
    /// `ro.product.model`
    pub model: String,
    /// `ro.build.version.release`
    pub android_version: String,
    /// `ro.serialno`
    pub serial: String,
}

impl DeviceIdentity {
    /// Builds an identity from raw `getprop` outputs, substituting `-` for blank values.
    pub fn from_properties(
        manufacturer: &str,
        model: &str,
        android_version: &str,
        serial: &str,
    ) -> Self {
        fn property(value: &str) -> String {
            let value = value.trim();
            if value.is_empty() { UNKNOWN_PROPERTY.to_string() } else { value.to_string() }
        }

        Self {
            manufacturer: property(manufacturer),
            model: property(model),
            android_version: property(android_version),
            serial: property(serial),
        }
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({})", self.manufacturer, self.model, self.serial)
    }
}
