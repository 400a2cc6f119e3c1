//! C3 — Property Bag: two independent `string -> string` maps, one for
//! user properties and one for device properties (spec §3).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The device-property key populated from the rules-fetch response's
/// `Country` header, when present (spec §3, §6).
pub const COUNTRY_KEY: &str = "country";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyBag {
    values: HashMap<String, String>,
}

impl PropertyBag {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.values.clone()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

/// Both bags, grouped the way the engine state stores them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    pub user: PropertyBag,
    pub device: PropertyBag,
}

impl Properties {
    /// Populate the `country` device-property from an observed header
    /// value (spec §3, §6). A no-op if `header_value` is `None`.
    pub fn apply_country_header(&mut self, header_value: Option<&str>) {
        if let Some(country) = header_value {
            if !country.is_empty() {
                self.device.set(COUNTRY_KEY, country);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_roundtrip() {
        let mut bag = PropertyBag::default();
        bag.set("role", "beta");
        assert_eq!(bag.get("role"), Some("beta"));
        bag.remove("role");
        assert_eq!(bag.get("role"), None);
    }

    #[test]
    fn user_and_device_bags_are_independent() {
        let mut props = Properties::default();
        props.user.set("role", "beta");
        props.device.set("role", "device-role");
        assert_eq!(props.user.get("role"), Some("beta"));
        assert_eq!(props.device.get("role"), Some("device-role"));
    }

    #[test]
    fn country_header_populates_device_property() {
        let mut props = Properties::default();
        props.apply_country_header(Some("DE"));
        assert_eq!(props.device.get(COUNTRY_KEY), Some("DE"));
    }

    #[test]
    fn absent_country_header_is_noop() {
        let mut props = Properties::default();
        props.apply_country_header(None);
        assert_eq!(props.device.get(COUNTRY_KEY), None);
    }
}
