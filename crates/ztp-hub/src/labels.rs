//! Labels stamped on everything the applier creates

use std::collections::BTreeMap;

/// Label key marking objects managed by this tool
pub const MANAGED_BY: &str = "ztpfw";

/// The fixed label set merged into every applied object
pub fn managed() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY.to_string(), String::new())])
}
