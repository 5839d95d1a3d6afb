//! Component descriptors.
//!
//! A [`Descriptor`] names one component: device, package, module, and
//! component name. Records on both sides of the broker are keyed by the
//! canonical string form ([`Descriptor::uri`]). Singleton lookups
//! additionally match with the module segment normalized away, because a
//! caller usually omits the module while the stored record carries it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one component within the framework.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    /// Device the component lives on. Empty means the local device.
    #[serde(default)]
    pub device_id: String,

    /// Owning package. Must be non-empty for an active call.
    pub package: String,

    /// Module within the package. May be empty; normalized away for
    /// singleton lookups.
    #[serde(default)]
    pub module: String,

    /// Component name. Must be non-empty for an active call.
    pub component: String,
}

impl Descriptor {
    /// Creates a descriptor from its four parts.
    pub fn new(
        device_id: impl Into<String>,
        package: impl Into<String>,
        module: impl Into<String>,
        component: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            package: package.into(),
            module: module.into(),
            component: component.into(),
        }
    }

    /// Creates a local-device descriptor with no module segment.
    pub fn local(package: impl Into<String>, component: impl Into<String>) -> Self {
        Self::new("", package, "", component)
    }

    /// Returns whether this descriptor may be used for an active call.
    ///
    /// Package and component must both be non-empty; device and module are
    /// optional.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.package.is_empty() && !self.component.is_empty()
    }

    /// Canonical string key: `device/package/module/component`.
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.device_id, self.package, self.module, self.component
        )
    }

    /// Canonical key with the module segment cleared.
    ///
    /// Stored singleton records may carry a module the caller's descriptor
    /// does not; comparing the stored key in this form lets the two match.
    #[must_use]
    pub fn uri_without_module(&self) -> String {
        format!("{}/{}//{}", self.device_id, self.package, self.component)
    }

    /// Returns whether `self` (a stored key) matches a query descriptor,
    /// treating a missing module on the query side as a wildcard.
    #[must_use]
    pub fn matches_query(&self, query: &Self) -> bool {
        let query_uri = query.uri();
        self.uri() == query_uri || self.uri_without_module() == query_uri
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}
