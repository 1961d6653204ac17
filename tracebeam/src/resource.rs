//! Process-wide attributes attached to every outgoing payload.

use crate::attributes::{SpanAttributeLimits, SpanAttributes};

/// Attributes describing the emitting process, sent once per payload rather
/// than on every span.
///
/// Values here are SDK- or configuration-controlled, so the store is
/// unlimited; user attribute limits apply to spans only.
#[derive(Clone, Debug)]
pub struct Resource {
    attributes: SpanAttributes,
}

impl Resource {
    pub(crate) fn new(
        release_stage: &str,
        service_name: Option<&str>,
        app_version: Option<&str>,
    ) -> Resource {
        let mut attributes = SpanAttributes::new(SpanAttributeLimits::unlimited());
        attributes.set("telemetry.sdk.name", env!("CARGO_PKG_NAME"));
        attributes.set("telemetry.sdk.version", env!("CARGO_PKG_VERSION"));
        attributes.set("deployment.environment", release_stage.to_owned());
        if let Some(name) = service_name {
            attributes.set("service.name", name.to_owned());
        }
        if let Some(version) = app_version {
            attributes.set("service.version", version.to_owned());
        }
        Resource { attributes }
    }

    /// Record the persisted device identity once the pipeline resolves it.
    pub(crate) fn set_device_id(&mut self, device_id: &str) {
        self.attributes.set("device.id", device_id.to_owned());
    }

    /// The resource attributes, for serialization.
    pub fn attributes(&self) -> &SpanAttributes {
        &self.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Value;

    #[test]
    fn carries_sdk_identity_and_release_stage() {
        let resource = Resource::new("staging", None, None);
        assert_eq!(
            resource.attributes().get("telemetry.sdk.name"),
            Some(&Value::from("tracebeam"))
        );
        assert!(resource.attributes().get("telemetry.sdk.version").is_some());
        assert_eq!(
            resource.attributes().get("deployment.environment"),
            Some(&Value::from("staging".to_owned()))
        );
        assert_eq!(resource.attributes().get("service.name"), None);
    }

    #[test]
    fn optional_service_fields_and_device_id() {
        let mut resource = Resource::new("production", Some("checkout"), Some("5.1.2"));
        resource.set_device_id("ab54363bdcf3c441");

        assert_eq!(
            resource.attributes().get("service.name"),
            Some(&Value::from("checkout".to_owned()))
        );
        assert_eq!(
            resource.attributes().get("service.version"),
            Some(&Value::from("5.1.2".to_owned()))
        );
        assert_eq!(
            resource.attributes().get("device.id"),
            Some(&Value::from("ab54363bdcf3c441".to_owned()))
        );
    }
}
