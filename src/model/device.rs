use std::collections::HashMap;

use crate::model::Value;

/// A known endpoint exposed by a sibling service, keyed by `<service-type>/<id>`.
#[derive(Clone, Debug, Default)]
pub struct Device {
    /// Stable `<service-type>/<id>` identity; survives topic renames.
    pub key: String,
    pub topic: String,
    pub name: String,
    /// endpoint-index -> property name -> value
    pub endpoints: HashMap<u32, HashMap<String, Value>>,
}

impl Device {
    pub fn new(topic: impl Into<String>, name: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            key: topic.clone(),
            topic,
            name: name.into(),
            endpoints: HashMap::new(),
        }
    }

    /// Case-insensitive lookup of `prop` on `endpoint`, falling back to
    /// endpoint 0's `<prop>_<endpoint>` key, as described for the
    /// `{{property|...}}` pattern form.
    pub fn property(&self, endpoint: u32, prop: &str) -> Option<&Value> {
        if let Some(found) = self
            .endpoints
            .get(&endpoint)
            .and_then(|props| find_case_insensitive(props, prop))
        {
            return Some(found);
        }

        let suffixed = format!("{prop}_{endpoint}");
        self.endpoints
            .get(&0)
            .and_then(|props| find_case_insensitive(props, &suffixed))
    }

    pub fn set_property(&mut self, endpoint: u32, prop: impl Into<String>, value: Value) {
        self.endpoints.entry(endpoint).or_default().insert(prop.into(), value);
    }
}

/// Splits an endpoint spec of the form `<service>/<name>[/<index>]` into its
/// device topic and numeric endpoint index (0 when no index segment is
/// present); a spec with exactly two segments never carries an index.
pub fn split_endpoint_spec(endpoint: &str) -> (&str, u32) {
    let segment_count = endpoint.split('/').count();
    if segment_count > 2 {
        if let Some((device_topic, index)) = endpoint.rsplit_once('/') {
            return (device_topic, index.parse().unwrap_or(0));
        }
    }
    (endpoint, 0)
}

fn find_case_insensitive<'a>(
    props: &'a HashMap<String, Value>,
    key: &str,
) -> Option<&'a Value> {
    props
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_endpoint_zero_suffixed_key() {
        let mut device = Device::new("lamp/1", "Lamp");
        device.set_property(0, "brightness_2", Value::Number(42.0));

        assert_eq!(device.property(2, "brightness"), Some(&Value::Number(42.0)));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut device = Device::new("lamp/1", "Lamp");
        device.set_property(0, "Brightness", Value::Number(75.0));

        assert_eq!(device.property(0, "brightness"), Some(&Value::Number(75.0)));
    }
}
