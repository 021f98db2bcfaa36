use common::domain::{DomainError, DomainResult};

const READINGS_SUFFIX: &str = "readings";

/// Topic filter matching every device's readings under `prefix`.
pub fn readings_subscription(prefix: &str) -> String {
    format!("{}/+/{}", prefix.trim_end_matches('/'), READINGS_SUFFIX)
}

/// Extract the device id from a topic of the form `{prefix}/{device_id}/readings`.
///
/// ```
/// use ingestion_gateway::mqtt::parse_readings_topic;
///
/// let device_id = parse_readings_topic("carechain/devices", "carechain/devices/pump-7/readings").unwrap();
/// assert_eq!(device_id, "pump-7");
/// ```
pub fn parse_readings_topic(prefix: &str, topic: &str) -> DomainResult<String> {
    let prefix = prefix.trim_end_matches('/');
    let rest = topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| {
            DomainError::ValidationError(format!(
                "topic '{}' is outside prefix '{}'",
                topic, prefix
            ))
        })?;

    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [device_id, suffix] if *suffix == READINGS_SUFFIX => {
            let device_id = device_id.trim();
            if device_id.is_empty() {
                return Err(DomainError::ValidationError(
                    "device id cannot be empty in topic".to_string(),
                ));
            }
            Ok(device_id.to_string())
        }
        _ => Err(DomainError::ValidationError(format!(
            "invalid topic '{}': expected '{}/{{device_id}}/{}'",
            topic, prefix, READINGS_SUFFIX
        ))),
    }
}
