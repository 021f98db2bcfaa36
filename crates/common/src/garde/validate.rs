use crate::domain::DomainError;
use garde::{Report, Validate};

/// Run garde validation and fold every violation into one `ValidationError`.
pub fn validate_struct<T>(value: &T) -> Result<(), DomainError>
where
    T: Validate,
    T::Context: Default,
{
    value
        .validate()
        .map_err(|report| DomainError::ValidationError(describe(&report)))
}

/// `path: message` pairs joined by `; `, root-level errors without a path.
fn describe(report: &Report) -> String {
    let mut messages: Vec<String> = report
        .iter()
        .map(|(path, error)| {
            let path = path.to_string();
            if path.is_empty() {
                error.message().to_string()
            } else {
                format!("{}: {}", path, error.message())
            }
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Validate)]
    struct DevicePayload {
        #[garde(length(min = 1, max = 16))]
        device_id: String,
        #[garde(range(min = 0.0, max = 1.0))]
        quality_score: f64,
    }

    #[test]
    fn test_valid_payload_passes() {
        let payload = DevicePayload {
            device_id: "dev-1".to_string(),
            quality_score: 0.5,
        };
        assert!(validate_struct(&payload).is_ok());
    }

    #[test]
    fn test_every_violation_is_reported() {
        let payload = DevicePayload {
            device_id: String::new(),
            quality_score: 1.5,
        };

        match validate_struct(&payload) {
            Err(DomainError::ValidationError(msg)) => {
                assert!(msg.contains("device_id"));
                assert!(msg.contains("quality_score"));
            }
            other => panic!("expected ValidationError, got {:?}", other),
        }
    }
}
