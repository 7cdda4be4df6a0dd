use crate::domain::DomainError;
use garde::{Report, Validate};

/// Run garde validation and fold the report into a `DomainError::ValidationError`
pub fn validate_struct<T>(value: &T) -> Result<(), DomainError>
where
    T: Validate,
    T::Context: Default,
{
    value
        .validate()
        .map_err(|report| DomainError::ValidationError(describe_report(&report)))
}

/// One `path: message` entry per failed rule, comma-joined
fn describe_report(report: &Report) -> String {
    report
        .iter()
        .map(|(path, error)| match path.to_string() {
            p if p.is_empty() => error.message().to_string(),
            p => format!("{}: {}", p, error.message()),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AlertRecipient;

    #[test]
    fn test_valid_recipient_passes() {
        let recipient = AlertRecipient {
            email: "cold-room@example.com".to_string(),
            enabled: true,
        };
        assert!(validate_struct(&recipient).is_ok());
    }

    #[test]
    fn test_invalid_recipient_names_the_field() {
        let recipient = AlertRecipient {
            email: "cold-room.example.com".to_string(),
            enabled: true,
        };
        match validate_struct(&recipient) {
            Err(DomainError::ValidationError(msg)) => assert!(msg.contains("email")),
            other => panic!("expected ValidationError, got {:?}", other),
        }
    }
}
