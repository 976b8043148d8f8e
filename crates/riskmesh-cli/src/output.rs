use serde::Serialize;
use serde_json::Value;

use riskmesh_core::{AllSourcesExhausted, ProviderFailure, ProviderId};

use crate::error::CliError;
use crate::metadata::Metadata;

/// Structured error entry in the output envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvelopeError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl EnvelopeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            source: None,
            retryable: None,
        }
    }
}

impl From<&ProviderFailure> for EnvelopeError {
    fn from(failure: &ProviderFailure) -> Self {
        Self {
            code: failure.code.to_owned(),
            message: failure.message.clone(),
            source: Some(failure.provider.clone()),
            retryable: Some(failure.retryable),
        }
    }
}

impl From<&AllSourcesExhausted> for EnvelopeError {
    fn from(failure: &AllSourcesExhausted) -> Self {
        Self {
            code: failure.code().to_owned(),
            message: failure.to_string(),
            source: None,
            retryable: Some(true),
        }
    }
}

/// `{meta, data, errors}` document written to stdout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub meta: Metadata,
    pub data: Value,
    pub errors: Vec<EnvelopeError>,
}

pub fn render(envelope: &Envelope, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(envelope)?
    } else {
        serde_json::to_string(envelope)?
    };
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::RequestId;

    #[test]
    fn envelope_has_meta_data_and_errors() {
        let envelope = Envelope {
            meta: Metadata::new(RequestId::new_v4(), vec![String::from("cache")], 1, true),
            data: serde_json::json!({"magnitude": 4.2}),
            errors: vec![EnvelopeError::new("source.transient", "upstream timed out")],
        };

        let value = serde_json::to_value(&envelope).expect("serializable");
        assert_eq!(value["meta"]["cache_hit"], true);
        assert_eq!(value["data"]["magnitude"], 4.2);
        assert_eq!(value["errors"][0]["code"], "source.transient");
        assert!(value["errors"][0].get("source").is_none());
    }
}
