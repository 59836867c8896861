//! Uniform response envelope
//!
//! Every REST response is wrapped as `{success, data?, error?, message?}`.
//! [`Envelope::into_result`] turns that into a plain `Result` so callers
//! never inspect the flag before reading the payload.

use serde::Deserialize;

/// Raw response envelope as sent by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    /// Whether the call succeeded.
    pub success: bool,

    /// Payload on success.
    #[serde(default = "Option::default")]
    pub data: Option<T>,

    /// Machine-readable error on failure.
    #[serde(default)]
    pub error: Option<String>,

    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
}

/// Failure carried by an envelope with `success: false`, or a successful
/// envelope missing its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// `success` was `false`.
    Rejected {
        /// The `error` field, if sent.
        error: Option<String>,
        /// The `message` field, if sent.
        message: Option<String>,
    },
    /// `success` was `true` but `data` was absent.
    MissingData,
}

impl EnvelopeError {
    /// Best available description of the failure.
    pub fn description(&self) -> String {
        match self {
            EnvelopeError::Rejected { error, message } => message
                .clone()
                .or_else(|| error.clone())
                .unwrap_or_else(|| "request failed".to_string()),
            EnvelopeError::MissingData => "response contained no data".to_string(),
        }
    }
}

impl<T> Envelope<T> {
    /// Convert into `Ok(data)` or a typed failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use agrichat::api::Envelope;
    ///
    /// let env: Envelope<u32> =
    ///     serde_json::from_str(r#"{"success":true,"data":7}"#).unwrap();
    /// assert_eq!(env.into_result().unwrap(), 7);
    /// ```
    pub fn into_result(self) -> Result<T, EnvelopeError> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(EnvelopeError::MissingData),
            (false, _) => Err(EnvelopeError::Rejected {
                error: self.error,
                message: self.message,
            }),
        }
    }

    /// Like [`into_result`](Self::into_result) for calls that return no
    /// payload.
    pub fn into_unit(self) -> Result<(), EnvelopeError> {
        if self.success {
            Ok(())
        } else {
            Err(EnvelopeError::Rejected {
                error: self.error,
                message: self.message,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_envelope_is_rejected() {
        let env: Envelope<serde_json::Value> = serde_json::from_str(
            r#"{"success":false,"error":"NOT_FOUND","message":"Conversation not found"}"#,
        )
        .unwrap();
        let err = env.into_result().unwrap_err();
        assert_eq!(err.description(), "Conversation not found");
        assert!(matches!(err, EnvelopeError::Rejected { .. }));
    }

    #[test]
    fn test_success_without_data_is_missing_data() {
        let env: Envelope<String> = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert_eq!(env.into_result().unwrap_err(), EnvelopeError::MissingData);
    }

    #[test]
    fn test_into_unit_accepts_success_without_data() {
        let env: Envelope<serde_json::Value> =
            serde_json::from_str(r#"{"success":true,"message":"deleted"}"#).unwrap();
        assert!(env.into_unit().is_ok());
    }

    #[test]
    fn test_description_falls_back_to_error_code() {
        let err = EnvelopeError::Rejected {
            error: Some("CONFLICT".to_string()),
            message: None,
        };
        assert_eq!(err.description(), "CONFLICT");
    }
}
