//! Wire messages of the service protocol.
//!
//! Every publication travels as a [`ServiceMsg`] envelope (`{"data": ...}`). Call arguments
//! travel as a JSON array when given as a tuple, results as plain JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Envelope of every published message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceMsg<T> {
    /// Message payload.
    pub data: T,
}

/// Published once by a server when its registration completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMsg {
    /// Heartbeat period of the server, in milliseconds.
    pub alive_period_ms: u64,
}

/// Heartbeat published periodically by a server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliveMsg {
    /// Heartbeat period of the server, in milliseconds.
    pub alive_period_ms: u64,
}

/// Published by a server on `error.runtime` when a call handler fails.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeErrorMsg {
    /// Procedure whose handler failed.
    pub uri: String,
    /// Handler error text.
    pub error: String,
}

/// Connection state delivered to connection observers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConnectionMsg {
    /// True while the service is connected.
    pub connected: bool,
}

/// Result of an asynchronous call.
///
/// Exactly one of `error` / `result` is set.
#[derive(Clone, Debug, PartialEq)]
pub struct CallResult<T> {
    /// Failure of the call.
    pub error: Option<ServiceError>,
    /// Value returned by the handler.
    pub result: Option<T>,
}

impl<T> CallResult<T> {
    pub(crate) fn ok(value: T) -> Self {
        Self {
            error: None,
            result: Some(value),
        }
    }

    pub(crate) fn err(error: ServiceError) -> Self {
        Self {
            error: Some(error),
            result: None,
        }
    }

    /// True if the call succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Converts into a `Result`.
    pub fn into_result(self) -> Result<T, ServiceError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(value)) => Ok(value),
            (None, None) => Err(ServiceError::Codec {
                error: "call completed without a result".to_string(),
            }),
        }
    }
}

pub(crate) fn encode_event<T: Serialize>(data: &T) -> Result<String, ServiceError> {
    Ok(serde_json::to_string(&ServiceMsg { data })?)
}

pub(crate) fn decode_event<T: DeserializeOwned>(text: &str) -> Result<T, ServiceError> {
    Ok(serde_json::from_str::<ServiceMsg<T>>(text)?.data)
}

pub(crate) fn encode_args<A: Serialize + ?Sized>(args: &A) -> Result<String, ServiceError> {
    Ok(serde_json::to_string(args)?)
}

pub(crate) fn decode_result<R: DeserializeOwned>(text: &str) -> Result<R, ServiceError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope() {
        let text = encode_event(&AliveMsg {
            alive_period_ms: 100,
        })
        .unwrap();
        assert_eq!(text, r#"{"data":{"alive_period_ms":100}}"#);
        let back: AliveMsg = decode_event(&text).unwrap();
        assert_eq!(back.alive_period_ms, 100);
    }

    #[test]
    fn test_tuple_args_are_a_json_array() {
        assert_eq!(encode_args(&(1, "two")).unwrap(), r#"[1,"two"]"#);
        assert_eq!(encode_args(&()).unwrap(), "null");
    }

    #[test]
    fn test_malformed_payload_is_codec_error() {
        let err = decode_event::<AliveMsg>(r#"{"data":"nope"}"#).unwrap_err();
        assert_eq!(err.as_label(), "service_codec");
    }

    #[test]
    fn test_call_result_into_result() {
        assert_eq!(CallResult::ok(3).into_result(), Ok(3));
        let failed: CallResult<u8> = CallResult::err(ServiceError::Remote {
            error: "boom".into(),
        });
        assert!(!failed.is_ok());
        assert_eq!(
            failed.into_result(),
            Err(ServiceError::Remote {
                error: "boom".into()
            })
        );
    }
}
