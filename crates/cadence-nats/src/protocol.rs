//! JSON bodies exchanged between masters and agents.

use cadence_core::agent::AgentFilter;
use cadence_core::build::BuildRequest;
use cadence_core::ids::MasterId;
use cadence_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LookupRequest {
    #[serde(default)]
    pub filter: AgentFilter,
}

/// Body of claim, artifacts and clear: the master making the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterRequest {
    pub master: MasterId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCall {
    pub master: MasterId,
    pub request: BuildRequest,
}

/// Requests without arguments still carry a JSON body.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NotClaimed,
    Unavailable,
    BuildFailed,
    ArtifactTransfer,
    BadRequest,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::BadRequest,
            message: message.into(),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        let (kind, message) = match err {
            Error::AgentNotClaimed(m) => (RemoteErrorKind::NotClaimed, m.clone()),
            Error::AgentUnavailable(m) => (RemoteErrorKind::Unavailable, m.clone()),
            Error::BuildFailed(m) => (RemoteErrorKind::BuildFailed, m.clone()),
            Error::ArtifactTransfer(m) => (RemoteErrorKind::ArtifactTransfer, m.clone()),
            other => (RemoteErrorKind::Internal, other.to_string()),
        };
        Self { kind, message }
    }

    pub fn into_error(self) -> Error {
        match self.kind {
            RemoteErrorKind::NotClaimed => Error::AgentNotClaimed(self.message),
            RemoteErrorKind::Unavailable => Error::AgentUnavailable(self.message),
            RemoteErrorKind::BuildFailed => Error::BuildFailed(self.message),
            RemoteErrorKind::ArtifactTransfer => Error::ArtifactTransfer(self.message),
            RemoteErrorKind::BadRequest => {
                Error::Transport(format!("Agent rejected request: {}", self.message))
            }
            RemoteErrorKind::Internal => Error::Internal(self.message),
        }
    }
}

/// Reply envelope: `{"ok": value}` or `{"err": {kind, message}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply<T> {
    Ok(T),
    Err(RemoteError),
}

impl<T> Reply<T> {
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => Reply::Err(RemoteError::from_error(&e)),
        }
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Err(e) => Err(e.into_error()),
        }
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::agent::ClaimLease;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reply_wire_shape() {
        let ok = encode(&Reply::Ok(true)).unwrap();
        assert_eq!(String::from_utf8(ok).unwrap(), r#"{"ok":true}"#);

        let cleared = encode(&Reply::<()>::Ok(())).unwrap();
        let decoded: Reply<()> = decode(&cleared).unwrap();
        assert_eq!(decoded, Reply::Ok(()));

        let none: Reply<Option<ClaimLease>> = decode(br#"{"ok":null}"#).unwrap();
        assert_eq!(none.into_result().unwrap(), None);
    }

    #[test]
    fn test_errors_keep_their_kind() {
        let reply: Reply<bool> = Reply::from_result(Err(Error::AgentNotClaimed("agent-1".into())));
        let bytes = encode(&reply).unwrap();
        let err = decode::<Reply<bool>>(&bytes).unwrap().into_result().unwrap_err();
        assert!(matches!(err, Error::AgentNotClaimed(ref m) if m == "agent-1"));

        let internal = RemoteError::from_error(&Error::Timeout("x".into()));
        assert_eq!(internal.kind, RemoteErrorKind::Internal);
        assert_eq!(internal.message, "Timed out: x");
    }

    #[test]
    fn test_lookup_request_defaults_to_any() {
        let request: LookupRequest = decode(b"{}").unwrap();
        assert_eq!(request.filter, AgentFilter::any());

        let claim = MasterRequest {
            master: MasterId::new("m1"),
        };
        let bytes = encode(&claim).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"master":"m1"}"#);
    }
}
