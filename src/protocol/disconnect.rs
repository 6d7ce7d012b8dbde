//! Disconnect notices and the reasons a connection can end.
//!
//! Every teardown path maps to exactly one [`DisconnectReason`]:
//!
//! | Path                                             | Reason        |
//! |--------------------------------------------------|---------------|
//! | local `dispose()` / `disconnect(Graceful)`       | `Graceful`    |
//! | notice received with reason `Graceful`           | `Graceful`    |
//! | server `kick(id)` (both ends)                    | `Kicked`      |
//! | stream closed without a notice                   | `Interrupted` |
//! | reset, aborted or broken socket                  | `Interrupted` |
//! | oversized frame or exhausted read retries        | `Interrupted` |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// One side asked to close
    Graceful,
    /// The stream failed or vanished without a notice
    Interrupted,
    /// The server removed the client
    Kicked,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Graceful => f.write_str("graceful"),
            DisconnectReason::Interrupted => f.write_str("interrupted"),
            DisconnectReason::Kicked => f.write_str("kicked"),
        }
    }
}

/// Record carried by a disconnect frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub reason: DisconnectReason,
    pub message: String,
}

impl DisconnectNotice {
    pub fn new(reason: DisconnectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        bincode::deserialize(payload)
            .map_err(|e| ProtocolError::MalformedPayload(format!("disconnect notice: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notice_payload_roundtrip() {
        let notice = DisconnectNotice::new(DisconnectReason::Kicked, "spamming");
        let payload = notice.to_payload().expect("encode");
        assert_eq!(DisconnectNotice::from_payload(&payload).expect("decode"), notice);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            DisconnectNotice::from_payload(&[9, 9]),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }
}
