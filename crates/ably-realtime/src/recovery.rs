//! Recovery key codec.
//!
//! A recovery key is `"<connectionKey>:<connectionSerial>"`: ASCII, no
//! surrounding whitespace, serial in decimal. Connection keys never contain
//! the separator, so decoding splits on the last `:`.

use crate::types::ConnectionIdentity;

pub const SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("no ':' separator in {0:?}")]
    MissingSeparator(String),

    #[error("connection key is empty")]
    EmptyKey,

    #[error("surrounding whitespace in {0:?}")]
    Whitespace(String),

    #[error("serial {0:?} is not a non-negative integer")]
    InvalidSerial(String),
}

pub fn encode(identity: &ConnectionIdentity) -> String {
    format!(
        "{}{SEPARATOR}{}",
        identity.connection_key, identity.connection_serial
    )
}

pub fn decode(recovery_key: &str) -> Result<ConnectionIdentity, DecodeError> {
    if recovery_key.trim() != recovery_key {
        return Err(DecodeError::Whitespace(recovery_key.to_string()));
    }
    let (key, serial) = recovery_key
        .rsplit_once(SEPARATOR)
        .ok_or_else(|| DecodeError::MissingSeparator(recovery_key.to_string()))?;
    if key.is_empty() {
        return Err(DecodeError::EmptyKey);
    }
    // `u64::from_str` accepts a leading '+', which is not part of the format.
    if serial.is_empty() || !serial.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DecodeError::InvalidSerial(serial.to_string()));
    }
    let connection_serial = serial
        .parse::<u64>()
        .map_err(|_| DecodeError::InvalidSerial(serial.to_string()))?;
    Ok(ConnectionIdentity::new(key, connection_serial))
}
