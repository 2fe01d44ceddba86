//! Operation records replicated through the consensus log.
//!
//! Wire form: a single tag byte followed by a bincode payload. The tag is
//! read first on the apply path so a corrupt payload fails as an encoding
//! error for that one record instead of poisoning the decoder.

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::value::Value;

const SET_TAG: u8 = 0;
const GET_TAG: u8 = 1;
const DELETE_TAG: u8 = 2;

/// One replicated store operation.
///
/// `Get` is carried for completeness of the apply dispatch; production
/// reads are served from the local store and never enter the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Set { key: String, value: Value },
    Get { key: String },
    Delete { key: String },
}

impl Operation {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let mut buf = Vec::new();
        match self {
            Operation::Set { key, value } => {
                buf.push(SET_TAG);
                buf.extend(bincode::serialize(&(key, value))?);
            }
            Operation::Get { key } => {
                buf.push(GET_TAG);
                buf.extend(bincode::serialize(key)?);
            }
            Operation::Delete { key } => {
                buf.push(DELETE_TAG);
                buf.extend(bincode::serialize(key)?);
            }
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| StoreError::Encoding("empty operation record".to_string()))?;
        match tag {
            SET_TAG => {
                let (key, value) = bincode::deserialize(payload)?;
                Ok(Operation::Set { key, value })
            }
            GET_TAG => Ok(Operation::Get {
                key: bincode::deserialize(payload)?,
            }),
            DELETE_TAG => Ok(Operation::Delete {
                key: bincode::deserialize(payload)?,
            }),
            other => Err(StoreError::Encoding(format!(
                "unknown operation tag {other:#04x}"
            ))),
        }
    }
}
