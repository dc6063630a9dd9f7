use serde::Deserialize;
use serde::Serialize;

use crate::ApplyError;
use crate::Result;

/// Commands understood by the reference key-value machines, carried as the
/// opaque payload of a committed entry.
///
/// `UpdateResult.value` semantics: `Put` returns the stored value length,
/// `Delete` returns 1 when a key was removed and 0 otherwise, `Incr`
/// returns the new counter value (also echoed big-endian in
/// `UpdateResult.data`), `Noop` returns 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    /// Interpret the current value as a big-endian u64 counter and add
    /// one; a missing key starts at zero.
    Incr { key: Vec<u8> },
    Noop,
}

/// Apply one decoded command to an in-memory map. Shared by the
/// sequential and concurrent reference machines; the on-disk machine
/// applies inside its storage transaction instead.
pub(crate) fn apply_to_map(
    map: &mut std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
    index: u64,
    command: KvCommand,
) -> Result<crate::UpdateResult> {
    use crate::convert::safe_kv;
    use crate::UpdateResult;

    match command {
        KvCommand::Put { key, value } => {
            let len = value.len() as u64;
            map.insert(key, value);
            Ok(UpdateResult {
                value: len,
                data: Vec::new(),
            })
        }
        KvCommand::Delete { key } => Ok(UpdateResult {
            value: map.remove(&key).is_some() as u64,
            data: Vec::new(),
        }),
        KvCommand::Incr { key } => {
            let current = match map.get(&key) {
                Some(v) if v.len() == 8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(v);
                    u64::from_be_bytes(buf)
                }
                Some(v) => {
                    return Err(ApplyError::Malformed {
                        index,
                        reason: format!("counter value is {} bytes, expected 8", v.len()),
                    }
                    .into())
                }
                None => 0,
            };
            let next = current.wrapping_add(1);
            map.insert(key, safe_kv(next).to_vec());
            Ok(UpdateResult {
                value: next,
                data: safe_kv(next).to_vec(),
            })
        }
        KvCommand::Noop => Ok(UpdateResult::default()),
    }
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        // An enum of owned byte vectors cannot fail to serialize.
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn decode(
        index: u64,
        payload: &[u8],
    ) -> Result<Self> {
        bincode::deserialize(payload).map_err(|e| {
            ApplyError::Malformed {
                index,
                reason: e.to_string(),
            }
            .into()
        })
    }
}
