use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::storage::types::{ContextId, RecordType, ShardId};

/// A decoded log command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: RecordType,
    pub context_id: ContextId,
    pub shard_id: ShardId,
    pub key: Vec<u8>,
    /// `None` for deletes.
    pub value: Option<Vec<u8>>,
}

/// Encodes records into a section buffer. Consecutive records for the same
/// shard set the reuse flag and omit `(context_id, shard_id)`. Each section
/// starts without a previous shard so sections decode independently.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RecordEncoder {
    last: Option<(ContextId, ShardId)>,
}

impl RecordEncoder {
    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn encode(
        &mut self,
        buf: &mut Vec<u8>,
        context_id: ContextId,
        shard_id: ShardId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let key_len = u16::try_from(key.len())
            .map_err(|_| Error::InvalidArgument(format!("key of {} bytes", key.len())))?;
        let kind = if value.is_some() {
            RecordType::Set
        } else {
            RecordType::Delete
        };
        let reuse = self.last == Some((context_id, shard_id));

        buf.write_u8(kind as u8)?;
        buf.write_u8(u8::from(reuse))?;
        if !reuse {
            buf.write_u16::<LittleEndian>(context_id)?;
            buf.write_u64::<LittleEndian>(shard_id)?;
        }
        buf.write_u16::<LittleEndian>(key_len)?;
        buf.extend_from_slice(key);
        if let Some(value) = value {
            let value_len = u32::try_from(value.len())
                .map_err(|_| Error::InvalidArgument(format!("value of {} bytes", value.len())))?;
            buf.write_u32::<LittleEndian>(value_len)?;
            buf.extend_from_slice(value);
        }
        self.last = Some((context_id, shard_id));
        Ok(())
    }
}

/// Decodes every record of a section payload whose checksum already
/// matched. Any inconsistency left is corruption.
pub fn decode_records(payload: &[u8]) -> Result<Vec<LogRecord>> {
    let mut cursor = Cursor::new(payload);
    let mut records = Vec::new();
    let mut last: Option<(ContextId, ShardId)> = None;

    while (cursor.position() as usize) < payload.len() {
        let kind = RecordType::try_from(cursor.read_u8().map_err(corrupt)?)?;
        let reuse = cursor.read_u8().map_err(corrupt)? != 0;
        let (context_id, shard_id) = if reuse {
            last.ok_or_else(|| {
                Error::Corruption("log record reuses a shard at section start".into())
            })?
        } else {
            (
                cursor.read_u16::<LittleEndian>().map_err(corrupt)?,
                cursor.read_u64::<LittleEndian>().map_err(corrupt)?,
            )
        };
        let key_len = cursor.read_u16::<LittleEndian>().map_err(corrupt)? as usize;
        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key).map_err(corrupt)?;
        let value = match kind {
            RecordType::Set => {
                let value_len = cursor.read_u32::<LittleEndian>().map_err(corrupt)? as usize;
                if value_len > payload.len() {
                    return Err(Error::Corruption(format!(
                        "log value of {} bytes in a {} byte section",
                        value_len,
                        payload.len()
                    )));
                }
                let mut value = vec![0u8; value_len];
                cursor.read_exact(&mut value).map_err(corrupt)?;
                Some(value)
            }
            RecordType::Delete => None,
        };

        last = Some((context_id, shard_id));
        records.push(LogRecord {
            kind,
            context_id,
            shard_id,
            key,
            value,
        });
    }
    Ok(records)
}

fn corrupt(e: std::io::Error) -> Error {
    Error::Corruption(format!("truncated log record: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_flag_compresses_bursts() -> Result<()> {
        let mut encoder = RecordEncoder::default();
        let mut buf = Vec::new();
        encoder.encode(&mut buf, 1, 10, b"a", Some(b"1"))?;
        let first = buf.len();
        encoder.encode(&mut buf, 1, 10, b"b", Some(b"2"))?;
        assert_eq!(buf.len() - first, first - 10);
        encoder.encode(&mut buf, 2, 10, b"c", None)?;
        encoder.encode(&mut buf, 2, 10, b"d", Some(b""))?;

        let records = decode_records(&buf)?;
        let summary: Vec<_> = records
            .iter()
            .map(|r| (r.context_id, r.shard_id, r.key.clone(), r.value.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, 10, b"a".to_vec(), Some(b"1".to_vec())),
                (1, 10, b"b".to_vec(), Some(b"2".to_vec())),
                (2, 10, b"c".to_vec(), None),
                (2, 10, b"d".to_vec(), Some(Vec::new())),
            ]
        );
        assert_eq!(records[2].kind, RecordType::Delete);
        Ok(())
    }

    #[test]
    fn test_reset_starts_a_fresh_section() -> Result<()> {
        let mut encoder = RecordEncoder::default();
        let mut buf = Vec::new();
        encoder.encode(&mut buf, 1, 1, b"a", None)?;
        encoder.reset();
        let mut next = Vec::new();
        encoder.encode(&mut next, 1, 1, b"b", None)?;
        assert_eq!(decode_records(&next)?[0].shard_id, 1);
        Ok(())
    }

    #[test]
    fn test_truncated_payload_is_corruption() -> Result<()> {
        let mut encoder = RecordEncoder::default();
        let mut buf = Vec::new();
        encoder.encode(&mut buf, 1, 1, b"key", Some(b"value"))?;
        buf.truncate(buf.len() - 2);
        assert!(matches!(decode_records(&buf), Err(Error::Corruption(_))));

        // a reuse flag with nothing before it
        let bad = [RecordType::Delete as u8, 1, 1, 0, b'k'];
        assert!(matches!(decode_records(&bad), Err(Error::Corruption(_))));
        Ok(())
    }
}
