use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use super::{round_up, seal, verify, PAGE_PREFIX_SIZE};
use crate::error::{Error, Result};
use crate::storage::types::RecordType;

/// `size, checksum, keysSectionLength, numKeys`
pub const DATA_PAGE_HEADER_SIZE: usize = PAGE_PREFIX_SIZE + 8;

/// Accumulates sorted records into one data page. Keys and values are kept
/// in separate sections so key-only scans never touch values.
#[derive(Debug, Default)]
pub struct DataPageBuilder {
    keys: Vec<u8>,
    values: Vec<u8>,
    num_keys: u32,
    first_key: Vec<u8>,
}

impl DataPageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.num_keys == 0
    }

    pub fn num_keys(&self) -> u32 {
        self.num_keys
    }

    /// Encoded page length before padding.
    pub fn encoded_len(&self) -> usize {
        DATA_PAGE_HEADER_SIZE + self.keys.len() + self.values.len()
    }

    pub fn record_len(key: &[u8], value: Option<&[u8]>) -> usize {
        1 + 2 + key.len() + value.map_or(0, |v| 4 + v.len())
    }

    /// Appends a record. `None` is a tombstone. Keys must arrive in
    /// ascending order.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let key_len = u16::try_from(key.len())
            .map_err(|_| Error::InvalidArgument(format!("key of {} bytes", key.len())))?;
        if self.num_keys == 0 {
            self.first_key = key.to_vec();
        }
        match value {
            Some(value) => {
                let value_len = u32::try_from(value.len()).map_err(|_| {
                    Error::InvalidArgument(format!("value of {} bytes", value.len()))
                })?;
                self.keys.write_u8(RecordType::Set as u8)?;
                self.values.write_u32::<LittleEndian>(value_len)?;
                self.values.extend_from_slice(value);
            }
            None => self.keys.write_u8(RecordType::Delete as u8)?,
        }
        self.keys.write_u16::<LittleEndian>(key_len)?;
        self.keys.extend_from_slice(key);
        self.num_keys += 1;
        Ok(())
    }

    /// Seals the page padded to `granularity` and resets the builder.
    /// Returns the page image and its first key.
    pub fn finish(&mut self, granularity: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        let padded = round_up(self.encoded_len(), granularity);
        let mut buf = Vec::with_capacity(padded);
        buf.resize(PAGE_PREFIX_SIZE, 0);
        buf.write_u32::<LittleEndian>(self.keys.len() as u32)?;
        buf.write_u32::<LittleEndian>(self.num_keys)?;
        buf.extend_from_slice(&self.keys);
        buf.extend_from_slice(&self.values);

        let first_key = std::mem::take(&mut self.first_key);
        self.keys.clear();
        self.values.clear();
        self.num_keys = 0;
        Ok((seal(buf, padded)?, first_key))
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    key_start: u32,
    key_len: u16,
    /// Start and length of the value, `None` for tombstones.
    value: Option<(u32, u32)>,
}

/// A decoded data page. Records are addressed by position and borrowed from
/// the page buffer.
#[derive(Debug)]
pub struct DataPage {
    buf: Vec<u8>,
    slots: Vec<Slot>,
}

impl DataPage {
    pub fn decode(buf: Vec<u8>) -> Result<Self> {
        let size = verify(&buf, "data page")?;
        if size < DATA_PAGE_HEADER_SIZE {
            return Err(Error::Corruption("data page shorter than its header".into()));
        }
        let keys_len = LittleEndian::read_u32(&buf[8..12]) as usize;
        let num_keys = LittleEndian::read_u32(&buf[12..16]) as usize;
        let keys_end = DATA_PAGE_HEADER_SIZE + keys_len;
        if keys_end > size {
            return Err(Error::Corruption(format!(
                "data page keys section of {} bytes overruns page of {}",
                keys_len, size
            )));
        }

        let mut slots = Vec::with_capacity(num_keys);
        let mut pos = DATA_PAGE_HEADER_SIZE;
        let mut value_pos = keys_end;
        for _ in 0..num_keys {
            if pos + 3 > keys_end {
                return Err(Error::Corruption("data page key record truncated".into()));
            }
            let record_type = RecordType::try_from(buf[pos])?;
            let key_len = LittleEndian::read_u16(&buf[pos + 1..pos + 3]);
            let key_start = pos + 3;
            pos = key_start + key_len as usize;
            if pos > keys_end {
                return Err(Error::Corruption("data page key truncated".into()));
            }

            let value = match record_type {
                RecordType::Set => {
                    if value_pos + 4 > size {
                        return Err(Error::Corruption("data page value length truncated".into()));
                    }
                    let len = LittleEndian::read_u32(&buf[value_pos..value_pos + 4]) as usize;
                    let start = value_pos + 4;
                    value_pos = start + len;
                    if value_pos > size {
                        return Err(Error::Corruption("data page value truncated".into()));
                    }
                    Some((start as u32, len as u32))
                }
                RecordType::Delete => None,
            };

            let slot = Slot {
                key_start: key_start as u32,
                key_len,
                value,
            };
            if let Some(prev) = slots.last() {
                if Self::slot_key(&buf, prev) >= Self::slot_key(&buf, &slot) {
                    return Err(Error::Corruption("data page keys out of order".into()));
                }
            }
            slots.push(slot);
        }

        Ok(Self { buf, slots })
    }

    fn slot_key<'a>(buf: &'a [u8], slot: &Slot) -> &'a [u8] {
        let start = slot.key_start as usize;
        &buf[start..start + slot.key_len as usize]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn key(&self, pos: usize) -> &[u8] {
        Self::slot_key(&self.buf, &self.slots[pos])
    }

    /// Value of the record at `pos`, `None` for a tombstone.
    pub fn value(&self, pos: usize) -> Option<&[u8]> {
        self.slots[pos]
            .value
            .map(|(start, len)| &self.buf[start as usize..(start + len) as usize])
    }

    /// Position of the first record whose key is not less than `key`.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        self.slots
            .partition_point(|slot| Self::slot_key(&self.buf, slot) < key)
    }

    /// `Some(None)` means the page holds a tombstone for `key`.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        let pos = self.lower_bound(key);
        if pos < self.len() && self.key(pos) == key {
            Some(self.value(pos))
        } else {
            None
        }
    }

    pub fn memory_size(&self) -> usize {
        self.buf.len() + self.slots.len() * std::mem::size_of::<Slot>()
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }
}
