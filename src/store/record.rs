// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Commit log record format.
//!
//! All integers are big endian:
//!
//! ```text
//! magic:u32 | total_size:u32 | crc32:u32 | topic_len:u16 | topic |
//! queue_id:u32 | queue_offset:u64 | store_timestamp:u64 | delay_level:i32 |
//! body_len:u32 | body
//! ```
//!
//! `crc32` is CRC-32C over every byte after the crc field. The tail of a
//! sealed segment is padded by an END marker `BLANK_MAGIC:u32 | remaining:u32`
//! whose length covers the rest of the segment. A zero magic is space that
//! was never written.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{AppError, AppResult};

pub const MESSAGE_MAGIC: u32 = 0xDAA3_20A7;
pub const BLANK_MAGIC: u32 = 0xCBD4_3194;
/// magic + remaining length
pub const END_MARKER_LEN: usize = 8;
/// every field except the topic and body bytes
pub const RECORD_FIXED_LEN: usize = 4 + 4 + 4 + 2 + 4 + 8 + 8 + 4 + 4;

const CRC_FIELD_END: usize = 12;

/// A commit log record decoded from a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub total_size: u32,
    pub topic: String,
    pub queue_id: u32,
    pub queue_offset: u64,
    pub store_timestamp: u64,
    pub delay_level: i32,
    pub body: Bytes,
}

/// What a reader found at a position of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    Record(StoredRecord),
    /// END marker, the rest of the segment is padding
    EndOfSegment,
    /// zeroed space, nothing was ever written here
    EndOfData,
    Corrupt(String),
}

pub fn record_size(topic_len: usize, body_len: usize) -> usize {
    RECORD_FIXED_LEN + topic_len + body_len
}

pub fn encode(
    topic: &str,
    queue_id: u32,
    queue_offset: u64,
    store_timestamp: u64,
    delay_level: i32,
    body: &[u8],
) -> BytesMut {
    let total_size = record_size(topic.len(), body.len());
    let mut buf = BytesMut::with_capacity(total_size);
    buf.put_u32(MESSAGE_MAGIC);
    buf.put_u32(total_size as u32);
    // crc placeholder
    buf.put_u32(0);
    buf.put_u16(topic.len() as u16);
    buf.put_slice(topic.as_bytes());
    buf.put_u32(queue_id);
    buf.put_u64(queue_offset);
    buf.put_u64(store_timestamp);
    buf.put_i32(delay_level);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);

    let crc = crc32c::crc32c(&buf[CRC_FIELD_END..]);
    buf[8..CRC_FIELD_END].copy_from_slice(&crc.to_be_bytes());
    buf
}

pub fn encode_end_marker(remaining: u32) -> [u8; END_MARKER_LEN] {
    let mut marker = [0u8; END_MARKER_LEN];
    marker[..4].copy_from_slice(&BLANK_MAGIC.to_be_bytes());
    marker[4..].copy_from_slice(&remaining.to_be_bytes());
    marker
}

/// Decodes whatever starts at `buf[0]`, where `buf` runs to the end of the
/// segment.
pub fn decode(buf: &[u8], check_crc: bool) -> DecodeOutcome {
    if buf.len() < END_MARKER_LEN {
        if buf.iter().all(|b| *b == 0) {
            return DecodeOutcome::EndOfData;
        }
        return DecodeOutcome::Corrupt(format!("truncated header, {} bytes left", buf.len()));
    }

    let mut header = &buf[..END_MARKER_LEN];
    let magic = header.get_u32();
    let total_size = header.get_u32() as usize;

    match magic {
        0 => return DecodeOutcome::EndOfData,
        BLANK_MAGIC => {
            if total_size != buf.len() {
                return DecodeOutcome::Corrupt(format!(
                    "end marker covers {} bytes but {} remain",
                    total_size,
                    buf.len()
                ));
            }
            return DecodeOutcome::EndOfSegment;
        }
        MESSAGE_MAGIC => {}
        other => return DecodeOutcome::Corrupt(format!("magic mismatch: {:#010x}", other)),
    }

    if total_size < RECORD_FIXED_LEN || total_size > buf.len() {
        return DecodeOutcome::Corrupt(format!(
            "record size {} out of bounds, {} bytes remain",
            total_size,
            buf.len()
        ));
    }
    let record = &buf[..total_size];

    let mut cursor = &record[END_MARKER_LEN..];
    let crc = cursor.get_u32();
    if check_crc {
        let actual = crc32c::crc32c(&record[CRC_FIELD_END..]);
        if actual != crc {
            return DecodeOutcome::Corrupt(format!(
                "crc mismatch: stored {:#010x}, computed {:#010x}",
                crc, actual
            ));
        }
    }

    let topic_len = cursor.get_u16() as usize;
    if record_size(topic_len, 0) > total_size {
        return DecodeOutcome::Corrupt(format!("topic length {} out of bounds", topic_len));
    }
    let topic = match std::str::from_utf8(&cursor[..topic_len]) {
        Ok(topic) => topic.to_string(),
        Err(_) => return DecodeOutcome::Corrupt("topic is not utf-8".to_string()),
    };
    cursor.advance(topic_len);
    let queue_id = cursor.get_u32();
    let queue_offset = cursor.get_u64();
    let store_timestamp = cursor.get_u64();
    let delay_level = cursor.get_i32();
    let body_len = cursor.get_u32() as usize;
    if record_size(topic_len, body_len) != total_size {
        return DecodeOutcome::Corrupt(format!(
            "body length {} does not match record size {}",
            body_len, total_size
        ));
    }

    DecodeOutcome::Record(StoredRecord {
        total_size: total_size as u32,
        topic,
        queue_id,
        queue_offset,
        store_timestamp,
        delay_level,
        body: Bytes::copy_from_slice(&cursor[..body_len]),
    })
}

/// Body of a record parked in a delay bucket.
///
/// ```text
/// real_topic_len:u16 | real_topic | real_queue_id:u32 | due_timestamp:u64 | body
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayEnvelope {
    pub topic: String,
    pub queue_id: u32,
    pub due_timestamp: u64,
    pub body: Bytes,
}

impl DelayEnvelope {
    const FIXED_LEN: usize = 2 + 4 + 8;

    pub fn encoded_len(topic: &str, body: &[u8]) -> usize {
        Self::FIXED_LEN + topic.len() + body.len()
    }

    pub fn encode(topic: &str, queue_id: u32, due_timestamp: u64, body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(topic, body));
        buf.put_u16(topic.len() as u16);
        buf.put_slice(topic.as_bytes());
        buf.put_u32(queue_id);
        buf.put_u64(due_timestamp);
        buf.put_slice(body);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> AppResult<Self> {
        if buf.len() < Self::FIXED_LEN {
            return Err(AppError::CorruptionDetected(format!(
                "delay envelope too short: {} bytes",
                buf.len()
            )));
        }
        let topic_len = buf.get_u16() as usize;
        if buf.len() < topic_len + 12 {
            return Err(AppError::CorruptionDetected(format!(
                "delay envelope topic length {} out of bounds",
                topic_len
            )));
        }
        let topic = String::from_utf8(buf.split_to(topic_len).to_vec()).map_err(|_| {
            AppError::CorruptionDetected("delay envelope topic is not utf-8".to_string())
        })?;
        let queue_id = buf.get_u32();
        let due_timestamp = buf.get_u64();
        Ok(Self {
            topic,
            queue_id,
            due_timestamp,
            body: buf,
        })
    }
}
