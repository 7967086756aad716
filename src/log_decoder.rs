//! Decoder for the binary record format written by `logcat -B`.
//!
//! Every record starts with a little-endian header whose size selects the
//! layout:
//!
//! ```text
//! v3 (0x18): len:u16 hdr_size:u16 pid:i32 tid:i32 sec:i32 nsec:i32 lid:u32
//! v4 (0x1c): len:u16 hdr_size:u16 pid:i32 tid:u32 sec:u32 nsec:u32 lid:u32 uid:u32
//! ```
//!
//! followed by a priority byte and two NUL-terminated strings (tag, message).

use crate::error::DecodeError;
use crate::log_entry::{LogEntry, LogPriority, LogTimestamp, ProcessInfo};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{ErrorKind, Read};

pub const HEADER_SIZE_V3: u16 = 0x18;
pub const HEADER_SIZE_V4: u16 = 0x1c;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryVersion {
    V3,
    V4,
}

impl EntryVersion {
    fn from_header_size(size: u16) -> Result<Self, DecodeError> {
        match size {
            HEADER_SIZE_V3 => Ok(EntryVersion::V3),
            HEADER_SIZE_V4 => Ok(EntryVersion::V4),
            _ => Err(DecodeError::UnknownHeaderSize(size)),
        }
    }
}

/// Consumes exactly one record from `reader`.
///
/// Returns [`DecodeError::EndOfStream`] only when the stream is exhausted
/// before the first byte of a record; running out of data anywhere later
/// is reported as [`DecodeError::Truncated`].
pub fn decode_entry<R: Read>(reader: &mut R) -> Result<LogEntry, DecodeError> {
    let first = read_first_byte(reader)?;
    let second = reader.read_u8()?;
    // Payload length is not needed: tag and message are NUL-terminated.
    let _payload_length = u16::from_le_bytes([first, second]);

    let header_size = reader.read_u16::<LittleEndian>()?;
    let version = EntryVersion::from_header_size(header_size)?;

    let pid = reader.read_i32::<LittleEndian>()?;
    let (tid, seconds, nanoseconds) = match version {
        EntryVersion::V3 => {
            let tid = reader.read_i32::<LittleEndian>()?;
            let sec = reader.read_i32::<LittleEndian>()?;
            let nsec = reader.read_i32::<LittleEndian>()?;
            (tid, i64::from(sec), nsec as u32)
        }
        EntryVersion::V4 => {
            let tid = reader.read_u32::<LittleEndian>()?;
            let sec = reader.read_u32::<LittleEndian>()?;
            let nsec = reader.read_u32::<LittleEndian>()?;
            (tid as i32, i64::from(sec), nsec)
        }
    };
    let log_id = reader.read_u32::<LittleEndian>()?;
    let uid = match version {
        EntryVersion::V3 => 0,
        EntryVersion::V4 => reader.read_u32::<LittleEndian>()?,
    };

    let priority = LogPriority::from_byte(reader.read_u8()?);
    let tag = read_c_string(reader)?;
    let message = read_c_string(reader)?;

    Ok(LogEntry {
        process: ProcessInfo { pid, tid, uid },
        timestamp: LogTimestamp { seconds, nanoseconds },
        log_id,
        priority,
        tag,
        message,
    })
}

fn read_first_byte<R: Read>(reader: &mut R) -> Result<u8, DecodeError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(DecodeError::EndOfStream),
            Ok(_) => return Ok(byte[0]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Reads bytes up to (and consuming) a NUL terminator.
///
/// UTF-8 never uses a zero byte inside a multi-byte sequence, so scanning
/// byte-wise for the terminator is safe; invalid sequences are replaced.
fn read_c_string<R: Read>(reader: &mut R) -> Result<String, DecodeError> {
    let mut buffer = Vec::new();
    loop {
        match reader.read_u8()? {
            0 => break,
            byte => buffer.push(byte),
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    /// Test fixture describing one record to encode.
    pub(crate) struct TestRecord<'a> {
        pub header_size: u16,
        pub pid: i32,
        pub tid: i32,
        pub seconds: i32,
        pub nanoseconds: i32,
        pub log_id: u32,
        pub uid: u32,
        pub priority: LogPriority,
        pub tag: &'a str,
        pub message: &'a str,
    }

    impl<'a> TestRecord<'a> {
        pub(crate) fn v4(priority: LogPriority, tag: &'a str, message: &'a str) -> Self {
            Self {
                header_size: HEADER_SIZE_V4,
                pid: 1234,
                tid: 1240,
                seconds: 1_700_000_000,
                nanoseconds: 5_000,
                log_id: 0,
                uid: 10_123,
                priority,
                tag,
                message,
            }
        }

        pub(crate) fn encode(&self) -> Vec<u8> {
            let payload_len = 1 + self.tag.len() + 1 + self.message.len() + 1;
            let mut out = Vec::new();
            out.write_u16::<LittleEndian>(payload_len as u16).unwrap();
            out.write_u16::<LittleEndian>(self.header_size).unwrap();
            out.write_i32::<LittleEndian>(self.pid).unwrap();
            out.write_i32::<LittleEndian>(self.tid).unwrap();
            out.write_i32::<LittleEndian>(self.seconds).unwrap();
            out.write_i32::<LittleEndian>(self.nanoseconds).unwrap();
            out.write_u32::<LittleEndian>(self.log_id).unwrap();
            if self.header_size == HEADER_SIZE_V4 {
                out.write_u32::<LittleEndian>(self.uid).unwrap();
            }
            out.push(self.priority.as_byte());
            out.extend_from_slice(self.tag.as_bytes());
            out.push(0);
            out.extend_from_slice(self.message.as_bytes());
            out.push(0);
            out
        }
    }

    #[test]
    fn decodes_v4_record() {
        let bytes = TestRecord::v4(LogPriority::Info, "Geode", "loaded 3 mods").encode();
        let mut cursor = Cursor::new(bytes.as_slice());

        let entry = decode_entry(&mut cursor).unwrap();
        assert_eq!(entry.process, ProcessInfo { pid: 1234, tid: 1240, uid: 10_123 });
        assert_eq!(entry.timestamp, LogTimestamp { seconds: 1_700_000_000, nanoseconds: 5_000 });
        assert_eq!(entry.log_id, 0);
        assert_eq!(entry.priority, LogPriority::Info);
        assert_eq!(entry.tag, "Geode");
        assert_eq!(entry.message, "loaded 3 mods");
        assert_eq!(cursor.position() as usize, bytes.len());
    }

    #[test]
    fn v3_record_has_no_uid() {
        let mut record = TestRecord::v4(LogPriority::Error, "cocos2d", "texture missing");
        record.header_size = HEADER_SIZE_V3;
        record.log_id = 3;
        let bytes = record.encode();
        let mut cursor = Cursor::new(bytes.as_slice());

        let entry = decode_entry(&mut cursor).unwrap();
        assert_eq!(entry.process.uid, 0);
        assert_eq!(entry.process.pid, 1234);
        assert_eq!(entry.log_id, 3);
        assert_eq!(entry.message, "texture missing");
        assert_eq!(cursor.position() as usize, bytes.len());
    }

    #[test]
    fn unknown_header_size_stops_after_header() {
        let mut record = TestRecord::v4(LogPriority::Info, "tag", "msg");
        record.header_size = 0x20;
        let bytes = record.encode();
        let mut cursor = Cursor::new(bytes.as_slice());

        match decode_entry(&mut cursor) {
            Err(DecodeError::UnknownHeaderSize(0x20)) => {}
            other => panic!("expected header size error, got {:?}", other),
        }
        assert_eq!(cursor.position(), 4);
    }

    #[test]
    fn empty_stream_is_end_of_stream() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(matches!(decode_entry(&mut cursor), Err(DecodeError::EndOfStream)));
    }

    #[test]
    fn partial_record_is_truncated() {
        let bytes = TestRecord::v4(LogPriority::Info, "tag", "message").encode();
        for cut in [1, 3, 10, bytes.len() - 1] {
            let mut cursor = Cursor::new(&bytes[..cut]);
            assert!(
                matches!(decode_entry(&mut cursor), Err(DecodeError::Truncated)),
                "cut at {}",
                cut
            );
        }
    }

    #[test]
    fn multibyte_text_survives() {
        let bytes = TestRecord::v4(LogPriority::Warn, "ジオード", "héllo ✓").encode();
        let entry = decode_entry(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(entry.tag, "ジオード");
        assert_eq!(entry.message, "héllo ✓");
    }
}
