use std::io::Read;

use anyhow::{bail, Result};
use bytes::Bytes;
use tracing::debug;

/** Empty encoded RDB, sent to a replica at the start of a full resync. */
pub fn empty_rdb() -> Bytes {
    Bytes::from(hex_to_bytes(RDB_EMPTY_HEX))
}

/// One string entry recovered from a snapshot, expiry as unix epoch millis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: String,
    pub expires_at_ms: Option<u64>,
}

/// Walks an RDB image and collects the string keyspace.
///
/// Format per https://rdb.fnordig.de/file_format.html; only the subset the
/// server writes back as `SET`s is recovered.
pub fn read_snapshot<R: Read>(mut reader: R) -> Result<Vec<SnapshotEntry>> {
    let mut header = [0x00; 9];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8_lossy(&header);
    if !header.starts_with("REDIS") {
        bail!("invalid snapshot header: {}", header);
    }
    debug!("snapshot version: {}", &header["REDIS".len()..]);

    let mut entries = Vec::new();
    let mut expires_at_ms = None;

    while let Ok(op) = read_byte(&mut reader) {
        match op {
            0xFA => {
                // AUX fields
                let key = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                debug!("aux: {} {}", key, value);
            }
            0xFE => {
                // database selector
                let db_number = match read_length(&mut reader)? {
                    LengthEncoding::Len(len) => len,
                    LengthEncoding::Short(len) => len as u32,
                    LengthEncoding::Byte(len) => len as u32,
                    LengthEncoding::Int(len) => len,
                };
                debug!("database selector {}", db_number);
            }
            0xFB => {
                // resize db field
                let hash_size = read_int(&mut reader)?;
                let expire_size = read_int(&mut reader)?;
                debug!("table sizes {} {}", hash_size, expire_size);
            }
            0xFD => {
                // expiry in seconds, 4-byte unix timestamp
                expires_at_ms = Some((read_u32(&mut reader)? as u64) * 1000);
            }
            0xFC => {
                // expiry in milliseconds, 8-byte unix timestamp
                expires_at_ms = Some(read_u64(&mut reader)?);
            }
            0xFF => {
                read_crc64(&mut reader)?;
                return Ok(entries);
            }
            0..=14 => {
                let key = read_string(&mut reader)?;
                let value = read_string(&mut reader)?;
                entries.push(SnapshotEntry {
                    key,
                    value,
                    expires_at_ms: expires_at_ms.take(),
                });
            }
            _ => {
                bail!("invalid snapshot op: {}", op);
            }
        }
    }
    Ok(entries)
}

pub enum LengthEncoding {
    Len(u32),
    Byte(u8),
    Short(u16),
    Int(u32),
}

fn read_length<R: Read>(reader: &mut R) -> Result<LengthEncoding> {
    let head = read_byte(reader)?;
    // the two most significant bits select the encoding
    match head & 0b11000000 {
        0b00000000 => Ok(LengthEncoding::Len(head as u32)),
        0b01000000 => {
            let first6bits = (head & 0b00111111) as u32;
            let second = read_byte(reader)? as u32;
            Ok(LengthEncoding::Len((first6bits << 8) | second))
        }
        0b10000000 => {
            let mut buf = [0; 4];
            reader.read_exact(&mut buf)?;
            Ok(LengthEncoding::Len(u32::from_be_bytes(buf)))
        }
        _ => {
            let first6bits = head & 0b00111111;
            match first6bits {
                0 => Ok(LengthEncoding::Byte(read_byte(reader)?)),
                1 => {
                    let mut buf = [0; 2];
                    reader.read_exact(&mut buf)?;
                    Ok(LengthEncoding::Short(u16::from_le_bytes(buf)))
                }
                2 => Ok(LengthEncoding::Int(read_u32(reader)?)),
                3 => bail!("compressed string encoding is not supported"),
                _ => bail!("unknown length encoding: {}", head),
            }
        }
    }
}

fn read_int<R: Read>(reader: &mut R) -> Result<u32> {
    match read_length(reader)? {
        LengthEncoding::Len(len) => Ok(len),
        LengthEncoding::Short(len) => Ok(len as u32),
        LengthEncoding::Byte(len) => Ok(len as u32),
        LengthEncoding::Int(len) => Ok(len),
    }
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    match read_length(reader)? {
        LengthEncoding::Len(len) => {
            let mut buf = vec![0; len as usize];
            reader.read_exact(&mut buf)?;
            Ok(String::from_utf8(buf)?)
        }
        LengthEncoding::Byte(value) => Ok(value.to_string()),
        LengthEncoding::Short(value) => Ok(value.to_string()),
        LengthEncoding::Int(value) => Ok(value.to_string()),
    }
}

fn read_byte<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_crc64<R: Read>(reader: &mut R) -> Result<[u8; 8]> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

const RDB_EMPTY_HEX: &str = "524544495330303131fa0972656469732d76657205372e322e30fa0a72656469732d62697473c040fa056374696d65c26d08bc65fa08757365642d6d656dc2b0c41000fa08616f662d62617365c000fff06e3bfec0ff5aa2";

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    // hex string is of 2 chars per byte
    assert_eq!(hex.len() % 2, 0);
    let mut result = Vec::with_capacity(hex.len() / 2);
    let mut iter = hex.chars();
    while let Some(c1) = iter.next() {
        let c2 = iter.next().unwrap();
        let byte = u8::from_str_radix(&format!("{}{}", c1, c2), 16).unwrap();
        result.push(byte);
    }
    result
}
