use std::fmt::Display;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;

use crate::errors::ProtocolError;

#[derive(Debug, Clone, PartialEq)]
pub enum RESP {
    String(String),
    Error(String),
    Int(i64),
    Bulk(String),
    Array(Vec<RESP>),
    Null,
    /// RDB payload: `$<len>\r\n<bytes>` with no trailing CRLF. Only ever
    /// exchanged on the replication connection right after FULLRESYNC.
    File(Bytes),
}

impl RESP {
    pub fn bulk(s: &str) -> RESP {
        RESP::Bulk(s.to_string())
    }

    /// Builds the standard client command frame: an array of bulk strings.
    pub fn command(parts: &[&str]) -> RESP {
        RESP::Array(parts.iter().map(|p| RESP::bulk(p)).collect())
    }

    /// Wire encoding of this frame. Propagation uses this to measure
    /// replication offsets, so it must match what the socket path writes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        encode_message(&mut buf, self)?;
        Ok(buf)
    }
}

impl Display for RESP {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RESP::String(s) => write!(f, "{}", s),
            RESP::Error(s) => write!(f, "!{}", s),
            RESP::Int(i) => write!(f, "{}", i),
            RESP::Bulk(s) => write!(f, "{}", s),
            RESP::Array(array) => {
                for item in array {
                    write!(f, "{} ", item)?;
                }
                Ok(())
            }
            RESP::Null => write!(f, "null"),
            RESP::File(file) => write!(f, "File{}", file.len()),
        }
    }
}

pub struct RESPConnection {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl RESPConnection {
    pub fn new(stream: TcpStream) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream.try_clone()?),
            stream,
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    pub fn read_timeout(&self) -> Result<Option<Duration>> {
        Ok(self.stream.read_timeout()?)
    }

    pub fn send_message(&mut self, message: &RESP) -> Result<usize> {
        self.send_messages(&[message])
    }

    /// Writes all frames, flushes once, and returns the number of bytes put
    /// on the wire.
    pub fn send_messages(&mut self, messages: &[&RESP]) -> Result<usize> {
        let mut len = 0;
        for message in messages {
            let bytes = message.to_bytes()?;
            self.writer.write_all(&bytes)?;
            len += bytes.len();
        }
        self.writer.flush()?;
        Ok(len)
    }

    /// Reads one frame; the returned length is its exact wire size.
    pub fn read_message(&mut self) -> Result<(usize, RESP)> {
        decode_message(&mut self.reader)
    }

    /// Reads an RDB bulk: `$<len>\r\n` followed by exactly `len` raw bytes
    /// and no trailing CRLF.
    pub fn read_rdb(&mut self) -> Result<Bytes> {
        let line = read_frame_line(&mut self.reader)?.1;
        let Some(len) = line.strip_prefix('$') else {
            return Err(ProtocolError::Malformed(format!("expected RDB bulk, got: {}", line)).into());
        };
        let len: usize = len
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("invalid RDB length: {}", line)))?;
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| ProtocolError::Closed)?;
        Ok(Bytes::from(buf))
    }
}

pub(crate) fn encode_message<W: Write>(writer: &mut W, message: &RESP) -> Result<()> {
    match message {
        RESP::String(s) => write!(writer, "+{}\r\n", s)?,
        RESP::Error(s) => write!(writer, "-{}\r\n", s)?,
        RESP::Int(n) => write!(writer, ":{}\r\n", n)?,
        RESP::Bulk(s) => write!(writer, "${}\r\n{}\r\n", s.len(), s)?,
        RESP::Null => write!(writer, "$-1\r\n")?,
        RESP::Array(array) => {
            write!(writer, "*{}\r\n", array.len())?;
            for item in array {
                encode_message(writer, item)?;
            }
        }
        RESP::File(bytes) => {
            write!(writer, "${}\r\n", bytes.len())?;
            writer.write_all(bytes)?;
        }
    }
    Ok(())
}

/// Reads one `\r\n`-terminated line and returns (bytes consumed, line
/// without the terminator).
fn read_frame_line<R: BufRead>(reader: &mut R) -> Result<(usize, String)> {
    let mut line = String::new();
    let len = reader.read_line(&mut line)?;
    if len == 0 {
        return Err(ProtocolError::Closed.into());
    }
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(ProtocolError::Malformed("empty frame".to_string()).into());
    }
    Ok((len, trimmed.to_string()))
}

pub(crate) fn decode_message<R: BufRead>(reader: &mut R) -> Result<(usize, RESP)> {
    let (line_len, line) = read_frame_line(reader)?;
    let mut consumed = line_len;
    // the prefix byte is ASCII in every arm, so slicing at 1 is safe there
    let message = match line.as_bytes()[0] {
        b'+' => RESP::String(line[1..].to_string()),
        b'-' => RESP::Error(line[1..].to_string()),
        b':' => RESP::Int(
            line[1..]
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("invalid integer: {}", line)))?,
        ),
        b'$' => {
            let rest = &line[1..];
            let len: i64 = rest
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("invalid bulk length: {}", line)))?;
            if len < 0 {
                RESP::Null
            } else {
                // payload plus the 2 delimiter bytes
                let mut buf = vec![0u8; len as usize + 2];
                reader.read_exact(&mut buf).map_err(|_| ProtocolError::Closed)?;
                if &buf[len as usize..] != b"\r\n" {
                    return Err(
                        ProtocolError::Malformed("bulk string not CRLF-terminated".to_string()).into(),
                    );
                }
                consumed += buf.len();
                buf.truncate(len as usize);
                let bulk = String::from_utf8(buf)
                    .map_err(|_| ProtocolError::Malformed("bulk string is not utf-8".to_string()))?;
                RESP::Bulk(bulk)
            }
        }
        b'*' => {
            let len: u64 = line[1..]
                .parse()
                .map_err(|_| ProtocolError::Malformed(format!("invalid array length: {}", line)))?;
            let mut array = Vec::with_capacity(len as usize);
            for _ in 0..len {
                let (item_len, item) = decode_message(reader)?;
                consumed += item_len;
                array.push(item);
            }
            RESP::Array(array)
        }
        _ => return Err(ProtocolError::Malformed(format!("unknown frame prefix: {}", line)).into()),
    };
    Ok((consumed, message))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn round_trip(message: &RESP) {
        let bytes = message.to_bytes().unwrap();
        let (len, decoded) = decode_message(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(&decoded, message);
    }

    #[test]
    fn encode_decode_is_identity() {
        round_trip(&RESP::String("PONG".to_string()));
        round_trip(&RESP::Error("ERR something".to_string()));
        round_trip(&RESP::Int(-42));
        round_trip(&RESP::Bulk("hello".to_string()));
        round_trip(&RESP::Bulk("".to_string()));
        round_trip(&RESP::Null);
        round_trip(&RESP::Array(vec![]));
        round_trip(&RESP::command(&["SET", "k", "v"]));
        round_trip(&RESP::Array(vec![
            RESP::Array(vec![RESP::bulk("1-1"), RESP::Int(1)]),
            RESP::Null,
        ]));
    }

    #[test]
    fn decodes_command_frame_with_exact_length() {
        let bytes = b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n";
        let (len, message) = decode_message(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(message, RESP::command(&["SET", "k", "v"]));
    }

    #[test]
    fn decodes_null_bulk() {
        let (len, message) = decode_message(&mut Cursor::new(b"$-1\r\n")).unwrap();
        assert_eq!(len, 5);
        assert_eq!(message, RESP::Null);
    }

    #[test]
    fn empty_input_is_a_closed_connection() {
        let err = decode_message(&mut Cursor::new(b"")).unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(ProtocolError::Closed)));
    }

    #[test]
    fn garbage_prefix_is_a_protocol_error() {
        let err = decode_message(&mut Cursor::new(b"?what\r\n")).unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(ProtocolError::Malformed(_))));
    }

    #[test]
    fn malformed_length_is_a_protocol_error() {
        let err = decode_message(&mut Cursor::new(b"$abc\r\n")).unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(ProtocolError::Malformed(_))));
    }

    #[test]
    fn file_frame_has_no_trailing_crlf() {
        let bytes = RESP::File(Bytes::from_static(b"\x00\x01")).to_bytes().unwrap();
        assert_eq!(bytes, b"$2\r\n\x00\x01");
    }
}
