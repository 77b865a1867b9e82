//! Framing for the memcached text protocol.
//!
//! Requests are single command lines, with storage commands followed by a
//! data block. Replies are either single lines (`STORED`, `DELETED`, a bare
//! number, ...) or multi-line sequences terminated by `END` (`VALUE` blocks
//! for retrievals, `STAT` lines for `stats`). The decoder carries a small
//! state machine so a multi-line sequence is surfaced as one [`Response`].

use std::collections::HashMap;
use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum accepted length of a single reply line.
pub const MAX_LINE: usize = 8 * 1024;

/// Maximum accepted size of a single value block.
pub const MAX_VALUE_SIZE: usize = 8 * 1024 * 1024;

/// Maximum key length accepted by memcached.
pub const MAX_KEY_LEN: usize = 250;

/// Errors produced while encoding requests or decoding replies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying transport error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A key that memcached would reject (empty, too long, or containing
    /// whitespace/control characters).
    #[error("invalid key: {0:?}")]
    BadKey(String),

    /// A reply line that does not match any known reply shape.
    #[error("malformed reply line: {0:?}")]
    BadReply(String),

    /// A reply line longer than [`MAX_LINE`].
    #[error("reply line exceeds {MAX_LINE} bytes")]
    LineTooLong,

    /// A value block longer than [`MAX_VALUE_SIZE`].
    #[error("value block of {0} bytes exceeds maximum")]
    ValueTooLarge(usize),
}

/// The storage-command family. All share one wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreVerb {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

impl StoreVerb {
    fn wire(self) -> &'static str {
        match self {
            StoreVerb::Set => "set",
            StoreVerb::Add => "add",
            StoreVerb::Replace => "replace",
            StoreVerb::Append => "append",
            StoreVerb::Prepend => "prepend",
            StoreVerb::Cas => "cas",
        }
    }
}

/// One protocol request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// `get`/`gets` over one or more keys.
    Get { keys: Vec<String>, with_cas: bool },
    /// A storage command. `cas` is only meaningful for [`StoreVerb::Cas`].
    Store {
        verb: StoreVerb,
        key: String,
        flags: u32,
        exptime: u32,
        data: Bytes,
        cas: Option<u64>,
    },
    Delete { key: String },
    Incr { key: String, amount: u64 },
    Decr { key: String, amount: u64 },
    FlushAll,
    Stats { arg: Option<String> },
    Version,
}

/// One value returned by a retrieval command.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub key: String,
    pub flags: u32,
    /// CAS identifier; present only for `gets` replies.
    pub cas: Option<u64>,
    pub data: Bytes,
}

/// One complete protocol reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A `VALUE ... END` sequence. Empty on a full miss.
    Values(Vec<Value>),
    Stored,
    NotStored,
    Exists,
    NotFound,
    Deleted,
    Ok,
    /// Bare numeric reply from `incr`/`decr`.
    Number(u64),
    Version(String),
    /// A `STAT ... END` sequence.
    Stats(HashMap<String, String>),
    /// `ERROR`, `CLIENT_ERROR <msg>`, or `SERVER_ERROR <msg>`.
    Error(String),
}

fn check_key(key: &str) -> Result<(), ProtocolError> {
    let ok = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b > 32 && b != 127);
    if ok {
        Ok(())
    } else {
        Err(ProtocolError::BadKey(key.to_owned()))
    }
}

/// Codec implementing [`Encoder`] for [`Request`] and [`Decoder`] for
/// [`Response`]. Stateful: multi-line replies are accumulated internally.
#[derive(Debug, Default)]
pub struct MemcacheCodec {
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    /// Expecting the first line of a reply.
    #[default]
    Line,
    /// Inside a `VALUE` sequence, expecting `VALUE ...` or `END`.
    Values { collected: Vec<Value> },
    /// Expecting `len + 2` bytes of value data.
    ValueData {
        key: String,
        flags: u32,
        cas: Option<u64>,
        len: usize,
        collected: Vec<Value>,
    },
    /// Inside a `STAT` sequence, expecting `STAT ...` or `END`.
    Stats { collected: HashMap<String, String> },
}

impl Encoder<Request> for MemcacheCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match item {
            Request::Get { keys, with_cas } => {
                // validate everything before the first write so a rejected
                // request never leaves a partial command in the buffer
                for key in &keys {
                    check_key(key)?;
                }
                dst.put_slice(if with_cas { b"gets" } else { b"get" });
                for key in &keys {
                    dst.put_u8(b' ');
                    dst.put_slice(key.as_bytes());
                }
            }
            Request::Store {
                verb,
                key,
                flags,
                exptime,
                data,
                cas,
            } => {
                check_key(&key)?;
                if data.len() > MAX_VALUE_SIZE {
                    return Err(ProtocolError::ValueTooLarge(data.len()));
                }
                dst.put_slice(
                    format!("{} {} {} {} {}", verb.wire(), key, flags, exptime, data.len())
                        .as_bytes(),
                );
                if let Some(cas) = cas {
                    dst.put_slice(format!(" {cas}").as_bytes());
                }
                dst.put_slice(b"\r\n");
                dst.put_slice(&data);
            }
            Request::Delete { key } => {
                check_key(&key)?;
                dst.put_slice(format!("delete {key}").as_bytes());
            }
            Request::Incr { key, amount } => {
                check_key(&key)?;
                dst.put_slice(format!("incr {key} {amount}").as_bytes());
            }
            Request::Decr { key, amount } => {
                check_key(&key)?;
                dst.put_slice(format!("decr {key} {amount}").as_bytes());
            }
            Request::FlushAll => dst.put_slice(b"flush_all"),
            Request::Stats { arg } => match arg {
                Some(arg) => dst.put_slice(format!("stats {arg}").as_bytes()),
                None => dst.put_slice(b"stats"),
            },
            Request::Version => dst.put_slice(b"version"),
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

impl Decoder for MemcacheCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, ProtocolError> {
        loop {
            match std::mem::take(&mut self.state) {
                DecodeState::Line => match take_line(src)? {
                    None => return Ok(None),
                    Some(line) => {
                        if let Some(resp) = self.start_line(&line)? {
                            return Ok(Some(resp));
                        }
                    }
                },
                DecodeState::Values { collected } => match take_line(src)? {
                    None => {
                        self.state = DecodeState::Values { collected };
                        return Ok(None);
                    }
                    Some(line) => {
                        if line == "END" {
                            return Ok(Some(Response::Values(collected)));
                        }
                        self.state = parse_value_header(&line, collected)?;
                    }
                },
                DecodeState::ValueData {
                    key,
                    flags,
                    cas,
                    len,
                    mut collected,
                } => {
                    if src.len() < len + 2 {
                        src.reserve(len + 2 - src.len());
                        self.state = DecodeState::ValueData {
                            key,
                            flags,
                            cas,
                            len,
                            collected,
                        };
                        return Ok(None);
                    }
                    let data = src.split_to(len).freeze();
                    let trailer = src.split_to(2);
                    if &trailer[..] != b"\r\n" {
                        return Err(ProtocolError::BadReply(
                            "value block not terminated by CRLF".into(),
                        ));
                    }
                    collected.push(Value {
                        key,
                        flags,
                        cas,
                        data,
                    });
                    self.state = DecodeState::Values { collected };
                }
                DecodeState::Stats { mut collected } => match take_line(src)? {
                    None => {
                        self.state = DecodeState::Stats { collected };
                        return Ok(None);
                    }
                    Some(line) => {
                        if line == "END" {
                            return Ok(Some(Response::Stats(collected)));
                        }
                        let rest = line
                            .strip_prefix("STAT ")
                            .ok_or_else(|| ProtocolError::BadReply(line.clone()))?;
                        let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
                        collected.insert(name.to_owned(), value.to_owned());
                    }
                },
            }
        }
    }
}

impl MemcacheCodec {
    /// Handles the first line of a reply. Returns a complete response for
    /// single-line replies, or updates the state machine and returns `None`.
    fn start_line(&mut self, line: &str) -> Result<Option<Response>, ProtocolError> {
        let resp = match line {
            "STORED" => Response::Stored,
            "NOT_STORED" => Response::NotStored,
            "EXISTS" => Response::Exists,
            "NOT_FOUND" => Response::NotFound,
            "DELETED" => Response::Deleted,
            "OK" => Response::Ok,
            "ERROR" => Response::Error("unknown command".into()),
            // A lone END terminates an empty retrieval (or empty stats).
            "END" => Response::Values(Vec::new()),
            _ => {
                if let Some(msg) = line
                    .strip_prefix("CLIENT_ERROR ")
                    .or_else(|| line.strip_prefix("SERVER_ERROR "))
                {
                    Response::Error(msg.to_owned())
                } else if let Some(version) = line.strip_prefix("VERSION ") {
                    Response::Version(version.to_owned())
                } else if line.starts_with("VALUE ") {
                    self.state = parse_value_header(line, Vec::new())?;
                    return Ok(None);
                } else if let Some(rest) = line.strip_prefix("STAT ") {
                    let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
                    let mut collected = HashMap::new();
                    collected.insert(name.to_owned(), value.to_owned());
                    self.state = DecodeState::Stats { collected };
                    return Ok(None);
                } else if !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit()) {
                    let n = line
                        .parse::<u64>()
                        .map_err(|_| ProtocolError::BadReply(line.to_owned()))?;
                    Response::Number(n)
                } else {
                    return Err(ProtocolError::BadReply(line.to_owned()));
                }
            }
        };
        Ok(Some(resp))
    }
}

/// Splits one CRLF-terminated line off the buffer, if complete.
fn take_line(src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
    match src.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = src.split_to(pos);
            src.advance(2);
            String::from_utf8(line.to_vec())
                .map(Some)
                .map_err(|_| ProtocolError::BadReply("non-UTF-8 reply line".into()))
        }
        None if src.len() > MAX_LINE => Err(ProtocolError::LineTooLong),
        None => Ok(None),
    }
}

/// Parses a `VALUE <key> <flags> <bytes> [<cas>]` header line.
fn parse_value_header(line: &str, collected: Vec<Value>) -> Result<DecodeState, ProtocolError> {
    let bad = || ProtocolError::BadReply(line.to_owned());
    let mut parts = line.split_ascii_whitespace();
    if parts.next() != Some("VALUE") {
        return Err(bad());
    }
    let key = parts.next().ok_or_else(bad)?.to_owned();
    let flags = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let len: usize = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let cas = match parts.next() {
        Some(cas) => Some(cas.parse().map_err(|_| bad())?),
        None => None,
    };
    if parts.next().is_some() {
        return Err(bad());
    }
    if len > MAX_VALUE_SIZE {
        return Err(ProtocolError::ValueTooLarge(len));
    }
    Ok(DecodeState::ValueData {
        key,
        flags,
        cas,
        len,
        collected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(req: Request) -> String {
        let mut codec = MemcacheCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(req, &mut buf).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    fn decode_all(input: &str) -> Vec<Response> {
        let mut codec = MemcacheCodec::default();
        let mut buf = BytesMut::from(input.as_bytes());
        let mut out = Vec::new();
        while let Some(resp) = codec.decode(&mut buf).unwrap() {
            out.push(resp);
        }
        out
    }

    #[test]
    fn test_encode_get() {
        let req = Request::Get {
            keys: vec!["key1".into(), "key2".into()],
            with_cas: false,
        };
        assert_eq!(encode(req), "get key1 key2\r\n");
    }

    #[test]
    fn test_encode_gets() {
        let req = Request::Get {
            keys: vec!["key1".into()],
            with_cas: true,
        };
        assert_eq!(encode(req), "gets key1\r\n");
    }

    #[test]
    fn test_encode_set() {
        let req = Request::Store {
            verb: StoreVerb::Set,
            key: "key1".into(),
            flags: 0,
            exptime: 0,
            data: Bytes::from_static(b"value"),
            cas: None,
        };
        assert_eq!(encode(req), "set key1 0 0 5\r\nvalue\r\n");
    }

    #[test]
    fn test_encode_cas() {
        let req = Request::Store {
            verb: StoreVerb::Cas,
            key: "key1".into(),
            flags: 7,
            exptime: 30,
            data: Bytes::from_static(b"v"),
            cas: Some(42),
        };
        assert_eq!(encode(req), "cas key1 7 30 1 42\r\nv\r\n");
    }

    #[test]
    fn test_encode_single_line_commands() {
        assert_eq!(encode(Request::Delete { key: "k".into() }), "delete k\r\n");
        assert_eq!(
            encode(Request::Incr {
                key: "k".into(),
                amount: 2
            }),
            "incr k 2\r\n"
        );
        assert_eq!(encode(Request::FlushAll), "flush_all\r\n");
        assert_eq!(encode(Request::Stats { arg: None }), "stats\r\n");
        assert_eq!(
            encode(Request::Stats {
                arg: Some("items".into())
            }),
            "stats items\r\n"
        );
        assert_eq!(encode(Request::Version), "version\r\n");
    }

    #[test]
    fn test_encode_rejects_bad_keys() {
        let mut codec = MemcacheCodec::default();
        let mut buf = BytesMut::new();
        for key in ["", "has space", "has\nnewline", &"x".repeat(251)] {
            let req = Request::Delete { key: (*key).into() };
            assert!(matches!(
                codec.encode(req, &mut buf),
                Err(ProtocolError::BadKey(_))
            ));
        }
    }

    #[test]
    fn test_decode_single_line_replies() {
        assert_eq!(decode_all("STORED\r\n"), vec![Response::Stored]);
        assert_eq!(decode_all("NOT_STORED\r\n"), vec![Response::NotStored]);
        assert_eq!(decode_all("DELETED\r\n"), vec![Response::Deleted]);
        assert_eq!(decode_all("NOT_FOUND\r\n"), vec![Response::NotFound]);
        assert_eq!(decode_all("OK\r\n"), vec![Response::Ok]);
        assert_eq!(decode_all("5\r\n"), vec![Response::Number(5)]);
        assert_eq!(
            decode_all("VERSION 1.6.21\r\n"),
            vec![Response::Version("1.6.21".into())]
        );
    }

    #[test]
    fn test_decode_values() {
        let replies = decode_all("VALUE key1 0 1\r\n1\r\nVALUE key2 3 2 9\r\nab\r\nEND\r\n");
        assert_eq!(
            replies,
            vec![Response::Values(vec![
                Value {
                    key: "key1".into(),
                    flags: 0,
                    cas: None,
                    data: Bytes::from_static(b"1"),
                },
                Value {
                    key: "key2".into(),
                    flags: 3,
                    cas: Some(9),
                    data: Bytes::from_static(b"ab"),
                },
            ])]
        );
    }

    #[test]
    fn test_decode_empty_retrieval() {
        assert_eq!(decode_all("END\r\n"), vec![Response::Values(Vec::new())]);
    }

    #[test]
    fn test_decode_value_containing_crlf() {
        let replies = decode_all("VALUE k 0 4\r\na\r\nb\r\nEND\r\n");
        assert_eq!(
            replies,
            vec![Response::Values(vec![Value {
                key: "k".into(),
                flags: 0,
                cas: None,
                data: Bytes::from_static(b"a\r\nb"),
            }])]
        );
    }

    #[test]
    fn test_decode_incremental_feed() {
        let mut codec = MemcacheCodec::default();
        let mut buf = BytesMut::new();
        for chunk in ["VALUE k ", "0 3\r\nab", "c\r\nEN", "D\r\n"] {
            buf.extend_from_slice(chunk.as_bytes());
        }
        // feed byte by byte to exercise every partial-state return
        let full = buf.split();
        let mut partial = BytesMut::new();
        let mut out = None;
        for b in full {
            partial.extend_from_slice(&[b]);
            if let Some(resp) = codec.decode(&mut partial).unwrap() {
                out = Some(resp);
            }
        }
        assert_eq!(
            out,
            Some(Response::Values(vec![Value {
                key: "k".into(),
                flags: 0,
                cas: None,
                data: Bytes::from_static(b"abc"),
            }]))
        );
    }

    #[test]
    fn test_decode_stats() {
        let replies = decode_all("STAT pid 1\r\nSTAT uptime 2\r\nEND\r\n");
        let mut expected = HashMap::new();
        expected.insert("pid".to_owned(), "1".to_owned());
        expected.insert("uptime".to_owned(), "2".to_owned());
        assert_eq!(replies, vec![Response::Stats(expected)]);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            decode_all("ERROR\r\n"),
            vec![Response::Error("unknown command".into())]
        );
        assert_eq!(
            decode_all("CLIENT_ERROR bad data chunk\r\n"),
            vec![Response::Error("bad data chunk".into())]
        );
        assert_eq!(
            decode_all("SERVER_ERROR out of memory\r\n"),
            vec![Response::Error("out of memory".into())]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut codec = MemcacheCodec::default();
        let mut buf = BytesMut::from(&b"WHAT IS THIS\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::BadReply(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_line() {
        let mut codec = MemcacheCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'x'; MAX_LINE + 1]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::LineTooLong)
        ));
    }
}
