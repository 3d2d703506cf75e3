//! FastCGI record framing: the 8-byte header every record starts with,
//! the begin-request/params/stdin records a client sends, and a streaming
//! parser for the stdout records an upstream app replies with. Grounded
//! in `fcgi_proto.h`'s `FcgiEnvironment`/`FcgiResponseReader` shapes, but
//! expressed as plain encode/decode functions over byte slices rather
//! than stateful objects wrapping a raw socket.

use crate::error::{Error, Result};

pub const VERSION_1: u8 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
}

impl RecordType {
    fn from_u8(v: u8) -> Result<RecordType> {
        Ok(match v {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            other => return Err(Error::FastcgiProtocol(format!("unknown record type {}", other))),
        })
    }
}

pub const ROLE_RESPONDER: u16 = 1;
const HEADER_LEN: usize = 8;

#[derive(Copy, Clone, Debug)]
pub struct Header {
    pub version: u8,
    pub record_type: RecordType,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl Header {
    pub fn decode(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::FastcgiProtocol("truncated record header".into()));
        }
        Ok(Header {
            version: bytes[0],
            record_type: RecordType::from_u8(bytes[1])?,
            request_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            content_length: u16::from_be_bytes([bytes[4], bytes[5]]),
            padding_length: bytes[6],
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.record_type as u8);
        out.extend_from_slice(&self.request_id.to_be_bytes());
        out.extend_from_slice(&self.content_length.to_be_bytes());
        out.push(self.padding_length);
        out.push(0); // reserved
    }
}

fn record(record_type: RecordType, request_id: u16, content: &[u8]) -> Vec<u8> {
    assert!(content.len() <= u16::MAX as usize, "fastcgi record content too large");

    let header = Header {
        version: VERSION_1,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: 0,
    };

    let mut out = Vec::with_capacity(HEADER_LEN + content.len());
    header.encode_into(&mut out);
    out.extend_from_slice(content);
    out
}

pub fn begin_request(request_id: u16, role: u16, keep_conn: bool) -> Vec<u8> {
    let mut body = [0u8; 8];
    body[0..2].copy_from_slice(&role.to_be_bytes());
    body[2] = if keep_conn { 1 } else { 0 };
    record(RecordType::BeginRequest, request_id, &body)
}

/// Encodes one FastCGI name/value length: a single byte if it fits in 7
/// bits, a 4-byte big-endian length with the top bit set otherwise.
fn encode_len(len: usize, out: &mut Vec<u8>) {
    if len < 128 {
        out.push(len as u8);
    } else {
        let len = len as u32 | 0x8000_0000;
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Builds one (possibly multi-record, though practically always one)
/// `FCGI_PARAMS` stream from `params`, terminated by the empty record
/// that signals end-of-stream.
pub fn params_stream(request_id: u16, params: &[(String, String)]) -> Vec<u8> {
    let mut content = Vec::new();
    for (name, value) in params {
        encode_len(name.len(), &mut content);
        encode_len(value.len(), &mut content);
        content.extend_from_slice(name.as_bytes());
        content.extend_from_slice(value.as_bytes());
    }

    let mut out = Vec::new();
    for chunk in content.chunks(u16::MAX as usize) {
        out.extend_from_slice(&record(RecordType::Params, request_id, chunk));
    }
    out.extend_from_slice(&record(RecordType::Params, request_id, &[]));
    out
}

/// Builds an `FCGI_STDIN` stream carrying `body`, terminated the same way
/// as `params_stream`.
pub fn stdin_stream(request_id: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if body.is_empty() {
        out.extend_from_slice(&record(RecordType::Stdin, request_id, &[]));
        return out;
    }

    for chunk in body.chunks(u16::MAX as usize) {
        out.extend_from_slice(&record(RecordType::Stdin, request_id, chunk));
    }
    out.extend_from_slice(&record(RecordType::Stdin, request_id, &[]));
    out
}

/// What the upstream app sent back: accumulated `FCGI_STDOUT` payload
/// plus whether `FCGI_END_REQUEST` has been seen.
#[derive(Default)]
pub struct ResponseReader {
    body: Vec<u8>,
    done: bool,
    app_status: i32,
}

impl ResponseReader {
    pub fn new() -> ResponseReader {
        ResponseReader::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn app_status(&self) -> i32 {
        self.app_status
    }

    /// Feeds newly-received bytes, consuming as many whole records as
    /// `buf` contains. Leaves any trailing partial record for the next
    /// call by returning how many bytes it consumed.
    pub fn feed(&mut self, buf: &[u8]) -> Result<usize> {
        let mut offset = 0;

        while offset + HEADER_LEN <= buf.len() {
            let header = Header::decode(&buf[offset..])?;
            let record_len = HEADER_LEN + header.content_length as usize + header.padding_length as usize;
            if offset + record_len > buf.len() {
                break;
            }

            let content_start = offset + HEADER_LEN;
            let content_end = content_start + header.content_length as usize;

            match header.record_type {
                RecordType::Stdout => self.body.extend_from_slice(&buf[content_start..content_end]),
                RecordType::EndRequest => {
                    if header.content_length as usize >= 8 {
                        let c = &buf[content_start..content_end];
                        self.app_status = i32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                    }
                    self.done = true;
                }
                RecordType::Stderr => {}
                other => return Err(Error::FastcgiProtocol(format!("unexpected record type from upstream: {:?}", other))),
            }

            offset += record_len;
        }

        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_request_encodes_role_and_flags() {
        let bytes = begin_request(1, ROLE_RESPONDER, true);
        assert_eq!(bytes[1], RecordType::BeginRequest as u8);
        assert_eq!(&bytes[8..10], &1u16.to_be_bytes());
        assert_eq!(bytes[10], 1);
    }

    #[test]
    fn params_stream_round_trips_through_header_decode() {
        let params = vec![("REQUEST_METHOD".to_string(), "GET".to_string())];
        let bytes = params_stream(7, &params);
        let header = Header::decode(&bytes).unwrap();
        assert_eq!(header.record_type, RecordType::Params);
        assert_eq!(header.request_id, 7);
        assert!(header.content_length > 0);
    }

    #[test]
    fn response_reader_accumulates_stdout_and_flags_done() {
        let mut bytes = record(RecordType::Stdout, 1, b"hello");
        let mut end_body = [0u8; 8];
        end_body[0..4].copy_from_slice(&0i32.to_be_bytes());
        bytes.extend_from_slice(&record(RecordType::EndRequest, 1, &end_body));

        let mut reader = ResponseReader::new();
        let consumed = reader.feed(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(reader.is_done());
        assert_eq!(reader.body(), b"hello");
    }

    #[test]
    fn response_reader_leaves_a_trailing_partial_record_unconsumed() {
        let bytes = record(RecordType::Stdout, 1, b"hello");
        let mut reader = ResponseReader::new();
        let consumed = reader.feed(&bytes[..bytes.len() - 2]).unwrap();
        assert_eq!(consumed, 0);
        assert!(!reader.is_done());
    }
}
