//! Wire-protocol framing: message headers, the internal command query used
//! for handshakes, and reply unpacking. Building application messages is the
//! message builder's job; the router only forwards already-framed bytes.

use std::sync::atomic::{AtomicI32, Ordering};

use bson::{Bson, Document};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, ErrorKind, Result};

/// The length of a wire protocol message header.
pub(crate) const HEADER_LENGTH: usize = 4 * std::mem::size_of::<i32>();

/// Replies larger than this are assumed to be garbage framing rather than a
/// legitimate response.
const MAX_MESSAGE_LENGTH: i32 = 48 * 1024 * 1024;

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// The wire protocol op codes used by the client core.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OpCode {
    Reply = 1,
    Query = 2004,
}

impl OpCode {
    fn from_i32(i: i32) -> Result<Self> {
        match i {
            1 => Ok(OpCode::Reply),
            2004 => Ok(OpCode::Query),
            other => Err(ErrorKind::InvalidResponse {
                message: format!("invalid wire protocol opcode: {}", other),
            }
            .into()),
        }
    }
}

/// The header for any wire protocol message.
#[derive(Debug, Clone)]
pub(crate) struct Header {
    pub(crate) length: i32,
    pub(crate) request_id: i32,
    pub(crate) response_to: i32,
    pub(crate) op_code: OpCode,
}

impl Header {
    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }

    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let length = reader.read_i32_le().await?;
        let request_id = reader.read_i32_le().await?;
        let response_to = reader.read_i32_le().await?;
        let op_code = OpCode::from_i32(reader.read_i32_le().await?)?;
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }
}

/// An already-framed message handed to the router: the raw bytes, the request
/// id stamped into them, and the size of the largest document in the message
/// when the builder performed one. Get-more and kill-cursors messages carry
/// no documents and leave `max_doc_size` unset, which skips the size check.
#[derive(Clone, Debug)]
pub struct RawMessage {
    /// The request id framed into `data`; replies are matched against it.
    pub request_id: i32,

    /// The complete message bytes, header included.
    pub data: Vec<u8>,

    /// The size in bytes of the largest document in the message, if any.
    pub max_doc_size: Option<i32>,
}

/// Frames `command` as a query against `db.$cmd` asking for a single result
/// document, the form every internal command (handshake, auth, getnonce)
/// takes on the wire.
pub(crate) fn build_command_query(request_id: i32, db: &str, command: &Document) -> Result<Vec<u8>> {
    let body = bson::to_vec(command)?;
    let collection = format!("{}.$cmd", db);

    let length = HEADER_LENGTH + 4 + collection.len() + 1 + 4 + 4 + body.len();
    let header = Header {
        length: length as i32,
        request_id,
        response_to: 0,
        op_code: OpCode::Query,
    };

    let mut message = Vec::with_capacity(length);
    header.write_to(&mut message);
    message.extend_from_slice(&0i32.to_le_bytes()); // flags
    message.extend_from_slice(collection.as_bytes());
    message.push(0);
    message.extend_from_slice(&0i32.to_le_bytes()); // number to skip
    message.extend_from_slice(&(-1i32).to_le_bytes()); // number to return
    message.extend_from_slice(&body);
    Ok(message)
}

/// A decoded reply payload (everything after the header).
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) flags: i32,
    #[allow(dead_code)]
    pub(crate) cursor_id: i64,
    #[allow(dead_code)]
    pub(crate) starting_from: i32,
    pub(crate) documents: Vec<Document>,
}

/// Reply flag bit signalling that the query failed and the only document is
/// an `$err` description.
pub(crate) const REPLY_QUERY_FAILURE: i32 = 1 << 1;

fn read_i32(payload: &[u8], at: usize) -> i32 {
    i32::from_le_bytes(payload[at..at + 4].try_into().unwrap())
}

/// Unpacks a reply payload into its flags, cursor metadata, and documents.
pub(crate) fn parse_reply(payload: &[u8]) -> Result<Reply> {
    if payload.len() < 20 {
        return Err(ErrorKind::InvalidResponse {
            message: format!("reply payload too short: {} bytes", payload.len()),
        }
        .into());
    }

    let flags = read_i32(payload, 0);
    let cursor_id = i64::from_le_bytes(payload[4..12].try_into().unwrap());
    let starting_from = read_i32(payload, 12);
    let number_returned = read_i32(payload, 16);

    let mut documents = Vec::with_capacity(number_returned.max(0) as usize);
    let mut remaining = &payload[20..];
    while !remaining.is_empty() {
        documents.push(Document::from_reader(&mut remaining)?);
    }

    if documents.len() != number_returned.max(0) as usize {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "reply declared {} documents but contained {}",
                number_returned,
                documents.len()
            ),
        }
        .into());
    }

    Ok(Reply {
        flags,
        cursor_id,
        starting_from,
        documents,
    })
}

/// Reads one reply addressed to `request_id` from `reader`, returning its
/// payload with the header removed.
pub(crate) async fn read_reply<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    request_id: i32,
) -> Result<Vec<u8>> {
    let header = Header::read_from(reader).await?;

    if header.response_to != request_id {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "response id {} does not match request id {}",
                header.response_to, request_id
            ),
        }
        .into());
    }
    if header.op_code != OpCode::Reply {
        return Err(ErrorKind::InvalidResponse {
            message: format!("expected a reply, got opcode {:?}", header.op_code),
        }
        .into());
    }
    if header.length < HEADER_LENGTH as i32 + 20 || header.length > MAX_MESSAGE_LENGTH {
        return Err(ErrorKind::InvalidResponse {
            message: format!("nonsensical reply length {}", header.length),
        }
        .into());
    }

    let mut payload = vec![0u8; header.length as usize - HEADER_LENGTH];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Whether a command response document reports success.
pub(crate) fn response_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Extracts a numeric error code from a server response document.
pub(crate) fn response_code(doc: &Document) -> Option<i32> {
    match doc.get("code") {
        Some(Bson::Int32(code)) => Some(*code),
        Some(Bson::Int64(code)) => Some(*code as i32),
        Some(Bson::Double(code)) => Some(*code as i32),
        _ => None,
    }
}

/// Checks a command response for failure, converting the server's error
/// document into an `Error`.
pub(crate) fn check_command_response(doc: &Document) -> Result<()> {
    if response_ok(doc) {
        return Ok(());
    }

    let message = doc
        .get_str("errmsg")
        .or_else(|_| doc.get_str("$err"))
        .unwrap_or("command failed")
        .to_string();
    Err(Error::from_server_error(response_code(doc), message))
}
