// PostgreSQL wire protocol messages and their byte-level codec

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use std::fmt;

use super::{
    NetworkError, Result, CANCEL_REQUEST_CODE, GSSENC_REQUEST_CODE, PROTOCOL_VERSION_3,
    SSL_REQUEST_CODE,
};

/// A frontend message, classified from one complete frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMessage {
    /// Asks whether the server supports TLS.
    SslNegotiation { ssl_code: i32 },
    /// Asks whether the server supports GSSAPI encryption.
    GssEncNegotiation,
    /// Out-of-band request to cancel a query running on another connection.
    CancelRequest { process_id: i32, secret_key: i32 },
    Startup {
        protocol_version: i32,
        params: StartupParams,
    },
    SimpleQuery { query: String },
    Terminate,
    /// Anything that matched none of the shapes above.
    Unknown { first_byte: u8 },
}

/// Session parameters from a startup message, in the order the client sent them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupParams(Vec<(String, String)>);

impl StartupParams {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for StartupParams {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionStatus {
    Idle = b'I',
}

impl TransactionStatus {
    pub fn indicator(self) -> u8 {
        self as u8
    }
}

pub const FORMAT_TEXT: i16 = 0;
pub const FORMAT_BINARY: i16 = 1;

/// One column of a `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub table_oid: i32,
    pub column_number: i16,
    pub type_oid: i32,
    pub type_length: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl ColumnDescriptor {
    /// A column with every numeric attribute zeroed and text format.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_number: 0,
            type_oid: 0,
            type_length: 0,
            type_modifier: 0,
            format: FORMAT_TEXT,
        }
    }

    /// A text-format column of the given type, not backed by a table.
    pub fn text(name: impl Into<String>, type_oid: i32, type_length: i16) -> Self {
        Self {
            type_oid,
            type_length,
            type_modifier: -1,
            ..Self::new(name)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(NetworkError::InvalidColumnName(self.name.clone()));
        }
        Ok(())
    }
}

/// A backend message.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseMessage {
    AuthenticationOk,
    SslNegotiationReply { accepted: bool },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery { status: TransactionStatus },
    RowDescription { columns: Vec<ColumnDescriptor> },
    DataRow { values: Vec<Option<Vec<u8>>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,
    ErrorResponse { fields: Vec<(u8, String)> },
}

/// Severity of an `ErrorResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("ERROR"),
            Severity::Fatal => f.write_str("FATAL"),
        }
    }
}

impl ResponseMessage {
    pub fn error(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        ResponseMessage::ErrorResponse {
            fields: vec![
                (b'S', severity.to_string()),
                (b'V', severity.to_string()),
                (b'C', code.to_string()),
                (b'M', message.into()),
            ],
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            ResponseMessage::AuthenticationOk => b'R',
            ResponseMessage::SslNegotiationReply { accepted: true } => b'S',
            ResponseMessage::SslNegotiationReply { accepted: false } => b'N',
            ResponseMessage::ParameterStatus { .. } => b'S',
            ResponseMessage::BackendKeyData { .. } => b'K',
            ResponseMessage::ReadyForQuery { .. } => b'Z',
            ResponseMessage::RowDescription { .. } => b'T',
            ResponseMessage::DataRow { .. } => b'D',
            ResponseMessage::CommandComplete { .. } => b'C',
            ResponseMessage::EmptyQueryResponse => b'I',
            ResponseMessage::ErrorResponse { .. } => b'E',
        }
    }

    /// Appends the wire form of this message to `buf`.
    ///
    /// Nothing is appended when an error is returned.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            ResponseMessage::SslNegotiationReply { accepted } => {
                if *accepted {
                    return Err(NetworkError::UnsupportedCapability(
                        "accepting SSL negotiation".to_string(),
                    ));
                }
                // The only backend message without a length field
                buf.put_u8(b'N');
            }
            ResponseMessage::AuthenticationOk => {
                buf.put_u8(b'R');
                buf.put_i32(8); // fixed length
                buf.put_i32(0); // AuthenticationOk status
            }
            ResponseMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                buf.put_u8(b'K');
                buf.put_i32(12); // fixed length
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
            }
            ResponseMessage::ReadyForQuery { status } => {
                buf.put_u8(b'Z');
                buf.put_i32(5); // fixed length
                buf.put_u8(status.indicator());
            }
            ResponseMessage::EmptyQueryResponse => {
                buf.put_u8(b'I');
                buf.put_i32(4); // fixed length
            }
            ResponseMessage::ParameterStatus { name, value } => {
                put_framed(buf, b'S', |body| {
                    put_cstring(body, name);
                    put_cstring(body, value);
                })?;
            }
            ResponseMessage::RowDescription { columns } => {
                for column in columns {
                    column.validate()?;
                }
                let count = field_count(columns.len())?;
                put_framed(buf, b'T', |body| {
                    body.put_i16(count);
                    for column in columns {
                        put_cstring(body, &column.name);
                        body.put_i32(column.table_oid);
                        body.put_i16(column.column_number);
                        body.put_i32(column.type_oid);
                        body.put_i16(column.type_length);
                        body.put_i32(column.type_modifier);
                        body.put_i16(column.format);
                    }
                })?;
            }
            ResponseMessage::DataRow { values } => {
                let count = field_count(values.len())?;
                let lengths = values
                    .iter()
                    .map(|value| value.as_ref().map(|data| wire_len(data.len())).transpose())
                    .collect::<Result<Vec<_>>>()?;
                put_framed(buf, b'D', |body| {
                    body.put_i16(count);
                    for (value, len) in values.iter().zip(lengths) {
                        match (value, len) {
                            (Some(data), Some(len)) => {
                                body.put_i32(len);
                                body.put_slice(data);
                            }
                            _ => body.put_i32(-1), // NULL
                        }
                    }
                })?;
            }
            ResponseMessage::CommandComplete { tag } => {
                put_framed(buf, b'C', |body| put_cstring(body, tag))?;
            }
            ResponseMessage::ErrorResponse { fields } => {
                put_framed(buf, b'E', |body| {
                    for (field_type, value) in fields {
                        body.put_u8(*field_type);
                        put_cstring(body, value);
                    }
                    body.put_u8(0); // terminator
                })?;
            }
        }
        Ok(())
    }
}

/// Writes `tag`, a length placeholder and the body, then backfills the length.
///
/// On overflow of the length field the partial message is removed again.
fn put_framed(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) -> Result<()> {
    let tag_pos = buf.len();
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0); // placeholder for length
    body(buf);
    match wire_len(buf.len() - start) {
        Ok(len) => {
            buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
            Ok(())
        }
        Err(e) => {
            buf.truncate(tag_pos);
            Err(e)
        }
    }
}

fn wire_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| {
        NetworkError::UnsupportedCapability(format!("{} bytes in a single length field", len))
    })
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn field_count(len: usize) -> Result<i16> {
    i16::try_from(len).map_err(|_| {
        NetworkError::UnsupportedCapability(format!("{} fields in a single message", len))
    })
}

impl RequestMessage {
    /// Classifies one complete frame.
    ///
    /// Checks run in a fixed order and the first match wins: query tag,
    /// negotiation/cancel codes at offset 4, protocol 3.0 startup, terminate.
    /// Frames matching none of them become [`RequestMessage::Unknown`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let Some(&first_byte) = buf.first() else {
            return Err(NetworkError::MalformedMessage("empty message".to_string()));
        };

        if first_byte == b'Q' {
            return decode_simple_query(buf);
        }

        match read_i32_at(buf, 4) {
            Some(SSL_REQUEST_CODE) => {
                return Ok(RequestMessage::SslNegotiation {
                    ssl_code: SSL_REQUEST_CODE,
                })
            }
            Some(GSSENC_REQUEST_CODE) => return Ok(RequestMessage::GssEncNegotiation),
            Some(CANCEL_REQUEST_CODE) => return decode_cancel_request(buf),
            Some(PROTOCOL_VERSION_3) => return decode_startup(buf),
            _ => {}
        }

        if first_byte == b'X' && buf.len() == 5 && read_i32_at(buf, 1) == Some(4) {
            return Ok(RequestMessage::Terminate);
        }

        Ok(RequestMessage::Unknown { first_byte })
    }
}

fn read_i32_at(buf: &[u8], offset: usize) -> Option<i32> {
    buf.get(offset..offset + 4).map(BigEndian::read_i32)
}

fn decode_simple_query(buf: &[u8]) -> Result<RequestMessage> {
    let declared = read_i32_at(buf, 1).ok_or_else(|| {
        NetworkError::MalformedMessage("query message shorter than its header".to_string())
    })?;
    if declared < 4 {
        return Err(NetworkError::MalformedMessage(format!(
            "query length {} is below the minimum of 4",
            declared
        )));
    }

    // The length counts itself but not the tag
    let end = 1 + declared as usize;
    if end > buf.len() {
        return Err(NetworkError::MalformedMessage(format!(
            "query length {} exceeds the {} bytes available",
            declared,
            buf.len() - 1
        )));
    }

    let payload = &buf[5..end];
    let text = payload.strip_suffix(&[0]).unwrap_or(payload);
    Ok(RequestMessage::SimpleQuery {
        query: String::from_utf8_lossy(text).into_owned(),
    })
}

fn decode_cancel_request(buf: &[u8]) -> Result<RequestMessage> {
    match (read_i32_at(buf, 8), read_i32_at(buf, 12)) {
        (Some(process_id), Some(secret_key)) => Ok(RequestMessage::CancelRequest {
            process_id,
            secret_key,
        }),
        _ => Err(NetworkError::MalformedMessage(format!(
            "cancel request needs 16 bytes, got {}",
            buf.len()
        ))),
    }
}

fn decode_startup(buf: &[u8]) -> Result<RequestMessage> {
    let declared = read_i32_at(buf, 0).unwrap_or_default();
    if declared < 8 || declared as usize > buf.len() {
        return Err(NetworkError::MalformedMessage(format!(
            "startup length {} does not fit the {} bytes available",
            declared,
            buf.len()
        )));
    }

    Ok(RequestMessage::Startup {
        protocol_version: PROTOCOL_VERSION_3,
        params: parse_startup_params(&buf[8..declared as usize]),
    })
}

/// Splits a null-delimited `key\0value\0...` blob into ordered pairs.
///
/// Parsing stops at the first empty key; an unpaired trailing token is dropped.
pub fn parse_startup_params(blob: &[u8]) -> StartupParams {
    let text = String::from_utf8_lossy(blob);
    let mut tokens = text.split('\0');
    let mut params = Vec::new();

    while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
        if key.is_empty() {
            break;
        }
        params.push((key.to_string(), value.to_string()));
    }

    StartupParams(params)
}

// PostgreSQL type OIDs
pub mod type_oids {
    pub const INT4: i32 = 23;
    pub const TEXT: i32 = 25;
    pub const UUID: i32 = 2950;
}
