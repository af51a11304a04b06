//! RDCleanPath handshake PDU.
//!
//! The browser client and the gateway exchange one request and one response
//! encoded as a DER `SEQUENCE` whose fields are wrapped in EXPLICIT
//! context-specific tags. Every field but `version` is optional and absent
//! fields are simply not encoded.
//!
//! The wire contract lives in [`PDU_SCHEMA`] and [`ERROR_SCHEMA`]; the generic
//! [`encode_fields`]/[`decode_fields`] routines walk those tables, so the tag
//! numbering can be checked against other implementations by reading one
//! table.
//!
//! ```text
//! RDCleanPathPdu ::= SEQUENCE {
//!     version           [0] INTEGER,
//!     error             [1] RDCleanPathErr OPTIONAL,
//!     destination       [2] UTF8String OPTIONAL,
//!     proxyAuth         [3] UTF8String OPTIONAL,
//!     serverAuth        [4] UTF8String OPTIONAL,
//!     preconnectionBlob [5] UTF8String OPTIONAL,
//!     x224ConnectionPdu [6] OCTET STRING OPTIONAL,
//!     serverCertChain   [7] SEQUENCE OF OCTET STRING OPTIONAL,
//!     -- [8] reserved
//!     serverAddr        [9] UTF8String OPTIONAL
//! }
//! ```

use crate::der::{
    context_number, context_tag, integer_content, parse_integer, write_tlv, DerReader,
    TAG_IA5_STRING, TAG_INTEGER, TAG_OCTET_STRING, TAG_PRINTABLE_STRING, TAG_SEQUENCE,
    TAG_UTF8_STRING,
};
use crate::error::PduError;

/// Version numbers start after the RDP port number.
pub const BASE_VERSION: u64 = 3389;

/// Handshake protocol version 1.
pub const VERSION_1: u64 = BASE_VERSION + 1;

/// Error code for failures without a more specific code.
pub const GENERAL_ERROR_CODE: u16 = 1;

/// Wire type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Non-negative INTEGER.
    Integer,
    /// Nested [`CleanPathError`] SEQUENCE.
    ErrorInfo,
    /// UTF8String on encode; UTF8String, PrintableString or IA5String on decode.
    Text,
    /// OCTET STRING.
    Bytes,
    /// SEQUENCE OF OCTET STRING.
    BytesSequence,
}

impl FieldKind {
    /// Name of the DER type, used in errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Integer => "INTEGER",
            FieldKind::ErrorInfo | FieldKind::BytesSequence => "SEQUENCE",
            FieldKind::Text => "string",
            FieldKind::Bytes => "OCTET STRING",
        }
    }
}

/// One row of a schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Context-specific tag number.
    pub tag: u8,
    /// Field name, used in errors.
    pub name: &'static str,
    /// Whether the field may be absent.
    pub optional: bool,
    /// Wire type.
    pub kind: FieldKind,
}

const fn field(tag: u8, name: &'static str, optional: bool, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        tag,
        name,
        optional,
        kind,
    }
}

/// Fields of [`CleanPathPdu`], in ascending tag order.
pub const PDU_SCHEMA: &[FieldSpec] = &[
    field(0, "version", false, FieldKind::Integer),
    field(1, "error", true, FieldKind::ErrorInfo),
    field(2, "destination", true, FieldKind::Text),
    field(3, "proxy_auth", true, FieldKind::Text),
    field(4, "server_auth", true, FieldKind::Text),
    field(5, "preconnection_blob", true, FieldKind::Text),
    field(6, "x224_connection_pdu", true, FieldKind::Bytes),
    field(7, "server_cert_chain", true, FieldKind::BytesSequence),
    field(9, "server_addr", true, FieldKind::Text),
];

/// Fields of [`CleanPathError`], in ascending tag order.
pub const ERROR_SCHEMA: &[FieldSpec] = &[
    field(0, "error_code", false, FieldKind::Integer),
    field(1, "http_status_code", true, FieldKind::Integer),
    field(2, "wsa_last_error", true, FieldKind::Integer),
    field(3, "tls_alert_code", true, FieldKind::Integer),
];

/// A field value borrowed from a struct for encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRef<'a> {
    Integer(u64),
    ErrorInfo(&'a CleanPathError),
    Text(&'a str),
    Bytes(&'a [u8]),
    BytesSequence(&'a [Vec<u8>]),
}

impl FieldRef<'_> {
    fn kind(&self) -> FieldKind {
        match self {
            FieldRef::Integer(_) => FieldKind::Integer,
            FieldRef::ErrorInfo(_) => FieldKind::ErrorInfo,
            FieldRef::Text(_) => FieldKind::Text,
            FieldRef::Bytes(_) => FieldKind::Bytes,
            FieldRef::BytesSequence(_) => FieldKind::BytesSequence,
        }
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Integer(u64),
    ErrorInfo(CleanPathError),
    Text(String),
    Bytes(Vec<u8>),
    BytesSequence(Vec<Vec<u8>>),
}

/// A struct whose wire form is described by a schema table.
pub trait TaggedStruct: Default {
    /// Schema rows in ascending tag order.
    const SCHEMA: &'static [FieldSpec];

    /// Current value of the field with `tag`, or `None` when absent.
    fn field(&self, tag: u8) -> Option<FieldRef<'_>>;

    /// Store a decoded value for `spec`.
    fn set_field(&mut self, spec: &FieldSpec, value: FieldValue) -> Result<(), PduError>;
}

/// Encode `value` as a DER SEQUENCE following its schema.
pub fn encode_fields<T: TaggedStruct>(value: &T) -> Result<Vec<u8>, PduError> {
    let mut content = Vec::new();

    for spec in T::SCHEMA {
        let Some(field) = value.field(spec.tag) else {
            if spec.optional {
                continue;
            }
            return Err(PduError::MissingField(spec.name));
        };
        debug_assert_eq!(field.kind(), spec.kind, "field `{}` kind mismatch", spec.name);

        let mut inner = Vec::new();
        encode_value(&mut inner, field)?;
        write_tlv(&mut content, context_tag(spec.tag), &inner)?;
    }

    let mut out = Vec::with_capacity(content.len() + 4);
    write_tlv(&mut out, TAG_SEQUENCE, &content)?;
    Ok(out)
}

fn encode_value(out: &mut Vec<u8>, field: FieldRef<'_>) -> Result<(), PduError> {
    match field {
        FieldRef::Integer(v) => write_tlv(out, TAG_INTEGER, &integer_content(v)),
        FieldRef::ErrorInfo(err) => {
            out.extend_from_slice(&encode_fields(err)?);
            Ok(())
        }
        FieldRef::Text(s) => write_tlv(out, TAG_UTF8_STRING, s.as_bytes()),
        FieldRef::Bytes(b) => write_tlv(out, TAG_OCTET_STRING, b),
        FieldRef::BytesSequence(items) => {
            let mut seq = Vec::new();
            for item in items {
                write_tlv(&mut seq, TAG_OCTET_STRING, item)?;
            }
            write_tlv(out, TAG_SEQUENCE, &seq)
        }
    }
}

/// Decode the content octets of a SEQUENCE following `T`'s schema.
pub fn decode_fields<T: TaggedStruct>(content: &[u8]) -> Result<T, PduError> {
    let mut reader = DerReader::new(content);
    let mut out = T::default();
    let mut seen: u32 = 0;
    let mut previous: Option<u8> = None;

    while !reader.is_empty() {
        let tlv = reader.read_tlv()?;
        let tag = context_number(tlv.tag).ok_or(PduError::UnexpectedTag {
            expected: "context-specific field",
            actual: tlv.tag,
        })?;

        if let Some(previous) = previous {
            if tag <= previous {
                return Err(PduError::FieldOutOfOrder { tag, previous });
            }
        }

        let spec = T::SCHEMA
            .iter()
            .find(|s| s.tag == tag)
            .ok_or(PduError::UnknownField(tag))?;

        let value = decode_value(spec, tlv.content)?;
        out.set_field(spec, value)?;

        seen |= 1 << tag;
        previous = Some(tag);
    }

    if let Some(missing) = T::SCHEMA
        .iter()
        .find(|s| !s.optional && seen & (1 << s.tag) == 0)
    {
        return Err(PduError::MissingField(missing.name));
    }

    Ok(out)
}

/// Decode the single TLV inside an EXPLICIT wrapper.
fn decode_value(spec: &FieldSpec, explicit: &[u8]) -> Result<FieldValue, PduError> {
    let mut reader = DerReader::new(explicit);
    let inner = reader.read_tlv()?;
    if !reader.is_empty() {
        return Err(PduError::TrailingData(reader.remaining().len()));
    }

    match spec.kind {
        FieldKind::Integer => {
            expect_tag(inner.tag, TAG_INTEGER, spec.kind.as_str())?;
            Ok(FieldValue::Integer(parse_integer(inner.content)?))
        }
        FieldKind::ErrorInfo => {
            expect_tag(inner.tag, TAG_SEQUENCE, spec.kind.as_str())?;
            Ok(FieldValue::ErrorInfo(decode_fields(inner.content)?))
        }
        FieldKind::Text => match inner.tag {
            TAG_UTF8_STRING | TAG_PRINTABLE_STRING | TAG_IA5_STRING => {
                let text = std::str::from_utf8(inner.content)
                    .map_err(|_| PduError::InvalidUtf8 { field: spec.name })?;
                Ok(FieldValue::Text(text.to_string()))
            }
            actual => Err(PduError::UnexpectedTag {
                expected: spec.kind.as_str(),
                actual,
            }),
        },
        FieldKind::Bytes => {
            expect_tag(inner.tag, TAG_OCTET_STRING, spec.kind.as_str())?;
            Ok(FieldValue::Bytes(inner.content.to_vec()))
        }
        FieldKind::BytesSequence => {
            expect_tag(inner.tag, TAG_SEQUENCE, spec.kind.as_str())?;
            let mut items = DerReader::new(inner.content);
            let mut out = Vec::new();
            while !items.is_empty() {
                out.push(items.read_expected(TAG_OCTET_STRING, "OCTET STRING")?.to_vec());
            }
            Ok(FieldValue::BytesSequence(out))
        }
    }
}

fn expect_tag(actual: u8, expected: u8, name: &'static str) -> Result<(), PduError> {
    if actual == expected {
        Ok(())
    } else {
        Err(PduError::UnexpectedTag {
            expected: name,
            actual,
        })
    }
}

fn kind_mismatch(spec: &FieldSpec) -> PduError {
    PduError::UnexpectedTag {
        expected: spec.kind.as_str(),
        actual: context_tag(spec.tag),
    }
}

/// Error details carried in field `[1]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanPathError {
    pub error_code: u16,
    pub http_status_code: Option<u16>,
    pub wsa_last_error: Option<u16>,
    pub tls_alert_code: Option<u8>,
}

impl CleanPathError {
    /// Error with only a code.
    pub fn new(error_code: u16) -> Self {
        Self {
            error_code,
            ..Self::default()
        }
    }
}

impl TaggedStruct for CleanPathError {
    const SCHEMA: &'static [FieldSpec] = ERROR_SCHEMA;

    fn field(&self, tag: u8) -> Option<FieldRef<'_>> {
        match tag {
            0 => Some(FieldRef::Integer(u64::from(self.error_code))),
            1 => self.http_status_code.map(|v| FieldRef::Integer(u64::from(v))),
            2 => self.wsa_last_error.map(|v| FieldRef::Integer(u64::from(v))),
            3 => self.tls_alert_code.map(|v| FieldRef::Integer(u64::from(v))),
            _ => None,
        }
    }

    fn set_field(&mut self, spec: &FieldSpec, value: FieldValue) -> Result<(), PduError> {
        let FieldValue::Integer(v) = value else {
            return Err(kind_mismatch(spec));
        };
        let out_of_range = || PduError::IntegerOutOfRange { field: spec.name };

        match spec.tag {
            0 => self.error_code = u16::try_from(v).map_err(|_| out_of_range())?,
            1 => self.http_status_code = Some(u16::try_from(v).map_err(|_| out_of_range())?),
            2 => self.wsa_last_error = Some(u16::try_from(v).map_err(|_| out_of_range())?),
            3 => self.tls_alert_code = Some(u8::try_from(v).map_err(|_| out_of_range())?),
            _ => return Err(kind_mismatch(spec)),
        }
        Ok(())
    }
}

/// The RDCleanPath request/response structure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanPathPdu {
    pub version: u64,
    pub error: Option<CleanPathError>,
    pub destination: Option<String>,
    pub proxy_auth: Option<String>,
    pub server_auth: Option<String>,
    pub preconnection_blob: Option<String>,
    pub x224_connection_pdu: Option<Vec<u8>>,
    pub server_cert_chain: Option<Vec<Vec<u8>>>,
    pub server_addr: Option<String>,
}

impl CleanPathPdu {
    /// Request sent by a client asking the gateway to reach `destination`.
    pub fn request(
        destination: impl Into<String>,
        preconnection_blob: Option<String>,
        x224_connection_pdu: Vec<u8>,
    ) -> Self {
        Self {
            version: VERSION_1,
            destination: Some(destination.into()),
            preconnection_blob,
            x224_connection_pdu: Some(x224_connection_pdu),
            ..Self::default()
        }
    }

    /// Response carrying the server's X.224 confirm and TLS certificate chain.
    pub fn response(
        server_addr: impl Into<String>,
        x224_connection_pdu: Vec<u8>,
        server_cert_chain: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            version: VERSION_1,
            x224_connection_pdu: Some(x224_connection_pdu),
            server_cert_chain: Some(server_cert_chain),
            server_addr: Some(server_addr.into()),
            ..Self::default()
        }
    }

    /// Response reporting a failure.
    pub fn error_response(error: CleanPathError) -> Self {
        Self {
            version: VERSION_1,
            error: Some(error),
            ..Self::default()
        }
    }

    /// Encode to DER.
    pub fn encode(&self) -> Result<Vec<u8>, PduError> {
        encode_fields(self)
    }

    /// Decode exactly one PDU; trailing bytes are an error.
    pub fn decode(src: &[u8]) -> Result<Self, PduError> {
        let mut reader = DerReader::new(src);
        let content = reader.read_expected(TAG_SEQUENCE, "SEQUENCE")?;
        if !reader.is_empty() {
            return Err(PduError::TrailingData(reader.remaining().len()));
        }
        decode_fields(content)
    }
}

impl TaggedStruct for CleanPathPdu {
    const SCHEMA: &'static [FieldSpec] = PDU_SCHEMA;

    fn field(&self, tag: u8) -> Option<FieldRef<'_>> {
        match tag {
            0 => Some(FieldRef::Integer(self.version)),
            1 => self.error.as_ref().map(FieldRef::ErrorInfo),
            2 => self.destination.as_deref().map(FieldRef::Text),
            3 => self.proxy_auth.as_deref().map(FieldRef::Text),
            4 => self.server_auth.as_deref().map(FieldRef::Text),
            5 => self.preconnection_blob.as_deref().map(FieldRef::Text),
            6 => self.x224_connection_pdu.as_deref().map(FieldRef::Bytes),
            7 => self.server_cert_chain.as_deref().map(FieldRef::BytesSequence),
            9 => self.server_addr.as_deref().map(FieldRef::Text),
            _ => None,
        }
    }

    fn set_field(&mut self, spec: &FieldSpec, value: FieldValue) -> Result<(), PduError> {
        match (spec.tag, value) {
            (0, FieldValue::Integer(v)) => self.version = v,
            (1, FieldValue::ErrorInfo(e)) => self.error = Some(e),
            (2, FieldValue::Text(s)) => self.destination = Some(s),
            (3, FieldValue::Text(s)) => self.proxy_auth = Some(s),
            (4, FieldValue::Text(s)) => self.server_auth = Some(s),
            (5, FieldValue::Text(s)) => self.preconnection_blob = Some(s),
            (6, FieldValue::Bytes(b)) => self.x224_connection_pdu = Some(b),
            (7, FieldValue::BytesSequence(chain)) => self.server_cert_chain = Some(chain),
            (9, FieldValue::Text(s)) => self.server_addr = Some(s),
            _ => return Err(kind_mismatch(spec)),
        }
        Ok(())
    }
}
