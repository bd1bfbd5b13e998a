//! Postgres v3 message shapes, grounded on the wire formats in
//! `postgresql.org/docs/current/protocol-message-formats.html`: a `Parse` carries a
//! statement name, query text and parameter type OIDs; a `Bind` carries a portal name,
//! a statement name, per-parameter format codes and values, and result format codes; and
//! so on for the rest of the frontend/backend message set this engine needs.

use bytes::{Buf, Bytes};

use wiretap_core::error::{Error, Result};
use wiretap_core::io::{Decode, Encode};

fn get_cstr(buf: &mut Bytes) -> Result<String> {
    let bytes = &buf[..];
    let end = memchr::memchr(0, bytes).ok_or_else(|| Error::framing("unterminated cstring"))?;
    let s = std::str::from_utf8(&bytes[..end])
    .map_err(|_| Error::framing("cstring is not valid utf-8"))?
    .to_string();
    buf.advance(end + 1);
    Ok(s)
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// `Parse` (`P`): `statement\0 query\0 n_params (i16) [param_oid (i32)]*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parse {
    pub statement: String,
    pub query: String,
    pub param_types: Vec<u32>,
}

impl<'de> Decode<'de> for Parse {
    fn decode(mut buf: Bytes) -> Result<Self> {
        let statement = get_cstr(&mut buf)?;
        let query = get_cstr(&mut buf)?;
        if buf.remaining() < 2 {
            return Err(Error::framing("truncated Parse"));
        }
        let n = buf.get_i16() as usize;
        let mut param_types = Vec::with_capacity(n);
        for _ in 0..n {
            param_types.push(buf.get_u32());
        }
        Ok(Self { statement, query, param_types })
    }
}

impl<'en> Encode<'en> for Parse {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'P');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        put_cstr(buf, &self.statement);
        put_cstr(buf, &self.query);
        buf.extend_from_slice(&(self.param_types.len() as i16).to_be_bytes());
        for ty in &self.param_types {
            buf.extend_from_slice(&ty.to_be_bytes());
        }
        patch_len(buf, pos);
    }
}

/// `Bind` (`B`): `portal\0 statement\0 n_formats [i16] n_params [len(i32) value]* n_result_formats [i16]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<i16>,
    pub params: Vec<Option<Bytes>>,
    pub result_formats: Vec<i16>,
}

impl<'de> Decode<'de> for Bind {
    fn decode(mut buf: Bytes) -> Result<Self> {
        let portal = get_cstr(&mut buf)?;
        let statement = get_cstr(&mut buf)?;

        let n_formats = buf.get_i16() as usize;
        let mut param_formats = Vec::with_capacity(n_formats);
        for _ in 0..n_formats {
            param_formats.push(buf.get_i16());
        }

        let n_params = buf.get_i16() as usize;
        let mut params = Vec::with_capacity(n_params);
        for _ in 0..n_params {
            let len = buf.get_i32();
            if len < 0 {
                params.push(None);
            } else {
                params.push(Some(buf.copy_to_bytes(len as usize)));
            }
        }

        let n_result_formats = buf.get_i16() as usize;
        let mut result_formats = Vec::with_capacity(n_result_formats);
        for _ in 0..n_result_formats {
            result_formats.push(buf.get_i16());
        }

        Ok(Self { portal, statement, param_formats, params, result_formats })
    }
}

impl<'en> Encode<'en> for Bind {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'B');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        put_cstr(buf, &self.portal);
        put_cstr(buf, &self.statement);

        buf.extend_from_slice(&(self.param_formats.len() as i16).to_be_bytes());
        for f in &self.param_formats {
            buf.extend_from_slice(&f.to_be_bytes());
        }

        buf.extend_from_slice(&(self.params.len() as i16).to_be_bytes());
        for p in &self.params {
            match p {
                Some(bytes) => {
                    buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    buf.extend_from_slice(bytes);
                }
                None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }

        buf.extend_from_slice(&(self.result_formats.len() as i16).to_be_bytes());
        for f in &self.result_formats {
            buf.extend_from_slice(&f.to_be_bytes());
        }
        patch_len(buf, pos);
    }
}

/// `Execute` (`E`): `portal\0 max_rows (i32)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    pub portal: String,
    pub max_rows: i32,
}

impl<'de> Decode<'de> for Execute {
    fn decode(mut buf: Bytes) -> Result<Self> {
        let portal = get_cstr(&mut buf)?;
        let max_rows = buf.get_i32();
        Ok(Self { portal, max_rows })
    }
}

impl<'en> Encode<'en> for Execute {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'E');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        put_cstr(buf, &self.portal);
        buf.extend_from_slice(&self.max_rows.to_be_bytes());
        patch_len(buf, pos);
    }
}

/// `Query` (`Q`): simple-query text, no params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
}

impl<'de> Decode<'de> for Query {
    fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(Self { sql: get_cstr(&mut buf)? })
    }
}

impl<'en> Encode<'en> for Query {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'Q');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        put_cstr(buf, &self.sql);
        patch_len(buf, pos);
    }
}

/// `PasswordMessage` (`p`): raw password/hash bytes, opaque since they may already be
/// MD5 or SASL encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordMessage {
    pub payload: Bytes,
}

impl<'de> Decode<'de> for PasswordMessage {
    fn decode(buf: Bytes) -> Result<Self> {
        Ok(Self { payload: buf })
    }
}

impl<'en> Encode<'en> for PasswordMessage {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'p');
        buf.extend_from_slice(&((self.payload.len() + 4) as i32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }
}

/// `CommandComplete` (`C`): a command tag like `"INSERT 0 1"` or `"SELECT 3"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    pub tag: String,
}

impl<'de> Decode<'de> for CommandComplete {
    fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(Self { tag: get_cstr(&mut buf)? })
    }
}

impl<'en> Encode<'en> for CommandComplete {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'C');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        put_cstr(buf, &self.tag);
        patch_len(buf, pos);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// `RowDescription` (`T`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl<'de> Decode<'de> for RowDescription {
    fn decode(mut buf: Bytes) -> Result<Self> {
        let n = buf.get_i16() as usize;
        let mut fields = Vec::with_capacity(n);
        for _ in 0..n {
            fields.push(FieldDescription {
                    name: get_cstr(&mut buf)?,
                    table_oid: buf.get_u32(),
                    column_id: buf.get_i16(),
                    type_oid: buf.get_u32(),
                    type_size: buf.get_i16(),
                    type_modifier: buf.get_i32(),
                    format: buf.get_i16(),
                });
        }
        Ok(Self { fields })
    }
}

impl<'en> Encode<'en> for RowDescription {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'T');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&(self.fields.len() as i16).to_be_bytes());
        for f in &self.fields {
            put_cstr(buf, &f.name);
            buf.extend_from_slice(&f.table_oid.to_be_bytes());
            buf.extend_from_slice(&f.column_id.to_be_bytes());
            buf.extend_from_slice(&f.type_oid.to_be_bytes());
            buf.extend_from_slice(&f.type_size.to_be_bytes());
            buf.extend_from_slice(&f.type_modifier.to_be_bytes());
            buf.extend_from_slice(&f.format.to_be_bytes());
        }
        patch_len(buf, pos);
    }
}

/// `DataRow` (`D`): a vector of nullable column values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataRow {
    pub columns: Vec<Option<Bytes>>,
}

impl<'de> Decode<'de> for DataRow {
    fn decode(mut buf: Bytes) -> Result<Self> {
        let n = buf.get_i16() as usize;
        let mut columns = Vec::with_capacity(n);
        for _ in 0..n {
            let len = buf.get_i32();
            if len < 0 {
                columns.push(None);
            } else {
                columns.push(Some(buf.copy_to_bytes(len as usize)));
            }
        }
        Ok(Self { columns })
    }
}

impl<'en> Encode<'en> for DataRow {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'D');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&(self.columns.len() as i16).to_be_bytes());
        for col in &self.columns {
            match col {
                Some(bytes) => {
                    buf.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    buf.extend_from_slice(bytes);
                }
                None => buf.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        patch_len(buf, pos);
    }
}

/// `ParameterStatus` (`S`): `name\0 value\0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl<'de> Decode<'de> for ParameterStatus {
    fn decode(mut buf: Bytes) -> Result<Self> {
        Ok(Self { name: get_cstr(&mut buf)?, value: get_cstr(&mut buf)? })
    }
}

impl<'en> Encode<'en> for ParameterStatus {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'S');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        put_cstr(buf, &self.name);
        put_cstr(buf, &self.value);
        patch_len(buf, pos);
    }
}

/// `ReadyForQuery` (`Z`): one status byte, `I`/`T`/`E`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyForQuery {
    pub status: u8,
}

impl<'de> Decode<'de> for ReadyForQuery {
    fn decode(mut buf: Bytes) -> Result<Self> {
        if !buf.has_remaining() {
            return Err(Error::framing("empty ReadyForQuery"));
        }
        Ok(Self { status: buf.get_u8() })
    }
}

impl<'en> Encode<'en> for ReadyForQuery {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'Z');
        buf.extend_from_slice(&5i32.to_be_bytes());
        buf.push(self.status);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendKeyData {
    pub process_id: u32,
    pub secret_key: u32,
}

impl<'en> Encode<'en> for BackendKeyData {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'K');
        buf.extend_from_slice(&12i32.to_be_bytes());
        buf.extend_from_slice(&self.process_id.to_be_bytes());
        buf.extend_from_slice(&self.secret_key.to_be_bytes());
    }
}

/// `Authentication` (`R`): the sub-variant selected by the leading `i32` status code
/// (postgresql.org protocol docs, "AuthenticationOk" through "AuthenticationSASLFinal").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
}

impl Authentication {
    pub const TAG: u8 = b'R';

    pub fn is_scram(&self) -> bool {
        matches!(self, Authentication::Sasl { .. } | Authentication::SaslContinue { .. } | Authentication::SaslFinal { .. })
    }
}

impl<'de> Decode<'de> for Authentication {
    fn decode(mut buf: Bytes) -> Result<Self> {
        let code = buf.get_i32();
        Ok(match code {
                0 => Authentication::Ok,
                3 => Authentication::CleartextPassword,
                5 => {
                    let mut salt = [0u8; 4];
                    buf.copy_to_slice(&mut salt);
                    Authentication::Md5Password { salt }
                }
                10 => {
                    let mut mechanisms = Vec::new();
                    while buf.has_remaining() && buf[0] != 0 {
                        mechanisms.push(get_cstr(&mut buf)?);
                    }
                    Authentication::Sasl { mechanisms }
                }
                11 => Authentication::SaslContinue { data: buf },
                12 => Authentication::SaslFinal { data: buf },
                other => return Err(Error::protocol_violation(format!("unsupported authentication code {other}"))),
            })
    }
}

impl<'en> Encode<'en> for Authentication {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(b'R');
        let pos = buf.len();
        buf.extend_from_slice(&[0u8; 4]);
        match self {
            Authentication::Ok => buf.extend_from_slice(&0i32.to_be_bytes()),
            Authentication::CleartextPassword => buf.extend_from_slice(&3i32.to_be_bytes()),
            Authentication::Md5Password { salt } => {
                buf.extend_from_slice(&5i32.to_be_bytes());
                buf.extend_from_slice(salt);
            }
            Authentication::Sasl { mechanisms } => {
                buf.extend_from_slice(&10i32.to_be_bytes());
                for m in mechanisms {
                    put_cstr(buf, m);
                }
                buf.push(0);
            }
            Authentication::SaslContinue { data } => {
                buf.extend_from_slice(&11i32.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Authentication::SaslFinal { data } => {
                buf.extend_from_slice(&12i32.to_be_bytes());
                buf.extend_from_slice(data);
            }
        }
        patch_len(buf, pos);
    }
}

fn patch_len(buf: &mut [u8], pos: usize) {
    let len = (buf.len() - pos) as i32;
    buf[pos..pos + 4].copy_from_slice(&len.to_be_bytes());
}

/// A structured frontend request bundle, plus the opaque concatenated wire bytes
/// that produced it (: "used as a fallback when structured encoding would lose
/// fidelity").
#[derive(Debug, Clone, Default)]
pub struct PgRequest {
    pub packet_types: Vec<String>,
    pub parse: Vec<Parse>,
    pub bind: Vec<Bind>,
    pub execute: Vec<Execute>,
    pub query: Option<Query>,
    pub password: Option<PasswordMessage>,
    pub payload: Bytes,
    /// The query text each `bind[i]` resolves to via this connection's prepared
    /// statement map, filled in once the bundle is complete — `None` if
    /// `bind[i]`'s statement name is unknown to this connection.
    pub bind_queries: Vec<Option<String>>,
}

/// A structured backend response bundle.
#[derive(Debug, Clone, Default)]
pub struct PgResponse {
    pub packet_types: Vec<String>,
    pub command_complete: Vec<CommandComplete>,
    pub data_row: Vec<DataRow>,
    pub row_description: Option<RowDescription>,
    pub parameter_status: Vec<ParameterStatus>,
    pub ready_for_query: Option<ReadyForQuery>,
    pub authentication: Vec<Authentication>,
    pub payload: Bytes,
}

/// Base64 is how a persisted mock store would serialize `payload`; this core
/// doesn't persist anything itself (see [`wiretap_core::store`]) but exposes the codec
/// so an external store can round-trip the opaque fallback field faithfully.
pub fn encode_payload_base64(payload: &Bytes) -> String {
    base64::encode(payload)
}

pub fn decode_payload_base64(encoded: &str) -> Result<Bytes> {
    base64::decode(encoded)
    .map(Bytes::from)
    .map_err(|e| Error::framing(format!("invalid base64 payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        let p = Parse { statement: "s1".into(), query: "select $1".into(), param_types: vec![23] };
        let mut buf = Vec::new();
        p.encode(&mut buf);
        // Strip the leading tag byte the way the codec would before calling decode.
        let body = Bytes::copy_from_slice(&buf[5..]);
        let decoded = Parse::decode(body).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn bind_round_trips_with_null_parameter() {
        let b = Bind {
            portal: String::new(),
            statement: "s1".into(),
            param_formats: vec![0],
            params: vec![Some(Bytes::from_static(b"42")), None],
            result_formats: vec![0],
        };
        let mut buf = Vec::new();
        b.encode(&mut buf);
        let body = Bytes::copy_from_slice(&buf[5..]);
        let decoded = Bind::decode(body).unwrap();
        assert_eq!(decoded, b);
    }

    #[test]
    fn command_complete_decodes_tag() {
        let body = Bytes::from_static(b"INSERT 0 1\0");
        let cc = CommandComplete::decode(body).unwrap();
        assert_eq!(cc.tag, "INSERT 0 1");
    }

    #[test]
    fn authentication_md5_round_trips() {
        let auth = Authentication::Md5Password { salt: [1, 2, 3, 4] };
        let mut buf = Vec::new();
        auth.encode(&mut buf);
        let body = Bytes::copy_from_slice(&buf[5..]);
        let decoded = Authentication::decode(body).unwrap();
        assert_eq!(decoded, auth);
    }

    #[test]
    fn payload_base64_round_trips() {
        let payload = Bytes::from_static(b"hello world");
        let encoded = encode_payload_base64(&payload);
        let decoded = decode_payload_base64(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
