//! Browser ClientHello forgery
//!
//! Produces a ClientHello that matches Firefox 99 byte for byte: the same
//! cipher list, the same extension order and contents, and the same total
//! size. Censors fingerprint TLS clients (JA3/JA4) by exactly these fields, so
//! nothing here is negotiable. Only values that differ between any two real
//! Firefox handshakes (random, session id, SNI host, key shares) vary.
//!
//! The x25519 key share carries a caller-supplied 32-byte secret. The
//! secp256r1 share that follows it is decoy filler drawn from the system
//! CSPRNG and is never read back.
//!
//! ## Layout
//!
//! ```text
//! 01 | 0001fc | 0303 | random[32] | 20 | session_id[32]
//!    | 0022 | cipher suites[34] | 01 00 | ext_len | extensions[401]
//! ```
//!
//! A padding extension absorbs the variable SNI length so that the
//! extensions block is always 401 bytes and the message always 512.

use crate::crypto::{random_bytes, CryptoError};
use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Total size of the composed handshake message
pub const CLIENT_HELLO_LEN: usize = 512;

/// Size of the extensions block
pub const EXTENSIONS_LEN: usize = 401;

/// Offset of the first extension record (server_name)
pub const EXTENSIONS_OFFSET: usize = 111;

/// Longest server name that still leaves a non-negative padding length
pub const MAX_SERVER_NAME_LEN: usize = PADDING_BUDGET - SNI_RECORD_OVERHEAD;

/// Bytes shared between the SNI record and the padding extension body.
///
/// 401 = sni_record + 238 (fixed extensions) + 4 (padding header) + padding
const PADDING_BUDGET: usize = 159;

/// Extension header (4) + list length (2) + name type (1) + name length (2)
const SNI_RECORD_OVERHEAD: usize = 9;

/// Combined size of extension records 1..=8 (extended_master_secret through
/// delegated_credentials)
const RECORDS_BEFORE_KEY_SHARE: usize = 78;

/// Extension header (4) + client_shares length (2) + group (2) + key length (2)
const KEY_SHARE_PREFIX: usize = 10;

const DECOY_SHARE_LEN: usize = 65;

const CLIENT_VERSION: u16 = 0x0303;

const CIPHER_SUITES: [u8; 34] = [
    0x13, 0x01, // TLS_AES_128_GCM_SHA256
    0x13, 0x03, // TLS_CHACHA20_POLY1305_SHA256
    0x13, 0x02, // TLS_AES_256_GCM_SHA384
    0xc0, 0x2b, // TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
    0xc0, 0x2f, // TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
    0xcc, 0xa9, // TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
    0xcc, 0xa8, // TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
    0xc0, 0x2c, // TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
    0xc0, 0x30, // TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
    0xc0, 0x0a, // TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA
    0xc0, 0x09, // TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA
    0xc0, 0x13, // TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA
    0xc0, 0x14, // TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA
    0x00, 0x9c, // TLS_RSA_WITH_AES_128_GCM_SHA256
    0x00, 0x9d, // TLS_RSA_WITH_AES_256_GCM_SHA384
    0x00, 0x2f, // TLS_RSA_WITH_AES_128_CBC_SHA
    0x00, 0x35, // TLS_RSA_WITH_AES_256_CBC_SHA
];

// x25519, secp256r1, secp384r1, secp521r1, ffdhe2048, ffdhe3072
const SUPPORTED_GROUPS: [u8; 14] = [
    0x00, 0x0c, 0x00, 0x1d, 0x00, 0x17, 0x00, 0x18, 0x00, 0x19, 0x01, 0x00, 0x01, 0x01,
];

// h2, http/1.1
const ALPN: [u8; 14] = [
    0x00, 0x0c, 0x02, b'h', b'2', 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1',
];

const STATUS_REQUEST: [u8; 5] = [0x01, 0x00, 0x00, 0x00, 0x00];

const DELEGATED_CREDENTIALS: [u8; 10] = [0x00, 0x08, 0x04, 0x03, 0x05, 0x03, 0x06, 0x03, 0x02, 0x03];

// TLS 1.3, TLS 1.2
const SUPPORTED_VERSIONS: [u8; 5] = [0x04, 0x03, 0x04, 0x03, 0x03];

const SIGNATURE_ALGORITHMS: [u8; 24] = [
    0x00, 0x16, 0x04, 0x03, 0x05, 0x03, 0x06, 0x03, 0x08, 0x04, 0x08, 0x05, 0x08, 0x06, 0x04,
    0x01, 0x05, 0x01, 0x06, 0x01, 0x02, 0x03, 0x02, 0x01,
];

/// TLS handshake types
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello = 1,
    ServerHello = 2,
}

/// TLS extension types, in the order Firefox 99 emits them
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtensionType {
    ServerName = 0x0000,
    ExtendedMasterSecret = 0x0017,
    RenegotiationInfo = 0xff01,
    SupportedGroups = 0x000a,
    EcPointFormats = 0x000b,
    SessionTicket = 0x0023,
    ApplicationLayerProtocolNegotiation = 0x0010,
    StatusRequest = 0x0005,
    DelegatedCredentials = 0x0022,
    KeyShare = 0x0033,
    SupportedVersions = 0x002b,
    SignatureAlgorithms = 0x000d,
    PskKeyExchangeModes = 0x002d,
    RecordSizeLimit = 0x001c,
    Padding = 0x0015,
}

/// Fingerprint-related errors
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Invalid SNI: {0}")]
    InvalidSni(String),

    #[error("Server name is {len} bytes, the padding budget allows at most {max}")]
    ServerNameTooLong { len: usize, max: usize },

    #[error("Malformed ClientHello: {0}")]
    Malformed(&'static str),

    #[error("Filler generation failed: {0}")]
    Random(#[from] CryptoError),
}

/// Inputs to one ClientHello
#[derive(Debug, Clone)]
pub struct ClientHelloFields {
    /// ClientHello.random
    pub random: [u8; 32],
    /// Legacy session id (always 32 bytes for this fingerprint)
    pub session_id: [u8; 32],
    /// Host name placed in the SNI extension
    pub server_name: String,
    /// Value placed in the x25519 key share
    pub secret: [u8; 32],
}

/// Compose a Firefox 99 ClientHello handshake message (without record header)
pub fn compose_client_hello(fields: &ClientHelloFields) -> Result<Vec<u8>, FingerprintError> {
    validate_server_name(&fields.server_name)?;

    let extensions = compose_extensions(&fields.server_name, &fields.secret)?;

    let mut buf = BytesMut::with_capacity(CLIENT_HELLO_LEN);
    buf.put_u8(HandshakeType::ClientHello as u8);
    let length_pos = buf.len();
    buf.put_slice(&[0, 0, 0]);

    buf.put_u16(CLIENT_VERSION);
    buf.put_slice(&fields.random);
    buf.put_u8(fields.session_id.len() as u8);
    buf.put_slice(&fields.session_id);

    buf.put_u16(CIPHER_SUITES.len() as u16);
    buf.put_slice(&CIPHER_SUITES);

    // Compression methods: null only
    buf.put_u8(1);
    buf.put_u8(0);

    buf.put_u16(extensions.len() as u16);
    buf.put_slice(&extensions);

    let body_len = buf.len() - 4;
    buf[length_pos] = (body_len >> 16) as u8;
    buf[length_pos + 1] = (body_len >> 8) as u8;
    buf[length_pos + 2] = body_len as u8;

    debug_assert_eq!(buf.len(), CLIENT_HELLO_LEN);
    Ok(buf.to_vec())
}

/// Offset of the embedded secret for a server name of `server_name_len` bytes
pub fn secret_offset(server_name_len: usize) -> usize {
    EXTENSIONS_OFFSET
        + SNI_RECORD_OVERHEAD
        + server_name_len
        + RECORDS_BEFORE_KEY_SHARE
        + KEY_SHARE_PREFIX
}

/// Recover the 32-byte secret from a composed ClientHello
pub fn extract_secret(hello: &[u8]) -> Result<[u8; 32], FingerprintError> {
    if hello.len() != CLIENT_HELLO_LEN {
        return Err(FingerprintError::Malformed("unexpected length"));
    }
    let sni_type = u16::from_be_bytes([hello[EXTENSIONS_OFFSET], hello[EXTENSIONS_OFFSET + 1]]);
    if sni_type != ExtensionType::ServerName as u16 {
        return Err(FingerprintError::Malformed("first extension is not server_name"));
    }
    let sni_data_len =
        u16::from_be_bytes([hello[EXTENSIONS_OFFSET + 2], hello[EXTENSIONS_OFFSET + 3]]) as usize;
    let name_len = sni_data_len
        .checked_sub(SNI_RECORD_OVERHEAD - 4)
        .ok_or(FingerprintError::Malformed("server_name too short"))?;
    if name_len > MAX_SERVER_NAME_LEN {
        return Err(FingerprintError::Malformed("server_name overruns padding"));
    }

    let offset = secret_offset(name_len);
    let key_share_start = offset - KEY_SHARE_PREFIX;
    let key_share_type = u16::from_be_bytes([hello[key_share_start], hello[key_share_start + 1]]);
    if key_share_type != ExtensionType::KeyShare as u16 {
        return Err(FingerprintError::Malformed("key_share not at expected offset"));
    }

    let mut secret = [0u8; 32];
    secret.copy_from_slice(&hello[offset..offset + 32]);
    Ok(secret)
}

fn validate_server_name(name: &str) -> Result<(), FingerprintError> {
    if name.is_empty() {
        return Err(FingerprintError::InvalidSni("empty server name".to_string()));
    }
    if !name.is_ascii() {
        return Err(FingerprintError::InvalidSni(format!(
            "non-ASCII server name: {}",
            name
        )));
    }
    if name.len() > MAX_SERVER_NAME_LEN {
        return Err(FingerprintError::ServerNameTooLong {
            len: name.len(),
            max: MAX_SERVER_NAME_LEN,
        });
    }
    Ok(())
}

fn compose_extensions(server_name: &str, secret: &[u8; 32]) -> Result<BytesMut, FingerprintError> {
    let mut buf = BytesMut::with_capacity(EXTENSIONS_LEN);

    let sni = server_name_data(server_name);
    put_extension(&mut buf, ExtensionType::ServerName, &sni);
    let sni_record_len = buf.len();

    put_extension(&mut buf, ExtensionType::ExtendedMasterSecret, &[]);
    put_extension(&mut buf, ExtensionType::RenegotiationInfo, &[0x00]);
    put_extension(&mut buf, ExtensionType::SupportedGroups, &SUPPORTED_GROUPS);
    put_extension(&mut buf, ExtensionType::EcPointFormats, &[0x01, 0x00]);
    put_extension(&mut buf, ExtensionType::SessionTicket, &[]);
    put_extension(
        &mut buf,
        ExtensionType::ApplicationLayerProtocolNegotiation,
        &ALPN,
    );
    put_extension(&mut buf, ExtensionType::StatusRequest, &STATUS_REQUEST);
    put_extension(
        &mut buf,
        ExtensionType::DelegatedCredentials,
        &DELEGATED_CREDENTIALS,
    );
    put_extension(&mut buf, ExtensionType::KeyShare, &key_share_data(secret)?);
    put_extension(&mut buf, ExtensionType::SupportedVersions, &SUPPORTED_VERSIONS);
    put_extension(
        &mut buf,
        ExtensionType::SignatureAlgorithms,
        &SIGNATURE_ALGORITHMS,
    );
    put_extension(&mut buf, ExtensionType::PskKeyExchangeModes, &[0x01, 0x01]);
    put_extension(&mut buf, ExtensionType::RecordSizeLimit, &[0x40, 0x01]);

    let padding_len = PADDING_BUDGET
        .checked_sub(sni_record_len)
        .ok_or(FingerprintError::ServerNameTooLong {
            len: server_name.len(),
            max: MAX_SERVER_NAME_LEN,
        })?;
    put_extension(&mut buf, ExtensionType::Padding, &vec![0u8; padding_len]);

    debug_assert_eq!(buf.len(), EXTENSIONS_LEN);
    Ok(buf)
}

fn put_extension(buf: &mut BytesMut, ext_type: ExtensionType, data: &[u8]) {
    buf.put_u16(ext_type as u16);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
}

fn server_name_data(name: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + name.len());
    buf.put_u16((name.len() + 3) as u16); // server_name_list length
    buf.put_u8(0x00); // host_name
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
    buf
}

fn key_share_data(secret: &[u8; 32]) -> Result<BytesMut, FingerprintError> {
    let mut decoy = [0u8; DECOY_SHARE_LEN];
    random_bytes(&mut decoy)?;

    let mut buf = BytesMut::with_capacity(107);
    buf.put_u16(0x0069); // client_shares length 105
    buf.put_u16(0x001d); // x25519
    buf.put_u16(0x0020);
    buf.put_slice(secret);
    buf.put_u16(0x0017); // secp256r1
    buf.put_u16(DECOY_SHARE_LEN as u16);
    buf.put_slice(&decoy);
    Ok(buf)
}

/// JA3 fingerprint components, parsed back out of a ClientHello
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ja3Components {
    /// TLS version
    pub version: u16,
    /// Cipher suites
    pub cipher_suites: Vec<u16>,
    /// Extension types, in wire order
    pub extensions: Vec<u16>,
    /// Supported groups
    pub curves: Vec<u16>,
    /// EC point formats
    pub point_formats: Vec<u8>,
}

impl Ja3Components {
    /// Parse a ClientHello handshake message (no record header)
    pub fn from_client_hello(hello: &[u8]) -> Result<Self, FingerprintError> {
        let mut cur = hello;

        let header = take(&mut cur, 4)?;
        if header[0] != HandshakeType::ClientHello as u8 {
            return Err(FingerprintError::Malformed("not a ClientHello"));
        }
        let version = read_u16(&mut cur)?;
        take(&mut cur, 32)?;
        let sid_len = take(&mut cur, 1)?[0] as usize;
        take(&mut cur, sid_len)?;

        let cipher_len = read_u16(&mut cur)? as usize;
        let mut ciphers = take(&mut cur, cipher_len)?;
        let mut cipher_suites = Vec::with_capacity(cipher_len / 2);
        while !ciphers.is_empty() {
            cipher_suites.push(read_u16(&mut ciphers)?);
        }

        let compression_len = take(&mut cur, 1)?[0] as usize;
        take(&mut cur, compression_len)?;

        let ext_len = read_u16(&mut cur)? as usize;
        let mut exts = take(&mut cur, ext_len)?;

        let mut extensions = Vec::new();
        let mut curves = Vec::new();
        let mut point_formats = Vec::new();
        while !exts.is_empty() {
            let ext_type = read_u16(&mut exts)?;
            let len = read_u16(&mut exts)? as usize;
            let mut data = take(&mut exts, len)?;
            extensions.push(ext_type);

            if ext_type == ExtensionType::SupportedGroups as u16 {
                let list_len = read_u16(&mut data)? as usize;
                let mut list = take(&mut data, list_len)?;
                while !list.is_empty() {
                    curves.push(read_u16(&mut list)?);
                }
            } else if ext_type == ExtensionType::EcPointFormats as u16 {
                let list_len = take(&mut data, 1)?[0] as usize;
                point_formats.extend_from_slice(take(&mut data, list_len)?);
            }
        }

        Ok(Self {
            version,
            cipher_suites,
            extensions,
            curves,
            point_formats,
        })
    }

    /// Calculate JA3 hash (MD5 of fingerprint string)
    pub fn ja3_hash(&self) -> String {
        format!("{:x}", md5::compute(self.ja3_string().as_bytes()))
    }

    /// Get JA3 fingerprint string
    pub fn ja3_string(&self) -> String {
        fn join<T: ToString>(items: &[T]) -> String {
            items
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("-")
        }

        format!(
            "{},{},{},{},{}",
            self.version,
            join(&self.cipher_suites),
            join(&self.extensions),
            join(&self.curves),
            join(&self.point_formats)
        )
    }
}

fn take<'a>(cur: &mut &'a [u8], n: usize) -> Result<&'a [u8], FingerprintError> {
    if cur.len() < n {
        return Err(FingerprintError::Malformed("truncated"));
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Ok(head)
}

fn read_u16(cur: &mut &[u8]) -> Result<u16, FingerprintError> {
    let b = take(cur, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}
