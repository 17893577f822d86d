//! Disguised key exchange
//!
//! Runs once on every fresh relay connection, before it joins a session.
//!
//! 1. Generate an X25519 ephemeral pair and agree with the relay's static
//!    public key.
//! 2. Seal the 48-byte authentication block under the derived key
//!    (ChaCha20-Poly1305, nonce = first 12 bytes of the ephemeral public).
//! 3. Send a Firefox ClientHello whose random is the ephemeral public and
//!    whose session id and key share secret carry the 64 sealed bytes.
//! 4. Read the ServerHello record. Its random and key share carry the nonce
//!    and sealed session key. Open it with the same derived key.
//! 5. Discard the ChangeCipherSpec and the fake encrypted certificate.

use crate::crypto::{
    AeadAlgorithm, AeadCipher, CryptoError, EphemeralKeyPair, PublicKey, SessionKey, NONCE_LEN,
};
use crate::obfuscation::{compose_client_hello, ClientHelloFields, FingerprintError, HandshakeType};
use crate::transport::{
    read_record, write_record, Connection, ContentType, TransportError, RECORD_HEADER_LEN,
};
use crate::tunnel::EncryptionMethod;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::trace;

/// User identifier length
pub const UID_LEN: usize = 16;

/// Space reserved for the proxy method name
pub const PROXY_METHOD_LEN: usize = 12;

/// Plaintext size of the authentication block
pub const AUTH_BLOCK_LEN: usize = 48;

/// Sealed authentication block (plaintext + tag)
pub const SEALED_AUTH_LEN: usize = AUTH_BLOCK_LEN + 16;

/// Byte ranges of the ServerHello record that carry the sealed session key
const SERVER_RANDOM: std::ops::Range<usize> = 11..43;
const SERVER_KEY_SHARE: std::ops::Range<usize> = 89..121;

/// Sealed session key (32 bytes + tag)
const SEALED_KEY_LEN: usize = 48;

/// Records following the ServerHello that the client discards
const TRAILING_RECORDS: usize = 2;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Proxy method {0:?} exceeds 12 bytes")]
    ProxyMethodTooLong(String),

    #[error("Unexpected record type {0:#04x} in place of ServerHello")]
    UnexpectedRecord(u8),

    #[error("Handshake message type {0} in place of ServerHello")]
    NotServerHello(u8),

    #[error("ServerHello record too short: {0} bytes")]
    ServerHelloTooShort(usize),

    #[error("Invalid authentication block: {0}")]
    InvalidAuthBlock(&'static str),
}

/// Establishes the session key on a fresh connection
#[async_trait]
pub trait Handshaker<C: Connection>: Send + Sync + 'static {
    /// Run the exchange over `conn` and return the session key it yields
    async fn prepare(&self, conn: &mut C, session_id: u32) -> Result<SessionKey, HandshakeError>;
}

/// Identity presented to the relay
///
/// ```text
/// uid (16) | proxy method (12) | encryption method (1) | unix time (8)
///          | session id (4) | reserved (7)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBlock {
    pub uid: [u8; UID_LEN],
    pub proxy_method: String,
    pub encryption_method: EncryptionMethod,
    pub unix_time: u64,
    pub session_id: u32,
}

impl AuthBlock {
    pub fn encode(&self) -> Result<[u8; AUTH_BLOCK_LEN], HandshakeError> {
        let method = self.proxy_method.as_bytes();
        if method.len() > PROXY_METHOD_LEN {
            return Err(HandshakeError::ProxyMethodTooLong(self.proxy_method.clone()));
        }
        let mut padded = [0u8; PROXY_METHOD_LEN];
        padded[..method.len()].copy_from_slice(method);

        let mut buf = BytesMut::with_capacity(AUTH_BLOCK_LEN);
        buf.put_slice(&self.uid);
        buf.put_slice(&padded);
        buf.put_u8(self.encryption_method.id());
        buf.put_u64(self.unix_time);
        buf.put_u32(self.session_id);
        buf.put_bytes(0, 7);

        let mut out = [0u8; AUTH_BLOCK_LEN];
        out.copy_from_slice(&buf);
        Ok(out)
    }

    pub fn decode(block: &[u8]) -> Result<Self, HandshakeError> {
        if block.len() != AUTH_BLOCK_LEN {
            return Err(HandshakeError::InvalidAuthBlock("wrong length"));
        }
        let mut buf = block;

        let mut uid = [0u8; UID_LEN];
        buf.copy_to_slice(&mut uid);

        let mut method = [0u8; PROXY_METHOD_LEN];
        buf.copy_to_slice(&mut method);
        let end = method.iter().position(|&b| b == 0).unwrap_or(PROXY_METHOD_LEN);
        let proxy_method = std::str::from_utf8(&method[..end])
            .map_err(|_| HandshakeError::InvalidAuthBlock("proxy method not UTF-8"))?
            .to_string();

        let encryption_method = EncryptionMethod::from_id(buf.get_u8())
            .ok_or(HandshakeError::InvalidAuthBlock("unknown encryption method"))?;
        let unix_time = buf.get_u64();
        let session_id = buf.get_u32();

        Ok(Self {
            uid,
            proxy_method,
            encryption_method,
            unix_time,
            session_id,
        })
    }
}

/// Static inputs to every handshake of a client
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    pub uid: [u8; UID_LEN],
    pub server_public_key: PublicKey,
    pub server_name: String,
    pub proxy_method: String,
    pub encryption_method: EncryptionMethod,
    pub clock: fn() -> SystemTime,
}

/// Production [`Handshaker`]: key exchange hidden inside a browser handshake
#[derive(Debug, Clone)]
pub struct DisguisedHandshake {
    params: HandshakeParams,
}

impl DisguisedHandshake {
    pub fn new(params: HandshakeParams) -> Self {
        Self { params }
    }

    fn unix_time(&self) -> u64 {
        (self.params.clock)()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Build the ClientHello for one attempt, returning it with the key that
    /// will open the relay's reply
    fn client_hello(&self, session_id: u32) -> Result<(Vec<u8>, AeadCipher), HandshakeError> {
        let auth = AuthBlock {
            uid: self.params.uid,
            proxy_method: self.params.proxy_method.clone(),
            encryption_method: self.params.encryption_method,
            unix_time: self.unix_time(),
            session_id,
        }
        .encode()?;

        let ephemeral = EphemeralKeyPair::generate()?;
        let ephemeral_pub = *ephemeral.public();
        let shared = ephemeral.agree(self.params.server_public_key.as_bytes())?;
        let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, &shared)?;

        let sealed = cipher.seal(&nonce_from(&ephemeral_pub), &[], &auth)?;
        debug_assert_eq!(sealed.len(), SEALED_AUTH_LEN);

        let mut fields = ClientHelloFields {
            random: ephemeral_pub,
            session_id: [0u8; 32],
            server_name: self.params.server_name.clone(),
            secret: [0u8; 32],
        };
        fields.session_id.copy_from_slice(&sealed[..32]);
        fields.secret.copy_from_slice(&sealed[32..]);

        Ok((compose_client_hello(&fields)?, cipher))
    }
}

#[async_trait]
impl<C: Connection> Handshaker<C> for DisguisedHandshake {
    async fn prepare(&self, conn: &mut C, session_id: u32) -> Result<SessionKey, HandshakeError> {
        let (hello, cipher) = self.client_hello(session_id)?;
        write_record(conn, ContentType::Handshake, &hello).await?;
        trace!("ClientHello sent for session {}", session_id);

        let server_hello = read_record(conn).await?;
        let session_key = open_server_hello(&server_hello, &cipher)?;

        for _ in 0..TRAILING_RECORDS {
            read_record(conn).await?;
        }
        trace!("Handshake complete for session {}", session_id);
        Ok(session_key)
    }
}

/// Recover the session key from a ServerHello record (header included)
pub fn open_server_hello(record: &[u8], cipher: &AeadCipher) -> Result<SessionKey, HandshakeError> {
    match record.first() {
        Some(&t) if t == ContentType::Handshake as u8 => {}
        Some(&t) => return Err(HandshakeError::UnexpectedRecord(t)),
        None => return Err(HandshakeError::ServerHelloTooShort(0)),
    }
    if record.len() < SERVER_KEY_SHARE.end {
        return Err(HandshakeError::ServerHelloTooShort(record.len()));
    }
    let message_type = record[RECORD_HEADER_LEN];
    if message_type != HandshakeType::ServerHello as u8 {
        return Err(HandshakeError::NotServerHello(message_type));
    }

    let mut block = [0u8; 64];
    block[..32].copy_from_slice(&record[SERVER_RANDOM]);
    block[32..].copy_from_slice(&record[SERVER_KEY_SHARE]);

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&block[..NONCE_LEN]);
    let key = cipher.open(&nonce, &[], &block[NONCE_LEN..NONCE_LEN + SEALED_KEY_LEN])?;
    Ok(SessionKey::from_slice(&key)?)
}

fn nonce_from(ephemeral_pub: &[u8; 32]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&ephemeral_pub[..NONCE_LEN]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;
    use crate::obfuscation::{extract_secret, CLIENT_HELLO_LEN};
    use crate::transport::RECORD_HEADER_LEN;
    use tokio::io::DuplexStream;

    fn fixed_clock() -> SystemTime {
        UNIX_EPOCH + std::time::Duration::from_secs(1_650_000_000)
    }

    fn params(server_public_key: PublicKey) -> HandshakeParams {
        HandshakeParams {
            uid: [0xAB; UID_LEN],
            server_public_key,
            server_name: "www.bing.com".to_string(),
            proxy_method: "shadowsocks".to_string(),
            encryption_method: EncryptionMethod::AesGcm,
            clock: fixed_clock,
        }
    }

    /// Relay side of one handshake: checks the client's block and hands out
    /// `session_key`
    async fn fake_relay(
        mut conn: DuplexStream,
        static_pair: EphemeralKeyPair,
        session_key: [u8; 32],
    ) -> AuthBlock {
        let record = read_record(&mut conn).await.unwrap();
        assert_eq!(&record[..5], &[0x16, 0x03, 0x01, 0x02, 0x00]);
        let hello = &record[RECORD_HEADER_LEN..];
        assert_eq!(hello.len(), CLIENT_HELLO_LEN);

        let mut client_pub = [0u8; 32];
        client_pub.copy_from_slice(&hello[6..38]);
        let mut sealed = hello[39..71].to_vec();
        sealed.extend_from_slice(&extract_secret(hello).unwrap());

        let shared = static_pair.agree(&client_pub).unwrap();
        let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, &shared).unwrap();
        let auth = cipher.open(&nonce_from(&client_pub), &[], &sealed).unwrap();

        let mut reply_nonce = [0u8; NONCE_LEN];
        random_bytes(&mut reply_nonce).unwrap();
        let sealed_key = cipher.seal(&reply_nonce, &[], &session_key).unwrap();
        let mut block = reply_nonce.to_vec();
        block.extend_from_slice(&sealed_key);
        block.resize(64, 0);

        write_record(&mut conn, ContentType::Handshake, &server_hello_body(&block))
            .await
            .unwrap();
        write_record(&mut conn, ContentType::ChangeCipherSpec, &[0x01])
            .await
            .unwrap();
        write_record(&mut conn, ContentType::ApplicationData, &[0x42; 64])
            .await
            .unwrap();

        AuthBlock::decode(&auth).unwrap()
    }

    fn server_hello_body(block: &[u8]) -> Vec<u8> {
        let mut body = vec![0x02, 0x00, 0x00, 0x76, 0x03, 0x03];
        body.extend_from_slice(&block[..32]);
        body.push(0x20);
        body.extend_from_slice(&[0u8; 32]);
        body.extend_from_slice(&[0x13, 0x01, 0x00, 0x00, 0x2e]);
        body.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]);
        body.extend_from_slice(&block[32..]);
        body.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);
        body
    }

    #[test]
    fn test_auth_block_layout() {
        let block = AuthBlock {
            uid: [1; UID_LEN],
            proxy_method: "openvpn".to_string(),
            encryption_method: EncryptionMethod::ChaCha20Poly1305,
            unix_time: 0x0102030405060708,
            session_id: 0xdeadbeef,
        };
        let encoded = block.encode().unwrap();

        assert_eq!(&encoded[..16], &[1; 16]);
        assert_eq!(&encoded[16..28], b"openvpn\0\0\0\0\0");
        assert_eq!(encoded[28], 2);
        assert_eq!(&encoded[29..37], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&encoded[37..41], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&encoded[41..], &[0; 7]);
        assert_eq!(AuthBlock::decode(&encoded).unwrap(), block);
    }

    #[test]
    fn test_auth_block_rejects_long_proxy_method() {
        let block = AuthBlock {
            uid: [0; UID_LEN],
            proxy_method: "a-very-long-method".to_string(),
            encryption_method: EncryptionMethod::Plain,
            unix_time: 0,
            session_id: 0,
        };
        assert!(matches!(
            block.encode(),
            Err(HandshakeError::ProxyMethodTooLong(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_against_fake_relay() {
        let static_pair = EphemeralKeyPair::generate().unwrap();
        let server_pub = PublicKey(*static_pair.public());
        let handshake = DisguisedHandshake::new(params(server_pub));

        let (mut client, relay) = tokio::io::duplex(4096);
        let relay = tokio::spawn(fake_relay(relay, static_pair, [0x77; 32]));

        let key = handshake.prepare(&mut client, 0x1234_5678).await.unwrap();
        assert_eq!(key.as_bytes(), &[0x77; 32]);

        let auth = relay.await.unwrap();
        assert_eq!(auth.uid, [0xAB; UID_LEN]);
        assert_eq!(auth.proxy_method, "shadowsocks");
        assert_eq!(auth.encryption_method, EncryptionMethod::AesGcm);
        assert_eq!(auth.unix_time, 1_650_000_000);
        assert_eq!(auth.session_id, 0x1234_5678);
    }

    #[tokio::test]
    async fn test_handshake_unsealable_reply_fails() {
        let pair = EphemeralKeyPair::generate().unwrap();
        let handshake = DisguisedHandshake::new(params(PublicKey(*pair.public())));

        // A relay without our key cannot seal a session key we will accept
        let (mut client, mut relay) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = read_record(&mut relay).await;
            let body = server_hello_body(&[9u8; 64]);
            let _ = write_record(&mut relay, ContentType::Handshake, &body).await;
        });

        assert!(matches!(
            handshake.prepare(&mut client, 1).await,
            Err(HandshakeError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_rejects_alert() {
        let pair = EphemeralKeyPair::generate().unwrap();
        let handshake = DisguisedHandshake::new(params(PublicKey(*pair.public())));

        let (mut client, mut relay) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = read_record(&mut relay).await;
            let _ = write_record(&mut relay, ContentType::Alert, &[0x02, 0x28]).await;
        });

        assert!(matches!(
            handshake.prepare(&mut client, 1).await,
            Err(HandshakeError::UnexpectedRecord(0x15))
        ));
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_handshake_message() {
        let pair = EphemeralKeyPair::generate().unwrap();
        let handshake = DisguisedHandshake::new(params(PublicKey(*pair.public())));

        let (mut client, mut relay) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _ = read_record(&mut relay).await;
            let mut body = server_hello_body(&[9u8; 64]);
            body[0] = HandshakeType::ClientHello as u8;
            let _ = write_record(&mut relay, ContentType::Handshake, &body).await;
        });

        assert!(matches!(
            handshake.prepare(&mut client, 1).await,
            Err(HandshakeError::NotServerHello(1))
        ));
    }

    #[tokio::test]
    async fn test_handshake_eof_is_transport_error() {
        let pair = EphemeralKeyPair::generate().unwrap();
        let handshake = DisguisedHandshake::new(params(PublicKey(*pair.public())));

        let (mut client, relay) = tokio::io::duplex(4096);
        drop(relay);

        assert!(matches!(
            handshake.prepare(&mut client, 1).await,
            Err(HandshakeError::Transport(_))
        ));
    }
}
