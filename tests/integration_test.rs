//! Integration tests for Shroud
//!
//! Runs the client stack against an in-process relay over real TCP:
//! - Disguised handshake and session key delivery
//! - Session bootstrap and stream echo
//! - Local proxy flows through the session manager

use base64::Engine;
use shroud::bootstrap::{BootstrapConfig, Bootstrapper, RetryPolicy};
use shroud::config::ClientConfig;
use shroud::crypto::{AeadAlgorithm, AeadCipher, EphemeralKeyPair, PublicKey, SessionKey};
use shroud::handshake::{AuthBlock, DisguisedHandshake, HandshakeParams};
use shroud::obfuscation::{extract_secret, Ja3Components, CLIENT_HELLO_LEN};
use shroud::proxy::SessionManager;
use shroud::transport::{read_record, write_record, ContentType, TcpDialer, RECORD_HEADER_LEN};
use shroud::tunnel::{Closing, EncryptionMethod, Frame, Obfuscator};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const UID: [u8; 16] = [0x5a; 16];
const SESSION_KEY: [u8; 32] = [0x3c; 32];

/// Relay that serves one connection: handshake, then echo every frame
struct FakeRelay {
    addr: SocketAddr,
    public_key: PublicKey,
    task: JoinHandle<AuthBlock>,
}

impl FakeRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let static_pair = EphemeralKeyPair::generate().unwrap();
        let public_key = PublicKey(*static_pair.public());

        let task = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let auth = accept_handshake(&mut conn, static_pair).await;
            let obfuscator =
                Obfuscator::new(auth.encryption_method, &SessionKey::new(SESSION_KEY)).unwrap();
            echo_frames(&mut conn, &obfuscator).await;
            auth
        });

        Self {
            addr,
            public_key,
            task,
        }
    }
}

async fn accept_handshake(conn: &mut TcpStream, static_pair: EphemeralKeyPair) -> AuthBlock {
    let record = read_record(conn).await.unwrap();
    assert_eq!(&record[..3], &[0x16, 0x03, 0x01]);
    let hello = &record[RECORD_HEADER_LEN..];
    assert_eq!(hello.len(), CLIENT_HELLO_LEN);

    let mut client_pub = [0u8; 32];
    client_pub.copy_from_slice(&hello[6..38]);
    let mut sealed = hello[39..71].to_vec();
    sealed.extend_from_slice(&extract_secret(hello).unwrap());

    let shared = static_pair.agree(&client_pub).unwrap();
    let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, &shared).unwrap();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&client_pub[..12]);
    let auth = cipher.open(&nonce, &[], &sealed).unwrap();

    let reply_nonce = [0x11u8; 12];
    let mut block = reply_nonce.to_vec();
    block.extend_from_slice(&cipher.seal(&reply_nonce, &[], &SESSION_KEY).unwrap());
    block.resize(64, 0);

    let mut server_hello = vec![0x02, 0x00, 0x00, 0x76, 0x03, 0x03];
    server_hello.extend_from_slice(&block[..32]);
    server_hello.push(0x20);
    server_hello.extend_from_slice(&hello[39..71]);
    server_hello.extend_from_slice(&[0x13, 0x01, 0x00, 0x00, 0x2e]);
    server_hello.extend_from_slice(&[0x00, 0x33, 0x00, 0x24, 0x00, 0x1d, 0x00, 0x20]);
    server_hello.extend_from_slice(&block[32..]);
    server_hello.extend_from_slice(&[0x00, 0x2b, 0x00, 0x02, 0x03, 0x04]);

    write_record(conn, ContentType::Handshake, &server_hello)
        .await
        .unwrap();
    write_record(conn, ContentType::ChangeCipherSpec, &[0x01])
        .await
        .unwrap();
    write_record(conn, ContentType::ApplicationData, &[0x17; 120])
        .await
        .unwrap();

    AuthBlock::decode(&auth).unwrap()
}

async fn echo_frames(conn: &mut TcpStream, obfuscator: &Obfuscator) {
    let mut next_seq: HashMap<u32, u64> = HashMap::new();
    while let Ok(record) = read_record(conn).await {
        let frame = obfuscator
            .deobfuscate(&record[RECORD_HEADER_LEN..])
            .unwrap();
        let seq = next_seq.entry(frame.stream_id).or_insert(0);
        let reply = match frame.closing {
            Closing::Session => break,
            Closing::Stream => Frame::close_stream(frame.stream_id, *seq),
            Closing::Nothing => Frame::data(frame.stream_id, *seq, frame.payload.clone()),
        };
        *seq += 1;

        let body = obfuscator.obfuscate(&reply).unwrap();
        if write_record(conn, ContentType::ApplicationData, &body)
            .await
            .is_err()
        {
            break;
        }
    }
}

fn handshake_params(public_key: PublicKey, method: EncryptionMethod) -> HandshakeParams {
    HandshakeParams {
        uid: UID,
        server_public_key: public_key,
        server_name: "www.example.com".to_string(),
        proxy_method: "shadowsocks".to_string(),
        encryption_method: method,
        clock: std::time::SystemTime::now,
    }
}

/// Bootstrap a session against the relay and echo data on a stream
#[tokio::test]
async fn test_session_over_disguised_connection() {
    let relay = FakeRelay::start().await;

    let bootstrapper = Bootstrapper::new(
        TcpDialer::new(Duration::from_secs(5)),
        DisguisedHandshake::new(handshake_params(relay.public_key.clone(), EncryptionMethod::AesGcm)),
        BootstrapConfig {
            remote_addr: relay.addr.to_string(),
            num_conn: 1,
            admin: false,
            encryption_method: EncryptionMethod::AesGcm,
            retry: RetryPolicy::default(),
        },
    );

    let session = tokio::time::timeout(Duration::from_secs(10), bootstrapper.bootstrap())
        .await
        .expect("bootstrap timed out")
        .expect("bootstrap failed");
    assert_eq!(session.connection_count().await, 1);

    let mut stream = session.open_stream().await.unwrap();
    stream.write_all(b"ping through the tunnel").await.unwrap();

    let mut buf = [0u8; 23];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&buf, b"ping through the tunnel");

    session.close().await;
    assert!(session.is_closed());

    let auth = tokio::time::timeout(Duration::from_secs(5), relay.task)
        .await
        .expect("relay did not finish")
        .unwrap();
    assert_eq!(auth.uid, UID);
    assert_eq!(auth.proxy_method, "shadowsocks");
    assert_eq!(auth.encryption_method, EncryptionMethod::AesGcm);
    assert_eq!(auth.session_id, session.id());
}

/// A local proxy client configured from inline options reaches the relay
#[tokio::test]
async fn test_local_flow_through_session_manager() {
    let relay = FakeRelay::start().await;

    let options = format!(
        "UID={};PublicKey={};RemoteHost={};RemotePort={};NumConn=1;EncryptionMethod=chacha20-poly1305",
        base64::engine::general_purpose::STANDARD.encode(UID),
        relay.public_key.to_base64(),
        relay.addr.ip(),
        relay.addr.port(),
    );
    let config = ClientConfig::from_inline(&options).unwrap();
    config.validate().unwrap();

    let bootstrapper = Bootstrapper::new(
        TcpDialer::new(config.connect_timeout()),
        DisguisedHandshake::new(config.handshake_params(None).unwrap()),
        config.bootstrap_config(false),
    );
    let manager = Arc::new(SessionManager::new(bootstrapper));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    tokio::spawn(manager.clone().serve(listener));

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    client.write_all(request).await.unwrap();

    let mut echoed = vec![0u8; request.len()];
    tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed[..], &request[..]);

    manager.shutdown().await;

    let auth = tokio::time::timeout(Duration::from_secs(5), relay.task)
        .await
        .expect("relay did not finish")
        .unwrap();
    assert_eq!(auth.encryption_method, EncryptionMethod::ChaCha20Poly1305);
    assert_eq!(auth.uid, UID);
}

/// The hello on the wire carries the pinned browser fingerprint
#[tokio::test]
async fn test_wire_hello_fingerprint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let pair = EphemeralKeyPair::generate().unwrap();

    let capture = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        read_record(&mut conn).await.unwrap()
    });

    let bootstrapper = Bootstrapper::new(
        TcpDialer::new(Duration::from_secs(5)),
        DisguisedHandshake::new(handshake_params(
            PublicKey(*pair.public()),
            EncryptionMethod::Plain,
        )),
        BootstrapConfig {
            remote_addr: addr.to_string(),
            num_conn: 1,
            admin: true,
            encryption_method: EncryptionMethod::Plain,
            retry: RetryPolicy::default(),
        },
    );
    let attempt = tokio::spawn(async move { bootstrapper.bootstrap().await });

    let record = capture.await.unwrap();
    attempt.abort();

    let ja3 = Ja3Components::from_client_hello(&record[RECORD_HEADER_LEN..]).unwrap();
    assert_eq!(
        ja3.ja3_string(),
        "771,4865-4867-4866-49195-49199-52393-52392-49196-49200-49162-49161-49171-49172-156-157-47-53,0-23-65281-10-11-35-16-5-34-51-43-13-45-28-21,29-23-24-25-256-257,0"
    );
}
