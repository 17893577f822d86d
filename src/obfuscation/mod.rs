//! Traffic disguise layer
//!
//! Makes the first bytes of every transport connection look like a real
//! Firefox 99 TLS handshake. JA3/JA4 classifiers see the exact cipher list,
//! extension order and message size of the pinned browser. The key material
//! the relay needs rides inside fields that are random in any real handshake.

mod fingerprint;

pub use fingerprint::{
    compose_client_hello, extract_secret, secret_offset, ClientHelloFields, ExtensionType,
    FingerprintError, HandshakeType, Ja3Components, CLIENT_HELLO_LEN, EXTENSIONS_LEN,
    EXTENSIONS_OFFSET, MAX_SERVER_NAME_LEN,
};
