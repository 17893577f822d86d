//! TLS record framing
//!
//! Every unit on a disguised connection is a TLS record:
//!
//! ```text
//! content_type u8 | version u16 | length u16 | body
//! ```
//!
//! The handshake speaks handshake and change-cipher-spec records; the session
//! speaks application-data records only.

use super::TransportError;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a record header
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record body a peer may send (2^14 plaintext plus 2048 expansion)
pub const MAX_RECORD_BODY: usize = 16384 + 2048;

/// TLS record content types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec = 0x14,
    Alert = 0x15,
    Handshake = 0x16,
    ApplicationData = 0x17,
}

impl ContentType {
    /// Protocol version carried in the header of this record type
    ///
    /// Browsers send their first handshake record as TLS 1.0 and everything
    /// after as TLS 1.2.
    pub fn legacy_version(self) -> u16 {
        match self {
            ContentType::Handshake => 0x0301,
            _ => 0x0303,
        }
    }
}

impl TryFrom<u8> for ContentType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x14 => Ok(ContentType::ChangeCipherSpec),
            0x15 => Ok(ContentType::Alert),
            0x16 => Ok(ContentType::Handshake),
            0x17 => Ok(ContentType::ApplicationData),
            other => Err(other),
        }
    }
}

/// Wrap `body` in a record header
pub fn add_record_layer(content_type: ContentType, body: &[u8]) -> Result<BytesMut, TransportError> {
    if body.len() > u16::MAX as usize {
        return Err(TransportError::RecordTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + body.len());
    buf.put_u8(content_type as u8);
    buf.put_u16(content_type.legacy_version());
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    Ok(buf)
}

/// Write one record
pub async fn write_record<W>(
    writer: &mut W,
    content_type: ContentType,
    body: &[u8],
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let record = add_record_layer(content_type, body)?;
    writer.write_all(&record).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete record, header included
///
/// Returns `TransportError::Closed` if the peer closes cleanly before the
/// first header byte.
pub async fn read_record<R>(reader: &mut R) -> Result<BytesMut, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    let n = reader.read(&mut header[..1]).await?;
    if n == 0 {
        return Err(TransportError::Closed);
    }
    reader.read_exact(&mut header[1..]).await?;

    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len > MAX_RECORD_BODY {
        return Err(TransportError::RecordTooLarge(len));
    }

    let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN + len);
    record.put_slice(&header);
    record.resize(RECORD_HEADER_LEN + len, 0);
    reader.read_exact(&mut record[RECORD_HEADER_LEN..]).await?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header() {
        let record = add_record_layer(ContentType::Handshake, &[0xAA; 3]).unwrap();
        assert_eq!(&record[..], &[0x16, 0x03, 0x01, 0x00, 0x03, 0xAA, 0xAA, 0xAA]);

        let record = add_record_layer(ContentType::ApplicationData, b"hi").unwrap();
        assert_eq!(&record[..5], &[0x17, 0x03, 0x03, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_read_records_back_to_back() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_record(&mut client, ContentType::ApplicationData, b"first")
            .await
            .unwrap();
        write_record(&mut client, ContentType::ChangeCipherSpec, &[0x01])
            .await
            .unwrap();
        drop(client);

        let first = read_record(&mut server).await.unwrap();
        assert_eq!(first[0], ContentType::ApplicationData as u8);
        assert_eq!(&first[RECORD_HEADER_LEN..], b"first");

        let second = read_record(&mut server).await.unwrap();
        assert_eq!(&second[..], &[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);

        assert!(matches!(
            read_record(&mut server).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_truncated_record_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x17, 0x03, 0x03, 0x00, 0x10, 1, 2])
            .await
            .unwrap();
        drop(client);

        assert!(matches!(
            read_record(&mut server).await,
            Err(TransportError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &[0x17, 0x03, 0x03, 0xff, 0xff])
            .await
            .unwrap();

        assert!(matches!(
            read_record(&mut server).await,
            Err(TransportError::RecordTooLarge(0xffff))
        ));
    }

    #[test]
    fn test_content_type_from_u8() {
        assert_eq!(ContentType::try_from(0x16), Ok(ContentType::Handshake));
        assert_eq!(ContentType::try_from(0x42), Err(0x42));
    }
}
