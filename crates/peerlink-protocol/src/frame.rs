//! Length-prefixed frame codec
//!
//! Frame Structure:
//! - Length (4 bytes): payload length, big-endian
//! - Payload (variable): bincode-encoded message

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum frame payload size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode a message into a frame payload
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| ProtocolError::SerializationFailed(e.to_string()))?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(payload)
}

/// Decode a frame payload into a message
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    bincode::deserialize(payload).map_err(|e| ProtocolError::DeserializationFailed(e.to_string()))
}

/// Write one framed message
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let payload = encode(message)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DhtRequest, DhtResponse};
    use crate::{Address, PeerId, PeerInfo};

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let response = DhtResponse {
            closer_peers: vec![
                PeerInfo::with_addresses(
                    PeerId::from_bytes([1; 32]),
                    vec!["/ip4/10.0.0.1/tcp/4001".parse().unwrap()],
                ),
                PeerInfo::new(PeerId::from_bytes([2; 32])),
                PeerInfo::with_addresses(PeerId::from_bytes([3; 32]), vec![Address::Memory(3)]),
            ],
        };

        write_frame(&mut a, &response).await.unwrap();
        let decoded: DhtResponse = read_frame(&mut b).await.unwrap();
        assert_eq!(decoded, response);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        let result: Result<DhtRequest> = read_frame(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        let result: Result<DhtRequest> = read_frame(&mut b).await;
        assert!(matches!(result, Err(ProtocolError::Io(_))));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let result: Result<DhtResponse> = decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(ProtocolError::DeserializationFailed(_))));
    }
}
