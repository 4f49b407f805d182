//! Length-prefixed JSON framing.
//!
//! Every frame is a u32 big-endian byte length followed by a JSON document.
//! The length cap guards against a corrupt peer asking us to allocate
//! gigabytes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use trisum_core::TrisumError;

/// Upper bound on a single frame body. Protocol messages are small; a frame
/// this large means a corrupt or hostile peer.
pub const MAX_FRAME_BYTES: u32 = 1 << 20;

/// Write one frame: u32 big-endian length, then the JSON body.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TrisumError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| TrisumError::serialization(format!("encode frame: {e}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| TrisumError::serialization("frame exceeds u32 length"))?;
    if len > MAX_FRAME_BYTES {
        return Err(TrisumError::serialization(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte cap"
        )));
    }
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| TrisumError::transport(format!("write frame length: {e}")))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| TrisumError::transport(format!("write frame body: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| TrisumError::transport(format!("flush frame: {e}")))?;
    Ok(())
}

/// Read one frame and decode its JSON body.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TrisumError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| TrisumError::transport(format!("read frame length: {e}")))?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(TrisumError::serialization(format!(
            "peer announced a {len} byte frame, cap is {MAX_FRAME_BYTES}"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TrisumError::transport(format!("read frame body: {e}")))?;
    serde_json::from_slice(&body)
        .map_err(|e| TrisumError::serialization(format!("decode frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trisum_core::{Envelope, Message, NodeId, Reply};

    #[tokio::test]
    async fn frames_round_trip() {
        let envelope = Envelope::new(NodeId::new(), Message::Health);
        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let back: Envelope = read_frame(&mut cursor).await.unwrap();
        assert_eq!(back, envelope);
    }

    #[tokio::test]
    async fn reply_frames_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Reply::Accepted).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let back: Reply = read_frame(&mut cursor).await.unwrap();
        assert_eq!(back, Reply::Accepted);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, Reply>(&mut cursor).await.unwrap_err();
        assert!(err.to_string().contains("cap"));
    }

    #[tokio::test]
    async fn truncated_body_is_a_transport_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(b"abc");
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame::<_, Reply>(&mut cursor).await.unwrap_err();
        assert!(matches!(err, TrisumError::Transport { .. }));
    }
}
