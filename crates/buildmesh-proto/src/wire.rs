//! Multi-frame message framing.
//!
//! A message on the wire is an ordered list of opaque byte frames:
//!
//! ```text
//! [u32 frame count] then per frame: [u32 length] [length bytes]
//! ```
//!
//! All integers are big-endian. Both limits below are sanity caps well under
//! the format's theoretical `u32::MAX`; messages exceeding them are rejected
//! before any large allocation happens.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};

/// Maximum number of frames accepted in a single message.
pub const MAX_FRAME_COUNT: u32 = 64;

/// Maximum size of a single frame (64 MiB).
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Writes one whole message onto the stream.
///
/// The message is assembled into a single buffer and written with one
/// `write_all`, so frames of two messages never interleave as long as the
/// stream has a single writer.
pub async fn write_frames<W>(stream: &mut W, frames: &[Vec<u8>]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frames.len() as u64 > MAX_FRAME_COUNT as u64 {
        return Err(ProtoError::MalformedMessage(format!(
            "too many frames: {} (max {})",
            frames.len(),
            MAX_FRAME_COUNT
        )));
    }

    let payload: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + payload);
    buf.extend_from_slice(&(frames.len() as u32).to_be_bytes());
    for frame in frames {
        if frame.len() as u64 > MAX_FRAME_SIZE as u64 {
            return Err(ProtoError::MalformedMessage(format!(
                "frame too large: {} bytes (max {})",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }
        buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buf.extend_from_slice(frame);
    }

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one whole message from the stream.
///
/// Returns `Ok(None)` when the stream is closed cleanly before the first
/// byte of a message; a stream closed mid-message is an error.
pub async fn read_frames<R>(stream: &mut R) -> Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncRead + Unpin,
{
    let mut count_buf = [0u8; 4];
    match stream.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let count = u32::from_be_bytes(count_buf);
    if count > MAX_FRAME_COUNT {
        return Err(ProtoError::MalformedMessage(format!(
            "too many frames: {} (max {})",
            count, MAX_FRAME_COUNT
        )));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = stream.read_u32().await?;
        if len > MAX_FRAME_SIZE {
            return Err(ProtoError::MalformedMessage(format!(
                "frame too large: {} bytes (max {})",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut frame = vec![0u8; len as usize];
        stream.read_exact(&mut frame).await?;
        frames.push(frame);
    }

    Ok(Some(frames))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let frames = vec![b"".to_vec(), b"BMX/RPC1".to_vec(), vec![2], b"payload".to_vec()];
        write_frames(&mut client, &frames).await.unwrap();

        let read = read_frames(&mut server).await.unwrap().unwrap();
        assert_eq!(read, frames);
    }

    #[tokio::test]
    async fn empty_message() {
        let (mut client, mut server) = tokio::io::duplex(64);

        write_frames(&mut client, &[]).await.unwrap();
        let read = read_frames(&mut server).await.unwrap().unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        assert!(read_frames(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_message_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Announce two frames but deliver only the count.
        client.write_all(&2u32.to_be_bytes()).await.unwrap();
        drop(client);

        assert!(read_frames(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_count_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client
            .write_all(&(MAX_FRAME_COUNT + 1).to_be_bytes())
            .await
            .unwrap();

        match read_frames(&mut server).await {
            Err(ProtoError::MalformedMessage(_)) => {}
            other => panic!("expected MalformedMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn oversized_frame_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        client.write_all(&1u32.to_be_bytes()).await.unwrap();
        client
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        match read_frames(&mut server).await {
            Err(ProtoError::MalformedMessage(_)) => {}
            other => panic!("expected MalformedMessage, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn messages_keep_their_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        for i in 0u8..10 {
            write_frames(&mut client, &[vec![i]]).await.unwrap();
        }
        for i in 0u8..10 {
            let read = read_frames(&mut server).await.unwrap().unwrap();
            assert_eq!(read, vec![vec![i]]);
        }
    }
}
