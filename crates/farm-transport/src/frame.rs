/// Length-prefixed framing for bus connections.
///
/// Every frame is a big-endian `u32` length followed by a MessagePack body.
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::BusError;

/// A single unit on a bus connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Subscriber → publisher: start delivering channels with this prefix.
    Subscribe { channel: String },
    /// Subscriber → publisher: stop delivering this prefix.
    Unsubscribe { channel: String },
    /// A published message.
    Message {
        channel: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl Frame {
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, BusError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// Write one frame. A body over `max_size` (or over `u32::MAX`) is refused
/// with [`BusError::FrameTooLarge`] before anything reaches the stream, so
/// the connection stays usable.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame, max_size: usize) -> Result<(), BusError>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.to_bytes()?;
    let too_large = BusError::FrameTooLarge {
        size: body.len(),
        max: max_size,
    };
    if body.len() > max_size {
        return Err(too_large);
    }
    let len = u32::try_from(body.len()).map_err(|_| too_large)?.to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub(crate) async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Frame>, BusError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(BusError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::from_bytes(&buf).map(Some)
}

/// Subscription prefix match. The empty prefix matches every channel.
pub(crate) fn matches_prefix(prefix: &str, channel: &str) -> bool {
    channel.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::Message {
            channel: "ALL".into(),
            data: b"payload".to_vec(),
        };

        write_frame(&mut a, &frame, 4096).await.unwrap();
        let read = read_frame(&mut b, 4096).await.unwrap();

        assert_eq!(read, Some(frame));
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert_eq!(read_frame(&mut b, 64).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::Message {
            channel: "ALL".into(),
            data: vec![0xAB; 256],
        };
        write_frame(&mut a, &frame, 4096).await.unwrap();

        let err = read_frame(&mut b, 16).await.unwrap_err();
        assert!(matches!(err, BusError::FrameTooLarge { max: 16, .. }));
    }

    #[tokio::test]
    async fn oversized_write_is_refused_and_stream_stays_aligned() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let big = Frame::Message {
            channel: "ALL".into(),
            data: vec![0xAB; 256],
        };
        let small = Frame::Message {
            channel: "ALL".into(),
            data: b"ok".to_vec(),
        };

        let err = write_frame(&mut a, &big, 64).await.unwrap_err();
        assert!(matches!(err, BusError::FrameTooLarge { max: 64, .. }));
        write_frame(&mut a, &small, 64).await.unwrap();

        assert_eq!(read_frame(&mut b, 64).await.unwrap(), Some(small));
    }

    #[tokio::test]
    async fn garbage_body_is_deserialization_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&3u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xc1, 0xc1, 0xc1]).await.unwrap();

        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert!(matches!(err, BusError::Deserialization(_)));
    }

    #[test]
    fn prefix_matching() {
        assert!(matches_prefix("", "anything"));
        assert!(matches_prefix("grp", "grp-1"));
        assert!(!matches_prefix("grp-1", "grp"));
    }
}
