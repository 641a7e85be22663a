/// Framed message I/O for the PostgreSQL wire protocol (v3)
///
/// The pooler never interprets message bodies. It only needs message
/// boundaries and the one-byte type tag, so a `Message` is exactly that:
/// a tag plus an opaque body. Wire form is `tag | length (u32 BE, length
/// includes itself) | body`, the regular-message framing used by the
/// protocol after startup.
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Client requests graceful termination of its session.
pub const TAG_TERMINATE: u8 = b'X';

/// Server has finished one response burst and is ready for the next request.
pub const TAG_READY_FOR_QUERY: u8 = b'Z';

/// Sanity cap on a single message body. Anything larger is treated as a
/// framing error rather than an allocation request.
pub const MAX_MESSAGE_BODY: usize = 16 * 1024 * 1024;

/// A single framed protocol message: one type tag and an opaque body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub body: Bytes,
}

impl Message {
    pub fn new(tag: u8, body: impl Into<Bytes>) -> Self {
        Self {
            tag,
            body: body.into(),
        }
    }

    /// Client-side Terminate message (empty body)
    pub fn terminate() -> Self {
        Self::new(TAG_TERMINATE, Bytes::new())
    }

    /// Server-side ReadyForQuery message with idle transaction status
    pub fn ready_for_query() -> Self {
        Self::new(TAG_READY_FOR_QUERY, Bytes::from_static(b"I"))
    }

    pub fn is_terminate(&self) -> bool {
        self.tag == TAG_TERMINATE
    }

    pub fn is_ready_for_query(&self) -> bool {
        self.tag == TAG_READY_FOR_QUERY
    }

    /// Total size of this message on the wire (tag + length word + body)
    pub fn wire_len(&self) -> usize {
        1 + 4 + self.body.len()
    }
}

/// Read one framed message, suspending until it is complete
pub async fn read_message<R>(reader: &mut R) -> io::Result<Message>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    let len = reader.read_u32().await? as usize;
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message length {} below frame minimum", len),
        ));
    }
    let body_len = len - 4;
    if body_len > MAX_MESSAGE_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message body of {} bytes exceeds limit", body_len),
        ));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok(Message {
        tag,
        body: Bytes::from(body),
    })
}

/// Write one framed message and flush it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::with_capacity(message.wire_len());
    frame.put_u8(message.tag);
    frame.put_u32((message.body.len() + 4) as u32);
    frame.put_slice(&message.body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_round_trip() {
        let (mut tx, mut rx) = tokio::io::duplex(1024);

        let message = Message::new(b'Q', Bytes::from_static(b"SELECT 1\0"));
        write_message(&mut tx, &message).await.unwrap();

        let read_back = read_message(&mut rx).await.unwrap();
        assert_eq!(read_back, message);
    }

    #[tokio::test]
    async fn test_empty_body_round_trip() {
        let (mut tx, mut rx) = tokio::io::duplex(64);

        write_message(&mut tx, &Message::terminate()).await.unwrap();

        let read_back = read_message(&mut rx).await.unwrap();
        assert!(read_back.is_terminate());
        assert!(read_back.body.is_empty());
    }

    #[tokio::test]
    async fn test_ready_for_query_tag() {
        let message = Message::ready_for_query();
        assert!(message.is_ready_for_query());
        assert!(!message.is_terminate());
        assert_eq!(message.wire_len(), 6);
    }

    #[tokio::test]
    async fn test_undersized_length_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(64);

        // Length word of 3 is impossible: it must at least cover itself.
        tx.write_all(&[b'Q', 0, 0, 0, 3]).await.unwrap();

        let err = read_message(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let huge = (MAX_MESSAGE_BODY as u32) + 5;
        tx.write_all(&[b'd']).await.unwrap();
        tx.write_all(&huge.to_be_bytes()).await.unwrap();

        let err = read_message(&mut rx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_body_is_error() {
        let (mut tx, mut rx) = tokio::io::duplex(64);

        // Announce a 10-byte body but close after 2.
        tx.write_all(&[b'D', 0, 0, 0, 14, 1, 2]).await.unwrap();
        drop(tx);

        assert!(read_message(&mut rx).await.is_err());
    }
}
