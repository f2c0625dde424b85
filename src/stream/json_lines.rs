//! Newline-delimited JSON transport over any tokio byte stream.
//!
//! Each message is a single line of serde JSON, framed by a
//! [`tokio_util::codec`] line codec with a per-line limit. Closing the send
//! side shuts down the write half of the stream, which peers observe as
//! end-of-stream while the read half stays usable.

use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder, FramedRead, FramedWrite,
};

use crate::stream::transport::{Transport, TransportError};

/// Longest accepted line, newline excluded.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

pub struct JsonLinesTransport<S, Out, In> {
    reader: Mutex<FramedRead<ReadHalf<S>, JsonLineCodec>>,
    writer: Mutex<Option<FramedWrite<WriteHalf<S>, JsonLineCodec>>>,
    send_closed: AtomicBool,
    _messages: PhantomData<fn(Out) -> In>,
}

impl<S, Out, In> JsonLinesTransport<S, Out, In>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wraps a connected byte stream such as a `TcpStream`.
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_length(stream, MAX_FRAME_LENGTH)
    }

    /// Like [`new`](Self::new), rejecting lines longer than `max` bytes in
    /// either direction.
    pub fn with_max_frame_length(stream: S, max: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(FramedRead::new(read_half, JsonLineCodec::new(max))),
            writer: Mutex::new(Some(FramedWrite::new(
                write_half,
                JsonLineCodec::new(max),
            ))),
            send_closed: AtomicBool::new(false),
            _messages: PhantomData,
        }
    }
}

#[async_trait]
impl<S, Out, In> Transport for JsonLinesTransport<S, Out, In>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    type Outbound = Out;
    type Inbound = In;

    fn is_ready(&self) -> bool {
        !self.send_closed.load(Ordering::Acquire)
    }

    async fn send_message(&self, message: Out) -> Result<(), TransportError> {
        let line = serde_json::to_vec(&message).map_err(TransportError::Encode)?;

        let mut slot = self.writer.lock().await;
        let writer = slot.as_mut().ok_or(TransportError::SendClosed)?;
        writer.send(Bytes::from(line)).await.map_err(disconnect_on_io)
    }

    async fn receive_message(&self) -> Result<Option<In>, TransportError> {
        let frame = match self.reader.lock().await.next().await {
            None => return Ok(None),
            Some(frame) => frame.map_err(disconnect_on_io)?,
        };
        // Raw bytes go straight to serde so bad UTF-8 is a decode error.
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(TransportError::Decode)
    }

    async fn close_send(&self) -> Result<(), TransportError> {
        self.send_closed.store(true, Ordering::Release);
        let mut slot = self.writer.lock().await;
        if let Some(mut writer) = slot.take() {
            writer.close().await.map_err(disconnect_on_io)?;
        }
        Ok(())
    }
}

/// Bounded `\n`-delimited framing. Unlike the stock codecs, bytes left over
/// at EOF are a truncated frame, not a final line.
#[derive(Debug)]
struct JsonLineCodec {
    lines: AnyDelimiterCodec,
    max: usize,
}

impl JsonLineCodec {
    fn new(max: usize) -> Self {
        Self {
            lines: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max),
            max,
        }
    }

    fn map_error(&self, err: AnyDelimiterCodecError) -> TransportError {
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                TransportError::FrameTooLong { max: self.max }
            }
            AnyDelimiterCodecError::Io(err) => TransportError::Io(err),
        }
    }
}

impl Decoder for JsonLineCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        self.lines.decode(src).map_err(|err| self.map_error(err))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // EOF in the middle of a frame.
            None => {
                src.clear();
                Err(TransportError::Disconnected)
            }
        }
    }
}

impl Encoder<Bytes> for JsonLineCodec {
    type Error = TransportError;

    fn encode(&mut self, line: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if line.len() > self.max {
            return Err(TransportError::FrameTooLong { max: self.max });
        }
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(&line);
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

fn disconnect_on_io(err: TransportError) -> TransportError {
    match err {
        TransportError::Io(err) => match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransportError::Disconnected,
            _ => TransportError::Io(err),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use super::JsonLinesTransport;
    use crate::stream::proto::{ServerMessage, User, UserStatus};
    use crate::stream::transport::{Transport, TransportError};

    type ClientSide = JsonLinesTransport<DuplexStream, User, ServerMessage>;
    type ServerSide = JsonLinesTransport<DuplexStream, ServerMessage, User>;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
    }

    #[test]
    fn messages_cross_the_stream_in_order_and_half_close_ends_it() {
        runtime().block_on(async {
            let (a, b) = duplex(1024);
            let client = ClientSide::new(a);
            let server = ServerSide::new(b);

            let first = User::new("r1", "Raphael 1", "rpl@rpl.com");
            let second = User::new("r2", "Raphael 2", "rpl2@rpl.com");
            client.send_message(first.clone()).await.expect("send");
            client.send_message(second.clone()).await.expect("send");
            client.close_send().await.expect("close");
            assert!(!client.is_ready());

            assert_eq!(server.receive_message().await.expect("recv"), Some(first));
            assert_eq!(server.receive_message().await.expect("recv"), Some(second));
            assert_eq!(server.receive_message().await.expect("recv"), None);

            let reply = ServerMessage::Status {
                status: UserStatus::Completed,
                user: None,
            };
            server.send_message(reply.clone()).await.expect("reply");
            assert_eq!(client.receive_message().await.expect("recv"), Some(reply));
        });
    }

    #[test]
    fn send_after_close_is_rejected() {
        runtime().block_on(async {
            let (a, _b) = duplex(64);
            let client = ClientSide::new(a);
            client.close_send().await.expect("close");
            let err = client
                .send_message(User::new("0", "Joao", "j@j.com"))
                .await
                .expect_err("send after close");
            assert!(matches!(err, TransportError::SendClosed));
        });
    }

    #[test]
    fn malformed_line_is_a_decode_error() {
        runtime().block_on(async {
            let (a, mut raw) = duplex(64);
            let client = ClientSide::new(a);
            raw.write_all(b"not json\n").await.expect("write");

            let err = client.receive_message().await.expect_err("decode error");
            assert!(matches!(err, TransportError::Decode(_)));
        });
    }

    #[test]
    fn invalid_utf8_line_is_a_decode_error() {
        runtime().block_on(async {
            let (a, mut raw) = duplex(64);
            let client = ClientSide::new(a);
            raw.write_all(b"\xff\xfe\n").await.expect("write");

            let err = client.receive_message().await.expect_err("decode error");
            assert!(matches!(err, TransportError::Decode(_)), "{err:?}");
        });
    }

    #[test]
    fn blank_line_is_a_decode_error() {
        runtime().block_on(async {
            let (a, mut raw) = duplex(64);
            let client = ClientSide::new(a);
            raw.write_all(b"\n").await.expect("write");

            let err = client.receive_message().await.expect_err("decode error");
            assert!(matches!(err, TransportError::Decode(_)));
        });
    }

    #[test]
    fn oversized_line_is_rejected_without_a_newline() {
        runtime().block_on(async {
            let (a, mut raw) = duplex(4096);
            let client = ClientSide::with_max_frame_length(a, 64);
            // No newline: the frame is refused once it passes the limit.
            raw.write_all(&[b'x'; 1024]).await.expect("write");

            let err = client.receive_message().await.expect_err("too long");
            assert!(
                matches!(err, TransportError::FrameTooLong { max: 64 }),
                "{err:?}"
            );
        });
    }

    #[test]
    fn oversized_outbound_message_is_not_written() {
        runtime().block_on(async {
            let (a, _b) = duplex(4096);
            let client = ClientSide::with_max_frame_length(a, 16);
            let err = client
                .send_message(User::new("r1", "Raphael 1", "rpl@rpl.com"))
                .await
                .expect_err("too long");
            assert!(matches!(err, TransportError::FrameTooLong { max: 16 }));
        });
    }

    #[test]
    fn truncated_frame_reports_disconnect() {
        runtime().block_on(async {
            let (a, mut raw) = duplex(64);
            let client = ClientSide::new(a);
            raw.write_all(br#"{"type":"user""#).await.expect("write");
            raw.shutdown().await.expect("shutdown");

            let err = client.receive_message().await.expect_err("truncated");
            assert!(matches!(err, TransportError::Disconnected));
        });
    }
}
