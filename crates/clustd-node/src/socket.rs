//! Framed sockets.
//!
//! Every byte stream carries length-delimited records, one [`Frame`] per
//! record. Each socket is driven by a single task that owns the stream,
//! writes whatever its machine queues, and reports everything it reads.

use bytes::Bytes;
use clustd_core::ChannelId;
use clustd_proto::{Frame, Opcode, RequestId};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::{error::NodeError, task::Input};

/// A byte stream split into frame records.
pub type FramedSocket<S> = Framed<S, LengthDelimitedCodec>;

/// Wrap a stream with the record codec.
pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> FramedSocket<S> {
    let codec = LengthDelimitedCodec::builder().max_frame_length(Frame::MAX_SIZE + 1).new_codec();
    Framed::new(stream, codec)
}

/// Write one frame.
pub async fn write_frame<S>(socket: &mut FramedSocket<S>, frame: &Frame) -> Result<(), NodeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    socket.send(frame.to_bytes()?).await?;
    Ok(())
}

/// Read one frame. `None` once the peer closed the stream.
pub async fn read_frame<S>(socket: &mut FramedSocket<S>) -> Option<Result<Frame, NodeError>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let record = socket.next().await?;
    Some(record.map_err(NodeError::from).and_then(|record| Ok(Frame::decode(record.freeze())?)))
}

/// A frame queued for a socket.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub frame: Frame,
    /// Request carried by the frame, reported back if the write fails
    pub request: Option<RequestId>,
}

/// What a socket task observed.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    /// Outbound socket is up and its metadata header was written
    Opened { channel: ChannelId, outbound: mpsc::UnboundedSender<Outbound> },
    /// Outbound socket could not be opened
    ConnectFailed { channel: ChannelId, reason: String },
    /// Encrypted envelope
    Message { channel: ChannelId, envelope: Bytes },
    Ping { channel: ChannelId },
    Pong { channel: ChannelId },
    /// Stream ended, errored, or the peer sent `Close`
    Closed { channel: ChannelId },
    /// A queued frame could not be written
    WriteFailed { channel: ChannelId, request: Option<RequestId>, reason: String },
}

/// Own `socket` until either side lets go.
///
/// Pings are answered here. Dropping every sender of `outbound` closes the
/// socket without reporting `Closed`, since the machine already forgot it.
pub(crate) async fn drive<S>(
    channel: ChannelId,
    mut socket: FramedSocket<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<Input>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let report = |event: SocketEvent| {
        // Receiver gone means the machine task exited.
        let _ = events.send(Input::Socket(event));
    };

    loop {
        tokio::select! {
            next = outbound.recv() => {
                let Some(Outbound { frame, request }) = next else {
                    let _ = write_frame(&mut socket, &Frame::close()).await;
                    let _ = SinkExt::<Bytes>::close(&mut socket).await;
                    debug!(%channel, "Socket released");
                    return;
                };
                if let Err(e) = write_frame(&mut socket, &frame).await {
                    debug!(%channel, error = %e, "Write failed");
                    report(SocketEvent::WriteFailed { channel, request, reason: e.to_string() });
                    report(SocketEvent::Closed { channel });
                    return;
                }
            },
            next = read_frame(&mut socket) => match next {
                Some(Ok(frame)) => match frame.opcode {
                    Opcode::Message => report(SocketEvent::Message { channel, envelope: frame.body }),
                    Opcode::Ping => {
                        if write_frame(&mut socket, &Frame::pong()).await.is_err() {
                            report(SocketEvent::Closed { channel });
                            return;
                        }
                        report(SocketEvent::Ping { channel });
                    },
                    Opcode::Pong => report(SocketEvent::Pong { channel }),
                    Opcode::Close => {
                        report(SocketEvent::Closed { channel });
                        return;
                    },
                    Opcode::Metadata => warn!(%channel, "Unexpected metadata frame"),
                },
                Some(Err(e)) => {
                    warn!(%channel, error = %e, "Dropping socket");
                    report(SocketEvent::Closed { channel });
                    return;
                },
                None => {
                    report(SocketEvent::Closed { channel });
                    return;
                },
            },
        }
    }
}
