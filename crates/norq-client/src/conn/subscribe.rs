// Subscriber connection: SUB handshake, a reader task that turns frames
// into events for the owning subscription, and the write half the
// subscription uses for RDY/FIN/REQ/CLS.
use bytes::BytesMut;
use norq_wire::{Command, FrameType, MessageFrame, CLOSE_WAIT, HEARTBEAT, OK};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::conn::{await_ok, read_frame};
use crate::error::Result;
use crate::host::HostAndPort;
use crate::subscriber::subscription::Event;

/// What a connection reader reports back to its subscription.
pub(crate) enum ConnEvent {
    Message {
        addr: HostAndPort,
        frame: MessageFrame,
    },
    Heartbeat {
        addr: HostAndPort,
    },
    /// Emitted exactly once, when the reader reaches its terminal state.
    Closed {
        addr: HostAndPort,
        cause: String,
    },
}

pub(crate) struct SubConnection {
    pub(crate) addr: HostAndPort,
    write: OwnedWriteHalf,
    reader: JoinHandle<()>,
    /// RDY count last announced to the broker.
    pub(crate) rdy_target: u32,
    /// Broker-side credit remaining from that announcement.
    pub(crate) rdy_remaining: u32,
    /// Messages from this connection currently owned by handlers.
    pub(crate) in_flight: usize,
}

impl SubConnection {
    /// Connect, identify, and SUB. The SUB command must be the first
    /// stateful command after the handshake.
    pub(crate) async fn open(
        addr: HostAndPort,
        topic: &str,
        channel: &str,
        config: &ClientConfig,
        events: mpsc::Sender<Event>,
    ) -> Result<Self> {
        let stream = super::open(&addr, config).await?;
        let (mut read, mut write) = stream.into_split();
        write
            .write_all(
                &Command::Sub {
                    topic: topic.to_string(),
                    channel: channel.to_string(),
                }
                .encode()?,
            )
            .await?;
        let mut scratch = BytesMut::with_capacity(256);
        await_ok(&mut read, &mut write, &mut scratch, config.max_frame_bytes, "sub").await?;
        tracing::debug!(node = %addr, topic, channel, "subscription connection established");

        let reader = tokio::spawn(run_sub_reader(
            read,
            addr.clone(),
            events,
            config.max_frame_bytes,
        ));
        Ok(Self {
            addr,
            write,
            reader,
            rdy_target: 0,
            rdy_remaining: 0,
            in_flight: 0,
        })
    }

    /// Write one command on this connection. Ordering is total: only the
    /// owning subscription task calls this.
    pub(crate) async fn send(&mut self, command: Command) -> Result<()> {
        let encoded = command.encode()?;
        self.write.write_all(&encoded).await?;
        Ok(())
    }
}

impl Drop for SubConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn run_sub_reader(
    mut read: OwnedReadHalf,
    addr: HostAndPort,
    events: mpsc::Sender<Event>,
    max_frame_bytes: usize,
) {
    let mut scratch = BytesMut::with_capacity(16 * 1024);
    loop {
        let frame = match read_frame(&mut read, &mut scratch, max_frame_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                emit_closed(&events, &addr, "connection closed by broker").await;
                return;
            }
            Err(err) => {
                emit_closed(&events, &addr, &err.to_string()).await;
                return;
            }
        };
        match frame.frame_type {
            FrameType::Response if frame.body.as_ref() == HEARTBEAT => {
                if events
                    .send(Event::Conn(ConnEvent::Heartbeat { addr: addr.clone() }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            FrameType::Response if frame.body.as_ref() == CLOSE_WAIT => {
                emit_closed(&events, &addr, "close acknowledged by broker").await;
                return;
            }
            FrameType::Response if frame.body.as_ref() == OK => {}
            FrameType::Response => {
                tracing::debug!(
                    node = %addr,
                    body = %String::from_utf8_lossy(&frame.body),
                    "ignoring unexpected response on subscription connection"
                );
            }
            FrameType::Error => {
                tracing::warn!(
                    node = %addr,
                    error = %String::from_utf8_lossy(&frame.body),
                    "broker error on subscription connection"
                );
            }
            FrameType::Message => match MessageFrame::decode(frame.body) {
                Ok(message) => {
                    if events
                        .send(Event::Conn(ConnEvent::Message {
                            addr: addr.clone(),
                            frame: message,
                        }))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    emit_closed(&events, &addr, &format!("bad message envelope: {err}")).await;
                    return;
                }
            },
        }
    }
}

async fn emit_closed(events: &mpsc::Sender<Event>, addr: &HostAndPort, cause: &str) {
    let _ = events
        .send(Event::Conn(ConnEvent::Closed {
            addr: addr.clone(),
            cause: cause.to_string(),
        }))
        .await;
}
