// Publisher connection: a single-writer worker that serializes
// command -> reply round trips over one broker socket.
use bytes::BytesMut;
use norq_wire::{Command, FrameType, HEARTBEAT, OK};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::{ClientConfig, PUBLISH_QUEUE_DEPTH};
use crate::conn::read_frame;
use crate::error::{Error, Result};
use crate::host::HostAndPort;

pub(crate) enum PubRequest {
    Publish {
        topic: String,
        payload: Vec<u8>,
        response: oneshot::Sender<Result<()>>,
    },
    PublishMulti {
        topic: String,
        payloads: Vec<Vec<u8>>,
        response: oneshot::Sender<Result<()>>,
    },
    Close,
}

/// Cheap handle to the connection worker. The worker exits when every
/// handle is dropped or after a transport failure; sends on a dead handle
/// surface as `Error::Closed`.
#[derive(Clone)]
pub(crate) struct PubConnection {
    tx: mpsc::Sender<PubRequest>,
}

impl PubConnection {
    pub(crate) async fn open(addr: HostAndPort, config: &ClientConfig) -> Result<Self> {
        let stream = super::open(&addr, config).await?;
        tracing::debug!(node = %addr, "publisher connection established");
        let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_DEPTH);
        tokio::spawn(run_pub_worker(stream, rx, config.max_frame_bytes, addr));
        Ok(Self { tx })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(tx: mpsc::Sender<PubRequest>) -> Self {
        Self { tx }
    }

    pub(crate) async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let (response, reply) = oneshot::channel();
        self.tx
            .send(PubRequest::Publish {
                topic: topic.to_string(),
                payload,
                response,
            })
            .await
            .map_err(|_| Error::Closed("publisher connection closed"))?;
        reply
            .await
            .map_err(|_| Error::Closed("publisher connection closed"))?
    }

    pub(crate) async fn publish_multi(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<()> {
        let (response, reply) = oneshot::channel();
        self.tx
            .send(PubRequest::PublishMulti {
                topic: topic.to_string(),
                payloads,
                response,
            })
            .await
            .map_err(|_| Error::Closed("publisher connection closed"))?;
        reply
            .await
            .map_err(|_| Error::Closed("publisher connection closed"))?
    }

    pub(crate) async fn close(&self) {
        let _ = self.tx.send(PubRequest::Close).await;
    }
}

async fn run_pub_worker(
    stream: TcpStream,
    mut rx: mpsc::Receiver<PubRequest>,
    max_frame_bytes: usize,
    addr: HostAndPort,
) {
    let (mut read, mut write) = stream.into_split();
    let mut scratch = BytesMut::with_capacity(4 * 1024);
    while let Some(request) = rx.recv().await {
        let (command, response) = match request {
            PubRequest::Publish {
                topic,
                payload,
                response,
            } => (Command::Pub { topic, payload }, response),
            PubRequest::PublishMulti {
                topic,
                payloads,
                response,
            } => (Command::Mpub { topic, payloads }, response),
            PubRequest::Close => break,
        };
        let encoded = match command.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = response.send(Err(err.into()));
                continue;
            }
        };
        match round_trip(&mut read, &mut write, &encoded, &mut scratch, max_frame_bytes).await {
            Ok(()) => {
                let _ = response.send(Ok(()));
            }
            // The broker rejected the command but the connection is intact.
            Err(err @ Error::Publish(_)) => {
                let _ = response.send(Err(err));
            }
            Err(err) => {
                tracing::warn!(error = %err, node = %addr, "publisher connection failed");
                let _ = response.send(Err(err));
                drain_requests(&mut rx).await;
                return;
            }
        }
    }
    tracing::debug!(node = %addr, "publisher connection closed");
}

async fn round_trip(
    read: &mut OwnedReadHalf,
    write: &mut OwnedWriteHalf,
    command: &[u8],
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<()> {
    write.write_all(command).await?;
    loop {
        let frame = read_frame(read, scratch, max_frame_bytes)
            .await?
            .ok_or(Error::Closed("broker closed connection"))?;
        match frame.frame_type {
            FrameType::Response if frame.body.as_ref() == HEARTBEAT => {
                write.write_all(&Command::Nop.encode()?).await?;
            }
            FrameType::Response if frame.body.as_ref() == OK => return Ok(()),
            FrameType::Response => {
                return Err(Error::Protocol(format!(
                    "unexpected publish reply: {}",
                    String::from_utf8_lossy(&frame.body)
                )))
            }
            FrameType::Error => {
                return Err(Error::Publish(
                    String::from_utf8_lossy(&frame.body).into_owned(),
                ))
            }
            FrameType::Message => {
                return Err(Error::Protocol(
                    "message frame on publisher connection".to_string(),
                ))
            }
        }
    }
}

/// After a transport failure, every queued request gets the same verdict
/// instead of waiting on a dead socket.
async fn drain_requests(rx: &mut mpsc::Receiver<PubRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            PubRequest::Publish { response, .. } | PubRequest::PublishMulti { response, .. } => {
                let _ = response.send(Err(Error::Closed("publisher connection closed")));
            }
            PubRequest::Close => {}
        }
    }
}
