// Connection plumbing shared by the publish and subscribe paths.
use bytes::BytesMut;
use norq_wire::{Command, Frame, FrameType, HEARTBEAT, MAGIC_V2, OK};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::host::HostAndPort;

pub(crate) mod publish;
pub(crate) mod subscribe;

pub(crate) use publish::PubConnection;
pub(crate) use subscribe::{ConnEvent, SubConnection};

#[derive(Serialize)]
struct IdentifyBody {
    client_id: &'static str,
    hostname: String,
    user_agent: String,
    feature_negotiation: bool,
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed the
/// stream between frames.
pub(crate) async fn read_frame<R>(
    read: &mut R,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut size_bytes = [0u8; 4];
    match read.read_exact(&mut size_bytes).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let size = u32::from_be_bytes(size_bytes) as usize;
    if size < 4 {
        return Err(Error::Protocol(format!("frame size {size} below minimum")));
    }
    // The cap is checked before the allocation it bounds.
    if size > max_frame_bytes {
        return Err(Error::Protocol(format!(
            "frame of {size} bytes exceeds cap {max_frame_bytes}; refusing"
        )));
    }
    scratch.clear();
    scratch.resize(size, 0u8);
    read.read_exact(&mut scratch[..]).await?;
    Ok(Some(Frame::decode(scratch.split().freeze())?))
}

/// Connect, write the protocol magic, and run the IDENTIFY exchange.
pub(crate) async fn open(addr: &HostAndPort, config: &ClientConfig) -> Result<TcpStream> {
    let connect = TcpStream::connect((addr.host(), addr.port()));
    let mut stream = timeout(config.connect_timeout(), connect)
        .await
        .map_err(|_| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })??;
    stream.set_nodelay(true)?;
    stream.write_all(MAGIC_V2).await?;

    let body = serde_json::to_vec(&IdentifyBody {
        client_id: "norq",
        hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        user_agent: format!("norq/{}", env!("CARGO_PKG_VERSION")),
        feature_negotiation: false,
    })
    .map_err(|err| Error::Protocol(format!("encode identify body: {err}")))?;
    stream
        .write_all(&Command::Identify { body }.encode()?)
        .await?;

    let (mut read, mut write) = stream.split();
    let mut scratch = BytesMut::with_capacity(256);
    await_ok(
        &mut read,
        &mut write,
        &mut scratch,
        config.max_frame_bytes,
        "identify",
    )
    .await?;
    Ok(stream)
}

/// Consume frames until the broker acknowledges the previous command with
/// `OK`, answering heartbeats along the way. Anything else is a protocol
/// fault at this point in the exchange.
pub(crate) async fn await_ok<R, W>(
    read: &mut R,
    write: &mut W,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
    context: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = read_frame(read, scratch, max_frame_bytes)
            .await?
            .ok_or(Error::Closed("connection closed before reply"))?;
        match frame.frame_type {
            FrameType::Response if frame.body.as_ref() == HEARTBEAT => {
                write.write_all(&Command::Nop.encode()?).await?;
            }
            FrameType::Response if frame.body.as_ref() == OK => return Ok(()),
            FrameType::Response => {
                return Err(Error::Protocol(format!(
                    "unexpected {context} reply: {}",
                    String::from_utf8_lossy(&frame.body)
                )))
            }
            FrameType::Error => {
                return Err(Error::Protocol(format!(
                    "{context} rejected: {}",
                    String::from_utf8_lossy(&frame.body)
                )))
            }
            FrameType::Message => {
                return Err(Error::Protocol(format!(
                    "message frame while awaiting {context} reply"
                )))
            }
        }
    }
}
