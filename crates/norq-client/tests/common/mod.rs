// Test doubles for the broker and the discovery service, speaking the
// real wire protocol over loopback TCP.
#![allow(dead_code)]

use anyhow::{Context, Result};
use norq_wire::{Frame, MessageFrame, MessageId, CLOSE_WAIT, MESSAGE_ID_LEN, OK};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> [u8; MESSAGE_ID_LEN] {
    let counter = MESSAGE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let hex = format!("{counter:016x}");
    hex.as_bytes().try_into().expect("16 hex chars")
}

#[derive(Default)]
struct NsqdState {
    commands: Mutex<Vec<String>>,
    queue: Mutex<VecDeque<(u16, Vec<u8>)>>,
    published: Mutex<Vec<Vec<u8>>>,
    mpub_batches: Mutex<Vec<Vec<Vec<u8>>>>,
    fail_pub: AtomicBool,
    fail_mpub: AtomicBool,
}

/// In-process broker double: accepts the magic + IDENTIFY handshake,
/// records every command line, serves queued messages against RDY
/// credit, and redelivers on REQ with a bumped attempt count.
pub struct MockNsqd {
    pub addr: SocketAddr,
    state: Arc<NsqdState>,
}

impl MockNsqd {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(NsqdState::default());
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_conn(stream, state).await;
                });
            }
        });
        Ok(Self { addr, state })
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// Queue a message for delivery with the given broker-side attempt
    /// count.
    pub fn enqueue(&self, attempts: u16, payload: &[u8]) {
        self.state
            .queue
            .lock()
            .expect("queue lock")
            .push_back((attempts, payload.to_vec()));
    }

    pub fn set_fail_pub(&self, fail: bool) {
        self.state.fail_pub.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_mpub(&self, fail: bool) {
        self.state.fail_mpub.store(fail, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().expect("commands lock").clone()
    }

    pub fn count_command(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    pub fn published(&self) -> Vec<Vec<u8>> {
        self.state.published.lock().expect("published lock").clone()
    }

    pub fn mpub_batches(&self) -> Vec<Vec<Vec<u8>>> {
        self.state
            .mpub_batches
            .lock()
            .expect("batches lock")
            .clone()
    }
}

async fn serve_conn(stream: TcpStream, state: Arc<NsqdState>) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer = tokio::spawn(async move {
        while let Some(bytes) = frames_rx.recv().await {
            if write.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let budget = Arc::new(AtomicI64::new(0));
    let closed = Arc::new(AtomicBool::new(false));
    let in_flight: Arc<Mutex<HashMap<[u8; MESSAGE_ID_LEN], (u16, Vec<u8>)>>> =
        Arc::new(Mutex::new(HashMap::new()));

    spawn_deliverer(
        Arc::clone(&state),
        Arc::clone(&budget),
        Arc::clone(&closed),
        Arc::clone(&in_flight),
        frames_tx.clone(),
    );

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;

    let mut line = Vec::new();
    loop {
        line.clear();
        let read_bytes = reader.read_until(b'\n', &mut line).await?;
        if read_bytes == 0 {
            break;
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        state.commands.lock().expect("commands lock").push(text.clone());

        let mut parts = text.split(' ');
        match parts.next().unwrap_or("") {
            "IDENTIFY" => {
                let _body = read_sized(&mut reader).await?;
                send_frame(&frames_tx, Frame::response(OK)).await?;
            }
            "SUB" => {
                send_frame(&frames_tx, Frame::response(OK)).await?;
            }
            "PUB" => {
                let payload = read_sized(&mut reader).await?;
                state.published.lock().expect("published lock").push(payload);
                if state.fail_pub.load(Ordering::SeqCst) {
                    send_frame(&frames_tx, Frame::error(b"E_PUB_FAILED")).await?;
                } else {
                    send_frame(&frames_tx, Frame::response(OK)).await?;
                }
            }
            "MPUB" => {
                let body = read_sized(&mut reader).await?;
                let batch = parse_mpub_body(&body)?;
                state
                    .mpub_batches
                    .lock()
                    .expect("batches lock")
                    .push(batch);
                if state.fail_mpub.load(Ordering::SeqCst) {
                    send_frame(&frames_tx, Frame::error(b"E_MPUB_FAILED")).await?;
                } else {
                    send_frame(&frames_tx, Frame::response(OK)).await?;
                }
            }
            "RDY" => {
                let count: i64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
                budget.store(count, Ordering::SeqCst);
            }
            "FIN" => {
                if let Some(id) = parse_id(parts.next()) {
                    in_flight.lock().expect("in flight lock").remove(&id);
                }
            }
            "REQ" => {
                if let Some(id) = parse_id(parts.next()) {
                    let entry = in_flight.lock().expect("in flight lock").remove(&id);
                    if let Some((attempts, payload)) = entry {
                        state
                            .queue
                            .lock()
                            .expect("queue lock")
                            .push_back((attempts + 1, payload));
                    }
                }
            }
            "TOUCH" | "NOP" => {}
            "CLS" => {
                budget.store(0, Ordering::SeqCst);
                send_frame(&frames_tx, Frame::response(CLOSE_WAIT)).await?;
                break;
            }
            _ => {}
        }
    }

    closed.store(true, Ordering::SeqCst);
    drop(frames_tx);
    let _ = writer.await;
    Ok(())
}

fn spawn_deliverer(
    state: Arc<NsqdState>,
    budget: Arc<AtomicI64>,
    closed: Arc<AtomicBool>,
    in_flight: Arc<Mutex<HashMap<[u8; MESSAGE_ID_LEN], (u16, Vec<u8>)>>>,
    frames_tx: mpsc::Sender<Vec<u8>>,
) {
    tokio::spawn(async move {
        loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            while budget.load(Ordering::SeqCst) > 0 {
                let next = state.queue.lock().expect("queue lock").pop_front();
                let Some((attempts, payload)) = next else { break };
                let id = next_message_id();
                in_flight
                    .lock()
                    .expect("in flight lock")
                    .insert(id, (attempts, payload.clone()));
                let frame = MessageFrame {
                    timestamp_ns: 1,
                    attempts,
                    id: MessageId::from_bytes(id),
                    body: payload.into(),
                }
                .encode()
                .expect("encode message");
                if frames_tx.send(frame.to_vec()).await.is_err() {
                    return;
                }
                budget.fetch_sub(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
}

async fn send_frame(frames_tx: &mpsc::Sender<Vec<u8>>, frame: Frame) -> Result<()> {
    let bytes = frame.encode().context("encode frame")?;
    frames_tx
        .send(bytes.to_vec())
        .await
        .context("writer task gone")
}

async fn read_sized(reader: &mut BufReader<OwnedReadHalf>) -> Result<Vec<u8>> {
    let mut size_bytes = [0u8; 4];
    reader.read_exact(&mut size_bytes).await?;
    let size = u32::from_be_bytes(size_bytes) as usize;
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

fn parse_mpub_body(body: &[u8]) -> Result<Vec<Vec<u8>>> {
    let count = u32::from_be_bytes(body.get(0..4).context("count")?.try_into()?) as usize;
    let mut offset = 4;
    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        let size =
            u32::from_be_bytes(body.get(offset..offset + 4).context("size")?.try_into()?) as usize;
        offset += 4;
        payloads.push(body.get(offset..offset + size).context("payload")?.to_vec());
        offset += size;
    }
    Ok(payloads)
}

fn parse_id(part: Option<&str>) -> Option<[u8; MESSAGE_ID_LEN]> {
    part.and_then(|id| id.as_bytes().try_into().ok())
}

/// Canned-response discovery double: answers every request with the
/// current producer list.
pub struct MockLookupd {
    pub addr: SocketAddr,
    producers: Arc<Mutex<Vec<SocketAddr>>>,
}

impl MockLookupd {
    pub async fn start(producers: Vec<SocketAddr>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let producers = Arc::new(Mutex::new(producers));
        let serve_producers = Arc::clone(&producers);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let producers = Arc::clone(&serve_producers);
                tokio::spawn(async move {
                    let _ = serve_lookup(stream, producers).await;
                });
            }
        });
        Ok(Self { addr, producers })
    }

    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn set_producers(&self, producers: Vec<SocketAddr>) {
        *self.producers.lock().expect("producers lock") = producers;
    }
}

async fn serve_lookup(mut stream: TcpStream, producers: Arc<Mutex<Vec<SocketAddr>>>) -> Result<()> {
    // Consume the request head; the topic query is irrelevant here.
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        if stream.read_exact(&mut byte).await.is_err() {
            return Ok(());
        }
        request.push(byte[0]);
        if request.len() > 16 * 1024 {
            break;
        }
    }

    let producer_list: Vec<serde_json::Value> = producers
        .lock()
        .expect("producers lock")
        .iter()
        .map(|addr| {
            serde_json::json!({
                "broadcast_address": addr.ip().to_string(),
                "tcp_port": addr.port(),
            })
        })
        .collect();
    let body = serde_json::json!({ "producers": producer_list }).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
