//! # TCP bus transport
//!
//! Line-delimited JSON over TCP. The client opens with a `hello` and waits
//! for the broker's `welcome`; after that it sends `subscribe` and
//! `unsubscribe` requests and the broker pushes one
//! `{"topic": .., "payload": ..}` frame per message.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use realtime::{Delivery, Session, Transport, handshake_error};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

/// Longest frame accepted from the broker, newline excluded.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request<'a> {
    Hello { client: &'a str },
    Subscribe { topic: &'a str },
    Unsubscribe { topic: &'a str },
}

#[derive(Deserialize)]
struct Reply {
    op: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct Frame {
    topic: String,
    payload: Box<RawValue>,
}

/// Opens [`TcpSession`]s against a line-JSON broker.
#[derive(Debug, Clone)]
pub struct TcpBus {
    client: String,
    handshake_timeout: Duration,
    max_frame_len: usize,
}

impl TcpBus {
    #[must_use]
    pub fn new(client: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self { client: client.into(), handshake_timeout, max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }

    /// Frames longer than `max_frame_len` bytes are skipped.
    #[must_use]
    pub const fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }
}

impl Transport for TcpBus {
    type Session = TcpSession;

    async fn connect(&self, endpoint: &str) -> Result<TcpSession> {
        let handshake = handshake(endpoint, &self.client, self.max_frame_len);
        tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_elapsed| {
                anyhow!(handshake_error!(
                    "no welcome from {} within {:?}",
                    endpoint,
                    self.handshake_timeout
                ))
            })?
    }
}

async fn handshake(endpoint: &str, client: &str, max_frame_len: usize) -> Result<TcpSession> {
    let stream =
        TcpStream::connect(endpoint).await.with_context(|| format!("connecting to {endpoint}"))?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;

    let (reader, writer) = stream.into_split();
    let mut session = TcpSession {
        reader: BufReader::new(reader),
        frame: Vec::new(),
        oversized: false,
        max_frame_len,
        writer,
    };
    session.send(&Request::Hello { client }).await?;

    let line = session
        .read_frame()
        .await
        .context("reading handshake reply")?
        .ok_or_else(|| anyhow!(handshake_error!("bus closed the connection during handshake")))?;
    let reply: Reply = serde_json::from_slice(&line).context("decoding handshake reply")?;

    if reply.op != "welcome" {
        let reason = reply.reason.unwrap_or_else(|| reply.op.clone());
        return Err(anyhow!(handshake_error!("bus refused the session: {}", reason)));
    }

    debug!(endpoint, client, "bus handshake complete");
    Ok(session)
}

/// An open line-JSON session.
#[derive(Debug)]
pub struct TcpSession {
    reader: BufReader<OwnedReadHalf>,
    /// Bytes of the frame read so far. Kept here so a cancelled read resumes
    /// where it stopped.
    frame: Vec<u8>,
    /// Set while discarding the rest of a frame over `max_frame_len`.
    oversized: bool,
    max_frame_len: usize,
    writer: OwnedWriteHalf,
}

impl TcpSession {
    async fn send(&mut self, request: &Request<'_>) -> Result<()> {
        let mut line = serde_json::to_vec(request).context("encoding request")?;
        line.push(b'\n');
        self.writer.write_all(&line).await.context("writing to bus")?;
        Ok(())
    }

    /// Read the next newline-terminated frame as raw bytes. Frames over the
    /// size cap are dropped whole. `Ok(None)` at end of stream.
    ///
    /// Cancel safe: the only await is `fill_buf`, and buffered bytes are
    /// consumed only after they have been copied into `self.frame`.
    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(None);
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            if !self.oversized {
                if self.frame.len() + chunk.len() > self.max_frame_len {
                    warn!(
                        monotonic_counter.bus_bad_frames = 1,
                        limit = self.max_frame_len,
                        "skipping oversized frame"
                    );
                    self.oversized = true;
                    self.frame.clear();
                } else {
                    self.frame.extend_from_slice(chunk);
                }
            }
            let used = newline.map_or(available.len(), |at| at + 1);
            self.reader.consume(used);

            if newline.is_some() {
                if std::mem::take(&mut self.oversized) {
                    continue;
                }
                return Ok(Some(std::mem::take(&mut self.frame)));
            }
        }
    }
}

impl Session for TcpSession {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.send(&Request::Subscribe { topic }).await
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.send(&Request::Unsubscribe { topic }).await
    }

    async fn next(&mut self) -> Result<Option<Delivery>> {
        while let Some(line) = self.read_frame().await.context("reading from bus")? {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Frame>(&line) {
                Ok(frame) => {
                    let payload = frame.payload.get().to_string();
                    return Ok(Some(Delivery::new(frame.topic, payload)));
                }
                Err(err) => {
                    warn!(
                        monotonic_counter.bus_bad_frames = 1,
                        error = %err,
                        "skipping unreadable frame"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("closing bus connection")
    }
}
