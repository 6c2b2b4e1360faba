//! Line-protocol relay server
//!
//! Run with: cargo run --example relay_server [BIND_ADDR]
//!
//! A client sends one command line, then either publishes or plays:
//!
//! ```text
//! pub live/cam1          then lines "<timestamp_ms> <v|k|a> <text>"
//! play live/cam1         receives lines "<timestamp_ms> <v|k|a> <text>"
//! ```
//!
//! Try it with netcat:
//!   nc localhost 1935    # type: play live/cam1
//!   nc localhost 1935    # type: pub live/cam1, then: 0 k hello
//!
//! ## Features
//!
//! - Late-joiner support: players joining mid-stream start at the last keyframe
//! - Backpressure: slow players drop their own oldest frames and resync at the
//!   next keyframe; the publisher never waits
//! - Ctrl-C interrupts every connection coroutine and waits for disposal

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::EnvFilter;

use livecore::coroutine::interruptible;
use livecore::{
    ConnectionContext, ConnectionHandler, ConsumerWait, Error, MessageKind, Result, Server,
    ServerConfig, SharedMessage, StreamConfig, StreamKey,
};

/// Merged-write batching for players
const MERGED_WRITE: Duration = Duration::from_millis(100);

struct RelayHandler;

fn encode(msg: &SharedMessage) -> Bytes {
    let tag = match (msg.kind(), msg.is_keyframe()) {
        (MessageKind::Video, true) => "k",
        (MessageKind::Video, false) => "v",
        _ => "a",
    };
    let text = String::from_utf8_lossy(msg.payload().get(2..).unwrap_or_default());
    Bytes::from(format!("{} {} {}\n", msg.timestamp_millis(), tag, text))
}

fn decode(line: &str) -> Option<(i64, MessageKind, Bytes)> {
    let mut parts = line.trim_end().splitn(3, ' ');
    let ms: i64 = parts.next()?.parse().ok()?;
    let (kind, header) = match parts.next()? {
        "k" => (MessageKind::Video, [0x17, 0x01]),
        "v" => (MessageKind::Video, [0x27, 0x01]),
        "a" => (MessageKind::Audio, [0xAF, 0x01]),
        _ => return None,
    };
    let mut payload = header.to_vec();
    payload.extend_from_slice(parts.next().unwrap_or_default().as_bytes());
    Some((ms * 1_000, kind, Bytes::from(payload)))
}

impl RelayHandler {
    async fn publish(
        &self,
        ctx: &ConnectionContext,
        key: StreamKey,
        mut lines: BufReader<TcpStream>,
    ) -> Result<()> {
        let publisher = ctx.registry.publish(&key, ctx.session_id).await?;
        println!("[{}] Publishing {}", ctx.session_id, key);

        let mut line = String::new();
        loop {
            line.clear();
            if interruptible(lines.read_line(&mut line)).await? == 0 {
                println!("[{}] Publisher left {}", ctx.session_id, key);
                return Ok(());
            }

            match decode(&line) {
                Some((timestamp, kind, payload)) => {
                    publisher.on_publish_message(1, payload, timestamp, kind)?;
                }
                None => {
                    interruptible(lines.get_mut().write_all(b"? <ms> <k|v|a> <text>\n")).await?;
                }
            }
        }
    }

    async fn play(&self, ctx: &ConnectionContext, key: StreamKey, mut stream: TcpStream) -> Result<()> {
        let consumer = ctx.registry.subscribe(&key).await?;
        println!("[{}] Playing {}", ctx.session_id, key);

        loop {
            match consumer.wait_batch(0, MERGED_WRITE, Some(MERGED_WRITE)).await? {
                ConsumerWait::Closed => {
                    println!("[{}] {} unpublished", ctx.session_id, key);
                    return Ok(());
                }
                ConsumerWait::TimedOut if consumer.is_empty() => continue,
                _ => {}
            }

            for msg in consumer.dump_packets(0) {
                interruptible(stream.write_all(&encode(&msg))).await?;
            }
        }
    }
}

impl ConnectionHandler for RelayHandler {
    async fn on_connection(&self, ctx: &ConnectionContext) -> bool {
        println!("[{}] New connection from {}", ctx.session_id, ctx.peer_addr);
        true
    }

    async fn serve(&self, ctx: &ConnectionContext, stream: TcpStream) -> Result<()> {
        let mut lines = BufReader::new(stream);
        let mut command = String::new();
        interruptible(lines.read_line(&mut command)).await?;

        let mut parts = command.split_whitespace();
        let verb = parts.next().unwrap_or_default().to_string();
        let key = parts
            .next()
            .and_then(StreamKey::parse)
            .ok_or_else(|| Error::InvalidState(format!("bad command: {}", command.trim())))?;

        match verb.as_str() {
            "pub" => self.publish(ctx, key, lines).await,
            "play" => self.play(ctx, key, lines.into_inner()).await,
            other => Err(Error::InvalidState(format!("unknown command {}", other))),
        }
    }

    async fn on_disconnect(&self, ctx: &ConnectionContext, result: &Result<()>) {
        match result {
            Ok(()) => println!("[{}] Disconnected", ctx.session_id),
            Err(e) => println!("[{}] Disconnected: {}", ctx.session_id, e),
        }
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("livecore=info".parse()?))
        .init();

    let addr: SocketAddr = match std::env::args().nth(1) {
        Some(arg) if arg == "localhost" => "127.0.0.1:1935".parse()?,
        Some(arg) => arg.parse()?,
        None => "0.0.0.0:1935".parse()?,
    };

    let config = ServerConfig::with_addr(addr)
        .max_connections(1000)
        .stream(
            StreamConfig::default()
                .queue_max_duration(Duration::from_secs(10))
                .gop_cache(true),
        );

    let server = Arc::new(Server::new(config, RelayHandler)?);
    println!("Relay server listening on {}", addr);

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
