//! UDP-in, TCP-out streaming loop.
//!
//! One task reads the transport stream from the UDP socket and runs the
//! demultiplexer; emitted access units are framed and fanned out to every
//! connected TCP subscriber through a broadcast channel. Slow subscribers
//! that fall behind the channel capacity are disconnected. A JSON status
//! snapshot goes to stdout periodically.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use crate::constants::TS_PACKET_SIZE;
use crate::demux::Demuxer;
use crate::network::create_udp_socket;
use crate::protocol;
use crate::types::StreamEntry;

pub struct Options {
    /// UDP socket to bind for the incoming transport stream
    pub input: SocketAddr,
    /// TCP address subscribers connect to
    pub listen: SocketAddr,
    pub enable_rds: bool,
    /// Seconds between JSON status snapshots
    pub status_secs: u64,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    timestamp: String,
    packets: u64,
    packet_errors: u64,
    subscribers: usize,
    streams: &'a [StreamEntry],
}

pub async fn run(opts: Options) -> anyhow::Result<()> {
    let socket = create_udp_socket(opts.input)
        .with_context(|| format!("binding TS input {}", opts.input))?;
    let udp = UdpSocket::from_std(socket.into())?;
    let listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("binding listener {}", opts.listen))?;
    info!(
        "reading TS from {}, serving subscribers on {}",
        opts.input, opts.listen
    );

    let (tx, _) = broadcast::channel::<Bytes>(1024);

    let accept_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("subscriber connected from {peer}");
                    tokio::spawn(serve_subscriber(stream, peer, accept_tx.subscribe()));
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    });

    let mut demux = Demuxer::new(opts.enable_rds);
    let mut buf = [0u8; 2048];
    let mut frames_out: Vec<Bytes> = Vec::new();
    let mut last_status = Instant::now();
    let status_every = Duration::from_secs(opts.status_secs.max(1));

    loop {
        let n = udp.recv(&mut buf).await?;
        if n == 0 {
            continue;
        }

        frames_out.clear();
        for chunk in buf[..n].chunks_exact(TS_PACKET_SIZE) {
            let (mux, side, change) = {
                let frames = demux.push_packet(chunk);
                (
                    frames.packet.as_ref().map(protocol::mux_packet),
                    frames.side.as_ref().map(protocol::mux_packet),
                    frames.packet.as_ref().is_some_and(|p| p.stream_change),
                )
            };
            // the announcement goes out ahead of the unit that latched it
            if change {
                frames_out.push(protocol::stream_change(&demux.stream_table()));
            }
            if let Some(frame) = mux {
                frames_out.push(frame);
            }
            if let Some(frame) = side {
                frames_out.push(frame);
            }
        }
        for frame in frames_out.drain(..) {
            let _ = tx.send(frame); // nobody listening is fine
        }

        if last_status.elapsed() >= status_every {
            let streams = demux.stream_table();
            let report = StatusReport {
                timestamp: Utc::now().to_rfc3339(),
                packets: demux.packets_seen(),
                packet_errors: demux.packet_errors(),
                subscribers: tx.receiver_count(),
                streams: &streams,
            };
            println!("{}", serde_json::to_string(&report)?);
            last_status = Instant::now();
        }
    }
}

async fn serve_subscriber(mut stream: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Bytes>) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                if let Err(e) = stream.write_all(&frame).await {
                    debug!("subscriber {peer} dropped: {e}");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("subscriber {peer} lagged by {n} frames, disconnecting");
                break;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
