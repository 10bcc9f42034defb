//! Syslog UDP receiver: drain the socket into the bounded ingest queues.

use super::pipeline::{self, IngestContext};
use super::stats::IngestStats;
use crate::config;
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct UdpReceiver {
    socket: UdpSocket,
    senders: Vec<mpsc::Sender<(SocketAddr, String)>>,
    stats: Arc<IngestStats>,
}

impl UdpReceiver {
    /// Bind the syslog socket and spawn the consumer pool.
    pub async fn bind(ctx: Arc<IngestContext>) -> Result<(Self, Vec<JoinHandle<()>>)> {
        let socket = UdpSocket::bind(ctx.config.syslog_addr).await?;
        info!(addr = %ctx.config.syslog_addr, "syslog UDP receiver listening");

        let consumers = config::INGEST_CONSUMERS;
        let per_queue = (config::UDP_QUEUE_CAPACITY / consumers).max(1);
        let mut senders = Vec::with_capacity(consumers);
        let mut handles = Vec::with_capacity(consumers);
        for shard in 0..consumers {
            let (tx, rx) = mpsc::channel(per_queue);
            senders.push(tx);
            handles.push(tokio::spawn(pipeline::run_consumer(
                Arc::clone(&ctx),
                shard,
                rx,
            )));
        }

        Ok((
            Self {
                socket,
                senders,
                stats: Arc::clone(&ctx.stats),
            },
            handles,
        ))
    }

    /// Receive loop. Datagrams may carry several newline-separated lines;
    /// producers never block: beyond queue capacity lines are dropped and
    /// counted.
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "syslog UDP receive error");
                    continue;
                }
            };
            IngestStats::bump(&self.stats.udp_packets);
            IngestStats::add(&self.stats.udp_bytes, len as u64);

            let text = String::from_utf8_lossy(&buf[..len]);
            let shard = pipeline::shard_for_addr(&peer, self.senders.len());
            for line in text.split('\n') {
                if line.trim().is_empty() {
                    continue;
                }
                match self.senders[shard].try_send((peer, line.to_string())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        IngestStats::bump(&self.stats.udp_drops);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        anyhow::bail!("ingest consumer queue closed");
                    }
                }
            }
        }
    }
}
