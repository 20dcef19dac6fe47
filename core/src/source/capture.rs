use std::net::SocketAddr;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::record::{Record, Tag};
use crate::source::flow::FlowDecoder;
use crate::source::listener::ListenerRegistry;
use crate::telemetry::CaptureStats;

/// Per-listener settings the capture loop needs to build records.
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub tag: Tag,
    /// Stamp records with the local clock instead of the exporter's header time.
    pub ignore_timestamps: bool,
}

pub(crate) struct CaptureTask<D> {
    pub id: i64,
    pub socket: UdpSocket,
    pub decoder: D,
    pub settings: CaptureSettings,
    pub output: mpsc::Sender<Record>,
    pub cancel: CancellationToken,
    pub registry: ListenerRegistry,
}

impl<D: FlowDecoder> CaptureTask<D> {
    /// Reads datagrams until the listener is closed or the socket fails.
    /// Malformed datagrams are dropped and never end the loop.
    pub async fn run(mut self) -> CaptureStats {
        let protocol = self.decoder.protocol();
        let mut stats = CaptureStats::default();
        let mut buf = vec![0u8; self.decoder.max_datagram()];

        info!("{} listener {} capturing", protocol, self.id);
        loop {
            let (len, peer) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(read) => read,
                    Err(e) => {
                        debug!("{} listener {} read failed: {}", protocol, self.id, e);
                        break;
                    }
                },
            };
            stats.datagrams += 1;

            let Some(record) = self.build_record(&buf[..len], peer) else {
                stats.discarded += 1;
                continue;
            };
            stats.bytes += record.payload().len() as u64;

            if self.output.send(record).await.is_err() {
                warn!("{} listener {} output channel closed", protocol, self.id);
                break;
            }
            stats.records += 1;
        }

        self.registry.remove(self.id);
        info!(
            "{} listener {} exited: {}",
            protocol,
            self.id,
            serde_json::to_string(&stats).unwrap_or_default()
        );
        stats
    }

    fn build_record(&mut self, datagram: &[u8], peer: SocketAddr) -> Option<Record> {
        let header = match self.decoder.decode(datagram) {
            Ok(header) => header,
            Err(e) => {
                trace!("Dropping datagram from {}: {}", peer, e);
                return None;
            }
        };
        // the read buffer is reused, so the payload gets its own allocation
        let payload = datagram.get(..header.length)?.to_vec();
        let timestamp = if self.settings.ignore_timestamps {
            Utc::now()
        } else {
            header.export_time
        };
        Some(Record::new(
            self.settings.tag,
            timestamp,
            Some(peer.ip()),
            payload,
        ))
    }
}
