//! Outbound leg of one multiplexed stream on the server.
//!
//! A remote runs three tasks: the dialler doubles as the upstream reader,
//! a writer drains the inbound queue (caching bytes that arrive before the
//! dial completes), and a stop watcher turns the first stop signal into the
//! upstream notification and the teardown of both socket halves.

use bytes::Bytes;
use mirage_tunnel::frame::{Frame, StreamType, MAX_BODY_LENGTH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bytes queued towards the target while it is still being dialled.
const INBOUND_QUEUE: usize = 8;

pub struct Remote {
    data_tx: mpsc::Sender<Bytes>,
    stop_tx: mpsc::Sender<bool>,
}

impl Remote {
    /// Dial `address` and start forwarding in both directions.
    ///
    /// Upstream frames go out through `out_tx`; a remote-initiated close is
    /// announced on `del_tx` so the session can emit the stream teardown.
    pub fn spawn(
        stream_id: u16,
        address: String,
        out_tx: mpsc::Sender<Frame>,
        del_tx: mpsc::Sender<u16>,
    ) -> Remote {
        let (data_tx, data_rx) = mpsc::channel(INBOUND_QUEUE);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (conn_tx, conn_rx) = oneshot::channel();
        let die = CancellationToken::new();

        tokio::spawn(stop_watcher(stop_rx, del_tx, stream_id, die.clone()));
        tokio::spawn(dial_and_read(
            address,
            stream_id,
            out_tx,
            conn_tx,
            stop_tx.clone(),
            die.clone(),
        ));
        tokio::spawn(write_loop(data_rx, conn_rx, stop_tx.clone(), die));

        Remote { data_tx, stop_tx }
    }

    /// Queue bytes for the target. Suspends while the queue is full; a dead
    /// remote just discards.
    pub async fn send(&self, data: Bytes) {
        let _ = self.data_tx.send(data).await;
    }

    /// Idempotent: only the first signal wins. `server_close` records whose
    /// side failed and decides whether the client hears about it.
    pub fn stop(&self, server_close: bool) {
        let _ = self.stop_tx.try_send(server_close);
    }
}

async fn stop_watcher(
    mut stop_rx: mpsc::Receiver<bool>,
    del_tx: mpsc::Sender<u16>,
    stream_id: u16,
    die: CancellationToken,
) {
    if let Some(server_close) = stop_rx.recv().await {
        if server_close {
            let _ = del_tx.send(stream_id).await;
        }
    }
    die.cancel();
}

async fn dial_and_read(
    address: String,
    stream_id: u16,
    out_tx: mpsc::Sender<Frame>,
    conn_tx: oneshot::Sender<OwnedWriteHalf>,
    stop_tx: mpsc::Sender<bool>,
    die: CancellationToken,
) {
    let conn = tokio::select! {
        _ = die.cancelled() => return,
        conn = TcpStream::connect(&address) => match conn {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%address, "outbound dial failed: {}", e);
                let _ = stop_tx.try_send(true);
                return;
            }
        },
    };
    trace!(%address, stream_id, "outbound connected");

    let (mut read_half, write_half) = conn.into_split();
    if conn_tx.send(write_half).is_err() {
        return;
    }

    let mut buf = vec![0u8; MAX_BODY_LENGTH];
    loop {
        tokio::select! {
            _ = die.cancelled() => return,
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => {
                    let _ = stop_tx.try_send(true);
                    return;
                }
                Ok(n) => {
                    let frame = Frame::new(
                        StreamType::Data,
                        stream_id,
                        Bytes::copy_from_slice(&buf[..n]),
                    );
                    if out_tx.send(frame).await.is_err() {
                        // The session writer is gone; teardown is on its way.
                        return;
                    }
                }
            },
        }
    }
}

async fn write_loop(
    mut data_rx: mpsc::Receiver<Bytes>,
    mut conn_rx: oneshot::Receiver<OwnedWriteHalf>,
    stop_tx: mpsc::Sender<bool>,
    die: CancellationToken,
) {
    // Until the dial completes, everything that arrives is cached.
    let mut pending: Vec<Bytes> = Vec::with_capacity(INBOUND_QUEUE);
    let mut writer = loop {
        tokio::select! {
            _ = die.cancelled() => return,
            data = data_rx.recv() => match data {
                Some(data) => pending.push(data),
                None => return,
            },
            connected = &mut conn_rx => match connected {
                Ok(writer) => break writer,
                Err(_) => {
                    // The dial never produced a socket; the stop watcher is
                    // already tearing the stream down.
                    die.cancelled().await;
                    return;
                }
            },
        }
    };

    // The cache flushes in arrival order before anything newer.
    for data in pending.drain(..) {
        if writer.write_all(&data).await.is_err() {
            let _ = stop_tx.try_send(true);
            return;
        }
    }
    loop {
        tokio::select! {
            _ = die.cancelled() => return,
            data = data_rx.recv() => match data {
                Some(data) => {
                    if writer.write_all(&data).await.is_err() {
                        let _ = stop_tx.try_send(true);
                        return;
                    }
                }
                None => return,
            },
        }
    }
}
