//! Server side of one tunnel transport: frame reader, demux agent, and a
//! dedicated writer task.

use std::collections::HashMap;
use std::io;

use mirage_tunnel::frame::{read_frame, Frame, ProtoType, StreamType, MAX_FRAME_SIZE};
use mirage_tunnel::{Socks5Address, TlsStream};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const IN_QUEUE: usize = 1;
const OUT_QUEUE: usize = 16;
const REMOTE_DEL_QUEUE: usize = 16;

use super::remote::Remote;

/// Run one accepted tunnel transport to completion.
pub async fn run(stream: TlsStream) {
    let (reader, writer) = tokio::io::split(stream);
    run_split(reader, writer).await;
}

/// Same as [`run`] but over any transport halves; tests drive this with
/// in-memory pipes.
pub(crate) async fn run_split<R, W>(reader: R, writer: W)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (in_tx, in_rx) = mpsc::channel::<Frame>(IN_QUEUE);
    let (out_tx, out_rx) = mpsc::channel::<Frame>(OUT_QUEUE);
    let (err_tx, err_rx) = mpsc::channel::<io::Error>(1);
    let die = CancellationToken::new();

    tokio::spawn(read_loop(reader, in_tx, die.clone()));
    tokio::spawn(write_loop(writer, out_rx, err_tx, die.clone()));
    agent(in_rx, out_tx, err_rx, die).await;
}

/// Decode frames off the transport; any violation or transport error ends
/// the session.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    in_tx: mpsc::Sender<Frame>,
    die: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    loop {
        let frame = tokio::select! {
            _ = die.cancelled() => return,
            r = read_frame(&mut reader, &mut buf) => match r {
                Ok(frame) => frame,
                Err(e) => {
                    trace!("tunnel transport read ended: {}", e);
                    return;
                }
            },
        };
        if in_tx.send(frame).await.is_err() {
            return;
        }
    }
}

/// Serialize outgoing frames onto the transport.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut out_rx: mpsc::Receiver<Frame>,
    err_tx: mpsc::Sender<io::Error>,
    die: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = die.cancelled() => break,
            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let result = async {
            writer.write_all(&frame.to_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            let _ = err_tx.try_send(e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn agent(
    mut in_rx: mpsc::Receiver<Frame>,
    out_tx: mpsc::Sender<Frame>,
    mut err_rx: mpsc::Receiver<io::Error>,
    die: CancellationToken,
) {
    let (del_tx, mut del_rx) = mpsc::channel::<u16>(REMOTE_DEL_QUEUE);
    let mut streams: HashMap<u16, Remote> = HashMap::with_capacity(16);

    loop {
        tokio::select! {
            frame = in_rx.recv() => {
                let Some(frame) = frame else { break };
                if frame.head.proto_type != ProtoType::Tcp {
                    break;
                }
                match frame.head.stream_type {
                    StreamType::New => {
                        let stream_id = frame.head.stream_id;
                        // A duplicate id is a protocol violation from the
                        // peer; kill the whole session.
                        if streams.contains_key(&stream_id) {
                            debug!(stream_id, "duplicate stream open");
                            break;
                        }
                        let Ok((address, _)) = Socks5Address::decode(&frame.body) else {
                            break;
                        };
                        trace!(stream_id, target = %address, "stream open");
                        let remote = Remote::spawn(
                            stream_id,
                            address.to_string(),
                            out_tx.clone(),
                            del_tx.clone(),
                        );
                        streams.insert(stream_id, remote);
                    }
                    StreamType::Del => {
                        if let Some(remote) = streams.remove(&frame.head.stream_id) {
                            remote.stop(false);
                        }
                    }
                    StreamType::Data => {
                        if let Some(remote) = streams.get(&frame.head.stream_id) {
                            remote.send(frame.body).await;
                        }
                    }
                }
            },
            Some(stream_id) = del_rx.recv() => {
                streams.remove(&stream_id);
                let frame = Frame::new(StreamType::Del, stream_id, bytes::Bytes::new());
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            },
            Some(e) = err_rx.recv() => {
                trace!("tunnel transport write failed: {}", e);
                break;
            },
        }
    }

    die.cancel();
    debug!(live_streams = streams.len(), "tunnel session torn down");
    for (_, remote) in streams.drain() {
        remote.stop(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mirage_tunnel::frame::{FrameHead, HEAD_LENGTH};
    use tokio::io::{duplex, AsyncReadExt};
    use tokio::net::TcpListener;

    async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: Frame) {
        w.write_all(&frame.to_bytes()).await.unwrap();
    }

    fn new_frame(stream_id: u16, addr: &Socks5Address) -> Frame {
        let mut body = Vec::new();
        addr.encode(&mut body).unwrap();
        Frame::new(StreamType::New, stream_id, Bytes::from(body))
    }

    #[tokio::test]
    async fn open_dial_and_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let (near, far) = duplex(64 * 1024);
        let (far_read, far_write) = tokio::io::split(far);
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(near);
            run_split(r, w).await;
        });

        let mut to_session = far_write;
        let addr = Socks5Address::from_host_port(&target.ip().to_string(), target.port());
        write_frame(&mut to_session, new_frame(1, &addr)).await;
        write_frame(
            &mut to_session,
            Frame::new(StreamType::Data, 1, Bytes::from_static(b"ping")),
        )
        .await;

        let (mut upstream, _) = listener.accept().await.unwrap();
        let mut got = [0u8; 4];
        upstream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        // Bytes from the target come back as data frames for stream 1.
        upstream.write_all(b"pong").await.unwrap();
        let mut from_session = far_read;
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        let frame = read_frame(&mut from_session, &mut buf).await.unwrap();
        assert_eq!(frame.head.stream_type, StreamType::Data);
        assert_eq!(frame.head.stream_id, 1);
        assert_eq!(frame.body, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn failed_dial_comes_back_as_stream_del() {
        let (near, far) = duplex(64 * 1024);
        let (far_read, mut far_write) = tokio::io::split(far);
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(near);
            run_split(r, w).await;
        });

        let addr = Socks5Address::from_host_port("127.0.0.1", 1);
        write_frame(&mut far_write, new_frame(42, &addr)).await;

        let mut from_session = far_read;
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        let frame = read_frame(&mut from_session, &mut buf).await.unwrap();
        assert_eq!(frame.head.stream_type, StreamType::Del);
        assert_eq!(frame.head.stream_id, 42);
        assert_eq!(frame.head.body_length, 0);
    }

    #[tokio::test]
    async fn duplicate_stream_new_terminates_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let (near, far) = duplex(64 * 1024);
        let (far_read, mut far_write) = tokio::io::split(far);
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(near);
            run_split(r, w).await;
        });

        let addr = Socks5Address::from_host_port(&target.ip().to_string(), target.port());
        write_frame(&mut far_write, new_frame(8, &addr)).await;
        write_frame(&mut far_write, new_frame(8, &addr)).await;

        // The session closes its transport instead of spawning a second
        // remote for the same id.
        let mut from_session = far_read;
        let mut buf = [0u8; 1];
        assert_eq!(from_session.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn udp_frames_terminate_session() {
        let (near, far) = duplex(64 * 1024);
        let (far_read, mut far_write) = tokio::io::split(far);
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(near);
            run_split(r, w).await;
        });

        let mut head_buf = [0u8; HEAD_LENGTH];
        let mut head = FrameHead::new(StreamType::Data, ProtoType::Udp, 1);
        head.body_length = 0;
        head.encode(&mut head_buf);
        far_write.write_all(&head_buf).await.unwrap();

        let mut from_session = far_read;
        let mut buf = [0u8; 1];
        assert_eq!(from_session.read(&mut buf).await.unwrap(), 0);
    }
}
