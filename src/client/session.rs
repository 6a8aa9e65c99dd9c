//! One tunnel transport and the local streams multiplexed over it.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use mirage_tunnel::frame::{
    read_frame, FrameHead, ProtoType, StreamType, HEAD_LENGTH, MAX_BODY_LENGTH, MAX_FRAME_SIZE,
};
use mirage_tunnel::Socks5Address;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Capacity of the per-stream queue feeding a local socket.
const STREAM_QUEUE: usize = 8;

type Transport = Box<dyn AsyncReadWrite + Send + Unpin>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncReadWrite for T {}

pub struct Session {
    writer: tokio::sync::Mutex<WriteHalf<Transport>>,
    state: Mutex<State>,
    die: CancellationToken,
}

struct State {
    streams: HashMap<u16, mpsc::Sender<Bytes>>,
    next_stream_id: u32,
    auto_close: bool,
    closed: bool,
}

impl Session {
    /// Wrap an established transport and start its demux agent.
    pub fn spawn(
        transport: impl AsyncRead + AsyncWrite + Send + Unpin + 'static,
        remote_closed_tx: mpsc::Sender<Arc<Session>>,
    ) -> Arc<Session> {
        let transport: Transport = Box::new(transport);
        let (reader, writer) = tokio::io::split(transport);
        let sess = Arc::new(Session {
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(State {
                streams: HashMap::with_capacity(16),
                next_stream_id: 0,
                auto_close: false,
                closed: false,
            }),
            die: CancellationToken::new(),
        });
        tokio::spawn(Session::agent(sess.clone(), reader, remote_closed_tx));
        sess
    }

    /// Register a new stream, avoiding ids still in use. Returns the id and
    /// the receiving end of the stream's inbound queue, or `None` once the
    /// session is closed or full.
    pub fn new_stream(&self) -> Option<(u16, mpsc::Receiver<Bytes>)> {
        let mut st = self.state.lock().unwrap();
        if st.closed || st.streams.len() >= usize::from(u16::MAX) {
            return None;
        }
        let stream_id = loop {
            st.next_stream_id = st.next_stream_id.wrapping_add(1);
            let candidate = st.next_stream_id as u16;
            if !st.streams.contains_key(&candidate) {
                break candidate;
            }
        };
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        st.streams.insert(stream_id, tx);
        Some((stream_id, rx))
    }

    pub fn del_stream(&self, stream_id: u16) {
        let mut st = self.state.lock().unwrap();
        st.streams.remove(&stream_id);
        if st.auto_close && st.streams.is_empty() {
            self.die.cancel();
        }
    }

    /// Ask for graceful retirement: the transport goes down as soon as the
    /// last stream leaves.
    pub fn auto_close(&self) {
        let mut st = self.state.lock().unwrap();
        st.auto_close = true;
        if st.streams.is_empty() {
            self.die.cancel();
        }
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.die.is_cancelled() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;
        if result.is_err() {
            self.die.cancel();
        }
        result
    }

    pub async fn write_stream_new(&self, stream_id: u16, addr: &Socks5Address) -> io::Result<()> {
        let mut body = Vec::with_capacity(HEAD_LENGTH + 19);
        body.resize(HEAD_LENGTH, 0);
        addr.encode(&mut body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut head = FrameHead::new(StreamType::New, ProtoType::Tcp, stream_id);
        head.body_length = (body.len() - HEAD_LENGTH) as u16;
        head.encode((&mut body[..HEAD_LENGTH]).try_into().unwrap());
        self.write(&body).await
    }

    pub async fn write_stream_del(&self, stream_id: u16) -> io::Result<()> {
        let mut buf = [0u8; HEAD_LENGTH];
        FrameHead::new(StreamType::Del, ProtoType::Tcp, stream_id).encode(&mut buf);
        self.write(&buf).await
    }

    pub async fn write_stream_data(&self, stream_id: u16, payload: &[u8]) -> io::Result<()> {
        debug_assert!(payload.len() <= MAX_BODY_LENGTH);
        let mut buf = Vec::with_capacity(HEAD_LENGTH + payload.len());
        buf.resize(HEAD_LENGTH, 0);
        let mut head = FrameHead::new(StreamType::Data, ProtoType::Tcp, stream_id);
        head.body_length = payload.len() as u16;
        head.encode((&mut buf[..HEAD_LENGTH]).try_into().unwrap());
        buf.extend_from_slice(payload);
        self.write(&buf).await
    }

    /// Demultiplex frames from the transport until it fails or the session
    /// is told to die, then tear everything down.
    async fn agent(
        self: Arc<Session>,
        mut reader: ReadHalf<Transport>,
        remote_closed_tx: mpsc::Sender<Arc<Session>>,
    ) {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        loop {
            let frame = tokio::select! {
                _ = self.die.cancelled() => break,
                r = read_frame(&mut reader, &mut buf) => match r {
                    Ok(frame) => frame,
                    Err(e) => {
                        trace!("session transport read ended: {}", e);
                        break;
                    }
                },
            };
            if frame.head.proto_type != ProtoType::Tcp {
                break;
            }
            match frame.head.stream_type {
                StreamType::Del => self.del_stream(frame.head.stream_id),
                StreamType::Data => {
                    let tx = {
                        let st = self.state.lock().unwrap();
                        st.streams.get(&frame.head.stream_id).cloned()
                    };
                    // Unknown ids are dropped silently; the peer may still
                    // be flushing a stream we already tore down.
                    if let Some(tx) = tx {
                        if tx.send(frame.body).await.is_err() {
                            self.del_stream(frame.head.stream_id);
                            let _ = self.write_stream_del(frame.head.stream_id).await;
                        }
                    }
                }
                StreamType::New => break,
            }
        }

        self.die.cancel();
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        let auto_close = {
            let mut st = self.state.lock().unwrap();
            st.closed = true;
            st.streams.clear();
            st.auto_close
        };
        debug!(auto_close, "session torn down");
        if !auto_close {
            // A full pool queue just means a retirement is already pending.
            let _ = remote_closed_tx.try_send(self.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn closed_tx() -> mpsc::Sender<Arc<Session>> {
        mpsc::channel(8).0
    }

    #[tokio::test]
    async fn stream_ids_are_unique_and_start_at_one() {
        let (local, _far) = duplex(4096);
        let sess = Session::spawn(local, closed_tx());
        let (first, _rx1) = sess.new_stream().unwrap();
        let (second, _rx2) = sess.new_stream().unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn data_frames_reach_the_right_stream() {
        let (local, far) = duplex(4096);
        let sess = Session::spawn(local, closed_tx());
        let (id, mut rx) = sess.new_stream().unwrap();

        let (mut far_read, mut far_write) = tokio::io::split(far);
        let mut head = [0u8; HEAD_LENGTH];
        let mut frame_head = FrameHead::new(StreamType::Data, ProtoType::Tcp, id);
        frame_head.body_length = 3;
        frame_head.encode(&mut head);
        far_write.write_all(&head).await.unwrap();
        far_write.write_all(b"abc").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abc"));
        drop(far_read);
    }

    #[tokio::test]
    async fn peer_del_drops_the_stream() {
        let (local, far) = duplex(4096);
        let sess = Session::spawn(local, closed_tx());
        let (id, mut rx) = sess.new_stream().unwrap();

        let (_far_read, mut far_write) = tokio::io::split(far);
        let mut head = [0u8; HEAD_LENGTH];
        FrameHead::new(StreamType::Del, ProtoType::Tcp, id).encode(&mut head);
        far_write.write_all(&head).await.unwrap();

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_new_from_peer_kills_the_session() {
        let (local, far) = duplex(4096);
        let (tx, mut closed_rx) = mpsc::channel(8);
        let sess = Session::spawn(local, tx);
        let (_id, mut rx) = sess.new_stream().unwrap();

        let (_far_read, mut far_write) = tokio::io::split(far);
        let mut head = [0u8; HEAD_LENGTH];
        FrameHead::new(StreamType::New, ProtoType::Tcp, 9).encode(&mut head);
        far_write.write_all(&head).await.unwrap();

        assert!(rx.recv().await.is_none());
        let dead = closed_rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&dead, &sess));
        assert!(sess.new_stream().is_none());
    }

    #[tokio::test]
    async fn transport_eof_notifies_pool_and_empties_map() {
        let (local, far) = duplex(4096);
        let (tx, mut closed_rx) = mpsc::channel(8);
        let sess = Session::spawn(local, tx);
        let (_id, mut rx) = sess.new_stream().unwrap();

        drop(far);
        assert!(rx.recv().await.is_none());
        assert!(closed_rx.recv().await.is_some());
        assert!(sess.new_stream().is_none());
    }

    #[tokio::test]
    async fn auto_close_waits_for_last_stream() {
        let (local, far) = duplex(4096);
        let (tx, mut closed_rx) = mpsc::channel(8);
        let sess = Session::spawn(local, tx);
        let (id, _rx) = sess.new_stream().unwrap();

        sess.auto_close();
        let (mut far_read, _far_write) = tokio::io::split(far);

        // The transport only goes down once the last stream leaves.
        sess.del_stream(id);
        let mut buf = [0u8; 1];
        assert_eq!(far_read.read(&mut buf).await.unwrap(), 0);

        // The pool asked for this retirement; it is not notified about it.
        assert!(closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_go_out_encoded() {
        let (local, far) = duplex(4096);
        let sess = Session::spawn(local, closed_tx());
        let (id, _rx) = sess.new_stream().unwrap();
        sess.write_stream_data(id, b"hi").await.unwrap();

        let (mut far_read, _far_write) = tokio::io::split(far);
        let mut out = [0u8; HEAD_LENGTH + 2];
        far_read.read_exact(&mut out).await.unwrap();
        assert_eq!(out[..HEAD_LENGTH], [0x04, 0x00, id as u8, 0x00, 0x02]);
        assert_eq!(&out[HEAD_LENGTH..], b"hi");
    }
}
