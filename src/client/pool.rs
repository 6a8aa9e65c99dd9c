//! Lifecycle of the single active tunnel session.
//!
//! At most one session is current and at most one dial is in flight. Users
//! wait on the pool once; if the dial that wait rode on fails, they give up
//! and the caller drops the local connection. Sessions older than five
//! minutes are retired gracefully so the transport keeps rotating.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use super::session::Session;

const REMOTE_CLOSED_QUEUE: usize = 8;
const REAP_INTERVAL: Duration = Duration::from_secs(60);
const SESSION_MAX_AGE: Duration = Duration::from_secs(5 * 60);
/// Allocating a stream id this high means the session is busy; start warming
/// a replacement.
const SPECULATIVE_DIAL_AT: u16 = 10;

pub struct SessionPool {
    me: Weak<SessionPool>,
    server_addr: String,
    tunnel: mirage_tunnel::Client,
    state: Mutex<PoolState>,
    notify: Notify,
    remote_closed_tx: mpsc::Sender<Arc<Session>>,
    remote_closed_rx: Mutex<Option<mpsc::Receiver<Arc<Session>>>>,
}

struct PoolState {
    current: Option<Arc<Session>>,
    connecting: bool,
    last_session_at: Option<Instant>,
}

impl SessionPool {
    pub fn new(server_addr: String, tunnel: mirage_tunnel::Client) -> Arc<SessionPool> {
        let (remote_closed_tx, remote_closed_rx) = mpsc::channel(REMOTE_CLOSED_QUEUE);
        Arc::new_cyclic(|me| SessionPool {
            me: me.clone(),
            server_addr,
            tunnel,
            state: Mutex::new(PoolState {
                current: None,
                connecting: false,
                last_session_at: None,
            }),
            notify: Notify::new(),
            remote_closed_tx,
            remote_closed_rx: Mutex::new(Some(remote_closed_rx)),
        })
    }

    /// Start the background reaper and the remote-closed drain.
    pub fn run(&self) {
        let pool = self.me.upgrade().expect("pool gone");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.reap_stale();
            }
        });

        let pool = self.me.upgrade().expect("pool gone");
        let mut rx = self
            .remote_closed_rx
            .lock()
            .unwrap()
            .take()
            .expect("pool started twice");
        tokio::spawn(async move {
            while let Some(sess) = rx.recv().await {
                pool.on_remote_closed(&sess);
            }
        });
    }

    /// Get the current session and a fresh stream on it, dialling if needed.
    ///
    /// Waits through at most one dial; a second miss returns `None` and the
    /// caller is expected to drop its local connection.
    pub async fn acquire(&self) -> Option<(Arc<Session>, u16, mpsc::Receiver<Bytes>)> {
        let mut try_count = 0;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut st = self.state.lock().unwrap();
                if let Some(sess) = st.current.clone() {
                    match sess.new_stream() {
                        Some((stream_id, rx)) => {
                            if stream_id >= SPECULATIVE_DIAL_AT {
                                self.try_connect_locked(&mut st);
                            }
                            return Some((sess, stream_id, rx));
                        }
                        None => {
                            // The session died under us; let the next caller
                            // trigger a fresh dial.
                            st.current = None;
                            return None;
                        }
                    }
                }
                try_count += 1;
                if try_count > 1 {
                    return None;
                }
                self.try_connect_locked(&mut st);
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    fn try_connect_locked(&self, st: &mut PoolState) {
        if !st.connecting {
            st.connecting = true;
            let pool = self.me.upgrade().expect("pool gone");
            tokio::spawn(pool.dial());
        }
    }

    async fn dial(self: Arc<SessionPool>) {
        let result = async {
            let stream = TcpStream::connect(&self.server_addr).await?;
            self.tunnel.connect(stream).await
        }
        .await;
        match result {
            Ok(transport) => {
                let sess = Session::spawn(transport, self.remote_closed_tx.clone());
                info!(server = %self.server_addr, "tunnel session established");
                self.on_dial_succeeded(sess);
            }
            Err(e) => {
                warn!(server = %self.server_addr, "tunnel dial failed: {}", e);
                self.on_dial_failed();
            }
        }
    }

    fn on_dial_succeeded(&self, sess: Arc<Session>) {
        {
            let mut st = self.state.lock().unwrap();
            st.last_session_at = Some(Instant::now());
            st.connecting = false;
            if let Some(old) = st.current.take() {
                old.auto_close();
            }
            st.current = Some(sess);
        }
        self.notify.notify_waiters();
    }

    fn on_dial_failed(&self) {
        self.state.lock().unwrap().connecting = false;
        self.notify.notify_waiters();
    }

    fn on_remote_closed(&self, sess: &Arc<Session>) {
        let mut st = self.state.lock().unwrap();
        if let Some(current) = &st.current {
            if Arc::ptr_eq(current, sess) {
                st.current = None;
            }
        }
    }

    fn reap_stale(&self) {
        let mut st = self.state.lock().unwrap();
        if let Some(current) = &st.current {
            let stale = st
                .last_session_at
                .map(|at| at.elapsed() > SESSION_MAX_AGE)
                .unwrap_or(true);
            if stale {
                debug!("retiring stale session");
                current.auto_close();
                st.current = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_tunnel::KeyPair;
    use rustls::ServerName;
    use uuid::Uuid;

    fn test_pool(server_addr: &str) -> Arc<SessionPool> {
        static IDENTITY: std::sync::OnceLock<KeyPair> = std::sync::OnceLock::new();
        let client = Uuid::from_bytes([2; 16]);
        let identity = IDENTITY.get_or_init(|| KeyPair::generate(&client, 2048).unwrap());
        let tunnel = mirage_tunnel::Client::new(
            Uuid::from_bytes([1; 16]),
            client,
            ServerName::try_from("www.example.com").unwrap(),
            identity,
        );
        SessionPool::new(server_addr.to_owned(), tunnel)
    }

    fn stub_session(pool: &Arc<SessionPool>) -> Arc<Session> {
        let (local, far) = tokio::io::duplex(4096);
        // Keep the far end open without a peer task so the session stays up.
        std::mem::forget(far);
        Session::spawn(local, pool.remote_closed_tx.clone())
    }

    #[tokio::test]
    async fn acquire_gives_up_after_one_failed_dial() {
        // Nothing listens on a reserved port; the dial fails fast.
        let pool = test_pool("127.0.0.1:1");
        pool.run();
        assert!(pool.acquire().await.is_none());
        assert!(!pool.state.lock().unwrap().connecting);
    }

    #[tokio::test]
    async fn install_retires_previous_session_and_advances_clock() {
        let pool = test_pool("127.0.0.1:1");
        let first = stub_session(&pool);
        pool.on_dial_succeeded(first.clone());
        let t1 = pool.state.lock().unwrap().last_session_at.unwrap();

        let second = stub_session(&pool);
        pool.on_dial_succeeded(second.clone());
        let t2 = pool.state.lock().unwrap().last_session_at.unwrap();
        assert!(t2 >= t1);

        // The replaced session is in graceful retirement: no streams, so it
        // refuses new ones shortly after.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(first.new_stream().is_none());
        assert!(second.new_stream().is_some());
    }

    #[tokio::test]
    async fn remote_closed_clears_only_matching_session() {
        let pool = test_pool("127.0.0.1:1");
        let sess = stub_session(&pool);
        pool.on_dial_succeeded(sess.clone());

        let other = stub_session(&pool);
        pool.on_remote_closed(&other);
        assert!(pool.state.lock().unwrap().current.is_some());

        pool.on_remote_closed(&sess);
        assert!(pool.state.lock().unwrap().current.is_none());
    }

    #[tokio::test]
    async fn stale_sessions_are_reaped() {
        let pool = test_pool("127.0.0.1:1");
        let sess = stub_session(&pool);
        pool.on_dial_succeeded(sess.clone());
        // A session without a recorded install time counts as stale.
        pool.state.lock().unwrap().last_session_at = None;
        pool.reap_stale();
        assert!(pool.state.lock().unwrap().current.is_none());

        // A freshly installed one is left alone.
        let fresh = stub_session(&pool);
        pool.on_dial_succeeded(fresh);
        pool.reap_stale();
        assert!(pool.state.lock().unwrap().current.is_some());
    }
}
