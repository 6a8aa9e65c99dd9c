//! End-to-end scenarios: both daemons run in-process and real TCP + TLS
//! flows through the fronted port.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use mirage::{client, config, server};

const CHANNEL: &str = "6ba7b810-9dad-11d1-80b4-00c04fd430c8";
const CLIENT: &str = "6ba7b811-9dad-11d1-80b4-00c04fd430c8";

struct TestBed {
    proxy_addr: SocketAddr,
    front_addr: SocketAddr,
    fake_web_addr: SocketAddr,
    echo_addr: SocketAddr,
}

/// Both daemons, an echo target, and a stand-in for the impersonated site,
/// all running on a runtime that outlives every test.
fn testbed() -> &'static TestBed {
    static BED: OnceLock<TestBed> = OnceLock::new();
    BED.get_or_init(|| {
        std::thread::spawn(|| {
            let rt = Box::leak(Box::new(
                tokio::runtime::Runtime::new().expect("test runtime"),
            ));
            rt.block_on(setup(rt))
        })
        .join()
        .expect("testbed setup")
    })
}

async fn setup(rt: &'static tokio::runtime::Runtime) -> TestBed {
    // Echo target the tunnel will dial.
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    rt.spawn(async move {
        loop {
            let Ok((mut conn, _)) = echo.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    // Stand-in for the impersonated site: echoes whatever the visitor sent,
    // prefixed with a marker, so tests can see the replayed bytes.
    let fake_web = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let fake_web_addr = fake_web.local_addr().unwrap();
    rt.spawn(async move {
        loop {
            let Ok((mut conn, _)) = fake_web.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                if let Ok(n) = conn.read(&mut buf).await {
                    let _ = conn.write_all(b"fake-web:").await;
                    let _ = conn.write_all(&buf[..n]).await;
                }
            });
        }
    });

    let server_cfg: config::ServerConfig = serde_json::from_value(serde_json::json!({
        "FakeWebURL": format!("https://localhost:{}", fake_web_addr.port()),
        "FrontedListenAddr": "127.0.0.1:0",
        "Channel": CHANNEL,
        "Clients": [{"ID": CLIENT, "ListenAddr": "127.0.0.1:0"}],
    }))
    .unwrap();
    let srv = server::bind(server_cfg).await.unwrap();
    let front_addr = srv.front_addr().unwrap();
    rt.spawn(async move {
        let _ = srv.run().await;
    });

    let client_cfg: config::ClientConfig = serde_json::from_value(serde_json::json!({
        "AutoStart": false,
        "ListenAddr": "127.0.0.1:0",
        "ServerAddr": front_addr.to_string(),
        "Channel": CHANNEL,
        "Client": CLIENT,
        "FakeWebDomain": "localhost",
    }))
    .unwrap();
    let proxy = client::bind(client_cfg).await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();
    rt.spawn(async move {
        let _ = proxy.run().await;
    });

    TestBed {
        proxy_addr,
        front_addr,
        fake_web_addr,
        echo_addr,
    }
}

async fn read_exactly(conn: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    conn.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn http_connect_tunnels_bytes_both_ways() {
    let bed = testbed();
    timeout(Duration::from_secs(60), async {
        let mut conn = TcpStream::connect(bed.proxy_addr).await.unwrap();
        conn.write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", bed.echo_addr).as_bytes())
            .await
            .unwrap();

        let expected = b"HTTP/1.1 200 Connection established\r\n\r\n";
        assert_eq!(read_exactly(&mut conn, expected.len()).await, expected);

        conn.write_all(b"ping through the tunnel").await.unwrap();
        assert_eq!(
            read_exactly(&mut conn, 23).await,
            b"ping through the tunnel"
        );
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test]
async fn socks5_connect_replies_with_requested_target() {
    let bed = testbed();
    timeout(Duration::from_secs(60), async {
        let mut conn = TcpStream::connect(bed.proxy_addr).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_exactly(&mut conn, 2).await, [0x05, 0x00]);

        conn.write_all(&[0x05, 0x01, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x00, 0x50])
            .await
            .unwrap();
        assert_eq!(
            read_exactly(&mut conn, 10).await,
            [0x05, 0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x00, 0x50]
        );
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test]
async fn socks5_connect_carries_data_end_to_end() {
    let bed = testbed();
    timeout(Duration::from_secs(60), async {
        let mut conn = TcpStream::connect(bed.proxy_addr).await.unwrap();
        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_exactly(&mut conn, 2).await, [0x05, 0x00]);

        let [a, b, c, d] = match bed.echo_addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            std::net::IpAddr::V6(_) => unreachable!(),
        };
        let port = bed.echo_addr.port().to_be_bytes();
        conn.write_all(&[0x05, 0x01, 0x00, 0x01, a, b, c, d, port[0], port[1]])
            .await
            .unwrap();
        assert_eq!(
            read_exactly(&mut conn, 10).await,
            [0x05, 0x00, 0x00, 0x01, a, b, c, d, port[0], port[1]]
        );

        conn.write_all(b"socks payload").await.unwrap();
        assert_eq!(read_exactly(&mut conn, 13).await, b"socks payload");

        // A second request runs over the same pooled session.
        let mut again = TcpStream::connect(bed.proxy_addr).await.unwrap();
        again.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        assert_eq!(read_exactly(&mut again, 2).await, [0x05, 0x00]);
        again
            .write_all(&[0x05, 0x01, 0x00, 0x01, a, b, c, d, port[0], port[1]])
            .await
            .unwrap();
        read_exactly(&mut again, 10).await;
        again.write_all(b"second stream").await.unwrap();
        assert_eq!(read_exactly(&mut again, 13).await, b"second stream");
    })
    .await
    .expect("scenario timed out");
}

#[tokio::test]
async fn innocent_visitor_is_spliced_to_the_impersonated_site() {
    let bed = testbed();
    timeout(Duration::from_secs(60), async {
        let mut conn = TcpStream::connect(bed.front_addr).await.unwrap();

        // A plausible ClientHello prefix whose random was not produced by
        // the identity codec.
        let mut prefix = vec![0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc, 0x03, 0x03];
        prefix.extend_from_slice(&[0x5a; 32]);
        conn.write_all(&prefix).await.unwrap();

        let reply = read_exactly(&mut conn, 9 + prefix.len()).await;
        assert_eq!(&reply[..9], b"fake-web:");
        assert_eq!(&reply[9..], prefix.as_slice());
        let _ = bed.fake_web_addr;
    })
    .await
    .expect("scenario timed out");
}
