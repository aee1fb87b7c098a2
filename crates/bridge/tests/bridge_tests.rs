//! End-to-end tests against a running bridge
//!
//! Each test starts a [`Bridge`] on a loopback port with a scripted
//! peripheral, a file-backed boot image target in a temp dir and an
//! in-memory content store, then drives it over real WebSocket and HTTP
//! connections.
//!
//! Run with: `cargo test -p bridge --test bridge_tests`

use bridge::Bridge;
use bridge::config::BridgeConfig;
use bridge::indicator::{IndicatorState, LogSink};
use bridge::restart::Restarter;
use bridge::storage::{BootImageFactory, BootPointer, Slot, StorageTargets};
use bridge::test_utils::{
    DEFAULT_TEST_TIMEOUT, MemoryRegion, MemoryStoreFactory, MockDeviceHandle, OpenerScript,
    RecordingRestarter, ScriptedOpener,
};
use futures_util::{SinkExt, StreamExt};
use protocol::{HubFrame, StatusSnapshot};
use reqwest::StatusCode;
use reqwest::header::{CONNECTION, COOKIE, LOCATION, SET_COOKIE};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const PASSWORD: &str = "hunter2";
const BOOT_CAPACITY: u64 = 64 * 1024;
const CONTENT_CAPACITY: u64 = 1024;
const PREVIOUS_CONTENT: &[u8] = b"previous content";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestBridge {
    bridge: Bridge,
    addr: SocketAddr,
    script: OpenerScript,
    content: MemoryRegion,
    restarter: Arc<RecordingRestarter>,
    dir: TempDir,
    server: tokio::task::JoinHandle<()>,
}

fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.usb.connect_timeout_ms = 20;
    config.usb.retry_interval_ms = 20;
    config.usb.read_timeout_ms = 10;
    config.security.password = PASSWORD.to_string();
    config.storage.chunk_size = 512;
    config.storage.recv_timeout_secs = 2;
    config
}

impl TestBridge {
    async fn start() -> Self {
        let config = test_config();
        let (opener, script) = ScriptedOpener::new();
        let dir = tempfile::tempdir().unwrap();

        let content = MemoryRegion::new(CONTENT_CAPACITY);
        content.fill(PREVIOUS_CONTENT);

        let targets = StorageTargets {
            boot_image: Arc::new(BootImageFactory {
                slots: [dir.path().join("boot_a.bin"), dir.path().join("boot_b.bin")],
                pointer: dir.path().join("boot.ptr"),
                capacity: BOOT_CAPACITY,
            }),
            content_store: Arc::new(MemoryStoreFactory::new(content.clone())),
        };

        let restarter = Arc::new(RecordingRestarter::default());
        let bridge = Bridge::start(
            &config,
            opener,
            targets,
            restarter.clone() as Arc<dyn Restarter>,
            Box::new(LogSink::default()),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = bridge.router();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            bridge,
            addr,
            script,
            content,
            restarter,
            dir,
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn pointer_path(&self) -> PathBuf {
        self.dir.path().join("boot.ptr")
    }

    async fn attach_peripheral(&self, name: &str) -> MockDeviceHandle {
        let handle = self.script.push_device(name);
        let hub = self.bridge.state().hub.clone();
        eventually(|| hub.peripheral_status().connected).await;
        handle
    }

    async fn subscribe(&self) -> Socket {
        let before = self.bridge.state().hub.len();
        let (socket, _) = connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        let hub = self.bridge.state().hub.clone();
        eventually(|| hub.len() > before).await;
        socket
    }

    async fn login(&self, client: &reqwest::Client) -> String {
        let resp = client
            .post(self.url("/login"))
            .form(&[("password", PASSWORD)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        let cookie = resp.headers()[SET_COOKIE].to_str().unwrap();
        cookie.split(';').next().unwrap().to_string()
    }

    async fn stop(self) {
        self.server.abort();
        self.bridge.shutdown().await.unwrap();
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

async fn eventually(condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached in time");
}

/// Next data or text frame, skipping keepalive pings
async fn next_frame(socket: &mut Socket) -> Message {
    loop {
        let msg = tokio::time::timeout(DEFAULT_TEST_TIMEOUT, socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_status(socket: &mut Socket) -> StatusSnapshot {
    match next_frame(socket).await {
        Message::Text(text) => match HubFrame::from_text(text.as_str()).unwrap() {
            HubFrame::Status(status) => status,
        },
        other => panic!("expected a status frame, got {:?}", other),
    }
}

async fn next_data(socket: &mut Socket) -> Vec<u8> {
    match next_frame(socket).await {
        Message::Binary(data) => data.to_vec(),
        other => panic!("expected a data frame, got {:?}", other),
    }
}

mod relay {
    use super::*;

    #[tokio::test]
    async fn test_peripheral_chunks_arrive_in_order() {
        let bridge = TestBridge::start().await;
        let device = bridge.attach_peripheral("relay").await;
        let mut socket = bridge.subscribe().await;

        assert_eq!(next_status(&mut socket).await, StatusSnapshot { connected: true });
        assert_eq!(
            bridge.bridge.indicator().get(),
            IndicatorState::SubscriberActive
        );

        for len in [10usize, 20, 30] {
            device.push(&vec![len as u8; len]);
            assert_eq!(next_data(&mut socket).await, vec![len as u8; len]);
        }

        socket.close(None).await.unwrap();
        let hub = bridge.bridge.state().hub.clone();
        eventually(|| hub.is_empty()).await;
        let indicator = bridge.bridge.indicator().clone();
        eventually(|| indicator.get() == IndicatorState::PeripheralConnected).await;

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_every_chunk() {
        let bridge = TestBridge::start().await;
        let device = bridge.attach_peripheral("fanout").await;
        let mut first = bridge.subscribe().await;
        let mut second = bridge.subscribe().await;

        // Status is unchanged when the second joins, so only the first gets it
        assert_eq!(next_status(&mut first).await, StatusSnapshot { connected: true });

        device.push(b"hello");
        assert_eq!(next_data(&mut first).await, b"hello");
        assert_eq!(next_data(&mut second).await, b"hello");

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_subscribers_see_disconnect_and_reconnect() {
        let bridge = TestBridge::start().await;
        let mut socket = bridge.subscribe().await;
        assert_eq!(next_status(&mut socket).await, StatusSnapshot { connected: false });

        let device = bridge.attach_peripheral("flaky").await;
        assert_eq!(next_status(&mut socket).await, StatusSnapshot { connected: true });

        device.unplug();
        assert_eq!(next_status(&mut socket).await, StatusSnapshot { connected: false });
        assert!(!device.is_open());

        bridge.attach_peripheral("flaky").await;
        assert_eq!(next_status(&mut socket).await, StatusSnapshot { connected: true });

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_subscriber_input_reaches_peripheral() {
        let bridge = TestBridge::start().await;
        let device = bridge.attach_peripheral("input").await;
        let mut socket = bridge.subscribe().await;

        socket.send(Message::text("AT+GMR\r\n")).await.unwrap();
        socket
            .send(Message::binary(vec![0x00, 0xff]))
            .await
            .unwrap();

        let written = device.clone();
        eventually(|| written.written() == b"AT+GMR\r\n\x00\xff").await;

        bridge.stop().await;
    }
}

mod peripheral {
    use super::*;

    #[tokio::test]
    async fn test_status_endpoint_tracks_connection() {
        let bridge = TestBridge::start().await;
        let client = client();

        let status: StatusSnapshot = serde_json::from_str(
            &client
                .get(bridge.url("/status"))
                .send()
                .await
                .unwrap()
                .text()
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(!status.connected);

        bridge.attach_peripheral("status").await;
        let body = client
            .get(bridge.url("/status"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, r#"{"connected":true}"#);

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_serial_post_and_backlog() {
        let bridge = TestBridge::start().await;
        let client = client();
        let device = bridge.attach_peripheral("serial").await;

        let resp = client
            .post(bridge.url("/serial"))
            .body("reboot\n")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.text().await.unwrap(), "OK");
        assert_eq!(device.written(), b"reboot\n");

        device.push(b"boot: ok\n");
        let session = bridge.bridge.state().session.clone();
        eventually(|| session.backlog() == b"boot: ok\n").await;

        let resp = client.get(bridge.url("/serial")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"boot: ok\n");

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_serial_post_without_peripheral() {
        let bridge = TestBridge::start().await;
        let client = client();

        let resp = client
            .post(bridge.url("/serial"))
            .body("ping")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = client.post(bridge.url("/serial")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        bridge.stop().await;
    }
}

mod access {
    use super::*;

    #[tokio::test]
    async fn test_login_redirects() {
        let bridge = TestBridge::start().await;
        let client = client();

        let resp = client
            .post(bridge.url("/login"))
            .form(&[("password", "wrong")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[LOCATION], "/login.html?error=1");
        assert!(resp.headers().get(SET_COOKIE).is_none());

        let resp = client
            .post(bridge.url("/login"))
            .form(&[("password", PASSWORD)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers()[LOCATION], "/upload.html");
        let cookie = resp.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with("session="));
        assert!(cookie.contains("HttpOnly"));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_uploads_require_session() {
        let bridge = TestBridge::start().await;
        let client = client();

        for path in ["/upload", "/uploadfs"] {
            let resp = client
                .post(bridge.url(path))
                .body(vec![0u8; 16])
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{}", path);

            let resp = client
                .post(bridge.url(path))
                .header(COOKIE, "session=0123456789abcdef")
                .body(vec![0u8; 16])
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{}", path);
        }

        assert_eq!(&bridge.content.contents()[..PREVIOUS_CONTENT.len()], PREVIOUS_CONTENT);
        assert_eq!(bridge.content.erase_count(), 0);
        assert!(!bridge.pointer_path().exists());
        assert!(bridge.restarter.requests().is_empty());

        bridge.stop().await;
    }
}

mod upload {
    use super::*;

    #[tokio::test]
    async fn test_boot_image_replaced_in_inactive_slot() {
        let bridge = TestBridge::start().await;
        let client = client();
        let cookie = bridge.login(&client).await;

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let resp = client
            .post(bridge.url("/upload"))
            .header(COOKIE, &cookie)
            .body(payload.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONNECTION], "close");
        assert_eq!(resp.text().await.unwrap(), "OK");

        let pointer = BootPointer::read(&bridge.pointer_path()).unwrap().unwrap();
        assert_eq!(
            pointer,
            BootPointer {
                slot: Slot::B,
                length: payload.len() as u64,
                crc32: crc32fast::hash(&payload),
            }
        );
        let written = std::fs::read(bridge.dir.path().join("boot_b.bin")).unwrap();
        assert_eq!(written, payload);

        let requests = bridge.restarter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, Duration::from_millis(1000));
        assert_eq!(bridge.bridge.indicator().get(), IndicatorState::Busy);

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_content_store_replaced() {
        let bridge = TestBridge::start().await;
        let client = client();
        let cookie = bridge.login(&client).await;

        let payload = b"fresh content store image".repeat(20);
        let resp = client
            .post(bridge.url("/uploadfs"))
            .header(COOKIE, &cookie)
            .body(payload.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let contents = bridge.content.contents();
        assert_eq!(&contents[..payload.len()], &payload[..]);
        assert!(contents[payload.len()..].iter().all(|&b| b == 0xff));
        assert_eq!(bridge.content.erase_count(), 1);

        let requests = bridge.restarter.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, Duration::from_millis(800));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_content_store_rejected_untouched() {
        let bridge = TestBridge::start().await;
        let client = client();
        let cookie = bridge.login(&client).await;
        let before = bridge.bridge.indicator().get();

        let resp = client
            .post(bridge.url("/uploadfs"))
            .header(COOKIE, &cookie)
            .body(vec![0u8; CONTENT_CAPACITY as usize + 1])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(resp.headers()[CONNECTION], "close");

        assert_eq!(&bridge.content.contents()[..PREVIOUS_CONTENT.len()], PREVIOUS_CONTENT);
        assert_eq!(bridge.content.erase_count(), 0);
        assert!(bridge.restarter.requests().is_empty());
        assert_eq!(bridge.bridge.indicator().get(), before);

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let bridge = TestBridge::start().await;
        let client = client();
        let cookie = bridge.login(&client).await;

        let resp = client
            .post(bridge.url("/upload"))
            .header(COOKIE, &cookie)
            .body(Vec::<u8>::new())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!bridge.pointer_path().exists());
        assert!(bridge.restarter.requests().is_empty());

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_relay_keeps_running_during_rejected_upload() {
        let bridge = TestBridge::start().await;
        let client = client();
        let device = bridge.attach_peripheral("busy").await;
        let mut socket = bridge.subscribe().await;
        assert_eq!(next_status(&mut socket).await, StatusSnapshot { connected: true });

        let cookie = bridge.login(&client).await;
        let resp = client
            .post(bridge.url("/uploadfs"))
            .header(COOKIE, &cookie)
            .body(vec![0u8; CONTENT_CAPACITY as usize * 2])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        device.push(b"still here");
        assert_eq!(next_data(&mut socket).await, b"still here");
        assert_eq!(
            bridge.bridge.indicator().get(),
            IndicatorState::SubscriberActive
        );

        bridge.stop().await;
    }
}
