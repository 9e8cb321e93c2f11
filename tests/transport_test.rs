use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use commandnet::network::{
    Data, DataType, LineCodec, PackageCodec, SendExecutor, TransferListener, END_PACKAGE,
};
use commandnet::request::BoxFuture;
use commandnet::{
    setup_local_tracing, CommandProcessor, PayloadKind, ProcessorProvider, RequestKind,
    TransportServer,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::codec::Framed;

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

struct EchoProcessor;

impl CommandProcessor for EchoProcessor {
    fn handle(&self, request: RequestKind) -> BoxFuture<'_> {
        Box::pin(async move {
            match request {
                RequestKind::Binary(request) => {
                    request.request().send(request.data().clone()).unwrap();
                }
                RequestKind::Text(request) => {
                    let text = request.text().to_string();
                    if text == "bye" {
                        request.request().send_close(text).unwrap();
                    } else {
                        request.request().send(text).unwrap();
                    }
                }
                RequestKind::Json(_) => {}
            }
        })
    }
}

struct EchoProvider {
    kind: PayloadKind,
    offline: Mutex<Vec<u32>>,
}

impl EchoProvider {
    fn new(kind: PayloadKind) -> Arc<Self> {
        Arc::new(EchoProvider {
            kind,
            offline: Mutex::new(Vec::new()),
        })
    }

    fn offline_indexes(&self) -> Vec<u32> {
        self.offline.lock().clone()
    }
}

impl ProcessorProvider for EchoProvider {
    fn payload_kind(&self) -> PayloadKind {
        self.kind
    }

    fn create_processor(&self) -> Arc<dyn CommandProcessor> {
        Arc::new(EchoProcessor)
    }

    fn offline(&self, index: u32) {
        self.offline.lock().push(index);
    }
}

async fn start_server(
    provider: Arc<EchoProvider>,
    socket_timeout: Option<Duration>,
) -> TransportServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = TransportServer::builder()
        .listener(listener)
        .provider(provider)
        .socket_timeout(socket_timeout)
        .build()
        .unwrap();
    server.start().unwrap();
    server
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[rstest]
#[tokio::test]
async fn test_binary_echo(_setup: ()) {
    let server = start_server(EchoProvider::new(PayloadKind::Binary), None).await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, PackageCodec::new());

    framed.send(Data::text("hello, Ray!")).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let data = Data::decode(&frame).unwrap();
    assert_eq!(data.data_type(), DataType::Text);
    assert_eq!(data.payload().as_ref(), b"hello, Ray!");

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_large_binary_payload_crosses_packages(_setup: ()) {
    let server = start_server(EchoProvider::new(PayloadKind::Binary), None).await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, PackageCodec::new());

    let payload: Vec<u8> = (0..200_000).map(|i| (i % 253) as u8).collect();
    framed
        .send(Data::new(DataType::Zip, payload.clone()))
        .await
        .unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    let data = Data::decode(&frame).unwrap();
    assert_eq!(data.data_type(), DataType::Zip);
    assert_eq!(data.payload().as_ref(), payload.as_slice());

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_unknown_frame_type_is_dropped_and_connection_survives(_setup: ()) {
    let provider = EchoProvider::new(PayloadKind::Binary);
    let server = start_server(provider.clone(), None).await;
    let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

    let mut raw = BytesMut::new();
    raw.put_u16(0x7f7f);
    raw.put_u16(3);
    raw.put_u8(END_PACKAGE);
    raw.put_slice(b"bad");
    stream.write_all(&raw).await.unwrap();

    let mut framed = Framed::new(stream, PackageCodec::new());
    framed.send(Data::text("still here")).await.unwrap();
    let frame = framed.next().await.unwrap().unwrap();
    assert_eq!(Data::decode(&frame).unwrap().payload().as_ref(), b"still here");
    assert!(provider.offline_indexes().is_empty());

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_offline_fires_once_and_index_is_reused(_setup: ()) {
    let provider = EchoProvider::new(PayloadKind::Text);
    let server = start_server(provider.clone(), None).await;

    let first = TcpStream::connect(server.local_addr()).await.unwrap();
    wait_until("first registration", || server.connection_count() == 1).await;
    let first_index = server.registry().connections()[0].index();
    assert_eq!(first_index, 0);

    drop(first);
    wait_until("offline callback", || !provider.offline_indexes().is_empty()).await;
    time::sleep(Duration::from_millis(50)).await;
    assert_eq!(provider.offline_indexes(), vec![first_index]);
    assert_eq!(server.connection_count(), 0);

    let _second = TcpStream::connect(server.local_addr()).await.unwrap();
    wait_until("second registration", || server.connection_count() == 1).await;
    assert_eq!(server.registry().connections()[0].index(), first_index);

    server.close().await;
    assert_eq!(provider.offline_indexes(), vec![first_index, first_index]);
}

#[rstest]
#[tokio::test]
async fn test_close_takes_every_connection_offline(_setup: ()) {
    let provider = EchoProvider::new(PayloadKind::Text);
    let server = start_server(provider.clone(), None).await;

    let a = TcpStream::connect(server.local_addr()).await.unwrap();
    let b = TcpStream::connect(server.local_addr()).await.unwrap();
    wait_until("two registrations", || server.connection_count() == 2).await;

    server.close().await;
    let mut offline = provider.offline_indexes();
    offline.sort_unstable();
    assert_eq!(offline, vec![0, 1]);
    assert_eq!(server.connection_count(), 0);

    // the peers observe the close
    for stream in [a, b] {
        let mut framed = Framed::new(stream, LineCodec::new());
        assert!(framed.next().await.is_none());
    }
    assert!(TcpStream::connect(server.local_addr()).await.is_err());
}

#[rstest]
#[tokio::test]
async fn test_close_before_start(_setup: ()) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = TransportServer::builder()
        .listener(listener)
        .provider(EchoProvider::new(PayloadKind::Text))
        .build()
        .unwrap();

    server.close().await;
    server.close().await;
    assert!(server.start().is_err());
}

#[rstest]
#[tokio::test]
async fn test_builder_requires_listener_and_provider(_setup: ()) {
    assert!(TransportServer::builder()
        .provider(EchoProvider::new(PayloadKind::Text))
        .build()
        .is_err());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(TransportServer::builder().listener(listener).build().is_err());
}

#[rstest]
#[tokio::test]
async fn test_read_timeout_is_not_fatal(_setup: ()) {
    let provider = EchoProvider::new(PayloadKind::Text);
    let server = start_server(provider.clone(), Some(Duration::from_millis(30))).await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, LineCodec::new());

    // several timeouts elapse before the first line
    time::sleep(Duration::from_millis(200)).await;
    framed.send("late").await.unwrap();
    assert_eq!(framed.next().await.unwrap().unwrap(), "late");
    assert!(provider.offline_indexes().is_empty());

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_responses_keep_request_order(_setup: ()) {
    let server = start_server(EchoProvider::new(PayloadKind::Text), None).await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, LineCodec::new());

    for i in 0..50 {
        framed.feed(format!("line-{i}")).await.unwrap();
    }
    SinkExt::<String>::flush(&mut framed).await.unwrap();
    for i in 0..50 {
        assert_eq!(framed.next().await.unwrap().unwrap(), format!("line-{i}"));
    }

    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_send_close_flushes_then_closes(_setup: ()) {
    let provider = EchoProvider::new(PayloadKind::Text);
    let server = start_server(provider.clone(), None).await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, LineCodec::new());

    framed.feed("one").await.unwrap();
    framed.feed("bye").await.unwrap();
    SinkExt::<&str>::flush(&mut framed).await.unwrap();
    assert_eq!(framed.next().await.unwrap().unwrap(), "one");
    assert_eq!(framed.next().await.unwrap().unwrap(), "bye");
    assert!(framed.next().await.is_none());

    wait_until("offline callback", || provider.offline_indexes() == vec![0]).await;
    server.close().await;
}

#[rstest]
#[tokio::test]
async fn test_peer_that_stops_reading_does_not_delay_others(_setup: ()) {
    let server = TransportServer::builder()
        .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .provider(EchoProvider::new(PayloadKind::Text))
        .write_timeout(Duration::from_secs(3))
        .build()
        .unwrap();
    server.start().unwrap();

    let stalled = TcpStream::connect(server.local_addr()).await.unwrap();
    wait_until("first registration", || server.connection_count() == 1).await;
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut healthy = Framed::new(stream, LineCodec::new());
    wait_until("second registration", || server.connection_count() == 2).await;

    // far beyond what the socket buffers hold, and never read
    let sender = server.message_sender();
    let chunk = "x".repeat(1 << 20);
    for _ in 0..64 {
        sender.send(0, chunk.clone()).unwrap();
    }

    healthy.send("ping").await.unwrap();
    let reply = time::timeout(Duration::from_millis(500), healthy.next())
        .await
        .expect("reply held up behind the stalled connection")
        .unwrap()
        .unwrap();
    assert_eq!(reply, "ping");
    assert!(sender.queue_size() > 0);

    drop(stalled);
    server.close().await;
    assert_eq!(sender.queue_size(), 0);
}

#[rstest]
#[tokio::test]
async fn test_message_sender_broadcast(_setup: ()) {
    let server = start_server(EchoProvider::new(PayloadKind::Text), None).await;
    let a = TcpStream::connect(server.local_addr()).await.unwrap();
    let b = TcpStream::connect(server.local_addr()).await.unwrap();
    wait_until("two registrations", || server.connection_count() == 2).await;

    let sender = server.message_sender();
    assert_eq!(sender.broadcast("news"), 2);
    assert!(sender.send(99, "nobody").is_err());

    for stream in [a, b] {
        let mut framed = Framed::new(stream, LineCodec::new());
        assert_eq!(framed.next().await.unwrap().unwrap(), "news");
    }

    server.close().await;
}

#[derive(Default)]
struct CountingListener {
    before: AtomicUsize,
    after: AtomicUsize,
    bytes: AtomicUsize,
}

impl TransferListener for CountingListener {
    fn before_transfer(&self, _index: u32, _data: &Data) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn after_transfer(&self, _index: u32, _data: &Data, result: &io::Result<usize>) {
        self.after.fetch_add(1, Ordering::SeqCst);
        if let Ok(written) = result {
            self.bytes.fetch_add(*written, Ordering::SeqCst);
        }
    }
}

#[rstest]
#[tokio::test]
async fn test_transfer_listener_wraps_binary_writes(_setup: ()) {
    let listener = Arc::new(CountingListener::default());
    let executor = Arc::new(SendExecutor::new());
    let server = TransportServer::builder()
        .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .provider(EchoProvider::new(PayloadKind::Binary))
        .send_executor(executor.clone())
        .transfer_listener(listener.clone())
        .build()
        .unwrap();
    server.start().unwrap();

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, PackageCodec::new());
    framed.send(Data::text("abc")).await.unwrap();
    framed.next().await.unwrap().unwrap();

    server.close().await;
    assert_eq!(listener.before.load(Ordering::SeqCst), 1);
    assert_eq!(listener.after.load(Ordering::SeqCst), 1);
    // one package header plus the tag-free payload
    assert_eq!(listener.bytes.load(Ordering::SeqCst), 5 + 3);

    // a shared executor outlives the server; its owner shuts it down
    executor.shutdown().await;
    assert_eq!(executor.active_writers(), 0);
}
