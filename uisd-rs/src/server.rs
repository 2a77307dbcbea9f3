/* Control-channel server. Connection tasks parse newline-framed JSON requests and
 * forward them, with a oneshot reply slot, onto the single service queue; the
 * dispatcher loop is the only consumer and therefore the only place registry mutations
 * happen. Path-monitor events and reader-thread removal requests arrive on the same
 * queue, so hot-plug, unplug and client traffic serialize naturally. */
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::manager::{DeviceId, UisManager};
use crate::proto::{ErrorCode, Reply, Request};

/* Everything the dispatcher loop consumes. */
#[derive(Debug)]
pub enum ServiceMessage {
    /* A client request with its reply slot. */
    Request {
        request: Request,
        reply: oneshot::Sender<Reply>,
    },
    /* The path monitor saw a new file under the device directory. */
    DeviceAppeared { path: PathBuf },
    /* A reader thread got "device not ready" and wants its device torn down. */
    DeviceDied { device: DeviceId },
}

/* The dispatcher loop. Runs until every sender is gone. */
pub async fn run_dispatcher(manager: Arc<UisManager>, mut queue: UnboundedReceiver<ServiceMessage>) {
    while let Some(message) = queue.recv().await {
        match message {
            ServiceMessage::Request { request, reply } => {
                let _ = reply.send(manager.handle_request(request));
            }
            ServiceMessage::DeviceAppeared { path } => {
                manager.add_device(&path);
            }
            ServiceMessage::DeviceDied { device } => {
                manager.remove_device(device);
            }
        }
    }

    info!("Service queue closed, shutting down");
    manager.shutdown();
}

/* Accept loop for the control socket. */
pub async fn run_control_listener(
    listener: UnixListener,
    queue: UnboundedSender<ServiceMessage>,
) -> Result<()> {
    info!("Control channel ready");
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(stream, queue.clone()));
            }
            Err(err) => {
                warn!("Control accept failed: {}", err);
            }
        }
    }
}

/* One client connection: a strict request/reply lockstep over the line framing. */
async fn serve_connection(stream: UnixStream, queue: UnboundedSender<ServiceMessage>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!("Control connection read failed: {}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let sent = queue.send(ServiceMessage::Request {
                    request,
                    reply: reply_tx,
                });
                if sent.is_err() {
                    /* The dispatcher is gone; nothing sensible left to answer. */
                    break;
                }
                reply_rx.await.unwrap_or(Reply::Error {
                    error: ErrorCode::IoFailed,
                })
            }
            Err(err) => {
                debug!("Unparseable control request: {}", err);
                Reply::Error {
                    error: ErrorCode::InvalidOp,
                }
            }
        };

        let mut body = match serde_json::to_vec(&reply) {
            Ok(body) => body,
            Err(err) => {
                warn!("Failed to encode reply: {}", err);
                break;
            }
        };
        body.push(b'\n');
        if write_half.write_all(&body).await.is_err() {
            break;
        }
    }

    debug!("Control connection closed");
}

/* Bind the control socket, clearing any stale file from a previous run. */
pub fn bind_control_socket(path: &std::path::Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config;
    use crate::proto::{EventMessage, TYPE_INPUT, TYPE_OUTPUT};
    use crate::target::datagram_port_factory;
    use crate::test_node::{parse_spec, TestNode, TestOpener};
    use crate::wire::{ItemData, ReportKind};

    static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "uisd-server-test-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    const PAD_SPEC: &str = r#"{
        "name": "Power Shock",
        "page": 1, "id": 5,
        "reports": [
            {"kind": "input", "id": 1, "items": [
                {"page": 1, "id": 48},
                {"page": 1, "id": 49}
            ]},
            {"kind": "output", "id": 2, "items": [
                {"page": 8, "id": 1}
            ]}
        ]
    }"#;

    struct TestService {
        dir: PathBuf,
        node: Arc<TestNode>,
        queue: UnboundedSender<ServiceMessage>,
    }

    async fn start_service(device_path: &Path) -> TestService {
        let dir = scratch_dir();
        let node = Arc::new(TestNode::from_spec(parse_spec(PAD_SPEC).unwrap()));

        let opener = TestOpener::new();
        opener.insert(device_path, Arc::clone(&node));

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let manager = UisManager::new(
            Box::new(opener),
            datagram_port_factory(dir.clone()),
            queue_tx.clone(),
        );

        let listener = bind_control_socket(&dir.join("control.sock")).unwrap();
        tokio::spawn(run_control_listener(listener, queue_tx.clone()));
        tokio::spawn(run_dispatcher(manager, queue_rx));

        queue_tx
            .send(ServiceMessage::DeviceAppeared {
                path: device_path.to_path_buf(),
            })
            .unwrap();

        TestService {
            dir,
            node,
            queue: queue_tx,
        }
    }

    struct TestClient {
        reader: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
        writer: tokio::net::unix::OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(dir: &Path) -> TestClient {
            let stream = UnixStream::connect(dir.join("control.sock")).await.unwrap();
            let (read_half, writer) = stream.into_split();
            TestClient {
                reader: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn request(&mut self, request: &Request) -> Reply {
            let mut body = serde_json::to_vec(request).unwrap();
            body.push(b'\n');
            self.writer.write_all(&body).await.unwrap();
            let line = self.reader.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let device_path = PathBuf::from("/dev/input/hid/usb/0");
        let service = start_service(&device_path).await;
        let mut client = TestClient::connect(&service.dir).await;

        /* The device appeared before the first request on the same queue, so it is
         * visible by the time the request is served. */
        match client.request(&Request::CountDevices).await {
            Reply::DeviceCount { devices } => assert_eq!(devices, 1),
            other => panic!("wrong reply: {other:?}"),
        }

        let id = match client.request(&Request::NextDevice { device: 0 }).await {
            Reply::NextDevice { next } => next,
            other => panic!("wrong reply: {other:?}"),
        };

        match client.request(&Request::GetDevice { device: id }).await {
            Reply::DeviceInfo {
                name,
                path,
                page,
                id: usage_id,
                input_reports,
                output_reports,
                feature_reports,
            } => {
                assert_eq!(name, "Power Shock");
                assert_eq!(path, "/dev/input/hid/usb/0");
                assert_eq!(page, 1);
                assert_eq!(usage_id, 5);
                assert_eq!(input_reports, 1);
                assert_eq!(output_reports, 1);
                assert_eq!(feature_reports, 0);
            }
            other => panic!("wrong reply: {other:?}"),
        }

        /* Iteration ends with bad-value. */
        match client.request(&Request::NextDevice { device: id }).await {
            Reply::Error { error } => assert_eq!(error, ErrorCode::BadValue),
            other => panic!("wrong reply: {other:?}"),
        }

        /* Garbage is answered, not dropped. */
        self::garbage_round_trip(&mut client).await;
    }

    async fn garbage_round_trip(client: &mut TestClient) {
        client.writer.write_all(b"{\"opcode\":\"no-such\"}\n").await.unwrap();
        let line = client.reader.next_line().await.unwrap().unwrap();
        let reply: Reply = serde_json::from_str(&line).unwrap();
        match reply {
            Reply::Error { error } => assert_eq!(error, ErrorCode::InvalidOp),
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_event_over_datagram_port() {
        let device_path = PathBuf::from("/dev/input/hid/usb/1");
        let service = start_service(&device_path).await;
        let mut client = TestClient::connect(&service.dir).await;

        let id = match client.request(&Request::NextDevice { device: 0 }).await {
            Reply::NextDevice { next } => next,
            other => panic!("wrong reply: {other:?}"),
        };

        /* Stand in for a client looper: a bound datagram socket under the runtime
         * dir, registered as port 5. */
        let port_socket = UnixDatagram::bind(config::port_path(&service.dir, 5)).unwrap();
        port_socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        match client
            .request(&Request::SetItemTarget {
                device: id,
                report: 0,
                kind: TYPE_INPUT,
                item: 0,
                target: 0,
                team: 1,
                port: 5,
                token: 0,
                cookie: 77,
            })
            .await
        {
            Reply::Target { target } => assert_ne!(target, 0),
            other => panic!("wrong reply: {other:?}"),
        }

        service
            .node
            .feeder(ReportKind::Input, 0)
            .deltas(&[ItemData { index: 0, value: 0.5 }]);

        let mut buf = [0u8; 256];
        let len = port_socket.recv(&mut buf).unwrap();
        let event: EventMessage = serde_json::from_slice(&buf[..len]).unwrap();
        match event {
            EventMessage::ItemEvent { token, cookie, value } => {
                assert_eq!(token, 0);
                assert_eq!(cookie, 77);
                assert_eq!(value, 0.5);
            }
        }

        /* The value is visible to polls as well. */
        match client
            .request(&Request::PollItemValue {
                device: id,
                report: 0,
                kind: TYPE_INPUT,
                item: 0,
            })
            .await
        {
            Reply::Value { value } => assert_eq!(value, 0.5),
            other => panic!("wrong reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_report_reaches_node() {
        let device_path = PathBuf::from("/dev/input/hid/usb/2");
        let service = start_service(&device_path).await;
        let mut client = TestClient::connect(&service.dir).await;

        let id = match client.request(&Request::NextDevice { device: 0 }).await {
            Reply::NextDevice { next } => next,
            other => panic!("wrong reply: {other:?}"),
        };

        match client
            .request(&Request::SendReport {
                device: id,
                report: 0,
                kind: TYPE_OUTPUT,
                data: vec![ItemData { index: 0, value: 0.25 }],
            })
            .await
        {
            Reply::Done => {}
            other => panic!("wrong reply: {other:?}"),
        }

        let sent = service.node.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, vec![ItemData { index: 0, value: 0.25 }]);
    }

    #[tokio::test]
    async fn test_device_death_removes_within_one_cycle() {
        let device_path = PathBuf::from("/dev/input/hid/usb/3");
        let service = start_service(&device_path).await;
        let mut client = TestClient::connect(&service.dir).await;

        match client.request(&Request::CountDevices).await {
            Reply::DeviceCount { devices } => assert_eq!(devices, 1),
            other => panic!("wrong reply: {other:?}"),
        }

        /* The kernel reports the device gone; the reader enqueues the removal on the
         * same queue our next request travels on. */
        service.node.feeder(ReportKind::Input, 0).gone();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match client.request(&Request::CountDevices).await {
                Reply::DeviceCount { devices: 0 } => break,
                Reply::DeviceCount { .. } if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                other => panic!("device was not removed: {other:?}"),
            }
        }

        drop(service.queue);
    }
}
