/* uisd control client: low-level request/reply plumbing plus the roster, device,
 * report and item handles applications hold. Handles cache the immutable attributes
 * from their construction reply and address the service by device id and report/item
 * index, never by service-side pointers. */
use std::io::BufReader;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use uisd::config::{self, ServiceConfig};
use uisd::proto::{self, ErrorCode, EventMessage, Reply, Request, NULL_TOKEN};
use uisd::wire::ItemData;

pub use uisd::proto::{TYPE_FEATURE, TYPE_INPUT, TYPE_OUTPUT};

/// A connection to the uisd control channel.
pub struct UisClient {
    io: Mutex<ClientIo>,
    config: ServiceConfig,
}

struct ClientIo {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl UisClient {
    /// Connect using the standard service configuration.
    pub fn connect() -> Result<Arc<UisClient>> {
        Self::connect_with(config::load())
    }

    pub fn connect_with(config: ServiceConfig) -> Result<Arc<UisClient>> {
        let stream = UnixStream::connect(&config.control_socket).with_context(|| {
            format!("Cannot connect to the input service at {:?}", config.control_socket)
        })?;
        let reader = BufReader::new(stream.try_clone().context("Cloning control stream")?);
        Ok(Arc::new(UisClient {
            io: Mutex::new(ClientIo {
                reader,
                writer: stream,
            }),
            config,
        }))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /* One request, one reply, in lockstep. Error replies come back as data; `call`
     * turns them into errors for the common case. */
    fn request(&self, request: &Request) -> Result<Reply> {
        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        proto::write_message(&mut io.writer, request).context("Control request failed")?;
        proto::read_message(&mut io.reader)
            .context("Control reply failed")?
            .ok_or_else(|| anyhow!("Input service closed the control channel"))
    }

    fn call(&self, request: &Request) -> Result<Reply> {
        match self.request(request)? {
            Reply::Error { error } => Err(rpc_error(error)),
            reply => Ok(reply),
        }
    }

    /// Load a synthetic test device (dev-hooks daemons only).
    pub fn load_test_device(&self, spec: &str) -> Result<i32> {
        match self.call(&Request::LoadTestDevice {
            spec: spec.to_string(),
        })? {
            Reply::FoundDevice { device } => Ok(device),
            other => bail!("Unexpected reply to load-test-device: {other:?}"),
        }
    }

    /// Remove all injected test devices (dev-hooks daemons only).
    pub fn reset_test_devices(&self) -> Result<()> {
        match self.call(&Request::ResetTestDevices)? {
            Reply::Done => Ok(()),
            other => bail!("Unexpected reply to reset-test-devices: {other:?}"),
        }
    }
}

fn rpc_error(code: ErrorCode) -> anyhow::Error {
    anyhow!("Input service replied {:?}", code)
}

/// Iterates the live devices in service order.
pub struct UisRoster {
    client: Arc<UisClient>,
    cookie: i32,
}

impl UisRoster {
    pub fn new(client: Arc<UisClient>) -> UisRoster {
        UisRoster { client, cookie: 0 }
    }

    pub fn count_devices(&self) -> Result<i32> {
        match self.client.call(&Request::CountDevices)? {
            Reply::DeviceCount { devices } => Ok(devices),
            other => bail!("Unexpected reply to count-devices: {other:?}"),
        }
    }

    /// The next device after the cursor, or None when the roster is exhausted.
    pub fn next_device(&mut self) -> Result<Option<UisDevice>> {
        match self.client.request(&Request::NextDevice {
            device: self.cookie,
        })? {
            Reply::NextDevice { next } => {
                let device = UisDevice::open(Arc::clone(&self.client), next)?;
                self.cookie = next;
                Ok(Some(device))
            }
            Reply::Error {
                error: ErrorCode::BadValue,
            } => Ok(None),
            Reply::Error { error } => Err(rpc_error(error)),
            other => bail!("Unexpected reply to next-device: {other:?}"),
        }
    }

    pub fn rewind(&mut self) {
        self.cookie = 0;
    }

    /// Look a device up by its cached kernel name.
    pub fn find_by_name(client: Arc<UisClient>, name: &str) -> Result<Option<UisDevice>> {
        match client.request(&Request::FindDevice {
            name: name.to_string(),
        })? {
            Reply::FoundDevice { device } => Ok(Some(UisDevice::open(client, device)?)),
            Reply::Error {
                error: ErrorCode::BadValue,
            } => Ok(None),
            Reply::Error { error } => Err(rpc_error(error)),
            other => bail!("Unexpected reply to find-device: {other:?}"),
        }
    }
}

/// One device, addressed by its service-assigned id.
pub struct UisDevice {
    client: Arc<UisClient>,
    device: i32,
    name: String,
    path: String,
    usage_page: u16,
    usage_id: u16,
    input_reports: i32,
    output_reports: i32,
    feature_reports: i32,
}

impl UisDevice {
    pub fn open(client: Arc<UisClient>, device: i32) -> Result<UisDevice> {
        match client.call(&Request::GetDevice { device })? {
            Reply::DeviceInfo {
                name,
                path,
                page,
                id,
                input_reports,
                output_reports,
                feature_reports,
            } => Ok(UisDevice {
                client,
                device,
                name,
                path,
                usage_page: page,
                usage_id: id,
                input_reports,
                output_reports,
                feature_reports,
            }),
            other => bail!("Unexpected reply to get-device: {other:?}"),
        }
    }

    pub fn device(&self) -> i32 {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn usage_page(&self) -> u16 {
        self.usage_page
    }

    pub fn usage_id(&self) -> u16 {
        self.usage_id
    }

    /// Report count across every type selected in the mask.
    pub fn count_reports(&self, kind: u8) -> i32 {
        let mut count = 0;
        if kind & TYPE_INPUT != 0 {
            count += self.input_reports;
        }
        if kind & TYPE_OUTPUT != 0 {
            count += self.output_reports;
        }
        if kind & TYPE_FEATURE != 0 {
            count += self.feature_reports;
        }
        count
    }

    /// The report at `index`, counted linearly across the types in the mask. The
    /// returned handle carries the resolved single type.
    pub fn report_at(&self, kind: u8, index: i32) -> Result<UisReport> {
        match self.client.call(&Request::GetReport {
            device: self.device,
            report: index,
            kind,
        })? {
            Reply::ReportInfo { items, kind } => Ok(UisReport {
                client: Arc::clone(&self.client),
                device: self.device,
                report: index,
                kind,
                items,
                pending: Vec::new(),
            }),
            other => bail!("Unexpected reply to get-report: {other:?}"),
        }
    }

    /// Find the first input item with the given usage.
    pub fn find_item(&self, usage_page: u16, usage_id: u16) -> Result<Option<UisItem>> {
        match self.client.request(&Request::FindItem {
            device: self.device,
            kind: TYPE_INPUT,
            page: usage_page,
            id: usage_id,
        })? {
            Reply::FoundItem {
                report,
                item,
                page,
                id,
                relative,
                value,
            } => Ok(Some(UisItem {
                client: Arc::clone(&self.client),
                device: self.device,
                report,
                item,
                kind: TYPE_INPUT,
                usage_page: page,
                usage_id: id,
                relative,
                value,
                target: 0,
            })),
            Reply::Error {
                error: ErrorCode::BadValue,
            } => Ok(None),
            Reply::Error { error } => Err(rpc_error(error)),
            other => bail!("Unexpected reply to find-item: {other:?}"),
        }
    }
}

/// One report. Output and feature reports batch outbound values until `send`.
pub struct UisReport {
    client: Arc<UisClient>,
    device: i32,
    report: i32,
    kind: u8,
    items: i32,
    pending: Vec<ItemData>,
}

impl UisReport {
    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn index(&self) -> i32 {
        self.report
    }

    pub fn count_items(&self) -> i32 {
        self.items
    }

    pub fn item_at(&self, item: i32) -> Result<UisItem> {
        match self.client.call(&Request::GetItem {
            device: self.device,
            report: self.report,
            kind: self.kind,
            item,
        })? {
            Reply::ItemInfo {
                page,
                id,
                relative,
                value,
            } => Ok(UisItem {
                client: Arc::clone(&self.client),
                device: self.device,
                report: self.report,
                item,
                kind: self.kind,
                usage_page: page,
                usage_id: id,
                relative,
                value,
                target: 0,
            }),
            other => bail!("Unexpected reply to get-item: {other:?}"),
        }
    }

    /// Stage a value for the next `send`. A second value for the same index replaces
    /// the staged one; nothing goes out until `send`.
    pub fn set_item_value(&mut self, index: i32, value: f32) -> Result<()> {
        if self.kind != TYPE_OUTPUT && self.kind != TYPE_FEATURE {
            bail!("Only output and feature reports can be sent");
        }
        match self.pending.iter_mut().find(|data| data.index == index) {
            Some(data) => data.value = value,
            None => self.pending.push(ItemData { index, value }),
        }
        Ok(())
    }

    /// Flush the staged records in one send-report call.
    pub fn send(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            bail!("Nothing staged to send");
        }
        match self.client.call(&Request::SendReport {
            device: self.device,
            report: self.report,
            kind: self.kind,
            data: self.pending.clone(),
        })? {
            Reply::Done => {
                self.make_empty();
                Ok(())
            }
            other => bail!("Unexpected reply to send-report: {other:?}"),
        }
    }

    /// Discard the staged records without sending.
    pub fn make_empty(&mut self) {
        self.pending.clear();
    }
}

/// One value field. Holds the last value seen at construction or `update`.
pub struct UisItem {
    client: Arc<UisClient>,
    device: i32,
    report: i32,
    item: i32,
    kind: u8,
    usage_page: u16,
    usage_id: u16,
    relative: bool,
    value: f32,
    target: u64,
}

impl UisItem {
    pub fn usage_page(&self) -> u16 {
        self.usage_page
    }

    pub fn usage_id(&self) -> u16 {
        self.usage_id
    }

    pub fn is_relative(&self) -> bool {
        self.relative
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    /// Re-poll the service for the current value.
    pub fn update(&mut self) -> Result<f32> {
        match self.client.call(&Request::PollItemValue {
            device: self.device,
            report: self.report,
            kind: self.kind,
            item: self.item,
        })? {
            Reply::Value { value } => {
                self.value = value;
                Ok(value)
            }
            other => bail!("Unexpected reply to poll-item-value: {other:?}"),
        }
    }

    /// Subscribe this item's changes to the given event port. The cookie comes back
    /// verbatim in every event. Replaces any prior subscription of this handle.
    pub fn set_target(&mut self, port: &EventPort, cookie: u64) -> Result<()> {
        match self.client.call(&Request::SetItemTarget {
            device: self.device,
            report: self.report,
            kind: self.kind,
            item: self.item,
            target: self.target,
            team: port.team(),
            port: port.port(),
            token: port.token(),
            cookie,
        })? {
            Reply::Target { target } => {
                self.target = target;
                Ok(())
            }
            other => bail!("Unexpected reply to set-item-target: {other:?}"),
        }
    }

    /// Release the subscription, if any.
    pub fn clear_target(&mut self) -> Result<()> {
        if self.target == 0 {
            return Ok(());
        }
        match self.client.call(&Request::SetItemTarget {
            device: self.device,
            report: self.report,
            kind: self.kind,
            item: self.item,
            target: self.target,
            team: -1,
            port: -1,
            token: NULL_TOKEN,
            cookie: 0,
        })? {
            Reply::Target { target } => {
                self.target = target;
                Ok(())
            }
            other => bail!("Unexpected reply to set-item-target: {other:?}"),
        }
    }
}

impl Drop for UisItem {
    fn drop(&mut self) {
        /* Best effort: a dangling subscription would otherwise outlive the handle. */
        let _ = self.clear_target();
    }
}

/// One delivered value change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub token: i32,
    pub cookie: u64,
    pub value: f32,
}

/// The client-side message sink: a datagram socket bound under the service runtime
/// directory, registered with set-target as (team, port, token).
pub struct EventPort {
    socket: UnixDatagram,
    path: PathBuf,
    port: i32,
    token: i32,
}

static NEXT_PORT_SALT: AtomicI32 = AtomicI32::new(0);

impl EventPort {
    pub fn bind(config: &ServiceConfig) -> Result<EventPort> {
        let team = std::process::id() as i32;
        for _ in 0..64 {
            let salt = NEXT_PORT_SALT.fetch_add(1, Ordering::Relaxed);
            let port = (team.wrapping_mul(64).wrapping_add(salt)) & i32::MAX;
            let path = config.port_path(port);
            match UnixDatagram::bind(&path) {
                Ok(socket) => {
                    return Ok(EventPort {
                        socket,
                        path,
                        port,
                        token: 0,
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("Cannot bind event port at {path:?}"));
                }
            }
        }
        bail!("No free event port number");
    }

    pub fn team(&self) -> i32 {
        std::process::id() as i32
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn token(&self) -> i32 {
        self.token
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.socket
            .set_read_timeout(timeout)
            .context("Setting event port timeout")
    }

    /// Block for the next event.
    pub fn recv(&self) -> Result<Event> {
        let mut buf = [0u8; 512];
        let len = self
            .socket
            .recv(&mut buf)
            .context("Receiving on event port")?;
        let message: EventMessage =
            serde_json::from_slice(&buf[..len]).context("Decoding event")?;
        let EventMessage::ItemEvent {
            token,
            cookie,
            value,
        } = message;
        Ok(Event {
            token,
            cookie,
            value,
        })
    }
}

impl Drop for EventPort {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    use tokio::sync::mpsc;

    use super::*;
    use uisd::manager::UisManager;
    use uisd::server::{self, ServiceMessage};
    use uisd::target::datagram_port_factory;
    use uisd::test_node::{parse_spec, TestNode, TestOpener};
    use uisd::wire::ReportKind;

    static NEXT_DIR: AtomicU32 = AtomicU32::new(0);

    const PAD_SPEC: &str = r#"{
        "name": "Power Shock",
        "page": 1, "id": 5,
        "reports": [
            {"kind": "input", "id": 1, "items": [
                {"page": 1, "id": 48},
                {"page": 1, "id": 49}
            ]},
            {"kind": "output", "id": 2, "items": [
                {"page": 8, "id": 1},
                {"page": 8, "id": 2}
            ]}
        ]
    }"#;

    struct TestDaemon {
        /* Keeps the dispatcher and listener tasks alive. */
        _runtime: tokio::runtime::Runtime,
        config: ServiceConfig,
        node: Arc<TestNode>,
    }

    fn start_daemon() -> TestDaemon {
        let dir = std::env::temp_dir().join(format!(
            "uisctl-client-test-{}-{}",
            std::process::id(),
            NEXT_DIR.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let config = ServiceConfig {
            device_dir: dir.join("devices"),
            control_socket: dir.join("control.sock"),
            runtime_dir: dir,
        };

        let node = Arc::new(TestNode::from_spec(parse_spec(PAD_SPEC).unwrap()));
        let opener = TestOpener::new();
        let device_path = PathBuf::from("/dev/input/hid/usb/0");
        opener.insert(&device_path, Arc::clone(&node));

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let manager = UisManager::new(
            Box::new(opener),
            datagram_port_factory(config.runtime_dir.clone()),
            queue_tx.clone(),
        );

        let listener = {
            let _guard = runtime.enter();
            server::bind_control_socket(&config.control_socket).unwrap()
        };
        runtime.spawn(server::run_control_listener(listener, queue_tx.clone()));
        runtime.spawn(server::run_dispatcher(manager, queue_rx));
        queue_tx
            .send(ServiceMessage::DeviceAppeared { path: device_path })
            .unwrap();

        TestDaemon {
            _runtime: runtime,
            config,
            node,
        }
    }

    #[test]
    fn test_roster_iteration() {
        let daemon = start_daemon();
        let client = UisClient::connect_with(daemon.config.clone()).unwrap();

        let mut roster = UisRoster::new(Arc::clone(&client));
        assert_eq!(roster.count_devices().unwrap(), 1);

        let device = roster.next_device().unwrap().unwrap();
        assert_eq!(device.name(), "Power Shock");
        assert_eq!(device.usage_page(), 1);
        assert_eq!(device.usage_id(), 5);
        assert_eq!(device.count_reports(TYPE_INPUT), 1);
        assert_eq!(device.count_reports(TYPE_INPUT | TYPE_OUTPUT), 2);

        assert!(roster.next_device().unwrap().is_none());
        roster.rewind();
        assert!(roster.next_device().unwrap().is_some());

        let found = UisRoster::find_by_name(Arc::clone(&client), "Power Shock").unwrap();
        assert!(found.is_some());
        assert!(
            UisRoster::find_by_name(client, "No Such Pad")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_item_subscription_delivers_events() {
        let daemon = start_daemon();
        let client = UisClient::connect_with(daemon.config.clone()).unwrap();

        let mut roster = UisRoster::new(Arc::clone(&client));
        let device = roster.next_device().unwrap().unwrap();

        /* The X axis: usage page Generic Desktop, usage id X. */
        let mut item = device.find_item(0x01, 0x30).unwrap().unwrap();
        assert!(!item.is_relative());

        let port = EventPort::bind(&daemon.config).unwrap();
        port.set_timeout(Some(Duration::from_secs(5))).unwrap();
        item.set_target(&port, 0xfeed).unwrap();

        daemon
            .node
            .feeder(ReportKind::Input, 0)
            .deltas(&[ItemData { index: 0, value: 0.5 }]);

        let event = port.recv().unwrap();
        assert_eq!(event.cookie, 0xfeed);
        assert_eq!(event.value, 0.5);

        assert_eq!(item.update().unwrap(), 0.5);
        item.clear_target().unwrap();
    }

    #[test]
    fn test_output_batching_replaces_by_index() {
        let daemon = start_daemon();
        let client = UisClient::connect_with(daemon.config.clone()).unwrap();

        let mut roster = UisRoster::new(Arc::clone(&client));
        let device = roster.next_device().unwrap().unwrap();
        let mut report = device.report_at(TYPE_OUTPUT, 0).unwrap();
        assert_eq!(report.kind(), TYPE_OUTPUT);
        assert_eq!(report.count_items(), 2);

        report.set_item_value(0, 1.0).unwrap();
        report.set_item_value(0, 0.25).unwrap();
        report.set_item_value(1, -1.0).unwrap();
        report.send().unwrap();

        let sent = daemon.node.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            vec![
                ItemData { index: 0, value: 0.25 },
                ItemData { index: 1, value: -1.0 }
            ]
        );

        /* The batch is cleared by a successful send. */
        assert!(report.send().is_err());

        /* make_empty discards without sending. */
        report.set_item_value(0, 1.0).unwrap();
        report.make_empty();
        assert!(report.send().is_err());
        assert_eq!(daemon.node.sent().len(), 1);
    }

    #[test]
    fn test_input_report_rejects_staging() {
        let daemon = start_daemon();
        let client = UisClient::connect_with(daemon.config.clone()).unwrap();

        let mut roster = UisRoster::new(client);
        let device = roster.next_device().unwrap().unwrap();
        let mut report = device.report_at(TYPE_INPUT, 0).unwrap();
        assert!(report.set_item_value(0, 1.0).is_err());
    }
}
