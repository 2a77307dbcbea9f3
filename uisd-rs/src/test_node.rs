/* Synthetic device definitions: a JSON device spec and an in-memory DeviceNode built
 * from it. Tests script input reports through the feeder handles and inspect captured
 * sends; the dev-hooks control opcodes inject the same nodes into a running daemon.
 *
 * Only compiled for tests or when the `dev-hooks` feature is enabled. */
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::error::{Result, UisError};
use crate::node::{
    DeviceNode, NodeDeviceInfo, NodeItemInfo, NodeOpener, NodeReportInfo, ReadOutcome,
};
use crate::proto::EventMessage;
use crate::sync::lock;
use crate::target::{EventPort, PortFactory};
use crate::wire::{ENCODING_UTF8, ItemData, KernelHandle, ReportDataBuf, ReportKind};

/* ------------------------------------------------------------------ */
/* JSON DTOs                                                            */
/* ------------------------------------------------------------------ */

#[derive(Debug, Default, Deserialize)]
pub struct TestDeviceSpec {
    #[serde(default = "default_name")]
    pub name: String,
    /// Top-level usage page (Generic Desktop by default).
    #[serde(default = "default_page")]
    pub page: u16,
    /// Top-level usage id (Gamepad by default).
    #[serde(default = "default_usage")]
    pub id: u16,
    #[serde(default)]
    pub reports: Vec<TestReportSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestReportSpec {
    /// "input", "output" or "feature".
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub id: u8,
    #[serde(default)]
    pub items: Vec<TestItemSpec>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct TestItemSpec {
    #[serde(default)]
    pub page: u16,
    #[serde(default)]
    pub id: u16,
    #[serde(default)]
    pub relative: bool,
}

fn default_name() -> String {
    "Test Device".to_string()
}
fn default_page() -> u16 {
    0x01
}
fn default_usage() -> u16 {
    0x05
}
fn default_kind() -> String {
    "input".to_string()
}

/* Minimum sane device: one input report with an X axis. */
fn default_report() -> TestReportSpec {
    TestReportSpec {
        kind: "input".to_string(),
        id: 1,
        items: vec![TestItemSpec {
            page: 0x01,
            id: 0x30,
            relative: false,
        }],
    }
}

/* Parse a JSON string into a [`TestDeviceSpec`]. An empty string or `{}` produces the
 * minimum sane device. */
pub fn parse_spec(json: &str) -> std::result::Result<TestDeviceSpec, serde_json::Error> {
    let mut spec: TestDeviceSpec = if json.trim().is_empty() {
        TestDeviceSpec::default()
    } else {
        serde_json::from_str(json)?
    };
    if spec.reports.is_empty() {
        spec.reports.push(default_report());
    }
    Ok(spec)
}

/* ------------------------------------------------------------------ */
/* The node itself                                                      */
/* ------------------------------------------------------------------ */

enum Feed {
    Deltas(Vec<ItemData>),
    Release,
    Gone,
}

struct TestReport {
    handle: KernelHandle,
    id: u8,
    items: Vec<TestItemSpec>,
    feed_tx: Sender<Feed>,
    feed_rx: Mutex<Receiver<Feed>>,
}

pub struct TestNode {
    name: String,
    usage_page: u16,
    usage_id: u16,
    reports: [Vec<TestReport>; 3],
    sent: Mutex<Vec<(KernelHandle, Vec<ItemData>)>>,
}

/* Pushes scripted kernel reads into one report's reader. */
#[derive(Clone)]
pub struct TestFeeder {
    tx: Sender<Feed>,
}

impl TestFeeder {
    pub fn deltas(&self, items: &[ItemData]) {
        let _ = self.tx.send(Feed::Deltas(items.to_vec()));
    }

    /* Make the pending and all further reads fail with device-not-ready. */
    pub fn gone(&self) {
        let _ = self.tx.send(Feed::Gone);
    }
}

impl TestNode {
    pub fn from_spec(spec: TestDeviceSpec) -> TestNode {
        let mut reports: [Vec<TestReport>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for report in spec.reports {
            let kind = match report.kind.as_str() {
                "output" => ReportKind::Output,
                "feature" => ReportKind::Feature,
                _ => ReportKind::Input,
            };
            let slot = &mut reports[kind.index()];
            let (feed_tx, feed_rx) = std::sync::mpsc::channel();
            slot.push(TestReport {
                handle: report_handle(kind, slot.len()),
                id: report.id,
                items: report.items,
                feed_tx,
                feed_rx: Mutex::new(feed_rx),
            });
        }

        TestNode {
            name: spec.name,
            usage_page: spec.page,
            usage_id: spec.id,
            reports,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn feeder(&self, kind: ReportKind, index: usize) -> TestFeeder {
        TestFeeder {
            tx: self.reports[kind.index()][index].feed_tx.clone(),
        }
    }

    pub fn report_handle(&self, kind: ReportKind, index: usize) -> KernelHandle {
        self.reports[kind.index()][index].handle
    }

    /* Everything delivered through SEND so far, oldest first. */
    pub fn sent(&self) -> Vec<(KernelHandle, Vec<ItemData>)> {
        lock(&self.sent).clone()
    }

    fn report(&self, handle: KernelHandle) -> Result<&TestReport> {
        self.reports
            .iter()
            .flatten()
            .find(|r| r.handle == handle)
            .ok_or(UisError::BadValue)
    }
}

fn report_handle(kind: ReportKind, index: usize) -> KernelHandle {
    KernelHandle(((kind.index() as u64 + 1) << 32) | index as u64)
}

fn item_handle(report: KernelHandle, index: i32) -> KernelHandle {
    KernelHandle((report.0 << 8) | (index as u64 + 1))
}

impl DeviceNode for TestNode {
    fn device_info(&self) -> Result<NodeDeviceInfo> {
        Ok(NodeDeviceInfo {
            usage_page: self.usage_page,
            usage_id: self.usage_id,
            report_count: [
                self.reports[0].len() as i32,
                self.reports[1].len() as i32,
                self.reports[2].len() as i32,
            ],
            name: 1,
        })
    }

    fn report_info(&self, kind: ReportKind, index: i32) -> Result<NodeReportInfo> {
        let report = usize::try_from(index)
            .ok()
            .and_then(|n| self.reports[kind.index()].get(n))
            .ok_or(UisError::BadValue)?;
        Ok(NodeReportInfo {
            report: report.handle,
            id: report.id,
            item_count: report.items.len() as i32,
        })
    }

    fn item_info(&self, report: KernelHandle, index: i32) -> Result<NodeItemInfo> {
        let owner = self.report(report)?;
        let item = usize::try_from(index)
            .ok()
            .and_then(|n| owner.items.get(n))
            .ok_or(UisError::BadValue)?;
        Ok(NodeItemInfo {
            item: item_handle(report, index),
            usage_page: item.page,
            usage_id: item.id,
            is_relative: item.relative,
        })
    }

    fn string_length(&self, id: u32) -> Result<(usize, u32)> {
        if id != 1 {
            return Err(UisError::BadValue);
        }
        Ok((self.name.len(), ENCODING_UTF8))
    }

    fn string_fetch(&self, id: u32, buf: &mut [u8]) -> Result<(usize, u32)> {
        if id != 1 || buf.len() < self.name.len() {
            return Err(UisError::BadValue);
        }
        buf[..self.name.len()].copy_from_slice(self.name.as_bytes());
        Ok((self.name.len(), ENCODING_UTF8))
    }

    fn read(&self, data: &mut ReportDataBuf) -> Result<ReadOutcome> {
        let report = self.report(data.report())?;
        let feed = {
            let rx = lock(&report.feed_rx);
            rx.recv()
        };
        match feed {
            Ok(Feed::Deltas(items)) => {
                data.set_items(&items);
                Ok(ReadOutcome::Data)
            }
            Ok(Feed::Release) => Ok(ReadOutcome::Released),
            /* A dropped feeder behaves like an unplugged device. */
            Ok(Feed::Gone) | Err(_) => Err(UisError::DeviceGone),
        }
    }

    fn send(&self, data: &ReportDataBuf) -> Result<()> {
        self.report(data.report())?;
        lock(&self.sent).push((data.report(), data.items().collect()));
        Ok(())
    }

    fn stop(&self, report: KernelHandle) -> Result<()> {
        self.report(report)?
            .feed_tx
            .send(Feed::Release)
            .map_err(|_| UisError::BadValue)
    }
}

/* ------------------------------------------------------------------ */
/* Seams for tests                                                      */
/* ------------------------------------------------------------------ */

/* An opener serving preloaded synthetic nodes by path. */
pub struct TestOpener {
    nodes: Mutex<HashMap<PathBuf, Arc<TestNode>>>,
}

impl TestOpener {
    #[allow(clippy::new_without_default)]
    pub fn new() -> TestOpener {
        TestOpener {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, path: &Path, node: Arc<TestNode>) {
        lock(&self.nodes).insert(path.to_path_buf(), node);
    }
}

impl NodeOpener for TestOpener {
    fn open(&self, path: &Path) -> Result<Arc<dyn DeviceNode>> {
        lock(&self.nodes)
            .get(path)
            .cloned()
            .map(|node| node as Arc<dyn DeviceNode>)
            .ok_or_else(|| {
                UisError::IoFailed(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no synthetic node at {}", path.display()),
                ))
            })
    }
}

/* A port factory whose delivered events land on a channel, with a kill switch per
 * port number to fake a closed endpoint. */
pub struct PortCapture {
    pub events: Receiver<(i32, EventMessage)>,
    dead: Arc<Mutex<Vec<i32>>>,
}

impl PortCapture {
    pub fn kill_port(&self, port: i32) {
        lock(&self.dead).push(port);
    }
}

struct CapturePort {
    port: i32,
    events: Sender<(i32, EventMessage)>,
    dead: Arc<Mutex<Vec<i32>>>,
}

impl EventPort for CapturePort {
    fn send(&self, event: &EventMessage) -> Result<()> {
        if lock(&self.dead).contains(&self.port) {
            return Err(UisError::EndpointGone);
        }
        self.events
            .send((self.port, event.clone()))
            .map_err(|_| UisError::EndpointGone)
    }
}

pub fn capture_port_factory() -> (PortFactory, PortCapture) {
    let (events_tx, events_rx) = std::sync::mpsc::channel();
    let dead = Arc::new(Mutex::new(Vec::new()));
    let capture = PortCapture {
        events: events_rx,
        dead: Arc::clone(&dead),
    };
    let factory: PortFactory = Box::new(move |_team, port, _token| {
        Box::new(CapturePort {
            port,
            events: events_tx.clone(),
            dead: Arc::clone(&dead),
        })
    });
    (factory, capture)
}
