/* The service core: the ordered device registry with its rolling id allocator, and the
 * request dispatch for every control opcode. All registry mutations arrive on the single
 * dispatcher task; reader threads only ever enqueue removal requests. Replies are built
 * after the registry lock is released, and a device is always dropped outside the lock
 * so reader teardown cannot deadlock against an in-flight delivery. */
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::device::UisDevice;
use crate::error::{Result, UisError};
use crate::node::{DeviceNode, NodeOpener};
use crate::proto::{Reply, Request};
use crate::report::ReaderContext;
use crate::server::ServiceMessage;
use crate::sync::lock;
use crate::target::{PortFactory, TargetRegistry};
use crate::wire::ReportKind;

pub type DeviceId = i32;

/* Device ids range from 1 to MAX_DEVICES. */
pub const MAX_DEVICES: DeviceId = 1000;

struct DeviceMapState {
    map: BTreeMap<DeviceId, Arc<UisDevice>>,
    next_id: DeviceId,
}

pub struct UisManager {
    devices: Mutex<DeviceMapState>,
    targets: Arc<TargetRegistry>,
    opener: Box<dyn NodeOpener>,
    queue: UnboundedSender<ServiceMessage>,
    #[cfg(any(test, feature = "dev-hooks"))]
    test_devices: Mutex<Vec<DeviceId>>,
}

impl UisManager {
    pub fn new(
        opener: Box<dyn NodeOpener>,
        port_factory: PortFactory,
        queue: UnboundedSender<ServiceMessage>,
    ) -> Arc<UisManager> {
        Arc::new(UisManager {
            devices: Mutex::new(DeviceMapState {
                map: BTreeMap::new(),
                next_id: 1,
            }),
            targets: Arc::new(TargetRegistry::new(port_factory)),
            opener,
            queue,
            #[cfg(any(test, feature = "dev-hooks"))]
            test_devices: Mutex::new(Vec::new()),
        })
    }

    pub fn targets(&self) -> &Arc<TargetRegistry> {
        &self.targets
    }

    pub fn count_devices(&self) -> i32 {
        lock(&self.devices).map.len() as i32
    }

    /* First match in id order, like the name lookup the dispatcher does. */
    pub fn find_by_path(&self, path: &Path) -> Option<DeviceId> {
        lock(&self.devices)
            .map
            .values()
            .find(|d| d.has_path(path))
            .map(|d| d.id())
    }

    /* Idempotent: a path that is already registered is silently ignored. */
    pub fn add_device(&self, path: &Path) -> Option<DeviceId> {
        debug!("Please create {:?}", path);

        if self.find_by_path(path).is_some() {
            /* Already have this device, thank you. */
            return None;
        }

        let node = match self.opener.open(path) {
            Ok(node) => node,
            Err(err) => {
                warn!("Failed to open {:?}: {}", path, err);
                return None;
            }
        };

        self.insert_node(path, node)
    }

    /* Register an opened node under the next free id. The device tree is built outside
     * the registry lock; only the id reservation and the final insert hold it. */
    fn insert_node(&self, path: &Path, node: Arc<dyn DeviceNode>) -> Option<DeviceId> {
        let id = {
            let mut state = lock(&self.devices);
            if state.map.values().any(|d| d.has_path(path)) {
                return None;
            }
            match allocate_id(&mut state) {
                Some(id) => id,
                None => {
                    warn!("Device id space exhausted, ignoring {:?}", path);
                    return None;
                }
            }
        };

        let ctx = ReaderContext {
            node: Arc::clone(&node),
            targets: Arc::clone(&self.targets),
            device: id,
            queue: self.queue.clone(),
        };
        let device = match UisDevice::open(id, path, node, ctx) {
            Ok(device) => device,
            Err(err) => {
                warn!("Device at {:?} failed to initialize: {}", path, err);
                return None;
            }
        };

        let mut state = lock(&self.devices);
        if state.map.contains_key(&id) || state.map.values().any(|d| d.has_path(path)) {
            /* Lost against a concurrent insert; the fresh device is torn down after
             * the guard goes out of scope. */
            return None;
        }
        state.map.insert(id, device);
        Some(id)
    }

    /* Take the device out of the map under the lock, tear it down after. */
    pub fn remove_device(&self, id: DeviceId) {
        let removed = lock(&self.devices).map.remove(&id);
        match removed {
            Some(device) => info!("Removed device {} at {:?}", id, device.path()),
            None => debug!("Remove for unknown device {}", id),
        }
    }

    /* Drain and destroy every device. */
    pub fn shutdown(&self) {
        let devices = std::mem::take(&mut lock(&self.devices).map);
        info!("Shutting down, destroying {} devices", devices.len());
        drop(devices);
    }

    fn device(&self, id: DeviceId) -> Result<Arc<UisDevice>> {
        lock(&self.devices)
            .map
            .get(&id)
            .cloned()
            .ok_or(UisError::BadValue)
    }

    /* Live devices in ascending id order. */
    fn snapshot(&self) -> Vec<Arc<UisDevice>> {
        lock(&self.devices).map.values().cloned().collect()
    }

    pub fn handle_request(&self, request: Request) -> Reply {
        match self.dispatch(request) {
            Ok(reply) => reply,
            Err(err) => Reply::error(&err),
        }
    }

    fn dispatch(&self, request: Request) -> Result<Reply> {
        match request {
            Request::NextDevice { device } => {
                let state = lock(&self.devices);
                let next = state
                    .map
                    .range((Bound::Excluded(device), Bound::Unbounded))
                    .next()
                    .map(|(id, _)| *id)
                    .ok_or(UisError::BadValue)?;
                Ok(Reply::NextDevice { next })
            }

            Request::FindDevice { name } => {
                /* Name lookups may fault in device strings; walk a snapshot so no
                 * ioctl runs under the registry lock. */
                for device in self.snapshot() {
                    if device.has_name(&name) {
                        return Ok(Reply::FoundDevice {
                            device: device.id(),
                        });
                    }
                }
                Err(UisError::BadValue)
            }

            Request::CountDevices => Ok(Reply::DeviceCount {
                devices: self.count_devices(),
            }),

            Request::GetDevice { device } => {
                let device = self.device(device)?;
                Ok(Reply::DeviceInfo {
                    name: device.name().unwrap_or_default(),
                    path: device.path().to_string_lossy().into_owned(),
                    page: device.usage_page(),
                    id: device.usage_id(),
                    input_reports: device.count_reports(ReportKind::Input),
                    output_reports: device.count_reports(ReportKind::Output),
                    feature_reports: device.count_reports(ReportKind::Feature),
                })
            }

            Request::GetReport {
                device,
                report,
                kind,
            } => {
                let device = self.device(device)?;
                let (resolved, index) = linearize(&device, kind, report)?;
                let report = device.report_at(resolved, index).ok_or(UisError::BadValue)?;
                Ok(Reply::ReportInfo {
                    items: report.count_items(),
                    kind: resolved.mask(),
                })
            }

            Request::SendReport {
                device,
                report,
                kind,
                data,
            } => {
                let kind = single_kind(kind)?;
                if kind == ReportKind::Input {
                    return Err(UisError::BadValue);
                }
                let device = self.device(device)?;
                let report = device
                    .report_at(kind, report)
                    .ok_or(UisError::BadValue)?
                    .clone();
                report.send_items(&**device.node(), &data)?;
                Ok(Reply::Done)
            }

            Request::GetItem {
                device,
                report,
                kind,
                item,
            } => {
                let device = self.device(device)?;
                let kind = single_kind(kind)?;
                let report = device.report_at(kind, report).ok_or(UisError::BadValue)?;
                let item = report.item_at(item).ok_or(UisError::BadValue)?;
                Ok(Reply::ItemInfo {
                    page: item.usage_page(),
                    id: item.usage_id(),
                    relative: item.is_relative(),
                    value: item.value(),
                })
            }

            Request::FindItem {
                device,
                kind,
                page,
                id,
            } => {
                let device = self.device(device)?;
                for scan in ReportKind::ALL {
                    if kind & scan.mask() == 0 {
                        continue;
                    }
                    for rn in 0..device.count_reports(scan) {
                        let Some(report) = device.report_at(scan, rn) else {
                            continue;
                        };
                        for (inx, item) in report.items().iter().enumerate() {
                            if item.usage_page() == page && item.usage_id() == id {
                                return Ok(Reply::FoundItem {
                                    report: rn,
                                    item: inx as i32,
                                    page: item.usage_page(),
                                    id: item.usage_id(),
                                    relative: item.is_relative(),
                                    value: item.value(),
                                });
                            }
                        }
                    }
                }
                Err(UisError::BadValue)
            }

            Request::PollItemValue {
                device,
                report,
                kind,
                item,
            } => {
                let device = self.device(device)?;
                let kind = single_kind(kind)?;
                let report = device.report_at(kind, report).ok_or(UisError::BadValue)?;
                let item = report.item_at(item).ok_or(UisError::BadValue)?;
                Ok(Reply::Value {
                    value: item.value(),
                })
            }

            Request::SetItemTarget {
                device,
                report,
                kind,
                item,
                target,
                team,
                port,
                token,
                cookie,
            } => {
                let kind = single_kind(kind)?;
                let device = self.device(device)?;
                let report = device
                    .report_at(kind, report)
                    .ok_or(UisError::BadValue)?
                    .clone();
                let item = report.item_at(item).ok_or(UisError::BadValue)?;
                let handle = item.set_target(target, team, port, token, cookie, &self.targets)?;
                Ok(Reply::Target { target: handle })
            }

            Request::LoadTestDevice { spec } => self.load_test_device(&spec),
            Request::ResetTestDevices => self.reset_test_devices(),
        }
    }

    #[cfg(any(test, feature = "dev-hooks"))]
    fn load_test_device(&self, spec: &str) -> Result<Reply> {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT_TEST: AtomicU32 = AtomicU32::new(0);

        let spec = crate::test_node::parse_spec(spec).map_err(|_| UisError::BadValue)?;
        let node: Arc<dyn DeviceNode> = Arc::new(crate::test_node::TestNode::from_spec(spec));
        let path = std::path::PathBuf::from(format!(
            "/dev/input/hid/.test/{}",
            NEXT_TEST.fetch_add(1, Ordering::Relaxed)
        ));

        let id = self.insert_node(&path, node).ok_or(UisError::NoResource)?;
        lock(&self.test_devices).push(id);
        info!("Loaded synthetic device {} at {:?}", id, path);
        Ok(Reply::FoundDevice { device: id })
    }

    #[cfg(not(any(test, feature = "dev-hooks")))]
    fn load_test_device(&self, _spec: &str) -> Result<Reply> {
        Err(UisError::InvalidOp)
    }

    #[cfg(any(test, feature = "dev-hooks"))]
    fn reset_test_devices(&self) -> Result<Reply> {
        let ids = std::mem::take(&mut *lock(&self.test_devices));
        for id in ids {
            self.remove_device(id);
        }
        Ok(Reply::Done)
    }

    #[cfg(not(any(test, feature = "dev-hooks")))]
    fn reset_test_devices(&self) -> Result<Reply> {
        Err(UisError::InvalidOp)
    }
}

/* Find the next free id, advancing the rolling counter and scanning at most once
 * around the ring. Fails when every id is taken. */
fn allocate_id(state: &mut DeviceMapState) -> Option<DeviceId> {
    if state.map.len() >= MAX_DEVICES as usize {
        return None;
    }
    for _ in 0..MAX_DEVICES {
        let id = state.next_id;
        state.next_id = if id >= MAX_DEVICES { 1 } else { id + 1 };
        if !state.map.contains_key(&id) {
            return Some(id);
        }
    }
    None
}

/* Exactly one type bit must be set for opcodes that address a single report. */
fn single_kind(mask: u8) -> Result<ReportKind> {
    ReportKind::from_mask(mask).ok_or(UisError::BadValue)
}

/* Resolve a linear index across the types selected in `mask`, walking input, then
 * output, then feature. */
fn linearize(device: &UisDevice, mask: u8, index: i32) -> Result<(ReportKind, i32)> {
    if index < 0 {
        return Err(UisError::BadValue);
    }
    let mut index = index;
    for kind in ReportKind::ALL {
        if mask & kind.mask() == 0 {
            continue;
        }
        let count = device.count_reports(kind);
        if index < count {
            return Ok((kind, index));
        }
        index -= count;
    }
    Err(UisError::BadValue)
}
