/* One kernel report. Owns its ordered item array. Input reports run a dedicated reader
 * thread that blocks in the kernel READ; output and feature reports expose a send path.
 * Teardown protocol: clear the active flag, issue STOP, and join only if STOP went
 * through; an unstoppable thread is abandoned and dies with the device. */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::error::{Result, UisError};
use crate::item::ReportItem;
use crate::manager::DeviceId;
use crate::node::{DeviceNode, ReadOutcome};
use crate::server::ServiceMessage;
use crate::sync::lock;
use crate::target::TargetRegistry;
use crate::wire::{ItemData, KernelHandle, ReportDataBuf, ReportKind};

/* Everything a reader thread needs besides its report. */
#[derive(Clone)]
pub struct ReaderContext {
    pub node: Arc<dyn DeviceNode>,
    pub targets: Arc<TargetRegistry>,
    pub device: DeviceId,
    pub queue: UnboundedSender<ServiceMessage>,
}

pub struct UisReport {
    kind: ReportKind,
    kernel_report: KernelHandle,
    id: u8,
    items: Vec<ReportItem>,
    active: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl UisReport {
    pub fn new(node: &dyn DeviceNode, kind: ReportKind, index: i32) -> Result<UisReport> {
        let info = node.report_info(kind, index)?;

        let mut items = Vec::with_capacity(info.item_count.max(0) as usize);
        for n in 0..info.item_count {
            match ReportItem::new(node, info.report, n) {
                Ok(item) => items.push(item),
                Err(err) => {
                    warn!("Item {} of report id {} failed: {}", n, info.id, err);
                    break;
                }
            }
        }

        Ok(UisReport {
            kind,
            kernel_report: info.report,
            id: info.id,
            items,
            active: AtomicBool::new(false),
            reader: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> ReportKind {
        self.kind
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn kernel_report(&self) -> KernelHandle {
        self.kernel_report
    }

    pub fn count_items(&self) -> i32 {
        self.items.len() as i32
    }

    pub fn item_at(&self, index: i32) -> Option<&ReportItem> {
        usize::try_from(index).ok().and_then(|n| self.items.get(n))
    }

    pub fn items(&self) -> &[ReportItem] {
        &self.items
    }

    /* Spawn the reader thread. Only input reports stream; calling this on any other
     * kind is a programming error the caller avoids by construction. */
    pub fn spawn_reader(self: &Arc<UisReport>, ctx: ReaderContext) -> Result<()> {
        self.active.store(true, Ordering::Release);

        let report = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("uis report {} reader", self.id))
            .spawn(move || reader_loop(report, ctx))
            .map_err(|err| {
                self.active.store(false, Ordering::Release);
                UisError::IoFailed(err)
            })?;

        *lock(&self.reader) = Some(handle);
        Ok(())
    }

    pub fn reader_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /* Stop the reader thread if it is still running. The flag goes down first so the
     * released READ falls out of the loop; join only when STOP succeeded, since a
     * failed STOP leaves the thread stuck in the kernel. */
    pub fn stop_reader(&self, node: &dyn DeviceNode) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        if node.stop(self.kernel_report).is_ok() {
            if let Some(handle) = lock(&self.reader).take() {
                debug!("Waiting for reader of report id {} to quit", self.id);
                let _ = handle.join();
            }
        } else {
            warn!("STOP failed for report id {}, abandoning its reader", self.id);
        }
    }

    /* Apply one decoded report in kernel-provided order. Out-of-range indexes are
     * skipped; the kernel numbering is not trusted. */
    pub fn dispatch(&self, data: &ReportDataBuf, targets: &TargetRegistry) {
        for delta in data.items() {
            if let Some(item) = self.item_at(delta.index) {
                item.set_value(delta.value, targets);
            }
        }
    }

    /* Deliver an output or feature report built from the given records. */
    pub fn send_items(&self, node: &dyn DeviceNode, items: &[ItemData]) -> Result<()> {
        let data = ReportDataBuf::for_items(self.kernel_report, items);
        node.send(&data)
    }
}

fn reader_loop(report: Arc<UisReport>, ctx: ReaderContext) {
    debug!("Entering reader thread for report id {}", report.id);

    /* Sized once for the worst case of every item changing in one report. */
    let mut data = ReportDataBuf::with_capacity(report.items.len());

    while report.active.load(Ordering::Acquire) {
        data.set_report(report.kernel_report);
        match ctx.node.read(&mut data) {
            Ok(ReadOutcome::Data) => report.dispatch(&data, &ctx.targets),
            Ok(ReadOutcome::Released) => {
                /* A STOP got us here; the active flag decides whether to go on. */
            }
            Err(UisError::DeviceGone) => {
                /* The device owning this thread must not be torn down from inside it;
                 * hand the removal to the dispatcher and get out. */
                report.active.store(false, Ordering::Release);
                let _ = ctx.queue.send(ServiceMessage::DeviceDied { device: ctx.device });
                debug!("Leaving reader thread for report id {} (device gone)", report.id);
                return;
            }
            Err(err) => {
                warn!("Read failed for report id {}: {}", report.id, err);
                report.active.store(false, Ordering::Release);
                return;
            }
        }
    }

    debug!("Leaving reader thread for report id {}", report.id);
}
