/* One HID application collection. Owns the kernel node, its cached name string and the
 * three report arrays. The arrays are immutable after construction; teardown stops
 * every reader thread before the node is dropped and the file closed. */
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::manager::DeviceId;
use crate::node::DeviceNode;
use crate::report::{ReaderContext, UisReport};
use crate::strings::DeviceString;
use crate::wire::ReportKind;

pub struct UisDevice {
    id: DeviceId,
    path: PathBuf,
    node: Arc<dyn DeviceNode>,
    usage_page: u16,
    usage_id: u16,
    name: DeviceString,
    reports: [Vec<Arc<UisReport>>; 3],
}

impl UisDevice {
    /* Build the full device tree from an opened node and start the input readers.
     * A failure on an output or feature report only truncates that array; a failure
     * on an input report invalidates the device. */
    pub fn open(
        id: DeviceId,
        path: &Path,
        node: Arc<dyn DeviceNode>,
        ctx: ReaderContext,
    ) -> Result<Arc<UisDevice>> {
        debug!("Creating device at {:?}", path);

        let info = node.device_info()?;

        let mut reports: [Vec<Arc<UisReport>>; 3] = [Vec::new(), Vec::new(), Vec::new()];
        for kind in ReportKind::ALL {
            let count = info.report_count[kind.index()].max(0);
            for n in 0..count {
                match UisReport::new(&*node, kind, n) {
                    Ok(report) => reports[kind.index()].push(Arc::new(report)),
                    Err(err) if kind == ReportKind::Input => return Err(err),
                    Err(err) => {
                        warn!("Report {:?}/{} at {:?} failed: {}", kind, n, path, err);
                        break;
                    }
                }
            }
        }

        let device = Arc::new(UisDevice {
            id,
            path: path.to_path_buf(),
            node: Arc::clone(&node),
            usage_page: info.usage_page,
            usage_id: info.usage_id,
            name: DeviceString::new(info.name),
            reports,
        });

        for report in &device.reports[ReportKind::Input.index()] {
            report.spawn_reader(ctx.clone())?;
        }

        info!(
            "Device {} at {:?}: usage {:04x}:{:04x}, {}/{}/{} reports",
            id,
            path,
            info.usage_page,
            info.usage_id,
            device.count_reports(ReportKind::Input),
            device.count_reports(ReportKind::Output),
            device.count_reports(ReportKind::Feature),
        );
        Ok(device)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn node(&self) -> &Arc<dyn DeviceNode> {
        &self.node
    }

    pub fn usage_page(&self) -> u16 {
        self.usage_page
    }

    pub fn usage_id(&self) -> u16 {
        self.usage_id
    }

    /* Lazily fetched and cached; may issue string ioctls, so call without holding
     * the registry lock. */
    pub fn name(&self) -> Option<String> {
        self.name.read(&*self.node)
    }

    pub fn has_path(&self, path: &Path) -> bool {
        self.path == path
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name().as_deref() == Some(name)
    }

    pub fn count_reports(&self, kind: ReportKind) -> i32 {
        self.reports[kind.index()].len() as i32
    }

    pub fn report_at(&self, kind: ReportKind, index: i32) -> Option<&Arc<UisReport>> {
        usize::try_from(index)
            .ok()
            .and_then(|n| self.reports[kind.index()].get(n))
    }
}

impl Drop for UisDevice {
    fn drop(&mut self) {
        debug!("Deleting device {} at {:?}", self.id, self.path);
        for kind in ReportKind::ALL {
            for report in &self.reports[kind.index()] {
                report.stop_reader(&*self.node);
            }
        }
        /* The node drops with us, closing the file once any abandoned reader has let
         * go of its reference. */
    }
}
