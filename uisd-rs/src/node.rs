/* Kernel pseudo-file access. `DeviceNode` seals the fixed ioctl contract each HID
 * application collection supports; `DevNode` is the production implementation over an
 * open file descriptor. `NodeOpener` is the construction seam that lets tests swap in
 * synthetic nodes. */
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use nix::libc;
use tracing::debug;

use crate::error::{Result, UisError};
use crate::wire::{
    self, DeviceInfoRaw, ItemInfoRaw, KernelHandle, ReportDataBuf, ReportInfoRaw, ReportKind,
    StringInfoRaw,
};

/* Decoded UIS_DEVICE_INFO. */
#[derive(Debug, Clone, Copy)]
pub struct NodeDeviceInfo {
    pub usage_page: u16,
    pub usage_id: u16,
    pub report_count: [i32; 3],
    pub name: u32,
}

/* Decoded UIS_REPORT_INFO. */
#[derive(Debug, Clone, Copy)]
pub struct NodeReportInfo {
    pub report: KernelHandle,
    pub id: u8,
    pub item_count: i32,
}

/* Decoded UIS_ITEM_INFO. */
#[derive(Debug, Clone, Copy)]
pub struct NodeItemInfo {
    pub item: KernelHandle,
    pub usage_page: u16,
    pub usage_id: u16,
    pub is_relative: bool,
}

/* How a blocking READ came back: with data, or released by a STOP. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data,
    Released,
}

/* The ioctl set of one HID application collection. READ is the only blocking call;
 * STOP releases a pending READ on the same report. */
pub trait DeviceNode: Send + Sync {
    fn device_info(&self) -> Result<NodeDeviceInfo>;

    fn report_info(&self, kind: ReportKind, index: i32) -> Result<NodeReportInfo>;

    fn item_info(&self, report: KernelHandle, index: i32) -> Result<NodeItemInfo>;

    /* First phase of the string fetch: needed byte length and encoding tag. */
    fn string_length(&self, id: u32) -> Result<(usize, u32)>;

    /* Second phase: fill `buf` and return the byte length actually used. */
    fn string_fetch(&self, id: u32, buf: &mut [u8]) -> Result<(usize, u32)>;

    /* Blocks until the report identified by `data.report()` produces a delta set, the
     * device disappears (`DeviceGone`), or a STOP releases the read. */
    fn read(&self, data: &mut ReportDataBuf) -> Result<ReadOutcome>;

    /* Deliver an output or feature report. */
    fn send(&self, data: &ReportDataBuf) -> Result<()>;

    /* Release the READ pending on `report`. */
    fn stop(&self, report: KernelHandle) -> Result<()>;
}

/* Construction seam for device nodes. */
pub trait NodeOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<std::sync::Arc<dyn DeviceNode>>;
}

/* Opens real pseudo-files read-write. */
pub struct DevOpener;

impl NodeOpener for DevOpener {
    fn open(&self, path: &Path) -> Result<std::sync::Arc<dyn DeviceNode>> {
        Ok(std::sync::Arc::new(DevNode::open(path)?))
    }
}

/* A real device pseudo-file. All hardware access goes through this struct so the rest
 * of the service never touches raw file descriptors. */
pub struct DevNode {
    file: File,
    path: PathBuf,
}

impl DevNode {
    pub fn open(path: &Path) -> Result<DevNode> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        debug!("Opened device node {:?}", path);
        Ok(DevNode {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /* Issue one opcode with a caller-provided struct. ENODEV means the device was
     * unplugged; ECANCELED is the released-READ result and handled by `read` alone. */
    fn ioctl(&self, op: libc::c_ulong, arg: *mut libc::c_void) -> Result<()> {
        /* SAFETY: `self.file` keeps the descriptor open for the duration of the call,
         * and `arg` points at a live fixed-layout struct (or report-data buffer) owned
         * by the caller and sized for the opcode. */
        let res = unsafe { libc::ioctl(self.file.as_raw_fd(), op, arg) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENODEV) => UisError::DeviceGone,
                _ => UisError::IoFailed(err),
            });
        }
        Ok(())
    }
}

impl DeviceNode for DevNode {
    fn device_info(&self) -> Result<NodeDeviceInfo> {
        let mut info = DeviceInfoRaw::default();
        self.ioctl(wire::UIS_DEVICE_INFO, ptr::from_mut(&mut info).cast())?;
        Ok(NodeDeviceInfo {
            usage_page: info.usage.page,
            usage_id: info.usage.id,
            report_count: info.report_count,
            name: info.name,
        })
    }

    fn report_info(&self, kind: ReportKind, index: i32) -> Result<NodeReportInfo> {
        let mut info = ReportInfoRaw {
            kind: kind.index() as u8,
            index,
            ..Default::default()
        };
        self.ioctl(wire::UIS_REPORT_INFO, ptr::from_mut(&mut info).cast())?;
        Ok(NodeReportInfo {
            report: KernelHandle(info.report),
            id: info.id,
            item_count: info.item_count,
        })
    }

    fn item_info(&self, report: KernelHandle, index: i32) -> Result<NodeItemInfo> {
        let mut info = ItemInfoRaw {
            report: report.0,
            index,
            ..Default::default()
        };
        self.ioctl(wire::UIS_ITEM_INFO, ptr::from_mut(&mut info).cast())?;
        Ok(NodeItemInfo {
            item: KernelHandle(info.item),
            usage_page: info.usage.page,
            usage_id: info.usage.id,
            is_relative: info.is_relative != 0,
        })
    }

    fn string_length(&self, id: u32) -> Result<(usize, u32)> {
        let mut info = StringInfoRaw {
            id,
            length: 0,
            string: ptr::null_mut(),
            encoding: 0,
        };
        self.ioctl(wire::UIS_STRING_INFO, ptr::from_mut(&mut info).cast())?;
        if info.length < 0 {
            return Err(UisError::BadValue);
        }
        Ok((info.length as usize, info.encoding))
    }

    fn string_fetch(&self, id: u32, buf: &mut [u8]) -> Result<(usize, u32)> {
        let mut info = StringInfoRaw {
            id,
            length: buf.len() as i32,
            string: buf.as_mut_ptr(),
            encoding: 0,
        };
        self.ioctl(wire::UIS_STRING_INFO, ptr::from_mut(&mut info).cast())?;
        if info.length < 0 || info.length as usize > buf.len() {
            return Err(UisError::BadValue);
        }
        Ok((info.length as usize, info.encoding))
    }

    fn read(&self, data: &mut ReportDataBuf) -> Result<ReadOutcome> {
        match self.ioctl(wire::UIS_READ, data.as_mut_ptr().cast()) {
            Ok(()) => Ok(ReadOutcome::Data),
            Err(UisError::IoFailed(err)) if err.raw_os_error() == Some(libc::ECANCELED) => {
                Ok(ReadOutcome::Released)
            }
            Err(err) => Err(err),
        }
    }

    fn send(&self, data: &ReportDataBuf) -> Result<()> {
        self.ioctl(wire::UIS_SEND, data.as_ptr().cast_mut().cast())
    }

    fn stop(&self, report: KernelHandle) -> Result<()> {
        let mut handle = report.0;
        self.ioctl(wire::UIS_STOP, ptr::from_mut(&mut handle).cast())
    }
}
