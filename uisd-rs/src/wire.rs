/* Kernel wire contract: the fixed-layout structs and opcode numbers understood by the
 * HID pseudo-files, plus the variable-length report-data buffer used by READ and SEND. */
use nix::libc;
use serde::{Deserialize, Serialize};

/* Opcodes start past the platform device op-code range. */
const UIS_OP_BASE: libc::c_ulong = 10_000;

pub const UIS_DEVICE_INFO: libc::c_ulong = UIS_OP_BASE;
pub const UIS_REPORT_INFO: libc::c_ulong = UIS_OP_BASE + 1;
pub const UIS_ITEM_INFO: libc::c_ulong = UIS_OP_BASE + 2;
pub const UIS_STRING_INFO: libc::c_ulong = UIS_OP_BASE + 3;
pub const UIS_READ: libc::c_ulong = UIS_OP_BASE + 4;
pub const UIS_SEND: libc::c_ulong = UIS_OP_BASE + 5;
pub const UIS_STOP: libc::c_ulong = UIS_OP_BASE + 6;

/* String encoding tags returned by UIS_STRING_INFO. */
pub const ENCODING_UTF8: u32 = 0;
pub const ENCODING_LATIN1: u32 = 1;
pub const ENCODING_UTF16LE: u32 = 2;

/* Opaque kernel-side object reference (a report or an item). Never dereferenced in
 * user space; only handed back through READ, SEND and STOP. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KernelHandle(pub u64);

/* Report class, zero-based as the kernel counts them. The control channel uses a
 * bitmask encoding instead; see `ReportKind::mask`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Input,
    Output,
    Feature,
}

impl ReportKind {
    pub const ALL: [ReportKind; 3] = [ReportKind::Input, ReportKind::Output, ReportKind::Feature];

    pub fn index(self) -> usize {
        match self {
            ReportKind::Input => 0,
            ReportKind::Output => 1,
            ReportKind::Feature => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<ReportKind> {
        match index {
            0 => Some(ReportKind::Input),
            1 => Some(ReportKind::Output),
            2 => Some(ReportKind::Feature),
            _ => None,
        }
    }

    /* The control-channel bitmask encoding: INPUT=1, OUTPUT=2, FEATURE=4. */
    pub fn mask(self) -> u8 {
        1 << self.index()
    }

    /* Accepts only a mask with exactly one bit set. */
    pub fn from_mask(mask: u8) -> Option<ReportKind> {
        match mask {
            1 => Some(ReportKind::Input),
            2 => Some(ReportKind::Output),
            4 => Some(ReportKind::Feature),
            _ => None,
        }
    }
}

/* HID usage as the kernel reports it: id in the low half, page in the high half. */
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageRaw {
    pub id: u16,
    pub page: u16,
}

/* UIS_DEVICE_INFO: filled by the kernel. */
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceInfoRaw {
    pub usage: UsageRaw,
    pub report_count: [i32; 3],
    pub name: u32,
}

/* UIS_REPORT_INFO: `kind` and `index` are written by the caller, the rest by the kernel. */
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportInfoRaw {
    pub kind: u8,
    pub index: i32,
    pub report: u64,
    pub id: u8,
    pub item_count: i32,
}

/* UIS_ITEM_INFO: `report` and `index` are written by the caller, the rest by the kernel. */
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemInfoRaw {
    pub report: u64,
    pub index: i32,
    pub item: u64,
    pub usage: UsageRaw,
    pub is_relative: u8,
}

/* UIS_STRING_INFO, used in two phases: with `string` null the kernel fills `length` and
 * `encoding`; with a buffer of that length it fills the bytes. */
#[repr(C)]
#[derive(Debug)]
pub struct StringInfoRaw {
    pub id: u32,
    pub length: i32,
    pub string: *mut u8,
    pub encoding: u32,
}

/* One value change within a report. Also the record type of the `data` array in the
 * `send-report` control message. */
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ItemData {
    pub index: i32,
    pub value: f32,
}

/* Byte layout of the report-data block exchanged with READ and SEND:
 * a u64 report handle, an i32 item count, padding to 16, then 8-byte
 * (i32 index, f32 value) records. */
pub const REPORT_DATA_HEADER: usize = 16;
pub const ITEM_DATA_SIZE: usize = 8;

const REPORT_OFFSET: usize = 0;
const COUNT_OFFSET: usize = 8;

/* A preallocated report-data buffer. Reader threads size one per report and reuse it
 * for every READ; SEND builds one per outbound report. */
pub struct ReportDataBuf {
    buf: Vec<u8>,
    capacity: usize,
}

impl ReportDataBuf {
    /* A zeroed buffer with room for `capacity` item records. */
    pub fn with_capacity(capacity: usize) -> ReportDataBuf {
        ReportDataBuf {
            buf: vec![0u8; REPORT_DATA_HEADER + capacity * ITEM_DATA_SIZE],
            capacity,
        }
    }

    /* A buffer ready to SEND the given records. */
    pub fn for_items(report: KernelHandle, items: &[ItemData]) -> ReportDataBuf {
        let mut data = ReportDataBuf::with_capacity(items.len());
        data.set_report(report);
        data.set_items(items);
        data
    }

    pub fn set_report(&mut self, report: KernelHandle) {
        self.buf[REPORT_OFFSET..REPORT_OFFSET + 8].copy_from_slice(&report.0.to_ne_bytes());
    }

    pub fn report(&self) -> KernelHandle {
        KernelHandle(read_u64(&self.buf, REPORT_OFFSET))
    }

    pub fn set_items(&mut self, items: &[ItemData]) {
        let count = items.len().min(self.capacity);
        self.buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&(count as i32).to_ne_bytes());
        for (n, item) in items.iter().take(count).enumerate() {
            let off = REPORT_DATA_HEADER + n * ITEM_DATA_SIZE;
            self.buf[off..off + 4].copy_from_slice(&item.index.to_ne_bytes());
            self.buf[off + 4..off + 8].copy_from_slice(&item.value.to_ne_bytes());
        }
    }

    /* Number of item records present, clamped to what the buffer can actually hold so a
     * corrupt count can never walk past the allocation. */
    pub fn item_count(&self) -> usize {
        let count = read_i32(&self.buf, COUNT_OFFSET);
        if count < 0 {
            return 0;
        }
        (count as usize).min(self.capacity)
    }

    pub fn items(&self) -> impl Iterator<Item = ItemData> + '_ {
        (0..self.item_count()).map(|n| {
            let off = REPORT_DATA_HEADER + n * ITEM_DATA_SIZE;
            ItemData {
                index: read_i32(&self.buf, off),
                value: f32::from_ne_bytes([
                    self.buf[off + 4],
                    self.buf[off + 5],
                    self.buf[off + 6],
                    self.buf[off + 7],
                ]),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.buf.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.buf.as_mut_ptr()
    }
}

fn read_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
        buf[off + 4],
        buf[off + 5],
        buf[off + 6],
        buf[off + 7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_data_round_trip() {
        let items = [
            ItemData { index: 0, value: 0.5 },
            ItemData { index: 3, value: -1.0 },
        ];
        let data = ReportDataBuf::for_items(KernelHandle(0xdead_beef), &items);

        assert_eq!(data.report(), KernelHandle(0xdead_beef));
        assert_eq!(data.item_count(), 2);
        let decoded: Vec<ItemData> = data.items().collect();
        assert_eq!(decoded, items);
    }

    #[test]
    fn test_report_data_sized_once() {
        let data = ReportDataBuf::with_capacity(6);
        assert_eq!(data.len(), REPORT_DATA_HEADER + 6 * ITEM_DATA_SIZE);
        assert_eq!(data.item_count(), 0);
    }

    #[test]
    fn test_item_count_clamped_to_capacity() {
        let mut data = ReportDataBuf::with_capacity(2);
        /* A kernel bug writing an oversized count must not walk off the buffer. */
        data.buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&100i32.to_ne_bytes());
        assert_eq!(data.item_count(), 2);

        data.buf[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&(-4i32).to_ne_bytes());
        assert_eq!(data.item_count(), 0);
    }

    #[test]
    fn test_set_items_truncates_to_capacity() {
        let items = [
            ItemData { index: 0, value: 1.0 },
            ItemData { index: 1, value: 2.0 },
            ItemData { index: 2, value: 3.0 },
        ];
        let mut data = ReportDataBuf::with_capacity(2);
        data.set_items(&items);
        assert_eq!(data.item_count(), 2);
    }

    #[test]
    fn test_kind_mask_round_trip() {
        for kind in ReportKind::ALL {
            assert_eq!(ReportKind::from_mask(kind.mask()), Some(kind));
            assert_eq!(ReportKind::from_index(kind.index()), Some(kind));
        }
        assert_eq!(ReportKind::from_mask(0), None);
        assert_eq!(ReportKind::from_mask(3), None);
        assert_eq!(ReportKind::from_mask(7), None);
    }
}
