/* Control-channel message schema shared by the service and the client library. Requests
 * and replies travel as newline-delimited JSON over the control socket; events travel as
 * single JSON datagrams to the client's port socket. Field names are part of the wire
 * contract and must not change. */
use std::io::{self, BufRead, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::UisError;
use crate::wire::ItemData;

/* Token value meaning "no handler"; clears a subscription. */
pub const NULL_TOKEN: i32 = -1;

/* Report-type bitmask at the control-channel boundary. Combinations are only meaningful
 * for `get-report`, which linearizes across the selected types. */
pub const TYPE_INPUT: u8 = 1;
pub const TYPE_OUTPUT: u8 = 2;
pub const TYPE_FEATURE: u8 = 4;

fn neg_one() -> i32 {
    -1
}

fn null_token() -> i32 {
    NULL_TOKEN
}

/* One request per client call, tagged by opcode. */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "opcode", rename_all = "kebab-case")]
pub enum Request {
    /* `device` is the iteration cursor; 0 asks for the first device. */
    NextDevice { device: i32 },

    FindDevice { name: String },

    CountDevices,

    GetDevice { device: i32 },

    GetReport {
        device: i32,
        report: i32,
        #[serde(rename = "type")]
        kind: u8,
    },

    SendReport {
        device: i32,
        report: i32,
        #[serde(rename = "type")]
        kind: u8,
        data: Vec<ItemData>,
    },

    GetItem {
        device: i32,
        report: i32,
        #[serde(rename = "type")]
        kind: u8,
        item: i32,
    },

    FindItem {
        device: i32,
        #[serde(rename = "type")]
        kind: u8,
        page: u16,
        id: u16,
    },

    PollItemValue {
        device: i32,
        report: i32,
        #[serde(rename = "type")]
        kind: u8,
        item: i32,
    },

    SetItemTarget {
        device: i32,
        report: i32,
        #[serde(rename = "type")]
        kind: u8,
        item: i32,
        /* Prior subscription handle, 0 for none. */
        #[serde(default)]
        target: u64,
        #[serde(default = "neg_one")]
        team: i32,
        #[serde(default = "neg_one")]
        port: i32,
        #[serde(default = "null_token")]
        token: i32,
        #[serde(default)]
        cookie: u64,
    },

    /* Developer hooks; rejected with invalid-op unless the daemon was built with the
     * dev-hooks feature. */
    LoadTestDevice { spec: String },
    ResetTestDevices,
}

/* Wire error codes, mirroring the service error taxonomy. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    IoFailed,
    DeviceGone,
    BadValue,
    EndpointGone,
    NoResource,
    InvalidOp,
}

impl From<&UisError> for ErrorCode {
    fn from(err: &UisError) -> ErrorCode {
        match err {
            UisError::IoFailed(_) => ErrorCode::IoFailed,
            UisError::DeviceGone => ErrorCode::DeviceGone,
            UisError::BadValue => ErrorCode::BadValue,
            UisError::EndpointGone => ErrorCode::EndpointGone,
            UisError::NoResource => ErrorCode::NoResource,
            UisError::InvalidOp => ErrorCode::InvalidOp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum Reply {
    Error { error: ErrorCode },

    NextDevice { next: i32 },

    FoundDevice { device: i32 },

    DeviceCount { devices: i32 },

    DeviceInfo {
        name: String,
        path: String,
        page: u16,
        id: u16,
        #[serde(rename = "input reports")]
        input_reports: i32,
        #[serde(rename = "output reports")]
        output_reports: i32,
        #[serde(rename = "feature reports")]
        feature_reports: i32,
    },

    ReportInfo {
        items: i32,
        /* The resolved single-type mask after linearization. */
        #[serde(rename = "type")]
        kind: u8,
    },

    ItemInfo {
        page: u16,
        id: u16,
        relative: bool,
        value: f32,
    },

    FoundItem {
        report: i32,
        item: i32,
        page: u16,
        id: u16,
        relative: bool,
        value: f32,
    },

    Value { value: f32 },

    Target { target: u64 },

    Done,
}

impl Reply {
    pub fn error(err: &UisError) -> Reply {
        Reply::Error { error: err.into() }
    }
}

/* One value-change event, delivered as a datagram to the subscriber's port socket.
 * `token` routes within the client process; `cookie` is echoed verbatim. */
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "what", rename_all = "kebab-case")]
pub enum EventMessage {
    ItemEvent { token: i32, cookie: u64, value: f32 },
}

/* Line framing for the control channel. */

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let body = serde_json::to_string(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_all(body.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/* Returns None on a clean end of stream. */
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Some(message))
}
