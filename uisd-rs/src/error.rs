/* Shared uisd error definitions: UisError carries the service-level failure taxonomy that
 * maps one-to-one onto the control-channel error codes. */
use thiserror::Error;

/* Errors that may occur in uisd-rs. */
#[derive(Debug, Error)]
pub enum UisError {
    #[error("I/O failure: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("Device is gone")]
    DeviceGone,

    #[error("Bad value: no such device, report, item or subscription")]
    BadValue,

    #[error("Remote endpoint is gone")]
    EndpointGone,

    #[error("Out of resources")]
    NoResource,

    #[error("Invalid operation")]
    InvalidOp,
}

pub type Result<T> = std::result::Result<T, UisError>;
