/* uisctl client library: long-lived handles onto the uisd device tree. Every call is
 * one synchronous control RPC; events arrive on a separately bound EventPort. */
pub mod client;

pub use client::{Event, EventPort, UisClient, UisDevice, UisItem, UisReport, UisRoster};
