/* Lazy device-string cache. The kernel does not know the destination length, so every
 * fetch is two-phase: probe for length and encoding, then fill a buffer of that size.
 * The transcoded, trimmed result is cached until device teardown; a failed fetch caches
 * the not-available result and is never retried. */
use std::sync::Mutex;

use tracing::debug;

use crate::node::DeviceNode;
use crate::sync::lock;
use crate::wire::{ENCODING_LATIN1, ENCODING_UTF8, ENCODING_UTF16LE};

pub struct DeviceString {
    id: u32,
    /* Outer None: unresolved. Inner None: resolved as not available. */
    cached: Mutex<Option<Option<String>>>,
}

impl DeviceString {
    pub fn new(id: u32) -> DeviceString {
        DeviceString {
            id,
            cached: Mutex::new(None),
        }
    }

    pub fn read(&self, node: &dyn DeviceNode) -> Option<String> {
        let mut cached = lock(&self.cached);
        if let Some(resolved) = cached.as_ref() {
            return resolved.clone();
        }

        let resolved = self.fetch(node);
        if resolved.is_none() {
            debug!("String {} is not available", self.id);
        }
        *cached = Some(resolved.clone());
        resolved
    }

    fn fetch(&self, node: &dyn DeviceNode) -> Option<String> {
        let (length, _) = node.string_length(self.id).ok()?;
        let mut buf = vec![0u8; length];
        let (used, encoding) = node.string_fetch(self.id, &mut buf).ok()?;

        let text = transcode(&buf[..used], encoding)?;
        let trimmed = text.trim_matches(' ');
        if trimmed.is_empty() {
            return None;
        }
        Some(trimmed.to_string())
    }
}

/* Transcode raw string bytes to UTF-8 according to the kernel's encoding tag. */
fn transcode(bytes: &[u8], encoding: u32) -> Option<String> {
    match encoding {
        ENCODING_UTF8 => String::from_utf8(bytes.to_vec()).ok(),
        ENCODING_LATIN1 => Some(bytes.iter().map(|&b| b as char).collect()),
        ENCODING_UTF16LE => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16(&units).ok()
        }
        _ => None,
    }
}
