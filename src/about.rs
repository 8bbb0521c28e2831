//! Identity details reported by the `/about` endpoint.

use std::fs;

use sha2::{Digest, Sha256};

use crate::APP_NAME;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Stable identifier for this machine.
///
/// The raw machine id never leaves the host; it is hashed together with
/// the application name before being exposed. Falls back to
/// `not-available` on hosts without a readable machine id.
pub fn device_id() -> String {
    match raw_machine_id() {
        Some(raw) => {
            let mut hasher = Sha256::new();
            hasher.update(APP_NAME.as_bytes());
            hasher.update(b":");
            hasher.update(raw.as_bytes());
            hex::encode(hasher.finalize())
        }
        None => "not-available".to_string(),
    }
}

fn raw_machine_id() -> Option<String> {
    for path in MACHINE_ID_PATHS {
        if let Ok(contents) = fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn os() -> &'static str {
    std::env::consts::OS
}
