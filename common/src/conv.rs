//! Byte-count conversions used in log lines and the transfer manifest

pub const KILO_BYTES: u64 = 1024;
pub const MEGA_BYTES: u64 = KILO_BYTES * 1024;
pub const GIGA_BYTES: u64 = MEGA_BYTES * 1024;

const SUFFIXES: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];

/// Render a byte count with the largest fitting suffix (up to TB).
///
/// Values are truncated to whole units, e.g. 1.5 MB is rendered as "1 MB".
pub fn bytes_to_string(num_bytes: u64) -> String {
    let mut value = num_bytes;
    let mut order = 0;
    while value >= 1024 && order < SUFFIXES.len() - 1 {
        order += 1;
        value /= 1024;
    }
    format!("{} {}", value, SUFFIXES[order])
}

pub fn megabytes_to_string(mega_bytes: u64) -> String {
    bytes_to_string(mega_bytes.saturating_mul(MEGA_BYTES))
}
