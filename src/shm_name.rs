// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared-buffer and request naming.
//
// Buffer names and request ids both carry the creating process id as a
// leading segment: `<pid>_shm_<hex>` / `<pid>_req_<hex>`. The request id's
// pid prefix doubles as the scheduler's process-affinity key.

use uuid::Uuid;

/// FNV-1a 64-bit hash used to shorten over-long POSIX names.
pub fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Convert a 64-bit value to a fixed-width 16-char lowercase hex string.
fn to_hex(val: u64) -> [u8; 16] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; 16];
    let mut v = val;
    for i in (0..16).rev() {
        buf[i] = DIGITS[(v & 0xf) as usize];
        v >>= 4;
    }
    buf
}

/// Maximum length for POSIX shm names. Set to 0 to disable truncation.
///
/// On macOS `PSHMNAMLEN` is 31. On Linux the limit is typically 255.
#[cfg(target_os = "macos")]
pub const SHM_NAME_MAX: usize = 31;

#[cfg(not(target_os = "macos"))]
pub const SHM_NAME_MAX: usize = 0; // 0 = no truncation

/// Produce a POSIX shm-safe name (with leading '/').
///
/// When `SHM_NAME_MAX > 0`, names whose POSIX form (including the leading '/')
/// would exceed that limit are shortened to:
///     `/<prefix>_<16-hex-FNV-1a-hash>`
/// where `<prefix>` is a truncated portion of the original name for
/// debuggability.
pub fn make_shm_name(name: &str) -> String {
    let result = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };

    if SHM_NAME_MAX == 0 {
        return result;
    }

    if result.len() <= SHM_NAME_MAX {
        return result;
    }

    // 1 (underscore) + 16 (hex hash)
    const HASH_SUFFIX_LEN: usize = 1 + 16;
    let prefix_len = if SHM_NAME_MAX > HASH_SUFFIX_LEN + 1 {
        SHM_NAME_MAX - HASH_SUFFIX_LEN - 1 // -1 for leading '/'
    } else {
        0
    };

    let hash = fnv1a_64(result.as_bytes());
    let hex = to_hex(hash);
    let hex_str = std::str::from_utf8(&hex).unwrap();

    let mut shortened = String::with_capacity(SHM_NAME_MAX);
    shortened.push('/');
    if prefix_len > 0 {
        let original_body = &result[1..];
        let take = prefix_len.min(original_body.len());
        shortened.push_str(&original_body[..take]);
    }
    shortened.push('_');
    shortened.push_str(hex_str);
    shortened
}

/// Mint a globally unique shared-buffer name: `<pid>_shm_<hex>`.
pub fn unique_shm_name() -> String {
    format!(
        "{}_shm_{}",
        std::process::id(),
        Uuid::new_v4().as_simple()
    )
}

/// Mint a request id unique within this client process: `<pid>_req_<hex>`.
/// The leading `<pid>` segment is the affinity key.
pub fn unique_req_id() -> String {
    format!(
        "{}_req_{}",
        std::process::id(),
        Uuid::new_v4().as_simple()
    )
}

/// Extract the affinity key (the pid prefix) from a request id.
/// Ids with no separator map to themselves, so malformed ids still route
/// consistently.
pub fn affinity_key(req_id: &str) -> &str {
    match req_id.split_once('_') {
        Some((pid, _)) => pid,
        None => req_id,
    }
}
