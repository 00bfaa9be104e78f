use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Generate a fresh ingress request id. A UUID keeps snapshot filenames
/// collision-free across restarts.
pub(crate) fn next_request_id() -> String {
    let mut out = String::with_capacity(36);
    out.push_str("req_");
    out.push_str(&uuid::Uuid::new_v4().simple().to_string());
    out
}

/// Sanitize a caller-supplied request id to `[A-Za-z0-9_.-]`.
///
/// The id is the correlation key across every stage log and snapshot
/// filename, so anything else is replaced rather than rejected.
#[must_use]
pub(crate) fn sanitize_request_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(64));
    for ch in raw.chars().take(64) {
        if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        return next_request_id();
    }
    out
}

pub(crate) fn next_generated_id(prefix: &str, counter: &AtomicU64) -> String {
    let id = counter.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(prefix.len() + 17);
    out.push_str(prefix);
    out.push('-');
    push_u64_hex_16(&mut out, id);
    out
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Rough token estimate used only for route classification thresholds.
#[inline]
#[must_use]
pub(crate) fn approx_token_count(chars: usize) -> u64 {
    (chars as u64) / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_disallowed_characters() {
        assert_eq!(sanitize_request_id("abc-123_ok.v2"), "abc-123_ok.v2");
        assert_eq!(sanitize_request_id("a b/c"), "a_b_c");
    }

    #[test]
    fn sanitize_empty_falls_back_to_generated() {
        let id = sanitize_request_id("");
        assert!(id.starts_with("req_"));
        assert!(id.len() > 8);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert_ne!(a, b);
    }
}
