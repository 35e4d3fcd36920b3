//! Output capture helpers shared by the exec and skill handlers.

/// Marker appended when captured output exceeds the configured cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Cap `raw` at `max_bytes`, appending the truncation marker only when
/// something was actually cut. The cut lands on a char boundary so the
/// result stays valid UTF-8.
pub fn truncate_output(raw: &str, max_bytes: usize) -> String {
    if raw.len() <= max_bytes {
        return raw.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = raw[..cut].to_string();
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Bytes-to-string with lossy UTF-8 — subprocess output is hostile input.
pub fn capture_text(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_cap_is_untouched() {
        let s = "x".repeat(64);
        let out = truncate_output(&s, 64);
        assert_eq!(out, s);
        assert!(!out.contains("[output truncated]"));
    }

    #[test]
    fn one_past_cap_is_marked() {
        let s = "x".repeat(65);
        let out = truncate_output(&s, 64);
        assert!(out.starts_with(&"x".repeat(64)));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // 'é' is two bytes; cutting at byte 1 would split it.
        let s = "é".repeat(10);
        let out = truncate_output(&s, 3);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(out.starts_with('é'));
    }
}
