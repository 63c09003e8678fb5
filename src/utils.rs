//! Small helpers shared across the crate.

/// Wall-clock time in epoch milliseconds. Cron rows store time this way.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Keep at most the last `max_chars` characters of `s`, prefixing a marker when
/// anything was dropped. Runner output is most useful at the end.
pub fn truncate_tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - max_chars).collect();
    format!("(truncated) ...{}", tail)
}

/// Keep at most `max_chars` characters, with "..." counted inside the limit.
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    if max_chars <= 3 {
        return ".".repeat(max_chars);
    }
    let head: String = s.chars().take(max_chars - 3).collect();
    format!("{}...", head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("ééééé", 4), "é...");
        assert_eq!(truncate_str("abcdef", 2), "..");
    }

    #[test]
    fn truncate_tail_keeps_the_end() {
        assert_eq!(truncate_tail("short", 10), "short");
        assert_eq!(truncate_tail("line1\nline2", 5), "(truncated) ...line2");
    }

    #[test]
    fn now_ms_is_recent() {
        assert!(now_ms() > 1_700_000_000_000);
    }
}
