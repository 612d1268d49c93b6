// src/util.rs — Small string helpers for logs and summaries

/// Cut `s` to at most `max_len` bytes without splitting a UTF-8 character.
pub fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let end = (0..=max_len)
        .rev()
        .find(|&i| s.is_char_boundary(i))
        .unwrap_or(0);
    &s[..end]
}

/// Single-line excerpt of job output, with an ellipsis when cut.
pub fn excerpt(s: &str, max_len: usize) -> String {
    let flat = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let cut = truncate_str(&flat, max_len);
    if cut.len() < flat.len() {
        format!("{cut}…")
    } else {
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_session_prefix() {
        assert_eq!(truncate_str("Zq3v9K_xR2mP8wLd", 8), "Zq3v9K_x");
        assert_eq!(truncate_str("short", 8), "short");
    }

    #[test]
    fn test_truncate_never_splits_char() {
        // "é" is two bytes; byte 4 falls inside it.
        assert_eq!(truncate_str("café", 4), "caf");
        assert_eq!(truncate_str("", 3), "");
    }

    #[test]
    fn test_excerpt_flattens_and_marks_cut() {
        assert_eq!(
            excerpt("fatal: [receiver]:\n  UNREACHABLE!", 200),
            "fatal: [receiver]: UNREACHABLE!"
        );
        assert_eq!(excerpt("rsync error code 12", 11), "rsync error…");
    }
}
