//! Redaction helpers for anything that might carry credentials into logs
//! or health output (backend env values, launch commands, captured stderr).

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

struct SecretPattern {
    regex: Regex,
    /// Replacement template; `$key` keeps the field name when captured.
    replacement: &'static str,
}

// Patterns are compile-time constants.
#[allow(clippy::unwrap_used)]
static SECRET_PATTERNS: Lazy<Vec<SecretPattern>> = Lazy::new(|| {
    let pattern = |re: &str, replacement| SecretPattern {
        regex: Regex::new(re).unwrap(),
        replacement,
    };

    vec![
        pattern(
            r#"(?i)"(?P<key>token|password|passwd|apikey|api_key|api-key|secret|client_secret|authorization|access_token|refresh_token|private_key)"\s*:\s*"[^"]+""#,
            r#""$key":"[REDACTED]""#,
        ),
        pattern(r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*", "Bearer [REDACTED]"),
        pattern(
            r"(?i)(?P<key>token|key|secret|password|auth|apikey|api_key|access_key|client_secret)(?P<sep>\s*[=:]\s*)[^\s,;]{8,}",
            "$key$sep[REDACTED]",
        ),
        pattern(r"gh[pousr]_[A-Za-z0-9]{36,}", REDACTED),
        pattern(r"github_pat_[A-Za-z0-9_]{40,}", REDACTED),
        pattern(
            r"[A-Za-z0-9_-]{10,}\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+",
            REDACTED,
        ),
        pattern(r"\b[a-fA-F0-9]{32,}\b", REDACTED),
    ]
});

/// Replaces likely secrets in free-form text with `[REDACTED]`.
pub fn sanitize(text: &str) -> String {
    SECRET_PATTERNS
        .iter()
        .fold(text.to_string(), |acc, p| {
            p.regex.replace_all(&acc, p.replacement).into_owned()
        })
}

/// Shows only the first four characters of a secret value.
pub fn truncate_secret(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let prefix: String = value.chars().take(4).collect();
    if prefix.len() == value.len() {
        "****".to_string()
    } else {
        format!("{prefix}...")
    }
}

/// Truncates long diagnostic text on a char boundary.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...(truncated)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_key_value_pairs_but_keeps_key() {
        let out = sanitize("starting with api_key=sk_live_abcdefgh1234 now");
        assert_eq!(out, "starting with api_key=[REDACTED] now");
    }

    #[test]
    fn redacts_bearer_tokens() {
        let out = sanitize("Authorization header was Bearer abc.def-123");
        assert!(out.contains("Bearer [REDACTED]"), "{out}");
        assert!(!out.contains("abc.def-123"));
    }

    #[test]
    fn redacts_json_fields() {
        let out = sanitize(r#"{"token": "ghs_secretvalue", "name": "ok"}"#);
        assert_eq!(out, r#"{"token":"[REDACTED]", "name": "ok"}"#);
    }

    #[test]
    fn redacts_github_tokens_and_hex_keys() {
        let pat = format!("ghp_{}", "a".repeat(36));
        let hex = "0123456789abcdef0123456789abcdef";
        let out = sanitize(&format!("{pat} {hex}"));
        assert_eq!(out, "[REDACTED] [REDACTED]");
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        let text = "listening on 127.0.0.1:3000 with 3 backends";
        assert_eq!(sanitize(text), text);
    }

    #[test]
    fn truncate_secret_hides_most_of_value() {
        assert_eq!(truncate_secret("supersecret"), "supe...");
        assert_eq!(truncate_secret("abc"), "****");
        assert_eq!(truncate_secret(""), "");
    }

    #[test]
    fn truncate_text_marks_cut() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...(truncated)");
    }
}
