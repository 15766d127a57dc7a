//! Human-readable renderings of expressions and compiled kernels.
pub mod trace;

pub use trace::format_trace;

/// Shortens long text to `head...tail` so error messages stay readable.
///
/// Text shorter than `n + 20` characters is returned unchanged; otherwise the first and
/// last `n / 2` characters are kept.
pub fn truncate(text: &str, n: usize) -> String {
    let count = text.chars().count();
    if count < n + 20 {
        return text.to_string();
    }
    let half = n / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(count - half).collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn test_short_text_unchanged() {
        assert_eq!(truncate("a.x + b.y", 10), "a.x + b.y");
    }

    #[test]
    fn test_long_text_keeps_head_and_tail() {
        let long = format!("{}{}", "a".repeat(100), "b".repeat(100));
        let t = truncate(&long, 20);
        assert_eq!(t, format!("{}...{}", "a".repeat(10), "b".repeat(10)));
    }
}
