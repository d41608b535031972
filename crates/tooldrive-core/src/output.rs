/// Caps tool output before it enters the conversation history.
#[derive(Debug, Clone, Copy)]
pub struct OutputLimiter {
    limit: usize,
}

impl Default for OutputLimiter {
    fn default() -> Self {
        Self::new(400_000)
    }
}

impl OutputLimiter {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Keep the first `limit` characters and note how many were dropped.
    pub fn truncate(&self, label: &str, text: &str) -> String {
        let total = text.chars().count();
        if total <= self.limit {
            return text.to_string();
        }
        let kept: String = text.chars().take(self.limit).collect();
        let omitted = total - self.limit;
        tracing::debug!(label, omitted, "Output truncated");
        format!("{kept}\n[{label} truncated: {omitted} chars omitted]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_output_untouched() {
        let limiter = OutputLimiter::new(10);
        assert_eq!(limiter.truncate("read_file", "hello"), "hello");
    }

    #[test]
    fn test_long_output_truncated_by_chars() {
        let limiter = OutputLimiter::new(3);
        let out = limiter.truncate("calculator", "äöüßx");
        assert_eq!(out, "äöü\n[calculator truncated: 2 chars omitted]");
    }
}
