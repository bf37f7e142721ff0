/// Check if a word is a common stop word. Used to filter keyword/entity
/// candidates before scoring.
pub fn is_stop_word(word: &str) -> bool {
    matches!(
        word,
        "the" | "and" | "or" | "but" | "in" | "on" | "at" | "to" | "for" | "of" | "with" | "by" |
        "a" | "an" | "is" | "are" | "was" | "were" | "be" | "been" | "have" | "has" | "had" |
        "do" | "does" | "did" | "will" | "would" | "could" | "should" | "may" | "might" | "must" |
        "can" | "this" | "that" | "these" | "those" | "after" | "over" | "into" | "than" | "its"
    )
}

/// Text processing utilities.
pub mod text {
    /// Truncate text to a maximum length, trying to break at sentence boundaries.
    pub fn smart_truncate(text: &str, max_length: usize) -> String {
        if text.len() <= max_length {
            return text.to_string();
        }

        let truncated = &text[..max_length];
        if let Some(last_sentence) = truncated.rfind('.') {
            truncated[..last_sentence + 1].to_string()
        } else if let Some(last_space) = truncated.rfind(' ') {
            format!("{}...", &truncated[..last_space])
        } else {
            format!("{}...", truncated)
        }
    }

    /// Clean and normalize text for processing: strips everything but
    /// alphanumerics, whitespace and basic punctuation, and collapses runs
    /// of whitespace.
    pub fn normalize_text(text: &str) -> String {
        text.chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace() || ".,!?;:-'".contains(*c))
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Strip HTML tags, keeping only the text content. Links are removed
    /// entirely (their anchor text is kept) rather than rendered inline.
    pub fn strip_html(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut in_tag = false;
        for c in input.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                _ if !in_tag => out.push(c),
                _ => {}
            }
        }
        normalize_text(&out)
    }

    /// Token-to-markup ratio heuristic used to reject boilerplate/tracker-only
    /// entries: fraction of characters that are alphanumeric text vs markup.
    pub fn text_to_markup_ratio(raw_html: &str) -> f64 {
        if raw_html.is_empty() {
            return 0.0;
        }
        let text_len = strip_html(raw_html).len();
        text_len as f64 / raw_html.len() as f64
    }
}

/// URL utilities.
pub mod url {
    use url::Url;

    /// Extract domain from URL.
    pub fn extract_domain(url_str: &str) -> Option<String> {
        Url::parse(url_str).ok().and_then(|u| u.domain().map(|d| d.to_string()))
    }

    /// Validate that a URL is absolute http(s), resolving it against a base
    /// if it is relative (RSS entries sometimes carry root-relative links).
    pub fn resolve_absolute(url_str: &str, base: &str) -> Option<String> {
        if let Ok(u) = Url::parse(url_str) {
            if u.scheme() == "http" || u.scheme() == "https" {
                return Some(u.into());
            }
        }
        let base_url = Url::parse(base).ok()?;
        base_url.join(url_str).ok().map(|u| u.into())
    }

    pub fn is_valid_rss_url(url_str: &str) -> bool {
        Url::parse(url_str)
            .map(|u| u.scheme() == "http" || u.scheme() == "https")
            .unwrap_or(false)
    }
}

/// Time utilities.
pub mod time {
    use chrono::{DateTime, Duration, Utc};

    /// Check if enough time has passed since last update.
    pub fn should_update(last_update: Option<DateTime<Utc>>, interval_seconds: i64) -> bool {
        match last_update {
            None => true,
            Some(last) => Utc::now().signed_duration_since(last) >= Duration::seconds(interval_seconds),
        }
    }

    /// Format duration in human-readable form, used in log lines.
    pub fn format_duration(duration: Duration) -> String {
        let total_seconds = duration.num_seconds();
        if total_seconds < 60 {
            format!("{}s", total_seconds)
        } else if total_seconds < 3600 {
            format!("{}m", total_seconds / 60)
        } else if total_seconds < 86400 {
            format!("{}h", total_seconds / 3600)
        } else {
            format!("{}d", total_seconds / 86400)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_removes_tags_keeps_text() {
        assert_eq!(text::strip_html("<p>Hello <b>world</b></p>"), "Hello world");
    }

    #[test]
    fn text_to_markup_ratio_low_for_tracker_pixel() {
        let markup = "<img src=\"x\"/><script>x</script><div></div>";
        assert!(text::text_to_markup_ratio(markup) < 0.3);
    }

    #[test]
    fn smart_truncate_breaks_on_sentence() {
        let text = "First sentence. Second sentence. Third.";
        let truncated = text::smart_truncate(text, 20);
        assert_eq!(truncated, "First sentence.");
    }
}
