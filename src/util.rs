//! Shared utility functions for the mender crate.

/// Every balanced `{...}` span in `text`, in order of appearance.
/// Braces inside string literals are ignored. After a span closes the scan
/// resumes behind it; a `{` that never closes is skipped.
pub fn json_objects(text: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        match balanced_len(&text[start..]) {
            Some(len) => {
                found.push(&text[start..start + len]);
                pos = start + len;
            }
            None => pos = start + 1,
        }
    }
    found
}

/// Length of the object opening at the start of `text`, if it closes.
fn balanced_len(text: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// First line of `text`, cut to at most `max_chars` characters.
pub fn first_line(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() <= max_chars {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut.trim_end())
    }
}
