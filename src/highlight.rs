use crossterm::style::Stylize;
use regex::{Captures, Regex, RegexBuilder};

/// Case-insensitive matcher for the literal search text.
pub fn build_highlight_regex(search: &str) -> Option<Regex> {
    if search.is_empty() {
        return None;
    }
    RegexBuilder::new(&regex::escape(search))
        .case_insensitive(true)
        .build()
        .ok()
}

/// Wraps every match in bold yellow terminal styling.
pub fn highlight(text: &str, regex: &Regex) -> String {
    highlight_with(text, regex, |matched| matched.bold().yellow().to_string())
}

pub fn highlight_with<F>(text: &str, regex: &Regex, mut mark: F) -> String
where
    F: FnMut(&str) -> String,
{
    regex
        .replace_all(text, |caps: &Captures<'_>| mark(&caps[0]))
        .into_owned()
}
