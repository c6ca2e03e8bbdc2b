//! Line windows, previews and search over stored output.

use regex::Regex;
use serde::Serialize;

/// A window of lines from one stored result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub command_id: String,
    pub text: String,
    pub offset: usize,
    pub returned_lines: usize,
    pub total_lines: usize,
    pub has_more: bool,
}

/// One search hit, with 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub line_number: usize,
    pub line: String,
    pub context_before: Vec<String>,
    pub context_after: Vec<String>,
}

/// The head of an output returned inline to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub text: String,
    pub truncated: bool,
    pub returned_lines: usize,
    pub total_lines: usize,
}

/// Keep at most `max_lines` lines. Zero disables truncation.
pub fn preview(text: &str, max_lines: usize) -> Preview {
    let total_lines = text.lines().count();
    if max_lines == 0 || total_lines <= max_lines {
        return Preview {
            text: text.to_string(),
            truncated: false,
            returned_lines: total_lines,
            total_lines,
        };
    }

    Preview {
        text: text.lines().take(max_lines).collect::<Vec<_>>().join("\n"),
        truncated: true,
        returned_lines: max_lines,
        total_lines,
    }
}

/// Slice `lines[offset..offset + limit]`. Out-of-range offsets give an empty window.
pub(crate) fn window(lines: &[&str], offset: usize, limit: usize) -> (String, usize, bool) {
    let total = lines.len();
    if offset >= total {
        return (String::new(), 0, false);
    }
    let end = offset.saturating_add(limit).min(total);
    let selected = &lines[offset..end];
    (selected.join("\n"), selected.len(), end < total)
}

pub(crate) fn find_matches(lines: &[&str], pattern: &Regex, context: usize) -> Vec<SearchMatch> {
    let owned = |slice: &[&str]| slice.iter().map(|l| l.to_string()).collect::<Vec<_>>();

    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| pattern.is_match(line))
        .map(|(i, line)| {
            let after_end = i.saturating_add(1).saturating_add(context).min(lines.len());
            SearchMatch {
                line_number: i + 1,
                line: line.to_string(),
                context_before: owned(&lines[i.saturating_sub(context)..i]),
                context_after: owned(&lines[i + 1..after_end]),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_under_threshold() {
        let p = preview("a\nb", 20);
        assert!(!p.truncated);
        assert_eq!(p.text, "a\nb");
        assert_eq!(p.total_lines, 2);
    }

    #[test]
    fn test_preview_truncates() {
        let text = (1..=30).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let p = preview(&text, 20);
        assert!(p.truncated);
        assert_eq!(p.returned_lines, 20);
        assert_eq!(p.total_lines, 30);
        assert!(p.text.ends_with("\n20"));
    }

    #[test]
    fn test_preview_zero_disables() {
        let p = preview("a\nb\nc", 0);
        assert!(!p.truncated);
        assert_eq!(p.returned_lines, 3);
    }

    #[test]
    fn test_window_bounds() {
        let lines = ["a", "b", "c"];
        assert_eq!(window(&lines, 0, 2), ("a\nb".to_string(), 2, true));
        assert_eq!(window(&lines, 1, 5), ("b\nc".to_string(), 2, false));
        assert_eq!(window(&lines, 3, 5), (String::new(), 0, false));
    }

    #[test]
    fn test_match_context_at_edges() {
        let lines = ["schedule", "b", "c", "schedule_timeout"];
        let re = Regex::new("schedule").unwrap();
        let hits = find_matches(&lines, &re, 2);
        assert_eq!(hits.len(), 2);
        assert!(hits[0].context_before.is_empty());
        assert_eq!(hits[0].context_after, vec!["b", "c"]);
        assert_eq!(hits[1].line_number, 4);
        assert_eq!(hits[1].context_before, vec!["b", "c"]);
        assert!(hits[1].context_after.is_empty());
    }
}
