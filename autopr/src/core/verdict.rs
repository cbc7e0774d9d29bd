//! Reviewer verdict classification.
//!
//! The reviewer agent is asked to answer with `APPROVED` or
//! `CHANGES_REQUESTED: <feedback>`. Anything that cannot be read as an
//! approval is classified as a change request, so ambiguous output never
//! leads to a merge.

use std::sync::LazyLock;

use regex::Regex;

/// Number of trailing lines used as feedback when the reviewer gave no marker.
const FEEDBACK_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    ChangesRequested {
        feedback: String,
        /// False when no marker was found and the verdict was inferred.
        explicit: bool,
    },
}

impl Verdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, Verdict::Approved)
    }
}

static VERDICT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(approved|lgtm)|changes[_ ]requested)\b").expect("valid regex")
});
static NEGATED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(not|never|cannot|can't|won't)\s+(yet\s+)?(be\s+)?approved\b")
        .expect("valid regex")
});

/// Classify reviewer output into a verdict.
///
/// Only the last line that starts with a verdict marker counts; approval
/// wording elsewhere in the review is ignored. Markdown emphasis, headings
/// and quotes in front of the marker are skipped.
pub fn parse_verdict(text: &str) -> Verdict {
    let lines: Vec<&str> = text.lines().collect();
    let found = lines.iter().enumerate().rev().find_map(|(idx, &line)| {
        let bare = strip_decoration(line);
        VERDICT_LINE_RE
            .captures(bare)
            .map(|caps| (idx, bare, caps.get(1).is_some(), caps[0].len()))
    });

    let Some((idx, line, approves, marker_len)) = found else {
        return Verdict::ChangesRequested {
            feedback: tail_lines(text),
            explicit: false,
        };
    };

    if approves {
        if NEGATED_RE.is_match(line) {
            return Verdict::ChangesRequested {
                feedback: tail_lines(text),
                explicit: false,
            };
        }
        return Verdict::Approved;
    }

    let mut feedback = line[marker_len..]
        .trim_start_matches(|c: char| matches!(c, ':' | '-' | '*' | '`') || c.is_whitespace())
        .trim()
        .to_string();
    let rest = lines[idx + 1..].join("\n");
    let rest = rest.trim();
    if !rest.is_empty() {
        if !feedback.is_empty() {
            feedback.push('\n');
        }
        feedback.push_str(rest);
    }
    if feedback.is_empty() {
        feedback = tail_lines(&lines[..idx].join("\n"));
    }
    Verdict::ChangesRequested {
        feedback,
        explicit: true,
    }
}

fn strip_decoration(line: &str) -> &str {
    line.trim()
        .trim_start_matches(|c: char| matches!(c, '*' | '_' | '#' | '>' | '`') || c.is_whitespace())
}

fn tail_lines(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(FEEDBACK_TAIL_LINES);
    lines[start..].join("\n")
}
