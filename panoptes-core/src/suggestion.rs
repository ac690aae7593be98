//! Committable-suggestion handling: fenced block extraction and no-op
//! detection against the unified diff.

use crate::comment::{PullRequestFile, ReviewComment};

/// Fixed reason attached to comments rejected by no-op detection.
pub const NOOP_REJECTION_REASON: &str =
    "No-op suggestion: suggested code is the same as original code";

/// Synthetic model tag recorded for no-op rejections, since no model made
/// the call.
pub const NOOP_DETECTION_MODEL: &str = "no_op_detection";

/// True if the body contains a committable ```suggestion block.
pub fn has_suggestion(body: &str) -> bool {
    body.contains("```suggestion")
}

/// Extract the content of the first ```suggestion fence, if any.
pub fn extract_suggestion(body: &str) -> Option<&str> {
    let start = body.find("```suggestion")?;
    let after_marker = &body[start + "```suggestion".len()..];
    // The fence marker line may carry attributes; content starts after the
    // first newline.
    let content_start = after_marker.find('\n')? + 1;
    let content = &after_marker[content_start..];
    let end = content.find("```")?;
    Some(&content[..end])
}

/// Reconstruct the post-image lines of a unified diff patch, numbered by
/// their position in the new file. Context and added lines advance the new
/// line counter; removed lines do not appear.
pub fn new_file_lines(patch: &str) -> Vec<(u64, String)> {
    let mut lines = Vec::new();
    let mut new_line: u64 = 0;
    for raw in patch.lines() {
        if raw.starts_with("@@") {
            // Hunk header: @@ -a,b +c,d @@
            if let Some(plus) = raw.find('+') {
                let tail = &raw[plus + 1..];
                let num: String = tail.chars().take_while(|c| c.is_ascii_digit()).collect();
                if let Ok(n) = num.parse::<u64>() {
                    new_line = n;
                }
            }
            continue;
        }
        match raw.chars().next() {
            Some('+') => {
                lines.push((new_line, raw[1..].to_string()));
                new_line += 1;
            }
            Some(' ') => {
                lines.push((new_line, raw[1..].to_string()));
                new_line += 1;
            }
            Some('-') => {}
            Some('\\') => {} // "\ No newline at end of file"
            _ => {}
        }
    }
    lines
}

/// The new-file text covered by the given closed line range, or `None` if
/// any line in the range is absent from the patch.
pub fn target_lines(patch: &str, start: u64, end: u64) -> Option<String> {
    let lines = new_file_lines(patch);
    let mut collected = Vec::new();
    for wanted in start..=end {
        let line = lines.iter().find(|(n, _)| *n == wanted)?;
        collected.push(line.1.clone());
    }
    Some(collected.join("\n"))
}

fn normalize(text: &str) -> String {
    text.lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// True when the comment's suggested replacement is textually identical
/// (modulo trailing whitespace) to the code it targets. Deterministic: no
/// model is involved.
pub fn suggestion_is_noop(comment: &ReviewComment, files: &[PullRequestFile]) -> bool {
    let Some(suggested) = extract_suggestion(&comment.body) else {
        return false;
    };
    let Some(file) = files.iter().find(|f| f.filename == comment.path) else {
        return false;
    };
    let (start, end) = comment.target_range();
    let Some(original) = target_lines(&file.patch, start, end) else {
        return false;
    };
    normalize(suggested) == normalize(&original)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, patch: &str) -> PullRequestFile {
        PullRequestFile {
            filename: name.to_string(),
            status: "modified".to_string(),
            additions: 0,
            deletions: 0,
            changes: 0,
            patch: patch.to_string(),
        }
    }

    fn comment_with_suggestion(path: &str, line: u64, suggestion: &str) -> ReviewComment {
        ReviewComment {
            id: "c1".to_string(),
            path: path.to_string(),
            line,
            start_line: None,
            body: format!("Use this instead:\n```suggestion\n{suggestion}\n```"),
            category: String::new(),
            provider: "anthropic".to_string(),
            model: "m".to_string(),
            commit_sha: "abc".to_string(),
            rejection_reason: None,
            rejection_model: None,
            acceptance_reason: None,
        }
    }

    const PATCH: &str = "@@ -1,3 +1,4 @@\n context line\n+let x = compute();\n+let y = x + 1;\n context tail";

    #[test]
    fn extracts_suggestion_block() {
        let body = "Fix:\n```suggestion\nlet x = 1;\n```\ntrailing";
        assert_eq!(extract_suggestion(body), Some("let x = 1;\n"));
    }

    #[test]
    fn numbers_new_file_lines_from_hunk_header() {
        let lines = new_file_lines(PATCH);
        assert_eq!(lines[0], (1, "context line".to_string()));
        assert_eq!(lines[1].0, 2);
        assert_eq!(lines[1].1, "let x = compute();");
        assert_eq!(lines[3].0, 4);
    }

    #[test]
    fn identical_suggestion_is_noop() {
        let files = vec![file("src/a.rs", PATCH)];
        let comment = comment_with_suggestion("src/a.rs", 2, "let x = compute();");
        assert!(suggestion_is_noop(&comment, &files));
    }

    #[test]
    fn trailing_whitespace_does_not_defeat_noop_detection() {
        let files = vec![file("src/a.rs", PATCH)];
        let comment = comment_with_suggestion("src/a.rs", 2, "let x = compute();   ");
        assert!(suggestion_is_noop(&comment, &files));
    }

    #[test]
    fn different_suggestion_is_not_noop() {
        let files = vec![file("src/a.rs", PATCH)];
        let comment = comment_with_suggestion("src/a.rs", 2, "let x = compute()?;");
        assert!(!suggestion_is_noop(&comment, &files));
    }

    #[test]
    fn missing_file_or_lines_is_not_noop() {
        let files = vec![file("src/a.rs", PATCH)];
        let elsewhere = comment_with_suggestion("src/b.rs", 2, "let x = compute();");
        assert!(!suggestion_is_noop(&elsewhere, &files));
        let out_of_range = comment_with_suggestion("src/a.rs", 99, "let x = compute();");
        assert!(!suggestion_is_noop(&out_of_range, &files));
    }

    #[test]
    fn body_without_suggestion_is_not_noop() {
        let files = vec![file("src/a.rs", PATCH)];
        let mut comment = comment_with_suggestion("src/a.rs", 2, "x");
        comment.body = "plain comment, no fence".to_string();
        assert!(!suggestion_is_noop(&comment, &files));
    }
}
