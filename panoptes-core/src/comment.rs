use serde::{Deserialize, Serialize};
use std::fmt;

/// Repository coordinates shared by every VCS operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Pull request metadata, immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub number: u64,
    pub repo: RepoRef,
    pub title: String,
    pub body: Option<String>,
    pub author: String,
    pub head_sha: String,
    pub base_sha: String,
}

/// One changed file in a pull request. Read-only downstream of the fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestFile {
    pub filename: String,
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
    pub changes: u64,
    #[serde(default)]
    pub patch: String,
}

/// A prior review state on the PR (e.g. "APPROVED").
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestReview {
    pub state: String,
    pub author: String,
}

/// A comment already present on the pull request, used for deduplication
/// and the inappropriateness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingComment {
    pub id: u64,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    pub author: String,
    pub body: String,
}

impl ExistingComment {
    pub fn is_bot(&self) -> bool {
        self.author.ends_with("[bot]")
    }
}

/// Drop comments left by bots other than our own so downstream duplicate
/// and appropriateness checks only see human feedback and our own output.
pub fn filter_external_bot_comments(
    comments: Vec<ExistingComment>,
    own_login: &str,
) -> Vec<ExistingComment> {
    comments
        .into_iter()
        .filter(|c| !c.is_bot() || c.author == own_login)
        .collect()
}

/// The central review entity. Every downstream decision is recorded as a
/// state transition on this struct; comments are never removed from the
/// working set, so the full audit trail survives to the poster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewComment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub line: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<u64>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_reason: Option<String>,
}

impl ReviewComment {
    pub fn is_rejected(&self) -> bool {
        self.rejection_reason.as_deref().is_some_and(|r| !r.is_empty())
    }

    pub fn reject(&mut self, reason: impl Into<String>, model: impl Into<String>) {
        self.rejection_reason = Some(reason.into());
        self.rejection_model = Some(model.into());
    }

    pub fn accept(&mut self, reason: impl Into<String>) {
        self.acceptance_reason = Some(reason.into());
    }

    /// Closed line range this comment targets. Single-line comments target
    /// `line..=line`; multi-line comments start at `start_line`.
    pub fn target_range(&self) -> (u64, u64) {
        let start = self.start_line.unwrap_or(self.line).min(self.line);
        (start, self.line)
    }
}

/// True when two comments target the same file and their line ranges
/// intersect. This is the predicate the merge step uses to decide that a
/// region is already covered by a higher-priority backend.
pub fn comments_overlap(a: &ReviewComment, b: &ReviewComment) -> bool {
    if a.path.is_empty() || a.path != b.path {
        return false;
    }
    let (a_start, a_end) = a.target_range();
    let (b_start, b_end) = b.target_range();
    a_start <= b_end && b_start <= a_end
}

/// Concatenate every file's patch into one unified-diff style document.
pub fn build_full_patch(files: &[PullRequestFile]) -> String {
    let mut out = String::new();
    for file in files {
        out.push_str(&format!(
            "--- {}\n+++ {}\n{}\n\n",
            file.filename, file.filename, file.patch
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(path: &str, line: u64, start_line: Option<u64>) -> ReviewComment {
        ReviewComment {
            id: String::new(),
            path: path.to_string(),
            line,
            start_line,
            body: "body".to_string(),
            category: String::new(),
            provider: String::new(),
            model: String::new(),
            commit_sha: String::new(),
            rejection_reason: None,
            rejection_model: None,
            acceptance_reason: None,
        }
    }

    #[test]
    fn overlap_same_file_same_line() {
        let a = comment("src/main.rs", 10, None);
        let b = comment("src/main.rs", 10, None);
        assert!(comments_overlap(&a, &b));
    }

    #[test]
    fn overlap_intersecting_ranges() {
        let a = comment("src/main.rs", 12, Some(8));
        let b = comment("src/main.rs", 20, Some(11));
        assert!(comments_overlap(&a, &b));
        assert!(comments_overlap(&b, &a));
    }

    #[test]
    fn no_overlap_different_files() {
        let a = comment("src/main.rs", 10, None);
        let b = comment("src/lib.rs", 10, None);
        assert!(!comments_overlap(&a, &b));
    }

    #[test]
    fn no_overlap_disjoint_ranges() {
        let a = comment("src/main.rs", 10, Some(5));
        let b = comment("src/main.rs", 20, Some(11));
        assert!(!comments_overlap(&a, &b));
    }

    #[test]
    fn empty_paths_never_overlap() {
        let a = comment("", 10, None);
        let b = comment("", 10, None);
        assert!(!comments_overlap(&a, &b));
    }

    #[test]
    fn rejection_requires_non_empty_reason() {
        let mut c = comment("a.rs", 1, None);
        assert!(!c.is_rejected());
        c.rejection_reason = Some(String::new());
        assert!(!c.is_rejected());
        c.reject("duplicate", "gpt-test");
        assert!(c.is_rejected());
    }

    #[test]
    fn external_bot_comments_are_filtered() {
        let comments = vec![
            ExistingComment {
                id: 1,
                path: None,
                line: None,
                author: "alice".to_string(),
                body: "human comment".to_string(),
            },
            ExistingComment {
                id: 2,
                path: None,
                line: None,
                author: "renovate[bot]".to_string(),
                body: "bump deps".to_string(),
            },
            ExistingComment {
                id: 3,
                path: None,
                line: None,
                author: "panoptes[bot]".to_string(),
                body: "our own review".to_string(),
            },
        ];
        let kept = filter_external_bot_comments(comments, "panoptes[bot]");
        let ids: Vec<u64> = kept.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn full_patch_includes_every_file() {
        let files = vec![
            PullRequestFile {
                filename: "a.rs".to_string(),
                status: "modified".to_string(),
                additions: 1,
                deletions: 0,
                changes: 1,
                patch: "@@ -1 +1 @@\n+line".to_string(),
            },
            PullRequestFile {
                filename: "b.rs".to_string(),
                status: "added".to_string(),
                additions: 2,
                deletions: 0,
                changes: 2,
                patch: "@@ -0,0 +1,2 @@\n+x\n+y".to_string(),
            },
        ];
        let patch = build_full_patch(&files);
        assert!(patch.contains("--- a.rs"));
        assert!(patch.contains("+++ b.rs"));
        assert!(patch.contains("+line"));
    }
}
