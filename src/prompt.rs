//! Classifies terminal output into prompts the session engine can react
//! to deterministically, instead of hanging on an interactive read.

use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Password,
    Confirmation,
    Editor,
    Pager,
    ShellPrompt,
    Text,
}

#[derive(Clone)]
pub struct PromptPattern {
    pub name: &'static str,
    pub regex: Regex,
    pub kind: PromptKind,
    pub mask_input: bool,
    pub suggested_response: Option<&'static str>,
}

impl std::fmt::Debug for PromptPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptPattern")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub pattern_name: &'static str,
    pub kind: PromptKind,
    pub matched: String,
    pub context: String,
    pub suggested_response: Option<&'static str>,
    pub mask_input: bool,
}

/// Built-in patterns, in registration order. Custom patterns registered on
/// a [`PromptDetector`] are always tried before these.
static DEFAULT_PATTERNS: LazyLock<Vec<PromptPattern>> = LazyLock::new(|| {
    vec![
        PromptPattern {
            name: "sudo_password",
            regex: Regex::new(r"(?i)\[sudo\] password for [^:]+:\s*$").unwrap(),
            kind: PromptKind::Password,
            mask_input: true,
            suggested_response: None,
        },
        PromptPattern {
            name: "generic_password",
            regex: Regex::new(r"(?i)(^|\n)\s*(password|passphrase)( for [^:]+)?:\s*$").unwrap(),
            kind: PromptKind::Password,
            mask_input: true,
            suggested_response: None,
        },
        PromptPattern {
            name: "confirmation_yn",
            regex: Regex::new(r"\[[Yy]/[Nn]\]\s*$").unwrap(),
            kind: PromptKind::Confirmation,
            mask_input: false,
            suggested_response: Some("y"),
        },
        PromptPattern {
            name: "confirmation_yesno",
            regex: Regex::new(r"(?i)\(yes/no\)\s*\??\s*$").unwrap(),
            kind: PromptKind::Confirmation,
            mask_input: false,
            suggested_response: Some("yes"),
        },
        PromptPattern {
            name: "are_you_sure",
            regex: Regex::new(r"(?i)are you sure.*\?\s*$").unwrap(),
            kind: PromptKind::Confirmation,
            mask_input: false,
            suggested_response: Some("yes"),
        },
        PromptPattern {
            name: "editor_vim",
            regex: Regex::new(r"(?i)-- INSERT --|^~\s*$|VIM - Vi IMproved").unwrap(),
            kind: PromptKind::Editor,
            mask_input: false,
            suggested_response: None,
        },
        PromptPattern {
            name: "editor_nano",
            regex: Regex::new(r"GNU nano").unwrap(),
            kind: PromptKind::Editor,
            mask_input: false,
            suggested_response: None,
        },
        PromptPattern {
            name: "pager_more",
            regex: Regex::new(r"--More--").unwrap(),
            kind: PromptKind::Pager,
            mask_input: false,
            suggested_response: Some("q"),
        },
        PromptPattern {
            name: "pager_lines",
            regex: Regex::new(r"lines \d+-\d+").unwrap(),
            kind: PromptKind::Pager,
            mask_input: false,
            suggested_response: Some("q"),
        },
        PromptPattern {
            name: "shell_prompt",
            regex: Regex::new(r"(?m)^\$ $").unwrap(),
            kind: PromptKind::ShellPrompt,
            mask_input: false,
            suggested_response: None,
        },
    ]
});

/// Evaluates only the last `N` lines of a buffer, to bound regex cost on
/// long-running commands with large output.
const DEFAULT_CONTEXT_LINES: usize = 10;

/// Holds two ordered lists of patterns -- custom first, then defaults.
/// Safe for concurrent read after construction; registering a pattern
/// requires exclusive access (a write lock from the caller's side, or
/// construct-then-freeze as done here via `Vec` rebuild under a lock).
#[derive(Clone)]
pub struct PromptDetector {
    custom: std::sync::Arc<tokio::sync::RwLock<Vec<PromptPattern>>>,
    context_lines: usize,
}

impl std::fmt::Debug for PromptDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptDetector").finish()
    }
}

impl PromptDetector {
    pub fn new() -> Self {
        Self::with_context_lines(DEFAULT_CONTEXT_LINES)
    }

    pub fn with_context_lines(context_lines: usize) -> Self {
        Self {
            custom: std::sync::Arc::new(tokio::sync::RwLock::new(Vec::new())),
            context_lines,
        }
    }

    pub async fn register(&self, pattern: PromptPattern) {
        self.custom.write().await.push(pattern);
    }

    /// Evaluates `buffer`, applying custom patterns (in registration order)
    /// before defaults. The first match wins.
    pub async fn detect(&self, buffer: &str) -> Option<Detection> {
        let tail = last_n_lines(buffer, self.context_lines);
        let custom = self.custom.read().await;
        for pattern in custom.iter().chain(DEFAULT_PATTERNS.iter()) {
            if let Some(m) = pattern.regex.find(&tail) {
                let context = tail[..m.start()].trim_end().to_string();
                return Some(Detection {
                    pattern_name: pattern.name,
                    kind: pattern.kind,
                    matched: m.as_str().to_string(),
                    context,
                    suggested_response: pattern.suggested_response,
                    mask_input: pattern.mask_input,
                });
            }
        }
        None
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn last_n_lines(buffer: &str, n: usize) -> String {
    let lines: Vec<&str> = buffer.lines().collect();
    if lines.len() <= n {
        buffer.to_string()
    } else {
        lines[lines.len() - n..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_sudo_password_prompt() {
        let detector = PromptDetector::new();
        let d = detector
            .detect("some output\n[sudo] password for alice: ")
            .await
            .unwrap();
        assert_eq!(d.pattern_name, "sudo_password");
        assert_eq!(d.kind as u8, PromptKind::Password as u8);
        assert!(d.mask_input);
    }

    #[tokio::test]
    async fn detects_confirmation_prompt() {
        let detector = PromptDetector::new();
        let d = detector.detect("Proceed? [y/N] ").await;
        assert!(d.is_none()); // case mismatch on regex is intentional: only [Yy]/[Nn]

        let d = detector.detect("Proceed? [Y/n]").await.unwrap();
        assert_eq!(d.pattern_name, "confirmation_yn");
        assert_eq!(d.suggested_response, Some("y"));
    }

    #[tokio::test]
    async fn custom_pattern_has_priority_over_default() {
        let detector = PromptDetector::new();
        detector
            .register(PromptPattern {
                name: "custom_password",
                regex: Regex::new(r"(?i)password:\s*$").unwrap(),
                kind: PromptKind::Password,
                mask_input: true,
                suggested_response: None,
            })
            .await;

        let d = detector.detect("Password: ").await.unwrap();
        assert_eq!(d.pattern_name, "custom_password");
    }

    #[tokio::test]
    async fn no_match_returns_none() {
        let detector = PromptDetector::new();
        assert!(detector.detect("just some normal output\n").await.is_none());
    }

    #[tokio::test]
    async fn only_evaluates_last_n_lines() {
        let detector = PromptDetector::with_context_lines(2);
        let mut buf = String::new();
        for i in 0..20 {
            buf.push_str(&format!("[sudo] password for user:{i}\n"));
        }
        buf.push_str("unrelated\nunrelated\n");
        assert!(detector.detect(&buf).await.is_none());
    }
}
