// Command normalizer - canonical templates and stable template identifiers
//
// The normalizer turns a raw command line into its argument-elided template
// (`cmd_norm`) plus a stable identifier (`template_id`, the SHA-256 of the
// template). Two raw commands that differ only in casing, whitespace or
// variable arguments collapse to the same template, which is what the
// frequency and transition statistics aggregate over.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// Placeholder substituted for path-like arguments.
pub const PLACEHOLDER_PATH: &str = "<path>";
/// Placeholder substituted for URL-like arguments.
pub const PLACEHOLDER_URL: &str = "<url>";
/// Placeholder substituted for purely numeric arguments.
pub const PLACEHOLDER_NUM: &str = "<num>";

fn num_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]+$").expect("valid regex"))
}

fn env_assign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("valid regex"))
}

/// The result of normalizing a raw command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// Lower-cased, whitespace-collapsed, argument-elided template.
    pub cmd_norm: String,
    /// Lower-case hex SHA-256 of `cmd_norm`. A pure function of the
    /// template: identical templates always yield identical ids.
    pub template_id: String,
    /// Number of placeholder substitutions performed.
    pub slot_count: u32,
}

/// Normalize a raw command into its template form.
///
/// Deterministic and pure. Substitution rules are applied per non-initial
/// token, first match wins:
///
/// 1. `-`-prefixed tokens are flags and kept verbatim.
/// 2. `/`- or `~`-prefixed tokens become `<path>`.
/// 3. Tokens containing `://` become `<url>`.
/// 4. All-digit tokens become `<num>`.
/// 5. Everything else is kept verbatim.
pub fn normalize(raw: &str) -> Normalized {
    let lowered = raw.to_lowercase();
    let mut tokens = lowered.split_whitespace();
    let mut slot_count = 0u32;
    let mut parts: Vec<&str> = Vec::new();

    if let Some(first) = tokens.next() {
        parts.push(first);
    }
    for token in tokens {
        let mapped = classify_token(token);
        if mapped != token {
            slot_count += 1;
        }
        parts.push(mapped);
    }

    let cmd_norm = parts.join(" ");
    let template_id = template_id_of(&cmd_norm);
    Normalized {
        cmd_norm,
        template_id,
        slot_count,
    }
}

fn classify_token(token: &str) -> &str {
    if token.starts_with('-') {
        token
    } else if token.starts_with('/') || token.starts_with('~') {
        PLACEHOLDER_PATH
    } else if token.contains("://") {
        PLACEHOLDER_URL
    } else if num_re().is_match(token) {
        PLACEHOLDER_NUM
    } else {
        token
    }
}

/// Lower-case hex SHA-256 of the template's UTF-8 bytes.
pub fn template_id_of(cmd_norm: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cmd_norm.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First token of a command after stripping leading `KEY=value` environment
/// assignments. Used for tool-affinity scoring: `FOO=1 git push` and
/// `git status` share the tool prefix `git`.
pub fn tool_prefix(cmd: &str) -> Option<&str> {
    cmd.split_whitespace()
        .find(|token| !env_assign_re().is_match(token))
}
