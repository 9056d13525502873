// Events that flow from the shell hook into the ingestion pipeline
//
// A `CommandEvent` is the unit of ingestion: one executed command, reported
// by the shell hook at command end as a single NDJSON object. Validation is
// synchronous and happens before the event touches the queue; lossy UTF-8
// sanitation guarantees that nothing downstream ever sees invalid bytes or
// NULs.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Compiled event version. Events with any other `v` are rejected.
pub const EVENT_VERSION: u32 = 1;

/// The only event type the engine ingests.
pub const EVENT_TYPE_COMMAND_END: &str = "command_end";

/// Shells the hook shims support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
}

impl Shell {
    pub fn as_str(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Zsh => "zsh",
            Shell::Fish => "fish",
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Shell {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bash" => Ok(Shell::Bash),
            "zsh" => Ok(Shell::Zsh),
            "fish" => Ok(Shell::Fish),
            other => Err(EngineError::InvalidInput(format!(
                "unsupported shell {other:?} (expected bash, zsh or fish)"
            ))),
        }
    }
}

/// One executed command, as reported by the shell hook.
///
/// Wire format is NDJSON, one object per line; field names follow the hook
/// protocol (`v`, `type`, `ts`, ...). The `truncated` flag is computed by
/// the engine during sanitation and never travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    #[serde(rename = "v")]
    pub version: u32,

    #[serde(rename = "type")]
    pub kind: String,

    /// Event timestamp, Unix milliseconds.
    #[serde(rename = "ts")]
    pub ts_ms: i64,

    pub session_id: String,
    pub shell: Shell,
    pub cwd: String,
    pub cmd_raw: String,

    #[serde(default)]
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    /// Ephemeral events are acknowledged but never persisted.
    #[serde(default)]
    pub ephemeral: bool,

    #[serde(skip)]
    pub truncated: bool,
}

impl CommandEvent {
    /// Parse a single NDJSON line and validate it.
    pub fn from_json_line(line: &str) -> Result<Self> {
        let event: CommandEvent = serde_json::from_str(line)
            .map_err(|e| EngineError::InvalidInput(format!("malformed event json: {e}")))?;
        event.validate()?;
        Ok(event)
    }

    /// Serialize back to a single NDJSON line (no trailing newline).
    pub fn to_json_line(&self) -> String {
        // CommandEvent contains no map types, so serialization cannot fail.
        serde_json::to_string(self).expect("event serializes")
    }

    /// Synchronous validation with a field-specific error message.
    pub fn validate(&self) -> Result<()> {
        if self.version != EVENT_VERSION {
            return Err(EngineError::InvalidInput(format!(
                "unsupported event version {} (expected {})",
                self.version, EVENT_VERSION
            )));
        }
        if self.kind != EVENT_TYPE_COMMAND_END {
            return Err(EngineError::InvalidInput(format!(
                "unsupported event type {:?}",
                self.kind
            )));
        }
        if self.session_id.is_empty() {
            return Err(EngineError::InvalidInput("session_id is empty".into()));
        }
        if self.cwd.is_empty() {
            return Err(EngineError::InvalidInput("cwd is empty".into()));
        }
        if self.cmd_raw.is_empty() {
            return Err(EngineError::InvalidInput("cmd_raw is empty".into()));
        }
        if self.ts_ms <= 0 {
            return Err(EngineError::InvalidInput(format!(
                "ts must be positive, got {}",
                self.ts_ms
            )));
        }
        Ok(())
    }

    /// Apply lossy UTF-8 sanitation and the length cap to `cmd_raw`.
    ///
    /// Sets `truncated` when the command exceeded `max_bytes`.
    pub fn sanitize(&mut self, max_bytes: usize) {
        if let Cow::Owned(clean) = sanitize_utf8(self.cmd_raw.as_bytes()) {
            self.cmd_raw = clean;
        }
        if self.cmd_raw.len() > max_bytes {
            let cut = truncate_utf8_safe(&self.cmd_raw, max_bytes).len();
            self.cmd_raw.truncate(cut);
            self.truncated = true;
        }
    }
}

/// Lossy UTF-8 conversion for hook-supplied bytes.
///
/// Valid UTF-8 without NUL passes through borrowed (the fast path does not
/// allocate). Each invalid byte sequence and each NUL byte becomes a single
/// U+FFFD replacement character.
pub fn sanitize_utf8(bytes: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.contains('\0') => Cow::Borrowed(s),
        Ok(s) => Cow::Owned(s.replace('\0', "\u{FFFD}")),
        Err(_) => {
            let lossy = String::from_utf8_lossy(bytes);
            if lossy.contains('\0') {
                Cow::Owned(lossy.replace('\0', "\u{FFFD}"))
            } else {
                Cow::Owned(lossy.into_owned())
            }
        }
    }
}

/// Safely truncate a string to at most `max_bytes` while respecting UTF-8
/// boundaries.
pub fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
pub(crate) fn sample_event() -> CommandEvent {
    CommandEvent {
        version: EVENT_VERSION,
        kind: EVENT_TYPE_COMMAND_END.into(),
        ts_ms: 1_700_000_000_000,
        session_id: "sess-1".into(),
        shell: Shell::Zsh,
        cwd: "/home/user/project".into(),
        cmd_raw: "git status".into(),
        exit_code: 0,
        duration_ms: Some(42),
        repo_key: Some("github.com/user/project".into()),
        branch: Some("main".into()),
        ephemeral: false,
        truncated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_json() {
        let event = sample_event();
        let line = event.to_json_line();
        let parsed = CommandEvent::from_json_line(&line).unwrap();
        assert_eq!(parsed.session_id, event.session_id);
        assert_eq!(parsed.cmd_raw, event.cmd_raw);
        assert_eq!(parsed.shell, Shell::Zsh);
        assert!(!parsed.truncated);
    }

    #[test]
    fn test_minimal_wire_event_defaults() {
        let line = r#"{"v":1,"type":"command_end","ts":1000,"session_id":"s","shell":"bash","cwd":"/tmp","cmd_raw":"ls"}"#;
        let parsed = CommandEvent::from_json_line(line).unwrap();
        assert_eq!(parsed.exit_code, 0);
        assert!(!parsed.ephemeral);
        assert!(parsed.duration_ms.is_none());
        assert!(parsed.repo_key.is_none());
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut event = sample_event();
        event.version = 2;
        assert!(matches!(
            event.validate(),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_empty_required_fields() {
        for field in ["session_id", "cwd", "cmd_raw"] {
            let mut event = sample_event();
            match field {
                "session_id" => event.session_id.clear(),
                "cwd" => event.cwd.clear(),
                _ => event.cmd_raw.clear(),
            }
            let err = event.validate().unwrap_err();
            assert!(err.to_string().contains(field), "error names {field}");
        }
    }

    #[test]
    fn test_rejects_unknown_shell() {
        let line = r#"{"v":1,"type":"command_end","ts":1000,"session_id":"s","shell":"csh","cwd":"/tmp","cmd_raw":"ls"}"#;
        assert!(CommandEvent::from_json_line(line).is_err());
    }

    #[test]
    fn test_rejects_non_positive_timestamp() {
        let mut event = sample_event();
        event.ts_ms = 0;
        assert!(event.validate().is_err());
    }

    #[test]
    fn test_sanitize_valid_utf8_is_borrowed() {
        let input = "echo héllo 🚀".as_bytes();
        match sanitize_utf8(input) {
            Cow::Borrowed(s) => assert_eq!(s, "echo héllo 🚀"),
            Cow::Owned(_) => panic!("fast path must not allocate"),
        }
    }

    #[test]
    fn test_sanitize_replaces_nul_bytes() {
        let out = sanitize_utf8(b"echo \x00hi");
        assert_eq!(out, "echo \u{FFFD}hi");
        assert!(!out.contains('\0'));
    }

    #[test]
    fn test_sanitize_replaces_invalid_sequences() {
        // 0xFF is never valid UTF-8
        let out = sanitize_utf8(b"ls \xff\xfe -la");
        assert!(out.chars().all(|c| c != '\0'));
        assert!(out.contains('\u{FFFD}'));
        assert!(std::str::from_utf8(out.as_bytes()).is_ok());
    }

    #[test]
    fn test_sanitize_identity_iff_clean() {
        let clean = "plain ascii".as_bytes();
        assert_eq!(sanitize_utf8(clean), "plain ascii");
        let dirty = b"a\x00b";
        assert_ne!(sanitize_utf8(dirty).as_bytes(), dirty.as_ref());
    }

    #[test]
    fn test_sanitize_event_sets_truncated_flag() {
        let mut event = sample_event();
        event.cmd_raw = "x".repeat(100);
        event.sanitize(10);
        assert_eq!(event.cmd_raw.len(), 10);
        assert!(event.truncated);

        let mut short = sample_event();
        short.sanitize(4096);
        assert!(!short.truncated);
    }

    #[test]
    fn test_truncate_at_utf8_boundary() {
        let s = "日本語";
        assert_eq!(truncate_utf8_safe(s, 4), "日");
        assert_eq!(truncate_utf8_safe(s, 6), "日本");
        assert_eq!(truncate_utf8_safe("hello", 10), "hello");
    }
}
