// Shell-hook environment surface
//
// The shell shims report a finished command by exporting `CLAI_*` variables
// and invoking the hook entry point. This module turns that surface into a
// validated `CommandEvent`. Policy for the shim: a missing daemon or a
// deliberate no-record is silent success (the shell prompt must never pay
// for our problems); only invalid arguments are an error.

use crate::error::{EngineError, Result};
use crate::events::{sanitize_utf8, CommandEvent, Shell, EVENT_TYPE_COMMAND_END, EVENT_VERSION};
use std::str::FromStr;

pub const ENV_CMD: &str = "CLAI_CMD";
pub const ENV_CWD: &str = "CLAI_CWD";
pub const ENV_EXIT: &str = "CLAI_EXIT";
pub const ENV_TS: &str = "CLAI_TS";
pub const ENV_SHELL: &str = "CLAI_SHELL";
pub const ENV_SESSION_ID: &str = "CLAI_SESSION_ID";
pub const ENV_DURATION_MS: &str = "CLAI_DURATION_MS";
pub const ENV_EPHEMERAL: &str = "CLAI_EPHEMERAL";
pub const ENV_NO_RECORD: &str = "CLAI_NO_RECORD";

/// Build an event from the process environment.
///
/// Returns `Ok(None)` when `CLAI_NO_RECORD=1` asks for a silent drop.
pub fn event_from_env() -> Result<Option<CommandEvent>> {
    event_from_vars(|name| std::env::var(name).ok())
}

/// Build an event from an arbitrary variable lookup (testable seam).
pub fn event_from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Option<CommandEvent>> {
    if get(ENV_NO_RECORD).as_deref() == Some("1") {
        return Ok(None);
    }

    let required = |name: &str| -> Result<String> {
        get(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| EngineError::InvalidInput(format!("{name} is not set")))
    };

    let cmd_raw = sanitize_utf8(required(ENV_CMD)?.as_bytes()).into_owned();
    let cwd = required(ENV_CWD)?;
    let session_id = required(ENV_SESSION_ID)?;
    let shell = Shell::from_str(&required(ENV_SHELL)?)?;
    let ts_ms = parse_int::<i64>(ENV_TS, &required(ENV_TS)?)?;
    let exit_code = parse_int::<i32>(ENV_EXIT, &required(ENV_EXIT)?)?;
    let duration_ms = match get(ENV_DURATION_MS) {
        Some(raw) if !raw.is_empty() => Some(parse_int::<u64>(ENV_DURATION_MS, &raw)?),
        _ => None,
    };
    let ephemeral = get(ENV_EPHEMERAL).as_deref() == Some("1");

    let event = CommandEvent {
        version: EVENT_VERSION,
        kind: EVENT_TYPE_COMMAND_END.into(),
        ts_ms,
        session_id,
        shell,
        cwd,
        cmd_raw,
        exit_code,
        duration_ms,
        repo_key: None,
        branch: None,
        ephemeral,
        truncated: false,
    };
    event.validate()?;
    Ok(Some(event))
}

fn parse_int<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| EngineError::InvalidInput(format!("{name} is not a valid integer: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            (ENV_CMD, "git status".to_string()),
            (ENV_CWD, "/home/user/project".to_string()),
            (ENV_EXIT, "0".to_string()),
            (ENV_TS, "1700000000000".to_string()),
            (ENV_SHELL, "zsh".to_string()),
            (ENV_SESSION_ID, "sess-1".to_string()),
        ])
    }

    fn build(vars: &HashMap<&'static str, String>) -> Result<Option<CommandEvent>> {
        event_from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_complete_environment_builds_event() {
        let event = build(&base_vars()).unwrap().expect("event produced");
        assert_eq!(event.cmd_raw, "git status");
        assert_eq!(event.shell, Shell::Zsh);
        assert_eq!(event.exit_code, 0);
        assert!(!event.ephemeral);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_no_record_drops_silently() {
        let mut vars = base_vars();
        vars.insert(ENV_NO_RECORD, "1".to_string());
        assert!(build(&vars).unwrap().is_none());
    }

    #[test]
    fn test_missing_required_var_is_invalid_input() {
        for missing in [ENV_CMD, ENV_CWD, ENV_EXIT, ENV_TS, ENV_SHELL, ENV_SESSION_ID] {
            let mut vars = base_vars();
            vars.remove(missing);
            let err = build(&vars).unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidInput(_)),
                "{missing}: {err}"
            );
        }
    }

    #[test]
    fn test_optional_fields() {
        let mut vars = base_vars();
        vars.insert(ENV_DURATION_MS, "125".to_string());
        vars.insert(ENV_EPHEMERAL, "1".to_string());
        let event = build(&vars).unwrap().unwrap();
        assert_eq!(event.duration_ms, Some(125));
        assert!(event.ephemeral);
    }

    #[test]
    fn test_bad_integer_is_invalid_input() {
        let mut vars = base_vars();
        vars.insert(ENV_TS, "not-a-number".to_string());
        assert!(matches!(
            build(&vars).unwrap_err(),
            EngineError::InvalidInput(_)
        ));
    }

    #[test]
    fn test_command_is_sanitized() {
        let mut vars = base_vars();
        vars.insert(ENV_CMD, "echo \u{0}hi".to_string());
        let event = build(&vars).unwrap().unwrap();
        assert_eq!(event.cmd_raw, "echo \u{FFFD}hi");
    }
}
