//! Failure signatures for target commands.
//!
//! Matching is case-insensitive substring search over the captured output
//! of a failed run.

use crate::error::TunnelkitError;
use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Longest failure reason stored in patch history.
pub const MAX_FAILURE_REASON_LEN: usize = 256;

/// How long `<program> --help` may take while probing yolo arguments.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Signals that indicate the binary itself is broken.
const FATAL_SIGNALS: &[Signal] = &[
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGSYS,
    Signal::SIGTRAP,
];

const CRASH_PATTERNS: &[&str] = &[
    "not a valid executable",
    "exec format error",
    "cannot execute binary",
    "bad cpu type",
    "killed",
    "segmentation fault",
    "bus error",
    "illegal instruction",
    "abort",
];

const YOLO_REJECTIONS: &[&str] = &[
    "unknown",
    "unrecognized",
    "not supported",
    "invalid",
    "flag provided but not defined",
];

/// Whether `output` shows the target rejecting its yolo arguments.
pub fn is_unsupported_flag_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.contains("yolo") && YOLO_REJECTIONS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    if lower.contains("approval_policy") && lower.contains("not in the allowed set") {
        return true;
    }
    lower.contains("ask-for-approval") && (lower.contains("unknown") || lower.contains("unrecognized"))
}

/// Whether a failed run looks like a broken binary rather than a normal
/// non-zero exit.
///
/// Only failures originating in the target itself qualify; proxy failures
/// and cancellation never do.
pub fn is_crash_signature(err: &TunnelkitError, output: &str) -> bool {
    match err {
        TunnelkitError::TargetSpawn { .. } => return true,
        TunnelkitError::TargetExit(status) => {
            if let Some(Ok(signal)) = status.signal().map(Signal::try_from) {
                if FATAL_SIGNALS.contains(&signal) {
                    return true;
                }
            }
        }
        _ => return false,
    }
    let lower = output.to_lowercase();
    CRASH_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Remove yolo-enabling arguments (and the values of those that take one).
pub fn strip_yolo_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--yolo" | "--dangerously-bypass-approvals-and-sandbox" => {}
            "--ask-for-approval" | "--sandbox" => {
                iter.next();
            }
            _ => out.push(arg.clone()),
        }
    }
    out
}

/// Short description of a failure for patch history.
///
/// Joins the error and trimmed output with `": "` and truncates to
/// [`MAX_FAILURE_REASON_LEN`] characters.
pub fn format_failure_reason(err: Option<&TunnelkitError>, output: &str) -> String {
    let mut parts = Vec::with_capacity(2);
    if let Some(err) = err {
        parts.push(err.to_string());
    }
    let output = output.trim();
    if !output.is_empty() {
        parts.push(output.to_string());
    }
    let reason = parts.join(": ");
    if reason.chars().count() > MAX_FAILURE_REASON_LEN {
        let mut truncated: String = reason.chars().take(MAX_FAILURE_REASON_LEN - 3).collect();
        truncated.push_str("...");
        truncated
    } else {
        reason
    }
}

/// Pick the arguments that put `program` into yolo mode, based on its
/// `--help` output. Empty when no known mechanism is listed.
pub async fn probe_yolo_args(program: &str) -> Vec<String> {
    let output = Command::new(program)
        .arg("--help")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let help = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&out.stderr));
            text
        }
        Ok(Err(e)) => {
            debug!("{} --help failed: {}", program, e);
            return Vec::new();
        }
        Err(_) => {
            debug!("{} --help timed out", program);
            return Vec::new();
        }
    };
    yolo_args_from_help(&help)
}

fn yolo_args_from_help(help: &str) -> Vec<String> {
    let args: &[&str] = if help.contains("--yolo") {
        &["--yolo"]
    } else if help.contains("--ask-for-approval") {
        if help.contains("--sandbox") {
            &["--ask-for-approval", "never", "--sandbox", "danger-full-access"]
        } else {
            &["--ask-for-approval", "never"]
        }
    } else if help.contains("--dangerously-bypass-approvals-and-sandbox") {
        &["--dangerously-bypass-approvals-and-sandbox"]
    } else {
        &[]
    };
    args.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::process::ExitStatus;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_unsupported_flag_signatures() {
        assert!(is_unsupported_flag_failure("error: unknown flag: --yolo"));
        assert!(is_unsupported_flag_failure("flag provided but not defined: -yolo"));
        assert!(is_unsupported_flag_failure("YOLO mode is NOT SUPPORTED here"));
        assert!(is_unsupported_flag_failure(
            "approval_policy 'never' is not in the allowed set"
        ));
        assert!(is_unsupported_flag_failure("unrecognized option --ask-for-approval"));
        assert!(!is_unsupported_flag_failure("connection reset by peer"));
        assert!(!is_unsupported_flag_failure("yolo"));
        assert!(!is_unsupported_flag_failure("--ask-for-approval: value required"));
    }

    #[test]
    fn test_crash_signature_spawn_error() {
        let err = TunnelkitError::TargetSpawn {
            program: "codex".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(is_crash_signature(&err, ""));
    }

    #[test]
    fn test_crash_signature_fatal_signal() {
        let segv = TunnelkitError::TargetExit(ExitStatus::from_raw(Signal::SIGSEGV as i32));
        assert!(is_crash_signature(&segv, ""));

        let int = TunnelkitError::TargetExit(ExitStatus::from_raw(Signal::SIGINT as i32));
        assert!(!is_crash_signature(&int, ""));
    }

    #[test]
    fn test_crash_signature_output_patterns() {
        // exit code 1 is encoded as 1 << 8 in a raw wait status
        let exit1 = TunnelkitError::TargetExit(ExitStatus::from_raw(1 << 8));
        assert!(is_crash_signature(&exit1, "zsh: exec format error: ./codex"));
        assert!(is_crash_signature(&exit1, "Segmentation fault (core dumped)"));
        assert!(!is_crash_signature(&exit1, "error: invalid api key"));
        assert!(!is_crash_signature(&TunnelkitError::Cancelled, "killed"));
    }

    #[test]
    fn test_strip_yolo_args() {
        let args = strings(&[
            "--yolo",
            "exec",
            "--ask-for-approval",
            "never",
            "--sandbox",
            "danger-full-access",
            "--dangerously-bypass-approvals-and-sandbox",
            "prompt",
        ]);
        assert_eq!(strip_yolo_args(&args), strings(&["exec", "prompt"]));
        assert_eq!(strip_yolo_args(&strings(&["--sandbox"])), Vec::<String>::new());
        assert!(strip_yolo_args(&[]).is_empty());
    }

    #[test]
    fn test_format_failure_reason() {
        let err = TunnelkitError::Cancelled;
        assert_eq!(
            format_failure_reason(Some(&err), "  boom \n"),
            "Operation cancelled: boom"
        );
        assert_eq!(format_failure_reason(None, "   "), "");

        let long = "x".repeat(400);
        let reason = format_failure_reason(None, &long);
        assert_eq!(reason.len(), MAX_FAILURE_REASON_LEN);
        assert!(reason.ends_with("..."));
    }

    #[test]
    fn test_yolo_args_from_help() {
        assert_eq!(yolo_args_from_help("  --yolo  skip approvals"), strings(&["--yolo"]));
        assert_eq!(
            yolo_args_from_help("--ask-for-approval <POLICY>\n--sandbox <MODE>"),
            strings(&["--ask-for-approval", "never", "--sandbox", "danger-full-access"])
        );
        assert_eq!(
            yolo_args_from_help("--ask-for-approval <POLICY>"),
            strings(&["--ask-for-approval", "never"])
        );
        assert_eq!(
            yolo_args_from_help("--dangerously-bypass-approvals-and-sandbox"),
            strings(&["--dangerously-bypass-approvals-and-sandbox"])
        );
        assert!(yolo_args_from_help("usage: tool [options]").is_empty());
    }

    #[tokio::test]
    async fn test_probe_yolo_args_missing_program() {
        assert!(probe_yolo_args("/nonexistent/codex-binary").await.is_empty());
    }
}
