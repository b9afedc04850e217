//! Diagnostics hook.
//!
//! The fiber engine never prints on its own. Fatal contract violations and faults captured at the
//! trampoline are handed to a single `report` hook, which by default forwards to `tracing` at
//! error level. Embedders that route diagnostics elsewhere install their own hook.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Display;
use std::sync::RwLock;

type ReportHook = Box<dyn Fn(&str) + Send + Sync + 'static>;

static HOOK: RwLock<Option<ReportHook>> = RwLock::new(None);

/// Replaces the report hook for the whole process.
///
/// The hook runs while an internal read lock is held, so it must not call back into
/// [`set_report_hook`] or [`reset_report_hook`].
pub fn set_report_hook<F>(hook: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    let mut slot = HOOK.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(Box::new(hook));
}

/// Restores the default `tracing` sink.
pub fn reset_report_hook() {
    let mut slot = HOOK.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
}

pub fn report(text: &str) {
    let slot = HOOK.read().unwrap_or_else(|e| e.into_inner());
    match slot.as_ref() {
        Some(hook) => hook(text),
        None => tracing::error!(target: "cofiber::system", "{}", text),
    }
}

/// Renders a backtrace with every line indented by `prefix`.
///
/// Capture follows `RUST_LIB_BACKTRACE` / `RUST_BACKTRACE` unless `force` is set.
pub fn backtrace_to_string(force: bool, prefix: &str) -> String {
    let bt = if force {
        Backtrace::force_capture()
    } else {
        Backtrace::capture()
    };
    match bt.status() {
        BacktraceStatus::Captured => bt
            .to_string()
            .lines()
            .map(|line| format!("{prefix}{line}\n"))
            .collect(),
        BacktraceStatus::Disabled => format!("{prefix}<backtrace disabled>\n"),
        _ => format!("{prefix}<backtrace unsupported>\n"),
    }
}

/// Reports a broken invariant with a forced backtrace and aborts the process.
///
/// Used when the switching protocol cannot continue safely, so unwinding is not an option.
pub(crate) fn fatal(msg: impl Display) -> ! {
    report(&format!(
        "ASSERTION: {msg}\nbacktrace:\n{}",
        backtrace_to_string(true, "    ")
    ));
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtrace_lines_carry_prefix() {
        let text = backtrace_to_string(true, ">> ");
        assert!(!text.is_empty());
        assert!(text.lines().all(|line| line.starts_with(">> ")));
    }
}
