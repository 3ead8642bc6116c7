//! Line-oriented command scripts with single-level `repeat`/`end` loops.
//!
//! ```text
//! setBias 0.5
//! repeat 3
//! addZ 1e-10
//! wait 0.5
//! end
//! ```
//!
//! A script runs on its own worker thread. Each command line is dispatched
//! through the shared [`Dispatcher`], and progress is reported as
//! [`ScriptEvent`]s over a channel.

use crate::dispatcher::Dispatcher;
use crate::error::NanonisError;
use crate::nanonis::Transport;
use crossbeam_channel::Sender;
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptLine {
    /// Empty or single-character line
    Blank,
    Repeat(u32),
    End,
    Command {
        alias: String,
        args: Vec<String>,
        /// Trimmed source line, reported in events
        text: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    lines: Vec<ScriptLine>,
}

impl Script {
    /// Parse script text. Only malformed `repeat` counts are rejected; unknown
    /// aliases are left for the dispatcher to judge.
    pub fn parse(text: &str) -> Result<Self, NanonisError> {
        let lines = text
            .split('\n')
            .enumerate()
            .map(|(index, raw)| parse_line(index + 1, raw.strip_suffix('\r').unwrap_or(raw)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { lines })
    }

    pub fn lines(&self) -> &[ScriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of lines that dispatch a command (ignoring loops)
    pub fn command_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|line| matches!(line, ScriptLine::Command { .. }))
            .count()
    }
}

fn parse_line(number: usize, line: &str) -> Result<ScriptLine, NanonisError> {
    let trimmed = line.trim();
    if trimmed.chars().count() <= 1 {
        return Ok(ScriptLine::Blank);
    }

    let mut tokens = trimmed.split_whitespace();
    let alias = tokens.next().unwrap_or_default();
    let args: Vec<String> = tokens.map(str::to_string).collect();

    match alias {
        "repeat" => {
            let count = args.first().ok_or_else(|| NanonisError::Script {
                line: number,
                message: "repeat needs a count".to_string(),
            })?;
            let count = count.parse::<u32>().map_err(|_| NanonisError::Script {
                line: number,
                message: format!("repeat count '{count}' is not a non-negative integer"),
            })?;
            Ok(ScriptLine::Repeat(count))
        }
        "end" => Ok(ScriptLine::End),
        _ => Ok(ScriptLine::Command {
            alias: alias.to_string(),
            args,
            text: trimmed.to_string(),
        }),
    }
}

/// Progress notification emitted by a running script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum ScriptEvent {
    /// A command line is about to be dispatched
    Request(String),
    /// Non-empty decoded response of the preceding request
    Response(String),
    Error(String),
}

impl ScriptEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ScriptEvent::Request(_) => "request",
            ScriptEvent::Response(_) => "response",
            ScriptEvent::Error(_) => "error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ScriptEvent::Request(m) | ScriptEvent::Response(m) | ScriptEvent::Error(m) => m,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Commands that returned successfully
    pub executed: usize,
    /// Commands that returned an error
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    CancelRequested,
    Stopped,
}

/// Execute `script` on the calling thread.
///
/// The dispatcher lock is held for one line at a time and `cancel` is checked
/// before every line. A failing command is reported and the script moves on.
pub fn run_script<T: Transport>(
    script: &Script,
    dispatcher: &Mutex<Dispatcher<T>>,
    events: &Sender<ScriptEvent>,
    cancel: &AtomicBool,
) -> RunSummary {
    let lines = script.lines();
    let mut summary = RunSummary::default();
    // (index of the first body line, remaining count)
    let mut active_loop: Option<(usize, u32)> = None;
    let mut pc = 0;

    while pc < lines.len() {
        if cancel.load(Ordering::SeqCst) {
            info!("Script cancelled before line {}", pc + 1);
            summary.cancelled = true;
            break;
        }

        match &lines[pc] {
            ScriptLine::Blank => {}
            ScriptLine::Repeat(count) => {
                debug!("Loop start at line {} ({count})", pc + 1);
                active_loop = Some((pc + 1, *count));
            }
            ScriptLine::End => match active_loop {
                None => {}
                Some((_, 0)) => active_loop = None,
                Some((start, remaining)) => {
                    let remaining = remaining - 1;
                    active_loop = Some((start, remaining));
                    if remaining > 0 {
                        pc = start;
                        continue;
                    }
                }
            },
            ScriptLine::Command { alias, args, text } => {
                let _ = events.send(ScriptEvent::Request(text.clone()));
                let result = dispatcher.lock().execute(alias, args);
                match result {
                    Ok(response) => {
                        summary.executed += 1;
                        if !response.is_empty() {
                            let _ = events.send(ScriptEvent::Response(response.to_string()));
                        }
                    }
                    Err(e) => {
                        summary.failed += 1;
                        error!("Line {} '{text}' failed: {e}", pc + 1);
                        let _ = events.send(ScriptEvent::Error(format!("{text}: {e}")));
                    }
                }
            }
        }
        pc += 1;
    }

    info!(
        "Script finished: {} executed, {} failed{}",
        summary.executed,
        summary.failed,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    summary
}

/// Spawns scripts on a worker thread
pub struct ScriptRunner;

impl ScriptRunner {
    pub fn spawn<T: Transport + 'static>(
        script: Script,
        dispatcher: Arc<Mutex<Dispatcher<T>>>,
        events: Sender<ScriptEvent>,
    ) -> Result<ScriptHandle, NanonisError> {
        Self::spawn_with_cancel(script, dispatcher, events, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`spawn`](Self::spawn), but observing an externally owned cancel flag
    /// (e.g. one set by a Ctrl+C handler).
    pub fn spawn_with_cancel<T: Transport + 'static>(
        script: Script,
        dispatcher: Arc<Mutex<Dispatcher<T>>>,
        events: Sender<ScriptEvent>,
        cancel: Arc<AtomicBool>,
    ) -> Result<ScriptHandle, NanonisError> {
        let flag = Arc::clone(&cancel);
        let thread = std::thread::Builder::new()
            .name("aunis-script".to_string())
            .spawn(move || run_script(&script, &dispatcher, &events, &flag))
            .map_err(|source| NanonisError::Io {
                source,
                context: "Failed to spawn script worker".to_string(),
            })?;

        Ok(ScriptHandle { cancel, thread })
    }
}

/// Handle to a script running on its worker thread
#[derive(Debug)]
pub struct ScriptHandle {
    cancel: Arc<AtomicBool>,
    thread: JoinHandle<RunSummary>,
}

impl ScriptHandle {
    /// Request a stop. The command in flight, if any, completes first.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn state(&self) -> RunState {
        if self.thread.is_finished() {
            RunState::Stopped
        } else if self.cancel.load(Ordering::SeqCst) {
            RunState::CancelRequested
        } else {
            RunState::Running
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> RunSummary {
        match self.thread.join() {
            Ok(summary) => summary,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, bundled_registry};
    use crossbeam_channel::{bounded, unbounded};

    fn shared() -> Arc<Mutex<Dispatcher<MockTransport>>> {
        let dispatcher = Dispatcher::new(bundled_registry(), MockTransport::connected())
            .with_sleeper(Box::new(|_| {}));
        Arc::new(Mutex::new(dispatcher))
    }

    fn run(text: &str) -> (Vec<String>, Vec<ScriptEvent>, RunSummary) {
        let dispatcher = shared();
        let (tx, rx) = unbounded();
        let script = Script::parse(text).unwrap();
        let summary = run_script(&script, &dispatcher, &tx, &AtomicBool::new(false));
        drop(tx);
        let commands = dispatcher.lock().transport().commands();
        (commands, rx.iter().collect(), summary)
    }

    #[test]
    fn test_parse_lines() {
        let script = Script::parse("getBias\r\n\n x \nrepeat 3\n  setBias 0.5  \nend").unwrap();
        assert_eq!(
            script.lines(),
            &[
                ScriptLine::Command {
                    alias: "getBias".to_string(),
                    args: vec![],
                    text: "getBias".to_string()
                },
                ScriptLine::Blank,
                ScriptLine::Blank,
                ScriptLine::Repeat(3),
                ScriptLine::Command {
                    alias: "setBias".to_string(),
                    args: vec!["0.5".to_string()],
                    text: "setBias 0.5".to_string()
                },
                ScriptLine::End,
            ]
        );
        assert_eq!(script.command_count(), 2);
    }

    #[test]
    fn test_bad_repeat_count_names_line() {
        for text in ["getBias\nrepeat x\nend", "getBias\nrepeat -1\nend", "getBias\nrepeat\nend"] {
            match Script::parse(text) {
                Err(NanonisError::Script { line, .. }) => assert_eq!(line, 2),
                other => panic!("expected script error for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_repeat_runs_body_count_times() {
        let (commands, _, summary) = run("repeat 2\ngetBias\nend");
        assert_eq!(commands, vec!["Bias.Get", "Bias.Get"]);
        assert_eq!(summary.executed, 2);

        let (commands, _, _) = run("repeat 1\ngetBias\nend\ngetZ");
        assert_eq!(commands, vec!["Bias.Get", "ZCtrl.ZPosGet"]);
    }

    #[test]
    fn test_repeat_zero_runs_once() {
        let (commands, _, _) = run("repeat 0\ngetBias\nend");
        assert_eq!(commands, vec!["Bias.Get"]);
    }

    #[test]
    fn test_inner_repeat_overwrites_outer() {
        let (commands, _, _) = run("repeat 2\ngetBias\nrepeat 3\ngetZ\nend\nend");
        assert_eq!(commands, vec!["Bias.Get", "ZCtrl.ZPosGet", "ZCtrl.ZPosGet", "ZCtrl.ZPosGet"]);
    }

    #[test]
    fn test_stray_end_ignored() {
        let (commands, _, _) = run("end\ngetBias\nend");
        assert_eq!(commands, vec!["Bias.Get"]);
    }

    #[test]
    fn test_blank_lines_produce_nothing() {
        let (commands, events, summary) = run("\n \n;\n\r\n");
        assert!(commands.is_empty());
        assert!(events.is_empty());
        assert_eq!(summary, RunSummary::default());
    }

    #[test]
    fn test_error_reported_and_script_continues() {
        let (commands, events, summary) = run("setBias high\ngetBias");
        assert_eq!(commands, vec!["Bias.Get"]);
        assert_eq!(summary.executed, 1);
        assert_eq!(summary.failed, 1);

        let kinds: Vec<_> = events.iter().map(ScriptEvent::kind).collect();
        assert_eq!(kinds, vec!["request", "error", "request", "response"]);
        assert_eq!(events[0].message(), "setBias high");
        assert!(events[1].message().starts_with("setBias high: "));
    }

    #[test]
    fn test_empty_response_emits_only_request() {
        let (_, events, _) = run("setBias 0.1");
        assert_eq!(events, vec![ScriptEvent::Request("setBias 0.1".to_string())]);
    }

    #[test]
    fn test_cancel_stops_before_next_line() {
        let dispatcher = shared();
        let (tx, rx) = bounded(0);
        let script = Script::parse("getBias\ngetBias\ngetBias").unwrap();
        let handle = ScriptRunner::spawn(script, Arc::clone(&dispatcher), tx).unwrap();

        assert_eq!(rx.recv().unwrap(), ScriptEvent::Request("getBias".to_string()));
        handle.cancel();
        assert_eq!(handle.state(), RunState::CancelRequested);
        assert_eq!(rx.recv().unwrap().kind(), "response");
        let rest: Vec<_> = rx.iter().collect();

        let summary = handle.join();
        assert!(rest.is_empty());
        assert!(summary.cancelled);
        assert_eq!(summary.executed, 1);
        assert_eq!(dispatcher.lock().transport().commands().len(), 1);
    }

    #[test]
    fn test_cancelled_before_start_sends_nothing() {
        let dispatcher = shared();
        let (tx, rx) = unbounded();
        let script = Script::parse("getBias").unwrap();
        let summary = run_script(&script, &dispatcher, &tx, &AtomicBool::new(true));
        assert!(summary.cancelled);
        assert!(rx.try_recv().is_err());
        assert!(dispatcher.lock().transport().frames.is_empty());
    }

    #[test]
    fn test_handle_reports_stopped() {
        let (tx, rx) = unbounded();
        let handle = ScriptRunner::spawn(Script::parse("getBias").unwrap(), shared(), tx).unwrap();
        let summary = handle.join();
        assert_eq!(summary.executed, 1);
        assert_eq!(rx.iter().count(), 2);
    }
}
