//! Operator-facing progress of migrations.
//!
//! A migration is a task, its stages are subtasks. Output that is not progress (worker logs,
//! remote command stderr) goes through the task's [`Printer`], so it never corrupts the progress
//! output.

use std::time::Duration;

use enum_dispatch::enum_dispatch;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;

pub mod transfer;

/// Selects the [`ProgressTracker`] backend: `std` (default), `simple`, `json` or `off`.
pub const PVSHIFT_PROGRESS_ENV: &str = "PVSHIFT_PROGRESS_MODE";

const TICK: Duration = Duration::from_millis(80);

#[enum_dispatch]
pub trait Progress: Sized {
    /// Starts a stage of this task.
    fn subtask(&self, text: &str) -> Self;

    fn success(&mut self, msg: Option<&str>);

    /// Also what happens to a task dropped before it finished.
    fn failure(&mut self, msg: Option<&str>);

    /// Where lines that are not progress should be written.
    fn printer(&self) -> Printer;
}

#[derive(Debug)]
#[enum_dispatch(Progress)]
pub enum ProgressTracker {
    /// Spinners, one line per stage.
    SpinnerProgress(SpinnerProgress),
    /// Plain lines, for logs and dumb terminals.
    SimpleProgress(SimpleProgress),
    /// One [`ProgressMessage`] per stdout line.
    JsonProgress(JsonProgress),
    NullProgress(NullProgress),
}

impl ProgressTracker {
    /// The backend selected by [`PVSHIFT_PROGRESS_ENV`], spinners when unset or unknown.
    pub fn from_env(text: &str) -> Self {
        match std::env::var(PVSHIFT_PROGRESS_ENV).as_deref() {
            Ok("simple" | "dumb") => SimpleProgress::new(text).into(),
            Ok("json") => JsonProgress::new(text).into(),
            Ok("off") => NullProgress.into(),
            _ => SpinnerProgress::new(text).into(),
        }
    }
}

/// Sink for output lines that are not progress.
#[derive(Debug, Clone)]
pub enum Printer {
    /// Printed above the spinners, which are redrawn below.
    AboveSpinners(MultiProgress),
    Stdout,
    Stderr,
}

impl Printer {
    pub fn println(&self, line: &str) {
        match self {
            Printer::AboveSpinners(root) if !root.is_hidden() => {
                if root.println(line).is_err() {
                    eprintln!("{line}");
                }
            }
            // Nothing is drawn when stderr is not a terminal, so the line goes there directly.
            Printer::AboveSpinners(_) | Printer::Stderr => eprintln!("{line}"),
            Printer::Stdout => println!("{line}"),
        }
    }
}

#[derive(Debug)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn subtask(&self, _: &str) -> NullProgress {
        NullProgress
    }

    fn success(&mut self, _: Option<&str>) {}

    fn failure(&mut self, _: Option<&str>) {}

    fn printer(&self) -> Printer {
        Printer::Stderr
    }
}

#[derive(Debug)]
pub struct SimpleProgress {
    depth: usize,
}

impl SimpleProgress {
    fn new(text: &str) -> Self {
        println!("{text}");
        SimpleProgress { depth: 0 }
    }

    fn indent(&self) -> String {
        "  ".repeat(self.depth)
    }
}

impl Progress for SimpleProgress {
    fn subtask(&self, text: &str) -> SimpleProgress {
        let task = SimpleProgress {
            depth: self.depth + 1,
        };
        println!("{}{text}", task.indent());
        task
    }

    fn success(&mut self, msg: Option<&str>) {
        if let Some(msg) = msg {
            println!("{}{msg}", self.indent());
        }
    }

    fn failure(&mut self, msg: Option<&str>) {
        if let Some(msg) = msg {
            println!("{}failed: {msg}", self.indent());
        }
    }

    fn printer(&self) -> Printer {
        Printer::Stdout
    }
}

/// Reports tasks as json lines on stdout.
///
/// Tasks are identified by their path: the migration first, then the stage.
#[derive(Debug)]
pub struct JsonProgress {
    path: Vec<String>,
    done: bool,
}

impl JsonProgress {
    pub fn new(text: &str) -> Self {
        JsonProgress::started(vec![text.to_owned()])
    }

    fn started(path: Vec<String>) -> Self {
        ProgressMessage::TaskStarted { path: path.clone() }.print();
        JsonProgress { path, done: false }
    }

    fn finish(&mut self, success: bool, msg: Option<&str>) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }

        ProgressMessage::TaskFinished {
            path: self.path.clone(),
            success,
            message: msg.map(ToOwned::to_owned),
        }
        .print();
    }
}

impl Progress for JsonProgress {
    fn subtask(&self, text: &str) -> JsonProgress {
        let mut path = self.path.clone();
        path.push(text.to_owned());
        JsonProgress::started(path)
    }

    fn success(&mut self, msg: Option<&str>) {
        self.finish(true, msg);
    }

    fn failure(&mut self, msg: Option<&str>) {
        self.finish(false, msg);
    }

    fn printer(&self) -> Printer {
        Printer::Stderr
    }
}

impl Drop for JsonProgress {
    fn drop(&mut self) {
        self.finish(false, None);
    }
}

fn spinner(depth: usize, text: &str) -> ProgressBar {
    let template = format!("{}{{spinner}} {{msg}}", "  ".repeat(depth));
    let style = ProgressStyle::default_spinner();
    let style = style.clone().template(&template).unwrap_or(style);

    let bar = ProgressBar::hidden().with_style(style);
    bar.set_message(text.to_owned());
    bar
}

#[derive(Debug)]
pub struct SpinnerProgress {
    root: MultiProgress,
    bar: ProgressBar,
    depth: usize,
    done: bool,
}

impl SpinnerProgress {
    fn new(text: &str) -> Self {
        SpinnerProgress::below(MultiProgress::new(), 0, text)
    }

    fn below(root: MultiProgress, depth: usize, text: &str) -> Self {
        let bar = root.add(spinner(depth, text));
        bar.enable_steady_tick(TICK);

        SpinnerProgress {
            root,
            bar,
            depth,
            done: false,
        }
    }

    /// Draws `bar` with the spinners of this migration.
    pub fn attach(&self, bar: ProgressBar) -> ProgressBar {
        self.root.add(bar)
    }
}

impl Progress for SpinnerProgress {
    fn subtask(&self, text: &str) -> SpinnerProgress {
        SpinnerProgress::below(self.root.clone(), self.depth + 1, text)
    }

    fn success(&mut self, msg: Option<&str>) {
        self.done = true;
        let msg = msg.map_or_else(|| self.bar.message(), ToOwned::to_owned);
        self.bar.finish_with_message(format!("✓ {msg}"));
    }

    fn failure(&mut self, msg: Option<&str>) {
        self.done = true;
        let msg = msg.map_or_else(|| self.bar.message(), ToOwned::to_owned);
        self.bar.abandon_with_message(format!("x {msg}"));
    }

    fn printer(&self) -> Printer {
        Printer::AboveSpinners(self.root.clone())
    }
}

impl Drop for SpinnerProgress {
    fn drop(&mut self) {
        if !self.done {
            self.failure(None);
        }
    }
}

/// A line of [`JsonProgress`] output.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ProgressMessage {
    TaskStarted {
        path: Vec<String>,
    },
    TaskFinished {
        path: Vec<String>,
        success: bool,
        message: Option<String>,
    },
}

impl ProgressMessage {
    fn print(&self) {
        if let Ok(line) = serde_json::to_string(self) {
            println!("{line}");
        }
    }
}
