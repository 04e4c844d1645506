//! Index build progress reporting.
//!
//! A fresh build can take a while (extracting PDFs, embedding thousands of
//! chunks), so the builder reports what it is doing. Progress goes to
//! **stderr** so stdout stays the chat transcript.

use std::io::Write;
use std::path::PathBuf;

/// A single progress event emitted while acquiring an index.
#[derive(Clone, Debug, PartialEq)]
pub enum BuildProgressEvent {
    /// Walking the corpus directory.
    Loading { corpus: PathBuf },
    /// Chunks embedded so far out of the total.
    Embedding { n: u64, total: u64 },
    /// Writing the snapshot.
    Persisting { store: PathBuf },
}

/// Receives build progress events.
pub trait BuildProgress: Send + Sync {
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: "embedding  1,234 / 5,000 chunks".
pub struct StderrProgress;

impl BuildProgress for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Loading { corpus } => {
                format!("index  loading documents from '{}'...\n", corpus.display())
            }
            BuildProgressEvent::Embedding { n, total } => format!(
                "index  embedding  {} / {} chunks\n",
                format_number(*n),
                format_number(*total)
            ),
            BuildProgressEvent::Persisting { store } => {
                format!("index  saving snapshot to '{}'...\n", store.display())
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// No-op reporter.
pub struct NoProgress;

impl BuildProgress for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the binary: off or human (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn BuildProgress> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
        }
    }
}
