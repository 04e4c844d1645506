//! The interactive chat loop.
//!
//! Reads one line per turn, dispatches the control commands (`exit`,
//! `verbose on`, `verbose off`) and forwards everything else to the
//! [`Session`], writing each reply fragment as soon as it arrives.
//!
//! ```text
//! You: what's in my notes?
//!
//! AI: Your notes cover ...
//!
//! - Elapsed: 1.42 sec
//! - Tokens: 316
//! - Tokens/sec: 222.54
//! ```

use anyhow::Result;
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};
use tracing::error;

use crate::models::Usage;
use crate::session::Session;

pub const BANNER: &str =
    "Chat session started! Type 'exit' to quit. Type 'verbose on' / 'verbose off' to toggle stats.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Exit,
    VerboseOn,
    VerboseOff,
    /// Anything else, including an empty line, goes to the session.
    Ask(String),
}

/// Classify one input line. Commands are matched trimmed and case-insensitively.
pub fn parse_command(line: &str) -> ChatCommand {
    let text = line.trim();
    match text.to_lowercase().as_str() {
        "exit" => ChatCommand::Exit,
        "verbose on" => ChatCommand::VerboseOn,
        "verbose off" => ChatCommand::VerboseOff,
        _ => ChatCommand::Ask(text.to_string()),
    }
}

/// Timing and token usage of one completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnStats {
    pub elapsed: Duration,
    pub usage: Option<Usage>,
}

impl TurnStats {
    /// Stat lines as printed in verbose mode.
    pub fn lines(&self) -> Vec<String> {
        let secs = self.elapsed.as_secs_f64();
        let mut lines = vec![format!("- Elapsed: {:.2} sec", secs)];
        match self.usage {
            Some(usage) => {
                lines.push(format!("- Tokens: {}", usage.total_tokens));
                if usage.total_tokens > 0 && secs > 0.0 {
                    lines.push(format!(
                        "- Tokens/sec: {:.2}",
                        usage.total_tokens as f64 / secs
                    ));
                }
            }
            None => lines.push("- [Token statistics unavailable for this response]".to_string()),
        }
        lines
    }
}

/// Run the loop until `exit` or end of input.
///
/// A turn that fails is reported as `[Error: ...]` and the loop carries on;
/// the session history does not keep the failed exchange.
pub async fn run_chat_loop<R: BufRead, W: Write>(
    session: &mut Session,
    mut input: R,
    output: &mut W,
    mut verbose: bool,
) -> Result<()> {
    let mut line = String::new();
    loop {
        write!(output, "You: ")?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }

        match parse_command(&line) {
            ChatCommand::Exit => break,
            ChatCommand::VerboseOn => {
                verbose = true;
                writeln!(output, "[Verbose mode enabled]")?;
            }
            ChatCommand::VerboseOff => {
                verbose = false;
                writeln!(output, "[Verbose mode disabled]")?;
            }
            ChatCommand::Ask(text) => {
                let stats = run_turn(session, &text, output).await?;
                if let (true, Some(stats)) = (verbose, stats) {
                    for stat in stats.lines() {
                        writeln!(output, "{}", stat)?;
                    }
                }
            }
        }
    }
    output.flush()?;
    Ok(())
}

/// Execute one turn. Output errors propagate; generation errors are
/// reported inline and yield `Ok(None)`.
async fn run_turn<W: Write>(
    session: &mut Session,
    text: &str,
    output: &mut W,
) -> Result<Option<TurnStats>> {
    let start = Instant::now();
    write!(output, "\nAI: ")?;
    output.flush()?;

    let mut stream = match session.ask(text).await {
        Ok(stream) => stream,
        Err(e) => {
            report_failure(output, &e)?;
            return Ok(None);
        }
    };

    let mut last_usage = None;
    loop {
        match stream.next_fragment().await {
            Ok(Some(fragment)) => {
                output.write_all(fragment.text.as_bytes())?;
                output.flush()?;
                last_usage = fragment.usage;
            }
            Ok(None) => break,
            Err(e) => {
                report_failure(output, &e)?;
                return Ok(None);
            }
        }
    }
    let elapsed = start.elapsed();
    writeln!(output, "\n")?;

    Ok(Some(TurnStats {
        elapsed,
        usage: last_usage,
    }))
}

fn report_failure<W: Write>(output: &mut W, e: &anyhow::Error) -> Result<()> {
    error!(error = %format!("{:#}", e), "Turn failed");
    writeln!(output, "\n[Error: {:#}]\n", e)?;
    output.flush()?;
    Ok(())
}
