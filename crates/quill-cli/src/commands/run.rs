//! Run command - play a story over stdin/stdout.

use anyhow::{Result, anyhow};
use clap::Args;
use quill_vm_core::{Host, ScreenCommand, StatusLine, StatusRight};
use quill_vm_exec::{ExecutionMode, RunOutcome, Session};
use std::io::{BufRead, Write};
use std::path::PathBuf;

use super::read_story;
use crate::config::Config;

#[derive(Args)]
pub struct RunCommand {
    /// Story file (raw image or resource container)
    pub story: PathBuf,

    /// Execution strategy: interpreted or compiled (overrides config)
    #[arg(long)]
    pub mode: Option<ExecutionMode>,

    /// Stop after this many run-loop batches (0 = no limit)
    #[arg(long, default_value_t = 0)]
    pub max_batches: usize,

    /// Print compiled-code counters to stderr on exit
    #[arg(long)]
    pub stats: bool,
}

impl RunCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let mut options = config.session_options();
        if let Some(mode) = self.mode {
            options.mode = mode;
        }
        let mut session = Session::new(read_story(&self.story)?, options)?;
        let mut host = StdioHost::new();

        let mut batches = 0usize;
        let result = loop {
            match session.run(&mut host) {
                RunOutcome::Yielded { executed } => {
                    batches += 1;
                    tracing::trace!(batches, executed, "batch");
                    if self.max_batches != 0 && batches >= self.max_batches {
                        tracing::info!(batches, "batch limit reached");
                        break Ok(());
                    }
                }
                RunOutcome::AwaitingInput(request) => {
                    // The host answers synchronously, so this only happens at end of input.
                    tracing::debug!(?request, "input exhausted");
                    break Ok(());
                }
                RunOutcome::Quit | RunOutcome::Stopped => break Ok(()),
                RunOutcome::Faulted(error) => break Err(anyhow!(error).context("story faulted")),
            }
        };
        host.flush()?;

        if self.stats
            && let Some(stats) = session.jit_stats()
        {
            eprintln!("{stats:#?}");
        }
        result
    }
}

/// Host over the process's standard streams.
struct StdioHost {
    out: std::io::Stdout,
    input: std::io::StdinLock<'static>,
}

impl StdioHost {
    fn new() -> Self {
        Self {
            out: std::io::stdout(),
            input: std::io::stdin().lock(),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    fn next_line(&mut self) -> Option<String> {
        let _ = self.out.flush();
        read_input_line(&mut self.input)
    }
}

/// One line without its terminator; `None` at end of input or on a read error.
fn read_input_line(input: &mut impl BufRead) -> Option<String> {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) => None,
        Ok(_) => Some(line.trim_end_matches(['\n', '\r']).to_string()),
        Err(error) => {
            tracing::warn!(%error, "reading input failed, treating as end of input");
            None
        }
    }
}

impl Host for StdioHost {
    fn print(&mut self, text: &str) {
        let _ = self.out.write_all(text.as_bytes());
    }

    fn show_status(&mut self, status: &StatusLine) {
        let right = match status.right {
            StatusRight::Score { score, turns } => format!("Score: {score}  Turns: {turns}"),
            StatusRight::Time { hours, minutes } => format!("Time: {hours}:{minutes:02}"),
        };
        let _ = writeln!(self.out, "[{}  {}]", status.location, right);
    }

    fn screen(&mut self, command: ScreenCommand) {
        if let ScreenCommand::EraseWindow(-1) = command {
            let _ = writeln!(self.out);
        }
    }

    fn read_line(&mut self, max_len: usize) -> Option<String> {
        self.next_line()
            .map(|line| line.chars().take(max_len).collect())
    }

    fn read_char(&mut self) -> Option<char> {
        self.next_line()
            .map(|line| line.chars().next().unwrap_or('\r'))
    }
}
