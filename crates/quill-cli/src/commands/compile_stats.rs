//! Compile-stats command - compile every discovered routine and report.

use anyhow::Result;
use clap::Args;
use quill_vm_exec::runtime_helpers;
use quill_vm_jit::{CompileEnv, CompileStatistics, JitCompiler, Requirements};
use serde::Serialize;
use std::path::PathBuf;

use super::{discover, routine_name};
use crate::config::Config;

#[derive(Args)]
pub struct CompileStatsCommand {
    /// Story file
    pub story: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    compiled: Vec<CompileStatistics>,
    /// Routines that would trap on an opcode compiled code leaves out
    untranslated: Vec<Untranslated>,
    failed: Vec<Failure>,
}

#[derive(Debug, Serialize)]
struct Untranslated {
    address: u32,
    opcode: String,
}

#[derive(Debug, Serialize)]
struct Failure {
    address: u32,
    error: String,
}

impl CompileStatsCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let processor = discover(&self.story, config)?;
        let mut compiler = JitCompiler::new_with_helpers(runtime_helpers())?;
        let env = CompileEnv::from_processor(&processor);

        let mut report = Report::default();
        for routine in processor.routines().iter() {
            if let Some(opcode) = Requirements::scan(routine).untranslated {
                report.untranslated.push(Untranslated {
                    address: routine.address(),
                    opcode: opcode.to_string(),
                });
            }
            match compiler.compile(routine, &env) {
                Ok(compiled) => report.compiled.push(compiled.statistics),
                Err(error) => {
                    tracing::warn!(address = format_args!("{:#x}", routine.address()), %error, "compile failed");
                    report.failed.push(Failure {
                        address: routine.address(),
                        error: error.to_string(),
                    });
                }
            }
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        for stats in &report.compiled {
            println!("{:<16} {stats}", routine_name(&processor, stats.address));
        }
        for entry in &report.untranslated {
            println!("{:#07x}: traps on '{}'", entry.address, entry.opcode);
        }
        for failure in &report.failed {
            println!("{:#07x}: failed: {}", failure.address, failure.error);
        }

        let code: usize = report.compiled.iter().map(|stats| stats.code_size).sum();
        let elapsed: std::time::Duration = report.compiled.iter().map(|stats| stats.elapsed).sum();
        println!(
            "{} compiled ({} bytes, {:?}), {} with untranslated opcodes, {} failed",
            report.compiled.len(),
            code,
            elapsed,
            report.untranslated.len(),
            report.failed.len()
        );
        Ok(())
    }
}
