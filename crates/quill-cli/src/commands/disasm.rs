//! Disasm command - print discovered routines instruction by instruction.

use anyhow::{Result, bail};
use clap::Args;
use quill_vm_core::ControlFlowGraph;
use std::path::PathBuf;

use super::{discover, parse_address, routine_name};
use crate::config::Config;

#[derive(Args)]
pub struct DisasmCommand {
    /// Story file
    pub story: PathBuf,

    /// Only this routine (header address, hex with 0x or decimal)
    #[arg(long, value_parser = parse_address)]
    pub routine: Option<u32>,

    /// Mark basic block boundaries
    #[arg(long)]
    pub blocks: bool,
}

impl DisasmCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let mut processor = discover(&self.story, config)?;
        if let Some(address) = self.routine {
            processor.discover_routines(address)?;
        }

        let routines: Vec<_> = processor
            .routines()
            .iter()
            .filter(|routine| self.routine.is_none_or(|address| routine.address() == address))
            .cloned()
            .collect();
        if routines.is_empty() {
            bail!("no routines found");
        }

        for routine in routines {
            println!(
                "{} ({:#07x}, {} local(s))",
                routine_name(&processor, routine.address()),
                routine.address(),
                routine.local_count()
            );
            let cfg = self.blocks.then(|| ControlFlowGraph::build(&routine));
            for (index, instruction) in routine.instructions().iter().enumerate() {
                if let Some(block) = cfg
                    .as_ref()
                    .and_then(|cfg| cfg.block_at(instruction.address))
                    .filter(|block| block.range.start == index)
                {
                    let marker = if block.is_target { "target" } else { "block" };
                    println!("  ; {marker} {:#07x}", block.start);
                }
                println!("  {instruction}");
            }
            println!();
        }
        Ok(())
    }
}
