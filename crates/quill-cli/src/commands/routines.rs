//! Routines command - list the routine table.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use super::{discover, routine_name};
use crate::config::Config;

#[derive(Args)]
pub struct RoutinesCommand {
    /// Story file
    pub story: PathBuf,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

impl RoutinesCommand {
    pub fn run(&self, config: &Config) -> Result<()> {
        let processor = discover(&self.story, config)?;
        let summaries: Vec<_> = processor
            .routines()
            .iter()
            .map(|routine| routine.summary(routine_name(&processor, routine.address())))
            .collect();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            return Ok(());
        }

        println!("{:>8}  {:>6}  {:>12}  {:>6}  name", "address", "locals", "instructions", "bytes");
        for summary in &summaries {
            println!(
                "{:#08x}  {:>6}  {:>12}  {:>6}  {}",
                summary.address, summary.locals, summary.instructions, summary.length, summary.name
            );
        }
        println!("{} routine(s)", summaries.len());
        Ok(())
    }
}
