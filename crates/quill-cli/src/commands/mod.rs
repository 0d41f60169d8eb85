//! CLI command implementations.

pub mod compile_stats;
pub mod disasm;
pub mod routines;
pub mod run;

use anyhow::{Context, Result};
use quill_vm_bytecode::load_story_bytes;
use quill_vm_core::Processor;
use std::path::Path;

use crate::config::Config;

/// Read a story file, unwrapping a resource container if there is one.
pub fn read_story(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let image = load_story_bytes(bytes).with_context(|| format!("loading {}", path.display()))?;
    Ok(image)
}

/// Load a story and read every routine reachable from its main routine.
pub fn discover(path: &Path, config: &Config) -> Result<Processor> {
    let mut processor = Processor::new(read_story(path)?, config.processor_options())?;
    let main = processor.header().main_routine_address();
    processor.discover_routines(main)?;
    Ok(processor)
}

/// Label for a routine in listings.
pub fn routine_name(processor: &Processor, address: u32) -> String {
    if address == processor.header().main_routine_address() {
        "main".to_string()
    } else {
        format!("routine_{address:05x}")
    }
}

/// Parse a byte address given as `0x`-prefixed hex or decimal.
pub fn parse_address(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{text}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x7dd"), Ok(0x7dd));
        assert_eq!(parse_address("2013"), Ok(2013));
        assert!(parse_address("main").is_err());
    }
}
