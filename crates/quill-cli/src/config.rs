//! Configuration file parsing for quill.toml.

use quill_vm_core::ProcessorOptions;
use quill_vm_exec::{ExecutionMode, SessionOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Virtual machine settings
    #[serde(default)]
    pub vm: VmConfig,

    /// Compiler settings
    #[serde(default)]
    pub jit: JitConfig,

    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Virtual machine configuration.
#[derive(Debug, Deserialize)]
pub struct VmConfig {
    /// Evaluation stack capacity in words
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,

    /// Interpreted instructions per run-loop slice
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// `interpreted` or `compiled`
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Fixed random seed, for reproducible runs
    pub random_seed: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            batch_size: default_batch_size(),
            mode: ExecutionMode::default(),
            random_seed: None,
        }
    }
}

/// Compiler configuration.
#[derive(Debug, Deserialize)]
pub struct JitConfig {
    /// Run routines the compiler rejects interpreted instead of failing
    #[serde(default = "default_true")]
    pub fallback_to_interpreter: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            fallback_to_interpreter: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stack_size() -> usize {
    1024
}

fn default_batch_size() -> usize {
    10_000
}

fn default_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Processor options from the `[vm]` section.
    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            stack_size: self.vm.stack_size,
            random_seed: self.vm.random_seed,
            ..ProcessorOptions::default()
        }
    }

    /// Session options from the `[vm]` and `[jit]` sections.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            processor: self.processor_options(),
            mode: self.vm.mode,
            batch_size: self.vm.batch_size.max(1),
            fallback_to_interpreter: self.jit.fallback_to_interpreter,
        }
    }
}

/// Load configuration from a file or search for default config files.
///
/// An explicitly given file must exist; a missing search result means
/// defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    if let Some(path) = path
        && !path.exists()
    {
        anyhow::bail!("config file {} not found", path.display());
    }
    let config_path = path.map(PathBuf::from).or_else(find_config_file);

    match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
            tracing::debug!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}

/// Search for configuration file in the current directory and parent directories.
fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;

    const CONFIG_NAMES: &[&str] = &["quill.toml", ".quillrc.toml"];

    let mut dir = Some(cwd.as_path());
    while let Some(current) = dir {
        for name in CONFIG_NAMES {
            let path = current.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        dir = current.parent();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.vm.stack_size, 1024);
        assert_eq!(config.vm.batch_size, 10_000);
        assert_eq!(config.vm.mode, ExecutionMode::Interpreted);
        assert!(config.jit.fallback_to_interpreter);
        assert_eq!(config.log.level, "warn");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[vm]
stack_size = 2048
mode = "compiled"
random_seed = 7

[jit]
fallback_to_interpreter = false
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.vm.stack_size, 2048);
        assert_eq!(config.vm.batch_size, 10_000);
        assert_eq!(config.vm.mode, ExecutionMode::Compiled);
        assert!(!config.jit.fallback_to_interpreter);

        let options = config.session_options();
        assert_eq!(options.processor.stack_size, 2048);
        assert_eq!(options.processor.random_seed, Some(7));
        assert_eq!(options.mode, ExecutionMode::Compiled);
        assert!(!options.fallback_to_interpreter);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let toml = "[vm]\nmode = \"native\"\n";
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let missing = Path::new("definitely/not/here/quill.toml");
        assert!(load_config(Some(missing)).is_err());
    }
}
