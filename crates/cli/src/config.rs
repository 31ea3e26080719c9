//! Ambient configuration loading and the CLI's combined error type.
//!
//! `xr-compiler` and `xr-vm` deliberately don't know about each other's
//! error types (see `xr_vm`'s crate doc comment); this is where the two
//! get stitched into one process-exit-code story.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use xr_core::VmConfig;
use xr_vm::{TraceFrame, VmError};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("no input: pass a script file or `-e <code>`")]
    NoInput,

    #[cfg(not(feature = "toy-parser"))]
    #[error("this build has no parser; rebuild with the `toy-parser` feature")]
    NoParser,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[cfg(feature = "toy-parser")]
    #[error(transparent)]
    Parse(#[from] crate::toy_parser::ParseError),

    #[error("{0}")]
    Compile(CompileErrors),

    #[error("{0}")]
    Runtime(RuntimeFailure),
}

impl CliError {
    pub fn compile(errors: Vec<xr_compiler::CompileError>) -> CliError {
        CliError::Compile(CompileErrors(errors))
    }

    pub fn runtime(err: VmError, trace: Vec<TraceFrame>) -> CliError {
        CliError::Runtime(RuntimeFailure(err, trace))
    }
}

/// All diagnostics accumulated for one compilation, not just the first.
#[derive(Debug)]
pub struct CompileErrors(pub Vec<xr_compiler::CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RuntimeFailure(pub VmError, pub Vec<TraceFrame>);

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "runtime error: {}", self.0)?;
        for frame in &self.1 {
            writeln!(f, "  {frame}")?;
        }
        Ok(())
    }
}

pub fn load_vm_config(path: &Path) -> Result<VmConfig, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| CliError::Config {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_document_yields_defaults() {
        let cfg: VmConfig = toml::from_str("").expect("empty document parses");
        assert_eq!(cfg, VmConfig::default());
    }

    #[test]
    fn overrides_a_single_field() {
        let cfg: VmConfig = toml::from_str("frames_max = 128").expect("parses");
        assert_eq!(cfg.frames_max, 128);
        assert_eq!(cfg.stack_per_frame, VmConfig::default().stack_per_frame);
    }
}
