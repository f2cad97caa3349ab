//! Compiler configuration
//!
//! Implements the `compilerOptions` contract: a JSON object whose
//! recognized keys are `target`, `optimization`, `exitBehavior`, and
//! `include`. Unknown keys are ignored with a warning. File I/O stays
//! outside the core; the loader takes the JSON text.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// What the generated program does when `main` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExitBehavior {
    /// Infinite self-jump
    #[default]
    Loop,
    /// Jump to the C64 BASIC warm start at $A474
    Basic,
    /// Jump to the soft reset vector at $FCE2
    Reset,
}

impl ExitBehavior {
    /// Parses the configuration value; unknown strings are rejected
    pub fn parse(s: &str) -> Option<ExitBehavior> {
        match s {
            "loop" => Some(ExitBehavior::Loop),
            "basic" => Some(ExitBehavior::Basic),
            "reset" => Some(ExitBehavior::Reset),
            _ => None,
        }
    }
}

/// Optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptLevel {
    /// No optimization
    O0,
    /// Unreachable-block elimination, constant folding, dead code
    O1,
    /// O1 plus propagation, copy propagation, and CSE
    #[default]
    O2,
}

impl OptLevel {
    /// Parses `O0`/`O1`/`O2` (case-insensitive, with or without the O)
    pub fn parse(s: &str) -> Option<OptLevel> {
        match s.to_ascii_uppercase().as_str() {
            "O0" | "0" => Some(OptLevel::O0),
            "O1" | "1" => Some(OptLevel::O1),
            "O2" | "2" => Some(OptLevel::O2),
            _ => None,
        }
    }

    /// Numeric level for the optimizer
    pub fn level(&self) -> u8 {
        match self {
            OptLevel::O0 => 0,
            OptLevel::O1 => 1,
            OptLevel::O2 => 2,
        }
    }
}

/// Process exit codes reported by the (external) CLI driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Compilation succeeded
    Success = 0,
    /// Bad command-line arguments
    InvalidArgs = 1,
    /// Source errors were reported
    CompilationError = 2,
    /// The compiler itself failed
    InternalError = 3,
}

/// Resolved compiler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerConfig {
    /// Target machine; only `c64` is currently known
    pub target: String,
    /// Optimization level
    pub optimization: OptLevel,
    /// Exit behavior appended after `main` returns
    pub exit_behavior: ExitBehavior,
    /// Source include globs (expanded by the build driver, not the core)
    pub include: Vec<String>,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            target: "c64".to_string(),
            optimization: OptLevel::default(),
            exit_behavior: ExitBehavior::default(),
            include: Vec::new(),
        }
    }
}

impl CompilerConfig {
    /// Reads a configuration from JSON text holding an object with a
    /// `compilerOptions` record. Unknown keys warn and are ignored;
    /// invalid values for known keys are errors.
    pub fn from_json(text: &str) -> Result<CompilerConfig> {
        let root: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| Error::InvalidConfig(format!("not valid JSON: {}", e)))?;

        let mut config = CompilerConfig::default();
        let Some(options) = root.get("compilerOptions") else {
            return Ok(config);
        };
        let Some(options) = options.as_object() else {
            return Err(Error::InvalidConfig(
                "'compilerOptions' must be an object".to_string(),
            ));
        };

        for (key, value) in options {
            match key.as_str() {
                "target" => {
                    config.target = value
                        .as_str()
                        .ok_or_else(|| {
                            Error::InvalidConfig("'target' must be a string".to_string())
                        })?
                        .to_string();
                }
                "optimization" => {
                    let text = value.as_str().ok_or_else(|| {
                        Error::InvalidConfig("'optimization' must be a string".to_string())
                    })?;
                    config.optimization = OptLevel::parse(text).ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "Invalid values for 'optimization': '{}'",
                            text
                        ))
                    })?;
                }
                "exitBehavior" => {
                    let text = value.as_str().ok_or_else(|| {
                        Error::InvalidConfig("'exitBehavior' must be a string".to_string())
                    })?;
                    config.exit_behavior = ExitBehavior::parse(text).ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "Invalid values for 'exitBehavior': '{}'",
                            text
                        ))
                    })?;
                }
                "include" => {
                    let items = value.as_array().ok_or_else(|| {
                        Error::InvalidConfig("'include' must be an array".to_string())
                    })?;
                    config.include = items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect();
                }
                unknown => {
                    tracing::warn!(key = unknown, "ignoring unknown compilerOptions key");
                }
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CompilerConfig::from_json("{}").unwrap();
        assert_eq!(config.exit_behavior, ExitBehavior::Loop);
        assert_eq!(config.optimization, OptLevel::O2);
        assert_eq!(config.target, "c64");
    }

    #[test]
    fn test_full_config() {
        let config = CompilerConfig::from_json(
            r#"{"compilerOptions": {"target": "c64", "optimization": "O1", "exitBehavior": "basic", "include": ["src/*.bl65"]}}"#,
        )
        .unwrap();
        assert_eq!(config.optimization, OptLevel::O1);
        assert_eq!(config.exit_behavior, ExitBehavior::Basic);
        assert_eq!(config.include, vec!["src/*.bl65"]);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = CompilerConfig::from_json(
            r#"{"compilerOptions": {"exitBehavior": "reset", "frobnicate": true}}"#,
        )
        .unwrap();
        assert_eq!(config.exit_behavior, ExitBehavior::Reset);
    }

    #[test]
    fn test_invalid_exit_behavior_rejected() {
        let err = CompilerConfig::from_json(
            r#"{"compilerOptions": {"exitBehavior": "explode"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid values"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::CompilationError as i32, 2);
    }
}
