//! The pipeline script language: lexer, parser and the block compiler.
//!
//! Scripts are compiled deterministically, so a [CodeRef](crate::types::CodeRef)
//! saved with a program still points at the same block after the source is
//! recompiled on load.

pub mod compiler;
pub mod lexer;
pub mod parser;

#[cfg(test)]
mod compiler_test;

pub use compiler::{Block, Instr, Program, Segment, compile};

use thiserror::Error;

/// Name the main script of every run is compiled under.
pub const MAIN_SCRIPT: &str = "WorkflowScript";

/// Name for the `n`th script brought in by `load` (1-based).
pub fn loaded_script_name(n: usize) -> String {
  format!("Script{}", n)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct ParseError {
  pub line: u32,
  pub message: String,
}

impl ParseError {
  pub fn new(line: u32, message: impl Into<String>) -> Self {
    Self {
      line,
      message: message.into(),
    }
  }
}
