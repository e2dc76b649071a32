//! Lowers the AST into flat instruction blocks run by the continuation interpreter.
//!
//! Block 0 is the script body. Each closure literal becomes its own block,
//! numbered in source order. Every statement leaves exactly one value on the
//! operand stack; a block returns the value of its last statement, or null.

use super::ParseError;
use super::lexer::tokenize;
use super::parser::{Arg, Expr, Stmt, StmtKind, parse};
use crate::types::Value;
use once_cell::sync::Lazy;
use regex::Regex;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r"\$\{\s*([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*\}")
    .expect("placeholder regex")
});

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
  Text(String),
  /// `${var.prop.prop}`
  Expr { var: String, props: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
  Const(Value),
  Load(String),
  /// Binds the top of stack to a local, leaving it in place.
  Store(String),
  Interpolate(Vec<Segment>),
  MakeList(usize),
  MakeMap(Vec<String>),
  MakeClosure(u32),
  /// Pops `named.len()` named values (in order) above `positional` positional values.
  Call {
    name: String,
    positional: usize,
    named: Vec<String>,
  },
  Property(String),
  Pop,
  EnterTry { handler: usize, var: String },
  ExitTry,
  Jump(usize),
}

/// Instructions of one block with the source line of each.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
  pub code: Vec<Instr>,
  pub lines: Vec<u32>,
}

impl Block {
  fn emit(&mut self, instr: Instr, line: u32) -> usize {
    self.code.push(instr);
    self.lines.push(line);
    self.code.len() - 1
  }

  pub fn line_at(&self, pc: usize) -> u32 {
    self
      .lines
      .get(pc.min(self.lines.len().saturating_sub(1)))
      .copied()
      .unwrap_or(0)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
  pub name: String,
  pub blocks: Vec<Block>,
}

impl Program {
  pub fn block(&self, index: u32) -> Option<&Block> {
    self.blocks.get(index as usize)
  }
}

/// Tokenizes, parses and compiles `source` as script `name`.
pub fn compile(name: &str, source: &str) -> Result<Program, ParseError> {
  let stmts = parse(tokenize(source)?)?;
  let mut c = Compiler { blocks: Vec::new() };
  c.block(&stmts, 1);
  Ok(Program {
    name: name.to_string(),
    blocks: c.blocks,
  })
}

struct Compiler {
  blocks: Vec<Block>,
}

impl Compiler {
  /// Reserves a block index, compiles into it and returns the index.
  fn block(&mut self, stmts: &[Stmt], line: u32) -> u32 {
    let index = self.blocks.len();
    self.blocks.push(Block::default());
    let mut b = Block::default();
    self.stmts(&mut b, stmts, line);
    self.blocks[index] = b;
    index as u32
  }

  fn stmts(&mut self, b: &mut Block, stmts: &[Stmt], line: u32) {
    if stmts.is_empty() {
      b.emit(Instr::Const(Value::Null), line);
      return;
    }
    for (i, s) in stmts.iter().enumerate() {
      self.stmt(b, s);
      if i + 1 < stmts.len() {
        b.emit(Instr::Pop, s.line);
      }
    }
  }

  fn stmt(&mut self, b: &mut Block, s: &Stmt) {
    let line = s.line;
    match &s.kind {
      StmtKind::Def { name, value } => {
        match value {
          Some(v) => self.expr(b, v, line),
          None => {
            b.emit(Instr::Const(Value::Null), line);
          }
        }
        b.emit(Instr::Store(name.clone()), line);
      }
      StmtKind::Assign { name, value } => {
        self.expr(b, value, line);
        b.emit(Instr::Store(name.clone()), line);
      }
      StmtKind::Try { body, var, handler } => {
        let enter = b.emit(
          Instr::EnterTry {
            handler: 0,
            var: var.clone(),
          },
          line,
        );
        self.stmts(b, body, line);
        b.emit(Instr::Pop, line);
        b.emit(Instr::ExitTry, line);
        let jump = b.emit(Instr::Jump(0), line);
        let handler_pc = b.code.len();
        self.stmts(b, handler, line);
        b.emit(Instr::Pop, line);
        let end = b.emit(Instr::Const(Value::Null), line);
        b.code[enter] = Instr::EnterTry {
          handler: handler_pc,
          var: var.clone(),
        };
        b.code[jump] = Instr::Jump(end);
      }
      StmtKind::Expr(e) => self.expr(b, e, line),
    }
  }

  fn expr(&mut self, b: &mut Block, e: &Expr, line: u32) {
    match e {
      Expr::Null => {
        b.emit(Instr::Const(Value::Null), line);
      }
      Expr::Bool(v) => {
        b.emit(Instr::Const(Value::Bool(*v)), line);
      }
      Expr::Int(v) => {
        b.emit(Instr::Const(Value::Int(*v)), line);
      }
      Expr::Str(s) => {
        b.emit(Instr::Const(Value::Str(s.replace("\\$", "$"))), line);
      }
      Expr::GString(s) => {
        let segments = split_placeholders(s);
        match segments.as_slice() {
          [] => b.emit(Instr::Const(Value::str("")), line),
          [Segment::Text(t)] => b.emit(Instr::Const(Value::str(t.clone())), line),
          _ => b.emit(Instr::Interpolate(segments), line),
        };
      }
      Expr::Var(name) => {
        b.emit(Instr::Load(name.clone()), line);
      }
      Expr::Call {
        name,
        args,
        line: call_line,
      } => {
        let mut named = Vec::new();
        let mut positional = 0;
        for a in args {
          if let Arg::Positional(v) = a {
            self.expr(b, v, *call_line);
            positional += 1;
          }
        }
        for a in args {
          if let Arg::Named(k, v) = a {
            self.expr(b, v, *call_line);
            named.push(k.clone());
          }
        }
        b.emit(
          Instr::Call {
            name: name.clone(),
            positional,
            named,
          },
          *call_line,
        );
      }
      Expr::Closure(body) => {
        let index = self.block(body, line);
        b.emit(Instr::MakeClosure(index), line);
      }
      Expr::List(items) => {
        for item in items {
          self.expr(b, item, line);
        }
        b.emit(Instr::MakeList(items.len()), line);
      }
      Expr::Map(entries) => {
        for (_, v) in entries {
          self.expr(b, v, line);
        }
        b.emit(
          Instr::MakeMap(entries.iter().map(|(k, _)| k.clone()).collect()),
          line,
        );
      }
      Expr::Property { target, name } => {
        self.expr(b, target, line);
        b.emit(Instr::Property(name.clone()), line);
      }
    }
  }
}

/// Splits a double-quoted string into literal text and `${...}` placeholders.
/// `\$` stays literal.
pub fn split_placeholders(text: &str) -> Vec<Segment> {
  let mut out = Vec::new();
  let mut literal = String::new();
  let mut last = 0;
  for caps in PLACEHOLDER.captures_iter(text) {
    let Some(whole) = caps.get(0) else { continue };
    let before = &text[last..whole.start()];
    last = whole.end();
    if before.ends_with('\\') {
      literal.push_str(&before[..before.len() - 1]);
      literal.push_str(whole.as_str());
      continue;
    }
    literal.push_str(before);
    if !literal.is_empty() {
      out.push(Segment::Text(std::mem::take(&mut literal).replace("\\$", "$")));
    }
    let var = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
    let props = caps
      .get(2)
      .map(|m| {
        m.as_str()
          .split('.')
          .filter(|p| !p.is_empty())
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default();
    out.push(Segment::Expr { var, props });
  }
  literal.push_str(&text[last..]);
  if !literal.is_empty() {
    out.push(Segment::Text(literal.replace("\\$", "$")));
  }
  out
}
