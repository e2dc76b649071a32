//! Resumable, serializable interpreter state for one thread of a program.
//!
//! A [Continuable] is a stack of frames over compiled blocks. [Continuable::run0]
//! is a trampoline: it executes instructions until the code calls a step, runs
//! out of budget, or finishes. Script-level closure calls push frames instead of
//! recursing on the host stack, so the whole call stack can be written to disk at
//! any suspension point.

use crate::script::{Block, Instr, Segment};
use crate::types::{Closure, CodeRef, FlowError, Outcome, StepArguments, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where compiled blocks (and program-wide variables) come from.
pub trait CodeSource {
  fn block(&self, code: &CodeRef) -> Option<&Block>;

  /// Variables not bound in any frame, such as `env`.
  fn global(&self, _name: &str) -> Option<Value> {
    None
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handler {
  pub pc: usize,
  pub var: String,
  /// Operand stack depth when the `try` was entered.
  pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
  pub code: CodeRef,
  pub pc: usize,
  #[serde(default)]
  pub stack: Vec<Value>,
  #[serde(default)]
  pub locals: BTreeMap<String, Value>,
  #[serde(default)]
  pub handlers: Vec<Handler>,
}

impl Frame {
  fn new(code: CodeRef, locals: BTreeMap<String, Value>) -> Self {
    Self {
      code,
      pc: 0,
      stack: Vec::new(),
      locals,
      handlers: Vec::new(),
    }
  }
}

/// What the next resume value means to the suspended code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
  /// Nothing has run yet.
  Start,
  /// Suspended in a step call; the value becomes the call's result.
  AwaitingValue,
  /// Yielded at a safepoint; a normal value is discarded.
  Ignore,
}

/// A step invocation the continuation is waiting on.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCall {
  pub name: String,
  pub args: StepArguments,
  pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
  Step(StepCall),
  /// Instruction budget exhausted; resume with any normal value.
  Safepoint,
}

/// Result of driving a continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum Next {
  Value(Value),
  Suspended(Suspension),
  Abnormal(FlowError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuable {
  frames: Vec<Frame>,
  mode: ResumeMode,
  #[serde(default)]
  done: bool,
}

impl Continuable {
  /// Continuation for the body of a script.
  pub fn for_script(script: &str) -> Self {
    Self {
      frames: vec![Frame::new(CodeRef::new(script, 0), BTreeMap::new())],
      mode: ResumeMode::Start,
      done: false,
    }
  }

  /// Continuation that runs `closure`, with the first argument bound to `it`.
  pub fn from_closure(closure: &Closure, args: Vec<Value>) -> Self {
    let mut locals = closure.captured.clone();
    if let Some(first) = args.into_iter().next() {
      locals.insert("it".to_string(), first);
    }
    Self {
      frames: vec![Frame::new(closure.code.clone(), locals)],
      mode: ResumeMode::Start,
      done: false,
    }
  }

  /// A continuation with no code: resuming it returns the resume outcome as-is.
  /// Used to surface load failures as an ordinary thread failure.
  pub fn failing() -> Self {
    Self {
      frames: Vec::new(),
      mode: ResumeMode::Start,
      done: false,
    }
  }

  pub fn is_resumable(&self) -> bool {
    !self.done
  }

  pub fn frames(&self) -> &[Frame] {
    &self.frames
  }

  /// Mutable access to every value held by the continuation, for pickling.
  pub fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
    self
      .frames
      .iter_mut()
      .flat_map(|f| f.stack.iter_mut().chain(f.locals.values_mut()))
  }

  /// Script frames innermost first, as `(script, line)`.
  pub fn stack_trace(&self, code: &dyn CodeSource) -> Vec<(String, u32)> {
    self
      .frames
      .iter()
      .rev()
      .map(|f| {
        let line = code
          .block(&f.code)
          .map(|b| b.line_at(f.pc.saturating_sub(1)))
          .unwrap_or(0);
        (f.code.script.clone(), line)
      })
      .collect()
  }

  /// Resumes with `resume` and runs until the next suspension or termination,
  /// executing at most `budget` instructions.
  pub fn run0(&mut self, resume: Outcome, code: &dyn CodeSource, budget: &mut usize) -> Next {
    if self.done {
      return Next::Abnormal(FlowError::internal("continuation already terminated"));
    }
    if self.frames.is_empty() {
      self.done = true;
      return match resume {
        Outcome::Normal(v) => Next::Value(v),
        Outcome::Abnormal(e) => Next::Abnormal(e),
      };
    }

    let mode = std::mem::replace(&mut self.mode, ResumeMode::AwaitingValue);
    match (mode, resume) {
      (_, Outcome::Abnormal(e)) => {
        if let Some(next) = self.raise(e) {
          return next;
        }
      }
      (ResumeMode::AwaitingValue, Outcome::Normal(v)) => self.push(v),
      (ResumeMode::Start | ResumeMode::Ignore, Outcome::Normal(_)) => {}
    }

    loop {
      if *budget == 0 {
        self.mode = ResumeMode::Ignore;
        return Next::Suspended(Suspension::Safepoint);
      }
      *budget -= 1;

      match self.step(code) {
        Ok(None) => {}
        Ok(Some(next)) => return next,
        Err(e) => {
          if let Some(next) = self.raise(e) {
            return next;
          }
        }
      }
    }
  }

  fn push(&mut self, v: Value) {
    if let Some(f) = self.frames.last_mut() {
      f.stack.push(v);
    }
  }

  fn pop(&mut self) -> Result<Value, FlowError> {
    self
      .frames
      .last_mut()
      .and_then(|f| f.stack.pop())
      .ok_or_else(|| FlowError::internal("operand stack underflow"))
  }

  /// Unwinds to the nearest handler. Returns `Some` when nothing catches `e`.
  fn raise(&mut self, e: FlowError) -> Option<Next> {
    while let Some(frame) = self.frames.last_mut() {
      if let Some(h) = frame.handlers.pop() {
        frame.stack.truncate(h.depth);
        frame.locals.insert(h.var, e.to_value());
        frame.pc = h.pc;
        return None;
      }
      self.frames.pop();
    }
    self.done = true;
    Some(Next::Abnormal(e))
  }

  /// Executes one instruction. `Ok(Some)` ends this run.
  fn step(&mut self, code: &dyn CodeSource) -> Result<Option<Next>, FlowError> {
    let Some(frame) = self.frames.last_mut() else {
      return Err(FlowError::internal("no frame to execute"));
    };
    let block = code
      .block(&frame.code)
      .ok_or_else(|| FlowError::internal(format!("missing code for {}#{}", frame.code.script, frame.code.block)))?;

    if frame.pc >= block.code.len() {
      let result = frame.stack.pop().unwrap_or_default();
      self.frames.pop();
      if self.frames.is_empty() {
        self.done = true;
        return Ok(Some(Next::Value(result)));
      }
      self.push(result);
      return Ok(None);
    }

    let pc = frame.pc;
    let line = block.line_at(pc);
    frame.pc += 1;
    match &block.code[pc] {
      Instr::Const(v) => frame.stack.push(v.clone()),
      Instr::Load(name) => {
        let v = match frame.locals.get(name) {
          Some(v) => v.clone(),
          None => code
            .global(name)
            .ok_or_else(|| FlowError::error(format!("No such property: {}", name)))?,
        };
        frame.stack.push(v);
      }
      Instr::Store(name) => {
        let v = frame
          .stack
          .last()
          .cloned()
          .ok_or_else(|| FlowError::internal("store with empty stack"))?;
        frame.locals.insert(name.clone(), v);
      }
      Instr::Interpolate(segments) => {
        let mut out = String::new();
        for s in segments {
          match s {
            Segment::Text(t) => out.push_str(t),
            Segment::Expr { var, props } => {
              let mut v = match frame.locals.get(var) {
                Some(v) => v.clone(),
                None => code
                  .global(var)
                  .ok_or_else(|| FlowError::error(format!("No such property: {}", var)))?,
              };
              for p in props {
                v = property(v, p)?;
              }
              out.push_str(&v.to_string());
            }
          }
        }
        frame.stack.push(Value::Str(out));
      }
      Instr::MakeList(n) => {
        let at = frame
          .stack
          .len()
          .checked_sub(*n)
          .ok_or_else(|| FlowError::internal("list underflow"))?;
        let items = frame.stack.split_off(at);
        frame.stack.push(Value::List(items));
      }
      Instr::MakeMap(keys) => {
        let at = frame
          .stack
          .len()
          .checked_sub(keys.len())
          .ok_or_else(|| FlowError::internal("map underflow"))?;
        let values = frame.stack.split_off(at);
        let map: IndexMap<String, Value> = keys.iter().cloned().zip(values).collect();
        frame.stack.push(Value::Map(map));
      }
      Instr::MakeClosure(index) => {
        let closure = Closure {
          code: CodeRef::new(frame.code.script.clone(), *index),
          captured: frame.locals.clone(),
        };
        frame.stack.push(Value::Closure(closure));
      }
      Instr::Call {
        name,
        positional,
        named,
      } => {
        let total = positional + named.len();
        let at = frame
          .stack
          .len()
          .checked_sub(total)
          .ok_or_else(|| FlowError::internal("call underflow"))?;
        let mut values = frame.stack.split_off(at);
        let named_values = values.split_off(*positional);
        let named_map: IndexMap<String, Value> = named.iter().cloned().zip(named_values).collect();

        if let Some(Value::Closure(c)) = frame.locals.get(name) {
          let mut locals = c.captured.clone();
          if let Some(first) = values.into_iter().next() {
            locals.insert("it".to_string(), first);
          }
          let callee = Frame::new(c.code.clone(), locals);
          self.frames.push(callee);
          return Ok(None);
        }

        self.mode = ResumeMode::AwaitingValue;
        return Ok(Some(Next::Suspended(Suspension::Step(StepCall {
          name: name.clone(),
          args: StepArguments::new(values, named_map),
          line,
        }))));
      }
      Instr::Property(name) => {
        let target = frame
          .stack
          .pop()
          .ok_or_else(|| FlowError::internal("property with empty stack"))?;
        let v = property(target, name)?;
        self.push(v);
      }
      Instr::Pop => {
        self.pop()?;
      }
      Instr::EnterTry { handler, var } => {
        let depth = frame.stack.len();
        frame.handlers.push(Handler {
          pc: *handler,
          var: var.clone(),
          depth,
        });
      }
      Instr::ExitTry => {
        frame.handlers.pop();
      }
      Instr::Jump(target) => frame.pc = *target,
    }
    Ok(None)
  }
}

fn property(target: Value, name: &str) -> Result<Value, FlowError> {
  match target {
    Value::Map(mut m) => Ok(m.shift_remove(name).unwrap_or_default()),
    Value::Null => Err(FlowError::error(format!(
      "Cannot get property '{}' on null object",
      name
    ))),
    Value::Str(s) if name == "length" => Ok(Value::Int(s.chars().count() as i64)),
    Value::List(items) if name == "size" => Ok(Value::Int(items.len() as i64)),
    other => Err(FlowError::error(format!(
      "No such property: {} for class: {}",
      name,
      other.type_name()
    ))),
  }
}
