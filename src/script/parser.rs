//! Recursive-descent parser producing the script AST.
//!
//! Grammar (newlines and `;` separate statements):
//!
//! ```text
//! stmt  := 'def' IDENT ('=' expr)? | IDENT '=' expr
//!        | 'try' block 'catch' '(' IDENT ')' block | expr
//! expr  := primary ('.' IDENT)*
//! prim  := INT | STRING | true | false | null | block | list | map
//!        | IDENT '(' args? ')' block? | IDENT block | IDENT args | IDENT
//! args  := arg (',' arg)*      arg := IDENT ':' expr | expr
//! ```

use super::ParseError;
use super::lexer::{Lexed, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
  /// Double-quoted string that may contain `${...}` placeholders.
  GString(String),
  Var(String),
  Call { name: String, args: Vec<Arg>, line: u32 },
  Closure(Vec<Stmt>),
  List(Vec<Expr>),
  Map(Vec<(String, Expr)>),
  Property { target: Box<Expr>, name: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
  Positional(Expr),
  Named(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
  pub line: u32,
  pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
  Def { name: String, value: Option<Expr> },
  Assign { name: String, value: Expr },
  Try {
    body: Vec<Stmt>,
    var: String,
    handler: Vec<Stmt>,
  },
  Expr(Expr),
}

/// Parses a token stream (ending in `Eof`) into top-level statements.
pub fn parse(tokens: Vec<Lexed>) -> Result<Vec<Stmt>, ParseError> {
  let mut p = Parser { tokens, pos: 0 };
  let stmts = p.statements(false)?;
  if !p.at(&Token::Eof) {
    return Err(p.unexpected("end of script"));
  }
  Ok(stmts)
}

struct Parser {
  tokens: Vec<Lexed>,
  pos: usize,
}

impl Parser {
  fn peek(&self) -> &Token {
    self.peek_at(0)
  }

  fn peek_at(&self, offset: usize) -> &Token {
    self
      .tokens
      .get(self.pos + offset)
      .or_else(|| self.tokens.last())
      .map(|l| &l.token)
      .unwrap_or(&Token::Eof)
  }

  fn line(&self) -> u32 {
    self
      .tokens
      .get(self.pos)
      .or_else(|| self.tokens.last())
      .map(|l| l.line)
      .unwrap_or(1)
  }

  fn at(&self, t: &Token) -> bool {
    self.peek() == t
  }

  fn advance(&mut self) -> Token {
    let t = self.peek().clone();
    if self.pos < self.tokens.len() {
      self.pos += 1;
    }
    t
  }

  fn expect(&mut self, t: Token, what: &str) -> Result<(), ParseError> {
    if self.peek() == &t {
      self.advance();
      Ok(())
    } else {
      Err(self.unexpected(what))
    }
  }

  fn ident(&mut self, what: &str) -> Result<String, ParseError> {
    match self.advance() {
      Token::Ident(name) => Ok(name),
      _ => {
        self.pos -= 1;
        Err(self.unexpected(what))
      }
    }
  }

  fn unexpected(&self, what: &str) -> ParseError {
    ParseError::new(
      self.line(),
      format!("expected {}, found {:?}", what, self.peek()),
    )
  }

  fn skip_separators(&mut self) {
    while matches!(self.peek(), Token::Newline | Token::Semi) {
      self.advance();
    }
  }

  fn skip_newlines(&mut self) {
    while self.at(&Token::Newline) {
      self.advance();
    }
  }

  /// Statements until `}` (when `in_block`) or end of input.
  fn statements(&mut self, in_block: bool) -> Result<Vec<Stmt>, ParseError> {
    let mut out = Vec::new();
    loop {
      self.skip_separators();
      match self.peek() {
        Token::Eof => break,
        Token::RBrace if in_block => break,
        _ => {}
      }
      out.push(self.statement()?);
      if !matches!(
        self.peek(),
        Token::Newline | Token::Semi | Token::Eof | Token::RBrace
      ) {
        return Err(self.unexpected("end of statement"));
      }
    }
    Ok(out)
  }

  fn block(&mut self) -> Result<Vec<Stmt>, ParseError> {
    self.expect(Token::LBrace, "'{'")?;
    let body = self.statements(true)?;
    self.expect(Token::RBrace, "'}'")?;
    Ok(body)
  }

  fn statement(&mut self) -> Result<Stmt, ParseError> {
    let line = self.line();
    let kind = match self.peek().clone() {
      Token::Def => {
        self.advance();
        let name = self.ident("variable name after 'def'")?;
        let value = if self.at(&Token::Assign) {
          self.advance();
          self.skip_newlines();
          Some(self.expr()?)
        } else {
          None
        };
        StmtKind::Def { name, value }
      }
      Token::Try => {
        self.advance();
        let body = self.block()?;
        self.skip_newlines();
        self.expect(Token::Catch, "'catch'")?;
        self.expect(Token::LParen, "'('")?;
        let var = self.ident("exception variable")?;
        self.expect(Token::RParen, "')'")?;
        let handler = self.block()?;
        StmtKind::Try { body, var, handler }
      }
      Token::Ident(name) if self.peek_at(1) == &Token::Assign => {
        self.advance();
        self.advance();
        self.skip_newlines();
        let value = self.expr()?;
        StmtKind::Assign { name, value }
      }
      _ => StmtKind::Expr(self.expr()?),
    };
    Ok(Stmt { line, kind })
  }

  fn expr(&mut self) -> Result<Expr, ParseError> {
    let mut e = self.primary()?;
    while self.at(&Token::Dot) {
      self.advance();
      let name = self.ident("property name")?;
      e = Expr::Property {
        target: Box::new(e),
        name,
      };
    }
    Ok(e)
  }

  fn primary(&mut self) -> Result<Expr, ParseError> {
    let line = self.line();
    match self.advance() {
      Token::Int(n) => Ok(Expr::Int(n)),
      Token::Str { text, interpolate } => {
        if interpolate && text.contains("${") {
          Ok(Expr::GString(text))
        } else {
          Ok(Expr::Str(text))
        }
      }
      Token::True => Ok(Expr::Bool(true)),
      Token::False => Ok(Expr::Bool(false)),
      Token::Null => Ok(Expr::Null),
      Token::LBrace => {
        let body = self.statements(true)?;
        self.expect(Token::RBrace, "'}' closing closure")?;
        Ok(Expr::Closure(body))
      }
      Token::LBracket => self.list_or_map(),
      Token::Ident(name) => self.after_ident(name, line),
      _ => {
        self.pos -= 1;
        Err(self.unexpected("expression"))
      }
    }
  }

  fn after_ident(&mut self, name: String, line: u32) -> Result<Expr, ParseError> {
    match self.peek() {
      Token::LParen => {
        self.advance();
        let mut args = self.args(&Token::RParen)?;
        self.expect(Token::RParen, "')'")?;
        if self.at(&Token::LBrace) {
          self.advance();
          let body = self.statements(true)?;
          self.expect(Token::RBrace, "'}' closing closure")?;
          args.push(Arg::Positional(Expr::Closure(body)));
        }
        Ok(Expr::Call { name, args, line })
      }
      Token::LBrace => {
        self.advance();
        let body = self.statements(true)?;
        self.expect(Token::RBrace, "'}' closing closure")?;
        Ok(Expr::Call {
          name,
          args: vec![Arg::Positional(Expr::Closure(body))],
          line,
        })
      }
      Token::Str { .. }
      | Token::Int(_)
      | Token::True
      | Token::False
      | Token::Null
      | Token::LBracket
      | Token::Ident(_) => {
        let args = self.command_args()?;
        Ok(Expr::Call { name, args, line })
      }
      _ => Ok(Expr::Var(name)),
    }
  }

  /// Arguments of a command-style call: `echo "hi"` or `parallel a: {..}, b: {..}`.
  fn command_args(&mut self) -> Result<Vec<Arg>, ParseError> {
    let mut args = vec![self.arg()?];
    while self.at(&Token::Comma) {
      self.advance();
      self.skip_newlines();
      args.push(self.arg()?);
    }
    Ok(args)
  }

  fn args(&mut self, close: &Token) -> Result<Vec<Arg>, ParseError> {
    let mut args = Vec::new();
    self.skip_newlines();
    if self.peek() == close {
      return Ok(args);
    }
    loop {
      args.push(self.arg()?);
      self.skip_newlines();
      if self.at(&Token::Comma) {
        self.advance();
        self.skip_newlines();
        continue;
      }
      break;
    }
    Ok(args)
  }

  fn arg(&mut self) -> Result<Arg, ParseError> {
    if let Token::Ident(name) = self.peek().clone() {
      if self.peek_at(1) == &Token::Colon {
        self.advance();
        self.advance();
        self.skip_newlines();
        return Ok(Arg::Named(name, self.expr()?));
      }
    }
    Ok(Arg::Positional(self.expr()?))
  }

  fn list_or_map(&mut self) -> Result<Expr, ParseError> {
    self.skip_newlines();
    if self.at(&Token::Colon) {
      self.advance();
      self.expect(Token::RBracket, "']' after '[:'")?;
      return Ok(Expr::Map(Vec::new()));
    }
    if self.at(&Token::RBracket) {
      self.advance();
      return Ok(Expr::List(Vec::new()));
    }
    let is_map = matches!(self.peek(), Token::Ident(_) | Token::Str { .. })
      && self.peek_at(1) == &Token::Colon;
    if is_map {
      let mut entries = Vec::new();
      loop {
        let key = match self.advance() {
          Token::Ident(k) => k,
          Token::Str { text, .. } => text,
          _ => {
            self.pos -= 1;
            return Err(self.unexpected("map key"));
          }
        };
        self.expect(Token::Colon, "':'")?;
        self.skip_newlines();
        entries.push((key, self.expr()?));
        self.skip_newlines();
        if self.at(&Token::Comma) {
          self.advance();
          self.skip_newlines();
          continue;
        }
        break;
      }
      self.expect(Token::RBracket, "']'")?;
      return Ok(Expr::Map(entries));
    }
    let mut items = Vec::new();
    loop {
      items.push(self.expr()?);
      self.skip_newlines();
      if self.at(&Token::Comma) {
        self.advance();
        self.skip_newlines();
        continue;
      }
      break;
    }
    self.expect(Token::RBracket, "']'")?;
    Ok(Expr::List(items))
  }
}
