//! Tokenizer for pipeline scripts.

use super::ParseError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
  Ident(String),
  /// String literal; `interpolate` is true for double-quoted strings.
  Str { text: String, interpolate: bool },
  Int(i64),
  LParen,
  RParen,
  LBrace,
  RBrace,
  LBracket,
  RBracket,
  Comma,
  Colon,
  Assign,
  Dot,
  Semi,
  Newline,
  Def,
  Try,
  Catch,
  True,
  False,
  Null,
  Eof,
}

/// A token with the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Lexed {
  pub token: Token,
  pub line: u32,
}

/// Splits `source` into tokens. Consecutive newlines collapse into one `Newline` token.
pub fn tokenize(source: &str) -> Result<Vec<Lexed>, ParseError> {
  let chars: Vec<char> = source.chars().collect();
  let mut out: Vec<Lexed> = Vec::new();
  let mut i = 0;
  let mut line: u32 = 1;

  while i < chars.len() {
    let c = chars[i];
    if c == '\n' {
      if !matches!(out.last().map(|l| &l.token), Some(Token::Newline) | None) {
        out.push(Lexed {
          token: Token::Newline,
          line,
        });
      }
      line += 1;
      i += 1;
      continue;
    }
    if c.is_whitespace() {
      i += 1;
      continue;
    }
    if c == '/' && chars.get(i + 1) == Some(&'/') {
      while i < chars.len() && chars[i] != '\n' {
        i += 1;
      }
      continue;
    }
    if c == '/' && chars.get(i + 1) == Some(&'*') {
      i += 2;
      while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
        if chars[i] == '\n' {
          line += 1;
        }
        i += 1;
      }
      if i >= chars.len() {
        return Err(ParseError::new(line, "unterminated block comment"));
      }
      i += 2;
      continue;
    }

    let start_line = line;
    let token = match c {
      '(' => Token::LParen,
      ')' => Token::RParen,
      '{' => Token::LBrace,
      '}' => Token::RBrace,
      '[' => Token::LBracket,
      ']' => Token::RBracket,
      ',' => Token::Comma,
      ':' => Token::Colon,
      '=' => Token::Assign,
      '.' => Token::Dot,
      ';' => Token::Semi,
      '\'' | '"' => {
        let (text, next, lines) = read_string(&chars, i, start_line)?;
        i = next;
        line += lines;
        out.push(Lexed {
          token: Token::Str {
            text,
            interpolate: c == '"',
          },
          line: start_line,
        });
        continue;
      }
      d if d.is_ascii_digit() => {
        let begin = i;
        while i < chars.len() && chars[i].is_ascii_digit() {
          i += 1;
        }
        let digits: String = chars[begin..i].iter().collect();
        let n = digits
          .parse::<i64>()
          .map_err(|e| ParseError::new(line, format!("bad integer '{}': {}", digits, e)))?;
        out.push(Lexed {
          token: Token::Int(n),
          line,
        });
        continue;
      }
      a if a.is_ascii_alphabetic() || a == '_' || a == '$' => {
        let begin = i;
        while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
          i += 1;
        }
        let word: String = chars[begin..i].iter().collect();
        let token = match word.as_str() {
          "def" => Token::Def,
          "try" => Token::Try,
          "catch" => Token::Catch,
          "true" => Token::True,
          "false" => Token::False,
          "null" => Token::Null,
          _ => Token::Ident(word),
        };
        out.push(Lexed { token, line });
        continue;
      }
      other => {
        return Err(ParseError::new(
          line,
          format!("unexpected character '{}'", other),
        ));
      }
    };
    out.push(Lexed {
      token,
      line: start_line,
    });
    i += 1;
  }

  out.push(Lexed {
    token: Token::Eof,
    line,
  });
  Ok(out)
}

/// Reads a quoted string starting at `start` (the opening quote).
/// Returns the unescaped text, the index after the closing quote, and newlines consumed.
fn read_string(chars: &[char], start: usize, line: u32) -> Result<(String, usize, u32), ParseError> {
  let quote = chars[start];
  let mut i = start + 1;
  let mut text = String::new();
  let mut lines = 0;
  while i < chars.len() {
    let c = chars[i];
    if c == quote {
      return Ok((text, i + 1, lines));
    }
    if c == '\\' {
      let escaped = chars
        .get(i + 1)
        .ok_or_else(|| ParseError::new(line + lines, "unterminated escape"))?;
      match escaped {
        'n' => text.push('\n'),
        't' => text.push('\t'),
        '\\' => text.push('\\'),
        '\'' => text.push('\''),
        '"' => text.push('"'),
        // Kept escaped so interpolation leaves it alone.
        '$' => text.push_str("\\$"),
        other => {
          text.push('\\');
          text.push(*other);
        }
      }
      i += 2;
      continue;
    }
    if c == '\n' {
      lines += 1;
    }
    text.push(c);
    i += 1;
  }
  Err(ParseError::new(line, "unterminated string literal"))
}
