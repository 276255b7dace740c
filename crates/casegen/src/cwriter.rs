use crate::lexer::{Token, TokenKind};

/// Accumulates generated C text with brace-driven indentation and
/// minimal inter-token spacing. Output is compiler-clean rather than
/// pretty; an external formatter owns final layout.
#[derive(Debug, Default)]
pub struct CWriter {
    out: String,
    indent: usize,
    at_line_start: bool,
    last: Option<char>,
}

const INDENT: &str = "    ";

fn need_space(prev: char, next: char) -> bool {
    if prev == ' ' || next == ' ' {
        return false;
    }
    if matches!(next, ')' | ';' | ',' | ']' | '.') {
        return false;
    }
    if matches!(prev, '(' | '[' | '!' | '~' | '.') {
        return false;
    }
    if matches!(next, '(' | '[')
        && (prev.is_ascii_alphanumeric() || matches!(prev, '_' | ')' | ']'))
    {
        return false;
    }
    true
}

impl CWriter {
    pub fn new() -> Self {
        Self {
            out: String::new(),
            indent: 0,
            at_line_start: true,
            last: None,
        }
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn put(&mut self, ch: char) {
        if self.at_line_start {
            for _ in 0..self.indent {
                self.out.push_str(INDENT);
            }
            self.at_line_start = false;
        }
        self.out.push(ch);
        self.last = Some(ch);
    }

    fn write_raw(&mut self, s: &str, count_braces: bool) {
        for ch in s.chars() {
            match ch {
                '\n' => {
                    self.out.push('\n');
                    self.at_line_start = true;
                }
                '}' if count_braces => {
                    self.indent = self.indent.saturating_sub(1);
                    self.put(ch);
                }
                '{' if count_braces => {
                    self.put(ch);
                    self.indent += 1;
                }
                _ => self.put(ch),
            }
        }
    }

    fn spaced(&mut self, s: &str, count_braces: bool) {
        if let (false, Some(prev), Some(next)) = (self.at_line_start, self.last, s.chars().next()) {
            if need_space(prev, next) {
                self.out.push(' ');
            }
        }
        self.write_raw(s, count_braces);
    }

    pub fn emit_token(&mut self, tkn: &Token) {
        // Literal text may contain braces that must not drive indentation.
        let count_braces = !matches!(tkn.kind, TokenKind::Str | TokenKind::Char);
        self.spaced(&tkn.text, count_braces);
    }

    pub fn emit_str(&mut self, s: &str) {
        self.spaced(s, true);
    }

    pub fn start_line(&mut self) {
        if !self.at_line_start {
            self.out.push('\n');
            self.at_line_start = true;
        }
    }
}
