use crate::errors::CodegenError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier,
    Number,
    Str,
    Char,
    If,
    Else,
    Goto,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Op,
}

/// One lexical unit of an instruction body. `index` is the token's
/// position in its stream; all "this exact occurrence" bookkeeping
/// (escaping-call boundaries, output stores) is keyed by `index`,
/// never by text equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
    pub column: u32,
    pub index: u32,
}

const MULTI_CHAR_OPS: &[&str] = &[
    "<<=", ">>=", "->", "++", "--", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=",
];

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.src.get(self.pos + n).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(b)
    }

    fn error(&self, message: &str) -> CodegenError {
        CodegenError::new(message, self.line, self.column)
    }

    fn skip_trivia(&mut self) -> Result<(), CodegenError> {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let (line, column) = (self.line, self.column);
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            Some(b'*') if self.peek_at(1) == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(CodegenError::new(
                                    "unterminated block comment",
                                    line,
                                    column,
                                ))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn quoted(&mut self, quote: u8) -> Result<String, CodegenError> {
        let start = self.pos;
        self.bump();
        loop {
            match self.peek() {
                Some(b'\\') => {
                    self.bump();
                    if self.bump().is_none() {
                        return Err(self.error("unterminated escape sequence"));
                    }
                }
                Some(b) if b == quote => {
                    self.bump();
                    break;
                }
                Some(b'\n') | None => {
                    return Err(self.error("unterminated literal"));
                }
                Some(_) => {
                    self.bump();
                }
            }
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }
}

fn ident_kind(text: &str) -> TokenKind {
    match text {
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "goto" => TokenKind::Goto,
        _ => TokenKind::Identifier,
    }
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, CodegenError> {
    let mut lx = Lexer::new(src);
    let mut tokens: Vec<Token> = Vec::new();
    loop {
        lx.skip_trivia()?;
        let Some(b) = lx.peek() else {
            break;
        };
        let (line, column) = (lx.line, lx.column);
        let index = tokens.len() as u32;
        let (kind, text) = match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                let start = lx.pos;
                while let Some(c) = lx.peek() {
                    if c.is_ascii_alphanumeric() || c == b'_' {
                        lx.bump();
                    } else {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&lx.src[start..lx.pos]).into_owned();
                (ident_kind(&text), text)
            }
            b'0'..=b'9' => {
                let start = lx.pos;
                while let Some(c) = lx.peek() {
                    if c.is_ascii_alphanumeric() || c == b'.' || c == b'_' {
                        lx.bump();
                    } else {
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&lx.src[start..lx.pos]).into_owned();
                (TokenKind::Number, text)
            }
            b'"' => (TokenKind::Str, lx.quoted(b'"')?),
            b'\'' => (TokenKind::Char, lx.quoted(b'\'')?),
            b'(' => {
                lx.bump();
                (TokenKind::LParen, "(".to_string())
            }
            b')' => {
                lx.bump();
                (TokenKind::RParen, ")".to_string())
            }
            b'{' => {
                lx.bump();
                (TokenKind::LBrace, "{".to_string())
            }
            b'}' => {
                lx.bump();
                (TokenKind::RBrace, "}".to_string())
            }
            b',' => {
                lx.bump();
                (TokenKind::Comma, ",".to_string())
            }
            b';' => {
                lx.bump();
                (TokenKind::Semi, ";".to_string())
            }
            _ => {
                let rest = &lx.src[lx.pos..];
                let mut matched: Option<&str> = None;
                for op in MULTI_CHAR_OPS {
                    if rest.starts_with(op.as_bytes()) {
                        matched = Some(op);
                        break;
                    }
                }
                match matched {
                    Some(op) => {
                        for _ in 0..op.len() {
                            lx.bump();
                        }
                        (TokenKind::Op, op.to_string())
                    }
                    None => {
                        let c = lx.bump().expect("peeked byte");
                        (TokenKind::Op, (c as char).to_string())
                    }
                }
            }
        };
        tokens.push(Token {
            kind,
            text,
            line,
            column,
            index,
        });
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).expect("tokenize").iter().map(|t| t.kind).collect()
    }

    #[test]
    fn classifies_keywords_and_punctuation() {
        assert_eq!(
            kinds("if (a) { goto error; } else { b(); }"),
            vec![
                TokenKind::If,
                TokenKind::LParen,
                TokenKind::Identifier,
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::Goto,
                TokenKind::Identifier,
                TokenKind::Semi,
                TokenKind::RBrace,
                TokenKind::Else,
                TokenKind::LBrace,
                TokenKind::Identifier,
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Semi,
                TokenKind::RBrace,
            ]
        );
    }

    #[test]
    fn maximal_munch_operators() {
        let toks = tokenize("a == b = c <<= d").expect("tokenize");
        let ops: Vec<&str> = toks
            .iter()
            .filter(|t| t.kind == TokenKind::Op)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(ops, vec!["==", "=", "<<="]);
    }

    #[test]
    fn tracks_positions_and_indices() {
        let toks = tokenize("x\n  y").expect("tokenize");
        assert_eq!((toks[0].line, toks[0].column), (1, 1));
        assert_eq!((toks[1].line, toks[1].column), (2, 3));
        assert_eq!(toks[1].index, 1);
    }

    #[test]
    fn skips_comments() {
        let toks = tokenize("a // trailing\n/* block\n */ b").expect("tokenize");
        let texts: Vec<&str> = toks.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("\"abc").expect_err("must fail");
        assert!(err.message.contains("unterminated"));
    }
}
