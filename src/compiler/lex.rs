use crate::compiler::token::{Token, TokenKind};

/// This represents a lexer object.
/// A lexer walks a source buffer and produces tokens on demand;
/// the parser pulls them one at a time, so the whole token stream is
/// never materialized. Lexemes are slices of the source, error tokens
/// carry a static message, and the lexer tracks the current line.
#[derive(Debug)]
pub struct Lexer<'src> {
    source: &'src str,
    /// Byte offset where the token being scanned starts.
    start: usize,
    /// Byte offset of the next unconsumed character.
    current: usize,
    line: u32,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Lexer<'src> {
        Lexer {
            source,
            start: 0,
            current: 0,
            line: 1,
        }
    }

    /// Scans the next token, skipping whitespace and `//` comments.
    pub fn next_token(&mut self) -> Token<'src> {
        self.strip();
        self.start = self.current;

        let c = match self.advance() {
            Some(c) => c,
            None => return self.make(TokenKind::Eof),
        };

        match c {
            b'(' => self.make(TokenKind::LeftParen),
            b')' => self.make(TokenKind::RightParen),
            b'{' => self.make(TokenKind::LeftBrace),
            b'}' => self.make(TokenKind::RightBrace),
            b',' => self.make(TokenKind::Comma),
            b'.' => self.make(TokenKind::Dot),
            b'-' => self.make(TokenKind::Minus),
            b'+' => self.make(TokenKind::Plus),
            b';' => self.make(TokenKind::Semicolon),
            b'/' => self.make(TokenKind::Slash),
            b'*' => self.make(TokenKind::Star),
            b'!' => self.either(b'=', TokenKind::BangEqual, TokenKind::Bang),
            b'=' => self.either(b'=', TokenKind::EqualEqual, TokenKind::Equal),
            b'<' => self.either(b'=', TokenKind::LessEqual, TokenKind::Less),
            b'>' => self.either(b'=', TokenKind::GreaterEqual, TokenKind::Greater),
            b'"' => self.string(),
            b'0'..=b'9' => self.number(),
            c if is_name_start(c) => self.identifier(),
            _ => self.error("Unexpected character."),
        }
    }

    // helpers

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn advance(&mut self) -> Option<u8> {
        let byte = self.source.as_bytes().get(self.current).copied()?;
        self.current += 1;
        Some(byte)
    }

    fn peek(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current).copied()
    }

    fn peek_next(&self) -> Option<u8> {
        self.source.as_bytes().get(self.current + 1).copied()
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn either(&mut self, expected: u8, two: TokenKind, one: TokenKind) -> Token<'src> {
        let kind = if self.matches(expected) { two } else { one };
        self.make(kind)
    }

    fn make(&self, kind: TokenKind) -> Token<'src> {
        Token {
            kind,
            lexeme: &self.source[self.start..self.current],
            line: self.line,
        }
    }

    fn error(&self, message: &'static str) -> Token<'src> {
        Token {
            kind: TokenKind::Error,
            lexeme: message,
            line: self.line,
        }
    }

    /// Eats whitespace and line comments, counting newlines.
    fn strip(&mut self) {
        loop {
            match self.peek() {
                Some(b' ' | b'\r' | b'\t') => {
                    self.current += 1;
                },
                Some(b'\n') => {
                    self.line += 1;
                    self.current += 1;
                },
                Some(b'/') if self.peek_next() == Some(b'/') => {
                    // eat the comment until the end of the line
                    while !self.is_at_end() && self.peek() != Some(b'\n') {
                        self.current += 1;
                    }
                },
                _ => break,
            }
        }
    }

    // token classifiers

    /// A string literal: everything between two `"`s, verbatim.
    /// No escape processing; newlines are legal and counted.
    fn string(&mut self) -> Token<'src> {
        while let Some(c) = self.peek() {
            match c {
                b'"' => {
                    self.current += 1;
                    return self.make(TokenKind::Str);
                },
                b'\n' => {
                    self.line += 1;
                    self.current += 1;
                },
                _ => self.current += 1,
            }
        }

        self.error("Unterminated string.")
    }

    /// Decimal digits with an optional single decimal point.
    fn number(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.current += 1;
        }

        if self.peek() == Some(b'.') && matches!(self.peek_next(), Some(b'0'..=b'9')) {
            self.current += 1;
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.current += 1;
            }
        }

        self.make(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while matches!(self.peek(), Some(c) if is_name_start(c) || c.is_ascii_digit()) {
            self.current += 1;
        }

        self.make(keyword(&self.source[self.start..self.current]))
    }
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

/// Distinguishes keywords from plain identifiers.
fn keyword(name: &str) -> TokenKind {
    match name {
        "and" => TokenKind::And,
        "class" => TokenKind::Class,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "fn" => TokenKind::Fn,
        "for" => TokenKind::For,
        "if" => TokenKind::If,
        "nil" => TokenKind::Nil,
        "or" => TokenKind::Or,
        "return" => TokenKind::Return,
        "super" => TokenKind::Super,
        "this" => TokenKind::This,
        "true" => TokenKind::True,
        "var" => TokenKind::Var,
        "while" => TokenKind::While,
        _ => TokenKind::Identifier,
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn lex_all(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = vec![];
        loop {
            let token = lexer.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex_all(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lex_empty() {
        // no source code? straight to Eof.
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
    }

    #[test]
    fn lex_assignment() {
        let tokens = lex_all("var heck = true;");
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::True,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ],
        );
        assert_eq!(tokens[1].lexeme, "heck");
    }

    #[test]
    fn two_character_operators() {
        assert_eq!(
            kinds("== != <= >= = ! < >"),
            vec![
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::Equal,
                TokenKind::Bang,
                TokenKind::Less,
                TokenKind::Greater,
                TokenKind::Eof,
            ],
        );
    }

    #[test]
    fn numbers() {
        let tokens = lex_all("1 23.5 4.");
        assert_eq!(tokens[0].lexeme, "1");
        assert_eq!(tokens[1].lexeme, "23.5");
        // the trailing dot is not part of the number
        assert_eq!(tokens[2].lexeme, "4");
        assert_eq!(tokens[3].kind, TokenKind::Dot);
    }

    #[test]
    fn strings_keep_their_quotes() {
        let tokens = lex_all("\"hello\"");
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].lexeme, "\"hello\"");
    }

    #[test]
    fn unterminated_string() {
        let tokens = lex_all("\"oops");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unterminated string.");
    }

    #[test]
    fn unexpected_character() {
        let tokens = lex_all("@");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unexpected character.");
    }

    #[test]
    fn comments_and_lines() {
        let tokens = lex_all("a // comment\nb");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[1].lexeme, "b");
    }

    #[test]
    fn keywords_against_identifiers() {
        assert_eq!(kinds("fn")[0], TokenKind::Fn);
        assert_eq!(kinds("fnord")[0], TokenKind::Identifier);
        assert_eq!(kinds("classy")[0], TokenKind::Identifier);
        assert_eq!(kinds("superb")[0], TokenKind::Identifier);
    }

    proptest! {
        #[test]
        fn doesnt_crash(s in "\\PC*") {
            lex_all(&s);
        }

        #[test]
        fn numbers_lex_to_a_single_token(x in 0.0f64..1e9) {
            let formatted = format!("{}", x);
            let tokens = lex_all(&formatted);
            prop_assert_eq!(tokens.len(), 2);
            prop_assert_eq!(tokens[0].kind, TokenKind::Number);
            prop_assert_eq!(tokens[0].lexeme, formatted.as_str());
        }

        #[test]
        fn identifiers_roundtrip(s in "[a-zA-Z_][a-zA-Z0-9_]{0,12}") {
            let tokens = lex_all(&s);
            prop_assert_eq!(tokens.len(), 2);
            prop_assert_eq!(tokens[0].lexeme, s.as_str());
        }
    }
}
