use logos::{Lexer, Logos, Skip};

/// Raw lexemes recognized by logos. `TokenKind` is the parser-facing
/// superset that adds the `Error` and `Eof` sentinels.
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(extras = u32)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
enum Lexeme {
    #[regex(r"\n", newline)]
    Newline,

    // Single-character tokens
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,
    #[token("{")]
    OpenCurly,
    #[token("}")]
    CloseCurly,
    #[token("[")]
    OpenSquare,
    #[token("]")]
    CloseSquare,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(";")]
    Semicolon,
    #[token("~")]
    Tilde,
    #[token("^")]
    Caret,

    // One or two character tokens
    #[token("+")]
    Plus,
    #[token("+=")]
    PlusEqual,
    #[token("-")]
    Minus,
    #[token("-=")]
    MinusEqual,
    #[token("*")]
    Star,
    #[token("*=")]
    StarEqual,
    #[token("/")]
    Slash,
    #[token("/=")]
    SlashEqual,
    #[token("!")]
    Excl,
    #[token("!=")]
    ExclEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,
    #[token("&")]
    Amp,
    #[token("&&")]
    AmpAmp,
    #[token("|")]
    Pipe,
    #[token("||")]
    PipePipe,

    // Literals
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Identifier,
    #[regex(r#""[^"]*""#, multiline)]
    #[regex(r"'[^']*'", multiline)]
    Str,
    #[regex(r"[0-9]+(\.[0-9]+)?")]
    Number,

    // Keywords
    #[token("class")]
    Class,
    #[token("else")]
    Else,
    #[token("false")]
    False,
    #[token("func")]
    Func,
    #[token("for")]
    For,
    #[token("if")]
    If,
    #[token("null")]
    Null,
    #[token("print")]
    Print,
    #[token("return")]
    Return,
    #[token("super")]
    Super,
    #[token("this")]
    This,
    #[token("true")]
    True,
    #[token("var")]
    Var,
    #[token("while")]
    While,
}

fn newline(lex: &mut Lexer<'_, Lexeme>) -> Skip {
    lex.extras += 1;
    Skip
}

/// String literals may span lines; the line counter has to keep up.
fn multiline(lex: &mut Lexer<'_, Lexeme>) {
    lex.extras += lex.slice().bytes().filter(|&b| b == b'\n').count() as u32;
}

/// Identifies the kind of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    OpenParen,
    CloseParen,
    OpenCurly,
    CloseCurly,
    OpenSquare,
    CloseSquare,
    Comma,
    Dot,
    Semicolon,
    Tilde,
    Caret,
    Plus,
    PlusEqual,
    Minus,
    MinusEqual,
    Star,
    StarEqual,
    Slash,
    SlashEqual,
    Excl,
    ExclEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Amp,
    AmpAmp,
    Pipe,
    PipePipe,
    Identifier,
    Str,
    Number,
    Class,
    Else,
    False,
    Func,
    For,
    If,
    Null,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    /// Carries a human-readable message in `Token::text` instead of source.
    Error,
    Eof,
}

impl From<Lexeme> for TokenKind {
    fn from(lexeme: Lexeme) -> Self {
        match lexeme {
            // Skipped via callback, never yielded.
            Lexeme::Newline => unreachable!("newlines are skipped"),
            Lexeme::OpenParen => TokenKind::OpenParen,
            Lexeme::CloseParen => TokenKind::CloseParen,
            Lexeme::OpenCurly => TokenKind::OpenCurly,
            Lexeme::CloseCurly => TokenKind::CloseCurly,
            Lexeme::OpenSquare => TokenKind::OpenSquare,
            Lexeme::CloseSquare => TokenKind::CloseSquare,
            Lexeme::Comma => TokenKind::Comma,
            Lexeme::Dot => TokenKind::Dot,
            Lexeme::Semicolon => TokenKind::Semicolon,
            Lexeme::Tilde => TokenKind::Tilde,
            Lexeme::Caret => TokenKind::Caret,
            Lexeme::Plus => TokenKind::Plus,
            Lexeme::PlusEqual => TokenKind::PlusEqual,
            Lexeme::Minus => TokenKind::Minus,
            Lexeme::MinusEqual => TokenKind::MinusEqual,
            Lexeme::Star => TokenKind::Star,
            Lexeme::StarEqual => TokenKind::StarEqual,
            Lexeme::Slash => TokenKind::Slash,
            Lexeme::SlashEqual => TokenKind::SlashEqual,
            Lexeme::Excl => TokenKind::Excl,
            Lexeme::ExclEqual => TokenKind::ExclEqual,
            Lexeme::Equal => TokenKind::Equal,
            Lexeme::EqualEqual => TokenKind::EqualEqual,
            Lexeme::Greater => TokenKind::Greater,
            Lexeme::GreaterEqual => TokenKind::GreaterEqual,
            Lexeme::Less => TokenKind::Less,
            Lexeme::LessEqual => TokenKind::LessEqual,
            Lexeme::Amp => TokenKind::Amp,
            Lexeme::AmpAmp => TokenKind::AmpAmp,
            Lexeme::Pipe => TokenKind::Pipe,
            Lexeme::PipePipe => TokenKind::PipePipe,
            Lexeme::Identifier => TokenKind::Identifier,
            Lexeme::Str => TokenKind::Str,
            Lexeme::Number => TokenKind::Number,
            Lexeme::Class => TokenKind::Class,
            Lexeme::Else => TokenKind::Else,
            Lexeme::False => TokenKind::False,
            Lexeme::Func => TokenKind::Func,
            Lexeme::For => TokenKind::For,
            Lexeme::If => TokenKind::If,
            Lexeme::Null => TokenKind::Null,
            Lexeme::Print => TokenKind::Print,
            Lexeme::Return => TokenKind::Return,
            Lexeme::Super => TokenKind::Super,
            Lexeme::This => TokenKind::This,
            Lexeme::True => TokenKind::True,
            Lexeme::Var => TokenKind::Var,
            Lexeme::While => TokenKind::While,
        }
    }
}

/// One lexed token: kind, source text, and the line it ended on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

impl Token {
    pub fn eof() -> Self {
        Token {
            kind: TokenKind::Eof,
            text: String::new(),
            line: 0,
        }
    }
}

/// Pull-based tokenizer. Each call to [`scan_token`](Scanner::scan_token)
/// yields the next token; after the end of input it yields `Eof` forever.
pub struct Scanner<'src> {
    lexer: Lexer<'src, Lexeme>,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        let mut lexer = Lexeme::lexer(source);
        lexer.extras = 1;
        Scanner { lexer }
    }

    pub fn scan_token(&mut self) -> Token {
        match self.lexer.next() {
            None => Token {
                kind: TokenKind::Eof,
                text: String::new(),
                line: self.lexer.extras,
            },
            Some(Err(())) => {
                let slice = self.lexer.slice();
                let message = if slice.starts_with('"') || slice.starts_with('\'') {
                    "Unterminated string literal."
                } else {
                    "Unexpected character in input."
                };
                Token {
                    kind: TokenKind::Error,
                    text: message.to_string(),
                    line: self.lexer.extras,
                }
            }
            Some(Ok(lexeme)) => Token {
                kind: lexeme.into(),
                text: self.lexer.slice().to_string(),
                line: self.lexer.extras,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(source: &str) -> Vec<Token> {
        let mut scanner = Scanner::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = scanner.scan_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        tokens
    }

    #[test]
    fn scan_var_declaration() {
        let tokens = scan_all("var x = 5;");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
        assert_eq!(tokens[1].text, "x");
        assert!(tokens.iter().all(|t| t.line == 1));
    }

    #[test]
    fn scan_two_character_operators() {
        let tokens = scan_all("== != <= >= && || += -=");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::EqualEqual,
                TokenKind::ExclEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scan_string_literals_both_delimiters() {
        let tokens = scan_all(r#""hello" 'world'"#);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "\"hello\"");
        assert_eq!(tokens[1].kind, TokenKind::Str);
        assert_eq!(tokens[1].text, "'world'");
    }

    #[test]
    fn scan_unterminated_string_is_error() {
        let tokens = scan_all("\"oops");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].text, "Unterminated string literal.");
    }

    #[test]
    fn scan_comment_ignored() {
        let tokens = scan_all("// a comment\nprint 1;");
        assert_eq!(tokens[0].kind, TokenKind::Print);
        assert_eq!(tokens[0].line, 2);
    }

    #[test]
    fn scan_lines_advance() {
        let tokens = scan_all("var a;\nvar b;\nvar c;");
        let lines: Vec<u32> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Var)
            .map(|t| t.line)
            .collect();
        assert_eq!(lines, vec![1, 2, 3]);
    }

    #[test]
    fn scan_keywords_vs_identifiers() {
        let tokens = scan_all("classy class this_one this");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::Class,
                TokenKind::Identifier,
                TokenKind::This,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scan_numbers() {
        let tokens = scan_all("12 3.5");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].text, "12");
        assert_eq!(tokens[1].text, "3.5");
    }

    #[test]
    fn scan_after_eof_stays_eof() {
        let mut scanner = Scanner::new(";");
        assert_eq!(scanner.scan_token().kind, TokenKind::Semicolon);
        assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
        assert_eq!(scanner.scan_token().kind, TokenKind::Eof);
    }
}
