//! Tokenizer for the candidate dialect.
//!
//! Tracks whether a line break precedes each token so the parser can apply
//! automatic semicolon insertion.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    String(String),
    Template(Vec<TemplatePart>),
    Ident(String),
    Keyword(Keyword),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Str(String),
    /// Source of a `${...}` substitution, parsed separately.
    Expr { source: String, line: usize, col: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Var,
    Let,
    Const,
    Function,
    Return,
    If,
    Else,
    For,
    While,
    Do,
    Break,
    Continue,
    New,
    Typeof,
    Instanceof,
    In,
    True,
    False,
    Null,
    This,
    Throw,
    Try,
    Catch,
    Finally,
    Switch,
    Case,
    Default,
    Await,
    Delete,
    Void,
    Class,
    Yield,
    Import,
    Export,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("var", Keyword::Var),
    ("let", Keyword::Let),
    ("const", Keyword::Const),
    ("function", Keyword::Function),
    ("return", Keyword::Return),
    ("if", Keyword::If),
    ("else", Keyword::Else),
    ("for", Keyword::For),
    ("while", Keyword::While),
    ("do", Keyword::Do),
    ("break", Keyword::Break),
    ("continue", Keyword::Continue),
    ("new", Keyword::New),
    ("typeof", Keyword::Typeof),
    ("instanceof", Keyword::Instanceof),
    ("in", Keyword::In),
    ("true", Keyword::True),
    ("false", Keyword::False),
    ("null", Keyword::Null),
    ("this", Keyword::This),
    ("throw", Keyword::Throw),
    ("try", Keyword::Try),
    ("catch", Keyword::Catch),
    ("finally", Keyword::Finally),
    ("switch", Keyword::Switch),
    ("case", Keyword::Case),
    ("default", Keyword::Default),
    ("await", Keyword::Await),
    ("delete", Keyword::Delete),
    ("void", Keyword::Void),
    ("class", Keyword::Class),
    ("yield", Keyword::Yield),
    ("import", Keyword::Import),
    ("export", Keyword::Export),
];

impl Keyword {
    fn lookup(word: &str) -> Option<Keyword> {
        KEYWORDS
            .iter()
            .find(|(text, _)| *text == word)
            .map(|(_, kw)| *kw)
    }

    pub fn as_str(&self) -> &'static str {
        KEYWORDS
            .iter()
            .find(|(_, kw)| kw == self)
            .map_or("", |(text, _)| *text)
    }
}

/// Longest first, so greedy matching picks `>>>=` before `>>`.
const PUNCTUATORS: &[&str] = &[
    ">>>=", "...", "===", "!==", "**=", "<<=", ">>=", ">>>", "&&=", "||=", "??=", "=>", "==",
    "!=", "<=", ">=", "&&", "||", "??", "?.", "++", "--", "+=", "-=", "*=", "/=", "%=", "&=",
    "|=", "^=", "**", "<<", ">>", "{", "}", "(", ")", "[", "]", ";", ",", "<", ">", "+", "-",
    "*", "/", "%", "&", "|", "^", "!", "~", "?", ":", "=", ".",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
    pub newline_before: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} ({line}:{col})")]
pub struct SyntaxError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self::starting_at(source, 1, 1)
    }

    /// Lexer for a fragment whose first character sits at `line:col`.
    pub fn starting_at(source: &str, line: usize, col: usize) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line,
            col,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut tokens = Vec::new();
        loop {
            let newline_before = self.skip_trivia()?;
            let (line, col) = (self.line, self.col);
            let kind = match self.peek() {
                None => TokenKind::Eof,
                Some(c) => self.scan(c)?,
            };
            let done = kind == TokenKind::Eof;
            tokens.push(Token {
                kind,
                line,
                col,
                newline_before,
            });
            if done {
                return Ok(tokens);
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            message: message.into(),
            line: self.line,
            col: self.col,
        }
    }

    /// Skips whitespace and comments, reporting whether a line break was seen.
    fn skip_trivia(&mut self) -> Result<bool, SyntaxError> {
        let mut newline = false;
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    newline = true;
                    self.bump();
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                '/' if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '/' if self.peek_at(1) == Some('*') => {
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            None => return Err(self.error("Unterminated comment")),
                            Some('\n') => newline = true,
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(newline)
    }

    fn scan(&mut self, c: char) -> Result<TokenKind, SyntaxError> {
        if c.is_ascii_digit() || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
        {
            return self.scan_number();
        }
        if c == '"' || c == '\'' {
            return self.scan_string(c).map(TokenKind::String);
        }
        if c == '`' {
            return self.scan_template();
        }
        if c.is_alphabetic() || c == '_' || c == '$' {
            let mut word = String::new();
            while let Some(c) = self.peek() {
                if c.is_alphanumeric() || c == '_' || c == '$' {
                    word.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            return Ok(match Keyword::lookup(&word) {
                Some(kw) => TokenKind::Keyword(kw),
                None => TokenKind::Ident(word),
            });
        }
        for punct in PUNCTUATORS {
            if self.matches(punct) {
                // `a?.5:b` is a conditional, not optional chaining.
                if *punct == "?." && self.peek_at(2).is_some_and(|d| d.is_ascii_digit()) {
                    continue;
                }
                for _ in 0..punct.chars().count() {
                    self.bump();
                }
                return Ok(TokenKind::Punct(punct));
            }
        }
        Err(self.error(format!("Invalid or unexpected token '{c}'")))
    }

    fn matches(&self, text: &str) -> bool {
        text.chars()
            .enumerate()
            .all(|(i, expected)| self.peek_at(i) == Some(expected))
    }

    fn scan_number(&mut self) -> Result<TokenKind, SyntaxError> {
        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => Some(16),
                Some('b' | 'B') => Some(2),
                Some('o' | 'O') => Some(8),
                _ => None,
            };
            if let Some(radix) = radix {
                self.bump();
                self.bump();
                let mut digits = String::new();
                while let Some(c) = self.peek() {
                    if c == '_' {
                        self.bump();
                    } else if c.is_digit(radix) {
                        digits.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
                let value = u64::from_str_radix(&digits, radix)
                    .map_err(|_| self.error("Invalid numeric literal"))?;
                return self.finish_number(value as f64);
            }
        }

        let mut text = String::new();
        let mut seen_dot = false;
        let mut seen_exp = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => text.push(c),
                '_' => {}
                '.' if !seen_dot && !seen_exp => {
                    seen_dot = true;
                    text.push(c);
                }
                'e' | 'E' if !seen_exp => {
                    seen_exp = true;
                    text.push('e');
                    if let Some(sign @ ('+' | '-')) = self.peek_at(1) {
                        self.bump();
                        text.push(sign);
                    }
                }
                _ => break,
            }
            self.bump();
        }
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(format!("Invalid numeric literal '{text}'")))?;
        self.finish_number(value)
    }

    fn finish_number(&mut self, value: f64) -> Result<TokenKind, SyntaxError> {
        match self.peek() {
            Some('n') => Err(self.error("BigInt literals are not supported")),
            Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {
                Err(self.error("Invalid or unexpected token"))
            }
            _ => Ok(TokenKind::Number(value)),
        }
    }

    fn scan_string(&mut self, quote: char) -> Result<String, SyntaxError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("Invalid or unexpected token")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => {
                    if let Some(c) = self.scan_escape()? {
                        out.push(c);
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }

    /// Reads the character after a backslash. `None` for line continuations.
    fn scan_escape(&mut self) -> Result<Option<char>, SyntaxError> {
        let c = self
            .bump()
            .ok_or_else(|| self.error("Invalid or unexpected token"))?;
        let escaped = match c {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            'v' => '\u{b}',
            '0' => '\0',
            '\n' => return Ok(None),
            'x' => self.scan_hex_digits(2)?,
            'u' => {
                if self.peek() == Some('{') {
                    self.bump();
                    let mut digits = String::new();
                    while let Some(c) = self.bump() {
                        if c == '}' {
                            break;
                        }
                        digits.push(c);
                    }
                    self.char_from_hex(&digits)?
                } else {
                    self.scan_unit_escape()?
                }
            }
            other => other,
        };
        Ok(Some(escaped))
    }

    fn scan_hex_digits(&mut self, count: usize) -> Result<char, SyntaxError> {
        let mut digits = String::new();
        for _ in 0..count {
            match self.bump() {
                Some(c) => digits.push(c),
                None => return Err(self.error("Invalid hexadecimal escape sequence")),
            }
        }
        self.char_from_hex(&digits)
    }

    /// `\uXXXX`. A surrogate pair spelled as two escapes joins into one
    /// character; a lone surrogate becomes U+FFFD.
    fn scan_unit_escape(&mut self) -> Result<char, SyntaxError> {
        let high = self.scan_hex_code(4)?;
        if !(0xD800..0xDC00).contains(&high) {
            return Ok(char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER));
        }
        let low = (self.peek() == Some('\\') && self.peek_at(1) == Some('u'))
            .then(|| {
                let digits: String = (2..6).filter_map(|offset| self.peek_at(offset)).collect();
                u32::from_str_radix(&digits, 16).ok().filter(|_| digits.len() == 4)
            })
            .flatten()
            .filter(|low| (0xDC00..0xE000).contains(low));
        let Some(low) = low else {
            return Ok(char::REPLACEMENT_CHARACTER);
        };
        for _ in 0..6 {
            self.bump();
        }
        let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
        Ok(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    fn scan_hex_code(&mut self, count: usize) -> Result<u32, SyntaxError> {
        let mut digits = String::new();
        for _ in 0..count {
            match self.bump() {
                Some(c) => digits.push(c),
                None => return Err(self.error("Invalid Unicode escape sequence")),
            }
        }
        u32::from_str_radix(&digits, 16).map_err(|_| self.error("Invalid Unicode escape sequence"))
    }

    fn char_from_hex(&self, digits: &str) -> Result<char, SyntaxError> {
        u32::from_str_radix(digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error("Invalid Unicode escape sequence"))
    }

    fn scan_template(&mut self) -> Result<TokenKind, SyntaxError> {
        self.bump();
        let mut parts = Vec::new();
        let mut current = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("Unterminated template literal")),
                Some('`') => break,
                Some('\\') => {
                    if let Some(c) = self.scan_escape()? {
                        current.push(c);
                    }
                }
                Some('$') if self.peek() == Some('{') => {
                    self.bump();
                    parts.push(TemplatePart::Str(std::mem::take(&mut current)));
                    let (line, col) = (self.line, self.col);
                    let source = self.scan_substitution()?;
                    parts.push(TemplatePart::Expr { source, line, col });
                }
                Some(c) => current.push(c),
            }
        }
        parts.push(TemplatePart::Str(current));
        Ok(TokenKind::Template(parts))
    }

    /// Collects the source of a `${...}` up to its matching brace.
    fn scan_substitution(&mut self) -> Result<String, SyntaxError> {
        let mut depth = 0usize;
        let mut source = String::new();
        loop {
            let c = self
                .bump()
                .ok_or_else(|| self.error("Unterminated template literal"))?;
            match c {
                '{' => depth += 1,
                '}' if depth == 0 => return Ok(source),
                '}' => depth -= 1,
                '"' | '\'' | '`' => {
                    source.push(c);
                    while let Some(inner) = self.bump() {
                        source.push(inner);
                        if inner == '\\' {
                            if let Some(escaped) = self.bump() {
                                source.push(escaped);
                            }
                        } else if inner == c {
                            break;
                        }
                    }
                    continue;
                }
                _ => {}
            }
            source.push(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenizes_function_header() {
        assert_eq!(
            kinds("function f(a) {}"),
            vec![
                TokenKind::Keyword(Keyword::Function),
                TokenKind::Ident("f".to_string()),
                TokenKind::Punct("("),
                TokenKind::Ident("a".to_string()),
                TokenKind::Punct(")"),
                TokenKind::Punct("{"),
                TokenKind::Punct("}"),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("1 2.5 .5 1e3 0xff 1_000"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Number(2.5),
                TokenKind::Number(0.5),
                TokenKind::Number(1000.0),
                TokenKind::Number(255.0),
                TokenKind::Number(1000.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_longest_punctuator_wins() {
        assert_eq!(
            kinds("a >>>= b === c"),
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::Punct(">>>="),
                TokenKind::Ident("b".to_string()),
                TokenKind::Punct("==="),
                TokenKind::Ident("c".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#"'a\nb' "A\x42""#),
            vec![
                TokenKind::String("a\nb".to_string()),
                TokenKind::String("AB".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_surrogate_escapes() {
        assert_eq!(
            kinds(r#"'\uD83D\uDE00' '\uD800' '\uDC00x' '\uD800\u0041'"#),
            vec![
                TokenKind::String("😀".to_string()),
                TokenKind::String("\u{FFFD}".to_string()),
                TokenKind::String("\u{FFFD}x".to_string()),
                TokenKind::String("\u{FFFD}A".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_template_parts() {
        let tokens = kinds("`x=${ {a:1}.a } done`");
        let TokenKind::Template(parts) = &tokens[0] else {
            panic!("Expected template token");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], TemplatePart::Str("x=".to_string()));
        assert!(matches!(&parts[1], TemplatePart::Expr { source, .. } if source == " {a:1}.a "));
        assert_eq!(parts[2], TemplatePart::Str(" done".to_string()));
    }

    #[test]
    fn test_newline_flag_and_comments() {
        let tokens = Lexer::new("a // comment\n/* block\n */ b").tokenize().unwrap();
        assert!(!tokens[0].newline_before);
        assert!(tokens[1].newline_before);
        assert_eq!(tokens[1].line, 3);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = Lexer::new("let s = 'oops").tokenize().unwrap_err();
        assert_eq!(err.line, 1);
    }
}
