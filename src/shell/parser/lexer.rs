use std::fmt;

use thiserror::Error;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TokenKind {
    Word,
    Pipe,         // |
    Or,           // ||
    Amp,          // &
    And,          // &&
    Semi,         // ;
    Newline,      // \n
    RedirIn,      // <
    RedirOut,     // >
    RedirAppend,  // >>
    RedirHeredoc, // <<
    DupIn,        // <&N
    DupOut,       // >&N
    LParen,
    RParen,
    LBrace,
    RBrace,
    Bang,
    If,
    Then,
    Elif,
    Else,
    Fi,
    While,
    For,
    Do,
    Done,
    In,
    Function,
    Return,
    Local,
    Eof,
}

const KEYWORDS: &[(&str, TokenKind)] = &[
    ("if", TokenKind::If),
    ("then", TokenKind::Then),
    ("elif", TokenKind::Elif),
    ("else", TokenKind::Else),
    ("fi", TokenKind::Fi),
    ("while", TokenKind::While),
    ("for", TokenKind::For),
    ("do", TokenKind::Do),
    ("done", TokenKind::Done),
    ("in", TokenKind::In),
    ("function", TokenKind::Function),
    ("return", TokenKind::Return),
    ("local", TokenKind::Local),
];

impl TokenKind {
    pub fn is_keyword(self) -> bool {
        KEYWORDS.iter().any(|(_, kind)| *kind == self)
    }

    pub fn is_redirection(self) -> bool {
        matches!(
            self,
            TokenKind::RedirIn
                | TokenKind::RedirOut
                | TokenKind::RedirAppend
                | TokenKind::RedirHeredoc
                | TokenKind::DupIn
                | TokenKind::DupOut
        )
    }

    /// Human readable name used in syntax errors.
    pub fn describe(self) -> &'static str {
        if let Some((name, _)) = KEYWORDS.iter().find(|(_, kind)| *kind == self) {
            return name;
        }
        match self {
            TokenKind::Word => "word",
            TokenKind::Pipe => "|",
            TokenKind::Or => "||",
            TokenKind::Amp => "&",
            TokenKind::And => "&&",
            TokenKind::Semi => ";",
            TokenKind::Newline => "newline",
            TokenKind::RedirIn => "<",
            TokenKind::RedirOut => ">",
            TokenKind::RedirAppend => ">>",
            TokenKind::RedirHeredoc => "<<",
            TokenKind::DupIn => "<&",
            TokenKind::DupOut => ">&",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Bang => "!",
            TokenKind::Eof => "end of input",
            _ => "keyword",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

fn keyword_kind(word: &str) -> Option<TokenKind> {
    KEYWORDS
        .iter()
        .find(|(name, _)| *name == word)
        .map(|(_, kind)| *kind)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
    /// Explicit descriptor of an fd-prefixed redirection such as `2>`.
    pub fd: Option<i32>,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            line,
            column,
            fd: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("{line}:{column}: unterminated {quote} quote")]
    UnterminatedQuote {
        quote: &'static str,
        line: usize,
        column: usize,
    },
}

fn is_word_break(c: char) -> bool {
    matches!(
        c,
        ' ' | '\t' | '\n' | '|' | '&' | ';' | '<' | '>' | '(' | ')'
    )
}

fn is_dup_target_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | '&' | ';' | '<' | '>' | '(' | ')')
}

pub struct Lexer {
    input: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_blanks();

        let (line, column) = (self.line, self.column);
        let Some(c) = self.current() else {
            return Ok(Token::new(TokenKind::Eof, "", line, column));
        };

        if c == '#' {
            self.skip_comment();
            return self.next_token();
        }

        // `2>file`, `0<file`, `2>&1`: the digit belongs to the operator only
        // when the operator follows immediately.
        if let Some(fd) = c.to_digit(10) {
            if matches!(self.peek_char(1), Some('<' | '>')) {
                self.read_char();
                let mut token = self.read_redirection(self.line, self.column);
                token.fd = Some(fd as i32);
                return Ok(token);
            }
        }

        let token = match c {
            '\n' => self.single(TokenKind::Newline, line, column),
            '<' | '>' => self.read_redirection(line, column),
            '|' if self.peek_char(1) == Some('|') => self.double(TokenKind::Or, line, column),
            '|' => self.single(TokenKind::Pipe, line, column),
            '&' if self.peek_char(1) == Some('&') => self.double(TokenKind::And, line, column),
            '&' => self.single(TokenKind::Amp, line, column),
            ';' => self.single(TokenKind::Semi, line, column),
            '(' => self.single(TokenKind::LParen, line, column),
            ')' => self.single(TokenKind::RParen, line, column),
            // `{}` and `!x` are plain words; the operators stand alone.
            '{' | '}' | '!' if self.peek_char(1).is_some_and(|next| !is_word_break(next)) => {
                return self.read_word(line, column)
            }
            '{' => self.single(TokenKind::LBrace, line, column),
            '}' => self.single(TokenKind::RBrace, line, column),
            '!' => self.single(TokenKind::Bang, line, column),
            _ => return self.read_word(line, column),
        };
        Ok(token)
    }

    /// Looks at the next token without consuming it.
    pub fn peek(&mut self) -> Result<Token, LexError> {
        let saved = (self.pos, self.line, self.column);
        let token = self.next_token();
        (self.pos, self.line, self.column) = saved;
        token
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.pos).copied()
    }

    fn peek_char(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }

    fn read_char(&mut self) -> Option<char> {
        let c = self.current()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_blanks(&mut self) {
        while matches!(self.current(), Some(' ' | '\t')) {
            self.read_char();
        }
    }

    // Stops before the newline so it still terminates the command.
    fn skip_comment(&mut self) {
        while let Some(c) = self.current() {
            if c == '\n' {
                break;
            }
            self.read_char();
        }
    }

    fn single(&mut self, kind: TokenKind, line: usize, column: usize) -> Token {
        let c = self.read_char().unwrap_or_default();
        Token::new(kind, c.to_string(), line, column)
    }

    fn double(&mut self, kind: TokenKind, line: usize, column: usize) -> Token {
        let mut text = String::new();
        text.extend(self.read_char());
        text.extend(self.read_char());
        Token::new(kind, text, line, column)
    }

    fn read_redirection(&mut self, line: usize, column: usize) -> Token {
        let op = self.read_char().unwrap_or_default();
        match (op, self.current()) {
            ('>', Some('>')) => {
                self.read_char();
                Token::new(TokenKind::RedirAppend, ">>", line, column)
            }
            ('<', Some('<')) => {
                self.read_char();
                Token::new(TokenKind::RedirHeredoc, "<<", line, column)
            }
            (_, Some('&')) => {
                self.read_char();
                let kind = if op == '>' {
                    TokenKind::DupOut
                } else {
                    TokenKind::DupIn
                };
                Token::new(kind, self.read_dup_target(), line, column)
            }
            ('>', _) => Token::new(TokenKind::RedirOut, ">", line, column),
            _ => Token::new(TokenKind::RedirIn, "<", line, column),
        }
    }

    fn read_dup_target(&mut self) -> String {
        let mut target = String::new();
        while let Some(c) = self.current() {
            if is_dup_target_break(c) {
                break;
            }
            target.push(c);
            self.read_char();
        }
        target
    }

    fn read_word(&mut self, line: usize, column: usize) -> Result<Token, LexError> {
        let mut text = String::new();
        let mut quoted = false;

        while let Some(c) = self.current() {
            match c {
                '\'' => {
                    quoted = true;
                    self.read_single_quoted(&mut text)?;
                }
                '"' => {
                    quoted = true;
                    self.read_double_quoted(&mut text)?;
                }
                '\\' => {
                    self.read_char();
                    match self.current() {
                        // A lone trailing backslash stays literal.
                        None => {
                            push_literal(&mut text, '\\');
                            break;
                        }
                        Some('\n') => {
                            self.read_char();
                        }
                        Some(escaped) => {
                            self.read_char();
                            quoted = true;
                            push_literal(&mut text, escaped);
                        }
                    }
                }
                c if is_word_break(c) => break,
                c => {
                    text.push(c);
                    self.read_char();
                }
            }
        }

        if text.is_empty() && !quoted {
            // Only a line continuation was consumed.
            return self.next_token();
        }

        let kind = if quoted {
            TokenKind::Word
        } else {
            keyword_kind(&text).unwrap_or(TokenKind::Word)
        };
        Ok(Token::new(kind, text, line, column))
    }

    fn read_single_quoted(&mut self, text: &mut String) -> Result<(), LexError> {
        let (line, column) = (self.line, self.column);
        self.read_char();
        loop {
            match self.read_char() {
                None => {
                    return Err(LexError::UnterminatedQuote {
                        quote: "single",
                        line,
                        column,
                    })
                }
                Some('\'') => return Ok(()),
                Some(c) => push_literal(text, c),
            }
        }
    }

    fn read_double_quoted(&mut self, text: &mut String) -> Result<(), LexError> {
        let (line, column) = (self.line, self.column);
        self.read_char();
        loop {
            match self.read_char() {
                None => {
                    return Err(LexError::UnterminatedQuote {
                        quote: "double",
                        line,
                        column,
                    })
                }
                Some('"') => return Ok(()),
                Some('\\') => match self.current() {
                    Some('\n') => {
                        self.read_char();
                    }
                    Some(c @ ('$' | '`' | '"' | '\\')) => {
                        self.read_char();
                        push_literal(text, c);
                    }
                    _ => push_literal(text, '\\'),
                },
                // Parameters stay live inside double quotes.
                Some('$') => text.push('$'),
                Some(c) => push_literal(text, c),
            }
        }
    }
}

/// Characters the expander would otherwise act on.
fn is_expansion_special(c: char) -> bool {
    matches!(c, '$' | '\\' | '*' | '?' | '[' | '~')
}

/// Quoted or escaped characters reach the expander as `\c` pairs so they stay
/// literal; everything else is stored as is.
fn push_literal(text: &mut String, c: char) {
    if is_expansion_special(c) {
        text.push('\\');
    }
    text.push(c);
}

/// Tokenizes a whole source text. The result always ends with an `Eof` token.
pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().iter().map(|t| t.kind).collect()
    }

    fn words(input: &str) -> Vec<String> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TokenKind::Word)
            .map(|t| t.text)
            .collect()
    }

    #[test]
    fn test_simple_command() {
        let mut lexer = Lexer::new("ls -l");
        assert_eq!(lexer.next_token().unwrap().text, "ls");
        assert_eq!(lexer.next_token().unwrap().text, "-l");
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("a | b || c & d && e ; f"),
            vec![Word, Pipe, Word, Or, Word, Amp, Word, And, Word, Semi, Word, Eof]
        );
        assert_eq!(
            kinds("( a ) { b ; } ! c"),
            vec![LParen, Word, RParen, LBrace, Word, Semi, RBrace, Bang, Word, Eof]
        );
    }

    #[test]
    fn test_quoted_strings_are_single_words() {
        assert_eq!(words("echo 'a b'"), vec!["echo", "a b"]);
        assert_eq!(words("echo \"a b\""), vec!["echo", "a b"]);
        assert_eq!(words("echo pre'mid dle'post"), vec!["echo", "premid dlepost"]);
    }

    #[test]
    fn test_double_quote_escapes() {
        assert_eq!(words(r#"echo "a\"b\\c\$d\xe""#), vec!["echo", r#"a"b\\c\$d\\xe"#]);
        assert_eq!(words("echo 'no\\escape'"), vec!["echo", r"no\\escape"]);
    }

    #[test]
    fn test_backslash_handling() {
        assert_eq!(words("echo a\\ b"), vec!["echo", "a b"]);
        assert_eq!(words("echo trailing\\"), vec!["echo", r"trailing\\"]);
        assert_eq!(words("echo long\\\nline"), vec!["echo", "longline"]);
    }

    #[test]
    fn test_quoting_protects_expansion_characters() {
        assert_eq!(
            words(r#"echo '$HOME' "$HOME" \$HOME "*.rs" '~' ~"#),
            vec!["echo", r"\$HOME", "$HOME", r"\$HOME", r"\*.rs", r"\~", "~"]
        );
    }

    #[test]
    fn test_unterminated_quote_reports_position() {
        let err = tokenize("echo 'abc").unwrap_err();
        assert_eq!(
            err,
            LexError::UnterminatedQuote {
                quote: "single",
                line: 1,
                column: 6
            }
        );
        assert_eq!(err.to_string(), "1:6: unterminated single quote");

        let err = tokenize("echo ok\necho \"x").unwrap_err();
        assert!(matches!(
            err,
            LexError::UnterminatedQuote { quote: "double", line: 2, column: 6 }
        ));
    }

    #[test]
    fn test_keywords_only_as_whole_words() {
        use TokenKind::*;
        assert_eq!(kinds("if iffy fi"), vec![If, Word, Fi, Eof]);
        assert_eq!(kinds("'if' \"done\""), vec![Word, Word, Eof]);
        assert_eq!(
            kinds("while for do done in function return local then elif else"),
            vec![While, For, Do, Done, In, Function, Return, Local, Then, Elif, Else, Eof]
        );
    }

    #[test]
    fn test_redirections() {
        let tokens = tokenize("cat < in > out >> log << EOF").unwrap();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::RedirIn,
                TokenKind::Word,
                TokenKind::RedirOut,
                TokenKind::Word,
                TokenKind::RedirAppend,
                TokenKind::Word,
                TokenKind::RedirHeredoc,
                TokenKind::Word,
                TokenKind::Eof
            ]
        );
        assert!(tokens.iter().all(|t| t.fd.is_none()));
    }

    #[test]
    fn test_fd_prefixed_redirections() {
        let tokens = tokenize("cmd 2> err 0<in 2>&1 >&2 3<&0").unwrap();
        assert_eq!(tokens[1].kind, TokenKind::RedirOut);
        assert_eq!(tokens[1].fd, Some(2));
        assert_eq!(tokens[3].kind, TokenKind::RedirIn);
        assert_eq!(tokens[3].fd, Some(0));
        assert_eq!(tokens[5].kind, TokenKind::DupOut);
        assert_eq!(tokens[5].fd, Some(2));
        assert_eq!(tokens[5].text, "1");
        assert_eq!(tokens[6].kind, TokenKind::DupOut);
        assert_eq!(tokens[6].fd, None);
        assert_eq!(tokens[6].text, "2");
        assert_eq!(tokens[7].kind, TokenKind::DupIn);
        assert_eq!(tokens[7].fd, Some(3));
        assert_eq!(tokens[7].text, "0");
    }

    #[test]
    fn test_digit_without_operator_is_a_word() {
        assert_eq!(words("echo 2 x2 12"), vec!["echo", "2", "x2", "12"]);
        assert_eq!(kinds("echo a2>f")[2], TokenKind::RedirOut);
    }

    #[test]
    fn test_comments_are_dropped() {
        use TokenKind::*;
        assert_eq!(kinds("echo a # comment | b\necho c"), vec![Word, Word, Newline, Word, Word, Eof]);
        assert_eq!(words("echo a#b"), vec!["echo", "a#b"]);
    }

    #[test]
    fn test_braces_inside_words() {
        assert_eq!(words("echo ${HOME} a}"), vec!["echo", "${HOME}", "a}"]);
        assert_eq!(
            words("find . -exec echo {} \\;"),
            vec!["find", ".", "-exec", "echo", "{}", ";"]
        );
        assert_eq!(words("echo !x {a,b}"), vec!["echo", "!x", "{a,b}"]);
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("echo a\n  ls").unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (1, 6));
        assert_eq!((tokens[3].line, tokens[3].column), (2, 3));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut lexer = Lexer::new("a b");
        assert_eq!(lexer.peek().unwrap().text, "a");
        assert_eq!(lexer.peek().unwrap().text, "a");
        assert_eq!(lexer.next_token().unwrap().text, "a");
        assert_eq!(lexer.peek().unwrap().text, "b");
        let b = lexer.next_token().unwrap();
        assert_eq!((b.line, b.column), (1, 3));
    }

    #[test]
    fn test_empty_quotes_make_an_empty_word() {
        assert_eq!(words("echo ''"), vec!["echo", ""]);
    }
}
