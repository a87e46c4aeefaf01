use std::rc::Rc;

use log::trace;
use thiserror::Error;

use super::ast::{Assignment, Command, Node, RedirectKind, Redirection};
use super::lexer::{Lexer, Token, TokenKind};
use super::SyntaxError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("syntax error at {line}:{column} near '{near}': expected {expected}")]
    Unexpected {
        expected: String,
        near: String,
        line: usize,
        column: usize,
    },
    #[error("syntax error at end of input: expected {expected}")]
    UnexpectedEof { expected: String },
}

impl ParseError {
    pub fn at_end_of_input(&self) -> bool {
        matches!(self, ParseError::UnexpectedEof { .. })
    }
}

type Result<T> = std::result::Result<T, SyntaxError>;

fn closes_list(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Eof
            | TokenKind::Then
            | TokenKind::Elif
            | TokenKind::Else
            | TokenKind::Fi
            | TokenKind::Do
            | TokenKind::Done
            | TokenKind::RBrace
            | TokenKind::RParen
    )
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(head) if head.is_ascii_alphabetic() || head == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// `NAME=value` where NAME is an identifier.
pub fn split_assignment(word: &str) -> Option<(&str, &str)> {
    let (name, value) = word.split_once('=')?;
    is_identifier(name).then_some((name, value))
}

pub struct Parser {
    lexer: Lexer,
    current_token: Token,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self> {
        let mut lexer = Lexer::new(input);
        let current_token = lexer.next_token()?;
        Ok(Parser {
            lexer,
            current_token,
        })
    }

    fn next_token(&mut self) -> Result<Token> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current_token, next))
    }

    fn kind(&self) -> TokenKind {
        self.current_token.kind
    }

    fn unexpected(&self, expected: impl Into<String>) -> SyntaxError {
        let expected = expected.into();
        let token = &self.current_token;
        let err = match token.kind {
            TokenKind::Eof => ParseError::UnexpectedEof { expected },
            TokenKind::Newline => ParseError::Unexpected {
                expected,
                near: "newline".to_string(),
                line: token.line,
                column: token.column,
            },
            _ => ParseError::Unexpected {
                expected,
                near: token.text.clone(),
                line: token.line,
                column: token.column,
            },
        };
        err.into()
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token> {
        if self.kind() == kind {
            self.next_token()
        } else {
            Err(self.unexpected(format!("'{}'", kind)))
        }
    }

    fn skip_newlines(&mut self) -> Result<()> {
        while self.kind() == TokenKind::Newline {
            self.next_token()?;
        }
        Ok(())
    }

    pub fn parse_program(&mut self) -> Result<Option<Node>> {
        self.skip_newlines()?;
        if self.kind() == TokenKind::Eof {
            return Ok(None);
        }
        let node = self.parse_list()?;
        if self.kind() != TokenKind::Eof {
            return Err(self.unexpected("end of input"));
        }
        trace!("parsed: {:?}", node);
        Ok(Some(node))
    }

    /// Parses and_or items separated by `;`, `&` or newlines until a token
    /// that closes a compound command (or end of input) shows up in command
    /// position. The caller checks that it is the one it expects.
    fn parse_list(&mut self) -> Result<Node> {
        self.skip_newlines()?;
        let mut list: Option<Node> = None;

        loop {
            if closes_list(self.kind()) {
                break;
            }

            let mut item = self.parse_and_or()?;
            let separated = match self.kind() {
                TokenKind::Amp => {
                    self.next_token()?;
                    item = Node::Background(Box::new(item));
                    true
                }
                TokenKind::Semi | TokenKind::Newline => {
                    self.next_token()?;
                    true
                }
                _ => false,
            };

            list = Some(match list {
                Some(prev) => Node::Sequence(Box::new(prev), Box::new(item)),
                None => item,
            });

            if !separated {
                break;
            }
            self.skip_newlines()?;
        }

        list.ok_or_else(|| self.unexpected("command"))
    }

    fn parse_and_or(&mut self) -> Result<Node> {
        let mut left = self.parse_pipeline()?;
        loop {
            let kind = self.kind();
            if kind != TokenKind::And && kind != TokenKind::Or {
                return Ok(left);
            }
            self.next_token()?;
            self.skip_newlines()?;
            let right = self.parse_pipeline()?;
            left = if kind == TokenKind::And {
                Node::And(Box::new(left), Box::new(right))
            } else {
                Node::Or(Box::new(left), Box::new(right))
            };
        }
    }

    fn parse_pipeline(&mut self) -> Result<Node> {
        let negated = self.kind() == TokenKind::Bang;
        if negated {
            self.next_token()?;
        }

        let mut stages = vec![self.parse_command()?];
        while self.kind() == TokenKind::Pipe {
            self.next_token()?;
            self.skip_newlines()?;
            stages.push(self.parse_command()?);
        }

        if stages.len() > 1 {
            return Ok(Node::Pipeline { stages, negated });
        }
        let stage = stages.remove(0);
        Ok(if negated {
            Node::Negate(Box::new(stage))
        } else {
            stage
        })
    }

    fn parse_command(&mut self) -> Result<Node> {
        match self.kind() {
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Function => {
                self.next_token()?;
                let name = self.expect(TokenKind::Word)?.text;
                if self.kind() == TokenKind::LParen {
                    self.next_token()?;
                    self.expect(TokenKind::RParen)?;
                }
                self.parse_function_body(name)
            }
            TokenKind::LBrace => {
                self.next_token()?;
                let body = self.parse_list()?;
                self.expect(TokenKind::RBrace)?;
                Ok(Node::Block(Box::new(body)))
            }
            TokenKind::LParen => {
                self.next_token()?;
                let body = self.parse_list()?;
                self.expect(TokenKind::RParen)?;
                Ok(Node::Subshell(Box::new(body)))
            }
            TokenKind::Word if self.lexer.peek()?.kind == TokenKind::LParen => {
                let name = self.next_token()?.text;
                self.next_token()?;
                self.expect(TokenKind::RParen)?;
                self.parse_function_body(name)
            }
            TokenKind::Word | TokenKind::Return | TokenKind::Local => {
                Ok(Node::Command(self.parse_simple_command()?))
            }
            kind if kind.is_redirection() => Ok(Node::Command(self.parse_simple_command()?)),
            _ => Err(self.unexpected("command")),
        }
    }

    fn parse_function_body(&mut self, name: String) -> Result<Node> {
        self.skip_newlines()?;
        self.expect(TokenKind::LBrace)?;
        let body = self.parse_list()?;
        self.expect(TokenKind::RBrace)?;
        Ok(Node::Function {
            name,
            body: Rc::new(body),
        })
    }

    fn parse_simple_command(&mut self) -> Result<Command> {
        let mut command = Command::default();

        loop {
            let kind = self.kind();
            if kind.is_redirection() {
                let redirection = self.parse_redirection()?;
                command.redirections.push(redirection);
                continue;
            }

            let word_like = kind == TokenKind::Word
                || kind.is_keyword()
                || matches!(kind, TokenKind::LBrace | TokenKind::RBrace | TokenKind::Bang);
            if !word_like {
                break;
            }

            let token = self.next_token()?;
            if command.args.is_empty() && kind == TokenKind::Word {
                if let Some((name, value)) = split_assignment(&token.text) {
                    command.assignments.push(Assignment {
                        name: name.to_string(),
                        value: value.to_string(),
                    });
                    continue;
                }
            }
            command.args.push(token.text);
        }

        if command.args.is_empty()
            && command.assignments.is_empty()
            && command.redirections.is_empty()
        {
            return Err(self.unexpected("command"));
        }
        Ok(command)
    }

    fn parse_redirection(&mut self) -> Result<Redirection> {
        let op = self.next_token()?;
        let kind = match op.kind {
            TokenKind::RedirIn => RedirectKind::Input,
            TokenKind::RedirOut => RedirectKind::Output,
            TokenKind::RedirAppend => RedirectKind::Append,
            TokenKind::RedirHeredoc => RedirectKind::Heredoc,
            TokenKind::DupIn => RedirectKind::DupIn,
            _ => RedirectKind::DupOut,
        };
        let fd = op.fd.unwrap_or_else(|| kind.default_fd());

        let dup = matches!(kind, RedirectKind::DupIn | RedirectKind::DupOut);
        let target = if dup && !op.text.is_empty() {
            op.text
        } else if self.kind() == TokenKind::Word || self.kind().is_keyword() {
            self.next_token()?.text
        } else {
            return Err(self.unexpected("word"));
        };

        Ok(Redirection { kind, fd, target })
    }

    fn parse_if(&mut self) -> Result<Node> {
        self.expect(TokenKind::If)?;
        let condition = self.parse_list()?;
        self.expect(TokenKind::Then)?;
        let then_body = self.parse_list()?;

        let mut elifs = Vec::new();
        let mut else_body = None;
        loop {
            match self.kind() {
                TokenKind::Elif => {
                    self.next_token()?;
                    let cond = self.parse_list()?;
                    self.expect(TokenKind::Then)?;
                    let body = self.parse_list()?;
                    elifs.push((cond, body));
                }
                TokenKind::Else => {
                    self.next_token()?;
                    else_body = Some(Box::new(self.parse_list()?));
                    self.expect(TokenKind::Fi)?;
                    break;
                }
                TokenKind::Fi => {
                    self.next_token()?;
                    break;
                }
                _ => return Err(self.unexpected("'fi'")),
            }
        }

        // Fold the elif clauses from the back into nested else branches.
        for (cond, body) in elifs.into_iter().rev() {
            else_body = Some(Box::new(Node::If {
                condition: Box::new(cond),
                then_body: Box::new(body),
                else_body,
            }));
        }

        Ok(Node::If {
            condition: Box::new(condition),
            then_body: Box::new(then_body),
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<Node> {
        self.expect(TokenKind::While)?;
        let condition = self.parse_list()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_list()?;
        self.expect(TokenKind::Done)?;
        Ok(Node::While {
            condition: Box::new(condition),
            body: Box::new(body),
        })
    }

    fn parse_for(&mut self) -> Result<Node> {
        self.expect(TokenKind::For)?;
        let variable = self.expect(TokenKind::Word)?.text;

        let words = if self.kind() == TokenKind::In {
            self.next_token()?;
            let mut words = Vec::new();
            while self.kind() == TokenKind::Word {
                words.push(self.next_token()?.text);
            }
            Some(words)
        } else {
            None
        };

        if matches!(self.kind(), TokenKind::Semi | TokenKind::Newline) {
            self.next_token()?;
        }
        self.skip_newlines()?;
        self.expect(TokenKind::Do)?;
        let body = self.parse_list()?;
        self.expect(TokenKind::Done)?;

        Ok(Node::For {
            variable,
            words,
            body: Box::new(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::parse;
    use super::*;

    #[allow(clippy::unwrap_used)]
    fn parse_ok(input: &str) -> Node {
        parse(input).unwrap().unwrap()
    }

    fn command(node: &Node) -> &Command {
        match node {
            Node::Command(cmd) => cmd,
            other => panic!("Expected simple command, got {:?}", other),
        }
    }

    fn args(node: &Node) -> Vec<&str> {
        command(node).args.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_simple_command() {
        let node = parse_ok("ls -l");
        let cmd = command(&node);
        assert_eq!(cmd.args, vec!["ls", "-l"]);
        assert!(cmd.redirections.is_empty());
        assert!(cmd.assignments.is_empty());
    }

    #[allow(clippy::unwrap_used)]
    #[test]
    fn test_empty_input() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("  \n\n # only a comment\n").unwrap(), None);
    }

    #[test]
    fn test_quote_styles_parse_alike() {
        assert_eq!(parse_ok("echo 'a b'"), parse_ok("echo \"a b\""));
        assert_eq!(parse_ok("echo 'a b'"), parse_ok("echo a\\ b"));
    }

    #[test]
    fn test_pipeline() {
        match parse_ok("ls -l | grep foo | wc") {
            Node::Pipeline { stages, negated } => {
                assert!(!negated);
                assert_eq!(stages.len(), 3);
                assert_eq!(args(&stages[0]), vec!["ls", "-l"]);
                assert_eq!(args(&stages[1]), vec!["grep", "foo"]);
            }
            other => panic!("Expected pipeline, got {:?}", other),
        }
    }

    #[test]
    fn test_single_stage_pipeline_collapses() {
        assert!(matches!(parse_ok("ls"), Node::Command(_)));
        match parse_ok("! ls") {
            Node::Negate(inner) => assert_eq!(args(&inner), vec!["ls"]),
            other => panic!("Expected negation, got {:?}", other),
        }
        assert!(matches!(
            parse_ok("! a | b"),
            Node::Pipeline { negated: true, .. }
        ));
    }

    #[test]
    fn test_and_or_left_associative() {
        match parse_ok("a && b || c") {
            Node::Or(left, right) => {
                assert!(matches!(*left, Node::And(_, _)));
                assert_eq!(args(&right), vec!["c"]);
            }
            other => panic!("Expected or, got {:?}", other),
        }
    }

    #[test]
    fn test_sequence_binds_loosest() {
        match parse_ok("a && b ; c") {
            Node::Sequence(left, right) => {
                assert!(matches!(*left, Node::And(_, _)));
                assert_eq!(args(&right), vec!["c"]);
            }
            other => panic!("Expected sequence, got {:?}", other),
        }
        match parse_ok("a ; b && c") {
            Node::Sequence(left, right) => {
                assert_eq!(args(&left), vec!["a"]);
                assert!(matches!(*right, Node::And(_, _)));
            }
            other => panic!("Expected sequence, got {:?}", other),
        }
        match parse_ok("a; b; c") {
            Node::Sequence(left, _) => assert!(matches!(*left, Node::Sequence(_, _))),
            other => panic!("Expected sequence, got {:?}", other),
        }
    }

    #[test]
    fn test_background() {
        match parse_ok("sleep 10 &") {
            Node::Background(inner) => assert_eq!(args(&inner), vec!["sleep", "10"]),
            other => panic!("Expected background, got {:?}", other),
        }
        match parse_ok("a & b") {
            Node::Sequence(left, right) => {
                assert!(matches!(*left, Node::Background(_)));
                assert_eq!(args(&right), vec!["b"]);
            }
            other => panic!("Expected sequence, got {:?}", other),
        }
    }

    #[test]
    fn test_redirection() {
        let node = parse_ok("echo hello > output.txt 2>>err <in 2>&1");
        let cmd = command(&node);
        assert_eq!(cmd.args, vec!["echo", "hello"]);
        assert_eq!(
            cmd.redirections,
            vec![
                Redirection {
                    kind: RedirectKind::Output,
                    fd: 1,
                    target: "output.txt".into()
                },
                Redirection {
                    kind: RedirectKind::Append,
                    fd: 2,
                    target: "err".into()
                },
                Redirection {
                    kind: RedirectKind::Input,
                    fd: 0,
                    target: "in".into()
                },
                Redirection {
                    kind: RedirectKind::DupOut,
                    fd: 2,
                    target: "1".into()
                },
            ]
        );
    }

    #[test]
    fn test_redirections_interleave_with_args() {
        let node = parse_ok(">out echo a 2>err b");
        let cmd = command(&node);
        assert_eq!(cmd.args, vec!["echo", "a", "b"]);
        assert_eq!(cmd.redirections.len(), 2);
    }

    #[test]
    fn test_assignments() {
        let node = parse_ok("FOO=1 _BAR=x=y cmd BAZ=2");
        let cmd = command(&node);
        assert_eq!(
            cmd.assignments,
            vec![
                Assignment {
                    name: "FOO".into(),
                    value: "1".into()
                },
                Assignment {
                    name: "_BAR".into(),
                    value: "x=y".into()
                },
            ]
        );
        assert_eq!(cmd.args, vec!["cmd", "BAZ=2"]);

        let node = parse_ok("X=5");
        assert!(command(&node).args.is_empty());
        assert_eq!(args(&parse_ok("1X=5")), vec!["1X=5"]);
    }

    #[test]
    fn test_keywords_as_arguments() {
        assert_eq!(args(&parse_ok("echo done if fi")), vec!["echo", "done", "if", "fi"]);
        assert_eq!(args(&parse_ok("return 3")), vec!["return", "3"]);
        assert_eq!(args(&parse_ok("local x=1")), vec!["local", "x=1"]);
    }

    #[test]
    fn test_brace_and_bang_words() {
        assert_eq!(
            args(&parse_ok("find . -exec echo {} \\;")),
            vec!["find", ".", "-exec", "echo", "{}", ";"]
        );
        assert_eq!(args(&parse_ok("echo !x")), vec!["echo", "!x"]);
        assert!(matches!(parse_ok("! true"), Node::Negate(_)));
        assert!(matches!(parse_ok("{ echo a;}"), Node::Block(_)));
    }

    #[test]
    fn test_if_elif_else_chain() {
        let node = parse_ok("if a; then b; elif c; then d; elif e; then f; else g; fi");
        let Node::If {
            condition,
            else_body: Some(first_else),
            ..
        } = node
        else {
            panic!("Expected if");
        };
        assert_eq!(args(&condition), vec!["a"]);
        let Node::If {
            condition,
            else_body: Some(second_else),
            ..
        } = *first_else
        else {
            panic!("Expected elif");
        };
        assert_eq!(args(&condition), vec!["c"]);
        let Node::If {
            condition,
            else_body: Some(last),
            ..
        } = *second_else
        else {
            panic!("Expected elif");
        };
        assert_eq!(args(&condition), vec!["e"]);
        assert_eq!(args(&last), vec!["g"]);
    }

    #[test]
    fn test_multiline_if() {
        let node = parse_ok("if true\nthen\n  echo yes\nfi\n");
        assert!(matches!(node, Node::If { else_body: None, .. }));
    }

    #[test]
    fn test_while_and_for() {
        assert!(matches!(
            parse_ok("while true; do echo x; done"),
            Node::While { .. }
        ));
        match parse_ok("for x in a b c; do echo $x; done") {
            Node::For {
                variable, words, ..
            } => {
                assert_eq!(variable, "x");
                assert_eq!(words, Some(vec!["a".into(), "b".into(), "c".into()]));
            }
            other => panic!("Expected for, got {:?}", other),
        }
        match parse_ok("for x\ndo echo $x\ndone") {
            Node::For { words, .. } => assert_eq!(words, None),
            other => panic!("Expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_function_definitions() {
        match parse_ok("greet() { echo hi; }") {
            Node::Function { name, body } => {
                assert_eq!(name, "greet");
                assert_eq!(args(&body), vec!["echo", "hi"]);
            }
            other => panic!("Expected function, got {:?}", other),
        }
        assert!(matches!(
            parse_ok("function greet { echo hi; }"),
            Node::Function { .. }
        ));
        assert!(matches!(
            parse_ok("function greet() {\n echo hi\n}"),
            Node::Function { .. }
        ));
    }

    #[test]
    fn test_block_and_subshell() {
        assert!(matches!(parse_ok("{ a; b; }"), Node::Block(_)));
        assert!(matches!(parse_ok("(a; b)"), Node::Subshell(_)));
        assert!(matches!(parse_ok("(a) | b"), Node::Pipeline { .. }));
    }

    #[test]
    fn test_heredoc_is_parsed() {
        let node = parse_ok("cat << EOF");
        assert_eq!(command(&node).redirections[0].kind, RedirectKind::Heredoc);
        assert_eq!(command(&node).redirections[0].target, "EOF");
    }

    #[allow(clippy::unwrap_used)]
    #[test]
    fn test_syntax_errors() {
        let err = parse("if true; echo x; fi").unwrap_err();
        assert_eq!(
            err.to_string(),
            "syntax error at 1:18 near 'fi': expected 'then'"
        );
        assert!(!err.is_incomplete());

        let err = parse("if true; then echo x").unwrap_err();
        assert_eq!(err.to_string(), "syntax error at end of input: expected 'fi'");
        assert!(err.is_incomplete());

        let err = parse("echo a |").unwrap_err();
        assert!(err.is_incomplete());

        let err = parse("echo 'open").unwrap_err();
        assert!(matches!(err, SyntaxError::Lex(_)));
        assert!(err.is_incomplete());

        let err = parse("echo a )").unwrap_err();
        assert!(!err.is_incomplete());

        assert!(parse("; echo").is_err());
        assert!(parse("echo >").is_err());
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        for text in [
            "echo 'a b' > out",
            "echo '$x' \"$y z\" '' \\* ~",
            "a && b || c",
            "sleep 1 & echo x",
            "if a; then b; elif c; then d; else e; fi",
            "for x in 1 2; do echo $x; done",
            "f() { echo hi; }",
            "! a | b 2>&1",
            "(cd /tmp; ls)",
        ] {
            let node = parse_ok(text);
            assert_eq!(parse_ok(&node.to_string()), node, "{}", text);
        }
    }

    #[test]
    fn test_split_assignment() {
        assert_eq!(split_assignment("A=b"), Some(("A", "b")));
        assert_eq!(split_assignment("A="), Some(("A", "")));
        assert_eq!(split_assignment("=b"), None);
        assert_eq!(split_assignment("a-b=c"), None);
        assert_eq!(split_assignment("plain"), None);
    }
}
