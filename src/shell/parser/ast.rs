use std::fmt::{self, Write};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    Input,
    Output,
    Append,
    Heredoc,
    DupIn,
    DupOut,
}

impl RedirectKind {
    /// Descriptor used when the operator carries no explicit fd prefix.
    pub fn default_fd(self) -> i32 {
        match self {
            RedirectKind::Input | RedirectKind::Heredoc | RedirectKind::DupIn => 0,
            RedirectKind::Output | RedirectKind::Append | RedirectKind::DupOut => 1,
        }
    }

    fn operator(self) -> &'static str {
        match self {
            RedirectKind::Input => "<",
            RedirectKind::Output => ">",
            RedirectKind::Append => ">>",
            RedirectKind::Heredoc => "<<",
            RedirectKind::DupIn => "<&",
            RedirectKind::DupOut => ">&",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub kind: RedirectKind,
    pub fd: i32,
    /// File name, heredoc delimiter, or the source descriptor of a dup.
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    pub assignments: Vec<Assignment>,
    pub args: Vec<String>,
    /// Kept in source order.
    pub redirections: Vec<Redirection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Command(Command),
    Pipeline {
        stages: Vec<Node>,
        negated: bool,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Sequence(Box<Node>, Box<Node>),
    Background(Box<Node>),
    Negate(Box<Node>),
    Subshell(Box<Node>),
    If {
        condition: Box<Node>,
        then_body: Box<Node>,
        else_body: Option<Box<Node>>,
    },
    While {
        condition: Box<Node>,
        body: Box<Node>,
    },
    For {
        variable: String,
        /// `None` when the loop has no `in` clause.
        words: Option<Vec<String>>,
        body: Box<Node>,
    },
    Function {
        name: String,
        body: Rc<Node>,
    },
    Block(Box<Node>),
}

fn is_word_special(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | '&' | ';' | '<' | '>' | '(' | ')' | '\'' | '"' | '#')
}

/// Writes a word so that lexing the output gives the same text back,
/// including the `\c` pairs that mark quoted characters.
fn write_word(f: &mut fmt::Formatter<'_>, word: &str) -> fmt::Result {
    if word.is_empty() {
        return f.write_str("''");
    }
    let mut chars = word.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                f.write_char('\\')?;
                if let Some(escaped) = chars.next() {
                    f.write_char(escaped)?;
                }
            }
            '\n' => f.write_str("'\n'")?,
            c if is_word_special(c) => {
                f.write_char('\\')?;
                f.write_char(c)?;
            }
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

impl fmt::Display for Redirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fd != self.kind.default_fd() {
            write!(f, "{}", self.fd)?;
        }
        f.write_str(self.kind.operator())?;
        match self.kind {
            RedirectKind::DupIn | RedirectKind::DupOut => f.write_str(&self.target),
            _ => {
                if self.kind != RedirectKind::Heredoc {
                    f.write_str(" ")?;
                }
                write_word(f, &self.target)
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if !std::mem::take(&mut first) {
                f.write_str(" ")?;
            }
            Ok(())
        };
        for assignment in &self.assignments {
            sep(f)?;
            write!(f, "{}=", assignment.name)?;
            write_word(f, &assignment.value)?;
        }
        for arg in &self.args {
            sep(f)?;
            write_word(f, arg)?;
        }
        for redirection in &self.redirections {
            sep(f)?;
            write!(f, "{}", redirection)?;
        }
        Ok(())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Command(command) => write!(f, "{}", command),
            Node::Pipeline { stages, negated } => {
                if *negated {
                    f.write_str("! ")?;
                }
                for (i, stage) in stages.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", stage)?;
                }
                Ok(())
            }
            Node::And(left, right) => write!(f, "{} && {}", left, right),
            Node::Or(left, right) => write!(f, "{} || {}", left, right),
            Node::Sequence(left, right) => match left.as_ref() {
                Node::Background(_) => write!(f, "{} {}", left, right),
                _ => write!(f, "{}; {}", left, right),
            },
            Node::Background(inner) => write!(f, "{} &", inner),
            Node::Negate(inner) => write!(f, "! {}", inner),
            Node::Subshell(inner) => write!(f, "({})", inner),
            Node::If {
                condition,
                then_body,
                else_body,
            } => {
                write!(f, "if {}; then {}; ", condition, then_body)?;
                let mut tail = else_body.as_deref();
                while let Some(node) = tail {
                    match node {
                        Node::If {
                            condition,
                            then_body,
                            else_body,
                        } => {
                            write!(f, "elif {}; then {}; ", condition, then_body)?;
                            tail = else_body.as_deref();
                        }
                        other => {
                            write!(f, "else {}; ", other)?;
                            tail = None;
                        }
                    }
                }
                f.write_str("fi")
            }
            Node::While { condition, body } => {
                write!(f, "while {}; do {}; done", condition, body)
            }
            Node::For {
                variable,
                words,
                body,
            } => {
                write!(f, "for {}", variable)?;
                if let Some(words) = words {
                    f.write_str(" in")?;
                    for word in words {
                        f.write_str(" ")?;
                        write_word(f, word)?;
                    }
                }
                write!(f, "; do {}; done", body)
            }
            Node::Function { name, body } => write!(f, "{}() {{ {}; }}", name, body),
            Node::Block(inner) => write!(f, "{{ {}; }}", inner),
        }
    }
}
