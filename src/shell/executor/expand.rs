use glob::MatchOptions;
use thiserror::Error;

use super::variable::Variables;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("{name}: {message}")]
    Required { name: String, message: String },
}

/// Parameter and tilde expansion over one word, read-only on shell state.
pub struct Expander<'a> {
    variables: &'a Variables,
    last_status: i32,
    shell_pid: i32,
}

impl<'a> Expander<'a> {
    pub fn new(variables: &'a Variables, last_status: i32, shell_pid: i32) -> Self {
        Self {
            variables,
            last_status,
            shell_pid,
        }
    }

    fn param(&self, name: &str) -> Option<String> {
        let positional = self.variables.positional();
        match name {
            "?" => Some(self.last_status.to_string()),
            "$" => Some(self.shell_pid.to_string()),
            "#" => Some(positional.len().to_string()),
            "@" | "*" => Some(positional.join(" ")),
            "0" => Some(self.variables.script_name().to_string()),
            _ => match name.parse::<usize>() {
                Ok(n) => n.checked_sub(1).and_then(|i| positional.get(i)).cloned(),
                Err(_) => self.variables.get(name).map(str::to_string),
            },
        }
    }

    /// Substitutes `$NAME`, `${...}` forms and special parameters. A `\c`
    /// pair left by the lexer for a quoted character yields a literal `c`.
    pub fn expand(&self, input: &str) -> Result<String, ExpandError> {
        let mut result = String::new();
        let mut chars = input.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '\\' {
                result.push(chars.next().unwrap_or('\\'));
                continue;
            }
            if c != '$' {
                result.push(c);
                continue;
            }
            match chars.peek().copied() {
                Some('{') => {
                    chars.next();
                    let mut inner = String::new();
                    let mut depth = 1;
                    while let Some(next) = chars.next() {
                        match next {
                            '\\' => {
                                inner.push(next);
                                if let Some(escaped) = chars.next() {
                                    inner.push(escaped);
                                }
                                continue;
                            }
                            '{' => depth += 1,
                            '}' => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                            }
                            _ => {}
                        }
                        inner.push(next);
                    }
                    if depth != 0 {
                        // No closing brace: keep the text as written.
                        result.push_str("${");
                        result.push_str(&inner);
                    } else {
                        result.push_str(&self.expand_braced(&inner)?);
                    }
                }
                Some(special @ ('?' | '$' | '#' | '@' | '*')) => {
                    chars.next();
                    result.push_str(&self.param(&special.to_string()).unwrap_or_default());
                }
                Some(digit) if digit.is_ascii_digit() => {
                    chars.next();
                    result.push_str(&self.param(&digit.to_string()).unwrap_or_default());
                }
                Some(head) if head.is_ascii_alphabetic() || head == '_' => {
                    let mut var_name = String::new();
                    while let Some(&next) = chars.peek() {
                        if next.is_ascii_alphanumeric() || next == '_' {
                            var_name.push(next);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    result.push_str(&self.param(&var_name).unwrap_or_default());
                }
                _ => result.push('$'),
            }
        }
        Ok(result)
    }

    fn expand_braced(&self, inner: &str) -> Result<String, ExpandError> {
        let found = [":-", ":+", ":?"]
            .iter()
            .filter_map(|op| inner.find(op))
            .min();
        let Some(pos) = found else {
            return Ok(self.param(inner).unwrap_or_default());
        };
        let name = &inner[..pos];
        let op = &inner[pos + 1..pos + 2];
        let word = &inner[pos + 2..];
        let value = self.param(name).filter(|v| !v.is_empty());

        match (op, value) {
            ("-", Some(value)) => Ok(value),
            ("-", None) => self.expand(word),
            ("+", Some(_)) => self.expand(word),
            ("+", None) => Ok(String::new()),
            (_, Some(value)) => Ok(value),
            (_, None) => {
                let message = self.expand(word)?;
                Err(ExpandError::Required {
                    name: name.to_string(),
                    message: if message.is_empty() {
                        "parameter null or not set".to_string()
                    } else {
                        message
                    },
                })
            }
        }
    }

    /// `~` and `~/...` use the session's HOME.
    pub fn expand_tilde(&self, word: &str) -> String {
        shellexpand::tilde_with_context(word, || self.variables.get("HOME")).into_owned()
    }

    /// Parameters, then tilde when the word starts with an unquoted `~`. Used
    /// for redirection targets and assignment values.
    pub fn expand_path(&self, word: &str) -> Result<String, ExpandError> {
        let expanded = self.expand(word)?;
        Ok(if word.starts_with('~') {
            self.expand_tilde(&expanded)
        } else {
            expanded
        })
    }

    /// Full argument expansion: parameters, then tilde, then globbing. A glob
    /// with no match stays literal, and a quoted pattern is never a glob.
    pub fn expand_word(&self, word: &str) -> Result<Vec<String>, ExpandError> {
        let expanded = self.expand_path(word)?;
        if has_glob_chars(&expanded) && !has_quoted_glob_chars(word) {
            let matches = expand_glob(&expanded);
            if !matches.is_empty() {
                return Ok(matches);
            }
        }
        Ok(vec![expanded])
    }
}

pub fn has_glob_chars(word: &str) -> bool {
    word.contains(['*', '?', '['])
}

fn has_quoted_glob_chars(word: &str) -> bool {
    let mut chars = word.chars();
    while let Some(c) = chars.next() {
        if c == '\\' && matches!(chars.next(), Some('*' | '?' | '[')) {
            return true;
        }
    }
    false
}

/// Sorted matches for `pattern`, empty when nothing matches or the pattern
/// is invalid.
pub fn expand_glob(pattern: &str) -> Vec<String> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let Ok(paths) = glob::glob_with(pattern, options) else {
        return Vec::new();
    };
    let mut matches: Vec<String> = paths
        .flatten()
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    matches.sort();
    matches
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    fn vars() -> Variables {
        let mut vars = Variables::new();
        vars.set("NAME", "world");
        vars.set("EMPTY", "");
        vars.set("HOME", "/home/tester");
        vars.set_positional(vec!["one".into(), "two".into()]);
        vars
    }

    #[test]
    fn test_simple_variables() {
        let vars = vars();
        let ex = Expander::new(&vars, 3, 42);
        assert_eq!(ex.expand("hello $NAME!").unwrap(), "hello world!");
        assert_eq!(ex.expand("${NAME}s").unwrap(), "worlds");
        assert_eq!(ex.expand("$UNSET-x").unwrap(), "-x");
        assert_eq!(ex.expand("cost $ 5").unwrap(), "cost $ 5");
        assert_eq!(ex.expand("trailing$").unwrap(), "trailing$");
    }

    #[test]
    fn test_special_parameters() {
        let vars = vars();
        let ex = Expander::new(&vars, 3, 42);
        assert_eq!(ex.expand("$?").unwrap(), "3");
        assert_eq!(ex.expand("$$").unwrap(), "42");
        assert_eq!(ex.expand("$#").unwrap(), "2");
        assert_eq!(ex.expand("$1-$2-$3").unwrap(), "one-two-");
        assert_eq!(ex.expand("$@").unwrap(), "one two");
        assert_eq!(ex.expand("$0").unwrap(), "jobsh");
        assert_eq!(ex.expand("${1}x").unwrap(), "onex");
    }

    #[test]
    fn test_default_and_alternate() {
        let vars = vars();
        let ex = Expander::new(&vars, 0, 1);
        assert_eq!(ex.expand("${UNSET:-fallback}").unwrap(), "fallback");
        assert_eq!(ex.expand("${EMPTY:-$NAME}").unwrap(), "world");
        assert_eq!(ex.expand("${NAME:-fallback}").unwrap(), "world");
        assert_eq!(ex.expand("${NAME:+set}").unwrap(), "set");
        assert_eq!(ex.expand("${UNSET:+set}").unwrap(), "");
        assert_eq!(ex.expand("${NAME:?boom}").unwrap(), "world");
    }

    #[test]
    fn test_required_parameter_error() {
        let vars = vars();
        let ex = Expander::new(&vars, 0, 1);
        let err = ex.expand("${UNSET:?must be set}").unwrap_err();
        assert_eq!(err.to_string(), "UNSET: must be set");
        let err = ex.expand("${EMPTY:?}").unwrap_err();
        assert_eq!(err.to_string(), "EMPTY: parameter null or not set");
    }

    #[test]
    fn test_unclosed_brace_is_literal() {
        let vars = vars();
        let ex = Expander::new(&vars, 0, 1);
        assert_eq!(ex.expand("${NAME").unwrap(), "${NAME");
    }

    #[test]
    fn test_quoted_characters_stay_literal() {
        let vars = vars();
        let ex = Expander::new(&vars, 0, 1);
        assert_eq!(ex.expand(r"\$NAME and $NAME").unwrap(), "$NAME and world");
        assert_eq!(ex.expand(r"a\\b").unwrap(), r"a\b");
        assert_eq!(ex.expand(r"${UNSET:-\$x}").unwrap(), "$x");
        assert_eq!(ex.expand_word(r"\~/src").unwrap(), vec!["~/src"]);
        assert_eq!(ex.expand_path("~/src").unwrap(), "/home/tester/src");
        assert_eq!(ex.expand_word(r"\*").unwrap(), vec!["*"]);
    }

    #[test]
    fn test_tilde_uses_session_home() {
        let vars = vars();
        let ex = Expander::new(&vars, 0, 1);
        assert_eq!(ex.expand_tilde("~"), "/home/tester");
        assert_eq!(ex.expand_tilde("~/src"), "/home/tester/src");
        assert_eq!(ex.expand_tilde("a~b"), "a~b");
    }

    #[test]
    fn test_glob_expansion() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.txt", "a.txt", "c.log", ".hidden.txt"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let base = dir.path().display().to_string();

        assert!(has_glob_chars("*.txt"));
        assert!(has_glob_chars("file?"));
        assert!(has_glob_chars("[ab]"));
        assert!(!has_glob_chars("plain"));

        let matches = expand_glob(&format!("{}/*.txt", base));
        assert_eq!(
            matches,
            vec![format!("{}/a.txt", base), format!("{}/b.txt", base)]
        );
        assert!(expand_glob(&format!("{}/*.none", base)).is_empty());

        let vars = vars();
        let ex = Expander::new(&vars, 0, 1);
        let literal = format!("{}/*.none", base);
        assert_eq!(ex.expand_word(&literal).unwrap(), vec![literal.clone()]);
        assert_eq!(ex.expand_word(&format!("{}/c.*", base)).unwrap().len(), 1);
    }
}
