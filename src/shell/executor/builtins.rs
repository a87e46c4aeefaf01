use std::env;
use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use nix::errno::Errno;
use nix::unistd;

use crate::shell::parser::parser::{is_identifier, split_assignment};
use crate::utils::path::find_in_path;

use super::command::DEFAULT_PATH;
use super::executor::Executor;
use super::flow::Flow;

pub const BUILTINS: &[&str] = &[
    ".", ":", "bg", "break", "cd", "continue", "echo", "exit", "export", "false", "fg",
    "help", "history", "jobs", "local", "pwd", "return", "source", "true", "type", "unset",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Writes straight to fd 1, wherever it currently points. Nothing is
/// buffered, so a fork never duplicates pending output.
fn write_out(text: &str) -> i32 {
    let mut bytes = text.as_bytes();
    while !bytes.is_empty() {
        match unistd::write(io::stdout(), bytes) {
            Ok(written) => bytes = &bytes[written..],
            Err(Errno::EINTR) => {}
            Err(err) => {
                eprintln!("jobsh: write error: {}", err.desc());
                return 1;
            }
        }
    }
    0
}

fn parse_status(name: &str, arg: &str) -> Result<i32, Flow> {
    match arg.parse::<i64>() {
        Ok(n) => Ok((n & 0xff) as i32),
        Err(_) => {
            eprintln!("jobsh: {}: {}: numeric argument required", name, arg);
            Err(Flow::Normal(2))
        }
    }
}

impl Executor {
    pub(super) fn run_builtin(&mut self, argv: &[String]) -> Flow {
        let Some((name, args)) = argv.split_first() else {
            return Flow::Normal(0);
        };
        debug!("builtin {} {:?}", name, args);
        self.handle_builtin(name, args).unwrap_or(Flow::Normal(127))
    }

    fn handle_builtin(&mut self, name: &str, args: &[String]) -> Option<Flow> {
        let flow = match name {
            "cd" => self.builtin_cd(args),
            "pwd" => builtin_pwd(),
            "echo" => builtin_echo(args),
            "exit" => self.builtin_exit(args),
            "export" => self.builtin_export(args),
            "unset" => self.builtin_unset(args),
            "local" => self.builtin_local(args),
            "jobs" => self.builtin_jobs(),
            "fg" => self.builtin_fg_bg(name, args, true),
            "bg" => self.builtin_fg_bg(name, args, false),
            "true" | ":" => Flow::Normal(0),
            "false" => Flow::Normal(1),
            "type" => self.builtin_type(args),
            "source" | "." => self.builtin_source(name, args),
            "history" => self.builtin_history(args),
            "help" => builtin_help(),
            "break" => self.builtin_loop_control(name, args, Flow::Break),
            "continue" => self.builtin_loop_control(name, args, Flow::Continue),
            "return" => self.builtin_return(args),
            _ => return None,
        };
        Some(flow)
    }

    fn builtin_cd(&mut self, args: &[String]) -> Flow {
        let target = match args.first().map(String::as_str) {
            None => match self.variables.get("HOME") {
                Some(home) => home.to_string(),
                None => {
                    eprintln!("jobsh: cd: HOME not set");
                    return Flow::Normal(1);
                }
            },
            Some("-") => match self.variables.get("OLDPWD") {
                Some(previous) => {
                    let previous = previous.to_string();
                    write_out(&format!("{}\n", previous));
                    previous
                }
                None => {
                    eprintln!("jobsh: cd: OLDPWD not set");
                    return Flow::Normal(1);
                }
            },
            Some(path) => path.to_string(),
        };

        let previous = env::current_dir().ok();
        if let Err(err) = env::set_current_dir(&target) {
            eprintln!("jobsh: cd: {}: {}", target, err);
            return Flow::Normal(1);
        }
        debug!("cd {}", target);
        if let Some(previous) = previous {
            self.variables.set("OLDPWD", previous.display().to_string());
        }
        if let Ok(current) = env::current_dir() {
            self.variables.set("PWD", current.display().to_string());
        }
        Flow::Normal(0)
    }

    fn builtin_exit(&mut self, args: &[String]) -> Flow {
        if self.jobs.has_stopped_jobs() && !self.exit_warned {
            eprintln!("There are stopped jobs.");
            self.exit_warned = true;
            return Flow::Normal(1);
        }
        match args.first() {
            None => Flow::Exit(self.last_status),
            Some(arg) => match parse_status("exit", arg) {
                Ok(status) => Flow::Exit(status),
                Err(_) => Flow::Exit(2),
            },
        }
    }

    fn builtin_export(&mut self, args: &[String]) -> Flow {
        if args.is_empty() {
            let listing: String = self
                .variables
                .exported()
                .into_iter()
                .map(|(name, value)| format!("export {}=\"{}\"\n", name, value))
                .collect();
            return Flow::Normal(write_out(&listing));
        }
        let mut status = 0;
        for arg in args {
            if let Some((name, value)) = split_assignment(arg) {
                self.variables.export(name, Some(value.to_string()));
            } else if is_identifier(arg) {
                self.variables.export(arg, None);
            } else {
                eprintln!("jobsh: export: `{}': not a valid identifier", arg);
                status = 1;
            }
        }
        Flow::Normal(status)
    }

    fn builtin_unset(&mut self, args: &[String]) -> Flow {
        let mut functions = false;
        for arg in args {
            match arg.as_str() {
                "-f" => functions = true,
                "-v" => functions = false,
                name if functions => {
                    self.functions.remove(name);
                }
                name => {
                    self.variables.unset(name);
                }
            }
        }
        Flow::Normal(0)
    }

    fn builtin_local(&mut self, args: &[String]) -> Flow {
        if self.call_depth == 0 {
            eprintln!("jobsh: local: can only be used in a function");
            return Flow::Normal(1);
        }
        let mut status = 0;
        for arg in args {
            if let Some((name, value)) = split_assignment(arg) {
                self.variables.set(name, value);
            } else if is_identifier(arg) {
                if self.variables.get(arg).is_none() {
                    self.variables.set(arg, "");
                }
            } else {
                eprintln!("jobsh: local: `{}': not a valid identifier", arg);
                status = 1;
            }
        }
        Flow::Normal(status)
    }

    fn builtin_jobs(&mut self) -> Flow {
        let listing: String = self
            .jobs
            .list()
            .into_iter()
            .map(|line| line + "\n")
            .collect();
        Flow::Normal(write_out(&listing))
    }

    fn builtin_fg_bg(&mut self, name: &str, args: &[String], foreground: bool) -> Flow {
        let id = match self.jobs.resolve_spec(args.first().map(String::as_str)) {
            Ok(id) => id,
            Err(message) => {
                eprintln!("jobsh: {}: {}", name, message);
                return Flow::Normal(1);
            }
        };
        let command = self
            .jobs
            .find(id)
            .map(|job| job.command.clone())
            .unwrap_or_default();
        if foreground {
            write_out(&format!("{}\n", command));
        } else {
            write_out(&format!("[{}] {} &\n", id, command));
        }
        Flow::Normal(self.jobs.continue_job(id, foreground))
    }

    fn builtin_type(&mut self, args: &[String]) -> Flow {
        let search = self.variables.get("PATH").unwrap_or(DEFAULT_PATH);
        let mut status = 0;
        let mut listing = String::new();
        for name in args {
            if self.functions.contains_key(name) {
                listing.push_str(&format!("{} is a function\n", name));
            } else if is_builtin(name) {
                listing.push_str(&format!("{} is a shell builtin\n", name));
            } else if let Some(path) = find_in_path(name, search) {
                listing.push_str(&format!("{} is {}\n", name, path.display()));
            } else {
                eprintln!("jobsh: type: {}: not found", name);
                status = 1;
            }
        }
        let written = write_out(&listing);
        Flow::Normal(if status != 0 { status } else { written })
    }

    fn builtin_source(&mut self, name: &str, args: &[String]) -> Flow {
        let Some((path, rest)) = args.split_first() else {
            eprintln!("jobsh: {}: filename argument required", name);
            return Flow::Normal(2);
        };
        self.source(name, Path::new(path), rest)
    }

    /// Runs a file in the current shell; `return` leaves it early.
    pub(super) fn source(&mut self, name: &str, path: &Path, args: &[String]) -> Flow {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                eprintln!("jobsh: {}: {}: {}", name, path.display(), err);
                return Flow::Normal(1);
            }
        };
        debug!("source {}", path.display());
        let saved = (!args.is_empty()).then(|| self.variables.set_positional(args.to_vec()));
        self.call_depth += 1;
        let flow = self.eval_text(&text);
        self.call_depth -= 1;
        if let Some(saved) = saved {
            self.variables.set_positional(saved);
        }
        match flow {
            Flow::Return(status) => Flow::Normal(status),
            other => other,
        }
    }

    fn builtin_history(&mut self, args: &[String]) -> Flow {
        let mut last: Option<usize> = None;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-c" => {
                    self.history.clear();
                    self.history_cleared = true;
                    return Flow::Normal(0);
                }
                "-n" => {
                    let Some(count) = iter.next() else {
                        eprintln!("jobsh: history: -n: option requires an argument");
                        return Flow::Normal(1);
                    };
                    match count.parse::<usize>() {
                        Ok(n) if n > 0 => last = Some(n),
                        _ => {
                            eprintln!("jobsh: history: {}: invalid count", count);
                            return Flow::Normal(1);
                        }
                    }
                }
                other => {
                    eprintln!("jobsh: history: {}: invalid option", other);
                    return Flow::Normal(1);
                }
            }
        }
        let start = last.map_or(0, |n| self.history.len().saturating_sub(n));
        let listing: String = self
            .history
            .iter()
            .enumerate()
            .skip(start)
            .map(|(i, entry)| format!("  {:4}  {}\n", i + 1, entry))
            .collect();
        Flow::Normal(write_out(&listing))
    }

    fn builtin_loop_control(
        &mut self,
        name: &str,
        args: &[String],
        unwind: fn(usize) -> Flow,
    ) -> Flow {
        let levels = match args.first() {
            None => 1,
            Some(arg) => match arg.parse::<usize>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    eprintln!("jobsh: {}: {}: loop count out of range", name, arg);
                    return Flow::Normal(1);
                }
            },
        };
        if self.loop_depth == 0 {
            eprintln!("jobsh: {}: only meaningful in a `for' or `while' loop", name);
            return Flow::Normal(0);
        }
        unwind(levels.min(self.loop_depth))
    }

    fn builtin_return(&mut self, args: &[String]) -> Flow {
        if self.call_depth == 0 {
            eprintln!("jobsh: return: can only `return' from a function or sourced script");
            return Flow::Normal(1);
        }
        match args.first() {
            None => Flow::Return(self.last_status),
            Some(arg) => match parse_status("return", arg) {
                Ok(status) => Flow::Return(status),
                Err(flow) => flow,
            },
        }
    }
}

fn builtin_pwd() -> Flow {
    match env::current_dir() {
        Ok(dir) => Flow::Normal(write_out(&format!("{}\n", dir.display()))),
        Err(err) => {
            eprintln!("jobsh: pwd: {}", err);
            Flow::Normal(1)
        }
    }
}

fn builtin_echo(args: &[String]) -> Flow {
    let mut newline = true;
    let mut words = args;
    while let Some((first, rest)) = words.split_first() {
        if first != "-n" {
            break;
        }
        newline = false;
        words = rest;
    }
    let mut text = words.join(" ");
    if newline {
        text.push('\n');
    }
    Flow::Normal(write_out(&text))
}

fn builtin_help() -> Flow {
    let mut text = format!("{} builtins:\n", env!("CARGO_PKG_NAME"));
    for name in BUILTINS {
        text.push_str("  ");
        text.push_str(name);
        text.push('\n');
    }
    Flow::Normal(write_out(&text))
}
