use log::{debug, error, warn};
use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, IsTerminal};
use std::path::Path;

use crate::shell::executor::Executor;
use crate::shell::job_manager::JobManager;
use crate::shell::parser;
use crate::shell::readline::{BufLines, LineSource, ReadlineError, ReadlineManager};
use crate::shell::signals;
use crate::utils::config::Config;
use crate::utils::theme::Theme;

/// An odd number of trailing backslashes escapes the newline.
fn continues_on_next_line(text: &str) -> bool {
    text.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

pub struct Shell<'a> {
    config: &'a Config,
    theme: Theme,
    executor: Executor,
}

impl<'a> Shell<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            theme: Theme::default(),
            executor: Executor::new(JobManager::new()),
        }
    }

    fn set_arguments(&mut self, name: Option<String>, args: Vec<String>) {
        let variables = self.executor.variables_mut();
        if let Some(name) = name {
            variables.set_script_name(name);
        }
        variables.set_positional(args);
    }

    /// Non-interactive modes reap through the SIGCHLD handler too; `run`
    /// installs it itself once job control is set up.
    pub fn install_reaper(&self) {
        signals::install_sigchld_handler();
    }

    /// `jobsh -c COMMAND [NAME [ARGS...]]`.
    pub fn run_command(&mut self, command: &str, mut args: Vec<String>) -> i32 {
        let name = (!args.is_empty()).then(|| args.remove(0));
        self.set_arguments(name, args);
        let status = self.executor.execute_text(command);
        self.finish(self.executor.exit_requested().unwrap_or(status))
    }

    /// Runs a script file non-interactively.
    pub fn run_script(&mut self, path: &Path, args: Vec<String>) -> i32 {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                eprintln!("jobsh: {}: {}", path.display(), err);
                return 127;
            }
        };
        self.set_arguments(Some(path.display().to_string()), args);
        let mut source = BufLines::new(BufReader::new(file), false);
        self.run_lines(&mut source, false)
    }

    /// Reads commands from stdin; interactive with job control when stdin is
    /// a terminal.
    pub fn run(&mut self) -> Result<i32, Box<dyn Error>> {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            signals::install_sigchld_handler();
            let mut source = BufLines::new(stdin.lock(), false);
            return Ok(self.run_lines(&mut source, false));
        }

        debug!("初始化 jobsh...");
        if !self.executor.jobs_mut().init_job_control() {
            warn!("无法启用作业控制");
        }
        signals::install_sigchld_handler();

        let mut readline = ReadlineManager::new(self.config)?;
        readline.load_history();
        for entry in readline.entries() {
            self.executor.record_history(&entry);
        }
        if let Some(code) = self.source_rc() {
            readline.save_history();
            return Ok(self.finish(code));
        }
        debug!("jobsh 准备就绪...");

        let status = self.run_lines(&mut readline, true);
        readline.save_history();
        debug!("退出 jobsh...");
        Ok(status)
    }

    /// Runs the rc file when there is one. Returns the status to leave with
    /// when it called `exit`.
    fn source_rc(&mut self) -> Option<i32> {
        let rc_file = &self.config.rc_file;
        if !rc_file.is_file() {
            return None;
        }
        debug!("加载配置脚本: {}", rc_file.display());
        self.executor.source_file(rc_file);
        self.executor.exit_requested()
    }

    /// The read-parse-execute loop. Lines are collected until they form a
    /// complete program, so compound commands may span several lines.
    pub fn run_lines(&mut self, source: &mut dyn LineSource, interactive: bool) -> i32 {
        let mut buffer = String::new();
        loop {
            if buffer.is_empty() {
                // Finished background jobs are dropped either way.
                let lines = self.executor.jobs_mut().notifications();
                if interactive {
                    for line in lines {
                        eprintln!("{}", line);
                    }
                }
            }
            let prompt = if buffer.is_empty() {
                self.theme.prompt_for(self.executor.last_status())
            } else {
                self.theme.continuation()
            };

            let line = match source.read_line(&prompt) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(ReadlineError::Interrupted) => {
                    debug!("接收到中断信号");
                    buffer.clear();
                    self.executor.set_last_status(130);
                    continue;
                }
                Err(err) => {
                    error!("发生错误: {}", err);
                    eprintln!("jobsh: {}", err);
                    break;
                }
            };

            if !buffer.is_empty() {
                buffer.push('\n');
            }
            buffer.push_str(&line);
            if continues_on_next_line(&buffer) {
                continue;
            }

            let parsed = parser::parse(&buffer);
            if matches!(&parsed, Err(err) if err.is_incomplete()) {
                continue;
            }
            let text = std::mem::take(&mut buffer);
            if interactive && !text.trim().is_empty() {
                source.remember(&text);
                self.executor.record_history(&text);
            }
            match parsed {
                Ok(Some(node)) => {
                    debug!("execute: {}", node);
                    self.executor.execute(&node);
                }
                Ok(None) => {}
                Err(err) => {
                    eprintln!("jobsh: {}", err);
                    self.executor.set_last_status(2);
                }
            }
            if self.executor.take_history_cleared() {
                source.forget_history();
            }
            if let Some(code) = self.executor.exit_requested() {
                return self.finish(code);
            }
        }

        if !buffer.trim().is_empty() {
            // Input ended inside an unfinished command.
            self.executor.execute_text(&buffer);
        }
        let status = self.executor.exit_requested().unwrap_or(self.executor.last_status());
        self.finish(status)
    }

    fn finish(&mut self, status: i32) -> i32 {
        self.executor.jobs_mut().shutdown();
        status
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Cursor;

    fn run_text(text: &str) -> i32 {
        let config = Config::default();
        let mut shell = Shell::new(&config);
        let mut source = BufLines::new(Cursor::new(text.to_string()), false);
        shell.run_lines(&mut source, false)
    }

    #[test]
    fn test_continuation_detection() {
        assert!(continues_on_next_line("echo a \\"));
        assert!(!continues_on_next_line("echo a \\\\"));
        assert!(!continues_on_next_line("echo a"));
    }

    #[test]
    fn test_compound_command_across_lines() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let script = format!(
            "(if true\nthen\n  echo multi > {}\nfi)\n",
            out.display()
        );
        assert_eq!(run_text(&script), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "multi\n");
    }

    #[test]
    fn test_backslash_joins_lines() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let script = format!("sh -c 'echo $#' x a \\\nb > {}\n", out.display());
        assert_eq!(run_text(&script), 0);
        assert_eq!(fs::read_to_string(&out).unwrap(), "2\n");
    }

    #[test]
    fn test_status_of_last_command() {
        assert_eq!(run_text("true\nfalse\n"), 1);
        assert_eq!(run_text("false\n\ntrue\n"), 0);
        assert_eq!(run_text(""), 0);
    }

    #[test]
    fn test_syntax_error_does_not_stop_the_loop() {
        assert_eq!(run_text("echo )\ntrue\n"), 0);
        assert_eq!(run_text("true\nfi\n"), 2);
    }

    #[test]
    fn test_unfinished_input_is_a_syntax_error() {
        assert_eq!(run_text("if true; then\n  true\n"), 2);
        assert_eq!(run_text("echo 'open\n"), 2);
    }

    #[test]
    fn test_exit_stops_reading() {
        assert_eq!(run_text("exit 7\nexit 9\n"), 7);
        assert_eq!(run_text("sh -c 'exit 5'\nexit\n"), 5);
    }

    #[test]
    fn test_history_lists_interactive_entries() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let config = Config::default();
        let mut shell = Shell::new(&config);
        let text = format!("true\n\n(history -n 2 > {})\n", out.display());
        let mut source = BufLines::new(Cursor::new(text), false);
        assert_eq!(shell.run_lines(&mut source, true), 0);
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            format!("     1  true\n     2  (history -n 2 > {})\n", out.display())
        );
    }

    #[test]
    fn test_history_clear() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let config = Config::default();
        let mut shell = Shell::new(&config);
        let text = format!("true\nhistory -c\n(history > {})\n", out.display());
        let mut source = BufLines::new(Cursor::new(text), false);
        assert_eq!(shell.run_lines(&mut source, true), 0);
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            format!("     1  (history > {})\n", out.display())
        );
    }

    #[test]
    fn test_rc_file_runs_in_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.rc_file = dir.path().join("missing");
        assert_eq!(Shell::new(&config).source_rc(), None);

        config.rc_file = dir.path().join(".jobshrc");
        fs::write(&config.rc_file, "GREETING=hi\ngreet() { return 4; }\n").unwrap();
        let mut shell = Shell::new(&config);
        assert_eq!(shell.source_rc(), None);
        assert_eq!(shell.executor.variables().get("GREETING"), Some("hi"));
        assert_eq!(shell.executor.execute_text("greet"), 4);

        fs::write(&config.rc_file, "exit 3\necho unreachable\n").unwrap();
        let mut shell = Shell::new(&config);
        assert_eq!(shell.source_rc(), Some(3));
    }

    #[test]
    fn test_run_script_with_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.sh");
        let out = dir.path().join("out");
        fs::write(
            &script,
            format!("sh -c 'echo \"$0 $1 $2\"' $0 $1 $# > {}\n", out.display()),
        )
        .unwrap();
        let config = Config::default();
        let mut shell = Shell::new(&config);
        let status = shell.run_script(&script, vec!["first".into(), "second".into()]);
        assert_eq!(status, 0);
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            format!("{} first 2\n", script.display())
        );
        assert_eq!(shell.run_script(&dir.path().join("none"), Vec::new()), 127);
    }
}
