use std::collections::HashMap;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;

use log::{debug, warn};
use nix::errno::Errno;
use nix::unistd::{fork, getpid, setpgid, tcsetpgrp, ForkResult, Pid};

use crate::shell::job_manager::JobManager;
use crate::shell::parser::{self, Node};
use crate::shell::signals::{self, SigchldBlock};

use super::expand::{ExpandError, Expander};
use super::flow::Flow;
use super::variable::Variables;

pub(super) fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Leaves a forked child without running any destructor of the parent's
/// state. Builtins write unbuffered, so there is nothing to flush.
pub(super) fn child_exit(status: i32) -> ! {
    unsafe { libc::_exit(status) }
}

pub struct Executor {
    pub(super) variables: Variables,
    pub(super) functions: HashMap<String, Rc<Node>>,
    pub(super) jobs: JobManager,
    pub(super) last_status: i32,
    pub(super) shell_pid: i32,
    /// Whether forked units get their own process group.
    pub(super) job_control: bool,
    pub(super) loop_depth: usize,
    /// Function calls and sourced files, where `return` is allowed.
    pub(super) call_depth: usize,
    pub(super) exit_request: Option<i32>,
    pub(super) exit_warned: bool,
    /// Entries shown by `history`, oldest first.
    pub(super) history: Vec<String>,
    pub(super) history_cleared: bool,
}

impl Executor {
    pub fn new(jobs: JobManager) -> Self {
        Self {
            variables: Variables::from_env(),
            functions: HashMap::new(),
            jobs,
            last_status: 0,
            shell_pid: getpid().as_raw(),
            job_control: true,
            loop_depth: 0,
            call_depth: 0,
            exit_request: None,
            exit_warned: false,
            history: Vec::new(),
            history_cleared: false,
        }
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn jobs_mut(&mut self) -> &mut JobManager {
        &mut self.jobs
    }

    pub fn last_status(&self) -> i32 {
        self.last_status
    }

    pub fn set_last_status(&mut self, status: i32) {
        self.last_status = status;
    }

    /// Set once `exit` ran at the top level.
    pub fn exit_requested(&self) -> Option<i32> {
        self.exit_request
    }

    pub fn record_history(&mut self, entry: &str) {
        self.history.push(entry.to_string());
    }

    /// True once after `history -c` ran.
    pub fn take_history_cleared(&mut self) -> bool {
        std::mem::take(&mut self.history_cleared)
    }

    /// Runs a startup file such as `~/.jobshrc` in the current shell.
    pub fn source_file(&mut self, path: &Path) -> i32 {
        let flow = self.source("source", path, &[]);
        self.last_status = flow.status();
        self.finish(flow)
    }

    /// Runs one tree and returns its status.
    pub fn execute(&mut self, node: &Node) -> i32 {
        let flow = self.eval(node);
        self.finish(flow)
    }

    /// Parses and runs a source text. Syntax errors yield status 2.
    pub fn execute_text(&mut self, text: &str) -> i32 {
        let flow = self.eval_text(text);
        self.finish(flow)
    }

    fn finish(&mut self, flow: Flow) -> i32 {
        if let Flow::Exit(code) = flow {
            self.exit_request = Some(code);
        }
        self.last_status
    }

    pub(super) fn eval_text(&mut self, text: &str) -> Flow {
        match parser::parse(text) {
            Ok(Some(node)) => {
                debug!("execute: {}", node);
                self.eval(&node)
            }
            Ok(None) => Flow::Normal(self.last_status),
            Err(err) => {
                eprintln!("jobsh: {}", err);
                self.last_status = 2;
                Flow::Normal(2)
            }
        }
    }

    pub(super) fn expander(&self) -> Expander<'_> {
        Expander::new(&self.variables, self.last_status, self.shell_pid)
    }

    /// Expands words the way command arguments are expanded.
    pub(super) fn expand_words(&self, words: &[String]) -> Result<Vec<String>, ExpandError> {
        let expander = self.expander();
        let mut expanded = Vec::with_capacity(words.len());
        for word in words {
            expanded.extend(expander.expand_word(word)?);
        }
        Ok(expanded)
    }

    pub(super) fn eval(&mut self, node: &Node) -> Flow {
        let flow = self.eval_node(node);
        self.last_status = flow.status();
        flow
    }

    fn eval_node(&mut self, node: &Node) -> Flow {
        match node {
            Node::Command(command) => self.eval_command(command, false),
            Node::Pipeline { stages, negated } => self.eval_pipeline(stages, *negated),
            Node::And(left, right) => match self.eval(left) {
                Flow::Normal(0) => self.eval(right),
                other => other,
            },
            Node::Or(left, right) => match self.eval(left) {
                Flow::Normal(status) if status != 0 => self.eval(right),
                other => other,
            },
            Node::Sequence(left, right) => match self.eval(left) {
                Flow::Normal(_) => self.eval(right),
                other => other,
            },
            Node::Background(inner) => self.eval_background(inner),
            Node::Negate(inner) => match self.eval(inner) {
                Flow::Normal(status) => Flow::from_bool(status != 0),
                other => other,
            },
            Node::Subshell(inner) => self.eval_subshell(inner),
            Node::If {
                condition,
                then_body,
                else_body,
            } => match self.eval(condition) {
                Flow::Normal(0) => self.eval(then_body),
                Flow::Normal(_) => match else_body {
                    Some(else_body) => self.eval(else_body),
                    None => Flow::Normal(0),
                },
                other => other,
            },
            Node::While { condition, body } => {
                self.loop_depth += 1;
                let flow = self.eval_while(condition, body);
                self.loop_depth -= 1;
                flow
            }
            Node::For {
                variable,
                words,
                body,
            } => {
                let items = match words {
                    Some(words) => match self.expand_words(words) {
                        Ok(items) => items,
                        Err(err) => {
                            eprintln!("jobsh: {}", err);
                            return Flow::Normal(1);
                        }
                    },
                    None => self.variables.positional().to_vec(),
                };
                self.loop_depth += 1;
                let flow = self.eval_for(variable, &items, body);
                self.loop_depth -= 1;
                flow
            }
            Node::Function { name, body } => {
                debug!("define function {}", name);
                self.functions.insert(name.clone(), Rc::clone(body));
                Flow::Normal(0)
            }
            Node::Block(inner) => self.eval(inner),
        }
    }

    fn eval_while(&mut self, condition: &Node, body: &Node) -> Flow {
        let mut status = 0;
        loop {
            match self.eval(condition) {
                Flow::Normal(0) => {}
                Flow::Normal(_) => break,
                other => return other,
            }
            match self.eval(body) {
                Flow::Normal(last) => status = last,
                Flow::Break(levels) if levels > 1 => return Flow::Break(levels - 1),
                Flow::Break(_) => return Flow::Normal(0),
                Flow::Continue(levels) if levels > 1 => return Flow::Continue(levels - 1),
                Flow::Continue(_) => status = 0,
                other => return other,
            }
        }
        Flow::Normal(status)
    }

    fn eval_for(&mut self, variable: &str, items: &[String], body: &Node) -> Flow {
        let mut status = 0;
        for item in items {
            self.variables.set(variable, item.as_str());
            match self.eval(body) {
                Flow::Normal(last) => status = last,
                Flow::Break(levels) if levels > 1 => return Flow::Break(levels - 1),
                Flow::Break(_) => return Flow::Normal(0),
                Flow::Continue(levels) if levels > 1 => return Flow::Continue(levels - 1),
                Flow::Continue(_) => status = 0,
                other => return other,
            }
        }
        Flow::Normal(status)
    }

    /// Puts a process into `pgid`. Called from both sides of a fork.
    pub(super) fn join_group(&self, pid: Pid, pgid: Pid) {
        if !self.job_control {
            return;
        }
        if let Err(err) = setpgid(pid, pgid) {
            // EACCES: the child already exec'd and did it itself.
            if err != Errno::EACCES && err != Errno::ESRCH {
                warn!("jobsh: setpgid({}, {}) failed: {}", pid, pgid, err);
            }
        }
    }

    /// First thing a forked child does: join its process group, take the
    /// terminal when it runs in the foreground, restore default signal
    /// handling and drop the parent's job table.
    pub(super) fn enter_child(&mut self, pgid: Option<Pid>, foreground: bool) {
        let pid = getpid();
        if self.job_control {
            let pgid = pgid.unwrap_or(pid);
            self.join_group(pid, pgid);
            if foreground && self.jobs.is_interactive() {
                if let Err(err) = tcsetpgrp(io::stdin(), pgid) {
                    warn!("jobsh: tcsetpgrp({}) failed: {}", pgid, err);
                }
            }
        }
        signals::reset_child_signals();
        self.jobs.forget_all();
        self.job_control = false;
    }

    /// Runs `body` in a forked child and exits with its status.
    pub(super) fn run_child(&mut self, body: impl FnOnce(&mut Self) -> i32) -> ! {
        let status = panic::catch_unwind(AssertUnwindSafe(|| body(self))).unwrap_or(1);
        child_exit(status)
    }

    fn eval_background(&mut self, inner: &Node) -> Flow {
        let _block = SigchldBlock::new();
        flush_std();
        match unsafe { fork() } {
            Err(err) => {
                eprintln!("jobsh: fork: {}", err);
                Flow::Normal(1)
            }
            Ok(ForkResult::Child) => {
                self.enter_child(None, false);
                self.run_child(|shell| shell.run_stage(inner))
            }
            Ok(ForkResult::Parent { child }) => {
                self.join_group(child, child);
                let id = self.jobs.add_job(child, &[child], inner.to_string(), false);
                eprintln!("[{}] {}", id, child);
                Flow::Normal(0)
            }
        }
    }

    fn eval_subshell(&mut self, inner: &Node) -> Flow {
        let _block = SigchldBlock::new();
        flush_std();
        match unsafe { fork() } {
            Err(err) => {
                eprintln!("jobsh: fork: {}", err);
                Flow::Normal(1)
            }
            Ok(ForkResult::Child) => {
                self.enter_child(None, true);
                self.run_child(|shell| shell.run_stage(inner))
            }
            Ok(ForkResult::Parent { child }) => {
                self.join_group(child, child);
                let id = self
                    .jobs
                    .add_job(child, &[child], format!("({})", inner), true);
                Flow::Normal(self.jobs.wait_foreground(id))
            }
        }
    }
}
