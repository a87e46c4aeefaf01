use std::ffi::CString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::rc::Rc;

use log::debug;
use nix::errno::Errno;
use nix::unistd::{execve, fork, ForkResult};

use crate::shell::parser::{Command, Node, RedirectKind, Redirection};
use crate::shell::signals::SigchldBlock;
use crate::utils::path::resolve_command;

use super::builtins;
use super::executor::{child_exit, flush_std, Executor};
use super::expand::ExpandError;
use super::flow::Flow;
use super::redirect::{self, RedirectGuard};

/// Search path used when the session has no PATH.
pub(super) const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

struct Expanded {
    argv: Vec<String>,
    assignments: Vec<(String, String)>,
    redirections: Vec<Redirection>,
}

impl Executor {
    fn expand_command(&self, command: &Command) -> Result<Expanded, ExpandError> {
        let argv = self.expand_words(&command.args)?;
        let expander = self.expander();

        let mut assignments = Vec::with_capacity(command.assignments.len());
        for assignment in &command.assignments {
            let value = expander.expand_path(&assignment.value)?;
            assignments.push((assignment.name.clone(), value));
        }

        let mut redirections = Vec::with_capacity(command.redirections.len());
        for redirection in &command.redirections {
            let target = match redirection.kind {
                RedirectKind::Input | RedirectKind::Output | RedirectKind::Append => {
                    expander.expand_path(&redirection.target)?
                }
                _ => redirection.target.clone(),
            };
            redirections.push(Redirection {
                target,
                ..redirection.clone()
            });
        }

        Ok(Expanded {
            argv,
            assignments,
            redirections,
        })
    }

    /// Runs a simple command. With `tail` set the caller is a forked child
    /// with nothing left to do, so an external program replaces it.
    pub(super) fn eval_command(&mut self, command: &Command, tail: bool) -> Flow {
        let expanded = match self.expand_command(command) {
            Ok(expanded) => expanded,
            Err(err) => {
                eprintln!("jobsh: {}", err);
                return Flow::Normal(1);
            }
        };
        let Expanded {
            argv,
            assignments,
            redirections,
        } = expanded;

        // The stopped-jobs warning only lets a directly following `exit` through.
        if argv.first().map(String::as_str) != Some("exit") {
            self.exit_warned = false;
        }

        let Some(name) = argv.first() else {
            // Only assignments and redirections: both touch the shell itself.
            return self.with_redirections(&redirections, |shell| {
                for (name, value) in assignments {
                    shell.variables.set(&name, value);
                }
                Flow::Normal(0)
            });
        };

        if let Some(body) = self.functions.get(name).cloned() {
            let args = argv[1..].to_vec();
            return self.with_redirections(&redirections, |shell| shell.call_function(&body, args));
        }
        if builtins::is_builtin(name) {
            return self.with_redirections(&redirections, |shell| shell.run_builtin(&argv));
        }
        if tail {
            self.exec_external(&argv, &assignments, &redirections);
        }
        self.fork_exec(command, &argv, &assignments, &redirections)
    }

    /// Applies redirections to the shell's own descriptors around `body`.
    fn with_redirections(
        &mut self,
        redirections: &[Redirection],
        body: impl FnOnce(&mut Self) -> Flow,
    ) -> Flow {
        let guard = match RedirectGuard::apply(redirections) {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("jobsh: {}", err);
                return Flow::Normal(1);
            }
        };
        let flow = body(self);
        drop(guard);
        flow
    }

    fn call_function(&mut self, body: &Rc<Node>, args: Vec<String>) -> Flow {
        let saved = self.variables.set_positional(args);
        // Loops of the caller are not visible to `break` inside the body.
        let saved_loops = std::mem::take(&mut self.loop_depth);
        self.call_depth += 1;

        let flow = self.eval(body);

        self.call_depth -= 1;
        self.loop_depth = saved_loops;
        self.variables.set_positional(saved);
        match flow {
            Flow::Return(status) => Flow::Normal(status),
            Flow::Break(_) | Flow::Continue(_) => Flow::Normal(0),
            other => other,
        }
    }

    fn fork_exec(
        &mut self,
        command: &Command,
        argv: &[String],
        assignments: &[(String, String)],
        redirections: &[Redirection],
    ) -> Flow {
        let _block = SigchldBlock::new();
        flush_std();
        match unsafe { fork() } {
            Err(err) => {
                eprintln!("jobsh: fork: {}", err);
                Flow::Normal(1)
            }
            Ok(ForkResult::Child) => {
                self.enter_child(None, true);
                self.exec_external(argv, assignments, redirections)
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("forked {} for {:?}", child, argv);
                self.join_group(child, child);
                let id = self
                    .jobs
                    .add_job(child, &[child], command.to_string(), true);
                Flow::Normal(self.jobs.wait_foreground(id))
            }
        }
    }

    /// Replaces the current (child) process with an external program.
    pub(super) fn exec_external(
        &mut self,
        argv: &[String],
        assignments: &[(String, String)],
        redirections: &[Redirection],
    ) -> ! {
        let Some(name) = argv.first() else {
            child_exit(0)
        };
        for (var, value) in assignments {
            self.variables.export(var, Some(value.clone()));
        }
        if let Err(err) = redirect::apply(redirections) {
            eprintln!("jobsh: {}", err);
            child_exit(1);
        }

        let path = if name.contains('/') {
            PathBuf::from(name)
        } else {
            let search = self.variables.get("PATH").unwrap_or(DEFAULT_PATH);
            match resolve_command(name, search) {
                Some(path) => path,
                None => {
                    eprintln!("jobsh: {}: command not found", name);
                    child_exit(127);
                }
            }
        };

        let program = CString::new(path.into_os_string().into_vec());
        let args: Result<Vec<CString>, _> = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect();
        let (Ok(program), Ok(args)) = (program, args) else {
            eprintln!("jobsh: {}: argument contains a NUL byte", name);
            child_exit(126);
        };
        let env = self.variables.envp();

        let err = match execve(&program, &args, &env) {
            Ok(never) => match never {},
            Err(err) => err,
        };
        eprintln!("jobsh: {}: {}", name, err.desc());
        child_exit(if err == Errno::ENOENT { 127 } else { 126 })
    }
}
