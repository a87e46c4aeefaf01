use std::os::fd::{AsRawFd, OwnedFd};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, fork, pipe, ForkResult, Pid};

use crate::shell::parser::Node;
use crate::shell::signals::SigchldBlock;

use super::executor::{child_exit, flush_std, Executor};
use super::flow::Flow;

impl Executor {
    /// A single stage runs in the shell itself; longer pipelines fork one
    /// child per stage, all in the group of the first.
    pub(super) fn eval_pipeline(&mut self, stages: &[Node], negated: bool) -> Flow {
        let flow = match stages {
            [] => Flow::Normal(0),
            [single] => self.eval(single),
            _ => Flow::Normal(self.run_pipeline(stages)),
        };
        match flow {
            Flow::Normal(status) if negated => Flow::from_bool(status != 0),
            other => other,
        }
    }

    fn run_pipeline(&mut self, stages: &[Node]) -> i32 {
        let _block = SigchldBlock::new();
        flush_std();

        let mut pipes: Vec<(OwnedFd, OwnedFd)> = Vec::with_capacity(stages.len().saturating_sub(1));
        for _ in 1..stages.len() {
            match pipe() {
                Ok(ends) => pipes.push(ends),
                Err(err) => {
                    eprintln!("jobsh: pipe: {}", err);
                    return 1;
                }
            }
        }

        let last = stages.len() - 1;
        let mut pids: Vec<Pid> = Vec::with_capacity(stages.len());
        let mut pgid: Option<Pid> = None;

        for (i, stage) in stages.iter().enumerate() {
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    self.enter_child(pgid, true);
                    let mut wired: nix::Result<()> = Ok(());
                    if i > 0 {
                        wired = wired.and(dup2(pipes[i - 1].0.as_raw_fd(), libc::STDIN_FILENO).map(drop));
                    }
                    if i < last {
                        wired = wired.and(dup2(pipes[i].1.as_raw_fd(), libc::STDOUT_FILENO).map(drop));
                    }
                    // Every pipe end must be closed or readers never see EOF.
                    pipes.clear();
                    if let Err(err) = wired {
                        eprintln!("jobsh: dup2: {}", err);
                        child_exit(1);
                    }
                    self.run_child(|shell| shell.run_stage(stage))
                }
                Ok(ForkResult::Parent { child }) => {
                    let leader = *pgid.get_or_insert(child);
                    self.join_group(child, leader);
                    pids.push(child);
                }
                Err(err) => {
                    eprintln!("jobsh: fork: {}", err);
                    drop(pipes);
                    abandon(&pids);
                    return 1;
                }
            }
        }
        drop(pipes);

        let Some(pgid) = pgid else {
            return 1;
        };
        let text = stages
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ");
        debug!("pipeline pgid {} pids {:?}: {}", pgid, pids, text);
        let id = self.jobs.add_job(pgid, &pids, text, true);
        self.jobs.wait_foreground(id)
    }

    /// Body of a forked child: a simple command execs in place.
    pub(super) fn run_stage(&mut self, stage: &Node) -> i32 {
        match stage {
            Node::Command(command) => self.eval_command(command, true).status(),
            other => self.eval(other).status(),
        }
    }
}

/// Kills and reaps the stages already started when a later fork fails.
fn abandon(pids: &[Pid]) {
    for &pid in pids {
        let _ = kill(pid, Signal::SIGKILL);
        match waitpid(pid, None) {
            Ok(_) | Err(Errno::ECHILD) => {}
            Err(err) => warn!("jobsh: waitpid({}) failed: {}", pid, err),
        }
    }
}
