use std::fmt;
use std::io::{self, IsTerminal};

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag as WF, WaitStatus as WS};
use nix::unistd::{getpgrp, getpid, setpgid, tcgetpgrp, tcsetpgrp, Pid};

use super::signals::{self, SigchldBlock};

/// Last reported state of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    Running,
    Stopped(i32),
    Exited(i32),
    Signaled(i32),
}

impl ProcStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, ProcStatus::Exited(_) | ProcStatus::Signaled(_))
    }

    /// Shell status: the exit code, or 128 + signal.
    pub fn code(self) -> i32 {
        match self {
            ProcStatus::Running => 0,
            ProcStatus::Exited(code) => code,
            ProcStatus::Stopped(sig) | ProcStatus::Signaled(sig) => 128 + sig,
        }
    }

    fn from_wait(ws: WS) -> Option<(Pid, Self)> {
        match ws {
            WS::Exited(pid, code) => Some((pid, ProcStatus::Exited(code))),
            WS::Signaled(pid, sig, _) => Some((pid, ProcStatus::Signaled(sig as i32))),
            WS::Stopped(pid, sig) => Some((pid, ProcStatus::Stopped(sig as i32))),
            WS::Continued(pid) => Some((pid, ProcStatus::Running)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub pid: Pid,
    pub status: ProcStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Stopped,
    Done,
    Killed,
}

impl JobState {
    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Done | JobState::Killed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Running => "Running",
            JobState::Stopped => "Stopped",
            JobState::Done => "Done",
            JobState::Killed => "Killed",
        };
        f.pad(name)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    pub pgid: Pid,
    pub members: Vec<Member>,
    pub state: JobState,
    pub command: String,
    pub notified: bool,
    pub foreground: bool,
}

impl Job {
    fn refresh_state(&mut self) {
        let all_finished = self.members.iter().all(|m| m.status.is_finished());
        self.state = if all_finished {
            if self
                .members
                .iter()
                .any(|m| matches!(m.status, ProcStatus::Signaled(_)))
            {
                JobState::Killed
            } else {
                JobState::Done
            }
        } else if self.members.iter().any(|m| m.status == ProcStatus::Running) {
            JobState::Running
        } else {
            JobState::Stopped
        };
    }

    /// Status the job reports to the shell: the last member decides, except a
    /// stopped job reports the stop signal.
    pub fn status(&self) -> i32 {
        if self.state == JobState::Stopped {
            if let Some(stopped) = self
                .members
                .iter()
                .rev()
                .find(|m| matches!(m.status, ProcStatus::Stopped(_)))
            {
                return stopped.status.code();
            }
        }
        self.members.last().map_or(0, |m| m.status.code())
    }

    fn pending_pids(&self) -> Vec<Pid> {
        self.members
            .iter()
            .filter(|m| !m.status.is_finished())
            .map(|m| m.pid)
            .collect()
    }

    pub fn line(&self, mark: char) -> String {
        format!("[{}]{}  {:<24}{}", self.id, mark, self.state, self.command)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line(' '))
    }
}

pub struct JobManager {
    jobs: Vec<Job>,
    next_id: usize,
    interactive: bool,
    shell_pgid: Pid,
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JobManager {
    pub fn new() -> Self {
        Self {
            jobs: Vec::new(),
            next_id: 1,
            interactive: false,
            shell_pgid: getpgrp(),
        }
    }

    /// Puts the shell in its own process group in the foreground of the
    /// controlling terminal. Returns false when stdin is not a terminal.
    pub fn init_job_control(&mut self) -> bool {
        let stdin = io::stdin();
        if !stdin.is_terminal() {
            return false;
        }

        // Wait until we are in the foreground.
        loop {
            let pgrp = getpgrp();
            match tcgetpgrp(&stdin) {
                Ok(fg) if fg == pgrp => break,
                Ok(_) => {
                    if let Err(err) = killpg(pgrp, Signal::SIGTTIN) {
                        warn!("jobsh: killpg(SIGTTIN) failed: {}", err);
                        return false;
                    }
                }
                Err(err) => {
                    warn!("jobsh: tcgetpgrp failed: {}", err);
                    return false;
                }
            }
        }

        signals::ignore_job_control_signals();

        let pid = getpid();
        if let Err(err) = setpgid(pid, pid) {
            // A session leader already leads its group.
            if err != Errno::EPERM {
                warn!("jobsh: setpgid failed: {}", err);
            }
        }
        self.shell_pgid = getpgrp();
        if let Err(err) = tcsetpgrp(&stdin, self.shell_pgid) {
            warn!("jobsh: tcsetpgrp failed: {}", err);
        }
        self.interactive = true;
        debug!("job control enabled, shell pgid {}", self.shell_pgid);
        true
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// A forked child inherits a copy of the table it must never act on.
    pub fn forget_all(&mut self) {
        self.jobs.clear();
        self.interactive = false;
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn find(&self, id: usize) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    fn find_mut(&mut self, id: usize) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    pub fn most_recent(&self) -> Option<usize> {
        self.jobs.iter().map(|job| job.id).max()
    }

    pub fn has_stopped_jobs(&self) -> bool {
        self.jobs.iter().any(|job| job.state == JobState::Stopped)
    }

    pub fn add_job(&mut self, pgid: Pid, pids: &[Pid], command: String, foreground: bool) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        let job = Job {
            id,
            pgid,
            members: pids
                .iter()
                .map(|&pid| Member {
                    pid,
                    status: ProcStatus::Running,
                })
                .collect(),
            state: JobState::Running,
            command,
            notified: false,
            foreground,
        };
        debug!("job [{}] added: pgid {} pids {:?} {}", id, pgid, pids, job.command);
        self.jobs.push(job);
        id
    }

    pub fn remove_job(&mut self, id: usize) -> Option<Job> {
        let pos = self.jobs.iter().position(|job| job.id == id)?;
        Some(self.jobs.remove(pos))
    }

    /// Applies one wait result. Safe to call any number of times with the same
    /// status: a member that already finished never changes again.
    pub fn update_status(&mut self, ws: WS) -> bool {
        let Some((pid, status)) = ProcStatus::from_wait(ws) else {
            return false;
        };
        for job in self.jobs.iter_mut() {
            let Some(member) = job.members.iter_mut().find(|m| m.pid == pid) else {
                continue;
            };
            if member.status.is_finished() || member.status == status {
                return true;
            }
            member.status = status;

            let before = job.state;
            job.refresh_state();
            if job.state != before {
                debug!("job [{}] {} -> {}", job.id, before, job.state);
                job.notified = false;
            }
            return true;
        }
        false
    }

    /// Feeds everything the SIGCHLD handler reaped into the table.
    pub fn drain_signals(&mut self) {
        for (pid, raw) in signals::drain_reaped() {
            match WS::from_raw(Pid::from_raw(pid), raw) {
                Ok(ws) => {
                    if !self.update_status(ws) {
                        debug!("reaped untracked child {}", pid);
                    }
                }
                Err(err) => warn!("jobsh: bad wait status for {}: {}", pid, err),
            }
        }
    }

    /// Non-blocking status refresh of every tracked process.
    pub fn poll(&mut self) {
        let _block = SigchldBlock::new();
        self.drain_signals();
        let pending: Vec<Pid> = self.jobs.iter().flat_map(Job::pending_pids).collect();
        for pid in pending {
            match waitpid(pid, Some(WF::WNOHANG | WF::WUNTRACED | WF::WCONTINUED)) {
                Ok(WS::StillAlive) => {}
                Ok(ws) => {
                    self.update_status(ws);
                }
                Err(Errno::ECHILD) => {}
                Err(err) => warn!("jobsh: waitpid({}) failed: {}", pid, err),
            }
        }
    }

    fn give_terminal(&self, pgid: Pid) {
        if self.interactive {
            if let Err(err) = tcsetpgrp(io::stdin(), pgid) {
                warn!("jobsh: tcsetpgrp({}) failed: {}", pgid, err);
            }
        }
    }

    fn reclaim_terminal(&self) {
        self.give_terminal(self.shell_pgid);
    }

    /// Blocks until the job finishes or stops. A finished job is removed; a
    /// stopped one stays in the table as a background job.
    pub fn wait_foreground(&mut self, id: usize) -> i32 {
        let _block = SigchldBlock::new();
        let Some(job) = self.find_mut(id) else {
            return 0;
        };
        job.foreground = true;
        let pgid = job.pgid;

        self.give_terminal(pgid);
        self.wait_job(id);
        self.reclaim_terminal();

        let Some(job) = self.find_mut(id) else {
            return 0;
        };
        let status = job.status();
        if job.state == JobState::Stopped {
            job.foreground = false;
            job.notified = true;
            eprintln!("\n{}", job.line('+'));
        } else {
            self.remove_job(id);
        }
        status
    }

    fn wait_job(&mut self, id: usize) {
        loop {
            self.drain_signals();
            let Some(job) = self.find(id) else {
                return;
            };
            if job.state != JobState::Running {
                return;
            }
            let Some(pid) = job
                .members
                .iter()
                .find(|m| m.status == ProcStatus::Running)
                .map(|m| m.pid)
            else {
                return;
            };

            match waitpid(pid, Some(WF::WUNTRACED)) {
                Ok(ws) => {
                    self.update_status(ws);
                }
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // Reaped elsewhere; its status may be in the queue.
                    self.drain_signals();
                    if self.member_status(id, pid) == Some(ProcStatus::Running) {
                        warn!("jobsh: lost track of child {}", pid);
                        self.update_status(WS::Exited(pid, 0));
                    }
                }
                Err(err) => {
                    warn!("jobsh: waitpid({}) failed: {}", pid, err);
                    self.update_status(WS::Exited(pid, 1));
                }
            }
        }
    }

    fn member_status(&self, id: usize, pid: Pid) -> Option<ProcStatus> {
        self.find(id)?
            .members
            .iter()
            .find(|m| m.pid == pid)
            .map(|m| m.status)
    }

    /// Resolves `%N`, `N` or, when absent, the most recent job.
    pub fn resolve_spec(&self, spec: Option<&str>) -> Result<usize, String> {
        let Some(spec) = spec else {
            return self.most_recent().ok_or_else(|| "current: no such job".to_string());
        };
        let number = spec.strip_prefix('%').unwrap_or(spec);
        match number.parse::<usize>() {
            Ok(id) if self.find(id).is_some() => Ok(id),
            _ => Err(format!("{}: no such job", spec)),
        }
    }

    /// Sends SIGCONT to a job. In the foreground this waits like any other
    /// foreground job and returns its status.
    pub fn continue_job(&mut self, id: usize, foreground: bool) -> i32 {
        let _block = SigchldBlock::new();
        let Some(job) = self.find_mut(id) else {
            return 1;
        };
        for member in job.members.iter_mut() {
            if matches!(member.status, ProcStatus::Stopped(_)) {
                member.status = ProcStatus::Running;
            }
        }
        job.refresh_state();
        job.notified = false;
        job.foreground = foreground;
        let pgid = job.pgid;

        if foreground {
            self.give_terminal(pgid);
        }
        if let Err(err) = killpg(pgid, Signal::SIGCONT) {
            warn!("jobsh: killpg({}, SIGCONT) failed: {}", pgid, err);
        }

        if foreground {
            self.wait_foreground(id)
        } else {
            0
        }
    }

    /// Lines to show before the next prompt: finished background jobs (which
    /// are then removed) and jobs that stopped since they were last reported.
    pub fn notifications(&mut self) -> Vec<String> {
        self.poll();
        let mut lines = Vec::new();
        for job in self.jobs.iter_mut() {
            if job.foreground || job.notified {
                continue;
            }
            if job.state.is_finished() || job.state == JobState::Stopped {
                lines.push(format!("[{}]   {:<24}{}", job.id, job.state, job.command));
                job.notified = true;
            }
        }
        self.jobs.retain(|job| !job.state.is_finished());
        lines
    }

    /// `jobs` output in id order; reported finished jobs are dropped.
    pub fn list(&mut self) -> Vec<String> {
        self.poll();
        let current = self.most_recent();
        let lines = self
            .jobs
            .iter()
            .map(|job| job.line(if Some(job.id) == current { '+' } else { ' ' }))
            .collect();
        self.jobs.retain(|job| !job.state.is_finished());
        lines
    }

    /// Kills and reaps everything still alive.
    pub fn shutdown(&mut self) {
        let _block = SigchldBlock::new();
        self.drain_signals();
        for job in self.jobs.drain(..) {
            if job.state.is_finished() {
                continue;
            }
            debug!("killing job [{}] {}", job.id, job.command);
            if let Err(err) = killpg(job.pgid, Signal::SIGKILL) {
                if err != Errno::ESRCH {
                    warn!("jobsh: killpg({}) failed: {}", job.pgid, err);
                }
            }
            for pid in job.pending_pids() {
                let _ = kill(pid, Signal::SIGKILL);
                match waitpid(pid, None) {
                    Ok(_) | Err(Errno::ECHILD) => {}
                    Err(err) => warn!("jobsh: waitpid({}) failed: {}", pid, err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Far above any real pid so waitpid reports ECHILD.
    fn fake(pid: i32) -> Pid {
        Pid::from_raw(pid)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut jobs = JobManager::new();
        let a = jobs.add_job(fake(900_001), &[fake(900_001)], "a".into(), false);
        let b = jobs.add_job(fake(900_002), &[fake(900_002)], "b".into(), false);
        jobs.remove_job(b);
        let c = jobs.add_job(fake(900_003), &[fake(900_003)], "c".into(), false);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(jobs.most_recent(), Some(3));
    }

    #[test]
    fn test_update_status_is_idempotent() {
        let mut jobs = JobManager::new();
        let id = jobs.add_job(fake(900_010), &[fake(900_010)], "x".into(), false);

        assert!(jobs.update_status(WS::Exited(fake(900_010), 3)));
        if let Some(job) = jobs.find_mut(id) {
            job.notified = true;
        }
        assert!(jobs.update_status(WS::Exited(fake(900_010), 3)));
        assert!(jobs.update_status(WS::Signaled(fake(900_010), Signal::SIGKILL, false)));

        let job = jobs.find(id);
        assert_eq!(job.map(|j| j.state), Some(JobState::Done));
        assert_eq!(job.map(|j| j.status()), Some(3));
        // A repeated terminal status must not re-arm the notification.
        assert_eq!(job.map(|j| j.notified), Some(true));
    }

    #[test]
    fn test_pipeline_job_waits_for_every_member() {
        let mut jobs = JobManager::new();
        let pids = [fake(900_020), fake(900_021)];
        let id = jobs.add_job(pids[0], &pids, "a | b".into(), false);

        jobs.update_status(WS::Exited(pids[1], 0));
        assert_eq!(jobs.find(id).map(|j| j.state), Some(JobState::Running));

        jobs.update_status(WS::Signaled(pids[0], Signal::SIGPIPE, false));
        assert_eq!(jobs.find(id).map(|j| j.state), Some(JobState::Killed));
        // The last stage decides the status.
        assert_eq!(jobs.find(id).map(|j| j.status()), Some(0));
    }

    #[test]
    fn test_stop_and_continue_transitions() {
        let mut jobs = JobManager::new();
        let pid = fake(900_030);
        let id = jobs.add_job(pid, &[pid], "vim".into(), false);

        jobs.update_status(WS::Stopped(pid, Signal::SIGTSTP));
        let job = jobs.find(id);
        assert_eq!(job.map(|j| j.state), Some(JobState::Stopped));
        assert_eq!(job.map(|j| j.status()), Some(128 + Signal::SIGTSTP as i32));
        assert!(jobs.has_stopped_jobs());

        jobs.update_status(WS::Continued(pid));
        assert_eq!(jobs.find(id).map(|j| j.state), Some(JobState::Running));
        assert!(!jobs.has_stopped_jobs());
    }

    #[test]
    fn test_unknown_pid_is_ignored() {
        let mut jobs = JobManager::new();
        assert!(!jobs.update_status(WS::Exited(fake(900_040), 0)));
        assert!(!jobs.update_status(WS::StillAlive));
    }

    #[test]
    fn test_resolve_spec() {
        let mut jobs = JobManager::new();
        assert!(jobs.resolve_spec(None).is_err());
        jobs.add_job(fake(900_050), &[fake(900_050)], "a".into(), false);
        jobs.add_job(fake(900_051), &[fake(900_051)], "b".into(), false);
        assert_eq!(jobs.resolve_spec(None), Ok(2));
        assert_eq!(jobs.resolve_spec(Some("%1")), Ok(1));
        assert_eq!(jobs.resolve_spec(Some("1")), Ok(1));
        assert_eq!(
            jobs.resolve_spec(Some("%7")),
            Err("%7: no such job".to_string())
        );
        assert!(jobs.resolve_spec(Some("abc")).is_err());
    }

    #[test]
    fn test_notifications_report_once_and_remove_finished() {
        let mut jobs = JobManager::new();
        let done = fake(900_060);
        let stopped = fake(900_061);
        let running = fake(900_062);
        jobs.add_job(done, &[done], "sleep 1".into(), false);
        jobs.add_job(stopped, &[stopped], "vim".into(), false);
        jobs.add_job(running, &[running], "sleep 100".into(), false);

        jobs.update_status(WS::Exited(done, 0));
        jobs.update_status(WS::Stopped(stopped, Signal::SIGTSTP));

        let lines = jobs.notifications();
        assert_eq!(
            lines,
            vec![
                format!("[1]   {:<24}sleep 1", "Done"),
                format!("[2]   {:<24}vim", "Stopped"),
            ]
        );
        assert!(jobs.find(1).is_none());
        assert!(jobs.find(2).is_some());
        assert!(jobs.notifications().is_empty());
    }

    #[test]
    fn test_list_marks_most_recent() {
        let mut jobs = JobManager::new();
        jobs.add_job(fake(900_070), &[fake(900_070)], "a".into(), false);
        jobs.add_job(fake(900_071), &[fake(900_071)], "b".into(), false);
        assert_eq!(
            jobs.list(),
            vec![
                format!("[1]   {:<24}a", "Running"),
                format!("[2]+  {:<24}b", "Running"),
            ]
        );
    }

    #[test]
    fn test_forget_all_clears_table() {
        let mut jobs = JobManager::new();
        jobs.add_job(fake(900_080), &[fake(900_080)], "a".into(), false);
        jobs.forget_all();
        assert!(jobs.jobs().is_empty());
        assert!(!jobs.is_interactive());
    }
}
