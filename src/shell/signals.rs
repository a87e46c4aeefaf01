//! Signal dispositions for the shell and its children, plus the SIGCHLD
//! reaper.
//!
//! The handler never touches shell state. It reaps with `waitpid(-1, ..)`
//! into a fixed table of atomics and the main loop drains that table through
//! `JobManager::update_status`.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use log::{debug, warn};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

const JOB_CONTROL_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

const REAP_SLOTS: usize = 64;

// pid == 0: free, pid == -1: being written by the handler, pid > 0: ready.
struct ReapSlot {
    pid: AtomicI32,
    status: AtomicI32,
    seq: AtomicU32,
}

#[allow(clippy::declare_interior_mutable_const)]
const FREE_SLOT: ReapSlot = ReapSlot {
    pid: AtomicI32::new(0),
    status: AtomicI32::new(0),
    seq: AtomicU32::new(0),
};

static REAP_QUEUE: [ReapSlot; REAP_SLOTS] = [FREE_SLOT; REAP_SLOTS];
static REAP_SEQ: AtomicU32 = AtomicU32::new(0);

fn reserve_slot() -> Option<&'static ReapSlot> {
    REAP_QUEUE.iter().find(|slot| {
        slot.pid
            .compare_exchange(0, -1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    })
}

extern "C" fn on_sigchld(_: libc::c_int) {
    let saved = errno::errno();
    // Children that do not fit stay zombies until the queue has room again.
    while let Some(slot) = reserve_slot() {
        let mut status: libc::c_int = 0;
        let pid = unsafe {
            libc::waitpid(
                -1,
                &mut status,
                libc::WNOHANG | libc::WUNTRACED | libc::WCONTINUED,
            )
        };
        if pid <= 0 {
            slot.pid.store(0, Ordering::Release);
            break;
        }
        slot.status.store(status, Ordering::Relaxed);
        slot.seq
            .store(REAP_SEQ.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        slot.pid.store(pid, Ordering::Release);
    }
    errno::set_errno(saved);
}

/// Takes every `(pid, raw wait status)` recorded by the handler, oldest first.
pub fn drain_reaped() -> Vec<(i32, i32)> {
    let mut reaped = Vec::new();
    for slot in REAP_QUEUE.iter() {
        let pid = slot.pid.load(Ordering::Acquire);
        if pid > 0 {
            let entry = (
                slot.seq.load(Ordering::Relaxed),
                pid,
                slot.status.load(Ordering::Relaxed),
            );
            slot.pid.store(0, Ordering::Release);
            reaped.push(entry);
        }
    }
    reaped.sort_by_key(|(seq, _, _)| *seq);
    reaped
        .into_iter()
        .map(|(_, pid, status)| (pid, status))
        .collect()
}

fn set_handler(sig: Signal, handler: SigHandler, flags: SaFlags) {
    let action = SigAction::new(handler, flags, SigSet::empty());
    if let Err(err) = unsafe { signal::sigaction(sig, &action) } {
        warn!("jobsh: sigaction({}) failed: {}", sig, err);
    }
}

/// Interactive shells must not be stopped or interrupted by the terminal.
pub fn ignore_job_control_signals() {
    for sig in JOB_CONTROL_SIGNALS {
        set_handler(sig, SigHandler::SigIgn, SaFlags::empty());
    }
}

pub fn install_sigchld_handler() {
    set_handler(
        Signal::SIGCHLD,
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART,
    );
    debug!("SIGCHLD handler installed");
}

/// Runs in a freshly forked child before it execs or evaluates anything.
/// SIGPIPE is ignored by the Rust runtime and must be restored too.
pub fn reset_child_signals() {
    let extra = [Signal::SIGCHLD, Signal::SIGPIPE];
    for sig in JOB_CONTROL_SIGNALS.into_iter().chain(extra) {
        set_handler(sig, SigHandler::SigDfl, SaFlags::empty());
    }
    if let Err(err) = SigSet::empty().thread_set_mask() {
        warn!("jobsh: failed to clear signal mask: {}", err);
    }
}

/// Keeps SIGCHLD blocked for its lifetime so the handler cannot reap a child
/// the main thread is about to wait for.
pub struct SigchldBlock {
    previous: Option<SigSet>,
}

impl SigchldBlock {
    pub fn new() -> Self {
        let mut set = SigSet::empty();
        set.add(Signal::SIGCHLD);
        let previous = match set.thread_swap_mask(SigmaskHow::SIG_BLOCK) {
            Ok(previous) => Some(previous),
            Err(err) => {
                warn!("jobsh: failed to block SIGCHLD: {}", err);
                None
            }
        };
        Self { previous }
    }
}

impl Drop for SigchldBlock {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(err) = previous.thread_set_mask() {
                warn!("jobsh: failed to restore signal mask: {}", err);
            }
        }
    }
}
