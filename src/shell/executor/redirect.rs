use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;

use log::{trace, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{close, dup2};
use thiserror::Error;

use crate::shell::parser::ast::{RedirectKind, Redirection};

// Saved copies of redirected descriptors live above the range users touch.
const SAVED_FD_MIN: RawFd = 10;

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("{path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("{target}: bad file descriptor")]
    BadFd { target: String },
    #[error("heredoc: not supported")]
    Heredoc,
    #[error("{fd}: {source}")]
    Dup { fd: RawFd, source: Errno },
}

fn open_target(redirection: &Redirection) -> Result<RawFd, RedirectError> {
    let mut options = OpenOptions::new();
    match redirection.kind {
        RedirectKind::Input => {
            options.read(true);
        }
        RedirectKind::Output => {
            options.write(true).create(true).truncate(true).mode(0o666);
        }
        _ => {
            options.append(true).create(true).mode(0o666);
        }
    }
    let file = options
        .open(&redirection.target)
        .map_err(|source| RedirectError::Open {
            path: redirection.target.clone(),
            source,
        })?;
    Ok(file.into_raw_fd())
}

/// Makes `fd` available as `target`, consuming `fd`.
fn move_fd(fd: RawFd, target: RawFd) -> Result<(), RedirectError> {
    if fd == target {
        // Files are opened close-on-exec; the target must survive exec.
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
            .map_err(|source| RedirectError::Dup { fd: target, source })?;
        return Ok(());
    }
    let result = dup2(fd, target).map_err(|source| RedirectError::Dup { fd: target, source });
    let _ = close(fd);
    result.map(|_| ())
}

fn redirect_one(redirection: &Redirection) -> Result<(), RedirectError> {
    trace!("redirect {}", redirection);
    match redirection.kind {
        RedirectKind::Heredoc => Err(RedirectError::Heredoc),
        RedirectKind::DupIn | RedirectKind::DupOut => {
            if redirection.target == "-" {
                let _ = close(redirection.fd);
                return Ok(());
            }
            let source: RawFd =
                redirection
                    .target
                    .parse()
                    .map_err(|_| RedirectError::BadFd {
                        target: redirection.target.clone(),
                    })?;
            if fcntl(source, FcntlArg::F_GETFD).is_err() {
                return Err(RedirectError::BadFd {
                    target: redirection.target.clone(),
                });
            }
            if source != redirection.fd {
                dup2(source, redirection.fd).map_err(|source| RedirectError::Dup {
                    fd: redirection.fd,
                    source,
                })?;
            }
            Ok(())
        }
        _ => {
            let fd = open_target(redirection)?;
            move_fd(fd, redirection.fd)
        }
    }
}

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Applies redirections in source order for good; used in forked children.
pub fn apply(redirections: &[Redirection]) -> Result<(), RedirectError> {
    redirections.iter().try_for_each(redirect_one)
}

/// Applies redirections to the shell's own descriptors and puts the old ones
/// back on drop.
pub struct RedirectGuard {
    // (redirected fd, saved duplicate or None if it was closed)
    saved: Vec<(RawFd, Option<RawFd>)>,
}

impl RedirectGuard {
    pub fn apply(redirections: &[Redirection]) -> Result<Self, RedirectError> {
        let mut guard = Self { saved: Vec::new() };
        if redirections.is_empty() {
            return Ok(guard);
        }
        flush_std();
        for redirection in redirections {
            guard.save(redirection.fd);
            // On error the partially applied state is undone by drop.
            redirect_one(redirection)?;
        }
        Ok(guard)
    }

    fn save(&mut self, fd: RawFd) {
        if self.saved.iter().any(|(saved_fd, _)| *saved_fd == fd) {
            return;
        }
        let copy = match fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(SAVED_FD_MIN)) {
            Ok(copy) => Some(copy),
            Err(Errno::EBADF) => None,
            Err(err) => {
                warn!("jobsh: cannot save fd {}: {}", fd, err);
                None
            }
        };
        self.saved.push((fd, copy));
    }
}

impl Drop for RedirectGuard {
    fn drop(&mut self) {
        if self.saved.is_empty() {
            return;
        }
        flush_std();
        for (fd, copy) in self.saved.drain(..).rev() {
            match copy {
                Some(copy) => {
                    if let Err(err) = dup2(copy, fd) {
                        warn!("jobsh: cannot restore fd {}: {}", fd, err);
                    }
                    let _ = close(copy);
                }
                None => {
                    let _ = close(fd);
                }
            }
        }
    }
}
