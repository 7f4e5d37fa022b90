//! Signal delivery to task processes.

use crate::types::{Error, Result};

/// Exit signals that mean "interrupted" rather than "failed".
#[cfg(unix)]
const INTERRUPTIONS: [i32; 3] = [
    nix::sys::signal::Signal::SIGINT as i32,
    nix::sys::signal::Signal::SIGTERM as i32,
    nix::sys::signal::Signal::SIGALRM as i32,
];

#[cfg(not(unix))]
const INTERRUPTIONS: [i32; 3] = [2, 15, 14];

/// Whether a terminating signal number is an interruption.
pub fn is_interruption(signo: i32) -> bool {
    INTERRUPTIONS.contains(&signo)
}

/// Whether an exit code is the shell encoding (`128 + signo`) of an interruption.
pub fn is_interruption_code(code: i32) -> bool {
    code > 128 && is_interruption(code - 128)
}

/// Ask a process to stop (SIGINT). A process that is already gone is not an error.
pub fn interrupt(pid: u32) -> Result<()> {
    send(pid, Kind::Interrupt)
}

/// Force a process to stop (SIGKILL).
pub fn kill(pid: u32) -> Result<()> {
    send(pid, Kind::Kill)
}

enum Kind {
    Interrupt,
    Kill,
}

#[cfg(unix)]
fn send(pid: u32, kind: Kind) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| Error::validation(format!("pid {} out of range", pid)))?;
    let sig = match kind {
        Kind::Interrupt => Signal::SIGINT,
        Kind::Kill => Signal::SIGKILL,
    };
    match signal::kill(Pid::from_raw(raw), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::internal(format!("failed to send {:?} to {}: {}", sig, pid, e))),
    }
}

#[cfg(not(unix))]
fn send(pid: u32, _kind: Kind) -> Result<()> {
    Err(Error::internal(format!(
        "signal delivery to {} is unsupported on this platform",
        pid
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interruption_codes() {
        assert!(is_interruption(2));
        assert!(is_interruption(15));
        assert!(is_interruption(14));
        assert!(!is_interruption(9));
        assert!(is_interruption_code(130));
        assert!(is_interruption_code(143));
        assert!(!is_interruption_code(2));
        assert!(!is_interruption_code(137));
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_to_missing_process_is_ok() {
        // Pid far above any default pid_max.
        assert!(interrupt(0x3fff_fff0).is_ok());
    }
}
