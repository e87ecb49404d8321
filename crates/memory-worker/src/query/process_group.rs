//! Signals for whole process groups.
//!
//! Children are spawned with `process_group(0)`, so the child pid doubles as
//! the group id and every descendant that does not call setsid itself can be
//! reached through it.

/// True while a process with this pid exists (including zombies that have
/// not been reaped yet).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means it exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// True while any member of the group exists.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    if pgid == 0 || pgid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::killpg(pgid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> std::io::Result<()> {
    if pgid == 0 || pgid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid process group id {}", pgid),
        ));
    }
    let rc = unsafe { libc::killpg(pgid as i32, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        // already gone
        return Ok(());
    }
    Err(err)
}

#[cfg(unix)]
pub fn terminate_group(pgid: u32) -> std::io::Result<()> {
    signal_group(pgid, libc::SIGTERM)
}

#[cfg(unix)]
pub fn kill_group(pgid: u32) -> std::io::Result<()> {
    signal_group(pgid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn terminate_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!pid_alive(pid));
    }

    #[test]
    fn test_signalling_missing_group_is_ok() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(terminate_group(pid).is_ok());
        assert!(!group_alive(pid));
    }
}
