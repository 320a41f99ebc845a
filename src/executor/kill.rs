//! Platform process termination for timed-out runbooks.
//!
//! Runbooks are shell scripts that routinely fork children, so on POSIX the
//! child is placed in its own process group at spawn and the timeout kill
//! signals the whole group. Windows has no process groups in that sense; the
//! process handle is terminated directly. The variant is selected at compile
//! time.

#[cfg(unix)]
pub fn set_process_group(command: &mut tokio::process::Command) {
    unsafe {
        command.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(unix)]
pub fn kill_command(child: &mut tokio::process::Child) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    let pgid = unsafe { libc::getpgid(pid as libc::pid_t) };
    if pgid < 0 {
        tracing::error!("could not get the process group id from the command");
        let _ = child.start_kill();
        return;
    }
    unsafe {
        libc::kill(-pgid, libc::SIGTERM);
    }
}

#[cfg(windows)]
pub fn set_process_group(_command: &mut tokio::process::Command) {
    // Nothing to do.
}

#[cfg(windows)]
pub fn kill_command(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        tracing::error!(error = %e, "could not kill the command after timeout");
    }
}
