use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::Stdio;

/// A tokio command set up for running tools in the background: no stdin, no
/// console window, and its own process group so the whole tree can be stopped.
pub fn command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut std_cmd = std::process::Command::new(program);
    std_cmd.stdin(Stdio::null());
    configure_for_background(&mut std_cmd);

    let mut cmd = tokio::process::Command::from(std_cmd);
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(unix)]
fn configure_for_background(cmd: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;

    // pgid = child pid; helpers (aria2c, ffmpeg) inherit it
    cmd.process_group(0);
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut std::process::Command) {
    use std::os::windows::process::CommandExt;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

#[cfg(not(any(unix, windows)))]
fn configure_for_background(_cmd: &mut std::process::Command) {}

/// Ask the process group led by `pid` to terminate (SIGTERM).
#[cfg(unix)]
pub fn signal_group(pid: u32) -> io::Result<()> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32) -> io::Result<()> {
    // no group signal here; callers fall back to terminating the child itself
    Err(io::Error::new(io::ErrorKind::Unsupported, "process groups unsupported"))
}

/// Terminate a running child together with everything it spawned.
pub fn terminate_tree(child: &mut tokio::process::Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        // already reaped
        return Ok(());
    };
    match signal_group(pid) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::Unsupported => child.start_kill(),
        Err(e) => {
            tracing::warn!("group signal for pid {pid} failed ({e}); killing child only");
            child.start_kill()
        }
    }
}

/// Open a directory in the platform file browser.
pub fn open_directory(path: &Path) -> io::Result<()> {
    if !path.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("folder not found: {}", path.display()),
        ));
    }
    let opener = if cfg!(target_os = "windows") {
        "explorer"
    } else if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    std::process::Command::new(opener).arg(path).spawn()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_directory_rejects_missing_folder() {
        let err = open_directory(Path::new("/definitely/not/here/aria")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_tree_stops_sleeping_group() {
        let mut child = command("sh")
            .args(["-c", "sleep 30 & sleep 30"])
            .spawn()
            .unwrap();
        terminate_tree(&mut child).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
