//! Process-group and signal plumbing shared by the supervisor, workers and
//! stage commands.
//!
//! Workers and stage commands each lead their own process group, so every
//! level is responsible for stopping the group below it.

use std::future::Future;

use tokio::process::Command;

/// Signal a child receives if its parent dies first (Linux only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentDeath {
    /// Lets the child stop its own children before exiting.
    Terminate,
    Kill,
}

/// Makes the spawned child the leader of a new process group.
pub fn own_process_group(cmd: &mut Command, on_parent_death: ParentDeath) {
    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(target_os = "linux")]
    {
        use nix::sys::signal::Signal;

        let signal = match on_parent_death {
            ParentDeath::Terminate => Signal::SIGTERM,
            ParentDeath::Kill => Signal::SIGKILL,
        };
        // SAFETY: prctl is async-signal-safe and touches no parent state.
        unsafe {
            cmd.pre_exec(move || {
                nix::sys::prctl::set_pdeathsig(signal).map_err(std::io::Error::from)
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    let _ = on_parent_death;
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Sends `signal` to every process in the group led by `pgid`.
///
/// A group that no longer exists counts as success.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) -> nix::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), signal) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

/// Installs handlers for the signals that stop a run and returns a future
/// that resolves on the first of them.
///
/// Handlers are registered before this returns, so a signal that arrives
/// before the future is first polled is still observed.
#[cfg(unix)]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    Ok(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
            _ = quit.recv() => "SIGQUIT",
        };
        tracing::info!("received {name}");
    })
}

#[cfg(not(unix))]
pub fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    })
}
