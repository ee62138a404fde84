// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process supervision: daemonization, pid bookkeeping, and signal-based
//! termination with a bounded retry budget.
//!
//! The supervisor is single-threaded control logic issuing fork/signal/wait
//! syscalls. A started application is detached with setsid plus a double
//! fork, so the daemon is reparented to init with no controlling terminal
//! and no zombie left behind; the foreground mode forks once per application
//! and blocks until the children exit.

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process;
use std::thread::sleep;
use std::time::Duration;

use libc::c_int;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{wait, waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpgid, getpid, setpgid, setsid, dup2, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind};
use crate::fabric::{self, FabricRegistry};
use crate::registry::ApplicationRegistry;
use crate::runner::Runner;
use crate::store::AppStore;

/// Termination rounds: each re-signals the pids still alive.
pub const TERM_ROUNDS: usize = 5;
/// Liveness polls per round.
pub const POLLS_PER_ROUND: usize = 20;
/// Fixed interval between polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Result of a `start` request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StartOutcome {
    Launched,
    /// A pid record existed and its process probed alive; not an error.
    AlreadyRunning,
}

pub struct Supervisor {
    registry: ApplicationRegistry,
    fabrics: FabricRegistry,
}

impl Supervisor {
    pub fn new(registry: ApplicationRegistry, fabrics: FabricRegistry) -> Self {
        Self { registry, fabrics }
    }

    pub fn registry(&self) -> &ApplicationRegistry {
        &self.registry
    }

    /// Starts every known application; applications that cannot start are
    /// reported and skipped.
    pub fn start_all(&self) -> Result<(), Error> {
        let apps = self.registry.list()?;
        if apps.is_empty() {
            warn!("no applications activated yet, nothing to do");
            return Ok(());
        }

        for name in apps.keys() {
            if let Err(e) = self.start(name) {
                warn!("failed to start {}: {}", name, e);
            }
        }

        Ok(())
    }

    /// Daemonizes the named application.
    ///
    /// The grandchild records its own pid, opens a permissive umask,
    /// redirects stdin to the null device and stdout/stderr to a log file
    /// next to the launch path, installs the termination handler, and hands
    /// control to the runner.
    pub fn start(&self, name: &str) -> Result<StartOutcome, Error> {
        let app = self.registry.get(name)?;
        let launch_path = app
            .activated()?
            .ok_or_else(|| Error::from(ErrorKind::MissingConfigTarget(name.to_string())))?;

        if let Some(pid) = app.pid()? {
            if alive(Pid::from_raw(pid)) {
                info!("{} is already running as pid {}", name, pid);
                return Ok(StartOutcome::AlreadyRunning);
            }
            // stale record from a crash; the new daemon will overwrite it
            debug!("{} has a stale pid record for {}", name, pid);
        }

        match fork()? {
            ForkResult::Parent { child } => {
                // reap the intermediate child; the daemon itself is
                // reparented to init
                let _ = waitpid(child, None);
                Ok(StartOutcome::Launched)
            }
            ForkResult::Child => {
                // new session severs the controlling terminal; the second
                // fork makes sure the daemon can never reacquire one
                let _ = setsid();
                match fork() {
                    Ok(ForkResult::Parent { .. }) => unsafe { libc::_exit(0) },
                    Ok(ForkResult::Child) => self.daemon_main(name, &launch_path),
                    Err(_) => unsafe { libc::_exit(1) },
                }
            }
        }
    }

    fn daemon_main(&self, name: &str, launch_path: &Path) -> ! {
        let code = match self.supervise(name, launch_path) {
            Ok(()) => 0,
            Err(e) => {
                warn!("supervised {} failed: {}", name, e);
                1
            }
        };

        process::exit(code)
    }

    fn supervise(&self, name: &str, launch_path: &Path) -> Result<(), Error> {
        // lead our own process group: the application runs as a child of
        // this process, and termination signals the group so both die
        // together
        let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));

        let app = self.registry.get(name)?;
        app.set_pid(getpid().as_raw())?;
        let _pid_record = PidRecordGuard { app: app.clone() };

        umask(Mode::empty());
        redirect_stdio(name, launch_path)?;
        install_term_handler(daemon_term_handler)?;

        let mut runner = Runner::new(self.registry.clone(), self.fabrics.clone());
        runner.run(name)
    }

    /// Removes the pid records, then terminates the recorded pids.
    ///
    /// Every record is removed strictly before the first signal is sent, so
    /// a concurrent or repeated stop can never re-signal a pid that has
    /// since been reused by an unrelated process. Signaling a pid that is
    /// already gone is swallowed, not surfaced.
    pub fn stop(&self, names: &[String]) -> Result<(), Error> {
        let mut targets = Vec::with_capacity(names.len());
        for name in names {
            let app = self.registry.get(name)?;
            let pid = app
                .pid()?
                .ok_or_else(|| Error::from(ErrorKind::NotRunning(name.clone())))?;
            targets.push((app, pid));
        }

        let mut pids = Vec::with_capacity(targets.len());
        for (app, pid) in targets {
            app.clear_pid()?;
            pids.push(Pid::from_raw(pid));
        }

        terminate_with_retry(&pids);
        Ok(())
    }

    /// Stops every application with a pid record.
    pub fn stop_all(&self) -> Result<(), Error> {
        let mut names = Vec::new();
        for (name, app) in self.registry.list()? {
            if app.pid.is_some() {
                names.push(name);
            }
        }

        if names.is_empty() {
            warn!("no applications running, nothing to do");
            return Ok(());
        }

        self.stop(&names)
    }

    pub fn restart(&self, names: &[String]) -> Result<(), Error> {
        self.stop(names)?;
        for name in names {
            self.start(name)?;
        }

        Ok(())
    }

    /// Runs the named applications in the foreground, blocking until they
    /// all exit. Children still alive when this process exits are terminated
    /// by the kill guard; children that exited normally are dropped from the
    /// guard set so they are never re-signaled.
    pub fn run(&self, names: &[String]) -> Result<(), Error> {
        let mut guard = KillGuard::default();

        for name in names {
            match fork()? {
                ForkResult::Parent { child } => guard.watch(child),
                ForkResult::Child => {
                    let code = match self.run_foreground_child(name) {
                        Ok(()) => 0,
                        Err(e) => {
                            warn!("{} failed: {}", name, e);
                            1
                        }
                    };
                    process::exit(code);
                }
            }
        }

        loop {
            match wait() {
                Ok(WaitStatus::Exited(pid, _)) => guard.forget(pid),
                Ok(_) => (),
                // ECHILD: every child is reaped
                Err(_) => break,
            }
        }

        Ok(())
    }

    fn run_foreground_child(&self, name: &str) -> Result<(), Error> {
        // group leadership before the handler is installed, so forwarding
        // to the group can never reach the invoking process
        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
        install_term_handler(foreground_term_handler)?;
        let mut runner = Runner::new(self.registry.clone(), self.fabrics.clone());
        runner.run(name)
    }
}

/// Releases the pid record when the supervised process ends normally.
struct PidRecordGuard {
    app: AppStore,
}

impl Drop for PidRecordGuard {
    fn drop(&mut self) {
        let _ = self.app.clear_pid();
    }
}

/// Foreground pids to terminate when the invoking process exits.
#[derive(Default)]
struct KillGuard {
    pids: Vec<Pid>,
}

impl KillGuard {
    fn watch(&mut self, pid: Pid) {
        self.pids.push(pid);
    }

    fn forget(&mut self, pid: Pid) {
        self.pids.retain(|p| *p != pid);
    }
}

impl Drop for KillGuard {
    fn drop(&mut self) {
        if !self.pids.is_empty() {
            terminate_with_retry(&self.pids);
        }
    }
}

/// Liveness probe. A pid with a process group still exists.
pub fn alive(pid: Pid) -> bool {
    getpgid(Some(pid)).is_ok()
}

/// Bounded termination: up to [`TERM_ROUNDS`] rounds of signaling every pid
/// still believed alive, each followed by up to [`POLLS_PER_ROUND`] liveness
/// polls at [`POLL_INTERVAL`]. Pids that outlive the whole budget are
/// returned and reported as a non-fatal warning.
pub fn terminate_with_retry(pids: &[Pid]) -> Vec<Pid> {
    let mut remaining: Vec<Pid> = pids.to_vec();

    for _round in 0..TERM_ROUNDS {
        let mut waiting = Vec::with_capacity(remaining.len());
        for pid in &remaining {
            if signal_term(*pid).is_ok() {
                waiting.push(*pid);
            } else {
                debug!("failed to signal {}, already gone", pid);
            }
        }

        for _poll in 0..POLLS_PER_ROUND {
            waiting.retain(|pid| {
                // reap first in case the pid is our own child, so the probe
                // sees it dead instead of as a zombie
                let _ = waitpid(*pid, Some(WaitPidFlag::WNOHANG));
                alive(*pid)
            });

            if waiting.is_empty() {
                break;
            }
            sleep(POLL_INTERVAL);
        }

        if waiting.is_empty() {
            return Vec::new();
        }
        remaining = waiting;
    }

    let timed_out: Vec<i32> = remaining.iter().map(|pid| pid.as_raw()).collect();
    warn!("{}", Error::from(ErrorKind::TerminationTimeout(timed_out)));

    remaining
}

/// Sends SIGTERM to the pid's own process group when it leads one, so the
/// application running underneath a supervised process is signaled with it;
/// falls back to the bare pid otherwise.
fn signal_term(pid: Pid) -> nix::Result<()> {
    kill(Pid::from_raw(-pid.as_raw()), Signal::SIGTERM)
        .or_else(|_| kill(pid, Signal::SIGTERM))
}

fn install_term_handler(handler: extern "C" fn(c_int)) -> Result<(), Error> {
    let action = SigAction::new(SigHandler::Handler(handler), SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGTERM, &action) }?;

    Ok(())
}

extern "C" fn daemon_term_handler(_: c_int) {
    // run the strategy's shutdown hook, then leave without unwinding
    if let Some(hook) = fabric::take_shutdown_hook() {
        hook();
    }
    forward_term_to_group();
    unsafe { libc::_exit(0) }
}

extern "C" fn foreground_term_handler(_: c_int) {
    forward_term_to_group();
    unsafe { libc::_exit(0) }
}

/// The supervised process leads its own group with the application below
/// it; pass the termination on so the application dies too. SIGTERM is
/// blocked while its handler runs, so signaling our own group cannot
/// re-enter the handler before `_exit`.
fn forward_term_to_group() {
    let _ = kill(Pid::from_raw(0), Signal::SIGTERM);
}

/// Stdin from the null device, stdout/stderr appended to
/// `<dirname(launch_path)>/log/<name>.log`.
fn redirect_stdio(name: &str, launch_path: &Path) -> Result<(), Error> {
    let log_dir = launch_path.parent().unwrap_or_else(|| Path::new("/")).join("log");
    fs::create_dir_all(&log_dir)?;

    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(format!("{}.log", name)))?;
    let devnull = File::open("/dev/null")?;

    dup2(devnull.as_raw_fd(), libc::STDIN_FILENO)?;
    dup2(log.as_raw_fd(), libc::STDOUT_FILENO)?;
    dup2(log.as_raw_fd(), libc::STDERR_FILENO)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::process::Command;
    use std::time::Instant;

    #[test]
    fn test_alive_probes_this_process() {
        assert!(alive(getpid()));
        // largest valid pid is far below this on any Linux default
        assert!(!alive(Pid::from_raw(i32::max_value())));
    }

    #[test]
    fn test_terminate_dead_pid_returns_without_polling() {
        let mut child = Command::new("true").spawn().expect("spawn failed");
        let pid = Pid::from_raw(child.id() as i32);
        child.wait().expect("wait failed");

        let started = Instant::now();
        let survivors = terminate_with_retry(&[pid]);

        assert!(survivors.is_empty());
        // already dead: at most one poll, nothing near the retry budget
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_terminate_kills_running_child() {
        let child = Command::new("sleep").arg("30").spawn().expect("spawn failed");
        let pid = Pid::from_raw(child.id() as i32);
        assert!(alive(pid));

        let started = Instant::now();
        let survivors = terminate_with_retry(&[pid]);

        assert!(survivors.is_empty());
        assert!(!alive(pid));
        assert!(started.elapsed() < Duration::from_secs(15));
        // the child was reaped inside the poll loop; don't wait() it again
        std::mem::forget(child);
    }

    #[test]
    fn test_kill_guard_forgets_reaped_pids() {
        let mut guard = KillGuard::default();
        guard.watch(Pid::from_raw(100));
        guard.watch(Pid::from_raw(200));
        guard.forget(Pid::from_raw(100));

        assert_eq!(guard.pids, vec![Pid::from_raw(200)]);
        // empty the guard so drop has nothing to signal
        guard.forget(Pid::from_raw(200));
    }
}
