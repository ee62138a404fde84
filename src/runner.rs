// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Orchestration of one application launch.
//!
//! The runner merges the effective properties into the process environment,
//! resolves the effective launch strategy, swaps the launch argument vector
//! in for the duration of the launch, and drives the two-phase handshake: the
//! strategy is evaluated exactly once and must hand control back through the
//! launch context to actually execute the application.

use std::env;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, warn};

use crate::error::{Error, ErrorKind};
use crate::fabric::{self, Fabric, FabricDescriptor, FabricRegistry};
use crate::registry::ApplicationRegistry;

/// Phases of a single launch, in order. `Failed` is reachable from any of
/// them; the argument vector is restored before the runner returns either
/// way.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LaunchPhase {
    Idle,
    PropertiesResolved,
    StrategyResolved,
    StrategyEvaluating,
    ApplicationRunning,
    Failed,
}

/// The launch argument vector, visible process-wide while a launch is in
/// flight. Strategies and the executed application observe the stored
/// start arguments instead of the supervisor's own command line.
static LAUNCH_ARGS: Mutex<Option<Vec<String>>> = Mutex::new(None);

fn launch_args_slot() -> MutexGuard<'static, Option<Vec<String>>> {
    LAUNCH_ARGS.lock().unwrap_or_else(|e| e.into_inner())
}

/// The argument vector of the launch in flight, if any.
pub fn launch_args() -> Option<Vec<String>> {
    launch_args_slot().clone()
}

/// Restores the previous argument vector on drop, on every exit path.
struct ArgsGuard {
    previous: Option<Vec<String>>,
}

impl ArgsGuard {
    fn swap(args: Vec<String>) -> Self {
        Self {
            previous: launch_args_slot().replace(args),
        }
    }
}

impl Drop for ArgsGuard {
    fn drop(&mut self) {
        *launch_args_slot() = self.previous.take();
    }
}

/// Control handle threaded through a strategy evaluation.
///
/// The context is armed only while its strategy is being evaluated; the
/// handle fails with `OutsideLaunchContext` at any other time.
pub struct LaunchContext<'a> {
    name: &'a str,
    launch_path: Option<PathBuf>,
    args: Vec<String>,
    fabrics: &'a mut FabricRegistry,
    armed: bool,
    executed: bool,
}

impl<'a> LaunchContext<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Strategies may register further named strategies during evaluation.
    pub fn register_strategy(&mut self, name: impl Into<String>, strategy: Arc<dyn Fabric>) {
        self.fabrics.register(name, strategy);
    }

    /// Leaves a hook for the supervisor's termination handler to run before
    /// the daemon exits.
    pub fn on_shutdown(&self, hook: Box<dyn FnOnce() + Send>) {
        fabric::set_shutdown_hook(hook);
    }

    /// Executes the application's launch path with the stored start
    /// arguments. This is the second phase of the handshake; every strategy
    /// must call it before its evaluation returns.
    pub fn run_application(&mut self) -> Result<(), Error> {
        if !self.armed {
            return Err(ErrorKind::OutsideLaunchContext.into());
        }

        let path = self
            .launch_path
            .clone()
            .ok_or_else(|| Error::from(ErrorKind::MissingConfigTarget(self.name.to_string())))?;

        debug!("executing application {} from {}", self.name, path.display());
        self.executed = true;

        let status = Command::new(&path).args(&self.args).status()?;
        if !status.success() {
            warn!("application {} exited with {}", self.name, status);
            return Err(Error::from(format!(
                "application {} exited with {}",
                self.name, status
            )));
        }

        Ok(())
    }
}

pub struct Runner {
    registry: ApplicationRegistry,
    fabrics: FabricRegistry,
}

impl Runner {
    pub fn new(registry: ApplicationRegistry, fabrics: FabricRegistry) -> Self {
        Self { registry, fabrics }
    }

    pub fn registry(&self) -> &ApplicationRegistry {
        &self.registry
    }

    pub fn fabrics(&self) -> &FabricRegistry {
        &self.fabrics
    }

    /// Launches the named application and blocks until it exits.
    pub fn run(&mut self, name: &str) -> Result<(), Error> {
        let mut phase = LaunchPhase::Idle;

        let result = self.launch(name, &mut phase);
        if result.is_err() {
            advance(&mut phase, LaunchPhase::Failed);
        } else {
            advance(&mut phase, LaunchPhase::Idle);
        }

        result
    }

    fn launch(&mut self, name: &str, phase: &mut LaunchPhase) -> Result<(), Error> {
        debug!("preparing to execute {}", name);
        let app = self.registry.get(name)?;

        // the merged properties become the configuration surface that the
        // strategy and the application observe
        for (key, value) in self.registry.effective_properties(name)? {
            env::set_var(key, value);
        }
        advance(phase, LaunchPhase::PropertiesResolved);

        let descriptor = FabricDescriptor::resolve(
            app.fabric()?.as_deref(),
            self.registry.store().fabric()?.as_deref(),
        )?;
        let strategy = self.fabrics.resolve(&descriptor.strategy)?;
        advance(phase, LaunchPhase::StrategyResolved);

        let start_params = app.start_params()?;
        let launch_path = app.activated()?;

        let _argv = ArgsGuard::swap(start_params.clone());
        let mut ctx = LaunchContext {
            name,
            launch_path,
            args: start_params,
            fabrics: &mut self.fabrics,
            armed: true,
            executed: false,
        };

        advance(phase, LaunchPhase::StrategyEvaluating);
        let woven = strategy.weave(&mut ctx, &descriptor.args);
        ctx.armed = false;
        let executed = ctx.executed;
        drop(ctx);

        woven?;

        if !executed {
            error!(
                "strategy {} completed without executing {}; launch stalled",
                descriptor.strategy, name
            );
            return Err(Error::from(format!(
                "launch of {} stalled in strategy {}",
                name, descriptor.strategy
            )));
        }
        advance(phase, LaunchPhase::ApplicationRunning);

        Ok(())
    }
}

fn advance(phase: &mut LaunchPhase, next: LaunchPhase) {
    debug!("launch phase {:?} -> {:?}", phase, next);
    *phase = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ConfigStore;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use tempfile::tempdir;

    // LAUNCH_ARGS and the environment are process-wide; serialize the tests
    // that touch them
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn runner(root: &Path) -> Runner {
        let registry = ApplicationRegistry::new(ConfigStore::open(root).expect("open failed"));
        Runner::new(registry, FabricRegistry::new())
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write failed");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod failed");
        path
    }

    #[test]
    fn test_control_handle_outside_launch() {
        let mut fabrics = FabricRegistry::new();
        let mut ctx = LaunchContext {
            name: "web",
            launch_path: Some(PathBuf::from("/srv/app")),
            args: Vec::new(),
            fabrics: &mut fabrics,
            armed: false,
            executed: false,
        };

        let err = ctx.run_application().expect_err("should fail disarmed");
        match err.kind() {
            ErrorKind::OutsideLaunchContext => (),
            kind => panic!("unexpected error: {:?}", kind),
        }
    }

    #[test]
    fn test_default_strategy_executes_launch_path() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = tempdir().expect("no tempdir");
        let runner_root = tempdir().expect("no tempdir");
        let mut runner = runner(runner_root.path());

        let out = root.path().join("out");
        let script = write_script(
            root.path(),
            "app.sh",
            "printf '%s' \"$LACQUER_TEST_PORT\" > \"$1\"",
        );

        runner
            .registry()
            .activate("web", &script, &[out.to_string_lossy().into_owned()])
            .expect("activate failed");
        let app = runner.registry().get("web").expect("no app");
        app.properties()
            .expect("no props")
            .set("LACQUER_TEST_PORT", "8080")
            .expect("set failed");

        runner.run("web").expect("run failed");

        // the merged properties were visible to the application, and the
        // stored start arguments were its argument vector
        assert_eq!(fs::read_to_string(&out).expect("no output"), "8080");
        // the launch argument vector was restored afterward
        assert_eq!(launch_args(), None);
    }

    #[test]
    fn test_run_without_activation_is_missing_target() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = tempdir().expect("no tempdir");
        let mut runner = runner(root.path());
        runner.registry().create("bare").expect("create failed");

        let err = runner.run("bare").expect_err("should fail");
        match err.kind() {
            ErrorKind::MissingConfigTarget(name) => assert_eq!(name, "bare"),
            kind => panic!("unexpected error: {:?}", kind),
        }
        assert_eq!(launch_args(), None);
    }

    #[test]
    fn test_stalled_strategy_is_an_error() {
        struct StallingFabric;
        impl Fabric for StallingFabric {
            fn weave(&self, _ctx: &mut LaunchContext<'_>, _args: &[String]) -> Result<(), Error> {
                // never invokes the control handle
                Ok(())
            }
        }

        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = tempdir().expect("no tempdir");
        let mut runner = runner(root.path());
        runner.fabrics.register("stalling", Arc::new(StallingFabric));

        let script = write_script(root.path(), "app.sh", "exit 0");
        runner
            .registry()
            .activate("web", &script, &[])
            .expect("activate failed");
        runner.registry().weave(Some("web"), "stalling").expect("weave failed");

        let err = runner.run("web").expect_err("stalled launch should fail");
        assert!(err.to_string().contains("stalled"));
        assert_eq!(launch_args(), None);
    }

    #[test]
    fn test_strategy_may_register_strategies_and_execute() {
        struct WrappingFabric;
        impl Fabric for WrappingFabric {
            fn weave(&self, ctx: &mut LaunchContext<'_>, args: &[String]) -> Result<(), Error> {
                assert_eq!(args, &["extra-arg".to_string()]);
                ctx.register_strategy("registered-later", Arc::new(WrappingFabric));
                ctx.run_application()
            }
        }

        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = tempdir().expect("no tempdir");
        let mut runner = runner(root.path());
        runner.fabrics.register("wrapping", Arc::new(WrappingFabric));

        let script = write_script(root.path(), "app.sh", "exit 0");
        runner
            .registry()
            .activate("web", &script, &[])
            .expect("activate failed");
        runner
            .registry()
            .weave(None, "wrapping extra-arg")
            .expect("weave failed");

        runner.run("web").expect("run failed");
        assert!(runner.fabrics().resolve("registered-later").is_ok());
    }

    #[test]
    fn test_failing_application_surfaces_exit_status() {
        let _serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let root = tempdir().expect("no tempdir");
        let mut runner = runner(root.path());

        let script = write_script(root.path(), "app.sh", "exit 3");
        runner
            .registry()
            .activate("web", &script, &[])
            .expect("activate failed");

        let err = runner.run("web").expect_err("should fail");
        assert!(err.to_string().contains("exited"));
        assert_eq!(launch_args(), None);
    }
}
