// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Named, pluggable launch strategies ("fabrics").
//!
//! A fabric prepares the run environment for an application and ultimately
//! hands control to its entry point through the launch context. Strategies are
//! registered ahead of time under a name; the persisted fabric override is a
//! declarative descriptor: strategy name plus whitespace-separated arguments,
//! resolved through this registry, never executed as code.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{Error, ErrorKind};
use crate::runner::LaunchContext;

/// Name of the built-in strategy: execute the launch path directly.
pub const DEFAULT_STRATEGY: &str = "direct";

/// A parsed strategy source: which strategy handles the launch, and with
/// which arguments.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FabricDescriptor {
    pub strategy: String,
    pub args: Vec<String>,
}

impl FabricDescriptor {
    pub fn direct() -> Self {
        Self {
            strategy: DEFAULT_STRATEGY.to_string(),
            args: Vec::new(),
        }
    }

    /// Selects the effective strategy source: the application override wins
    /// over the global override, and the built-in default is the fallback.
    /// Exactly one source is ever selected.
    pub fn resolve(
        app_override: Option<&str>,
        global_override: Option<&str>,
    ) -> Result<Self, Error> {
        match app_override.or(global_override) {
            Some(descriptor) => descriptor.parse(),
            None => Ok(Self::direct()),
        }
    }
}

impl FromStr for FabricDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let mut tokens = s.split_whitespace();
        let strategy = tokens
            .next()
            .ok_or_else(|| Error::from(ErrorKind::ErrorStr("empty fabric descriptor")))?
            .to_string();

        Ok(Self {
            strategy,
            args: tokens.map(str::to_string).collect(),
        })
    }
}

/// A launch strategy.
///
/// `weave` is evaluated exactly once per launch and must invoke
/// [`LaunchContext::run_application`] before returning; a launch whose
/// strategy never does so is considered stalled.
pub trait Fabric: Send + Sync {
    fn weave(&self, ctx: &mut LaunchContext<'_>, args: &[String]) -> Result<(), Error>;

    /// Invoked from the supervisor's termination handler before the daemon
    /// exits. The default does nothing.
    fn shutdown(&self) {}
}

/// Directly executes the application's launch path with no extra setup.
struct DirectFabric;

impl Fabric for DirectFabric {
    fn weave(&self, ctx: &mut LaunchContext<'_>, _args: &[String]) -> Result<(), Error> {
        ctx.run_application()
    }
}

/// Lookup table of named strategies.
#[derive(Clone)]
pub struct FabricRegistry {
    strategies: HashMap<String, Arc<dyn Fabric>>,
}

impl FabricRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(DEFAULT_STRATEGY, Arc::new(DirectFabric));

        registry
    }

    pub fn register(&mut self, name: impl Into<String>, fabric: Arc<dyn Fabric>) {
        self.strategies.insert(name.into(), fabric);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Fabric>, Error> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| Error::from(format!("unknown launch strategy: {}", name)))
    }
}

impl Default for FabricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shutdown hook for the currently supervised process.
///
/// A strategy may leave one hook behind during evaluation; the supervisor's
/// termination handler takes it, runs it, and exits. At most one hook exists
/// per process lifetime.
static SHUTDOWN_HOOK: Mutex<Option<Box<dyn FnOnce() + Send>>> = Mutex::new(None);

pub fn set_shutdown_hook(hook: Box<dyn FnOnce() + Send>) {
    let mut slot = SHUTDOWN_HOOK.lock().unwrap_or_else(|e| e.into_inner());
    *slot = Some(hook);
}

/// Called from the signal handler: try_lock so a termination signal landing
/// mid-registration cannot deadlock the handler.
pub(crate) fn take_shutdown_hook() -> Option<Box<dyn FnOnce() + Send>> {
    SHUTDOWN_HOOK.try_lock().ok().and_then(|mut slot| slot.take())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_parses_name_and_args() {
        let descriptor: FabricDescriptor = "embedded 8080 /srv".parse().expect("parse failed");
        assert_eq!(descriptor.strategy, "embedded");
        assert_eq!(descriptor.args, vec!["8080".to_string(), "/srv".to_string()]);
    }

    #[test]
    fn test_empty_descriptor_is_rejected() {
        assert!("   ".parse::<FabricDescriptor>().is_err());
    }

    #[test]
    fn test_resolution_precedence() {
        // application override wins regardless of the global value
        let descriptor =
            FabricDescriptor::resolve(Some("app-fabric"), Some("global-fabric")).expect("resolve");
        assert_eq!(descriptor.strategy, "app-fabric");

        let descriptor = FabricDescriptor::resolve(None, Some("global-fabric")).expect("resolve");
        assert_eq!(descriptor.strategy, "global-fabric");

        // nothing configured anywhere: built-in default
        let descriptor = FabricDescriptor::resolve(None, None).expect("resolve");
        assert_eq!(descriptor, FabricDescriptor::direct());
    }

    #[test]
    fn test_registry_resolves_default_strategy() {
        let registry = FabricRegistry::new();
        assert!(registry.resolve(DEFAULT_STRATEGY).is_ok());
        assert!(registry.resolve("no-such-strategy").is_err());
    }
}
