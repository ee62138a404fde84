// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Catalog of named applications backed by the configuration store.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};
use crate::store::{AppStore, ConfigStore};

/// A point-in-time snapshot of one application's configuration.
#[derive(Clone, Debug)]
pub struct Application {
    pub name: String,
    pub launch_path: Option<PathBuf>,
    pub start_params: Vec<String>,
    pub fabric: Option<String>,
    pub properties: HashMap<String, String>,
    pub pid: Option<i32>,
}

#[derive(Clone, Debug)]
pub struct ApplicationRegistry {
    store: ConfigStore,
}

impl ApplicationRegistry {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Snapshots every known application in this profile.
    pub fn list(&self) -> Result<BTreeMap<String, Application>, Error> {
        let mut apps = BTreeMap::new();

        for (name, app) in self.store.applications()? {
            apps.insert(
                name.clone(),
                Application {
                    name,
                    launch_path: app.activated()?,
                    start_params: app.start_params()?,
                    fabric: app.fabric()?,
                    properties: app.properties()?.to_map(),
                    pid: app.pid()?,
                },
            );
        }

        Ok(apps)
    }

    /// Creates the application namespace if absent; returns the existing one
    /// if present.
    pub fn create(&self, name: &str) -> Result<AppStore, Error> {
        self.store.create_application(name)
    }

    pub fn get(&self, name: &str) -> Result<AppStore, Error> {
        self.store
            .application(name)
            .ok_or_else(|| ErrorKind::UnknownApplication(name.to_string()).into())
    }

    /// Records `path` (normalized to an absolute path) and `args` as the
    /// application's launch target, creating the application on first use.
    /// Any prior activation is overwritten, not merged.
    pub fn activate(&self, name: &str, path: &Path, args: &[String]) -> Result<PathBuf, Error> {
        let app = self.create(name)?;
        let path = absolute(path)?;

        app.set_activated(&path)?;
        app.set_start_params(args)?;

        Ok(path)
    }

    /// Global properties overlaid by the application's own; the application
    /// wins on key collision.
    pub fn effective_properties(&self, name: &str) -> Result<HashMap<String, String>, Error> {
        let mut props = self.store.properties()?.to_map();
        for (key, value) in self.get(name)?.properties()?.iter() {
            props.insert(key.clone(), value.clone());
        }

        Ok(props)
    }

    /// Stores a fabric descriptor at the application scope, or the global
    /// scope when no application is named.
    pub fn weave(&self, app: Option<&str>, descriptor: &str) -> Result<(), Error> {
        match app {
            Some(name) => self.get(name)?.set_fabric(descriptor),
            None => self.store.set_fabric(descriptor),
        }
    }

    /// Clearing removes the backing record so resolution falls through to the
    /// next precedence level.
    pub fn unweave(&self, app: Option<&str>) -> Result<(), Error> {
        match app {
            Some(name) => self.get(name)?.clear_fabric(),
            None => self.store.clear_fabric(),
        }
    }
}

/// Expands to an absolute path without requiring the target to exist, the
/// way `File.expand_path` does.
fn absolute(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    fn registry(root: &Path) -> ApplicationRegistry {
        ApplicationRegistry::new(ConfigStore::open(root).expect("open failed"))
    }

    #[test]
    fn test_unknown_application() {
        let root = tempdir().expect("no tempdir");
        let registry = registry(root.path());

        let err = registry.get("ghost").expect_err("should be unknown");
        match err.kind() {
            ErrorKind::UnknownApplication(name) => assert_eq!(name, "ghost"),
            kind => panic!("unexpected error: {:?}", kind),
        }
    }

    #[test]
    fn test_activate_roundtrip() {
        let root = tempdir().expect("no tempdir");
        let registry = registry(root.path());
        let args = vec!["--port".to_string(), "8080".to_string()];

        let stored = registry
            .activate("web", Path::new("/srv/app"), &args)
            .expect("activate failed");
        assert_eq!(stored, PathBuf::from("/srv/app"));

        let app = registry.get("web").expect("no app");
        assert_eq!(app.activated().expect("no path"), Some(stored));
        assert_eq!(app.start_params().expect("no params"), args);
    }

    #[test]
    fn test_activate_normalizes_relative_paths() {
        let root = tempdir().expect("no tempdir");
        let registry = registry(root.path());

        let stored = registry
            .activate("web", Path::new("bin/app"), &[])
            .expect("activate failed");
        assert!(stored.is_absolute());
        assert!(stored.ends_with("bin/app"));
    }

    #[test]
    fn test_activate_overwrites_prior_activation() {
        let root = tempdir().expect("no tempdir");
        let registry = registry(root.path());

        registry
            .activate("web", Path::new("/srv/old"), &["one".to_string()])
            .expect("activate failed");
        registry
            .activate("web", Path::new("/srv/new"), &[])
            .expect("activate failed");

        let app = registry.get("web").expect("no app");
        assert_eq!(app.activated().expect("no path"), Some(PathBuf::from("/srv/new")));
        assert!(app.start_params().expect("no params").is_empty());
    }

    #[test]
    fn test_application_property_wins_over_global() {
        let root = tempdir().expect("no tempdir");
        let registry = registry(root.path());
        let app = registry.create("web").expect("create failed");

        let mut global = registry.store().properties().expect("no props");
        global.set("PORT", "80").expect("set failed");
        global.set("HOST", "0.0.0.0").expect("set failed");

        let mut props = app.properties().expect("no props");
        props.set("PORT", "8080").expect("set failed");

        let effective = registry.effective_properties("web").expect("merge failed");
        assert_eq!(effective.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(effective.get("HOST").map(String::as_str), Some("0.0.0.0"));
    }

    #[test]
    fn test_weave_scopes() {
        let root = tempdir().expect("no tempdir");
        let registry = registry(root.path());
        registry.create("web").expect("create failed");

        registry.weave(None, "direct").expect("weave failed");
        registry
            .weave(Some("web"), "embedded 8080")
            .expect("weave failed");

        assert_eq!(
            registry.store().fabric().expect("read failed").as_deref(),
            Some("direct")
        );
        assert_eq!(
            registry.get("web").expect("no app").fabric().expect("read failed").as_deref(),
            Some("embedded 8080")
        );

        registry.unweave(Some("web")).expect("unweave failed");
        assert_eq!(registry.get("web").expect("no app").fabric().expect("read failed"), None);
        // global override untouched
        assert!(registry.store().fabric().expect("read failed").is_some());
    }

    #[test]
    fn test_list_snapshots_configuration() {
        let root = tempdir().expect("no tempdir");
        let registry = registry(root.path());

        registry
            .activate("web", Path::new("/srv/app"), &["8080".to_string()])
            .expect("activate failed");
        registry.create("worker").expect("create failed");

        let apps = registry.list().expect("list failed");
        assert_eq!(apps.len(), 2);
        assert_eq!(
            apps["web"].launch_path,
            Some(PathBuf::from("/srv/app"))
        );
        assert_eq!(apps["worker"].launch_path, None);
        assert_eq!(apps["web"].pid, None);
    }
}
