// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Durable configuration storage.
//!
//! Everything Lacquer remembers between invocations lives under one
//! configuration root: a global property map and fabric override, plus a
//! directory per application holding its properties, activated launch path,
//! start arguments, and fabric override. Pid records sit at the root as
//! `<app>.pid` (or `<profile>.<app>.pid` under a named profile).
//!
//! A single supervisor instance is assumed; there is no file locking, and
//! concurrent external invocations against the same root are not safe.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorKind};

const PROPS_RECORD: &str = "props";
const FABRIC_RECORD: &str = "fabric";
const ACTIVATED_RECORD: &str = "activated";
const START_PARAMS_RECORD: &str = "start_params";

/// A durable string-to-string map.
///
/// The map is loaded once on open and every mutation writes back to disk
/// before returning. An empty map is represented by the absence of the
/// backing file, never by an empty file.
pub struct PropertyStore {
    path: PathBuf,
    props: HashMap<String, String>,
}

impl PropertyStore {
    pub fn open(path: PathBuf) -> Result<Self, Error> {
        let props = if path.is_file() {
            bincode::deserialize(&fs::read(&path)?)?
        } else {
            HashMap::new()
        };

        Ok(Self { path, props })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.props.insert(key.to_string(), value.to_string());
        self.save()
    }

    /// Applies a batch of `KEY=VALUE` pairs.
    ///
    /// The batch stops at the first malformed pair with `InvalidPropertyPair`.
    /// Pairs applied earlier in the same batch remain applied and persisted;
    /// this partial application is deliberate and matches the long-standing
    /// behavior of the tool.
    pub fn set_pairs(&mut self, pairs: &[String]) -> Result<(), Error> {
        for pair in pairs {
            let (key, value) = split_pair(pair)?;
            self.set(key, value)?;
        }

        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<(), Error> {
        self.props.remove(key);
        self.save()
    }

    pub fn clear(&mut self) -> Result<(), Error> {
        self.props.clear();
        self.save()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.props.iter()
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        self.props.clone()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    fn save(&self) -> Result<(), Error> {
        if self.props.is_empty() {
            remove_record(&self.path)
        } else {
            fs::write(&self.path, bincode::serialize(&self.props)?)?;
            Ok(())
        }
    }
}

fn split_pair(pair: &str) -> Result<(&str, &str), Error> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => Ok((key, value)),
        _ => Err(ErrorKind::InvalidPropertyPair(pair.to_string()).into()),
    }
}

/// Pointer-style records are plain text; presence or absence of the file is
/// the only signal, there is no "null" encoding.
fn read_record(path: &Path) -> Result<Option<String>, Error> {
    if path.is_file() {
        Ok(Some(fs::read_to_string(path)?.trim().to_string()))
    } else {
        Ok(None)
    }
}

fn write_record(path: &Path, value: &str) -> Result<(), Error> {
    fs::write(path, value)?;
    Ok(())
}

fn remove_record(path: &Path) -> Result<(), Error> {
    if path.is_file() {
        fs::remove_file(path)?;
    }

    Ok(())
}

/// One configuration root, optionally namespaced by a deployment profile.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    base: PathBuf,
    profile: Option<String>,
}

impl ConfigStore {
    pub fn open(base: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_profile(base, None)
    }

    pub fn with_profile(base: impl Into<PathBuf>, profile: Option<&str>) -> Result<Self, Error> {
        let store = Self {
            base: base.into(),
            profile: profile.map(str::to_string),
        };
        fs::create_dir_all(store.scope_dir())?;

        Ok(store)
    }

    /// Directory holding the global records and the application namespaces
    /// for this profile.
    pub fn scope_dir(&self) -> PathBuf {
        match &self.profile {
            Some(profile) => self.base.join(profile),
            None => self.base.clone(),
        }
    }

    pub fn properties(&self) -> Result<PropertyStore, Error> {
        PropertyStore::open(self.scope_dir().join(PROPS_RECORD))
    }

    pub fn fabric(&self) -> Result<Option<String>, Error> {
        read_record(&self.scope_dir().join(FABRIC_RECORD))
    }

    pub fn set_fabric(&self, descriptor: &str) -> Result<(), Error> {
        write_record(&self.scope_dir().join(FABRIC_RECORD), descriptor)
    }

    pub fn clear_fabric(&self) -> Result<(), Error> {
        remove_record(&self.scope_dir().join(FABRIC_RECORD))
    }

    /// Enumerates every application namespace under this profile.
    pub fn applications(&self) -> Result<BTreeMap<String, AppStore>, Error> {
        let mut apps = BTreeMap::new();

        for entry in fs::read_dir(self.scope_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            apps.insert(name.clone(), self.app_store(&name, entry.path()));
        }

        Ok(apps)
    }

    pub fn application(&self, name: &str) -> Option<AppStore> {
        let dir = self.scope_dir().join(name);
        if dir.is_dir() {
            Some(self.app_store(name, dir))
        } else {
            None
        }
    }

    /// Creates the application namespace if absent; idempotent.
    pub fn create_application(&self, name: &str) -> Result<AppStore, Error> {
        let dir = self.scope_dir().join(name);
        fs::create_dir_all(&dir)?;

        Ok(self.app_store(name, dir))
    }

    fn app_store(&self, name: &str, dir: PathBuf) -> AppStore {
        let pid_file = match &self.profile {
            Some(profile) => format!("{}.{}.pid", profile, name),
            None => format!("{}.pid", name),
        };

        AppStore {
            name: name.to_string(),
            dir,
            pid_path: self.base.join(pid_file),
        }
    }
}

/// The persisted records of one application namespace.
#[derive(Clone, Debug)]
pub struct AppStore {
    name: String,
    dir: PathBuf,
    pid_path: PathBuf,
}

impl AppStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> Result<PropertyStore, Error> {
        PropertyStore::open(self.dir.join(PROPS_RECORD))
    }

    pub fn activated(&self) -> Result<Option<PathBuf>, Error> {
        Ok(read_record(&self.dir.join(ACTIVATED_RECORD))?.map(PathBuf::from))
    }

    pub fn set_activated(&self, path: &Path) -> Result<(), Error> {
        write_record(&self.dir.join(ACTIVATED_RECORD), &path.to_string_lossy())
    }

    pub fn start_params(&self) -> Result<Vec<String>, Error> {
        let path = self.dir.join(START_PARAMS_RECORD);
        if path.is_file() {
            Ok(bincode::deserialize(&fs::read(&path)?)?)
        } else {
            Ok(Vec::new())
        }
    }

    /// An empty argument list removes the backing record rather than storing
    /// an empty sequence.
    pub fn set_start_params(&self, params: &[String]) -> Result<(), Error> {
        let path = self.dir.join(START_PARAMS_RECORD);
        if params.is_empty() {
            remove_record(&path)
        } else {
            fs::write(&path, bincode::serialize(&params.to_vec())?)?;
            Ok(())
        }
    }

    pub fn fabric(&self) -> Result<Option<String>, Error> {
        read_record(&self.dir.join(FABRIC_RECORD))
    }

    pub fn set_fabric(&self, descriptor: &str) -> Result<(), Error> {
        write_record(&self.dir.join(FABRIC_RECORD), descriptor)
    }

    pub fn clear_fabric(&self) -> Result<(), Error> {
        remove_record(&self.dir.join(FABRIC_RECORD))
    }

    /// The recorded pid is a best-effort liveness signal: the process may
    /// have crashed without cleanup, so presence must be confirmed with a
    /// probe. Absence is a strong "not running".
    pub fn pid(&self) -> Result<Option<i32>, Error> {
        Ok(read_record(&self.pid_path)?.and_then(|pid| pid.parse().ok()))
    }

    pub fn set_pid(&self, pid: i32) -> Result<(), Error> {
        write_record(&self.pid_path, &pid.to_string())
    }

    pub fn clear_pid(&self) -> Result<(), Error> {
        remove_record(&self.pid_path)
    }
}
