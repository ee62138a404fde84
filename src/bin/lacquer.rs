// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::env;
use std::path::{Path, PathBuf};
use std::process;

use clap::{App, Arg, ArgMatches, SubCommand};

use lacquer::fabric::{FabricDescriptor, FabricRegistry};
use lacquer::logging;
use lacquer::registry::ApplicationRegistry;
use lacquer::store::{ConfigStore, PropertyStore};
use lacquer::supervisor::Supervisor;
use lacquer::Error;

trait SetupClapApp {
    fn setup_clap_app(self) -> Self;
    fn app_scope_opt(self) -> Self;
}

impl<'a, 'b> SetupClapApp for App<'a, 'b> {
    fn setup_clap_app(self) -> Self {
        self.version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
    }

    fn app_scope_opt(self) -> Self {
        self.arg(
            Arg::with_name("application")
                .short("a")
                .long("application")
                .value_name("NAME")
                .help("scope the command to the named application instead of the global profile")
                .takes_value(true),
        )
    }
}

fn main() -> Result<(), Error> {
    let args = App::new(env!("CARGO_PKG_NAME"))
        .setup_clap_app()
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("path")
                .short("p")
                .long("path")
                .value_name("DIR")
                .help("base path for this configuration root, defaults to ~/.lacquer")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("profile")
                .long("profile")
                .value_name("NAME")
                .help("deployment profile to operate on")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .help("enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("start")
                .setup_clap_app()
                .about("start the named applications as daemons, or all of them")
                .arg(Arg::with_name("apps").value_name("NAME").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("stop")
                .setup_clap_app()
                .about("stop the named applications, or all running ones")
                .arg(Arg::with_name("apps").value_name("NAME").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("restart")
                .setup_clap_app()
                .about("stop then start the named applications, or all of them")
                .arg(Arg::with_name("apps").value_name("NAME").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("activate")
                .setup_clap_app()
                .about("record an application's launch path and start arguments")
                .arg(Arg::with_name("name").value_name("NAME").required(true))
                .arg(Arg::with_name("path").value_name("PATH").required(true))
                .arg(Arg::with_name("args").value_name("ARG").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("run")
                .setup_clap_app()
                .about("run applications (or paths, activated ad hoc) in the foreground")
                .arg(
                    Arg::with_name("targets")
                        .value_name("NAME|PATH")
                        .multiple(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("set")
                .setup_clap_app()
                .app_scope_opt()
                .about("store KEY=VALUE properties in the selected scope")
                .arg(
                    Arg::with_name("pairs")
                        .value_name("KEY=VALUE")
                        .multiple(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("unset")
                .setup_clap_app()
                .app_scope_opt()
                .about("remove stored properties from the selected scope")
                .arg(
                    Arg::with_name("keys")
                        .value_name("KEY")
                        .multiple(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("clear")
                .setup_clap_app()
                .app_scope_opt()
                .about("remove every stored property in the selected scope"),
        )
        .subcommand(
            SubCommand::with_name("weave")
                .setup_clap_app()
                .app_scope_opt()
                .about("store a launch-strategy descriptor for the selected scope")
                .arg(
                    Arg::with_name("descriptor")
                        .value_name("STRATEGY [ARG...]")
                        .multiple(true)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("unweave")
                .setup_clap_app()
                .app_scope_opt()
                .about("remove the launch-strategy descriptor of the selected scope"),
        )
        .get_matches_from(extract_env_assignments());

    logging::init(args.is_present("debug"))?;

    let store = ConfigStore::with_profile(config_root(&args)?, args.value_of("profile"))?;
    let registry = ApplicationRegistry::new(store);
    let supervisor = Supervisor::new(registry.clone(), FabricRegistry::new());

    match args.subcommand() {
        ("start", Some(sub)) => {
            let names = multi_values(sub, "apps");
            if names.is_empty() {
                supervisor.start_all()
            } else {
                for name in &names {
                    supervisor.start(name)?;
                }
                Ok(())
            }
        }
        ("stop", Some(sub)) => {
            let names = multi_values(sub, "apps");
            if names.is_empty() {
                supervisor.stop_all()
            } else {
                supervisor.stop(&names)
            }
        }
        ("restart", Some(sub)) => {
            let names = multi_values(sub, "apps");
            if names.is_empty() {
                supervisor.stop_all()?;
                supervisor.start_all()
            } else {
                supervisor.restart(&names)
            }
        }
        ("activate", Some(sub)) => {
            let name = sub.value_of("name").expect("name is required");
            let path = sub.value_of("path").expect("path is required");
            let stored = registry.activate(name, Path::new(path), &multi_values(sub, "args"))?;
            println!("activated {} as {}", stored.display(), name);
            Ok(())
        }
        ("run", Some(sub)) => {
            let targets = multi_values(sub, "targets");
            let names = resolve_run_targets(&registry, &targets)?;
            supervisor.run(&names)
        }
        ("set", Some(sub)) => {
            // setting properties creates the application on first use
            let mut props = match sub.value_of("application") {
                Some(name) => registry.create(name)?.properties()?,
                None => registry.store().properties()?,
            };
            props.set_pairs(&multi_values(sub, "pairs"))
        }
        ("unset", Some(sub)) => {
            let mut props = scoped_properties(&registry, sub)?;
            for key in &multi_values(sub, "keys") {
                props.remove(key)?;
            }
            Ok(())
        }
        ("clear", Some(sub)) => scoped_properties(&registry, sub)?.clear(),
        ("weave", Some(sub)) => {
            let descriptor = multi_values(sub, "descriptor").join(" ");
            // validate the descriptor shape before persisting it
            descriptor.parse::<FabricDescriptor>()?;
            registry.weave(sub.value_of("application"), &descriptor)
        }
        ("unweave", Some(sub)) => registry.unweave(sub.value_of("application")),
        ("", None) => {
            println!("command required");
            println!("{}", args.usage());
            process::exit(1);
        }
        (arg, _) => {
            println!("unexpected argument: {}", arg);
            println!("{}", args.usage());
            process::exit(2);
        }
    }
}

/// Arguments of the form `KEY=value` appearing before the command are
/// exported into the environment and removed from the argument list.
fn extract_env_assignments() -> Vec<String> {
    let mut argv = Vec::new();
    let mut command_seen = false;

    for (i, arg) in env::args().enumerate() {
        if i > 0 && !command_seen {
            if let Some((key, value)) = parse_assignment(&arg) {
                env::set_var(key, value);
                continue;
            }
            if !arg.starts_with('-') {
                command_seen = true;
            }
        }
        argv.push(arg);
    }

    argv
}

fn parse_assignment(arg: &str) -> Option<(&str, &str)> {
    let (key, value) = arg.split_once('=')?;
    if !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some((key, value))
    } else {
        None
    }
}

fn config_root(args: &ArgMatches<'_>) -> Result<PathBuf, Error> {
    if let Some(path) = args.value_of("path") {
        return Ok(PathBuf::from(path));
    }

    let home = env::var_os("HOME")
        .ok_or_else(|| Error::from("HOME is not set; use --path to choose a configuration root"))?;
    Ok(PathBuf::from(home).join(".lacquer"))
}

fn multi_values(args: &ArgMatches<'_>, name: &str) -> Vec<String> {
    args.values_of(name)
        .map(|values| values.map(str::to_string).collect())
        .unwrap_or_default()
}

fn scoped_properties(
    registry: &ApplicationRegistry,
    args: &ArgMatches<'_>,
) -> Result<PropertyStore, Error> {
    match args.value_of("application") {
        Some(name) => registry.get(name)?.properties(),
        None => registry.store().properties(),
    }
}

/// A run target is an application name when one exists, otherwise a path
/// that is activated ad hoc under its file stem.
fn resolve_run_targets(
    registry: &ApplicationRegistry,
    targets: &[String],
) -> Result<Vec<String>, Error> {
    let mut names = Vec::with_capacity(targets.len());

    for target in targets {
        if registry.store().application(target).is_some() {
            names.push(target.clone());
        } else {
            let path = Path::new(target);
            let name = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .ok_or_else(|| {
                    Error::from(format!("cannot derive an application name from {}", target))
                })?
                .to_string();
            registry.activate(&name, path, &[])?;
            names.push(name);
        }
    }

    Ok(names)
}
