//! Command implementations behind the CLI. Each prints one line per
//! definition outcome and fails when any outcome is an error.

use std::fmt::Display;

use anyhow::{Result, bail};
use log::debug;

use crate::application::{BatchResult, Manager, MatchReport};
use crate::definition::{Definition, Strategy};
use crate::error::PkgError;
use crate::matcher::MatcherKind;
use crate::package::Package;
use crate::resolver::{GitHubDeviceAuth, ResolverRegistry};
use crate::runtime::Runtime;

pub mod config;
mod services;

pub use config::{Config, Options};
pub use services::{build_http_client, build_manager};

/// Parses every argument, applying `strategy` when given. The first invalid
/// argument fails the whole command.
pub fn parse_definitions(
    registry: &ResolverRegistry,
    args: &[String],
    strategy: Option<&Strategy>,
) -> Result<Vec<Definition>> {
    args.iter()
        .map(|arg| {
            let def = registry.parse_definition(arg)?;
            Ok(match strategy {
                Some(strategy) => def.with_strategy(strategy.clone()),
                None => def,
            })
        })
        .collect()
}

/// Prints one line per outcome. Up-to-date packages do not count as
/// failures.
fn report<T>(results: &BatchResult<T>, describe: impl Fn(&T) -> String) -> Result<()> {
    let mut failed = 0;
    for (def, result) in results {
        match result {
            Ok(value) => println!("{}: {}", def, describe(value)),
            Err(PkgError::UpToDate) => println!("{}: {}", def, PkgError::UpToDate),
            Err(e) => {
                failed += 1;
                println!("{}: error: {}", def, e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} failed", failed, results.len());
    }
    Ok(())
}

fn describe_version(verb: impl Display) -> impl Fn(&Package) -> String {
    move |pkg| format!("{} {} {}", verb, pkg.to_ref(), pkg.version)
}

pub async fn resolve<R: Runtime + 'static>(
    manager: &Manager<R>,
    args: &[String],
    strategy: Option<Strategy>,
    with_deps: bool,
) -> Result<()> {
    let defs = parse_definitions(manager.registry(), args, strategy.as_ref())?;
    let results = manager.resolve(&defs, with_deps).await;
    report(&results, |pkg| {
        format!("{} {} {}", pkg.to_ref(), pkg.version, pkg.download_url)
    })
}

pub async fn install<R: Runtime + 'static>(
    manager: &Manager<R>,
    args: &[String],
    strategy: Option<Strategy>,
    replace: bool,
    with_deps: bool,
) -> Result<()> {
    let defs = parse_definitions(manager.registry(), args, strategy.as_ref())?;
    let results = if with_deps {
        manager.install_with_deps(&defs, replace).await?
    } else {
        manager.install(&defs, replace).await?
    };
    report(&results, describe_version("installed"))
}

/// Updates the given definitions, or every installed package when none are
/// given.
pub async fn update<R: Runtime + 'static>(manager: &Manager<R>, args: &[String]) -> Result<()> {
    let defs = if args.is_empty() {
        manager.installed()?.iter().map(Definition::from_pkg).collect()
    } else {
        parse_definitions(manager.registry(), args, None)?
    };
    debug!("Updating {} packages", defs.len());
    let results = manager.update(&defs).await?;
    report(&results, describe_version("updated to"))
}

pub async fn rollback<R: Runtime + 'static>(
    manager: &Manager<R>,
    arg: &str,
    version: &str,
) -> Result<()> {
    let def = manager.registry().parse_definition(arg)?;
    let result = manager.rollback(&def, version).await;
    report(&vec![(def, result)], describe_version("rolled back to"))
}

pub async fn remove<R: Runtime + 'static>(
    manager: &Manager<R>,
    args: &[String],
    keep_folders: bool,
) -> Result<()> {
    let defs = parse_definitions(manager.registry(), args, None)?;
    let results = manager.remove(&defs, keep_folders).await?;
    report(&results, describe_version("removed"))
}

pub async fn pin<R: Runtime + 'static>(manager: &Manager<R>, args: &[String], undo: bool) -> Result<()> {
    let defs = parse_definitions(manager.registry(), args, None)?;
    let results = manager.pin(&defs, undo).await?;
    report(&results, |pkg| {
        format!("{} {} ({})", pkg.to_ref(), pkg.version, pkg.options.strategy)
    })
}

pub fn list<R: Runtime + 'static>(manager: &Manager<R>) -> Result<()> {
    let mut packages = manager.installed()?;
    if packages.is_empty() {
        println!("No add-ons installed.");
        return Ok(());
    }
    packages.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    for pkg in packages {
        println!(
            "{} {} ({}) [{}]",
            pkg.to_ref(),
            pkg.version,
            pkg.options.strategy,
            pkg.folders.join(", ")
        );
    }
    Ok(())
}

/// Lists match groups for unowned folders; with `auto`, installs the first
/// candidate of each group over its folders.
pub async fn reconcile<R: Runtime + 'static>(
    manager: &Manager<R>,
    kinds: &[MatcherKind],
    auto: bool,
) -> Result<()> {
    let leftovers = manager.get_unreconciled_folders().await?;
    if leftovers.is_empty() {
        println!("Every add-on folder is owned by an installed package.");
        return Ok(());
    }
    let kinds = if kinds.is_empty() { &MatcherKind::ALL[..] } else { kinds };
    let matches = manager.run_matcher(kinds, leftovers).await?;
    print_matches(&matches);

    if auto && !matches.groups.is_empty() {
        let results = manager.reconcile(&matches.groups).await?;
        report(&results, describe_version("installed"))?;
    }
    Ok(())
}

fn print_matches(report: &MatchReport) {
    for group in &report.groups {
        let folders: Vec<&str> = group.folders.iter().map(String::as_str).collect();
        let candidates: Vec<String> = group
            .candidates
            .iter()
            .map(|c| format!("{} {}", c.package.to_ref(), c.package.version))
            .collect();
        println!("{} -> {}", folders.join(", "), candidates.join(" | "));
    }
    for folder in &report.unreconciled {
        println!("{} -> no match", folder.name);
    }
}

/// Runs the GitHub device flow until it finishes or is interrupted.
pub async fn github_auth<R: Runtime + 'static>(manager: &Manager<R>, client_id: &str) -> Result<()> {
    let auth = GitHubDeviceAuth::new(build_http_client()?, client_id);
    let (code, task) = manager.start_github_auth(auth).await?;
    println!(
        "Open {} and enter the code {}",
        code.verification_uri, code.user_code
    );

    tokio::select! {
        outcome = task.wait() => match outcome {
            Some(Ok(())) => {
                println!("GitHub access token saved.");
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => bail!("GitHub authorisation was cancelled"),
        },
        _ = tokio::signal::ctrl_c() => {
            manager.cancel_github_auth();
            bail!("GitHub authorisation was cancelled")
        }
    }
}

pub async fn refresh_catalogue<R: Runtime + 'static>(manager: &Manager<R>) -> Result<()> {
    let catalogue = manager.refresh_catalogue().await?;
    println!("Catalogue updated with {} add-ons.", catalogue.len());
    Ok(())
}
