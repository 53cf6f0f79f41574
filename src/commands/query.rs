//! Read-only queries against WSL: `list`, `exists`, `slurp`.

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use serde::Serialize;
use std::io::{self, Write};
use wslkit::exec::ProcessExecutor;
use wslkit::{CommandExecutor, StateInspector, TargetEnvironment};

use crate::Context;
use crate::ui;

pub fn list(ctx: &Context) -> Result<()> {
    list_with(ctx, &ProcessExecutor::new())
}

pub fn exists(ctx: &Context, distribution: &str, path: &str) -> Result<()> {
    if !exists_with(ctx, &ProcessExecutor::new(), distribution, path)? {
        std::process::exit(1);
    }
    Ok(())
}

pub fn slurp(ctx: &Context, distribution: &str, path: &str, raw: bool) -> Result<()> {
    slurp_with(ctx, &ProcessExecutor::new(), distribution, path, raw)
}

fn list_with(ctx: &Context, executor: &dyn CommandExecutor) -> Result<()> {
    let inspector = StateInspector::new(executor);
    let distributions = inspector
        .distributions()
        .context("Failed to list WSL distributions")?;

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&distributions)?);
        return Ok(());
    }

    if distributions.is_empty() {
        ui::info("No distributions registered");
        return Ok(());
    }

    ui::header("WSL distributions");
    for dist in &distributions {
        let marker = if dist.default { "*".cyan() } else { " ".normal() };
        let state = if dist.is_running() {
            dist.state.green()
        } else {
            dist.state.dimmed()
        };
        let version = dist
            .version
            .map(|v| format!("WSL{v}"))
            .unwrap_or_else(|| "-".to_string());
        println!("{} {:<24} {:<12} {}", marker, dist.name.bold(), state, version.dimmed());
    }
    Ok(())
}

#[derive(Serialize)]
struct ExistsReport<'a> {
    distribution: &'a str,
    path: &'a str,
    exists: bool,
}

fn exists_with(
    ctx: &Context,
    executor: &dyn CommandExecutor,
    distribution: &str,
    path: &str,
) -> Result<bool> {
    TargetEnvironment::distribution(distribution)?;
    let exists = StateInspector::new(executor)
        .path_exists(distribution, path)
        .with_context(|| format!("Could not check {path} in {distribution}"))?;

    if ctx.json {
        let report = ExistsReport {
            distribution,
            path,
            exists,
        };
        println!("{}", serde_json::to_string(&report)?);
    } else if !ctx.quiet {
        if exists {
            ui::success(&format!("{path} exists in {distribution}"));
        } else {
            ui::warn(&format!("{path} does not exist in {distribution}"));
        }
    }
    Ok(exists)
}

fn slurp_with(
    ctx: &Context,
    executor: &dyn CommandExecutor,
    distribution: &str,
    path: &str,
    raw: bool,
) -> Result<()> {
    TargetEnvironment::distribution(distribution)?;
    let slurped = StateInspector::new(executor)
        .slurp(distribution, path)
        .with_context(|| format!("Could not read {path} from {distribution}"))?;

    if raw {
        let bytes = slurped.decode()?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&bytes)?;
        stdout.flush()?;
        return Ok(());
    }

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&slurped)?);
        return Ok(());
    }

    ui::section(&slurped.path);
    ui::kv("Distribution", distribution);
    if let Some(owner) = &slurped.owner {
        let group = slurped.group.as_deref().unwrap_or("?");
        ui::kv("Owner", &format!("{owner}:{group}"));
    }
    if let Some(mode) = &slurped.mode {
        ui::kv("Mode", mode);
    }
    ui::kv("Size", &ui::format_size(slurped.size));
    ui::kv("Encoding", slurped.encoding);
    if ctx.verbose > 0 {
        ui::kv("Content", &slurped.content);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wslkit::exec::FakeHost;

    fn ctx(json: bool) -> Context {
        Context {
            verbose: 0,
            quiet: true,
            json,
        }
    }

    fn host() -> FakeHost {
        FakeHost::new()
            .with_distribution("Ubuntu", 2, true)
            .with_file("Ubuntu", "/etc/hostname", "devbox\n")
    }

    #[test]
    fn test_exists_reports_presence() {
        let host = host();
        assert!(exists_with(&ctx(false), &host, "Ubuntu", "/etc/hostname").unwrap());
        assert!(!exists_with(&ctx(true), &host, "Ubuntu", "/etc/missing").unwrap());
    }

    #[test]
    fn test_exists_rejects_empty_distribution() {
        assert!(exists_with(&ctx(false), &host(), "", "/etc/hostname").is_err());
    }

    #[test]
    fn test_slurp_missing_file_fails() {
        let err = slurp_with(&ctx(false), &host(), "Ubuntu", "/etc/missing", false).unwrap_err();
        assert!(format!("{err:#}").contains("/etc/missing"));
    }

    #[test]
    fn test_list_without_distributions() {
        assert!(list_with(&ctx(false), &FakeHost::new()).is_ok());
    }
}
