// src/lib.rs

pub mod action;
pub mod cli;
pub mod config;
pub mod dashboard;
pub mod driver;
pub mod errors;
pub mod event;
pub mod exec;
pub mod fs;
pub mod logging;
pub mod plugin;
pub mod promise;
pub mod tags;

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cli::{CliArgs, DashboardKind};
use crate::dashboard::{Dashboard, TextDashboard};
use crate::driver::{Driver, DriverOptions};
use crate::event::EventManager;
use crate::plugin::ExecRuleFactory;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the event manager
/// - the driver (tag index, factories, action records)
/// - the dashboard
/// - Ctrl-C handling
///
/// Returns the process exit code: 0 iff every action succeeded.
///
/// Must run inside a tokio current-thread runtime with a `LocalSet`.
pub async fn run(args: CliArgs) -> Result<i32> {
    let source_root = PathBuf::from(&args.root);
    let config_path = source_root.join(&args.config);
    let config = config::load_or_default(&config_path)?;

    let options = DriverOptions {
        jobs: args
            .jobs
            .or(config.options.jobs)
            .unwrap_or_else(|| DriverOptions::default().jobs),
        watch: args.watch || config.options.watch.unwrap_or(false),
    };
    let output_dir = args
        .output
        .clone()
        .or_else(|| config.options.output_dir.clone())
        .unwrap_or_else(|| "probuild-out".to_string());
    let output_root = source_root.join(output_dir);
    let excludes = config::build_exclude_set(&config)?;

    if args.dry_run {
        print_dry_run(&args, &options, &output_root);
        return Ok(0);
    }

    let em = EventManager::new();
    let dashboard: Rc<dyn Dashboard> = match args.dashboard {
        DashboardKind::Text => Rc::new(TextDashboard::stdout()),
    };
    let driver = Driver::new(
        em.clone(),
        dashboard,
        &source_root,
        &output_root,
        options,
        excludes,
    )
    .context("setting up the driver")?;

    driver.add_factory(Box::new(ExecRuleFactory));

    // Ctrl-C reports the census as it stands and unwinds cleanly; in-flight
    // children are terminated when their records drop.
    {
        let driver = driver.clone();
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("interrupted; shutting down");
            driver.request_shutdown();
        });
    }

    let census = em
        .run_until(driver.run())
        .await
        .context("running the build")?;

    info!(%census, "build finished");
    println!("probuild: {census}");
    Ok(if census.all_passed() { 0 } else { 1 })
}

/// Simple dry-run output: effective settings, nothing executed.
fn print_dry_run(args: &CliArgs, options: &DriverOptions, output_root: &std::path::Path) {
    println!("probuild dry-run");
    println!("  root = {}", args.root);
    println!("  output = {}", output_root.display());
    println!("  jobs = {}", options.jobs);
    println!("  watch = {}", options.watch);
    debug!("dry-run complete (no execution)");
}
