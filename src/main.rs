// src/main.rs

use tokio::task::LocalSet;

fn main() -> anyhow::Result<()> {
    let args = probuild::cli::parse();
    probuild::logging::init_logging(args.log_level)?;

    // Single-threaded by design: all scheduling happens on this thread, and
    // spawned children are the only parallelism.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    let exit_code = local.block_on(&runtime, probuild::run(args))?;

    // Tear the runtime down before exiting so lingering children are
    // reaped/killed by their drop handlers.
    drop(local);
    drop(runtime);
    std::process::exit(exit_code);
}
