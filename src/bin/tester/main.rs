use std::{process, time::Instant};

use anyhow::{Context, Result};
use cacheline_spinlock::{
    config::{self, StressConfig},
    relax,
};
use clap::Parser;
use colored::Colorize;
use crossbeam::channel::{bounded, Sender};
use log::{debug, error, info};

use crate::check::{Check, CheckGroup, CheckName, LockVariant};

pub mod check;

#[derive(Parser, Debug)]
#[command(about = "Stress and layout checks for the spinlock primitives")]
struct CliArgs {
    /// Path to stress config file. Built-in defaults are used if omitted
    #[arg(short, long = "config")]
    config_path: Option<String>,
    /// Run the given group of checks
    #[arg(long, group = "check_mode")]
    check_group: Option<CheckGroup>,
    /// Run the listed, individual checks
    #[arg(long, group = "check_mode", num_args = 1..)]
    checks: Option<Vec<CheckName>>,
    /// Lock type the checks are run against
    #[arg(long, value_enum, default_value_t = LockVariant::Both)]
    variant: LockVariant,
    /// Run the stress checks with this many threads instead of the configured counts
    #[arg(short, long, value_parser = thread_count)]
    threads: Option<usize>,
}

fn thread_count(s: &str) -> Result<usize, String> {
    clap_num::number_range(s, 1, 256)
}

/// Hand an interrupt to the running checks. Returns false if the previous one
/// was never picked up, e.g. because a check is stuck inside `lock()`.
fn forward_interrupt(tx: &Sender<()>) -> bool {
    tx.try_send(()).is_ok()
}

fn main() -> Result<()> {
    env_logger::init();

    //parse args
    let args = CliArgs::parse();
    let mut stress_config = match &args.config_path {
        Some(path) => config::parse_config(path).context("failed to parse stress config")?,
        None => StressConfig::default(),
    };
    if let Some(threads) = args.threads {
        stress_config.thread_counts = vec![threads];
    }
    debug!("stress config: {:?}", stress_config);
    info!(
        "cpu spin hint {}",
        if relax::HAS_SPIN_HINT {
            "available"
        } else {
            "not available, spinning without hint"
        }
    );

    //select checks
    let selected_checks: Vec<CheckName> = match (args.check_group, args.checks) {
        (Some(group), _) => group.into(),
        (None, Some(checks)) => checks,
        (None, None) => CheckGroup::All.into(),
    };
    debug!("selected_checks: {:?}", selected_checks);

    //mapping ctrl-c to channel
    let (tx, rx) = bounded(1);
    ctrlc::set_handler(move || {
        if !forward_interrupt(&tx) {
            error!("interrupted again before the checks stopped, exiting");
            process::exit(130);
        }
    })
    .context("Error setting Ctrl-C handler")?;

    let checks: Vec<Box<dyn Check>> = selected_checks
        .iter()
        .flat_map(|c| c.instantiate(&rx, &stress_config, args.variant))
        .collect();

    //run checks
    for c in checks.into_iter() {
        println!("Running check {} : {}", c.get_name(), c.get_description());
        let start = Instant::now();
        if let Err(e) = c.run() {
            println!("{}", "FAILED".red());
            error!("{} failed after {:?}: {}", c.get_name(), start.elapsed(), e);
            return Err(e).context(format!("Check {} failed", c.get_name()));
        }
        debug!("{} took {:?}", c.get_name(), start.elapsed());
        println!("{}", "SUCCESS".green());
    }

    Ok(())
}
