// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use vmm::config::PlatformConfig;
use vmm::trace::GuestAccess;
use vmm::Vmm;

fn create_app() -> Command {
    Command::new("ptvisor")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Replay guest accesses to the BARs of PCI passthrough devices.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .help("Platform description: host PCI devices and VMs (JSON)")
                .num_args(1)
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .help("Guest configuration space accesses to replay (JSON)")
                .num_args(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("teardown")
                .long("teardown")
                .help("Destroy every VM before reporting")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of debugging output"),
        )
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // RUST_LOG takes precedence over the command line.
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn run(matches: &ArgMatches) -> Result<()> {
    let config_path = matches
        .get_one::<PathBuf>("config")
        .context("Missing platform configuration")?;
    let config = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read {}", config_path.display()))?;
    let config: PlatformConfig = serde_json::from_str(&config)
        .with_context(|| format!("Failed to parse {}", config_path.display()))?;

    let mut vmm = Vmm::new(&config).context("Failed to build VMs")?;

    let accesses = match matches.get_one::<PathBuf>("trace") {
        Some(trace_path) => {
            let trace = fs::read_to_string(trace_path)
                .with_context(|| format!("Failed to read {}", trace_path.display()))?;
            let trace: Vec<GuestAccess> = serde_json::from_str(&trace)
                .with_context(|| format!("Failed to parse {}", trace_path.display()))?;
            vmm.replay(&trace).context("Failed to replay guest accesses")?
        }
        None => Vec::new(),
    };

    if matches.get_flag("teardown") {
        vmm.destroy_vms().context("Failed to destroy VMs")?;
    }

    let mut report = vmm.report();
    report.accesses = accesses;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

fn main() {
    let matches = create_app().get_matches();
    init_logger(matches.get_count("v"));

    if let Err(e) = run(&matches) {
        eprintln!("Error: {e:?}");
        process::exit(1);
    }
}
