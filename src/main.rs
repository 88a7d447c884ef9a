use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vmm::{Vmm, VMMConfig};

#[derive(Parser)]
#[clap(version = "0.1", author = "Polytech Montpellier - DevOps")]
struct MonitorOpts {
    /// ELF payload path
    #[clap(short = 'k', long = "payload")]
    payload: Option<String>,

    /// Number of virtual CPUs assigned to the guest
    #[clap(short, long, default_value = "1")]
    cpus: u8,

    /// Memory amount (in MBytes) assigned to the guest
    #[clap(short, long, default_value = "512")]
    memory: u32,

    /// A level of verbosity, and can be used multiple times
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Listen for management requests on this UNIX socket path
    #[clap(long)]
    mgmt_socket: Option<String>,

    /// Listen for management requests on a self-generated socket under this directory
    #[clap(long)]
    mgmt_dir: Option<String>,

    /// Path a snapshot is written to when none is given in the management request
    #[clap(long)]
    snapshot_path: Option<String>,

    /// Restore from a snapshot instead of loading a fresh payload
    #[clap(long)]
    restore: Option<String>,

    /// Interface name to bind the packet-capture hypercalls to
    #[clap(long)]
    net: Option<String>,
}

fn verbosity_filter(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> ExitCode {
    let opts = MonitorOpts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(verbosity_filter(opts.verbose))),
        )
        .init();

    match run(opts) {
        Ok(code) => {
            if code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::from((code & 0xff) as u8)
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "monitor exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn run(opts: MonitorOpts) -> vmm::Result<i32> {
    let config: VMMConfig = VMMConfig::builder(opts.cpus, opts.memory)
        .payload(opts.payload)
        .verbose(opts.verbose)
        .mgmt_socket(opts.mgmt_socket)
        .mgmt_dir(opts.mgmt_dir)
        .snapshot_path(opts.snapshot_path)
        .restore(opts.restore)
        .net(opts.net)
        .build()?;

    let vmm = Vmm::new(config)?;
    vmm.run()
}
