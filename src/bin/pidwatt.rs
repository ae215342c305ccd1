use clap::{Parser, Subcommand};
use colored::*;
use pidwatt::config::{log_level_filter, AgentConfig};
use pidwatt::core::constants::paths;
use pidwatt::health::HealthStatus;
use pidwatt::resolver::ProcessIdentityResolver;
use pidwatt::sensors::cpuinfo::{CpuInfoProfiler, CpuProfile};
use pidwatt::sensors::rapl::{self, RaplProbe};
use pidwatt::Agent;
use std::path::PathBuf;
use std::process::exit;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// Per-process energy attribution agent
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent: sample, attribute and serve /healthz and /telemetry
    Run {
        /// JSON configuration file
        #[clap(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Override export.http.port
        #[clap(short, long)]
        port: Option<u16>,
    },

    /// Resolve the configured target once and print it
    Resolve {
        /// JSON configuration file
        #[clap(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Inspect the RAPL energy counters
    Probe {
        /// Powercap root
        #[clap(long, default_value = paths::POWERCAP)]
        base_path: PathBuf,

        /// Output in JSON format
        #[clap(short, long)]
        json: bool,
    },

    /// Describe the host CPU from /proc/cpuinfo
    Cpu {
        /// cpuinfo file to read
        #[clap(long, default_value = paths::CPUINFO)]
        path: PathBuf,

        /// Output in JSON format
        #[clap(short, long)]
        json: bool,
    },
}

fn init_logging(level: &str) {
    let default = log_level_filter(level).unwrap_or(log::LevelFilter::Warn);
    env_logger::Builder::new()
        .filter_level(default)
        .parse_default_env()
        .init();
}

fn load_config(path: &PathBuf) -> AgentConfig {
    match AgentConfig::load(path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {}: {}", "Invalid config".red().bold(), path.display(), err);
            exit(1);
        }
    }
}

fn colored_status(status: HealthStatus) -> ColoredString {
    match status {
        HealthStatus::Ok => status.to_string().green().bold(),
        HealthStatus::Degraded => status.to_string().yellow().bold(),
        HealthStatus::Failed => status.to_string().red().bold(),
    }
}

#[derive(Tabled)]
struct PackageRow {
    node: String,
    name: String,
    vendor: String,
    readable: String,
    max_range_uj: String,
    reason: String,
}

fn print_probe(probe: &RaplProbe) {
    println!("RAPL status: {}", colored_status(probe.status));
    if let Some(hint) = &probe.hint {
        println!("{}", hint.dimmed());
    }
    if probe.packages.is_empty() {
        return;
    }

    let rows: Vec<PackageRow> = probe
        .packages
        .iter()
        .map(|pkg| PackageRow {
            node: pkg.node.clone(),
            name: pkg.name.clone(),
            vendor: format!("{:?}", pkg.vendor).to_lowercase(),
            readable: if pkg.readable { "yes" } else { "no" }.to_string(),
            max_range_uj: pkg
                .max_energy_range_uj
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            reason: pkg.reason.clone().unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

fn print_cpu(profile: &CpuProfile) {
    let vendor = profile.vendor.as_deref().unwrap_or("unknown");
    let model = profile.model.as_deref().unwrap_or("unknown");
    println!("{} {}", vendor.bold(), model);
    println!(
        "Cores: {} physical, {} logical",
        profile
            .cores
            .physical
            .map(|c| c.to_string())
            .unwrap_or_else(|| "?".to_string()),
        profile.cores.logical
    );
    if let Some(freq) = &profile.frequency {
        println!(
            "Clock: avg {:.0} {} (min {:.0}, max {:.0}, load estimate {:.2})",
            freq.average, freq.unit, freq.min, freq.max, freq.load_estimate
        );
    }
    let caps = &profile.capabilities;
    let mark = |on: bool| if on { "yes".green() } else { "no".dimmed() };
    println!(
        "Virtualisation: {}  AES: {}  Hyper-threading: {}  NX+SMAP+SMEP: {}",
        mark(caps.virtualisable),
        mark(caps.aes_support),
        mark(caps.hyper_threading),
        mark(caps.secure_boot_capable)
    );
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Run { config, port } => {
            let mut config = load_config(&config);
            if let Some(port) = port {
                config.export.http.port = port;
            }
            init_logging(&config.log_level);

            let address = config.export.http.address();
            let agent = match Agent::start(config).await {
                Ok(agent) => agent,
                Err(err) => {
                    eprintln!("{} {}", "Error starting agent:".red().bold(), err);
                    exit(1);
                }
            };
            println!(
                "Attributing energy to PID {} (RAPL {}), serving on {}",
                agent.identity().pid.to_string().cyan(),
                colored_status(agent.rapl().status),
                address.cyan()
            );
            println!("Press Ctrl+C to stop");

            if let Err(err) = agent.run_until_ctrl_c().await {
                eprintln!("{} {}", "Agent stopped with error:".red().bold(), err);
                exit(1);
            }
        }

        Commands::Resolve { config } => {
            let config = load_config(&config);
            init_logging(&config.log_level);

            let resolver = match ProcessIdentityResolver::new(&config.target) {
                Ok(resolver) => resolver,
                Err(err) => {
                    eprintln!("{} {}", "Invalid target:".red().bold(), err);
                    exit(1);
                }
            };
            match resolver.resolve().await {
                Ok(identity) => match serde_json::to_string_pretty(&identity) {
                    Ok(json) => println!("{}", json),
                    Err(err) => {
                        eprintln!("Error serializing result: {}", err);
                        exit(1);
                    }
                },
                Err(err) => {
                    eprintln!("{} {}", err.code().red().bold(), err);
                    exit(2);
                }
            }
        }

        Commands::Probe { base_path, json } => {
            init_logging("warn");
            let probe = rapl::probe(&base_path).await;
            if json {
                match serde_json::to_string_pretty(&probe) {
                    Ok(out) => println!("{}", out),
                    Err(err) => {
                        eprintln!("Error serializing probe: {}", err);
                        exit(1);
                    }
                }
            } else {
                print_probe(&probe);
            }
            if probe.status == HealthStatus::Failed {
                exit(1);
            }
        }

        Commands::Cpu { path, json } => {
            init_logging("warn");
            let profile = match CpuInfoProfiler::with_path(&path).profile().await {
                Ok(profile) => profile,
                Err(err) => {
                    eprintln!("{} {}", "Cannot read CPU info:".red().bold(), err);
                    exit(1);
                }
            };
            if json {
                match serde_json::to_string_pretty(&profile) {
                    Ok(out) => println!("{}", out),
                    Err(err) => {
                        eprintln!("Error serializing profile: {}", err);
                        exit(1);
                    }
                }
            } else {
                print_cpu(&profile);
            }
        }
    }
}
