#![cfg(feature = "cli")]
use std::path::Path;

use anyhow::Context;
use base64::Engine;
use clap::{ArgAction, Parser, Subcommand};
use log::{error, info, warn, LevelFilter};

use rseme::classify::{decode_envelope, MessageDiagnostics};
use rseme::conformance::{TestDefinition, TestRegistry, SUITE_NAME};
use rseme::pssh::{count_pssh_atoms, split_pssh_boxes};
use rseme::sim::{run_simulation, SimulationConfig};
use rseme::wire_protocol::message::MessageId;

#[cfg(feature = "chrono")]
use chrono::Datelike;

#[derive(Parser)]
#[command(name = "rseme", version, disable_version_flag = true, about = "rseme CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// List the EME conformance tests.
    ListTests {
        #[arg(short = 'c', long = "category")]
        category: Option<String>,
    },
    /// Describe the PSSH boxes in base64 `cenc` init data.
    InspectInitData { init_data: String },
    /// Classify a base64 license-request message.
    Classify { message: String },
    /// Run a scenario against the simulated host.
    ///
    /// With `--test`, the scenario parameters come from that conformance
    /// test and its checks are evaluated against the result. `--test all`
    /// runs the whole suite.
    Simulate {
        config_path: Option<std::path::PathBuf>,
        #[arg(short = 't', long = "test")]
        test: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(level).init();

    let current_year = current_year();
    let copyright_years = format!("2024-{}", current_year);
    let version = env!("CARGO_PKG_VERSION");

    info!("rseme version {} Copyright (c) {}", version, copyright_years);

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::ListTests { category }) => run_list_tests(category.as_deref()),
        Some(Commands::InspectInitData { init_data }) => run_inspect_init_data(&init_data),
        Some(Commands::Classify { message }) => run_classify(&message),
        Some(Commands::Simulate { config_path, test }) => {
            run_simulate(config_path.as_deref(), test.as_deref())
        }
        None => Ok(()),
    }
}

fn current_year() -> i64 {
    #[cfg(feature = "chrono")]
    {
        chrono::Local::now().year().into()
    }
    #[cfg(not(feature = "chrono"))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() / 31_536_000 + 1970)
            .unwrap_or(2024) as i64
    }
}

fn run_list_tests(category: Option<&str>) -> anyhow::Result<()> {
    let suite = TestRegistry::eme_suite()?;
    let mut listed = 0usize;
    for test in suite.iter() {
        if category.is_some_and(|c| !test.category.eq_ignore_ascii_case(c)) {
            continue;
        }
        info!(
            "[{}] {} ({}{})",
            test.id,
            test.name,
            test.category,
            if test.mandatory { "" } else { ", optional" }
        );
        info!(" + {}", test.title);
        listed += 1;
    }
    info!("{}: {} tests", SUITE_NAME, listed);
    Ok(())
}

fn run_inspect_init_data(init_data_b64: &str) -> anyhow::Result<()> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(init_data_b64.trim())
        .context("Init data is not valid base64")?;
    info!("Init data: {} bytes, {} pssh atoms", data.len(), count_pssh_atoms(&data));

    for (i, pssh) in split_pssh_boxes(&data)?.iter().enumerate() {
        let system = pssh
            .system()
            .map(|s| format!("{:?}", s))
            .unwrap_or_else(|| "Unknown".to_string());
        info!(
            "[{}] v{} {} ({}) {} key ids, {} bytes of data",
            i,
            pssh.version,
            system,
            pssh.system_id,
            pssh.key_ids.len(),
            pssh.init_data.len()
        );
        for kid in pssh.key_ids.iter() {
            info!(" + {}", kid.as_simple());
        }
    }
    Ok(())
}

fn run_classify(message_b64: &str) -> anyhow::Result<()> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(message_b64.trim())
        .context("Message is not valid base64")?;

    match decode_envelope(&data) {
        Ok(envelope) => {
            let id = envelope
                .id
                .and_then(|id| MessageId::try_from(id).ok())
                .map(|id| id.as_str_name().to_string())
                .unwrap_or_else(|| "UNSET".to_string());
            info!("Message id: {}", id);
        }
        Err(e) => warn!("Not a license protocol message: {}", e),
    }

    let diagnostics = MessageDiagnostics::inspect(&data);
    info!("Certificate request: {}", diagnostics.certificate_request);
    info!("Encrypted client id: {}", diagnostics.encrypted);
    Ok(())
}

fn run_simulate(config_path: Option<&Path>, test: Option<&str>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => SimulationConfig::from_path(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => SimulationConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create runtime")?;

    let suite = TestRegistry::eme_suite()?;
    let tests: Vec<&TestDefinition> = match test {
        None => {
            let report = runtime.block_on(run_simulation(&config, false))?;
            print!("{}", serde_yaml::to_string(&report)?);
            return Ok(());
        }
        Some("all") => suite.iter().collect(),
        Some(id) => vec![suite
            .get(id)
            .with_context(|| format!("Unknown test id '{}'", id))?],
    };

    let total = tests.len();
    let mut passed = 0usize;
    for test in tests {
        let mut scenario = config.clone();
        scenario.apply_test(test);
        let report = runtime.block_on(run_simulation(&scenario, test.inspects_init_data()))?;
        for failure in report.failures.iter() {
            warn!("[{}] {}", test.id, failure);
        }
        match test.evaluate(&report.observation()) {
            Ok(()) => {
                info!("[+] {} {}", test.id, test.name);
                passed += 1;
            }
            Err(e) => error!("[-] {} {}: {}", test.id, test.name, e),
        }
    }

    info!("Passed {}/{} tests", passed, total);
    if passed != total {
        anyhow::bail!("{} conformance test(s) failed", total - passed);
    }
    Ok(())
}
