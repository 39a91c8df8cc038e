#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, CommandFactory as _, Parser, Subcommand};

use crate::config::{self, Config, ConfigPaths};
use crate::engine::TaskSnapshot;
use crate::engine::events::EngineUpdate;
use crate::engine::runtime::{EngineHandle, EngineOptions, spawn_engine};
use crate::logging::{self, LogTarget};
use crate::output::table::Table;
use crate::task::command::{build_command, display_command};
use crate::task::gate::GateController;
use crate::task::model::TaskCatalog;
use crate::task::state::Phase;
use crate::tui;

#[derive(Debug, Parser)]
#[command(
    name = "scriptgate",
    version,
    about = "Run an ordered catalog of maintenance scripts, one gate at a time"
)]
pub struct Cli {
    /// Config file (default: $SCRIPTGATE_CONFIG or ~/.config/scriptgate/config.toml)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Start with every task unlocked
    #[arg(long = "unlock-all", global = true)]
    pub unlock_all: bool,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub cmd: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Interactive launcher (default)
    Tui,
    /// Show the task catalog
    #[command(alias = "ls")]
    List(ListArgs),
    /// Run the catalog headless, in gate order
    Run(RunArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output in JSON format
    #[arg(long = "json")]
    pub json: bool,
    /// Output as CSV
    #[arg(long = "csv", conflicts_with = "json")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Print the final task states as JSON instead of a summary
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Get(ConfigGetArgs),
    Set(ConfigSetArgs),
    /// Print the config file location
    Path,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    let interactive = matches!(cli.cmd, None | Some(Commands::Tui)) && tui::is_tty();
    let target = if interactive {
        LogTarget::File(config::log_file_path())
    } else {
        LogTarget::Stderr
    };
    if let Err(e) = logging::init(cli.verbose, &target) {
        eprintln!("logging disabled: {e:#}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let paths = config::resolve_paths(cli.config.as_deref())?;
    match cli.cmd {
        None | Some(Commands::Tui) => cmd_tui(&paths, cli.unlock_all).await,
        Some(Commands::List(args)) => cmd_list(&paths, &args),
        Some(Commands::Run(args)) => cmd_run(&paths, cli.unlock_all, &args).await,
        Some(Commands::Config(args)) => cmd_config(&paths, args),
        Some(Commands::Completion(args)) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "scriptgate", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Some(Commands::Version) => Ok(cmd_version()),
    }
}

async fn load_cfg(paths: &ConfigPaths) -> anyhow::Result<Config> {
    let paths = paths.clone();
    tokio::task::spawn_blocking(move || config::load(&paths)).await?
}

fn engine_options(cfg: &Config, unlock_all_flag: bool) -> EngineOptions {
    EngineOptions {
        unlock_all: unlock_all_flag || cfg.engine.unlock_all,
        tick_interval: cfg.engine.tick_interval(),
    }
}

async fn cmd_tui(paths: &ConfigPaths, unlock_all_flag: bool) -> anyhow::Result<ExitCode> {
    let cfg = load_cfg(paths).await?;
    let catalog = Arc::new(cfg.catalog()?);

    if !tui::is_tty() {
        print_catalog_table(&catalog, unlock_all_flag || cfg.engine.unlock_all)?;
        return Ok(ExitCode::SUCCESS);
    }

    let opts = engine_options(&cfg, unlock_all_flag);
    let handle = spawn_engine(catalog, opts);
    let final_state = tui::app::run(handle, opts.unlock_all).await?;
    Ok(exit_code_for(&final_state))
}

fn cmd_list(paths: &ConfigPaths, args: &ListArgs) -> anyhow::Result<ExitCode> {
    let cfg = config::load(paths)?;
    let catalog = cfg.catalog()?;

    if args.json {
        let items: Vec<serde_json::Value> = catalog
            .iter()
            .map(|t| {
                serde_json::json!({
                    "index": t.index,
                    "name": t.name,
                    "path": t.executable_path,
                    "privilege": t.privilege,
                    "command": build_command(t),
                    "exists": t.executable_path.exists(),
                    "description": t.description,
                    "hint": catalog.hint_for(t.index),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = Table::new(["#", "NAME", "PRIVILEGE", "COMMAND", "SCRIPT", "DESCRIPTION"]);
    for t in &catalog {
        table.row([
            t.index.to_string(),
            t.name.clone(),
            t.privilege.label().to_owned(),
            display_command(&build_command(t)),
            if t.executable_path.exists() {
                "ok".to_owned()
            } else {
                "missing".to_owned()
            },
            t.description.clone(),
        ]);
    }
    if args.csv {
        table.write_csv(std::io::stdout().lock())?;
    } else {
        table.print()?;
    }
    Ok(ExitCode::SUCCESS)
}

fn print_catalog_table(catalog: &TaskCatalog, unlock_all: bool) -> anyhow::Result<()> {
    let gate = GateController::new(unlock_all);
    let mut table = Table::new(["#", "NAME", "STATUS", "DESCRIPTION"]);
    for t in catalog {
        table.row([
            t.index.to_string(),
            t.name.clone(),
            gate.initial_phase(t.index).label().to_owned(),
            t.description.clone(),
        ]);
    }
    table.print()?;
    Ok(())
}

async fn cmd_run(
    paths: &ConfigPaths,
    unlock_all_flag: bool,
    args: &RunArgs,
) -> anyhow::Result<ExitCode> {
    let cfg = load_cfg(paths).await?;
    let catalog = Arc::new(cfg.catalog()?);
    let opts = engine_options(&cfg, unlock_all_flag);

    let handle = spawn_engine(catalog, opts);
    let final_state = drive_headless(handle, |update| {
        if !args.json {
            print_progress(update);
        }
    })
    .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&final_state)?);
    } else {
        print_summary(&final_state);
    }
    Ok(exit_code_for(&final_state))
}

/// Starts every task that becomes `Ready` exactly once and returns when
/// nothing is left running or startable. Failed tasks are not retried.
pub async fn drive_headless(
    mut handle: EngineHandle,
    mut on_change: impl FnMut(&TaskSnapshot),
) -> anyhow::Result<Vec<TaskSnapshot>> {
    let mut requested: BTreeSet<usize> = BTreeSet::new();
    start_new_ready(&handle, &mut requested);

    while !settled(&handle.snapshot()) {
        match handle.next_update().await {
            Some(EngineUpdate::Changed(snap)) => {
                on_change(&snap);
                start_new_ready(&handle, &mut requested);
            }
            Some(EngineUpdate::Tick { .. }) => {}
            None => break,
        }
    }
    handle.shutdown().await
}

fn start_new_ready(handle: &EngineHandle, requested: &mut BTreeSet<usize>) {
    for t in handle.snapshot() {
        if t.phase == Phase::Ready && requested.insert(t.index) {
            handle.request_start(t.index);
        }
    }
}

/// Nothing is running and nothing is waiting to be started. A requested
/// task whose start has not been processed yet still reads as `Ready`.
fn settled(snapshot: &[TaskSnapshot]) -> bool {
    snapshot
        .iter()
        .all(|t| matches!(t.phase, Phase::Locked | Phase::Completed | Phase::Failed))
}

fn print_progress(snap: &TaskSnapshot) {
    match snap.phase {
        Phase::Running => println!("[{}] {}", snap.index, snap.last_message),
        Phase::Completed => println!("[{}] ✅ {}", snap.index, snap.last_message),
        Phase::Failed => {
            println!("[{}] ❌ {}", snap.index, snap.last_message);
            if let Some(hint) = &snap.hint {
                println!("    troubleshooting: {hint}");
            }
        }
        Phase::Locked | Phase::Ready => {}
    }
}

fn print_summary(final_state: &[TaskSnapshot]) {
    let count = |p: Phase| final_state.iter().filter(|t| t.phase == p).count();
    println!(
        "{} completed, {} failed, {} not run",
        count(Phase::Completed),
        count(Phase::Failed),
        count(Phase::Locked) + count(Phase::Ready)
    );
}

fn exit_code_for(final_state: &[TaskSnapshot]) -> ExitCode {
    if final_state.iter().any(|t| t.phase == Phase::Failed) {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn cmd_config(paths: &ConfigPaths, args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => print!("{}", config::list_resolved_toml(paths)?),
        ConfigCmd::Path => println!("{}", paths.config_file.display()),
        ConfigCmd::Set(set) => {
            config::set_value_string_at_path(&paths.config_file, &set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => match config::get_value_string_at_path(&paths.config_file, &get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'scriptgate config list' to see available keys",
                get.key
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_version() -> ExitCode {
    println!("scriptgate version {}", env!("CARGO_PKG_VERSION"));
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}
