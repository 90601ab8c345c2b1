//! Command-line entry point for the rules sandbox.
//!
//! Loads `rules.toml`, compiles the configured rules, and runs them against
//! user/context documents the way a simulated login would.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rules::exit_codes;
use rules::io::config::{DEFAULT_CONFIG_FILE, load_config};
use rules::io::init::{InitOptions, init_rules};
use rules::io::input::{load_context, load_user};
use rules::{RuleSignal, RulesRunner, logging};

#[derive(Parser)]
#[command(
    name = "rules",
    version,
    about = "Run tenant authentication rules in a sandbox"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `rules.toml` and a `rules/` directory with an example rule.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Compile every rule and print identifiers in execution order.
    Check {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
    /// Run the rule chain and print the outcome as JSON.
    Run {
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// JSON document with the user profile.
        #[arg(long)]
        user: PathBuf,
        /// JSON document with the authentication context.
        #[arg(long)]
        context: PathBuf,
    },
}

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code(exit_codes::INVALID)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("resolve working directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&cwd, force),
        Command::Check { config } => cmd_check(&cwd, &config),
        Command::Run {
            config,
            user,
            context,
        } => cmd_run(&cwd, &config, &user, &context),
    }
}

fn cmd_init(cwd: &Path, force: bool) -> Result<i32> {
    let paths = init_rules(cwd, &InitOptions { force })?;
    println!("{}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn load_runner(cwd: &Path, config_path: &Path) -> Result<RulesRunner> {
    let config = load_config(&cwd.join(config_path))?;
    let runner = RulesRunner::from_config(&config, cwd).context("load rules")?;
    Ok(runner)
}

fn cmd_check(cwd: &Path, config_path: &Path) -> Result<i32> {
    let runner = load_runner(cwd, config_path)?;
    for identifier in runner.registry().identifiers() {
        println!("{identifier}");
    }
    Ok(exit_codes::OK)
}

fn cmd_run(cwd: &Path, config_path: &Path, user: &Path, context: &Path) -> Result<i32> {
    let runner = load_runner(cwd, config_path)?;
    let user = load_user(&cwd.join(user))?;
    let context = load_context(&cwd.join(context))?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("build async runtime")?;
    let outcome = runtime
        .block_on(runner.run(user, context))
        .context("run rules")?;

    let mut payload = serde_json::to_string_pretty(&outcome).context("serialize outcome")?;
    payload.push('\n');
    print!("{payload}");

    Ok(match outcome.signal {
        None => exit_codes::OK,
        Some(RuleSignal::Denied { .. }) => exit_codes::DENIED,
        Some(RuleSignal::Redirect { .. }) => exit_codes::REDIRECTED,
    })
}
