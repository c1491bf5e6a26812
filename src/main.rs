use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, MultiSelect, Password};
use tracing_subscriber::EnvFilter;

use heimdell::config::PROJECT_DIR_ENV;
use heimdell::environment::display_path;
use heimdell::{
    execute_protected_command, store, Credentials, EnvironmentManager, HeimdellError, Layout,
    Platform, ProjectConfig, SwitchOutcome, TerminalPrompt,
};

const NOT_LOGGED_IN: &str = "not logged in, please run `heimdell login` first";

#[derive(Parser)]
#[command(name = "heimdell")]
#[command(version, about = "Manage credentials and environments for over-the-air updates")]
struct Cli {
    /// Project directory holding the .heimdell store
    #[arg(long, global = true, env = PROJECT_DIR_ENV)]
    project_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save server credentials, optionally for a named environment
    Login(LoginArgs),
    /// Switch, reset or list environments
    Env(EnvArgs),
    /// Encrypt every unencrypted credentials file
    EncryptCredentials,
    /// Show the active credentials
    Whoami,
}

#[derive(Args)]
struct LoginArgs {
    /// Environment to log in to (default environment when omitted)
    #[arg(long)]
    env: Option<String>,

    /// Server URL
    #[arg(long)]
    server: Option<String>,

    #[arg(long)]
    username: Option<String>,

    /// Project tag on the server
    #[arg(long)]
    tag: Option<String>,

    /// Target platform (repeatable)
    #[arg(long = "platform", value_enum)]
    platforms: Vec<Platform>,

    /// Encrypt the saved credentials
    #[arg(long)]
    encrypt: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("target").required(true).args(["name", "default", "list"])))]
struct EnvArgs {
    /// Environment to switch to
    name: Option<String>,

    /// Switch back to the default environment
    #[arg(long)]
    default: bool,

    /// List environments
    #[arg(long)]
    list: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut config = ProjectConfig::default();
    if let Some(dir) = cli.project_dir {
        config = config.with_project_dir(dir);
    }
    let layout = config.layout().context("failed to resolve project directory")?;

    match cli.command {
        Commands::Login(args) => login(&layout, args),
        Commands::Env(args) => env(&layout, args),
        Commands::EncryptCredentials => encrypt_credentials(&layout),
        Commands::Whoami => whoami(&layout),
    }
}

fn login(layout: &Layout, args: LoginArgs) -> Result<()> {
    let theme = ColorfulTheme::default();

    let base_url = match args.server {
        Some(server) => server,
        None => Input::<String>::with_theme(&theme)
            .with_prompt("Server URL")
            .interact_text()?,
    };
    let username = match args.username {
        Some(username) => username,
        None => Input::<String>::with_theme(&theme)
            .with_prompt("Username")
            .interact_text()?,
    };
    let password = Password::with_theme(&theme)
        .with_prompt("Password")
        .interact()?;
    let tag = match args.tag {
        Some(tag) => tag,
        None => Input::<String>::with_theme(&theme)
            .with_prompt("Project tag")
            .interact_text()?,
    };
    let platforms = if args.platforms.is_empty() {
        select_platforms(&theme)?
    } else {
        args.platforms
    };

    let key = if args.encrypt {
        Some(TerminalPrompt::new().prompt_new_key()?)
    } else {
        None
    };

    let credentials = Credentials {
        base_url,
        username,
        password,
        tag,
        platforms,
        environment: None,
    };

    let manager = EnvironmentManager::new(layout.clone());
    let outcome = manager
        .save_login(args.env.as_deref(), credentials, key.as_ref().map(|k| k.as_str()))
        .context("failed to save credentials")?;

    match &outcome.environment {
        Some(name) => println!("✓ Logged in to environment \"{name}\""),
        None => println!("✓ Logged in"),
    }
    if key.is_some() {
        println!("✓ Credentials encrypted");
    }
    warn_if_copied(layout, &outcome);
    Ok(())
}

fn select_platforms(theme: &ColorfulTheme) -> Result<Vec<Platform>> {
    let all = [Platform::Android, Platform::Ios];
    loop {
        let chosen = MultiSelect::with_theme(theme)
            .with_prompt("Platforms")
            .items(&all)
            .defaults(&[true, true])
            .interact()?;
        if !chosen.is_empty() {
            return Ok(chosen.into_iter().map(|i| all[i]).collect());
        }
        eprintln!("⚠ Select at least one platform.");
    }
}

fn env(layout: &Layout, args: EnvArgs) -> Result<()> {
    let manager = EnvironmentManager::new(layout.clone());

    if args.list {
        let environments = manager.list_environments()?;
        if environments.is_empty() {
            println!("No environments found.");
            return Ok(());
        }

        let current = manager.current_environment();
        for name in environments {
            let marker = if current.as_deref() == Some(name.as_str()) { "*" } else { " " };
            println!("{marker} {name}");
        }
        return Ok(());
    }

    let target = if args.default { None } else { args.name.as_deref() };
    let outcome = manager
        .switch_to(target)
        .context("failed to switch environment")?;

    match &outcome.environment {
        Some(name) => println!("✓ Switched to environment \"{name}\""),
        None if outcome.restored_backup => {
            println!("✓ Switched to the default environment (restored previous credentials)")
        }
        None => println!("✓ Switched to the default environment"),
    }
    warn_if_copied(layout, &outcome);
    Ok(())
}

fn warn_if_copied(layout: &Layout, outcome: &SwitchOutcome) {
    if !outcome.is_copy_fallback() {
        return;
    }
    let Some(name) = &outcome.environment else {
        return;
    };

    eprintln!(
        "⚠ Symbolic links are unavailable here, so {} is a copy of {}.",
        display_path(layout, &layout.credentials_path()).display(),
        display_path(layout, &layout.environment_credentials(name)).display(),
    );
    eprintln!("  Edits to the environment file take effect after switching to it again.");
}

fn encrypt_credentials(layout: &Layout) -> Result<()> {
    let mut managers = vec![EnvironmentManager::new(layout.clone())];
    if let Some(global) = Layout::global().filter(|g| g.store_dir() != layout.store_dir()) {
        managers.push(EnvironmentManager::new(global));
    }

    let mut pending = Vec::new();
    for manager in &managers {
        pending.extend(manager.unencrypted_files()?);
    }

    if pending.is_empty() {
        println!("No unencrypted credentials found.");
        return Ok(());
    }

    println!("Found {} unencrypted credentials file(s):", pending.len());
    for path in &pending {
        println!("  {}", display_path(layout, path).display());
    }

    let key = TerminalPrompt::new().prompt_new_key()?;
    for path in &pending {
        store::encrypt_file(path, &key)
            .with_context(|| format!("failed to encrypt {}", path.display()))?;
        println!("✓ Encrypted {}", display_path(layout, path).display());
    }

    for manager in &managers {
        let refreshed = manager
            .refresh_copy()
            .context("failed to refresh the active credentials copy")?;
        if let Some(outcome) = refreshed {
            warn_if_copied(manager.layout(), &outcome);
        }
    }

    Ok(())
}

fn whoami(layout: &Layout) -> Result<()> {
    execute_protected_command(layout, "whoami", |session| -> Result<()> {
        let credentials = session.credentials();
        let platforms = credentials
            .platforms
            .iter()
            .map(Platform::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        println!("Server:      {}", credentials.base_url);
        println!("Username:    {}", credentials.username);
        println!("Tag:         {}", credentials.tag);
        println!("Platforms:   {platforms}");
        println!(
            "Environment: {}",
            session.environment().unwrap_or("default")
        );
        Ok(())
    })
    .map_err(|err| {
        let not_found = matches!(
            err.downcast_ref::<HeimdellError>(),
            Some(HeimdellError::NotFound(_))
        );
        if not_found {
            err.context(NOT_LOGGED_IN)
        } else {
            err
        }
    })
}
