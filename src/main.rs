#![deny(clippy::mod_module_files)]
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use binsync::activity::friendly_datetime;
use binsync::data::{Comment, FunctionHeader};
use binsync::{artifact, ArtifactGroup, BinsyncConfig, Client, GitTreeStore, Stamp, State};

/// Inspect and edit binsync states from a terminal.
#[derive(Parser)]
#[command(name = "binsync", about = "Collaborative reverse-engineering state")]
struct Cli {
    /// Repository holding the state branches (overrides config).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// User whose state is edited (overrides config).
    #[arg(long, global = true)]
    master: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the repository if it does not exist.
    Init,
    /// List users with a saved state.
    Users,
    /// Print a user's state.
    Show {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Print the most recently changed artifact of a group.
    LastPush {
        #[arg(long)]
        user: Option<String>,
        /// function, comment, patch or struct
        group: ArtifactGroup,
    },
    /// Print every user's most recent change.
    Activity,
    /// Set a comment and save.
    Comment {
        #[arg(value_parser = parse_addr)]
        addr: u64,
        text: String,
        /// Address of the function the comment belongs to.
        #[arg(long, value_parser = parse_addr)]
        function: Option<u64>,
        #[arg(long)]
        decompiled: bool,
    },
    /// Rename a function and save.
    Rename {
        #[arg(value_parser = parse_addr)]
        addr: u64,
        name: String,
    },
    /// Replace the master state with another user's and save.
    Import { from_user: String },
}

fn parse_addr(s: &str) -> std::result::Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address `{s}`: {e}"))
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli)
}

fn resolve_config(cli: &Cli) -> Result<BinsyncConfig> {
    let mut config = match (BinsyncConfig::load(), &cli.master) {
        (Ok(config), _) => config,
        (Err(e), Some(user)) => {
            tracing::debug!("ignoring config: {}", e);
            BinsyncConfig {
                repo_path: PathBuf::from("."),
                user: user.clone(),
                author_email: None,
            }
        }
        (Err(e), None) => {
            return Err(e).context("no binsync user configured; pass --master or set BINSYNC_USER")
        }
    };
    if let Some(user) = &cli.master {
        config.user = user.clone();
    }
    if let Some(repo) = &cli.repo {
        config.repo_path = repo.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Init = cli.command {
        let path = cli.repo.clone().unwrap_or_else(|| PathBuf::from("."));
        let git_dir = GitTreeStore::init(&path)
            .with_context(|| format!("Failed to initialize repository at {:?}", path))?;
        println!("binsync repository at {}", git_dir.display());
        return Ok(());
    }

    let config = resolve_config(&cli)?;
    let mut client = Client::open(&config)
        .with_context(|| format!("Failed to open repository at {:?}", config.repo_path))?;

    match cli.command {
        Commands::Init => {}
        Commands::Users => {
            for user in client.users()? {
                println!("{user}");
            }
        }
        Commands::Show { user, json } => {
            let state = load_state(&client, user.as_deref())?;
            if json {
                print_json(&state)?;
            } else {
                print_state(&state);
            }
        }
        Commands::LastPush { user, group } => {
            let state = load_state(&client, user.as_deref())?;
            match state.get_last_push_for_artifact_type(group) {
                Some((key, ts)) => {
                    println!("{group} {key} {}", friendly_datetime(ts, artifact::now()))
                }
                None => println!("no {group} changes"),
            }
        }
        Commands::Activity => {
            let now = artifact::now();
            for activity in client.activity()? {
                let function = match (activity.function, &activity.function_name) {
                    (Some(addr), Some(name)) => format!("{name} ({addr:#x})"),
                    (Some(addr), None) => format!("{addr:#x}"),
                    (None, _) => "-".to_string(),
                };
                let when = activity
                    .last_change
                    .map(|ts| friendly_datetime(ts, now))
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<16} {:<32} {}", activity.user, function, when);
            }
        }
        Commands::Comment {
            addr,
            text,
            function,
            decompiled,
        } => {
            let mut comment = Comment::new(addr, text).decompiled(decompiled);
            comment.func_addr = function;
            let changed = client.state_mut().set_comment(comment, Stamp::Now);
            report_save(&mut client, changed)?;
        }
        Commands::Rename { addr, name } => {
            let state = client.state_mut();
            let mut header = state
                .get_function_header(addr)
                .cloned()
                .unwrap_or_else(|_| FunctionHeader::new(None, addr));
            header.name = Some(name);
            let changed = state.set_function_header(header, Stamp::Now);
            report_save(&mut client, changed)?;
        }
        Commands::Import { from_user } => {
            let changed = client
                .sync_states(&from_user)
                .with_context(|| format!("Failed to import state of {from_user}"))?;
            report_save(&mut client, changed)?;
        }
    }
    Ok(())
}

fn load_state(client: &Client, user: Option<&str>) -> Result<State> {
    match user {
        None => Ok(client.state().clone()),
        Some(user) => client
            .get_state(user)
            .with_context(|| format!("Failed to load state of {user}")),
    }
}

fn report_save(client: &mut Client, changed: bool) -> Result<()> {
    if !changed {
        println!("no change");
        return Ok(());
    }
    match client.save().context("Failed to save state")? {
        Some(commit) => println!("saved version {} ({commit})", client.state().version),
        None => println!("no change"),
    }
    Ok(())
}

fn print_state(state: &State) {
    println!("user {} version {}", state.user, state.version);
    for (addr, func) in state.functions() {
        println!(
            "function {addr:#x} {} ({} stack variables)",
            func.name().unwrap_or("<unnamed>"),
            func.stack_vars.len()
        );
        if let Some(comment) = func.comment() {
            println!("  // {comment}");
        }
    }
    for (addr, comment) in state.comments() {
        println!("comment {addr:#x}: {}", comment.comment);
    }
    for (name, s) in state.structs() {
        println!("struct {name} ({} bytes, {} members)", s.size, s.members.len());
    }
    for (offset, patch) in state.patches() {
        println!("patch {offset:#x}: {}", hex::encode(&patch.bytes));
    }
}

fn print_json(state: &State) -> Result<()> {
    let value = serde_json::json!({
        "user": state.user,
        "version": state.version,
        "last_push": state.last_push(),
        "functions": state.functions().values().collect::<Vec<_>>(),
        "comments": state.comments().values().collect::<Vec<_>>(),
        "structs": state.structs().values().collect::<Vec<_>>(),
        "patches": state.patches().values().collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
