pub mod cancel;
pub mod cli;
pub mod cloner;
pub mod config;
pub mod daemon;
pub mod driver;
pub mod protocol;
pub mod resolver;
pub mod source;
pub mod transport;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::cli::{Client, ClientError, format_repo, print_sources};

#[derive(Parser)]
#[command(
    name = "srcget",
    about = "Find and clone repositories from configured sources"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Configuration file (default: $SRCGET_CONFIG or ~/.config/srcget/config.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Stop the running daemon
    Stop,

    /// Show configured sources and their status
    Sources,

    /// List candidate repositories for a query
    Resolve {
        /// Repository name, owner/name or URL
        query: String,
    },

    /// Clone a repository by source and id (as printed by `resolve`)
    Clone { source: String, id: String },

    /// Resolve a query and clone it if exactly one repository matches
    Get {
        /// Repository name, owner/name or URL
        query: String,
    },

    /// List the driver types compiled into this binary
    Drivers,
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon { config } => cmd_daemon(config),
        Commands::Stop => cmd_stop(),
        Commands::Sources => cmd_sources(),
        Commands::Resolve { query } => cmd_resolve(&query),
        Commands::Clone { source, id } => cmd_clone(&source, &id),
        Commands::Get { query } => cmd_get(&query),
        Commands::Drivers => cmd_drivers(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if e.to_string().contains("not running") {
            eprintln!();
            eprintln!("Hint: Start the daemon with: srcget daemon");
        }
        std::process::exit(1);
    }
}

fn cmd_daemon(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    daemon::start(config.as_deref())?;
    Ok(())
}

fn cmd_stop() -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    match client.stop() {
        // The daemon may close the socket before the reply arrives.
        Ok(()) | Err(ClientError::NotRunning) => {}
        Err(e) => return Err(e.into()),
    }
    println!("Daemon stopped");
    Ok(())
}

fn cmd_sources() -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    let result = client.sources()?;
    print_sources(&result.sources);
    Ok(())
}

fn cmd_resolve(query: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    let result = client.resolve(query, |source, repo| {
        println!("{}", format_repo(&source, &repo));
    })?;

    if result.count == 0 {
        eprintln!("No repositories match {}", query);
    }
    Ok(())
}

fn cmd_clone(source: &str, id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;
    let result = client.clone_repo(source, id, |line| eprintln!("{}", line))?;
    println!("{}", result.directory);
    Ok(())
}

fn cmd_get(query: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = Client::connect()?;

    let mut candidates = Vec::new();
    client.resolve(query, |source, repo| candidates.push((source, repo)))?;

    let (source, repo) = match candidates.len() {
        0 => return Err(format!("no repository matches {}", query).into()),
        1 => candidates.remove(0),
        n => {
            for (source, repo) in &candidates {
                eprintln!("{}", format_repo(source, repo));
            }
            return Err(format!(
                "{} repositories match {}; pick one with: srcget clone <source> <id>",
                n, query
            )
            .into());
        }
    };

    eprintln!("Cloning {} from {}", repo.name, source);
    let result = client.clone_repo(&source, &repo.id, |line| eprintln!("{}", line))?;
    println!("{}", result.directory);
    Ok(())
}

fn cmd_drivers() -> Result<(), Box<dyn std::error::Error>> {
    let registry = driver::builtins();
    for type_name in registry.all_type_names() {
        let Some(registration) = registry.lookup(&type_name) else {
            continue;
        };
        println!("{:<12} {}", type_name, registration.description);
        for default in &registration.defaults {
            println!("{:<12}   default source: {}", "", default.name);
        }
    }
    Ok(())
}
