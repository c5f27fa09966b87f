//! hopper CLI tool.

use clap::{Parser, Subcommand};
use hopper_core::{RunnerScope, TrustUpdate};

mod commands;

use commands::Client;

#[derive(Parser)]
#[command(name = "hopper")]
#[command(about = "hopper Actions scheduler CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "HOPPER_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// API token
    #[arg(long, env = "HOPPER_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered runners
    Runners {
        #[command(subcommand)]
        command: RunnerCommands,
    },
    /// Inspect queued jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Manage runner registration tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
    /// Record a trust decision on a run awaiting approval
    Trust {
        /// Run ID
        run: String,
        /// once, always, deny or revoke
        #[arg(value_parser = parse_trust_update)]
        decision: TrustUpdate,
        /// User recording the decision
        #[arg(long)]
        doer: i64,
    },
    /// Inspect and cancel runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Print the stored log of a task
    Logs {
        /// Task ID
        task: String,
        /// First row to print
        #[arg(long, default_value = "0")]
        offset: i64,
        /// Maximum number of rows
        #[arg(long, default_value = "1000")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum RunnerCommands {
    /// List runners of a scope
    List {
        /// global, owner:<id> or repo:<id>
        #[arg(long, default_value = "global")]
        scope: RunnerScope,
    },
    /// Show a runner
    Show {
        /// Runner ID
        id: String,
        #[arg(long, default_value = "global")]
        scope: RunnerScope,
    },
    /// Delete a runner
    Delete {
        /// Runner ID
        id: String,
        #[arg(long, default_value = "global")]
        scope: RunnerScope,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List jobs a runner of the scope could be handed now
    Pending {
        #[arg(long, default_value = "global")]
        scope: RunnerScope,
        /// Only jobs matching one of these labels
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// Issue a registration token; earlier tokens of the scope stop working
    Create {
        #[arg(long, default_value = "global")]
        scope: RunnerScope,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Show a run and its jobs
    Show {
        /// Run ID
        id: String,
    },
    /// Cancel a run
    Cancel {
        /// Run ID
        id: String,
    },
}

fn parse_trust_update(raw: &str) -> Result<TrustUpdate, String> {
    match raw {
        "once" => Ok(TrustUpdate::Once),
        "always" => Ok(TrustUpdate::Always),
        "deny" => Ok(TrustUpdate::Deny),
        "revoke" => Ok(TrustUpdate::Revoke),
        other => Err(format!("unknown decision: {}", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = Client::new(&cli.api_url, cli.token)?;

    match cli.command {
        Commands::Runners { command } => match command {
            RunnerCommands::List { scope } => {
                commands::runners::list(&client, scope).await?;
            }
            RunnerCommands::Show { id, scope } => {
                commands::runners::show(&client, scope, &id).await?;
            }
            RunnerCommands::Delete { id, scope } => {
                commands::runners::delete(&client, scope, &id).await?;
            }
        },
        Commands::Jobs { command } => match command {
            JobCommands::Pending { scope, labels } => {
                commands::jobs::pending(&client, scope, &labels).await?;
            }
        },
        Commands::Token { command } => match command {
            TokenCommands::Create { scope } => {
                commands::runners::create_token(&client, scope).await?;
            }
        },
        Commands::Trust {
            run,
            decision,
            doer,
        } => {
            commands::runs::trust(&client, &run, decision, doer).await?;
        }
        Commands::Runs { command } => match command {
            RunCommands::Show { id } => {
                commands::runs::show(&client, &id).await?;
            }
            RunCommands::Cancel { id } => {
                commands::runs::cancel(&client, &id).await?;
            }
        },
        Commands::Logs {
            task,
            offset,
            limit,
        } => {
            commands::runs::logs(&client, &task, offset, limit).await?;
        }
    }

    Ok(())
}
