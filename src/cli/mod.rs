pub mod jobs;
pub mod runners;
pub mod watch;

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::models::{ResourceRef, Scope};

/// Job Dispatcher - queue jobs and hand them out to connected runners
#[derive(Parser, Debug)]
#[command(
    name = "jobd",
    version,
    about = "Job Dispatcher - queue jobs and hand them out to connected runners"
)]
pub struct Cli {
    /// Server host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Server port
    #[arg(long, default_value_t = 9701, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the dispatcher server in the foreground
    Serve {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,

        /// Data directory path
        #[arg(long = "data-dir", conflicts_with = "ephemeral")]
        data_dir: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long = "listen-port")]
        listen_port: Option<u16>,

        /// Keep jobs in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Queue a new job
    Queue {
        /// Scope as KIND:RESOURCE_ID, KIND one of basis, project, target
        #[arg(short = 's', long)]
        scope: String,

        /// Operation kind
        #[arg(short = 'o', long = "op")]
        op: String,

        /// Operation may not run alongside other jobs on the same scope
        #[arg(long)]
        exclusive: bool,

        /// Only assign to the runner with this id
        #[arg(short = 'r', long)]
        runner: Option<String>,

        /// Operation payload as JSON
        #[arg(long)]
        payload: Option<String>,

        /// Labels (KEY=VALUE)
        #[arg(short = 'l', long = "label", value_name = "KEY=VALUE")]
        labels: Vec<String>,

        /// Cancel the job if it is not done within this duration (e.g. 10m)
        #[arg(long = "expires-in")]
        expires_in: Option<String>,

        /// Follow the job's output after queueing
        #[arg(long)]
        follow: bool,
    },

    /// List all jobs
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a single job
    Get {
        /// Job UUID
        job: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel a job
    Cancel {
        /// Job UUID
        job: String,
    },

    /// Follow a job's state and output until it completes
    Watch {
        /// Job UUID
        job: String,
    },

    /// Remove the oldest finished jobs
    Prune {
        /// Number of finished jobs to keep (server default when omitted)
        #[arg(long)]
        max: Option<usize>,
    },

    /// List connected runners
    Runners {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage config vars pushed to runners
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Set config vars; a var with an empty value is removed
    Set {
        /// Vars (KEY=VALUE)
        #[arg(value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Only send these vars to the runner with this id
        #[arg(short = 'r', long)]
        runner: Option<String>,
    },

    /// Show config vars
    Show {
        /// Show what the runner with this id receives
        #[arg(short = 'r', long)]
        runner: Option<String>,
    },
}

/// Build the base URL for the server HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Parse "KEY=VALUE" arguments into an ordered map.
pub fn parse_key_values(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            if key.is_empty() {
                return Err(format!("Invalid key/value pair: '{}'", arg));
            }
            map.insert(key.to_string(), value.to_string());
        } else {
            return Err(format!(
                "Invalid key/value format: '{}'. Expected KEY=VALUE",
                arg
            ));
        }
    }
    Ok(map)
}

/// Parse a scope written as `KIND:RESOURCE_ID`.
pub fn parse_scope(raw: &str) -> Result<Scope, String> {
    let (kind, id) = raw
        .split_once(':')
        .ok_or_else(|| format!("Invalid scope '{}'. Expected KIND:RESOURCE_ID", raw))?;
    if id.is_empty() {
        return Err(format!("Scope '{}' has an empty resource id", raw));
    }
    let resource = ResourceRef::new(id);
    match kind {
        "basis" => Ok(Scope::Basis(resource)),
        "project" => Ok(Scope::Project(resource)),
        "target" => Ok(Scope::Target(resource)),
        other => Err(format!(
            "Unknown scope kind '{}'. Expected basis, project or target",
            other
        )),
    }
}

/// Format a connection error message for when the server is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to server at {}:{}. Is it running? (try: jobd serve)",
        host, port
    )
}

/// Map reqwest errors to a user-friendly message.
pub(crate) fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// Turn a non-success response into an error carrying the server's message.
pub(crate) async fn error_from_response(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .unwrap_or_else(|_| serde_json::json!({"message": "Unknown error"}));
    let message = body["message"].as_str().unwrap_or("Unknown error");
    anyhow::anyhow!("{} ({})", message, status)
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Serve {
            config,
            data_dir,
            listen_port,
            ephemeral,
        }) => {
            crate::daemon::start_server(
                config.as_deref(),
                data_dir.as_deref(),
                None,
                *listen_port,
                *ephemeral,
            )
            .await
        }
        Some(Commands::Queue {
            scope,
            op,
            exclusive,
            runner,
            payload,
            labels,
            expires_in,
            follow,
        }) => {
            let args = jobs::QueueArgs {
                scope,
                op,
                exclusive: *exclusive,
                runner: runner.as_deref(),
                payload: payload.as_deref(),
                labels,
                expires_in: expires_in.as_deref(),
            };
            let id = jobs::cmd_queue(&cli.host, cli.port, &args).await?;
            if *follow {
                watch::cmd_watch(&cli.host, cli.port, &id.to_string()).await?;
            }
            Ok(())
        }
        Some(Commands::List { json }) => jobs::cmd_list(&cli.host, cli.port, *json).await,
        Some(Commands::Get { job, json }) => jobs::cmd_get(&cli.host, cli.port, job, *json).await,
        Some(Commands::Cancel { job }) => jobs::cmd_cancel(&cli.host, cli.port, job).await,
        Some(Commands::Watch { job }) => watch::cmd_watch(&cli.host, cli.port, job).await,
        Some(Commands::Prune { max }) => jobs::cmd_prune(&cli.host, cli.port, *max).await,
        Some(Commands::Runners { json }) => {
            runners::cmd_runners(&cli.host, cli.port, *json).await
        }
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Set { vars, runner } => {
                runners::cmd_config_set(&cli.host, cli.port, vars, runner.as_deref()).await
            }
            ConfigCommands::Show { runner } => {
                runners::cmd_config_show(&cli.host, cli.port, runner.as_deref()).await
            }
        },
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
