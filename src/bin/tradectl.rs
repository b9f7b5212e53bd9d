use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use trade_controller::protocol::{Command, RpcClient};
use trade_controller::{Error, RedisBus, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send one command to the trade controller")]
struct Cli {
    /// Settings file (TOML); defaults to controller.toml if present
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reply deadline in milliseconds (defaults to workers.request_timeout_ms)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Publish the command and exit without waiting for a reply
    #[arg(long)]
    no_wait: bool,

    #[command(subcommand)]
    command: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Start a strategy for an owner and symbol
    Start {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "default")]
        strategy: String,
        /// Allocation that enables quantity/balance accounting
        #[arg(long)]
        fund: Option<f64>,
    },
    Stop {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        symbol: String,
    },
    Status {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        symbol: String,
    },
    Balance {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        symbol: String,
    },
    /// Symbols running for one owner
    List {
        #[arg(long)]
        owner: String,
    },
    /// Every running instance
    ListAll,
    StopAll,
    /// Add a BASE/QUOTE pair to the feed's symbol list
    AddCoin { coin: String },
    Shutdown,
    /// Report whether the controller is accepting commands
    Alive,
}

impl Action {
    fn to_command(&self) -> Option<Command> {
        let command = match self {
            Action::Start {
                owner,
                symbol,
                strategy,
                fund,
            } => {
                let command = Command::new("start").owner(owner).symbol(symbol).strategy(strategy);
                match fund {
                    Some(amount) => command.fund_amnt(*amount),
                    None => command,
                }
            }
            Action::Stop { owner, symbol } => Command::new("stop").owner(owner).symbol(symbol),
            Action::Status { owner, symbol } => Command::new("status").owner(owner).symbol(symbol),
            Action::Balance { owner, symbol } => {
                Command::new("get_balance").owner(owner).symbol(symbol)
            }
            Action::List { owner } => Command::new("list").owner(owner),
            Action::ListAll => Command::new("list_all"),
            Action::StopAll => Command::new("stop_all"),
            Action::AddCoin { coin } => Command::new("add_coin").coin(coin),
            Action::Shutdown => Command::new("shutdown"),
            Action::Alive => return None,
        };
        Some(command)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    let timeout = cli
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.workers.request_timeout());

    let bus = Arc::new(
        RedisBus::new(&settings.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );
    let client = RpcClient::new(bus, timeout);

    let Some(command) = cli.command.to_command() else {
        let alive = client.is_alive().await?;
        println!("{}", if alive { "alive" } else { "not running" });
        return Ok(());
    };

    if cli.no_wait {
        client.send(command).await?;
        println!("sent");
        return Ok(());
    }

    match client.request(command).await {
        Ok(reply) => {
            println!("{}", serde_json::to_string_pretty(&reply)?);
            if !reply.ok {
                std::process::exit(1);
            }
        }
        Err(Error::Timeout) => {
            eprintln!("No reply within {:?} (is the controller running?)", timeout);
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
