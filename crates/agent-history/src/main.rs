// agent-history/crates/agent-history/src/main.rs

#[cfg(feature = "cli")]
use agent_history::{
    config::Config,
    memory::{ChatStorage, ConversationKey, ConversationMessage, ParticipantRole},
    memory_db::{DurableChatStorage, SqliteItemTable},
    telemetry,
};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand, ValueEnum};
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "agent-history")]
#[command(version, about = "Inspect and maintain stored agent conversation history", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Commands {
    /// Append a message to one agent's conversation.
    Save {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        agent: String,
        #[arg(long, value_enum)]
        role: RoleArg,
        /// Message text.
        text: String,
        /// Window applied after the append.
        #[arg(long)]
        max: Option<usize>,
    },

    /// Show one agent's conversation.
    History {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        max: Option<usize>,
    },

    /// Show every agent's conversation in the session, merged in write order.
    All {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
    },

    /// Show the session summary.
    Summary {
        #[arg(long)]
        user: String,
        #[arg(long)]
        session: String,
    },

    /// Delete items whose expiry has passed.
    PurgeExpired,

    /// Print item table statistics.
    Stats,
}

#[cfg(feature = "cli")]
#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    User,
    Assistant,
}

#[cfg(feature = "cli")]
impl From<RoleArg> for ParticipantRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::User => ParticipantRole::User,
            RoleArg::Assistant => ParticipantRole::Assistant,
        }
    }
}

#[cfg(feature = "cli")]
fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(telemetry::filter_for_verbosity(cli.verbose));

    let cfg = Config::from_env()?;
    cfg.print_config();

    let mut table = SqliteItemTable::new(&cfg.database_path, cfg.pool_size)?;
    if let Some(attribute) = &cfg.ttl_attribute {
        table = table.with_ttl_attribute(attribute);
    }
    let table = Arc::new(table);
    let store = || DurableChatStorage::new(table.clone(), cfg.store_options());

    match cli.command {
        Commands::Save { user, session, agent, role, text, max } => {
            let key = ConversationKey::new(user, session, agent);
            let message = ConversationMessage::new(role.into(), text);
            print_json(&store().save_chat_message(&key, message, max).await?)
        }
        Commands::History { user, session, agent, max } => {
            let key = ConversationKey::new(user, session, agent);
            print_json(&store().fetch_chat(&key, max).await?)
        }
        Commands::All { user, session } => {
            print_json(&store().fetch_all_chats(&user, &session).await?)
        }
        Commands::Summary { user, session } => {
            print_json(&store().fetch_summary(&user, &session).await?)
        }
        Commands::PurgeExpired => {
            let purged = table.purge_expired()?;
            print_json(&serde_json::json!({ "purged": purged }))
        }
        Commands::Stats => {
            let stats = table.get_stats()?;
            print_json(&serde_json::json!({
                "total_items": stats.total_items,
                "expiring_items": stats.expiring_items,
                "database_size_bytes": stats.database_size_bytes,
            }))
        }
    }
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
