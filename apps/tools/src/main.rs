use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{CallId, ConversationId},
    protocol::CallRecord,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Newest calls first, optionally for one conversation.
    ListCalls {
        #[arg(long)]
        conversation_id: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    ShowCall {
        call_id: i64,
    },
    CreateUser {
        username: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ListCalls {
            conversation_id,
            limit,
        } => {
            let calls = match conversation_id {
                Some(id) => {
                    storage
                        .list_calls_for_conversation(ConversationId(id), limit, None)
                        .await?
                }
                None => storage.list_recent_calls(limit).await?,
            };
            for call in &calls {
                println!("{}", summary_line(call));
            }
        }
        Command::ShowCall { call_id } => {
            let record = storage
                .load_call(CallId(call_id))
                .await?
                .ok_or_else(|| anyhow!("call {call_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::CreateUser { username } => {
            let user_id = storage.create_user(&username).await?;
            println!("user_id={}", user_id.0);
        }
    }

    Ok(())
}

fn summary_line(call: &CallRecord) -> String {
    let duration = call
        .duration_seconds
        .map(|secs| format!("{secs}s"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "call_id={} conversation_id={} {} {} initiator={} answered={:?} missed={:?} duration={}",
        call.call_id,
        call.conversation_id,
        call.call_type.as_str(),
        call.status.as_str(),
        call.initiator_id,
        call.answered_by().iter().map(|id| id.0).collect::<Vec<_>>(),
        call.missed_by().iter().map(|id| id.0).collect::<Vec<_>>(),
        duration,
    )
}
