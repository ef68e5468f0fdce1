use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{
    CallEvent, CallIdentity, CallSessionController, CallState, ConnectionManager,
    HttpCallOrchestrator, MediaSession,
};
use shared::domain::{CallType, ConversationId, UserId};
use tokio::{sync::broadcast, time::Instant};
use tracing_subscriber::EnvFilter;

mod headless;

use headless::HeadlessConnector;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    username: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Users with at least one live connection.
    Online,
    /// Stay connected and print call activity.
    Listen {
        #[arg(long)]
        auto_answer: bool,
    },
    /// Ring one or more users and wait for the call to finish.
    Call {
        #[arg(long)]
        conversation_id: i64,
        #[arg(long = "to", required = true)]
        to: Vec<i64>,
        #[arg(long)]
        video: bool,
        #[arg(long)]
        group_name: Option<String>,
        /// Hang up after this many seconds of conversation.
        #[arg(long)]
        hangup_after: Option<u64>,
    },
    History {
        #[arg(long)]
        conversation_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let Args {
        server_url,
        username,
        command,
    } = Args::parse();

    let orchestrator = Arc::new(HttpCallOrchestrator::new(server_url.clone()));
    let user_id = orchestrator.login(&username).await?;
    println!("Logged in as user_id={}", user_id.0);

    match command {
        Command::Online => {
            let online = orchestrator.online_users().await?;
            let ids: Vec<i64> = online.iter().map(|id| id.0).collect();
            println!("online: {ids:?}");
        }
        Command::History {
            conversation_id,
            limit,
        } => {
            let calls = orchestrator
                .history(user_id, ConversationId(conversation_id), limit, None)
                .await?;
            for call in calls {
                println!(
                    "call_id={} {} {} duration={:?}",
                    call.call_id,
                    call.call_type.as_str(),
                    call.status.as_str(),
                    call.duration_seconds
                );
            }
        }
        Command::Listen { auto_answer } => {
            let controller = connect(&server_url, &username, user_id, orchestrator).await?;
            let mut events = controller.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        controller.end_call().await.ok();
                        break;
                    }
                    event = events.recv() => {
                        let event = match classify(event) {
                            Received::Event(event) => event,
                            Received::Skipped => continue,
                            Received::Closed => break,
                        };
                        print_event(&event);
                        if auto_answer && is_incoming_ring(&controller, &event).await {
                            if let Err(err) = controller.accept_call().await {
                                eprintln!("accept failed: {err}");
                            }
                        }
                    }
                }
            }
        }
        Command::Call {
            conversation_id,
            to,
            video,
            group_name,
            hangup_after,
        } => {
            let controller = connect(&server_url, &username, user_id, orchestrator).await?;
            let mut events = controller.subscribe();
            let call_type = if video { CallType::Video } else { CallType::Audio };
            let is_group = to.len() > 1 || group_name.is_some();
            let call_id = controller
                .initiate_call(
                    ConversationId(conversation_id),
                    to.into_iter().map(UserId).collect(),
                    call_type,
                    is_group,
                    group_name,
                )
                .await?;
            println!("ringing call_id={}", call_id.0);
            run_call(&controller, &mut events, hangup_after.map(Duration::from_secs)).await?;
        }
    }

    Ok(())
}

async fn connect(
    server_url: &str,
    username: &str,
    user_id: UserId,
    orchestrator: Arc<HttpCallOrchestrator>,
) -> Result<Arc<CallSessionController>> {
    let transport = Arc::new(ConnectionManager::new(server_url, user_id));
    transport.connect().await?;
    let controller = CallSessionController::new(
        CallIdentity {
            user_id,
            display_name: username.to_string(),
            picture: None,
        },
        transport,
        orchestrator,
        Arc::new(MediaSession::new(Arc::new(HeadlessConnector))),
    );
    let _ = controller.start();
    Ok(controller)
}

/// Prints events until the call returns to idle, hanging up on timer or ctrl-c.
async fn run_call(
    controller: &Arc<CallSessionController>,
    events: &mut broadcast::Receiver<CallEvent>,
    hangup_after: Option<Duration>,
) -> Result<()> {
    let mut hangup: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                controller.end_call().await?;
                return Ok(());
            }
            _ = sleep_until(hangup), if hangup.is_some() => {
                controller.end_call().await?;
                return Ok(());
            }
            event = events.recv() => {
                let event = match classify(event) {
                    Received::Event(event) => event,
                    Received::Skipped => continue,
                    Received::Closed => bail!("controller stopped"),
                };
                print_event(&event);
                match event {
                    CallEvent::StateChanged { state: CallState::Ongoing, .. } => {
                        if let Some(after) = hangup_after {
                            hangup = Some(Instant::now() + after);
                        }
                    }
                    CallEvent::StateChanged { state: CallState::Idle, .. } => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

enum Received {
    Event(CallEvent),
    Skipped,
    Closed,
}

fn classify(event: Result<CallEvent, broadcast::error::RecvError>) -> Received {
    match event {
        Ok(event) => Received::Event(event),
        Err(broadcast::error::RecvError::Lagged(_)) => Received::Skipped,
        Err(broadcast::error::RecvError::Closed) => Received::Closed,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn is_incoming_ring(controller: &CallSessionController, event: &CallEvent) -> bool {
    if !matches!(
        event,
        CallEvent::StateChanged {
            state: CallState::Ringing,
            ..
        }
    ) {
        return false;
    }
    controller
        .snapshot()
        .await
        .call
        .is_some_and(|call| call.direction == client_core::CallDirection::Incoming)
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged { state, call_id } => {
            println!("state: {state:?} call_id={call_id:?}");
        }
        CallEvent::Notice { notice, .. } => println!("notice: {notice:?}"),
        CallEvent::DurationTick { seconds } => println!("in call: {seconds}s"),
        CallEvent::ParticipantsChanged { participants, .. } => {
            let ids: Vec<i64> = participants.iter().map(|id| id.0).collect();
            println!("participants: {ids:?}");
        }
        CallEvent::ParticipantDeclined {
            user_id, reason, ..
        } => println!("user {user_id} declined ({reason:?})"),
        CallEvent::Error(err) => eprintln!("error: {err}"),
        CallEvent::NoticeCleared | CallEvent::Media(_) => {}
    }
}
