#![allow(dead_code)]
use anyhow::Result;
use api::*;
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use secp256k1::rand;

use crate::client::{Client, WebhookDelivery};

mod api;
mod client;
mod signature;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,
}
#[derive(Subcommand)]
enum Commands {
    Health,
    Active {
        #[arg(short, long)]
        channel: String,
    },
    /// Connect a streamer with an OAuth code (`test-code` in `--test` mode)
    Connect {
        #[arg(short, long)]
        code: String,
        #[arg(short, long)]
        redirect_uri: String,
        #[arg(short, long)]
        wallet: String,
    },
    /// Post a signed EventSub notification to the server
    Trigger {
        #[arg(value_enum)]
        kind: TriggerKind,
        #[arg(short, long)]
        secret: String,
        #[arg(short, long, default_value = "12345")]
        channel: String,
        #[arg(short, long)]
        prediction: String,
        /// Winning outcome id for `end`, `o1` or `o2`. Cancels when omitted.
        #[arg(short, long)]
        winner: Option<String>,
    },
}
#[derive(Clone, Copy, ValueEnum)]
enum TriggerKind {
    Begin,
    Lock,
    End,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let client = Client::new(cli.url);

    match cli.command {
        Commands::Health => {
            let health = client.health().await?;
            println!("{:#?}", health);
        }
        Commands::Active { channel } => match client.active_market(&channel).await? {
            Some(prediction) => println!("{:#?}", prediction),
            None => println!("No active market for channel {}", channel),
        },
        Commands::Connect {
            code,
            redirect_uri,
            wallet,
        } => {
            let request = ConnectStreamerRequest {
                code,
                redirect_uri,
                wallet_address: wallet,
            };
            let profile = client.connect_streamer(request).await?;
            println!("Connected {:#?}", profile);
        }
        Commands::Trigger {
            kind,
            secret,
            channel,
            prediction,
            winner,
        } => {
            let delivery = signed_notification(&secret, kind, &channel, &prediction, winner)?;
            let message_id = delivery.message_id.clone();
            let response = client.send_webhook(&delivery).await?;
            println!(
                "{} {} -> {}",
                delivery.subscription_type,
                message_id,
                response.status()
            );
        }
    }
    Ok(())
}

fn outcomes() -> Vec<PredictionOutcome> {
    vec![
        PredictionOutcome {
            id: "o1".to_string(),
            title: "Yes".to_string(),
            color: "blue".to_string(),
            users: None,
            channel_points: None,
        },
        PredictionOutcome {
            id: "o2".to_string(),
            title: "No".to_string(),
            color: "pink".to_string(),
            users: None,
            channel_points: None,
        },
    ]
}

fn signed_notification(
    secret: &str,
    kind: TriggerKind,
    channel: &str,
    prediction: &str,
    winner: Option<String>,
) -> Result<WebhookDelivery> {
    let now = Utc::now();
    let title = "Test prediction".to_string();
    let (subscription_type, event) = match kind {
        TriggerKind::Begin => (
            PREDICTION_BEGIN,
            serde_json::to_value(PredictionBeginEvent {
                id: prediction.to_string(),
                broadcaster_user_id: channel.to_string(),
                broadcaster_user_login: channel.to_string(),
                broadcaster_user_name: channel.to_string(),
                title,
                outcomes: outcomes(),
                started_at: now,
                locks_at: now + Duration::minutes(2),
            })?,
        ),
        TriggerKind::Lock => (
            PREDICTION_LOCK,
            serde_json::to_value(PredictionLockEvent {
                id: prediction.to_string(),
                broadcaster_user_id: channel.to_string(),
                broadcaster_user_login: channel.to_string(),
                broadcaster_user_name: channel.to_string(),
                title,
                outcomes: outcomes(),
                started_at: now - Duration::minutes(2),
                locked_at: now,
            })?,
        ),
        TriggerKind::End => (
            PREDICTION_END,
            serde_json::to_value(PredictionEndEvent {
                id: prediction.to_string(),
                broadcaster_user_id: channel.to_string(),
                broadcaster_user_login: channel.to_string(),
                broadcaster_user_name: channel.to_string(),
                title,
                status: match winner {
                    Some(_) => PredictionEndStatus::Resolved,
                    None => PredictionEndStatus::Canceled,
                },
                winning_outcome_id: winner,
                outcomes: outcomes(),
                started_at: now - Duration::minutes(5),
                ended_at: now,
            })?,
        ),
    };
    let body = serde_json::json!({
        "subscription": {
            "id": format!("cli-{}", channel),
            "status": "enabled",
            "type": subscription_type,
            "version": "1",
            "condition": {"broadcaster_user_id": channel},
        },
        "event": event,
    })
    .to_string();
    let message_id = format!("{:016x}", rand::random::<u64>());
    let timestamp = now.to_rfc3339();
    Ok(WebhookDelivery {
        signature: signature::sign(secret, &message_id, &timestamp, body.as_bytes()),
        message_id,
        message_type: EventSubMessageType::Notification,
        timestamp,
        subscription_type: subscription_type.to_string(),
        body,
    })
}
