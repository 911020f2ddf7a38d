//! Conversation Bot Demo
//!
//! A small sign-up dialog driven by JSON-lines updates on stdin. Replies are
//! written to stdout as JSON lines, logs go to stderr.
//!
//! ```text
//! /start ──▶ NAME ──text──▶ AGE ──digits──▶ CONFIRM ──callback "yes"/"no"──▶ end
//!                 /cancel from any state ends the dialog
//! ```
//!
//! Conversation states and user data are kept in a JSON file, so stopping the
//! bot in the middle of the dialog and starting it again picks up where it
//! left off.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package conversation-bot -- --state bot.json <<'EOF'
//! {"update_id":1,"kind":"message","chat_id":1,"user_id":7,"text":"/start"}
//! {"update_id":2,"kind":"message","chat_id":1,"user_id":7,"text":"Ada"}
//! {"update_id":3,"kind":"message","chat_id":1,"user_id":7,"text":"36"}
//! {"update_id":4,"kind":"callback_query","chat_id":1,"user_id":7,"message_id":3,"callback_data":"yes"}
//! EOF
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use switchboard::prelude::*;
use switchboard::runtime::config::{LogOutput, PersistenceBackend};
use switchboard::runtime::{ConfigLoader, SwitchboardConfig};
use switchboard::framework::UpdateSender;

#[derive(Debug, Parser)]
#[command(about = "Sign-up dialog over JSON-lines on stdin")]
struct Args {
    /// Configuration file. Defaults to searching for switchboard.toml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persistence file. Overrides the configured backend.
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// End idle dialogs after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

// ============================================================================
// Replies
// ============================================================================

/// Writes a reply line for the chat (or user) the update came from.
fn reply(update: &BoxedUpdate, text: &str) {
    let line = json!({
        "chat_id": update.chat_id(),
        "user_id": update.user_id(),
        "text": text,
    });
    println!("{line}");
}

/// Increments a counter in a data namespace.
fn bump(data: &SharedData, key: &str) {
    let mut data = data.lock();
    let count = data.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    data.insert(key.to_string(), json!(count + 1));
}

// ============================================================================
// Dialog
// ============================================================================

fn sign_up(timeout: Option<Duration>) -> Result<ConversationHandler> {
    let start = CommandHandler::new("start", |update: BoxedUpdate, _ctx: CallbackContext| async move {
        reply(&update, "Hi! What is your name?");
        "NAME"
    })?;

    let name = MessageHandler::new(
        filters::text() & !filters::command(),
        |update: BoxedUpdate, ctx: CallbackContext| async move {
            let name = update.text().unwrap_or_default().trim().to_string();
            if let Some(data) = ctx.user_data() {
                data.insert("name", json!(name));
            }
            reply(&update, &format!("Nice to meet you, {name}. How old are you?"));
            "AGE"
        },
    );

    let age = MessageHandler::new(
        filters::regex(r"^\s*(?P<age>\d{1,3})\s*$")?,
        |update: BoxedUpdate, ctx: CallbackContext| async move {
            let age: u32 = ctx
                .matches()
                .first()
                .and_then(|m| m.name("age"))
                .and_then(|age| age.parse().ok())
                .ok_or("age capture missing")?;
            if let Some(data) = ctx.user_data() {
                data.insert("age", json!(age));
            }
            reply(&update, "Save this profile? (yes / no)");
            Ok::<_, BoxError>("CONFIRM")
        },
    );

    let bad_age = MessageHandler::new(
        filters::text() & !filters::command(),
        |update: BoxedUpdate, _ctx: CallbackContext| async move {
            reply(&update, "Please send your age as a number.");
        },
    );

    let confirm = CallbackQueryHandler::new(|update: BoxedUpdate, ctx: CallbackContext| async move {
        let saved = update.callback_data() == Some("yes");
        if let Some(data) = ctx.user_data() {
            data.insert("confirmed", json!(saved));
        }
        if saved {
            bump(ctx.bot_data(), "sign_ups");
        }
        reply(&update, if saved { "Saved. Bye!" } else { "Discarded. Bye!" });
        Transition::End
    })
    .pattern("^(yes|no)$")?;

    let cancel = CommandHandler::new("cancel", |update: BoxedUpdate, _ctx: CallbackContext| async move {
        reply(&update, "Cancelled.");
        Transition::End
    })?;

    let timed_out = UpdateHandler::any(|update: BoxedUpdate, _ctx: CallbackContext| async move {
        reply(&update, "You took too long, send /start to try again.");
    });

    let mut builder = ConversationHandler::builder()
        .entry_point(start)
        .state("NAME", [into_handler(name)])
        .state("AGE", [into_handler(age), into_handler(bad_age)])
        .state("CONFIRM", [into_handler(confirm)])
        .fallback(cancel)
        .timeout_handler(timed_out)
        .allow_reentry(true)
        .name("sign_up")
        .persistent(true);
    if let Some(timeout) = timeout {
        builder = builder.conversation_timeout(timeout);
    }
    Ok(builder.build()?)
}

// ============================================================================
// Transport
// ============================================================================

/// Feeds stdin lines to the dispatcher until EOF.
async fn read_stdin(sender: UpdateSender) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0u64;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<BasicUpdate>(&line) {
            Ok(update) => {
                sender.send(update.into_boxed()).await?;
                count += 1;
            }
            Err(e) => warn!(error = %e, "Skipping malformed update line"),
        }
    }
    info!(count, "stdin closed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut defaults = SwitchboardConfig::default();
    // stdout carries replies.
    defaults.logging.output = LogOutput::Stderr;
    defaults.persistence.backend = PersistenceBackend::File;
    defaults.persistence.path = Some(PathBuf::from("conversation_bot.json"));

    let mut loader = ConfigLoader::new().with_current_dir().merge(defaults);
    if let Some(path) = &args.config {
        loader = loader.file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;
    if let Some(state) = args.state {
        config.persistence.backend = PersistenceBackend::File;
        config.persistence.path = Some(state);
    }

    let runtime = Runtime::from_config(&config).await?;

    runtime
        .add_handler(0, sign_up(args.timeout_secs.map(Duration::from_secs))?)
        .await?;
    // Group 1 sees every update, whatever group 0 did with it.
    runtime
        .add_handler(
            1,
            UpdateHandler::any(|_update: BoxedUpdate, ctx: CallbackContext| async move {
                bump(ctx.bot_data(), "updates");
            }),
        )
        .await?;
    runtime
        .add_error_handler(|ctx: CallbackContext| async move {
            let source = ctx.error_source().map(ToString::to_string).unwrap_or_default();
            match ctx.error() {
                Some(error) => warn!(%source, %error, "Callback failed"),
                None => warn!(%source, "Callback failed"),
            }
        })
        .await?;

    let sender = runtime
        .update_sender()
        .await
        .context("runtime already started")?;
    let transport = tokio::spawn(read_stdin(sender));

    runtime.run().await?;
    transport.await??;

    let stats = runtime.stats().await;
    info!(dead_letters = stats.dead_letters, "Bye");
    Ok(())
}
