//! Terminal chat loop
//!
//! `:1`..`:4` ask an example question, `:retry` re-runs the last one,
//! `:status` shows the connection, `:quit` leaves.

use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::schema::EXAMPLE_QUESTIONS;
use crate::session::{ConnectionStatus, Session, Turn};

/// Plain-text rendering of a turn for the terminal.
pub fn render_turn(turn: &Turn) -> String {
    let mut out = String::new();

    match (turn.explanation(), turn.error()) {
        (Some(explanation), _) => out.push_str(explanation),
        (None, Some(error)) => out.push_str(&format!("Error: {}", error.message)),
        (None, None) => {}
    }

    if let Some(result) = turn.result() {
        if result.is_empty() {
            out.push_str("\n(no matching rows)");
        } else {
            out.push_str(&format!("\n({} rows)", result.total_count));
        }
    }

    if let Some(sql) = turn.sql() {
        out.push_str(&format!("\n\nSQL:\n  {}", sql.replace('\n', "\n  ")));
    }
    out
}

fn status_line(status: ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::Connected => "Connected to BERDL",
        ConnectionStatus::Connecting => "Checking connection...",
        ConnectionStatus::Disconnected => "Disconnected",
        ConnectionStatus::Error => "Connection error",
    }
}

/// Resolve `:N` shortcuts to example questions.
pub fn expand_shortcut(input: &str) -> Option<&'static str> {
    let index: usize = input.strip_prefix(':')?.parse().ok()?;
    EXAMPLE_QUESTIONS.get(index.checked_sub(1)?).copied()
}

pub async fn run(orchestrator: Arc<Orchestrator>, session: Arc<Session>) -> Result<()> {
    println!("BERDL Chat - ask questions about NMDC microbiome data in plain English");
    let status = orchestrator.connect(&session).await;
    println!("[{}]", status_line(status));
    println!("Try these:");
    for (idx, example) in EXAMPLE_QUESTIONS.iter().enumerate() {
        println!("  :{}  {}", idx + 1, example);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        let turn = match input {
            "" => continue,
            ":quit" | ":q" => break,
            ":status" => {
                let snapshot = session.snapshot().await;
                println!(
                    "[{}] {}",
                    status_line(snapshot.status),
                    snapshot.status_detail.unwrap_or_default()
                );
                continue;
            }
            ":retry" => match orchestrator.retry(&session).await {
                Some(turn) => turn,
                None => {
                    println!("Nothing to retry yet.");
                    continue;
                }
            },
            other => {
                let question = expand_shortcut(other).unwrap_or(other);
                if question != other {
                    println!("{}", question);
                }
                orchestrator.handle_question(&session, question).await
            }
        };

        println!("{}", render_turn(&turn));
    }

    orchestrator.disconnect(&session).await;
    Ok(())
}
