//! Line-oriented stdio host used by the `deckpair-server` binary.
//!
//! A parent process (the device plugin) drives the server over the child's
//! standard streams:
//!
//! ```text
//! stdin  ──► {"action":"pong","volume":3}        one broadcast per line
//! stdout ◄── {"event":"connectivity","connected":true}
//!            {"event":"settings","payload":{"action":"ping"}}
//! ```
//!
//! Logs go to stderr, so stdout carries nothing but host events.

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::application::{Broadcaster, HostEvent};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("broadcast line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("broadcast line must be a JSON object")]
    NotAnObject,

    #[error("broadcast line has no string `action`")]
    MissingAction,
}

/// Splits one stdin line into a broadcast `(action, fields)`.
///
/// Blank lines yield `Ok(None)`.
pub fn parse_broadcast_line(line: &str) -> Result<Option<(String, Map<String, Value>)>, RelayError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let Value::Object(mut fields) = serde_json::from_str::<Value>(line)? else {
        return Err(RelayError::NotAnObject);
    };
    let Some(Value::String(action)) = fields.remove("action") else {
        return Err(RelayError::MissingAction);
    };
    Ok(Some((action, fields)))
}

/// Pumps host events to stdout and stdin lines into `broadcaster` until the
/// event channel closes.  Stdin reaching EOF only stops the broadcast side.
///
/// # Errors
///
/// Returns an error if writing to stdout fails.
pub async fn run_stdio_relay(
    mut events: mpsc::UnboundedReceiver<HostEvent>,
    broadcaster: Broadcaster,
) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let mut text = serde_json::to_string(&event)?;
                text.push('\n');
                stdout.write_all(text.as_bytes()).await?;
                stdout.flush().await?;
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => relay_line(&line, &broadcaster),
                    Ok(None) => {
                        debug!("stdin closed; broadcasts disabled");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin read failed: {e}; broadcasts disabled");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    Ok(())
}

fn relay_line(line: &str, broadcaster: &Broadcaster) {
    match parse_broadcast_line(line) {
        Ok(Some((action, fields))) => match broadcaster.broadcast(&action, fields) {
            Ok(report) => debug!(
                action = %action,
                delivered = report.delivered,
                skipped = report.skipped(),
                "stdin broadcast"
            ),
            Err(e) => warn!("broadcast rejected: {e}"),
        },
        Ok(None) => {}
        Err(e) => warn!("ignoring stdin line: {e}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
