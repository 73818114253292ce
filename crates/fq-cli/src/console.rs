//! Console consumer for the output channel.

use std::io::{self, Write};

use tokio::task::JoinHandle;

use fq_core::{EventKind, EventReceiver, OutputEvent};

const RULE_WIDTH: usize = 80;

/// Render one event.
///
/// Stream fragments are written raw so a reply reads as continuous text;
/// wiki extracts are framed by rules; everything else gets a timestamped line.
pub fn render_event<W: Write>(out: &mut W, event: &OutputEvent) -> io::Result<()> {
    match event.kind {
        EventKind::Stream => write!(out, "{}", event.content)?,
        EventKind::Wiki => {
            let rule = "=".repeat(RULE_WIDTH);
            write!(out, "\n{rule}\n{}\n{rule}\n\n", event.content)?;
        }
        kind => writeln!(
            out,
            "\n[{}] {}: {}",
            event.timestamp.format("%H:%M:%S"),
            kind,
            event.content
        )?,
    }
    out.flush()
}

/// Spawn the single consumer. It runs until every sender is dropped and the
/// channel has been drained.
pub fn spawn_console(mut rx: EventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            if let Err(e) = render_event(&mut out, &event) {
                tracing::warn!(error = %e, "Console output failed, dropping remaining events");
                break;
            }
        }
    })
}
