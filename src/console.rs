//! Operator quit surface: a blocking console prompt plus Ctrl+C.

use log::{debug, info, warn};
use std::io::{self, BufRead, Write};
use tokio::sync::oneshot;

pub const QUIT_PROMPT: &str = "Press Q to quit";

pub fn is_quit_command(line: &str) -> bool {
    matches!(line.trim(), "Q" | "q")
}

/// Prompts until a quit command is read.
///
/// Returns `Ok(false)` if the input ends first.
pub fn wait_for_quit<R: BufRead, W: Write>(mut input: R, mut output: W) -> io::Result<bool> {
    let mut line = String::new();
    loop {
        writeln!(output, "{}", QUIT_PROMPT)?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        if is_quit_command(&line) {
            writeln!(output, "Quitting...")?;
            return Ok(true);
        }
    }
}

/// Reads stdin on a dedicated thread so the async scheduler never blocks on it.
///
/// The receiver resolves with `Ok(())` on quit; the sender is dropped if stdin
/// closes or cannot be read.
pub fn spawn_quit_listener() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("quit-listener".to_string())
        .spawn(move || match wait_for_quit(io::stdin().lock(), io::stdout()) {
            Ok(true) => {
                let _ = tx.send(());
            }
            Ok(false) => debug!("stdin closed, console quit disabled"),
            Err(e) => warn!("Reading stdin failed: {}", e),
        });

    if let Err(e) = spawned {
        warn!("Could not start the quit listener: {}", e);
    }
    rx
}

/// Resolves when the operator asks to quit, via the console or Ctrl+C.
pub async fn quit_signal() {
    let console = spawn_quit_listener();
    let console = async {
        if console.await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, quitting"),
            Err(e) => {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = console => {}
        _ = interrupt => {}
    }
}
