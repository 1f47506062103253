//! Console command surface
//! Reads command lines from stdin and prints engine notifications

use order_executor::api::search_instruments;
use order_executor::commands::HELP;
use order_executor::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::init::Simulation;

/// Read stdin on a plain thread; a blocking read must not hold the runtime open on shutdown
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("stdin closed: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

/// Print every notification until the engine drops its sender
pub async fn print_notifications(mut notifications: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = notifications.recv().await {
        println!("{}\n", notification);
    }
    debug!("Notification channel closed");
}

/// Dispatch command lines until `/quit`, end of input or shutdown
pub async fn run_console(
    handle: EngineHandle,
    broker: Arc<dyn BrokerGateway>,
    preferences: PreferencesManager,
    simulation: Option<Simulation>,
    cancel: CancellationToken,
) {
    let mut lines = spawn_stdin_reader();
    let mut book = SymbolBook::new();
    println!("Type /help for commands");

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("/quit") {
            cancel.cancel();
            break;
        }

        match parse_intent_with(line, &book) {
            Ok(Intent::Search { text }) => println!("{}\n", search(broker.as_ref(), &text, &mut book).await),
            Ok(intent) => {
                if let Some(reply) = dispatch(intent, &handle, &preferences, simulation.as_ref()).await {
                    println!("{}\n", reply);
                }
            }
            Err(e) => println!("❌ {}\n", e),
        }
    }
}

/// Look a name up and remember the matches for `/long SYMBOL`
async fn search(broker: &dyn BrokerGateway, text: &str, book: &mut SymbolBook) -> String {
    match search_instruments(broker, text).await {
        Ok(found) if found.is_empty() => {
            "❌ No matching symbols found. Try the full company name or symbol.".to_string()
        }
        Ok(found) => {
            book.remember(&found);
            let mut reply = format!("✅ {} match(es), trade with /long SYMBOL or /short SYMBOL:", found.len());
            for instrument in &found {
                reply.push_str(&format!(
                    "\n  {}  ({}:{}:{})",
                    instrument.symbol, instrument.exchange, instrument.token, instrument.symbol
                ));
            }
            reply
        }
        Err(e) => format!("❌ Search failed: {}", e),
    }
}

async fn dispatch(
    intent: Intent,
    handle: &EngineHandle,
    preferences: &PreferencesManager,
    simulation: Option<&Simulation>,
) -> Option<String> {
    let reply = match intent {
        // The engine sends its own notification for placed or rejected entries
        Intent::Open(request) => match handle.open(request).await {
            Ok(_) => return None,
            Err(TradingError::OrderRejected { .. }) => return None,
            Err(e) => format!("❌ {}", e),
        },
        Intent::Modify {
            position_ref,
            stop_loss_pct,
            target_pct,
        } => match handle.update_thresholds(&position_ref, stop_loss_pct, target_pct).await {
            Ok(view) => format!("✅ Thresholds updated\n{}", view),
            Err(e) => format!("❌ {}", e),
        },
        Intent::Exit { position_ref } => match handle.exit(&position_ref).await {
            Ok(ExitRequest::Submitted { order_ref }) => format!("📤 Exit order {} placed", order_ref),
            Ok(ExitRequest::AlreadyExiting) => "⏳ Exit already in progress".to_string(),
            Err(e) => format!("❌ {}", e),
        },
        Intent::Cancel { position_ref } => match handle.cancel(&position_ref).await {
            Ok(()) => format!("🛑 Cancel requested for {}", position_ref),
            Err(e) => format!("❌ {}", e),
        },
        Intent::Status => match handle.status().await {
            Ok(report) => report.to_string(),
            Err(e) => format!("❌ {}", e),
        },
        Intent::Preferences(updates) if updates.is_empty() => {
            let mut reply = format!("⚙️ {}", preferences.summary().await);
            if !preferences.has_complete().await {
                reply.push_str("\nSet capital=, sl= and tgt= to trade without per-order options");
            }
            reply
        }
        Intent::Preferences(updates) => match preferences.update(updates).await {
            Ok(saved) => format!("✅ Preferences saved\n{}", saved.summary()),
            Err(e) => format!("❌ {}", e),
        },
        Intent::Tick { instrument_key, price } => match simulation {
            Some(simulation) => {
                simulation.broker.set_quote_key(&instrument_key, price).await;
                if simulation.feed.push_tick(&instrument_key, price).await {
                    return None;
                }
                format!("Quote for {} set to {} (not monitored)", instrument_key, price)
            }
            None => "❌ /tick is only available in simulation mode".to_string(),
        },
        Intent::Search { .. } => return None,
        Intent::Help => HELP.to_string(),
    };
    Some(reply)
}
