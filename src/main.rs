use chatwire::controller::{ChatController, ControllerStatus, RequestOutcome, RequestState};
use chatwire::history::History;
use chatwire::logging::{init_tracing, setup_panic_hook};
use chatwire::main_helper::build_controller;
use chatwire::types::{Metrics, Role};
use chatwire::Args;
use clap::Parser;
use colored::*;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = match init_tracing(&args.log_config()) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("Failed to initialise logging: {}", e);
            std::process::exit(1);
        }
    };
    setup_panic_hook();

    let controller = match build_controller(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        "chatwire starting: endpoint={} stream={}",
        args.endpoint,
        !args.no_stream
    );

    println!("{}", "chatwire. /help for commands.".bold());
    if controller.settings().model.is_none() {
        println!("{}", "No model selected. Use /model NAME.".yellow());
    }

    let renderer = tokio::spawn(render_loop(
        controller.history().subscribe(),
        controller.subscribe_status(),
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if handle_line(&controller, line.trim()).await == Flow::Quit {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("stdin read failed: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                if controller.is_waiting_for_response() {
                    controller.stop().await;
                } else {
                    break;
                }
            }
        }
    }

    controller.stop().await;
    renderer.abort();
}

async fn handle_line(controller: &ChatController, line: &str) -> Flow {
    if line.is_empty() {
        return Flow::Continue;
    }
    let (command, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" | "/exit" => return Flow::Quit,
        "/help" => print_help(),
        "/stop" => {
            let active = controller.active_request_id();
            match (active, controller.stop().await) {
                (Some(rid), true) => println!("{}", format!("Stopped {}.", rid.short()).dimmed()),
                _ => println!("{}", "Nothing to stop.".dimmed()),
            }
        }
        "/new" => {
            controller.stop().await;
            controller.history().clear();
            println!("{}", "Started a new chat.".dimmed());
        }
        "/metrics" => match controller.latest_metrics() {
            Some(m) => println!("{}", format_metrics(&m)),
            None => println!("{}", "No request yet.".dimmed()),
        },
        "/model" if !rest.is_empty() => {
            let mut settings = controller.settings();
            settings.model = Some(rest.to_string());
            controller.update_settings(settings);
            println!("{} {}", "Model:".dimmed(), rest);
        }
        "/stream" => {
            let mut settings = controller.settings();
            settings.stream = !settings.stream;
            println!("{} {}", "Streaming:".dimmed(), settings.stream);
            controller.update_settings(settings);
        }
        "/history" => print_history(&controller.history().snapshot()),
        "/edit" => {
            let parsed = rest
                .split_once(' ')
                .and_then(|(n, text)| n.parse::<usize>().ok().map(|n| (n, text.trim())));
            match parsed {
                Some((index, text)) => submit(controller, text, Some(index)),
                None => println!("{}", "Usage: /edit N new text".yellow()),
            }
        }
        _ if command.starts_with('/') => {
            println!("{} {}", "Unknown command:".yellow(), command);
        }
        _ => submit(controller, line, None),
    }
    Flow::Continue
}

fn submit(controller: &ChatController, text: &str, edit_index: Option<usize>) {
    match controller.submit(text, edit_index) {
        Ok(handle) => tracing::debug!("Submitted request {}", handle.request_id().short()),
        Err(e) => println!("{}", e.to_string().red()),
    }
}

fn print_help() {
    println!("  /model NAME     select the model");
    println!("  /stream         toggle streaming");
    println!("  /stop           stop the running response (also Ctrl-C)");
    println!("  /edit N TEXT    rewrite message N and resend");
    println!("  /history        list messages");
    println!("  /metrics        show metrics of the last response");
    println!("  /new            clear the conversation");
    println!("  /quit           exit");
}

fn print_history(history: &History) {
    for (i, m) in history.iter().enumerate() {
        let role = match m.role {
            Role::User => m.role.to_string().cyan(),
            Role::Assistant => m.role.to_string().green(),
            Role::Error => m.role.to_string().red(),
            Role::System => m.role.to_string().dimmed(),
        };
        println!("[{}] {}: {}", i, role, m.text());
    }
}

fn format_metrics(m: &Metrics) -> String {
    let ttft = match m.time_to_first_token {
        Some(t) => format!("{} ms", t),
        None => "n/a".to_string(),
    };
    format!(
        "{} ms | TTFT {} | {} tokens | {} tok/s{}",
        m.elapsed_time,
        ttft,
        m.completion_tokens,
        m.tokens_per_second,
        if m.error { " | error" } else { "" }
    )
    .dimmed()
    .to_string()
}

/// Prints the growing tail of the conversation as the history store changes.
async fn render_loop(
    mut history: watch::Receiver<History>,
    mut status: watch::Receiver<ControllerStatus>,
) {
    let mut shown: Option<(String, String)> = None;
    loop {
        tokio::select! {
            changed = history.changed() => {
                if changed.is_err() {
                    return;
                }
                let last = history.borrow_and_update().last().cloned();
                let Some(last) = last else {
                    shown = None;
                    continue;
                };
                if last.role == Role::User {
                    continue;
                }
                let text = last.text();
                match shown.as_mut() {
                    Some((id, printed)) if *id == last.unique_id => {
                        match text.strip_prefix(printed.as_str()) {
                            Some(rest) => print!("{}", rest),
                            None => print!("\n{}", text),
                        }
                        *printed = text;
                    }
                    _ => {
                        let label = match last.role {
                            Role::Error => "error> ".red(),
                            _ => "assistant> ".green(),
                        };
                        print!("{}{}", label, text);
                        shown = Some((last.unique_id.clone(), text));
                    }
                }
                let _ = std::io::stdout().flush();
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return;
                }
                let current = status.borrow_and_update().clone();
                if current.state == RequestState::Idle {
                    match current.last_outcome {
                        Some(RequestOutcome::Errored(_)) => println!("\n{}", "(failed)".red()),
                        Some(RequestOutcome::Aborted) => println!("\n{}", "(stopped)".yellow()),
                        _ => println!(),
                    }
                }
            }
        }
    }
}
