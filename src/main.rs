use chatrelay::backend::BackendClient;
use chatrelay::client::{ChatClient, EntryStatus, RelayApiClient};
use chatrelay::main_helper::{ChatArgs, Command, ServeArgs};
use chatrelay::poller::PollStop;
use chatrelay::tags::{split_parts, unescape_display, MessagePart};
use chatrelay::{AppState, Args};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let to_stderr = matches!(args.command, Command::Serve(_));
    let _guard = chatrelay::logging::init_tracing(&args.log_dir, to_stderr);
    chatrelay::logging::setup_panic_hook();

    match &args.command {
        Command::Serve(serve) => run_server(&args.backend_url, serve).await,
        Command::Chat(chat) => run_chat(chat).await,
    }
}

async fn run_server(backend_url: &str, args: &ServeArgs) {
    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        backend: BackendClient::new(
            client,
            backend_url,
            Duration::from_secs(args.request_timeout_secs),
        ),
        relay_config: args.relay_config(),
        max_body_size: args.max_body_size,
    });
    let app = chatrelay::server::router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("chatrelay listening on {} (backend {})", addr, backend_url);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }
}

async fn run_chat(args: &ChatArgs) {
    let api = RelayApiClient::new(reqwest::Client::new(), args.relay_url.clone());
    let mut chat = ChatClient::new(api, args.poller_config());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!(
        "{} {}",
        "chatrelay".bold(),
        format!("({}) /status, /plan, /quit", args.relay_url).dimmed()
    );

    loop {
        let prompt = if chat.is_awaiting_reply() { "reply> " } else { "you> " };
        print!("{}", prompt.cyan().bold());
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}", format!("stdin error: {}", e).red());
                break;
            }
        };
        let text = line.trim();
        match text {
            "" => continue,
            "/quit" | "/exit" => break,
            "/status" => {
                match chat.status().await {
                    Ok(Some(status)) => println!(
                        "{} [{}] goal: {} | agent: {} | active: {}",
                        "status".yellow(),
                        chat.session_id().map(|id| id.short()).unwrap_or("-"),
                        status.goal,
                        status.current_agent,
                        status.is_active
                    ),
                    Ok(None) => println!("{}", "No conversation yet".dimmed()),
                    Err(e) => println!("{}", format!("Status unavailable: {}", e).red()),
                }
                continue;
            }
            "/plan" => {
                print_plan(&chat);
                continue;
            }
            _ => {}
        }

        let cancel = CancellationToken::new();
        let watcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let shown = chat.transcript().len();
        if chat.is_awaiting_reply() {
            match chat.respond(text, &cancel).await {
                Ok(outcome) => {
                    print_new_entries(&chat, shown);
                    match outcome.stop {
                        PollStop::Idle | PollStop::TimedOut => println!(
                            "{}",
                            "(no more output for now, use /status to check on the run)".dimmed()
                        ),
                        PollStop::Cancelled => println!("{}", "(stopped)".dimmed()),
                        _ => {}
                    }
                }
                Err(e) => {
                    print_new_entries(&chat, shown);
                    tracing::debug!("respond failed: {}", e);
                }
            }
        } else {
            match chat.send(text, &cancel).await {
                Ok(outcome) => {
                    print_new_entries(&chat, shown);
                    if outcome.cancelled {
                        println!("{}", "(stopped)".dimmed());
                    }
                }
                Err(e) => {
                    print_new_entries(&chat, shown);
                    tracing::debug!("send failed: {}", e);
                }
            }
        }
        watcher.abort();
    }
}

fn print_new_entries(chat: &ChatClient, from: usize) {
    for entry in chat.transcript().iter().skip(from) {
        if entry.role != chatrelay::Role::Assistant {
            continue;
        }
        match entry.status {
            EntryStatus::Error => println!("{}", unescape_display(&entry.content).red()),
            EntryStatus::Cancelled => println!("{}", "(cancelled)".dimmed()),
            EntryStatus::Streaming => {}
            EntryStatus::Complete => {
                let text = unescape_display(&entry.content);
                for part in split_parts(&text) {
                    match part {
                        MessagePart::Text(t) => println!("{}", t),
                        MessagePart::Thinking { artefact_id } => {
                            println!("{}", format!("[thinking: {}]", artefact_id).dimmed())
                        }
                        MessagePart::Artefact { kind, artefact_id } => {
                            println!("{}", format!("[{}: {}]", kind, artefact_id).blue())
                        }
                    }
                }
            }
        }
    }
}

fn print_plan(chat: &ChatClient) {
    let Some(plan) = chat.plan().current() else {
        println!("{}", "No plan yet".dimmed());
        return;
    };
    println!("{} {} ({:?})", "plan".yellow(), plan.goal, plan.overall_status);
    for asset in &plan.assets {
        println!("  {:<24} {:?}", asset.name, asset.status);
    }
}
