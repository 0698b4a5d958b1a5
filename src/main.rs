use std::io::Write;
use std::sync::Arc;

use streamchat::api::HttpChatApi;
use streamchat::db::{spawn_persistence, StateCache};
use streamchat::models::MessageRole;
use streamchat::service::{hydrate, ChatService, SessionState};
use streamchat::stream::HttpStreamTransport;
use streamchat::{AppConfig, ChatState};
use tracing::{info, warn};

/// Echoes the assistant reply to stdout as chunks land in the store.
#[derive(Default)]
struct ReplyEcho {
    message_id: Option<String>,
    printed: usize,
}

impl ReplyEcho {
    fn show(&mut self, state: &ChatState) {
        let Some(reply) = state
            .current_messages()
            .last()
            .filter(|m| m.role == MessageRole::Assistant)
        else {
            return;
        };
        if self.message_id.as_deref() != Some(reply.id.as_str()) {
            self.message_id = Some(reply.id.clone());
            self.printed = 0;
        }
        // Completion strips the documents block, so the content can shrink.
        if let Some(delta) = reply.content.get(self.printed..) {
            print!("{delta}");
            let _ = std::io::stdout().flush();
            self.printed = reply.content.len();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamchat=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("usage: streamchat <message>");
    }

    let config = AppConfig::from_env()?;
    info!("Using API {} and stream {}", config.api_base_url, config.stream_url);

    // ── Store ────────────────────────────────────────────────────────────────
    let api = Arc::new(HttpChatApi::new(&config.api_base_url));
    let cache = config.cache_dir.as_ref().map(StateCache::new);
    let store = hydrate(cache.as_ref(), api.as_ref()).await;
    let persistence = cache.map(|cache| spawn_persistence(&store, cache));

    // ── Session ──────────────────────────────────────────────────────────────
    let service = Arc::new(
        ChatService::new(store.clone(), HttpStreamTransport::new(&config.stream_url))
            .with_api(api)
            .with_parser_config(config.parser)
            .with_title_max_chars(config.title_max_chars),
    );

    let canceller = tokio::spawn({
        let service = service.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                service.cancel();
            }
        }
    });

    let mut rx = store.subscribe();
    let mut echo = ReplyEcho::default();
    let report = {
        let send = service.send_user_message(&prompt);
        tokio::pin!(send);
        loop {
            tokio::select! {
                report = &mut send => break report?,
                Ok(()) = rx.changed() => echo.show(&rx.borrow_and_update()),
            }
        }
    };
    echo.show(&store.snapshot());
    println!();

    match &report.state {
        SessionState::Completed => {
            let reply = store.read(|s| {
                s.conversation(&report.conversation_id)
                    .and_then(|c| c.message(&report.message_id))
                    .cloned()
            });
            if let Some(reply) = reply {
                for doc in &reply.document_references {
                    println!("[source] {}", doc.filename);
                }
                for question in &reply.related_questions {
                    println!("[related] {question}");
                }
            }
        }
        SessionState::Cancelled => info!("Reply cancelled"),
        SessionState::Errored(message) => warn!("Reply failed: {message}"),
        other => warn!("Session ended in unexpected state {other}"),
    }

    // Drop every store handle so the persistence task flushes and exits.
    canceller.abort();
    let _ = canceller.await;
    drop(service);
    drop(store);
    if let Some(handle) = persistence {
        handle.await?;
    }

    if let SessionState::Errored(message) = report.state {
        anyhow::bail!(message);
    }
    Ok(())
}
