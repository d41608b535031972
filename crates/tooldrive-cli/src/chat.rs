//! Terminal chat front-end.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use dialoguer::{Input, Password};
use tokio::sync::mpsc;
use tracing::warn;

use tooldrive_agent::{AgentEvent, Orchestrator, RunOutcome, StopReason};
use tooldrive_core::config::{Config, ProviderKind};
use tooldrive_core::confirm::PendingPrompt;
use tooldrive_core::context::RuntimeContext;
use tooldrive_core::message::{ContentPart, Message};
use tooldrive_core::transcript::TranscriptLog;
use tooldrive_providers::ConfigAdapterFactory;
use tooldrive_providers::cache::GeminiCacheManager;
use tooldrive_tools::gateway::ToolGateway;
use tooldrive_tools::{ToolContext, builtin_registry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant that can call tools. \
Use the calculator for arithmetic and read_file to inspect files. \
When you need information or a decision only the user can give, call human_ask. \
Never repeat a secret the user typed back to them.";

pub struct ChatOptions {
    pub message: Option<String>,
    pub images: Vec<PathBuf>,
    pub system: Option<String>,
}

struct Session {
    orchestrator: Arc<Orchestrator>,
    transcript: TranscriptLog,
    streaming: bool,
}

impl Session {
    fn build(config: Config) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<AgentEvent>)> {
        let (warnings, errors) = config.validate();
        for w in &warnings {
            warn!("{w}");
        }
        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  {}", errors.join("\n  "));
        }

        let streaming = config.streaming();
        let transcript = TranscriptLog::from_config(&config);
        let use_cache = config.provider_kind() == Some(ProviderKind::Gemini) && config.gemini_cache_enabled();
        let cache = use_cache.then(|| Arc::new(GeminiCacheManager::from_config(&config)));

        let runtime = RuntimeContext::new(config);
        let workspace = std::env::current_dir().context("Failed to resolve working directory")?;
        let mut gateway = ToolGateway::new(
            Arc::new(builtin_registry()),
            ToolContext::new(runtime.clone(), workspace),
        );
        if let Some(cache) = &cache {
            gateway = gateway.with_observer(cache.clone());
        }

        let factory = Arc::new(ConfigAdapterFactory::new(runtime.config.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut orchestrator = Orchestrator::new(runtime, factory, gateway)
            .with_transcript(transcript.clone())
            .with_events(tx);
        if let Some(cache) = cache {
            orchestrator = orchestrator.with_context_cache(cache);
        }

        Ok((
            Self {
                orchestrator: Arc::new(orchestrator),
                transcript,
                streaming,
            },
            rx,
        ))
    }

    async fn send(&self, history: &mut Vec<Message>, user: Message) -> anyhow::Result<RunOutcome> {
        if let Err(e) = self.transcript.append(&user).await {
            warn!(error = %e, "Failed to write transcript");
        }
        history.push(user);

        // Restored if the turn fails.
        let backup = history.clone();
        let owned = std::mem::take(history);
        let (returned, outcome) = match drive_turn(self.orchestrator.clone(), owned).await {
            Ok(done) => done,
            Err(e) => {
                *history = backup;
                return Err(e);
            }
        };
        *history = returned;

        if self.streaming {
            println!();
        } else if let Some(text) = &outcome.final_text {
            println!("{text}");
        }
        match outcome.stop {
            StopReason::Completed => {}
            StopReason::ProviderFailed | StopReason::RetryExhausted => {
                eprintln!("[error] {}", outcome.error.as_deref().unwrap_or("provider call failed"));
            }
            other => eprintln!("[stopped] {other:?} after {} rounds", outcome.rounds),
        }
        Ok(outcome)
    }
}

/// Run the orchestrator on its own task, answering confirmation prompts meanwhile.
async fn drive_turn(
    orchestrator: Arc<Orchestrator>,
    mut history: Vec<Message>,
) -> anyhow::Result<(Vec<Message>, RunOutcome)> {
    let confirmations = orchestrator.runtime().confirmations.clone();
    let mut prompts = confirmations.subscribe();
    let mut task = tokio::spawn(async move {
        let outcome = orchestrator.run(&mut history).await;
        (history, outcome)
    });

    loop {
        tokio::select! {
            joined = &mut task => {
                let (history, outcome) = joined.context("Agent task panicked")?;
                return Ok((history, outcome?));
            }
            changed = prompts.changed() => {
                if changed.is_err() {
                    let (history, outcome) = (&mut task).await.context("Agent task panicked")?;
                    return Ok((history, outcome?));
                }
                let pending = prompts.borrow_and_update().clone();
                if let Some(prompt) = pending {
                    let answer = ask_user(prompt).await?;
                    if let Err(e) = confirmations.reply(answer) {
                        warn!(error = %e, "Reply was not delivered");
                    }
                }
            }
        }
    }
}

async fn ask_user(prompt: PendingPrompt) -> anyhow::Result<String> {
    eprintln!("\n=== human_ask ===\n{}\n=== /human_ask ===", prompt.prompt);
    eprintln!("(answer 'c' or 'cancel' to cancel)");
    let answer = tokio::task::spawn_blocking(move || {
        if prompt.secret {
            Password::new()
                .with_prompt("secret")
                .allow_empty_password(true)
                .interact()
        } else {
            Input::<String>::new()
                .with_prompt("answer")
                .allow_empty(true)
                .interact_text()
        }
    })
    .await?;
    Ok(answer?)
}

async fn read_line(label: &'static str) -> anyhow::Result<Option<String>> {
    let line = tokio::task::spawn_blocking(move || {
        Input::<String>::new()
            .with_prompt(label)
            .allow_empty(true)
            .interact_text()
    })
    .await?;
    // Input fails on EOF (Ctrl-D); treat it as leaving the chat.
    Ok(line.ok())
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

async fn user_message(text: &str, images: &[PathBuf]) -> anyhow::Result<Message> {
    if images.is_empty() {
        return Ok(Message::user(text));
    }
    let mut parts = vec![ContentPart::text(text)];
    for path in images {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read image {}", path.display()))?;
        parts.push(ContentPart::image_from_bytes(image_mime(path), &bytes));
    }
    Ok(Message::user_parts(parts))
}

/// Print agent events as they arrive.
async fn render_events(mut rx: mpsc::UnboundedReceiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta { delta } => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ToolCall { tool, arguments, .. } => eprintln!("\n[tool] {tool} {arguments}"),
            AgentEvent::ToolResult { tool, fresh: false, .. } => eprintln!("[tool] {tool}: reused"),
            AgentEvent::RateLimited {
                attempt,
                max_retries,
                wait_secs,
                ..
            } => eprintln!("[rate limited] retry {attempt}/{max_retries} in {wait_secs:.1}s"),
            AgentEvent::Warning { message } => eprintln!("[warn] {message}"),
            AgentEvent::Error { message, .. } => eprintln!("[error] {message}"),
            AgentEvent::AssistantMessage { .. } | AgentEvent::ToolResult { .. } => {}
        }
    }
}

pub async fn run(config: Config, options: ChatOptions) -> anyhow::Result<()> {
    let (session, events) = Session::build(config)?;
    let renderer = tokio::spawn(render_events(events));

    let system = options.system.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let mut history = vec![Message::system(system)];

    if let Some(text) = options.message {
        let user = user_message(&text, &options.images).await?;
        session.send(&mut history, user).await?;
    } else {
        eprintln!("tooldrive chat (type 'exit' to quit)");
        let mut images = options.images;
        while let Some(line) = read_line("you").await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if matches!(line, "exit" | "quit") {
                break;
            }
            let user = user_message(line, &std::mem::take(&mut images)).await?;
            if let Err(e) = session.send(&mut history, user).await {
                eprintln!("[error] {e:#}");
            }
        }
    }

    drop(session);
    let _ = renderer.await;
    Ok(())
}
