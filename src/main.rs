use anyhow::Result;
use clap::{Parser, ValueEnum};
use portal_chat::context::{shape_conversation, with_system_context, SalesDataProvider, StaticSalesData};
use portal_chat::recording::PlaybackState;
use portal_chat::portal::ResolvedReply;
use portal_chat::relay::RelayFrame;
use portal_chat::{
    extract_portal_with, spawn_completion, ChatEvent, ChatMessage, ClientConfig,
    CompletionProvider, CompletionResponse, OpenAIClient, PayloadPolicy, PortalBoundary,
    PortalPayload, PortalSink,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum BoundaryArg {
    /// Payload runs to the end of the reply
    End,
    /// Payload stops at the first blank line
    BlankLine,
}

impl From<BoundaryArg> for PortalBoundary {
    fn from(arg: BoundaryArg) -> Self {
        match arg {
            BoundaryArg::End => PortalBoundary::EndOfText,
            BoundaryArg::BlankLine => PortalBoundary::BlankLine,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Message to send; without it, messages are read from stdin one per line
    message: Option<String>,

    /// System prompt prepended to the conversation
    #[arg(long)]
    system: Option<String>,

    /// Build the system prompt from the bundled demo sales data
    #[arg(long)]
    with_sales_context: bool,

    /// Model name (overrides OPENAI_MODEL)
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// API base URL (overrides OPENAI_BASE_URL)
    #[arg(long)]
    base_url: Option<String>,

    /// Wait for the complete reply instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// Where the portal payload ends
    #[arg(long, value_enum, default_value = "end")]
    boundary: BoundaryArg,

    /// Write the reply as event-stream frames instead of plain text
    #[arg(long, conflicts_with = "no_stream")]
    sse: bool,

    /// Record API responses to a file
    #[arg(long)]
    record: Option<PathBuf>,

    /// Play back a recorded session from a file
    #[arg(long, conflicts_with = "record")]
    playback: Option<PathBuf>,

    /// Play back without the recorded delays
    #[arg(long)]
    fast_playback: bool,

    /// Check the configured key by listing the available models, then exit
    #[arg(long)]
    verify_key: bool,

    /// Increase logging (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_logging(verbose_level: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::EnvFilter::from_default_env()
    } else {
        let filter_str = match verbose_level {
            0 => "warn,portal_chat=info",
            1 => "info,portal_chat=debug",
            _ => "debug,portal_chat=trace",
        };
        tracing_subscriber::EnvFilter::new(filter_str)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// The reply to show and keep in the history, or None if the request was
/// cancelled
fn displayable_reply(response: &CompletionResponse, boundary: PortalBoundary) -> Option<ResolvedReply> {
    if response.cancelled {
        return None;
    }
    Some(extract_portal_with(&response.text, boundary).resolve(PayloadPolicy::Ignore))
}

/// Prints visualizations below the reply
struct TerminalPortalSink;

impl PortalSink for TerminalPortalSink {
    fn show(&mut self, payload: &Value) {
        let (title, kind) = match serde_json::from_value::<PortalPayload>(payload.clone()) {
            Ok(chart) => (
                chart.display_title().to_string(),
                chart.chart_kind().unwrap_or("chart").to_string(),
            ),
            Err(_) => ("Chart".to_string(), "chart".to_string()),
        };
        println!("\n[{kind}] {title}");
        match serde_json::to_string_pretty(payload) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{payload}"),
        }
    }
}

struct Session {
    client: Arc<OpenAIClient>,
    history: Vec<ChatMessage>,
    system: Option<String>,
    sales_context: Option<StaticSalesData>,
    boundary: PortalBoundary,
    stream: bool,
    sse: bool,
    sink: TerminalPortalSink,
}

impl Session {
    fn conversation(&self, input: &str) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::user(input));
        if let Some(system) = &self.system {
            messages = with_system_context(messages, ChatMessage::system(system.clone()));
        }
        let data = self
            .sales_context
            .as_ref()
            .map(|data| data as &dyn SalesDataProvider);
        shape_conversation(messages, data)
    }

    async fn send(&mut self, input: &str) -> Result<()> {
        let messages = self.conversation(input);
        debug!("Sending {} messages", messages.len());

        let reply = if self.stream {
            self.send_streaming(messages).await?
        } else {
            self.send_complete(messages).await?
        };

        if let Some(reply) = reply {
            self.history.push(ChatMessage::user(input));
            self.history.push(ChatMessage::assistant(reply));
        }
        Ok(())
    }

    async fn send_complete(&mut self, messages: Vec<ChatMessage>) -> Result<Option<String>> {
        let cancel = CancellationToken::new();
        let request = self.client.complete(&messages, None, &cancel);
        tokio::pin!(request);

        let response = loop {
            tokio::select! {
                response = &mut request => break response?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Cancelling request");
                    cancel.cancel();
                }
            }
        };
        let Some(reply) = displayable_reply(&response, self.boundary) else {
            info!("Request cancelled, nothing to show");
            return Ok(None);
        };
        println!("{}", reply.message);
        if let Some(visualization) = &reply.visualization {
            self.sink.show(visualization);
        }
        Ok(Some(reply.message))
    }

    async fn send_streaming(&mut self, messages: Vec<ChatMessage>) -> Result<Option<String>> {
        let provider: Arc<dyn CompletionProvider> = self.client.clone();
        let mut handle = spawn_completion(provider, messages, self.boundary);
        let mut stdout = std::io::stdout();

        loop {
            let event = tokio::select! {
                event = handle.recv() => event,
                _ = tokio::signal::ctrl_c() => {
                    info!("Cancelling request");
                    handle.cancel();
                    continue;
                }
            };
            let Some(event) = event else {
                return Ok(None);
            };

            if self.sse {
                if let Some(frame) = RelayFrame::from_event(&event) {
                    write!(stdout, "{}", frame.encode())?;
                    stdout.flush()?;
                }
            }

            match event {
                ChatEvent::Fragment(text) => {
                    if !self.sse {
                        write!(stdout, "{text}")?;
                        stdout.flush()?;
                    }
                }
                ChatEvent::PortalStarted => debug!("Portal marker received"),
                ChatEvent::Completed { reply, response } => {
                    if response.is_partial() {
                        info!(
                            "Reply incomplete after {} bytes (cancelled: {}, truncated: {})",
                            response.text.len(),
                            response.cancelled,
                            response.truncated
                        );
                    }
                    let resolved = reply.resolve(PayloadPolicy::Ignore);
                    if !self.sse {
                        println!();
                        if let Some(visualization) = &resolved.visualization {
                            self.sink.show(visualization);
                        }
                    }
                    return Ok(Some(resolved.message));
                }
                ChatEvent::Failed(message) => {
                    if !self.sse {
                        eprintln!("Error: {message}");
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::from_filename(".env.local").ok();
    dotenv::dotenv().ok();

    let args = Args::parse();
    setup_logging(args.verbose);

    let mut config = ClientConfig::from_env();
    if let Some(model) = args.model {
        config = config.with_model(model);
    }
    if let Some(base_url) = args.base_url {
        config = config.with_base_url(base_url);
    }
    debug!("Client configuration: {:?}", config);

    let mut client = OpenAIClient::new(config);
    if let Some(path) = &args.record {
        info!("Recording responses to {}", path.display());
        client = client.with_recorder(path);
    }
    if let Some(path) = &args.playback {
        let playback = PlaybackState::from_file(path, args.fast_playback)?;
        info!(
            "Loaded {} recorded sessions from {}",
            playback.session_count(),
            path.display()
        );
        client = client.with_playback(playback);
    }

    if args.verify_key {
        let models = client.list_models().await?;
        println!("Key accepted, {} models available", models.len());
        return Ok(());
    }

    let mut session = Session {
        client: Arc::new(client),
        history: Vec::new(),
        system: args.system,
        sales_context: args.with_sales_context.then(StaticSalesData::demo),
        boundary: args.boundary.into(),
        stream: !args.no_stream,
        sse: args.sse,
        sink: TerminalPortalSink,
    };

    if let Some(message) = args.message {
        return session.send(&message).await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if let Err(e) = session.send(input).await {
            eprintln!("Error: {e}");
        }
    }
    Ok(())
}
