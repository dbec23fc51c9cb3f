use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use chatlink::args::Cli;
use chatlink::channel::Transport;
use chatlink::channel::ws::WsTransport;
use chatlink::config::Config;
use chatlink::logging::{self, LogConfig};
use chatlink::protocol::{MessageRole, Notification, Warning};
use chatlink::session::{ChatSession, NotificationStream};
use chatlink::state::{ConversationState, Phase};
use chatlink::theme as t;

/// One line typed at the prompt.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Send(&'a str),
    Join(&'a str),
    Reconnect,
    Disconnect,
    Status,
    Help,
    Quit,
    Unknown(&'a str),
    Empty,
}

impl<'a> Input<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let Some(command) = line.strip_prefix('/') else {
            return if line.is_empty() {
                Self::Empty
            } else {
                Self::Send(line)
            };
        };
        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((command, ""));
        match name {
            "quit" | "exit" => Self::Quit,
            "reconnect" => Self::Reconnect,
            "disconnect" => Self::Disconnect,
            "status" => Self::Status,
            "help" => Self::Help,
            "join" if !rest.is_empty() => Self::Join(rest),
            _ => Self::Unknown(line),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log = LogConfig::from_env();
    logging::init(if cli.verbose { log.verbose() } else { log });
    t::init_color(cli.no_color);

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);

    let transport: Arc<dyn Transport> = Arc::new(WsTransport);
    let mut session =
        ChatSession::open(cli.conversation.clone(), config.chat_manager()?, transport.clone())
            .await?;
    session.set_routing(config.routing.clone());

    let notifications = if config.notifications {
        let stream = NotificationStream::spawn(
            config.server_url()?,
            config.notification_reconnect_delay(),
            transport.clone(),
        );
        stream.connect().await?;
        tokio::spawn(print_notifications(stream.subscribe()));
        Some(stream)
    } else {
        None
    };

    println!(
        "{} {} {}",
        t::accent("chatlink"),
        t::muted("conversation"),
        cli.conversation
    );
    println!("{}", t::muted("type /help for commands"));

    tokio::spawn(Renderer::default().run(session.state(), session.connected()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match Input::parse(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Send(text) => {
                let delivery = session.send_message(text).await;
                tokio::spawn(async move {
                    if let Err(err) = delivery.await {
                        println!("{}", t::error(&format!("✗ {err}")));
                    }
                });
            }
            Input::Join(id) => {
                session.connect(id).await?;
                println!("{} {id}", t::muted("joined"));
            }
            Input::Reconnect => session.reconnect().await?,
            Input::Disconnect => session.disconnect().await?,
            Input::Status => print_status(&session, notifications.as_ref()),
            Input::Help => print_help(),
            Input::Unknown(cmd) => println!("{}", t::warn(&format!("unknown command {cmd}"))),
        }
    }

    session.shutdown().await?;
    if let Some(stream) = notifications {
        stream.shutdown().await?;
    }
    Ok(())
}

fn print_status(session: &ChatSession, notifications: Option<&NotificationStream>) {
    let state = session.snapshot();
    println!(
        "{} {}  {} {}  {} {}",
        t::muted("conversation"),
        session.conversation_id().unwrap_or_default(),
        t::muted("channel"),
        t::connection_label(session.is_connected()),
        t::muted("agent"),
        t::status_line(&state.status),
    );
    let routing = session.routing();
    println!(
        "{} {}/{}  {} {}",
        t::muted("model"),
        routing.provider,
        routing.model,
        t::muted("tools"),
        if routing.mcp_servers.is_empty() {
            "none".to_string()
        } else {
            routing.mcp_servers.join(", ")
        },
    );
    if let Some(stream) = notifications {
        println!(
            "{} {}  {} {}",
            t::muted("notifications"),
            t::connection_label(stream.is_connected()),
            t::muted("dropped"),
            stream.malformed(),
        );
    }
    if state.protocol_faults > 0 {
        println!(
            "{} {} ({})",
            t::muted("protocol faults"),
            state.protocol_faults,
            state.last_fault.unwrap_or_default()
        );
    }
}

fn print_help() {
    for (cmd, what) in [
        ("/join ID", "switch to another conversation"),
        ("/reconnect", "reopen the chat channel"),
        ("/disconnect", "close the chat channel"),
        ("/status", "show connection and agent state"),
        ("/quit", "exit"),
    ] {
        println!("  {:<12} {}", t::accent(cmd), t::muted(what));
    }
}

async fn print_notifications(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => println!("{} {}", t::muted("◆"), t::accent(&notification.kind)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "notification printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Prints conversation state changes as they happen.
#[derive(Default)]
struct Renderer {
    printed: usize,
    streamed: bool,
    messages: usize,
    phase: Phase,
    tool: Option<String>,
    warning: Option<Warning>,
    error: Option<String>,
    connected: Option<bool>,
}

impl Renderer {
    async fn run(
        mut self,
        mut state: watch::Receiver<ConversationState>,
        mut connected: watch::Receiver<bool>,
    ) {
        loop {
            let mut out = Vec::new();
            let rendered = tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = state.borrow_and_update().clone();
                    self.render(&snapshot, &mut out)
                }
                changed = connected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now = *connected.borrow_and_update();
                    self.render_connection(now, &mut out)
                }
            };
            let mut stdout = std::io::stdout();
            let written = rendered
                .and_then(|()| stdout.write_all(&out))
                .and_then(|()| stdout.flush());
            if let Err(err) = written {
                debug!(error = %err, "renderer stopped");
                break;
            }
        }
    }

    fn render_connection(&mut self, connected: bool, out: &mut impl Write) -> std::io::Result<()> {
        if self.connected != Some(connected) {
            self.connected = Some(connected);
            writeln!(out, "{}", t::connection_label(connected))?;
        }
        Ok(())
    }

    fn render(&mut self, state: &ConversationState, out: &mut impl Write) -> std::io::Result<()> {
        let tool = state.status.tool_name.clone();
        if state.status.phase != self.phase || tool != self.tool {
            if let Some(name) = &tool {
                writeln!(out, "{}", t::muted(&format!("[tool: {name}]")))?;
            }
            self.phase = state.status.phase;
            self.tool = tool;
        }

        // Settle finished messages before the buffer: a watch snapshot can
        // hold a completion and the start of the next exchange together.
        for message in state.messages.iter().skip(self.messages) {
            if self.streamed {
                writeln!(out)?;
            } else if message.role != MessageRole::User {
                writeln!(out, "{}", message.content)?;
            }
            self.streamed = false;
            self.printed = 0;
        }
        self.messages = state.messages.len();

        // Within one exchange the buffer only grows.
        let buffer = state.streaming.as_str();
        if buffer.len() < self.printed {
            self.printed = 0;
        }
        if let Some(fresh) = buffer.get(self.printed..).filter(|fresh| !fresh.is_empty()) {
            write!(out, "{fresh}")?;
            self.printed = buffer.len();
            self.streamed = true;
        }

        if state.last_warning != self.warning {
            if let Some(warning) = &state.last_warning {
                writeln!(out, "{}", t::warn(&format!("⚠ {}", warning.message)))?;
            }
            self.warning = state.last_warning.clone();
        }
        if state.last_error != self.error {
            if let Some(error) = &state.last_error {
                if self.streamed {
                    writeln!(out)?;
                    self.streamed = false;
                }
                writeln!(out, "{}", t::error(&format!("✗ {error}")))?;
            }
            self.error = state.last_error.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlink::protocol::Message;

    fn rendered(renderer: &mut Renderer, state: &ConversationState) -> String {
        let mut out = Vec::new();
        renderer.render(state, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn exchange(messages: &[(MessageRole, &str)], streaming: &str) -> ConversationState {
        let mut state = ConversationState::default();
        for (role, content) in messages {
            state.messages.push(Message::new(*role, *content));
        }
        state.streaming.push(streaming);
        state
    }

    #[test]
    fn test_renderer_streams_only_new_text() {
        let mut renderer = Renderer::default();
        let state = exchange(&[(MessageRole::User, "hi")], "Hel");
        assert_eq!(rendered(&mut renderer, &state), "Hel");
        let state = exchange(&[(MessageRole::User, "hi")], "Hello");
        assert_eq!(rendered(&mut renderer, &state), "lo");
    }

    #[test]
    fn test_renderer_handles_completion_and_next_exchange_in_one_snapshot() {
        let mut renderer = Renderer::default();
        let state = exchange(&[(MessageRole::User, "first")], "a");
        assert_eq!(rendered(&mut renderer, &state), "a");

        // Completion of the first reply, the next send, and its first chunk
        // all arrive as one update.
        let state = exchange(
            &[
                (MessageRole::User, "first"),
                (MessageRole::Assistant, "a!"),
                (MessageRole::User, "second"),
            ],
            "é",
        );
        assert_eq!(rendered(&mut renderer, &state), "\né");

        let state = exchange(
            &[
                (MessageRole::User, "first"),
                (MessageRole::Assistant, "a!"),
                (MessageRole::User, "second"),
            ],
            "éa",
        );
        assert_eq!(rendered(&mut renderer, &state), "a");
    }

    #[test]
    fn test_renderer_prints_unstreamed_reply_whole() {
        let mut renderer = Renderer::default();
        let state = exchange(&[(MessageRole::User, "q"), (MessageRole::Assistant, "done")], "");
        assert_eq!(rendered(&mut renderer, &state), "done\n");
    }

    #[test]
    fn test_parses_prompt_lines() {
        assert_eq!(Input::parse("  hello there "), Input::Send("hello there"));
        assert_eq!(Input::parse(""), Input::Empty);
        assert_eq!(Input::parse("/quit"), Input::Quit);
        assert_eq!(Input::parse("/join  99 "), Input::Join("99"));
        assert_eq!(Input::parse("/join"), Input::Unknown("/join"));
        assert_eq!(Input::parse("/bogus"), Input::Unknown("/bogus"));
    }
}
