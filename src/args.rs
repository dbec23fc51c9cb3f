use crate::config::Config;
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "chatlink",
    version,
    about = "Interactive client for a streaming agent chat server"
)]
pub struct Cli {
    /// Path to a config.toml file
    #[arg(short = 'c', long, value_name = "PATH", env = "CHATLINK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Server base URL (ws://host:port)
    #[arg(long = "server", value_name = "WS_URL", env = "CHATLINK_SERVER")]
    pub server: Option<String>,

    /// Conversation to join
    #[arg(short = 'C', long, value_name = "ID")]
    pub conversation: String,

    /// Model provider
    #[arg(long, value_name = "NAME")]
    pub provider: Option<String>,

    #[arg(long, value_name = "NAME")]
    pub model: Option<String>,

    /// Enable a tool server (repeatable)
    #[arg(long = "tool", value_name = "NAME", action = ArgAction::Append)]
    pub tools: Vec<String>,

    /// Ask the model to think before answering
    #[arg(long, action = ArgAction::SetTrue)]
    pub thinking: bool,

    /// Retrieval-augmented answers
    #[arg(long, action = ArgAction::SetTrue)]
    pub rag: bool,

    #[arg(long, value_name = "N")]
    pub rag_top_k: Option<u32>,

    /// Hybrid (keyword + vector) retrieval
    #[arg(long, action = ArgAction::SetTrue)]
    pub hybrid: bool,

    /// Also follow the notification stream
    #[arg(long, action = ArgAction::SetTrue)]
    pub notifications: bool,

    /// Disable coloured terminal output
    #[arg(long = "no-color", action = ArgAction::SetTrue, env = "NO_COLOR")]
    pub no_color: bool,

    /// Debug logging
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

impl Cli {
    /// Overlay command-line flags on a loaded config. Flags only ever turn
    /// switches on; list flags replace the configured list when given.
    pub fn apply(&self, config: &mut Config) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        let routing = &mut config.routing;
        if let Some(provider) = &self.provider {
            routing.provider = provider.clone();
        }
        if let Some(model) = &self.model {
            routing.model = model.clone();
        }
        if !self.tools.is_empty() {
            routing.mcp_servers = self.tools.clone();
        }
        if let Some(top_k) = self.rag_top_k {
            routing.rag_top_k = top_k;
        }
        routing.thinking_enabled |= self.thinking;
        routing.rag_enabled |= self.rag;
        routing.rag_hybrid_search |= self.hybrid;
        config.notifications |= self.notifications;
    }
}
