use clap::Parser;

/// Loopback translating proxy between the Anthropic Messages protocol and
/// OpenAI-compatible backends.
#[derive(Debug, Parser)]
#[command(name = "claudish", version)]
pub struct Args {
    /// Loopback port to bind. 0 picks a free port; the launcher reads the
    /// bound port from the startup log line.
    #[arg(long, env = "CLAUDISH_PORT", default_value_t = 0)]
    pub port: u16,

    /// Model identifier to route requests to, e.g. "ollama/qwen3:8b",
    /// "lmstudio:llama-3.2-3b" or an OpenRouter model id.
    #[arg(long, env = "CLAUDISH_MODEL", default_value = "openrouter/auto")]
    pub model: String,

    /// Pass traffic through to the vendor endpoint unchanged, logging both
    /// directions for fixture capture.
    #[arg(long)]
    pub monitor: bool,

    /// How chain-of-thought deltas are surfaced: as_text, as_thinking or
    /// suppress.
    #[arg(long, env = "CLAUDISH_REASONING_POLICY")]
    pub reasoning: Option<String>,

    /// Enable debug-level structured logging.
    #[arg(long, env = "CLAUDISH_DEBUG")]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::parse_from(["claudish"]);
        assert_eq!(args.port, 0);
        assert_eq!(args.model, "openrouter/auto");
        assert!(!args.monitor);
        assert!(!args.debug);
        assert!(args.reasoning.is_none());
    }

    #[test]
    fn flags_parse() {
        let args = Args::parse_from([
            "claudish",
            "--port",
            "3712",
            "--model",
            "ollama/qwen3:8b",
            "--reasoning",
            "as_thinking",
            "--debug",
        ]);

        assert_eq!(args.port, 3712);
        assert_eq!(args.model, "ollama/qwen3:8b");
        assert_eq!(args.reasoning.as_deref(), Some("as_thinking"));
        assert!(args.debug);
    }
}
