#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::cast_precision_loss,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use positronic::config::CONFIG_DIR_ENV;
use positronic::{channels, observability, providers, Config};
use std::io::Write;
use tracing::info;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `positronic` - a robopsychological analyst on Telegram.
#[derive(Parser, Debug)]
#[command(name = "positronic")]
#[command(version)]
#[command(about = "Telegram bot relaying conversations to an OpenAI-compatible model.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: ~/.positronic)
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the Telegram bot
    #[command(long_about = "\
Run the Telegram bot.

Long-polls Telegram for messages and answers each one through the \
configured model, keeping a bounded per-user conversation history in memory. \
Requires a bot token (TELEGRAM_BOT_TOKEN) and a backend API key (OPENAI_API_KEY).

Examples:
  positronic start
  RUST_LOG=debug positronic start")]
    Start,

    /// Talk to the analyst from the terminal
    #[command(long_about = "\
Talk to the analyst from the terminal.

Uses the same commands, history and backend as the bot. \
Use --message for a single question without entering interactive mode.

Examples:
  positronic chat
  positronic chat -m \"Is the Earth flat?\"")]
    Chat {
        /// Single message mode (don't enter interactive mode)
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Show resolved configuration and connectivity
    Status,

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `positronic`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(positronic completions bash)
  positronic completions zsh > ~/.zfunc/_positronic
  positronic completions fish > ~/.config/fish/completions/positronic.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Completions must remain stdout-only and should not load config or initialize logging.
    // This avoids warnings/log lines corrupting sourced completion scripts.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var(CONFIG_DIR_ENV, config_dir);
    }

    // Credentials may live in a .env next to the bot.
    let dotenv_path = dotenvy::dotenv().ok();

    let config = {
        let _bootstrap = tracing::subscriber::set_default(observability::bootstrap_subscriber());
        Config::load_or_init().await?
    };
    observability::init_logging(config.log_file_path().as_deref())?;
    if let Some(path) = dotenv_path {
        info!(path = %path.display(), "Loaded environment file");
    }

    match cli.command {
        Commands::Completions { .. } => unreachable!(),

        Commands::Start => channels::start_channels(config).await,

        Commands::Chat { message } => channels::run_cli_chat(config, message).await,

        Commands::Status => print_status(&config).await,
    }
}

fn presence(value: bool) -> &'static str {
    if value {
        "configured"
    } else {
        "missing"
    }
}

async fn print_status(config: &Config) -> Result<()> {
    let api_key = providers::resolve_provider_credential(config.api_key.as_deref());

    println!("Positronic Status");
    println!();
    println!("Version:     {}", env!("CARGO_PKG_VERSION"));
    println!("Config:      {}", config.config_path.display());
    println!();
    println!("Backend:");
    println!("  Provider:        {}", config.provider);
    println!(
        "  API URL:         {}",
        config.api_url.as_deref().unwrap_or("(provider default)")
    );
    println!("  API key:         {}", presence(api_key.is_some()));
    println!("  Model:           {}", config.model);
    println!("  Temperature:     {}", config.backend.temperature);
    println!("  Max tokens:      {}", config.backend.max_tokens);
    println!("  Timeout:         {}s", config.backend.request_timeout_secs);
    println!(
        "  Retries:         {} (backoff {}ms..{}ms)",
        config.backend.max_retries, config.backend.base_backoff_ms, config.backend.max_backoff_ms
    );
    println!();
    println!("Conversation:");
    println!(
        "  History:         {} turns ({} exchanges)",
        config.session.max_turns,
        config.session.max_turns / 2
    );
    println!(
        "  Same-user turns: {}",
        if config.pipeline.serialize_user_turns {
            "serialized"
        } else {
            "concurrent"
        }
    );
    println!(
        "  System prompt:   {}",
        config.system_prompt_file.as_deref().unwrap_or("(built-in)")
    );
    println!(
        "  Log file:        {}",
        config
            .log_file_path()
            .map_or_else(|| "(stderr only)".to_string(), |p| p.display().to_string())
    );
    println!();
    println!("Channels:");
    println!("  CLI:             always");
    match &config.channels.telegram {
        Some(tg) => {
            println!("  Telegram:        token {}", presence(!tg.bot_token.trim().is_empty()));
            println!("  Allowed users:   {}", tg.allowed_users.join(", "));
        }
        None => println!("  Telegram:        not configured"),
    }
    println!(
        "  In-flight limit: {}",
        config.channels.max_in_flight_messages
    );

    if api_key.is_some() {
        let provider = providers::create_provider(config)?;
        let healthy = provider.health_check().await;
        println!();
        println!(
            "Backend health:  {}",
            if healthy { "reachable" } else { "unreachable" }
        );
    }
    for (name, status) in channels::doctor_channels(config).await {
        println!("{name} health: {status}");
    }

    Ok(())
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
