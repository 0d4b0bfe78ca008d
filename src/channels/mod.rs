pub mod cli;
pub mod telegram;
pub mod traits;

pub use cli::{CliChannel, CLI_USER_ID};
pub use telegram::TelegramChannel;
pub use traits::{Channel, ChannelMessage};

use crate::commands::{self, CommandContext, CommandDispatcher, DispatchResult};
use crate::config::Config;
use crate::pipeline::{self, MessagePipeline, PendingSignal, TurnSlot, SYSTEM_FAULT_REPLY};
use crate::providers;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_CHANNEL_INITIAL_BACKOFF_SECS: u64 = 2;
const DEFAULT_CHANNEL_MAX_BACKOFF_SECS: u64 = 60;
const CHANNEL_MESSAGE_BUFFER: usize = 100;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a per-message task needs.
pub struct ChannelRuntimeContext {
    pub pipeline: Arc<MessagePipeline>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub channels_by_name: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelRuntimeContext {
    pub fn new(
        pipeline: Arc<MessagePipeline>,
        dispatcher: Arc<CommandDispatcher>,
        channels: &[Arc<dyn Channel>],
    ) -> Self {
        Self {
            pipeline,
            dispatcher,
            channels_by_name: channels
                .iter()
                .map(|ch| (ch.name().to_string(), Arc::clone(ch)))
                .collect(),
        }
    }
}

fn spawn_supervised_listener(
    ch: Arc<dyn Channel>,
    tx: tokio::sync::mpsc::Sender<ChannelMessage>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);
        let mut restarts: u64 = 0;

        loop {
            let result = ch.listen(tx.clone()).await;

            if tx.is_closed() {
                break;
            }

            match result {
                Ok(()) => {
                    tracing::warn!(restarts, "Channel {} exited unexpectedly; restarting", ch.name());
                }
                Err(e) => {
                    tracing::error!(restarts, "Channel {} error: {e}; restarting", ch.name());
                }
            }

            restarts += 1;
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

/// Route one message: commands to the dispatcher, free text to the pipeline,
/// then deliver the reply. Holds the user's turn until the reply is sent so
/// replies arrive in the order messages did.
///
/// An in-flight permit is taken only once the turn is ours, so messages queued
/// behind the same user's running turn never hold capacity other users need.
async fn process_channel_message(
    ctx: Arc<ChannelRuntimeContext>,
    msg: ChannelMessage,
    slot: TurnSlot,
    in_flight: Arc<Semaphore>,
) {
    let turn = slot.acquire().await;
    let Ok(_permit) = in_flight.acquire().await else {
        return;
    };

    let Some(channel) = ctx.channels_by_name.get(&msg.channel).cloned() else {
        tracing::warn!(channel = %msg.channel, "Message from unknown channel dropped");
        return;
    };

    let command_ctx = CommandContext {
        user_id: msg.sender.clone(),
        first_name: msg.first_name.clone(),
        channel: msg.channel.clone(),
    };

    let reply = match ctx.dispatcher.dispatch(&msg.content, &command_ctx).await {
        Ok(DispatchResult::CommandHandled { output }) => output,
        Ok(DispatchResult::Ignored) => return,
        Ok(DispatchResult::Forward { text }) => {
            let pending = PendingSignal::new(Arc::clone(&channel), msg.reply_target.clone());
            ctx.pipeline
                .handle_active(&turn, &text, Some(&pending))
                .await
                .text()
                .to_string()
        }
        Err(e) => {
            tracing::error!(user_id = %msg.sender, "Command failed: {e:#}");
            SYSTEM_FAULT_REPLY.to_string()
        }
    };

    if let Err(e) = channel.send(&reply, &msg.reply_target).await {
        tracing::error!(
            channel = %msg.channel,
            user_id = %msg.sender,
            error_kind = "transport",
            "Failed to deliver reply: {}",
            providers::scrub_secret_patterns(&format!("{e:#}"))
        );
    }
}

/// Fan messages out to one task each. At most `max_in_flight_messages` turns
/// run at a time; messages waiting behind their own user's turn do not count.
/// Returns once every sender is gone and all tasks have finished.
pub async fn run_message_dispatch_loop(
    mut rx: tokio::sync::mpsc::Receiver<ChannelMessage>,
    ctx: Arc<ChannelRuntimeContext>,
    max_in_flight_messages: usize,
) {
    let in_flight = Arc::new(Semaphore::new(max_in_flight_messages.max(1)));
    let mut workers = tokio::task::JoinSet::new();

    while let Some(msg) = rx.recv().await {
        // Reserve before spawning so a user's messages keep their arrival order.
        let slot = ctx.pipeline.reserve(&msg.sender);
        tracing::debug!(channel = %msg.channel, user_id = %msg.sender, id = %msg.id, "Message received");

        workers.spawn(process_channel_message(
            Arc::clone(&ctx),
            msg,
            slot,
            Arc::clone(&in_flight),
        ));

        while let Some(result) = workers.try_join_next() {
            log_worker_result(result);
        }
    }

    while let Some(result) = workers.join_next().await {
        log_worker_result(result);
    }
}

fn log_worker_result(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!("Message worker failed: {e}");
    }
}

/// Run the Telegram bot until Ctrl-C.
pub async fn start_channels(config: Config) -> Result<()> {
    let telegram_config = config
        .channels
        .telegram
        .clone()
        .context("Telegram is not configured: set TELEGRAM_BOT_TOKEN or [channels.telegram] bot_token")?;
    if telegram_config.bot_token.trim().is_empty() {
        anyhow::bail!("Telegram bot token is empty");
    }
    if providers::resolve_provider_credential(config.api_key.as_deref()).is_none() {
        anyhow::bail!("No backend API key: set OPENAI_API_KEY or api_key in config.toml");
    }

    let pipeline = Arc::new(pipeline::create_pipeline(&config).await?);
    let telegram = Arc::new(TelegramChannel::new(
        telegram_config.bot_token.clone(),
        telegram_config.allowed_users.clone(),
    ));

    let bot_username = match telegram.bot_username().await {
        Ok(username) => username,
        Err(e) => {
            tracing::warn!("Could not resolve bot username; commands addressed to any @bot will be handled: {e}");
            None
        }
    };
    let dispatcher = Arc::new(
        commands::create_dispatcher(Arc::clone(pipeline.sessions()))
            .with_bot_username(bot_username.clone()),
    );

    if let Err(e) = telegram.register_commands(&dispatcher.menu()).await {
        tracing::warn!("Failed to register command menu: {e}");
    }

    let channels: Vec<Arc<dyn Channel>> = vec![telegram];
    let ctx = Arc::new(ChannelRuntimeContext::new(pipeline, dispatcher, &channels));

    let (tx, rx) = tokio::sync::mpsc::channel::<ChannelMessage>(CHANNEL_MESSAGE_BUFFER);
    let mut handles = Vec::with_capacity(channels.len());
    for ch in &channels {
        handles.push(spawn_supervised_listener(
            Arc::clone(ch),
            tx.clone(),
            DEFAULT_CHANNEL_INITIAL_BACKOFF_SECS,
            DEFAULT_CHANNEL_MAX_BACKOFF_SECS,
        ));
    }
    drop(tx);

    tracing::info!(
        bot = bot_username.as_deref().unwrap_or("unknown"),
        max_in_flight = config.channels.max_in_flight_messages,
        "Bot started"
    );

    tokio::select! {
        () = run_message_dispatch_loop(rx, ctx, config.channels.max_in_flight_messages) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Failed to listen for Ctrl-C: {e}");
            }
            tracing::info!("Shutting down; in-flight requests are abandoned");
        }
    }

    for h in handles {
        h.abort();
    }

    Ok(())
}

/// Local conversation through the same pipeline: one message, or stdin until EOF.
pub async fn run_cli_chat(config: Config, message: Option<String>) -> Result<()> {
    let pipeline = Arc::new(pipeline::create_pipeline(&config).await?);
    let dispatcher = Arc::new(commands::create_dispatcher(Arc::clone(pipeline.sessions())));
    let cli: Arc<dyn Channel> = Arc::new(CliChannel::new());

    if let Some(message) = message {
        let ctx = Arc::new(ChannelRuntimeContext::new(pipeline, dispatcher, &[cli]));
        let (tx, rx) = tokio::sync::mpsc::channel::<ChannelMessage>(1);
        tx.send(ChannelMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender: CLI_USER_ID.to_string(),
            reply_target: CLI_USER_ID.to_string(),
            first_name: None,
            content: message,
            channel: "cli".to_string(),
            timestamp: u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default(),
        })
        .await
        .context("Failed to queue message")?;
        drop(tx);
        run_message_dispatch_loop(rx, ctx, 1).await;
        return Ok(());
    }

    println!("Type a message, /help for commands, /quit to exit.\n");
    let ctx = Arc::new(ChannelRuntimeContext::new(
        pipeline,
        dispatcher,
        std::slice::from_ref(&cli),
    ));
    let (tx, rx) = tokio::sync::mpsc::channel::<ChannelMessage>(CHANNEL_MESSAGE_BUFFER);
    let listener = tokio::spawn(async move { cli.listen(tx).await });
    run_message_dispatch_loop(rx, ctx, 1).await;
    listener.await.context("CLI listener task failed")??;
    Ok(())
}

enum ChannelHealthState {
    Healthy,
    Unhealthy,
    Timeout,
}

fn classify_health_result(
    result: &std::result::Result<bool, tokio::time::error::Elapsed>,
) -> ChannelHealthState {
    match result {
        Ok(true) => ChannelHealthState::Healthy,
        Ok(false) => ChannelHealthState::Unhealthy,
        Err(_) => ChannelHealthState::Timeout,
    }
}

/// Probe the configured channels. Returns `(name, status)` pairs for display.
pub async fn doctor_channels(config: &Config) -> Vec<(&'static str, &'static str)> {
    let mut channels: Vec<(&'static str, Arc<dyn Channel>)> = Vec::new();

    if let Some(ref tg) = config.channels.telegram {
        channels.push((
            "Telegram",
            Arc::new(TelegramChannel::new(
                tg.bot_token.clone(),
                tg.allowed_users.clone(),
            )),
        ));
    }

    let mut report = Vec::with_capacity(channels.len());
    for (name, channel) in channels {
        let result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, channel.health_check()).await;
        let status = match classify_health_result(&result) {
            ChannelHealthState::Healthy => "healthy",
            ChannelHealthState::Unhealthy => "unhealthy (check the bot token and network)",
            ChannelHealthState::Timeout => "timed out",
        };
        report.push((name, status));
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BACKEND_FAILURE_REPLY;
    use crate::providers::{ChatMessage, GenerationOptions, Provider, ProviderError};
    use crate::sessions::{InMemorySessionStore, SessionStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoProvider {
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Provider for EchoProvider {
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> std::result::Result<String, ProviderError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if self.fail_on == Some(last.as_str()) {
                return Err(ProviderError::transient("echo", "overloaded", Some(503)));
            }
            // Later messages finish first unless turns are serialized.
            let delay = 40_u64.saturating_sub(messages.len() as u64 * 10);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(format!("re: {last}"))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
        fail_for: Option<&'static str>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "test"
        }

        async fn send(&self, message: &str, recipient: &str) -> anyhow::Result<()> {
            if self.fail_for == Some(recipient) {
                anyhow::bail!("network unreachable");
            }
            self.sent
                .lock()
                .push((recipient.to_string(), message.to_string()));
            Ok(())
        }

        async fn listen(
            &self,
            _tx: tokio::sync::mpsc::Sender<ChannelMessage>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn message(sender: &str, content: &str) -> ChannelMessage {
        ChannelMessage {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.to_string(),
            reply_target: format!("chat-{sender}"),
            first_name: Some("Susan".to_string()),
            content: content.to_string(),
            channel: "test".to_string(),
            timestamp: 0,
        }
    }

    fn runtime(
        provider: impl Provider + 'static,
        channel: Arc<RecordingChannel>,
    ) -> (Arc<ChannelRuntimeContext>, Arc<dyn SessionStore>) {
        let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
        let pipeline = Arc::new(MessagePipeline::new(
            Arc::clone(&sessions),
            Arc::new(provider),
            "SYSTEM",
            GenerationOptions::default(),
        ));
        let dispatcher = Arc::new(commands::create_dispatcher(Arc::clone(&sessions)));
        let channels: Vec<Arc<dyn Channel>> = vec![channel];
        (
            Arc::new(ChannelRuntimeContext::new(pipeline, dispatcher, &channels)),
            sessions,
        )
    }

    async fn run(ctx: Arc<ChannelRuntimeContext>, messages: Vec<ChannelMessage>) {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        for msg in messages {
            tx.send(msg).await.unwrap();
        }
        drop(tx);
        tokio::time::timeout(
            Duration::from_secs(5),
            run_message_dispatch_loop(rx, ctx, 8),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn commands_and_text_are_routed_in_order() {
        let channel = Arc::new(RecordingChannel::default());
        let (ctx, sessions) = runtime(EchoProvider { fail_on: None }, Arc::clone(&channel));

        run(
            ctx,
            vec![
                message("1", "/start"),
                message("1", "first"),
                message("1", "second"),
                message("1", "/clear"),
                message("1", "third"),
            ],
        )
        .await;

        let sent = channel.sent.lock().clone();
        let texts: Vec<&str> = sent.iter().map(|(_, text)| text.as_str()).collect();
        assert_eq!(texts.len(), 5);
        assert!(texts[0].starts_with("Greetings, Susan."));
        assert_eq!(texts[1], "re: first");
        assert_eq!(texts[2], "re: second");
        assert_eq!(texts[3], commands::CLEAR_REPLY);
        assert_eq!(texts[4], "re: third");
        assert!(sent.iter().all(|(to, _)| to == "chat-1"));

        let history = sessions.snapshot("1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content(), "third");
    }

    /// Takes `delay` for messages starting with "slow", answers the rest at once.
    struct SlowProvider {
        delay: Duration,
    }

    #[async_trait]
    impl Provider for SlowProvider {
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _options: &GenerationOptions,
        ) -> std::result::Result<String, ProviderError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            if last.starts_with("slow") {
                tokio::time::sleep(self.delay).await;
            }
            Ok(format!("re: {last}"))
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn one_users_backlog_does_not_hold_up_others() {
        let channel = Arc::new(RecordingChannel::default());
        let (ctx, _) = runtime(
            SlowProvider {
                delay: Duration::from_millis(300),
            },
            Arc::clone(&channel),
        );

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        for i in 0..8 {
            tx.send(message("alice", &format!("slow {i}"))).await.unwrap();
        }
        tx.send(message("bob", "quick")).await.unwrap();
        drop(tx);

        let started = std::time::Instant::now();
        let dispatch = tokio::spawn(run_message_dispatch_loop(rx, ctx, 4));

        let bob_replied_after = loop {
            if channel.sent.lock().iter().any(|(to, _)| to == "chat-bob") {
                break started.elapsed();
            }
            assert!(started.elapsed() < Duration::from_secs(5), "bob never got a reply");
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(
            bob_replied_after < Duration::from_millis(250),
            "bob waited {bob_replied_after:?} behind alice's backlog"
        );

        tokio::time::timeout(Duration::from_secs(10), dispatch)
            .await
            .unwrap()
            .unwrap();
        let alice: Vec<String> = channel
            .sent
            .lock()
            .iter()
            .filter(|(to, _)| to == "chat-alice")
            .map(|(_, text)| text.clone())
            .collect();
        let expected: Vec<String> = (0..8).map(|i| format!("re: slow {i}")).collect();
        assert_eq!(alice, expected);
    }

    #[tokio::test]
    async fn in_flight_limit_still_bounds_distinct_users() {
        let channel = Arc::new(RecordingChannel::default());
        let (ctx, _) = runtime(
            SlowProvider {
                delay: Duration::from_millis(100),
            },
            Arc::clone(&channel),
        );

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        for user in ["a", "b", "c", "d"] {
            tx.send(message(user, "slow")).await.unwrap();
        }
        drop(tx);

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(5), run_message_dispatch_loop(rx, ctx, 2))
            .await
            .unwrap();

        // Two rounds of two concurrent turns.
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(channel.sent.lock().len(), 4);
    }

    #[tokio::test]
    async fn backend_failure_replies_with_fixed_text() {
        let channel = Arc::new(RecordingChannel::default());
        let (ctx, sessions) = runtime(
            EchoProvider {
                fail_on: Some("boom"),
            },
            Arc::clone(&channel),
        );

        run(ctx, vec![message("1", "ok"), message("1", "boom")]).await;

        let sent = channel.sent.lock().clone();
        assert_eq!(sent[1].1, BACKEND_FAILURE_REPLY);
        assert_eq!(sessions.len("1").await, 2);
    }

    #[tokio::test]
    async fn transport_fault_does_not_affect_other_users() {
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
            fail_for: Some("chat-1"),
        });
        let (ctx, sessions) = runtime(EchoProvider { fail_on: None }, Arc::clone(&channel));

        run(ctx, vec![message("1", "lost reply"), message("2", "hello")]).await;

        let sent = channel.sent.lock().clone();
        assert_eq!(sent, vec![("chat-2".to_string(), "re: hello".to_string())]);
        // The exchange itself succeeded; only delivery failed.
        assert_eq!(sessions.len("1").await, 2);
        assert_eq!(sessions.len("2").await, 2);
    }

    #[tokio::test]
    async fn unknown_channel_is_dropped() {
        let channel = Arc::new(RecordingChannel::default());
        let (ctx, sessions) = runtime(EchoProvider { fail_on: None }, Arc::clone(&channel));

        let mut msg = message("1", "hi");
        msg.channel = "nowhere".into();
        run(ctx, vec![msg]).await;

        assert!(channel.sent.lock().is_empty());
        assert_eq!(sessions.session_count(), 0);
    }

    struct AlwaysFailChannel {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Channel for AlwaysFailChannel {
        fn name(&self) -> &str {
            "test-supervised-fail"
        }

        async fn send(&self, _message: &str, _recipient: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn listen(
            &self,
            _tx: tokio::sync::mpsc::Sender<ChannelMessage>,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("listen boom")
        }
    }

    #[tokio::test]
    async fn supervised_listener_restarts_on_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let channel: Arc<dyn Channel> = Arc::new(AlwaysFailChannel {
            calls: Arc::clone(&calls),
        });

        let (tx, rx) = tokio::sync::mpsc::channel::<ChannelMessage>(1);
        let handle = spawn_supervised_listener(channel, tx, 1, 1);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);

        drop(rx);
        handle.abort();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn supervised_listener_stops_when_receiver_is_gone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let channel: Arc<dyn Channel> = Arc::new(AlwaysFailChannel {
            calls: Arc::clone(&calls),
        });

        let (tx, rx) = tokio::sync::mpsc::channel::<ChannelMessage>(1);
        drop(rx);
        let handle = spawn_supervised_listener(channel, tx, 1, 1);

        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classify_health_timeout() {
        let result = tokio::time::timeout(Duration::from_millis(1), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            true
        })
        .await;
        assert!(matches!(
            classify_health_result(&result),
            ChannelHealthState::Timeout
        ));
        assert!(matches!(
            classify_health_result(&Ok(true)),
            ChannelHealthState::Healthy
        ));
        assert!(matches!(
            classify_health_result(&Ok(false)),
            ChannelHealthState::Unhealthy
        ));
    }
}
