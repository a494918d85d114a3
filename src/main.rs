use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use virtual_voicebot_gateway::ari::AriClient;
use virtual_voicebot_gateway::call_control::CallController;
use virtual_voicebot_gateway::config::Config;
use virtual_voicebot_gateway::conversation::{HttpConversationStore, NoopConversationStore};
use virtual_voicebot_gateway::ingress::MediaIngress;
use virtual_voicebot_gateway::logging;
use virtual_voicebot_gateway::ports::{voice_event_channel, AudioSink, ConversationStore};
use virtual_voicebot_gateway::registry::CallRegistry;
use virtual_voicebot_gateway::voice::{VoiceSessionManager, WsConnector};

const VOICE_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Wires the gateway together and runs it until ctrl-c / SIGTERM.
///
/// The RTP listener is started eagerly; if that fails the first call that
/// needs it retries the bind. Returns an error only when configuration is
/// invalid or the control plane stays unreachable.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cfg = Config::from_env()?;
    log::info!(
        "[main] starting: ari={} app={} rtp={}:{} voice_model={}",
        cfg.ari.base_url,
        cfg.ari.app,
        cfg.ingress.bind_ip,
        cfg.ingress.port,
        cfg.voice.model
    );

    let (voice_tx, voice_rx) = voice_event_channel(VOICE_EVENT_CHANNEL_CAPACITY);
    let registry = CallRegistry::new();

    let store: Arc<dyn ConversationStore> = match cfg.conversation.api_url.as_deref() {
        Some(url) => match HttpConversationStore::new(url, &cfg.conversation) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                log::warn!("[main] conversation store init failed: {}", err);
                Arc::new(NoopConversationStore::new())
            }
        },
        None => Arc::new(NoopConversationStore::new()),
    };

    let connector = Arc::new(WsConnector::new(&cfg.voice));
    let voice = VoiceSessionManager::new(cfg.voice.clone(), connector, voice_tx, store.clone());
    let sink: Arc<dyn AudioSink> = Arc::new(voice.clone());
    let ingress = MediaIngress::new(cfg.ingress.clone(), registry.clone(), sink);
    let control = Arc::new(AriClient::new(cfg.ari.clone())?);

    if let Err(err) = ingress.start().await {
        log::warn!("[main] rtp listener will be retried on the first call: {}", err);
    }

    let controller = CallController::new(
        cfg,
        control,
        registry,
        ingress.clone(),
        voice,
        store,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let result = controller.run(voice_rx, shutdown).await;
    ingress.shutdown().await;
    match result {
        Ok(()) => {
            log::info!("[main] stopped");
            Ok(())
        }
        Err(err) => {
            log::error!("[main] control loop failed: {}", err);
            Err(err.into())
        }
    }
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            log::warn!("[main] shutdown signal error: {:?}", err);
                        }
                    }
                    _ = term.recv() => log::info!("[main] SIGTERM received"),
                }
            }
            Err(err) => {
                log::warn!("[main] SIGTERM handler unavailable: {:?}", err);
                if let Err(err) = tokio::signal::ctrl_c().await {
                    log::warn!("[main] shutdown signal error: {:?}", err);
                }
            }
        }
    }
    #[cfg(not(unix))]
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::warn!("[main] shutdown signal error: {:?}", err);
    }
    log::info!("[main] shutting down");
    shutdown.cancel();
}
