//! In-memory control plane and wiring for controller tests.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::interface::conversation::NoopConversationStore;
use crate::protocol::ingress::MediaIngress;
use crate::service::call_control::CallController;
use crate::service::registry::CallRegistry;
use crate::service::voice::{RealtimeConnector, RealtimeLink, VoiceFuture, VoiceSessionManager};
use crate::shared::config::{
    AriConfig, AudioWireFormat, Config, ConversationConfig, IngressConfig, PlaybackConfig,
    VoiceConfig,
};
use crate::shared::entities::{BridgeId, CallState, ChannelId};
use crate::shared::error::ControlError;
use crate::shared::ports::{
    voice_event_channel, ChannelInfo, ControlEvent, ControlFuture, ControlPlanePort,
    ExternalMediaChannel, ExternalMediaRequest, SnoopRequest, VoiceEventRx,
};

pub(crate) fn test_config(playback_dir: &Path) -> Config {
    Config {
        ingress: IngressConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            advertised_host: "127.0.0.1".to_string(),
            bind_timeout: Duration::from_secs(1),
        },
        ari: AriConfig {
            base_url: "http://pbx.test/ari".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            app: "voicebot".to_string(),
            http_timeout: Duration::from_secs(1),
            connect_attempts: 3,
            connect_base_delay: Duration::from_millis(10),
            connect_max_delay: Duration::from_millis(50),
            correlation_variables: vec!["callSid".to_string(), "CALL_SID".to_string()],
        },
        voice: VoiceConfig {
            url: "wss://voice.test/v1/realtime".to_string(),
            model: "m".to_string(),
            voice: "alloy".to_string(),
            api_key: "k".to_string(),
            audio_format: AudioWireFormat::G711Ulaw,
            commit_debounce: Duration::from_millis(500),
            pending_audio_capacity: 16,
            initial_prompt: "be brief".to_string(),
            greeting_text: "Hello".to_string(),
        },
        conversation: ConversationConfig {
            api_url: None,
            http_timeout: Duration::from_secs(1),
        },
        playback: PlaybackConfig {
            dir: playback_dir.to_path_buf(),
        },
    }
}

pub(crate) fn entered(id: &str, name: &str, args: &[&str]) -> ControlEvent {
    ControlEvent::ChannelEnteredApp {
        channel: ChannelInfo {
            id: ChannelId::new(id),
            name: name.to_string(),
            caller_number: Some("+15550100".to_string()),
        },
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

/// Records every command as one line, e.g. `add_channel B1 CH1`.
#[derive(Default)]
pub(crate) struct MockControl {
    log: Mutex<Vec<String>>,
    vars: Mutex<HashMap<(String, String), String>>,
    failing: Mutex<HashSet<String>>,
    connect_fails: AtomicBool,
    bridges: AtomicU32,
    upload_delay: Mutex<Option<Duration>>,
    subscriptions: Mutex<Option<mpsc::UnboundedSender<mpsc::Sender<ControlEvent>>>>,
    subscribed: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<mpsc::Sender<ControlEvent>>>>,
}

impl MockControl {
    pub(crate) fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mock = Self::default();
        *mock.subscriptions.lock().unwrap() = Some(tx);
        *mock.subscribed.try_lock().unwrap() = Some(rx);
        Arc::new(mock)
    }

    pub(crate) fn set_variable(&self, channel: &str, name: &str, value: &str) {
        self.vars
            .lock()
            .unwrap()
            .insert((channel.to_string(), name.to_string()), value.to_string());
    }

    pub(crate) fn fail_command(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Makes the next `upload_sound` take `delay` before answering.
    pub(crate) fn delay_next_upload(&self, delay: Duration) {
        *self.upload_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.connect_fails.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn commands_matching(&self, names: &[&str]) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|line| names.contains(&line.split(' ').next().unwrap_or("")))
            .collect()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.commands_matching(&[name]).len()
    }

    pub(crate) fn count_exact(&self, line: &str) -> usize {
        self.commands().iter().filter(|l| l.as_str() == line).count()
    }

    pub(crate) async fn wait_for(&self, line: &str) {
        for _ in 0..400 {
            if self.count_exact(line) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("command {:?} never issued; got {:?}", line, self.commands());
    }

    pub(crate) async fn wait_for_prefix(&self, prefix: &str) {
        for _ in 0..400 {
            if self.commands().iter().any(|l| l.starts_with(prefix)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no command starting with {:?}; got {:?}", prefix, self.commands());
    }

    /// Event sender of the next `subscribe_app`; dropping it ends the stream.
    pub(crate) async fn next_subscription(&self) -> mpsc::Sender<ControlEvent> {
        let mut guard = self.subscribed.lock().await;
        let rx = guard.as_mut().expect("subscriptions receiver");
        rx.recv().await.expect("subscription")
    }

    fn record(&self, line: String) -> Result<(), ControlError> {
        let name = line.split(' ').next().unwrap_or("").to_string();
        self.log.lock().unwrap().push(line);
        if self.failing.lock().unwrap().contains(&name) {
            return Err(ControlError::Status {
                status: 500,
                body: format!("{} failed", name),
            });
        }
        Ok(())
    }
}

fn ready<T: Send + 'static>(res: Result<T, ControlError>) -> ControlFuture<T> {
    Box::pin(async move { res })
}

impl ControlPlanePort for MockControl {
    fn connect(&self) -> ControlFuture<()> {
        let res = self.record("connect".to_string());
        if self.connect_fails.load(Ordering::SeqCst) {
            return ready(Err(ControlError::Http("connection refused".to_string())));
        }
        ready(res)
    }

    fn subscribe_app(&self) -> ControlFuture<mpsc::Receiver<ControlEvent>> {
        let res = self.record("subscribe_app".to_string());
        let (tx, rx) = mpsc::channel(64);
        if let Some(subs) = self.subscriptions.lock().unwrap().as_ref() {
            let _ = subs.send(tx);
        }
        ready(res.map(|_| rx))
    }

    fn answer(&self, channel: &ChannelId) -> ControlFuture<()> {
        ready(self.record(format!("answer {}", channel)))
    }

    fn play(&self, channel: &ChannelId, media: &str) -> ControlFuture<String> {
        let res = self.record(format!("play {} {}", channel, media));
        ready(res.map(|_| "PB1".to_string()))
    }

    fn hangup(&self, channel: &ChannelId) -> ControlFuture<()> {
        ready(self.record(format!("hangup {}", channel)))
    }

    fn get_variable(&self, channel: &ChannelId, name: &str) -> ControlFuture<Option<String>> {
        let res = self.record(format!("get_variable {} {}", channel, name));
        let value = self
            .vars
            .lock()
            .unwrap()
            .get(&(channel.to_string(), name.to_string()))
            .cloned();
        ready(res.map(|_| value))
    }

    fn create_bridge(&self) -> ControlFuture<BridgeId> {
        let n = self.bridges.fetch_add(1, Ordering::SeqCst) + 1;
        let res = self.record(format!("create_bridge B{}", n));
        ready(res.map(|_| BridgeId::new(format!("B{}", n))))
    }

    fn add_channel(&self, bridge: &BridgeId, channel: &ChannelId) -> ControlFuture<()> {
        ready(self.record(format!("add_channel {} {}", bridge, channel)))
    }

    fn record_bridge(&self, bridge: &BridgeId, name: &str) -> ControlFuture<String> {
        let res = self.record(format!("record_bridge {}", bridge));
        let name = name.to_string();
        ready(res.map(|_| name))
    }

    fn destroy_bridge(&self, bridge: &BridgeId) -> ControlFuture<()> {
        ready(self.record(format!("destroy_bridge {}", bridge)))
    }

    fn snoop(&self, request: SnoopRequest) -> ControlFuture<ChannelId> {
        let res = self.record(format!(
            "snoop {} {} {}",
            request.channel, request.snoop_id, request.app_args
        ));
        ready(res.map(|_| request.snoop_id))
    }

    fn external_media(&self, request: ExternalMediaRequest) -> ControlFuture<ExternalMediaChannel> {
        let res = self.record(format!(
            "external_media {} {} {}",
            request.channel_id, request.external_host, request.format
        ));
        ready(res.map(|_| ExternalMediaChannel {
            channel: request.channel_id,
            rtp_source: None,
        }))
    }

    fn upload_sound(&self, name: &str, _data: Vec<u8>) -> ControlFuture<()> {
        let res = self.record(format!("upload_sound {}", name));
        let delay = self.upload_delay.lock().unwrap().take();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            res
        })
    }
}

/// Voice connector that never finishes connecting.
pub(crate) struct StalledConnector;

impl RealtimeConnector for StalledConnector {
    fn connect(&self) -> VoiceFuture<RealtimeLink> {
        Box::pin(std::future::pending())
    }
}

pub(crate) struct Harness {
    pub(crate) controller: CallController,
    pub(crate) control: Arc<MockControl>,
    pub(crate) voice: VoiceSessionManager,
    pub(crate) ingress: MediaIngress,
    pub(crate) _voice_events: VoiceEventRx,
    pub(crate) _playback_dir: tempfile::TempDir,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let playback_dir = tempfile::tempdir().unwrap();
        let cfg = test_config(playback_dir.path());
        let control = MockControl::new();
        let registry = CallRegistry::new();
        let (events_tx, events_rx) = voice_event_channel(256);
        let voice = VoiceSessionManager::new(
            cfg.voice.clone(),
            Arc::new(StalledConnector),
            events_tx,
            Arc::new(NoopConversationStore::new()),
        );
        let ingress = MediaIngress::new(
            cfg.ingress.clone(),
            registry.clone(),
            Arc::new(voice.clone()),
        );
        let controller = CallController::new(
            cfg,
            control.clone(),
            registry,
            ingress.clone(),
            voice.clone(),
            Arc::new(NoopConversationStore::new()),
        );
        Self {
            controller,
            control,
            voice,
            ingress,
            _voice_events: events_rx,
            _playback_dir: playback_dir,
        }
    }

    pub(crate) fn playback_dir(&self) -> &Path {
        self._playback_dir.path()
    }

    pub(crate) async fn wait_state(&self, id: &str, state: CallState) {
        for _ in 0..400 {
            if self
                .controller
                .registry()
                .find(id)
                .is_some_and(|s| s.state == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "call {} never reached {}; commands {:?}",
            id,
            state,
            self.control.commands()
        );
    }

    pub(crate) async fn wait_gone(&self, id: &str) {
        for _ in 0..400 {
            if self.controller.registry().find(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("call {} never cleaned up", id);
    }
}
