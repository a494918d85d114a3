use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use tempfile::tempdir;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use virtual_voicebot_gateway::call_control::CallController;
use virtual_voicebot_gateway::config::{
    AriConfig, AudioWireFormat, Config, ConversationConfig, IngressConfig, PlaybackConfig,
    VoiceConfig,
};
use virtual_voicebot_gateway::conversation::NoopConversationStore;
use virtual_voicebot_gateway::entities::{BridgeId, CallState, ChannelId};
use virtual_voicebot_gateway::error::VoiceError;
use virtual_voicebot_gateway::ingress::MediaIngress;
use virtual_voicebot_gateway::logging;
use virtual_voicebot_gateway::media::codec::linear16_to_mulaw;
use virtual_voicebot_gateway::ports::{
    voice_event_channel, ChannelInfo, ControlEvent, ControlFuture, ControlPlanePort,
    ExternalMediaChannel, ExternalMediaRequest, SnoopRequest,
};
use virtual_voicebot_gateway::registry::CallRegistry;
use virtual_voicebot_gateway::voice::{
    RealtimeConnector, RealtimeFrame, RealtimeLink, VoiceFuture, VoiceSessionManager,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WAIT_STEPS: usize = 400;
const WAIT_STEP: Duration = Duration::from_millis(5);

struct TaskGuard(tokio::task::JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// PBX stand-in: logs commands as `name arg...` and hands out event streams.
#[derive(Default)]
struct FakePbx {
    log: Mutex<Vec<String>>,
    vars: Mutex<HashMap<(String, String), String>>,
    events: Mutex<Option<mpsc::Sender<ControlEvent>>>,
    bridges: AtomicU32,
}

impl FakePbx {
    fn record(&self, line: String) {
        self.log.lock().unwrap().push(line);
    }

    fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn issued(&self, line: &str) -> usize {
        self.commands().iter().filter(|l| l.as_str() == line).count()
    }

    async fn wait_for(&self, line: &str) -> Result<(), String> {
        for _ in 0..WAIT_STEPS {
            if self.issued(line) > 0 {
                return Ok(());
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        Err(format!("{:?} never issued; got {:?}", line, self.commands()))
    }

    async fn events(&self) -> Result<mpsc::Sender<ControlEvent>, String> {
        for _ in 0..WAIT_STEPS {
            if let Some(tx) = self.events.lock().unwrap().clone() {
                return Ok(tx);
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        Err("controller never subscribed".to_string())
    }
}

fn ok<T: Send + 'static>(value: T) -> ControlFuture<T> {
    Box::pin(async move { Ok(value) })
}

impl ControlPlanePort for FakePbx {
    fn connect(&self) -> ControlFuture<()> {
        self.record("connect".to_string());
        ok(())
    }

    fn subscribe_app(&self) -> ControlFuture<mpsc::Receiver<ControlEvent>> {
        self.record("subscribe_app".to_string());
        let (tx, rx) = mpsc::channel(64);
        *self.events.lock().unwrap() = Some(tx);
        ok(rx)
    }

    fn answer(&self, channel: &ChannelId) -> ControlFuture<()> {
        self.record(format!("answer {}", channel));
        ok(())
    }

    fn play(&self, channel: &ChannelId, media: &str) -> ControlFuture<String> {
        self.record(format!("play {} {}", channel, media));
        ok("PB1".to_string())
    }

    fn hangup(&self, channel: &ChannelId) -> ControlFuture<()> {
        self.record(format!("hangup {}", channel));
        ok(())
    }

    fn get_variable(&self, channel: &ChannelId, name: &str) -> ControlFuture<Option<String>> {
        let value = self
            .vars
            .lock()
            .unwrap()
            .get(&(channel.to_string(), name.to_string()))
            .cloned();
        ok(value)
    }

    fn create_bridge(&self) -> ControlFuture<BridgeId> {
        let n = self.bridges.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(format!("create_bridge B{}", n));
        ok(BridgeId::new(format!("B{}", n)))
    }

    fn add_channel(&self, bridge: &BridgeId, channel: &ChannelId) -> ControlFuture<()> {
        self.record(format!("add_channel {} {}", bridge, channel));
        ok(())
    }

    fn record_bridge(&self, bridge: &BridgeId, name: &str) -> ControlFuture<String> {
        self.record(format!("record_bridge {} {}", bridge, name));
        ok(name.to_string())
    }

    fn destroy_bridge(&self, bridge: &BridgeId) -> ControlFuture<()> {
        self.record(format!("destroy_bridge {}", bridge));
        ok(())
    }

    fn snoop(&self, request: SnoopRequest) -> ControlFuture<ChannelId> {
        self.record(format!("snoop {} {}", request.channel, request.snoop_id));
        ok(request.snoop_id)
    }

    fn external_media(&self, request: ExternalMediaRequest) -> ControlFuture<ExternalMediaChannel> {
        self.record(format!(
            "external_media {} {}",
            request.channel_id, request.format
        ));
        ok(ExternalMediaChannel {
            channel: request.channel_id,
            rtp_source: None,
        })
    }

    fn upload_sound(&self, name: &str, data: Vec<u8>) -> ControlFuture<()> {
        self.record(format!("upload_sound {} {}", name, data.len()));
        ok(())
    }
}

/// Server side of one fake realtime connection.
struct Remote {
    frames: mpsc::Receiver<RealtimeFrame>,
    server: mpsc::Sender<Result<String, VoiceError>>,
}

impl Remote {
    async fn send(&self, raw: &str) -> TestResult {
        self.server.send(Ok(raw.to_string())).await?;
        Ok(())
    }

    /// Skips frames until one of `kind` arrives.
    async fn expect(&mut self, kind: &str) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
                .await?
                .ok_or("voice link closed")?;
            let RealtimeFrame::Text(text) = frame else {
                return Err(format!("link closed while waiting for {}", kind).into());
            };
            let value: serde_json::Value = serde_json::from_str(&text)?;
            if value["type"] == kind {
                return Ok(value);
            }
        }
    }

    /// Collects every frame sent before the next `kind` frame.
    async fn frames_until(
        &mut self,
        kind: &str,
    ) -> Result<Vec<serde_json::Value>, Box<dyn std::error::Error>> {
        let mut seen = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
                .await?
                .ok_or("voice link closed")?;
            let RealtimeFrame::Text(text) = frame else {
                return Err(format!("link closed while waiting for {}", kind).into());
            };
            let value: serde_json::Value = serde_json::from_str(&text)?;
            if value["type"] == kind {
                return Ok(seen);
            }
            seen.push(value);
        }
    }
}

struct FakeRealtime {
    remotes: mpsc::UnboundedSender<Remote>,
}

impl RealtimeConnector for FakeRealtime {
    fn connect(&self) -> VoiceFuture<RealtimeLink> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        let sent = self.remotes.send(Remote {
            frames: out_rx,
            server: in_tx,
        });
        Box::pin(async move {
            sent.map_err(|_| VoiceError::Connect("test gone".to_string()))?;
            Ok(RealtimeLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}

fn config(playback_dir: &Path) -> Config {
    Config {
        ingress: IngressConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            advertised_host: "127.0.0.1".to_string(),
            bind_timeout: Duration::from_secs(1),
        },
        ari: AriConfig {
            base_url: "http://pbx.test/ari".to_string(),
            user: "asterisk".to_string(),
            password: "asterisk".to_string(),
            app: "voicebot".to_string(),
            http_timeout: Duration::from_secs(1),
            connect_attempts: 2,
            connect_base_delay: Duration::from_millis(10),
            connect_max_delay: Duration::from_millis(20),
            correlation_variables: vec!["callSid".to_string()],
        },
        voice: VoiceConfig {
            url: "wss://voice.test/v1/realtime".to_string(),
            model: "test-model".to_string(),
            voice: "alloy".to_string(),
            api_key: "key".to_string(),
            audio_format: AudioWireFormat::G711Ulaw,
            commit_debounce: Duration::from_millis(50),
            pending_audio_capacity: 64,
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

struct Gateway {
    pbx: Arc<FakePbx>,
    registry: CallRegistry,
    ingress: MediaIngress,
    controller: CallController,
    remotes: mpsc::UnboundedReceiver<Remote>,
    shutdown: CancellationToken,
    _run: TaskGuard,
    _playback_dir: tempfile::TempDir,
}

impl Gateway {
    async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        env::set_var("LOG_MODE", "stdout");
        env::set_var("LOG_FORMAT", "text");
        env::set_var("RUST_LOG", "info");
        logging::init();

        let playback_dir = tempdir()?;
        let cfg = config(playback_dir.path());
        let pbx = Arc::new(FakePbx::default());
        let registry = CallRegistry::new();
        let (remote_tx, remotes) = mpsc::unbounded_channel();
        let (voice_tx, voice_rx) = voice_event_channel(64);
        let store = Arc::new(NoopConversationStore::new());
        let voice = VoiceSessionManager::new(
            cfg.voice.clone(),
            Arc::new(FakeRealtime { remotes: remote_tx }),
            voice_tx,
            store.clone(),
        );
        let ingress = MediaIngress::new(
            cfg.ingress.clone(),
            registry.clone(),
            Arc::new(voice.clone()),
        );
        ingress.start().await?;
        let controller = CallController::new(
            cfg,
            pbx.clone(),
            registry.clone(),
            ingress.clone(),
            voice,
            store,
        );

        let shutdown = CancellationToken::new();
        let run = {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = controller.run(voice_rx, shutdown).await {
                    log::error!("[e2e] controller stopped: {}", err);
                }
            })
        };

        Ok(Self {
            pbx,
            registry,
            ingress,
            controller,
            remotes,
            shutdown,
            _run: TaskGuard(run),
            _playback_dir: playback_dir,
        })
    }

    async fn wait_state(&self, id: &str, state: CallState) -> TestResult {
        for _ in 0..WAIT_STEPS {
            if self.registry.find(id).is_some_and(|s| s.state == state) {
                return Ok(());
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        Err(format!(
            "{} never reached {}; commands {:?}",
            id,
            state.as_str(),
            self.pbx.commands()
        )
        .into())
    }

    async fn wait_gone(&self, id: &str) -> TestResult {
        for _ in 0..WAIT_STEPS {
            if self.registry.find(id).is_none() {
                return Ok(());
            }
            tokio::time::sleep(WAIT_STEP).await;
        }
        Err(format!("{} never cleaned up", id).into())
    }

    /// Drives CH1 (callSid=ABC123) up to the point where it waits for RTP.
    async fn place_call(&mut self) -> Result<Remote, Box<dyn std::error::Error>> {
        self.pbx.vars.lock().unwrap().insert(
            ("CH1".to_string(), "callSid".to_string()),
            "ABC123".to_string(),
        );
        let events = self.pbx.events().await?;
        events.send(entered("CH1", "PJSIP/trunk-00000001", &[])).await?;
        self.wait_state("CH1", CallState::SnoopCreated).await?;
        events
            .send(entered("snoop-CH1", "Snoop/PJSIP/trunk-00000001", &["snoop", "CH1"]))
            .await?;
        self.wait_state("CH1", CallState::ExternalMediaAwaitingSsrc)
            .await?;
        let remote = tokio::time::timeout(Duration::from_secs(2), self.remotes.recv())
            .await?
            .ok_or("voice session never connected")?;
        Ok(remote)
    }
}

fn entered(id: &str, name: &str, args: &[&str]) -> ControlEvent {
    ControlEvent::ChannelEnteredApp {
        channel: ChannelInfo {
            id: ChannelId::new(id),
            name: name.to_string(),
            caller_number: Some("+15550100".to_string()),
        },
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

/// Constant sample level carried by packet `seq`.
fn level(seq: u16) -> i16 {
    (i16::try_from(seq).unwrap_or(0) + 1) * 1000
}

/// RTP packet carrying 20 ms of big-endian PCM16 at `level(seq)`.
fn rtp_packet(seq: u16, ssrc: u32) -> Vec<u8> {
    let mut pkt = vec![0x80, 118];
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&(u32::from(seq) * 160).to_be_bytes());
    pkt.extend_from_slice(&ssrc.to_be_bytes());
    for _ in 0..160 {
        pkt.extend_from_slice(&level(seq).to_be_bytes());
    }
    pkt
}

async fn send_rtp(to: SocketAddr, packets: u16, ssrc: u32) -> TestResult {
    let sock = UdpSocket::bind("127.0.0.1:0").await?;
    for seq in 0..packets {
        sock.send_to(&rtp_packet(seq, ssrc), to).await?;
    }
    Ok(())
}

#[tokio::test]
async fn rtp_reaches_voice_session_and_reply_is_played() -> TestResult {
    let mut gw = Gateway::start().await?;
    let mut remote = gw.place_call().await?;

    assert_eq!(gw.pbx.issued("answer CH1"), 1);
    assert_eq!(gw.pbx.issued("add_channel B1 CH1"), 1);
    assert_eq!(gw.pbx.issued("record_bridge B1 call-CH1"), 1);
    assert_eq!(gw.pbx.issued("external_media extmedia-CH1 slin"), 1);
    assert_eq!(gw.pbx.issued("add_channel B2 snoop-CH1"), 1);
    assert_eq!(gw.pbx.issued("add_channel B2 extmedia-CH1"), 1);

    let addr = gw.ingress.local_addr().await.ok_or("ingress not listening")?;
    send_rtp(addr, 3, 555).await?;
    gw.wait_state("CH1", CallState::Streaming).await?;
    let session = gw.registry.find("ABC123").ok_or("call not found by correlation id")?;
    assert_eq!(session.ssrc, Some(555));

    remote.send(r#"{"type":"session.created","session":{}}"#).await?;
    let update = remote.expect("session.update").await?;
    assert_eq!(update["session"]["input_audio_format"], "g711_ulaw");
    let appends: Vec<Vec<u8>> = remote
        .frames_until("input_audio_buffer.commit")
        .await?
        .iter()
        .filter(|frame| frame["type"] == "input_audio_buffer.append")
        .map(|frame| {
            base64::engine::general_purpose::STANDARD
                .decode(frame["audio"].as_str().unwrap_or_default())
                .unwrap()
        })
        .collect();
    assert_eq!(appends.len(), 3, "appends before commit");
    for (seq, audio) in (0u16..).zip(&appends) {
        assert_eq!(audio, &vec![linear16_to_mulaw(level(seq)); 160], "packet {}", seq);
    }

    let reply = base64::engine::general_purpose::STANDARD.encode([0xFFu8; 160]);
    remote
        .send(&format!(r#"{{"type":"response.audio.delta","delta":"{}"}}"#, reply))
        .await?;
    let mut played = None;
    for _ in 0..WAIT_STEPS {
        played = gw
            .pbx
            .commands()
            .into_iter()
            .find(|l| l.starts_with("play CH1 sound:voicebot-"));
        if played.is_some() {
            break;
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
    assert!(played.is_some(), "no playback: {:?}", gw.pbx.commands());
    assert!(gw
        .pbx
        .commands()
        .iter()
        .any(|l| l.starts_with("upload_sound voicebot-")));

    gw.shutdown.cancel();
    gw.wait_gone("CH1").await?;
    gw.ingress.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn voice_failure_tears_the_call_down_once() -> TestResult {
    let mut gw = Gateway::start().await?;
    let mut remote = gw.place_call().await?;
    let addr = gw.ingress.local_addr().await.ok_or("ingress not listening")?;
    send_rtp(addr, 1, 777).await?;
    gw.wait_state("CH1", CallState::Streaming).await?;

    remote
        .send(r#"{"type":"error","error":{"message":"session expired","code":"session_expired"}}"#)
        .await?;
    gw.wait_gone("CH1").await?;
    for line in [
        "hangup CH1",
        "hangup snoop-CH1",
        "hangup extmedia-CH1",
        "destroy_bridge B1",
        "destroy_bridge B2",
    ] {
        gw.pbx.wait_for(line).await?;
    }
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(2), remote.frames.recv()).await?,
        Some(RealtimeFrame::Close) | None
    ));

    // the PBX echoes the teardown; nothing is released twice
    let events = gw.pbx.events().await?;
    events
        .send(ControlEvent::ChannelDestroyed {
            channel: ChannelId::new("CH1"),
            cause: Some(16),
        })
        .await?;
    assert!(!gw.controller.cleanup("CH1").await);
    assert!(!gw.controller.cleanup("ABC123").await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gw.pbx.issued("hangup CH1"), 1);
    assert_eq!(gw.pbx.issued("destroy_bridge B1"), 1);

    // the stream's SSRC is no longer routed anywhere
    send_rtp(addr, 1, 777).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(gw.ingress.ssrc_table().get(777).is_none());
    assert!(gw.registry.is_empty());

    gw.shutdown.cancel();
    gw.ingress.shutdown().await;
    Ok(())
}
