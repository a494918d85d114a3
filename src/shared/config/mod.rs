use anyhow::{anyhow, Result};
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Gateway configuration, built once in `main` and handed to each component.
#[derive(Clone, Debug)]
pub struct Config {
    pub ingress: IngressConfig,
    pub ari: AriConfig,
    pub voice: VoiceConfig,
    pub conversation: ConversationConfig,
    pub playback: PlaybackConfig,
}

#[derive(Clone, Debug)]
pub struct IngressConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    /// Host the PBX should stream external media to.
    pub advertised_host: String,
    pub bind_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct AriConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub app: String,
    pub http_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_base_delay: Duration,
    pub connect_max_delay: Duration,
    pub correlation_variables: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AudioWireFormat {
    G711Ulaw,
    Pcm16,
}

impl AudioWireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioWireFormat::G711Ulaw => "g711_ulaw",
            AudioWireFormat::Pcm16 => "pcm16",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "g711_ulaw" | "ulaw" | "pcmu" => Some(AudioWireFormat::G711Ulaw),
            "pcm16" | "slin" => Some(AudioWireFormat::Pcm16),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VoiceConfig {
    pub url: String,
    pub model: String,
    pub voice: String,
    pub api_key: String,
    pub audio_format: AudioWireFormat,
    pub commit_debounce: Duration,
    pub pending_audio_capacity: usize,
    pub initial_prompt: String,
    pub greeting_text: String,
}

impl VoiceConfig {
    /// Full WebSocket endpoint including the model query.
    pub fn endpoint(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, sep, self.model)
    }
}

#[derive(Clone, Debug)]
pub struct ConversationConfig {
    pub api_url: Option<String>,
    pub http_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    pub dir: std::path::PathBuf,
}

const DEFAULT_INITIAL_PROMPT: &str = "You are a friendly phone assistant. Keep answers short and speak naturally.";
const DEFAULT_GREETING: &str = "Hello";

impl Config {
    /// Create a Config populated from environment variables, falling back to defaults when keys are absent.
    ///
    /// `OPENAI_API_KEY` is the only required key; every other value has a default
    /// suitable for a PBX and gateway running on the same host.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use virtual_voicebot_gateway::config::Config;
    ///
    /// let cfg = Config::from_env().unwrap();
    /// let _port = cfg.ingress.port;
    /// ```
    pub fn from_env() -> Result<Self> {
        let bind_ip = env_non_empty("RTP_BIND_IP")
            .unwrap_or_else(|| "0.0.0.0".to_string())
            .parse::<IpAddr>()
            .map_err(|e| anyhow!("RTP_BIND_IP is not an IP address: {}", e))?;
        let ingress = IngressConfig {
            bind_ip,
            port: env_u16("RTP_PORT", 40000),
            advertised_host: env_non_empty("RTP_ADVERTISED_HOST")
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            bind_timeout: env_duration_ms("RTP_BIND_TIMEOUT_MS", 2_000),
        };

        let ari = AriConfig {
            base_url: env_non_empty("ARI_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8088/ari".to_string())
                .trim_end_matches('/')
                .to_string(),
            user: env_non_empty("ARI_USER").unwrap_or_else(|| "asterisk".to_string()),
            password: env_non_empty("ARI_PASSWORD").unwrap_or_else(|| "asterisk".to_string()),
            app: env_non_empty("ARI_APP").unwrap_or_else(|| "voicebot".to_string()),
            http_timeout: env_duration_ms("ARI_HTTP_TIMEOUT_MS", 5_000),
            connect_attempts: env_u32("ARI_CONNECT_ATTEMPTS", 5).max(1),
            connect_base_delay: env_duration_ms("ARI_CONNECT_BASE_DELAY_MS", 500),
            connect_max_delay: env_duration_ms("ARI_CONNECT_MAX_DELAY_MS", 10_000),
            correlation_variables: env_list("CORRELATION_VARIABLES", &["callSid", "CALL_SID"]),
        };

        let api_key = env_non_empty("OPENAI_API_KEY")
            .ok_or_else(|| anyhow!("OPENAI_API_KEY must be set"))?;
        let audio_format = match env_non_empty("OPENAI_AUDIO_FORMAT") {
            Some(raw) => AudioWireFormat::parse(&raw)
                .ok_or_else(|| anyhow!("OPENAI_AUDIO_FORMAT must be g711_ulaw or pcm16"))?,
            None => AudioWireFormat::G711Ulaw,
        };
        let pending_audio_capacity = env_usize("VOICE_PENDING_AUDIO_CAPACITY", 500);
        if pending_audio_capacity == 0 {
            return Err(anyhow!("VOICE_PENDING_AUDIO_CAPACITY must be greater than 0"));
        }
        let voice = VoiceConfig {
            url: env_non_empty("OPENAI_REALTIME_URL")
                .unwrap_or_else(|| "wss://api.openai.com/v1/realtime".to_string()),
            model: env_non_empty("OPENAI_REALTIME_MODEL")
                .unwrap_or_else(|| "gpt-4o-realtime-preview".to_string()),
            voice: env_non_empty("OPENAI_VOICE").unwrap_or_else(|| "alloy".to_string()),
            api_key,
            audio_format,
            commit_debounce: env_duration_ms("VOICE_COMMIT_DEBOUNCE_MS", 500),
            pending_audio_capacity,
            initial_prompt: env_non_empty("VOICE_INITIAL_PROMPT")
                .unwrap_or_else(|| DEFAULT_INITIAL_PROMPT.to_string()),
            greeting_text: env_non_empty("VOICE_GREETING_TEXT")
                .unwrap_or_else(|| DEFAULT_GREETING.to_string()),
        };

        let conversation = ConversationConfig {
            api_url: env_non_empty("CONVERSATION_API_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            http_timeout: env_duration_ms("CONVERSATION_HTTP_TIMEOUT_MS", 5_000),
        };

        let playback = PlaybackConfig {
            dir: env_non_empty("PLAYBACK_DIR")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        };

        Ok(Self {
            ingress,
            ari,
            voice,
            conversation,
            playback,
        })
    }
}

#[derive(Clone, Debug)]
pub enum LogMode {
    Stdout,
    File,
}

#[derive(Clone, Debug)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub mode: LogMode,
    pub format: LogFormat,
    pub dir: Option<String>,
    pub file_name: String,
}

impl LoggingConfig {
    fn from_env() -> Self {
        let dir_env = std::env::var("LOG_DIR").ok();
        let mode_env = std::env::var("LOG_MODE").ok();
        let format_env = std::env::var("LOG_FORMAT").ok();

        let format = match format_env.as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let mode = match mode_env.as_deref() {
            Some("file") => LogMode::File,
            Some("stdout") => LogMode::Stdout,
            _ => {
                if dir_env.is_some() {
                    LogMode::File
                } else {
                    LogMode::Stdout
                }
            }
        };

        let dir = match mode {
            LogMode::File => Some(dir_env.unwrap_or_else(|| "logs".to_string())),
            LogMode::Stdout => None,
        };

        let file_name =
            std::env::var("LOG_FILE_NAME").unwrap_or_else(|_| "gateway.log".to_string());

        Self {
            mode,
            format,
            dir,
            file_name,
        }
    }
}

static LOGGING: OnceLock<LoggingConfig> = OnceLock::new();

pub fn logging_config() -> &'static LoggingConfig {
    LOGGING.get_or_init(LoggingConfig::from_env)
}

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_ms))
}

fn env_u16(key: &str, default_value: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(default_value)
}

fn env_u32(key: &str, default_value: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_value)
}

fn env_u64(key: &str, default_value: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_value)
}

fn env_usize(key: &str, default_value: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default_value)
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_list(key: &str, default_values: &[&str]) -> Vec<String> {
    match env_non_empty(key) {
        Some(raw) => split_list(&raw),
        None => default_values.iter().map(|v| v.to_string()).collect(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
