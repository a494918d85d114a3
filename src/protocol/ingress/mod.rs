//! RTP ingress: one UDP socket receiving every call's external-media stream.
//!
//! Packets are demultiplexed by SSRC. An unknown SSRC is bound to the call that
//! is waiting for its external media stream; after that the binding is reused
//! without consulting the waiting calls again.

mod ssrc;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::rtp::parse_rtp_packet;
use crate::service::registry::{CallRegistry, SsrcClaim};
use crate::shared::config::IngressConfig;
use crate::shared::entities::CallId;
use crate::shared::error::{IngressError, RtpParseError};
use crate::shared::media::{AudioCodec, PcmFormat};
use crate::shared::ports::AudioSink;

pub use ssrc::SsrcTable;

const RECV_BUFFER_LEN: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(RtpParseError),
    NoWaitingCall,
    AmbiguousWaiting(usize),
    StaleMapping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// First packet of a stream: SSRC bound to the call, payload forwarded.
    Bound { call_id: CallId, ssrc: u32 },
    Forwarded { call_id: CallId },
    Dropped(DropReason),
}

struct Listener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    cfg: IngressConfig,
    registry: CallRegistry,
    sink: Arc<dyn AudioSink>,
    ssrc: SsrcTable,
    codec: AudioCodec,
    listener: Mutex<Option<Listener>>,
}

#[derive(Clone)]
pub struct MediaIngress {
    inner: Arc<Inner>,
}

impl MediaIngress {
    pub fn new(cfg: IngressConfig, registry: CallRegistry, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                registry,
                sink,
                ssrc: SsrcTable::new(),
                codec: AudioCodec::new(PcmFormat::SLIN_RTP),
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn ssrc_table(&self) -> &SsrcTable {
        &self.inner.ssrc
    }

    /// Binds the listener. A bind failure is logged and leaves the service stopped.
    pub async fn start(&self) -> Result<SocketAddr, IngressError> {
        let res = self.ensure_ready().await;
        if let Err(err) = &res {
            log::error!("[ingress] rtp listener not started: {}", err);
        }
        res
    }

    /// Starts the listener if it is not running and returns its bound address.
    pub async fn ensure_ready(&self) -> Result<SocketAddr, IngressError> {
        let mut slot = self.inner.listener.lock().await;
        if let Some(listener) = slot.as_ref() {
            if !listener.task.is_finished() {
                return Ok(listener.local_addr);
            }
            log::info!("[ingress] previous rtp listener has stopped, rebinding");
        }

        let addr = SocketAddr::new(self.inner.cfg.bind_ip, self.inner.cfg.port);
        let timeout = self.inner.cfg.bind_timeout;
        let sock = match tokio::time::timeout(timeout, UdpSocket::bind(addr)).await {
            Ok(Ok(sock)) => sock,
            Ok(Err(source)) => return Err(IngressError::Bind { addr, source }),
            Err(_) => return Err(IngressError::BindTimeout(timeout)),
        };
        let local_addr = sock
            .local_addr()
            .map_err(|source| IngressError::Bind { addr, source })?;
        log::info!("[ingress] rtp listener bound on {}", local_addr);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_receive_loop(
            Arc::clone(&self.inner),
            sock,
            cancel.clone(),
        ));
        *slot = Some(Listener {
            local_addr,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let slot = self.inner.listener.lock().await;
        slot.as_ref()
            .filter(|listener| !listener.task.is_finished())
            .map(|listener| listener.local_addr)
    }

    /// Closes the socket and forgets every SSRC binding.
    pub async fn shutdown(&self) {
        let listener = self.inner.listener.lock().await.take();
        if let Some(listener) = listener {
            listener.cancel.cancel();
            if let Err(err) = listener.task.await {
                log::warn!("[ingress] receive loop ended abnormally: {}", err);
            }
            log::info!("[ingress] rtp listener on {} closed", listener.local_addr);
        }
        self.inner.ssrc.clear();
    }

    /// Forgets the SSRC bindings of a call being torn down.
    pub fn release_call(&self, call_id: &CallId) -> usize {
        let released = self.inner.ssrc.release_call(call_id);
        if released > 0 {
            log::debug!("[ingress] released {} ssrc binding(s) for call_id={}", released, call_id);
        }
        released
    }

    pub fn handle_datagram(&self, data: &[u8], src: SocketAddr) -> IngressOutcome {
        self.inner.handle_datagram(data, src)
    }
}

impl Inner {
    fn handle_datagram(&self, data: &[u8], src: SocketAddr) -> IngressOutcome {
        let pkt = match parse_rtp_packet(data) {
            Ok(pkt) => pkt,
            Err(err) => {
                log::debug!("[ingress] drop packet from {}: {}", src, err);
                return IngressOutcome::Dropped(DropReason::Malformed(err));
            }
        };

        if let Some(call_id) = self.ssrc.get(pkt.ssrc) {
            return match self.registry.get(&call_id) {
                Some(session) if !session.state.is_torn_down() => {
                    self.forward(session.voice_key(), &pkt.payload);
                    IngressOutcome::Forwarded { call_id }
                }
                _ => {
                    self.ssrc.remove_if(pkt.ssrc, &call_id);
                    log::warn!(
                        "[ingress] ssrc={} mapped to ended call_id={}, mapping removed",
                        pkt.ssrc,
                        call_id
                    );
                    IngressOutcome::Dropped(DropReason::StaleMapping)
                }
            };
        }

        match self.registry.claim_awaiting_ssrc(pkt.ssrc, src) {
            SsrcClaim::Bound(session) => {
                let call_id = session.call_id.clone();
                if let Some(previous) = self.ssrc.bind(pkt.ssrc, call_id.clone()) {
                    if previous != call_id {
                        log::warn!(
                            "[ingress] ssrc={} was bound to call_id={}, now call_id={}",
                            pkt.ssrc,
                            previous,
                            call_id
                        );
                    }
                }
                log::info!(
                    "[ingress] ssrc={} from {} bound to call_id={} (voice key {})",
                    pkt.ssrc,
                    src,
                    call_id,
                    session.voice_key()
                );
                self.forward(session.voice_key(), &pkt.payload);
                IngressOutcome::Bound {
                    call_id,
                    ssrc: pkt.ssrc,
                }
            }
            SsrcClaim::NoneWaiting => {
                log::debug!(
                    "[ingress] ssrc={} from {} has no call awaiting media, dropped",
                    pkt.ssrc,
                    src
                );
                IngressOutcome::Dropped(DropReason::NoWaitingCall)
            }
            SsrcClaim::Ambiguous(n) => {
                log::warn!(
                    "[ingress] ssrc={} from {} matches {} waiting calls, dropped",
                    pkt.ssrc,
                    src,
                    n
                );
                IngressOutcome::Dropped(DropReason::AmbiguousWaiting(n))
            }
        }
    }

    fn forward(&self, voice_key: &CallId, payload: &[u8]) {
        let mulaw = self.codec.encode_mulaw(payload);
        if mulaw.is_empty() {
            return;
        }
        self.sink.push_audio(voice_key, mulaw);
    }
}

async fn run_receive_loop(inner: Arc<Inner>, sock: UdpSocket, cancel: CancellationToken) {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = sock.recv_from(&mut buf) => {
                match res {
                    Ok((len, src)) => {
                        inner.handle_datagram(&buf[..len], src);
                    }
                    Err(err) => {
                        log::error!("[ingress] rtp socket error, closing listener: {}", err);
                        inner.ssrc.clear();
                        break;
                    }
                }
            }
        }
    }
}
