//! Tunnel supervision: forge a sub-descriptor carrying a local port-forward,
//! drive the tunnel's secure-shell from a background thread, and tear the
//! stack down in reverse order.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::backend::{SecureTransport, TransportUi};
use crate::config::Configuration;
use crate::error::{SessionError, SessionResult};
use crate::events::{PromptKind, QueryAnswer, QueryRequest, TransportPrompts};
use crate::session::{SessionData, TunnelOptions};
use crate::session_log::SessionLog;

/// Idle quantum of the driver thread.
pub const TUNNEL_IDLE_QUANTUM: Duration = Duration::from_millis(250);

/// True when a loopback listener can bind the port.
pub fn is_listener_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Pick the tunnel's local port: the descriptor override when present, else
/// the first free port in the configured range.
pub fn select_local_port(
    options: &TunnelOptions,
    configuration: &Configuration,
    log: &SessionLog,
) -> SessionResult<u16> {
    if options.local_port != 0 {
        return Ok(options.local_port);
    }
    let low = configuration.tunnel_local_port_low;
    let high = configuration.tunnel_local_port_high;
    for port in low..=high {
        if is_listener_free(port) {
            log.event(format!("Autoselected tunnel local port number {port}"));
            return Ok(port);
        }
    }
    Err(SessionError::fatal(format!(
        "no free local port available for the tunnel in range {low}-{high}"
    )))
}

/// Forge the tunnel's own session descriptor: tunnel credentials, cloned
/// proxy settings, and the `L<port>\t<host>:<port>` forward directive.
pub fn make_tunnel_data(data: &SessionData, local_port: u16) -> SessionResult<SessionData> {
    let options = data
        .tunnel
        .as_ref()
        .ok_or_else(|| SessionError::fatal("descriptor does not request a tunnel"))?;
    let mut tunnel_data = SessionData {
        name: format!("Tunnel to {}", data.session_name()),
        host: options.host.clone(),
        port: options.port,
        user: options.user.clone(),
        password: options.password.clone(),
        key_file: options.public_key_file.clone(),
        protocol: crate::session::Protocol::Shell,
        proxy: data.proxy.clone(),
        ..SessionData::default()
    };
    tunnel_data.tunnel = None;
    tunnel_data.tunnel_port_fwd = Some(format!("L{local_port}\t{}:{}", data.host, data.port));
    Ok(tunnel_data)
}

/// One-shot stored-password replay state of a secondary session: the
/// parent's passwords are offered exactly once per kind, latched even when
/// the slot is empty or the attempt fails.
pub(crate) struct PasswordReplay {
    pub main_tried: bool,
    pub tunnel_tried: bool,
    pub password: Option<String>,
    pub tunnel_password: Option<String>,
}

/// Thread-bound prompt shim handed to transports and backends. Prompts
/// arriving on any thread other than the owning session's answer Abort
/// without reaching the host (the tunnel driver must never block on UI).
pub struct SessionUi {
    owner: ThreadId,
    prompts: TransportPrompts,
    log: Arc<SessionLog>,
    /// While set, password prompts target the tunnel-password slot.
    tunnel_opening: Arc<AtomicBool>,
    replay: Option<Arc<parking_lot::Mutex<PasswordReplay>>>,
}

impl SessionUi {
    pub(crate) fn new(
        owner: ThreadId,
        prompts: TransportPrompts,
        log: Arc<SessionLog>,
        tunnel_opening: Arc<AtomicBool>,
        replay: Option<Arc<parking_lot::Mutex<PasswordReplay>>>,
    ) -> Self {
        Self {
            owner,
            prompts,
            log,
            tunnel_opening,
            replay,
        }
    }

    fn on_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn replayed_password(&self, kind: PromptKind) -> Option<String> {
        let replay = self.replay.as_ref()?;
        let mut replay = replay.lock();
        match kind {
            PromptKind::Password if !replay.main_tried => {
                replay.main_tried = true;
                if replay.password.is_some() {
                    self.log.event("Using remembered password of the main session.");
                }
                replay.password.clone()
            }
            PromptKind::TunnelPassword if !replay.tunnel_tried => {
                replay.tunnel_tried = true;
                if replay.tunnel_password.is_some() {
                    self.log
                        .event("Using remembered tunnel password of the main session.");
                }
                replay.tunnel_password.clone()
            }
            _ => None,
        }
    }
}

impl TransportUi for SessionUi {
    fn information(&self, message: &str, status: bool) {
        if !self.on_owner_thread() {
            return;
        }
        if let Some(information) = &self.prompts.information {
            information(message, status);
        }
    }

    fn query_user(&self, request: &QueryRequest) -> QueryAnswer {
        if !self.on_owner_thread() {
            self.log
                .event("Prompt from a foreign thread answered with abort");
            return QueryAnswer::Abort;
        }
        match &self.prompts.query {
            Some(query) => query(request),
            None => QueryAnswer::Abort,
        }
    }

    fn prompt_user(&self, kind: PromptKind, prompt: &str) -> Option<String> {
        if !self.on_owner_thread() {
            return None;
        }
        let kind = if kind == PromptKind::Password && self.tunnel_opening.load(Ordering::SeqCst) {
            PromptKind::TunnelPassword
        } else {
            kind
        };
        if let Some(password) = self.replayed_password(kind) {
            return Some(password);
        }
        self.prompts.prompt.as_ref().and_then(|hook| hook(kind, prompt))
    }

    fn display_banner(&self, banner: &str) {
        if !self.on_owner_thread() {
            return;
        }
        if let Some(hook) = &self.prompts.banner {
            hook(banner);
        }
    }
}

/// Background thread pumping `idle` on the tunnel's secure-shell until
/// terminated. The thread owns the transport; the only shared state is the
/// write-once `terminated` flag.
pub struct TunnelDriver {
    terminated: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn SecureTransport>>,
}

impl TunnelDriver {
    pub fn spawn(mut transport: Box<dyn SecureTransport>) -> Self {
        let terminated = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&terminated);
        let handle = thread::Builder::new()
            .name("tunnel-driver".to_string())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    if let Err(err) = transport.idle(TUNNEL_IDLE_QUANTUM) {
                        log::debug!(target: "skiff::tunnel", "tunnel idle failed: {err}");
                        if transport.active() {
                            transport.close();
                        }
                        break;
                    }
                }
                transport
            })
            .expect("spawning the tunnel driver thread");
        Self { terminated, handle }
    }

    /// Stop the thread and take the transport back for teardown.
    pub fn terminate(self) -> Box<dyn SecureTransport> {
        self.terminated.store(true, Ordering::SeqCst);
        match self.handle.join() {
            Ok(transport) => transport,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// The live tunnel owned by an open session.
pub struct Tunnel {
    pub data: SessionData,
    pub log: Arc<SessionLog>,
    pub local_port: u16,
    driver: Option<TunnelDriver>,
}

impl Tunnel {
    pub fn new(data: SessionData, log: Arc<SessionLog>, local_port: u16, driver: TunnelDriver) -> Self {
        Self {
            data,
            log,
            local_port,
            driver: Some(driver),
        }
    }

    /// Tear down: stop the driver, capture the last tunnel error, then drop
    /// shell, log, and sub-descriptor in that order.
    pub fn close(mut self) -> Option<String> {
        let error = match self.driver.take() {
            Some(driver) => {
                let transport = driver.terminate();
                let error = transport.last_tunnel_error();
                drop(transport);
                error
            }
            None => None,
        };
        self.log.event("Tunnel closed");
        error
    }
}
