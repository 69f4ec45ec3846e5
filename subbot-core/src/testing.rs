//! Scriptable in-process protocol engine for tests.
//!
//! [`MockProtocol`] hands out connections whose lifecycle events are driven
//! by the test: emit `authenticated`, `closed` and friends on demand, make
//! connects or pings fail, and count how many live handles exist per session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{
    CloseReason, ConnectRequest, Connection, ConnectionHandle, LifecycleEvent, ProtocolClient,
    ProtocolError,
};

pub const MOCK_GENERATED_CODE: &str = "K7QX2M9P";

struct MockState {
    connects: HashMap<String, usize>,
    open: HashMap<String, usize>,
    senders: HashMap<String, mpsc::Sender<LifecycleEvent>>,
    connect_failures: HashMap<String, VecDeque<ProtocolError>>,
    failing_pings: HashSet<String>,
    qr_on_connect: Option<String>,
    authenticate_on_resume: bool,
    reject_custom_codes: bool,
    generated_code: String,
    pairing_requests: Vec<(String, Option<String>)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            connects: HashMap::new(),
            open: HashMap::new(),
            senders: HashMap::new(),
            connect_failures: HashMap::new(),
            failing_pings: HashSet::new(),
            qr_on_connect: Some("2@mock-qr-payload".to_string()),
            authenticate_on_resume: true,
            reject_custom_codes: false,
            generated_code: MOCK_GENERATED_CODE.to_string(),
            pairing_requests: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockProtocol {
    state: Arc<Mutex<MockState>>,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock protocol state poisoned")
    }

    /// QR payload emitted right after a fresh connect; `None` disables it.
    pub fn set_qr_on_connect(&self, payload: Option<&str>) {
        self.lock().qr_on_connect = payload.map(str::to_string);
    }

    /// Emit `authenticated` as soon as a connect replays a credential.
    pub fn set_authenticate_on_resume(&self, enabled: bool) {
        self.lock().authenticate_on_resume = enabled;
    }

    pub fn set_reject_custom_codes(&self, reject: bool) {
        self.lock().reject_custom_codes = reject;
    }

    pub fn set_generated_code(&self, code: &str) {
        self.lock().generated_code = code.to_string();
    }

    /// Queue failures returned by the next connects for `code`.
    pub fn fail_next_connects(&self, code: &str, errors: Vec<ProtocolError>) {
        self.lock()
            .connect_failures
            .entry(code.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn set_ping_ok(&self, code: &str, ok: bool) {
        let mut state = self.lock();
        if ok {
            state.failing_pings.remove(code);
        } else {
            state.failing_pings.insert(code.to_string());
        }
    }

    /// Deliver an event on the newest connection for `code`.
    pub async fn emit(&self, code: &str, event: LifecycleEvent) -> bool {
        let sender = self.lock().senders.get(code).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn connect_count(&self, code: &str) -> usize {
        self.lock().connects.get(code).copied().unwrap_or(0)
    }

    pub fn open_connections(&self, code: &str) -> usize {
        self.lock().open.get(code).copied().unwrap_or(0)
    }

    pub fn total_open_connections(&self) -> usize {
        self.lock().open.values().sum()
    }

    pub fn pairing_requests(&self) -> Vec<(String, Option<String>)> {
        self.lock().pairing_requests.clone()
    }
}

#[async_trait]
impl ProtocolClient for MockProtocol {
    async fn connect(&self, request: ConnectRequest) -> Result<ConnectionHandle, ProtocolError> {
        let code = request.session_code;
        let (tx, rx) = mpsc::channel(32);
        {
            let mut state = self.lock();
            *state.connects.entry(code.clone()).or_default() += 1;
            if let Some(err) = state
                .connect_failures
                .get_mut(&code)
                .and_then(|queue| queue.pop_front())
            {
                return Err(err);
            }

            *state.open.entry(code.clone()).or_default() += 1;
            state.senders.insert(code.clone(), tx.clone());

            match &request.credential {
                Some(credential) if state.authenticate_on_resume => {
                    let _ = tx.try_send(LifecycleEvent::Authenticated {
                        credential: credential.clone(),
                    });
                }
                None => {
                    if let Some(payload) = &state.qr_on_connect {
                        let _ = tx.try_send(LifecycleEvent::QrUpdated {
                            payload: payload.clone(),
                        });
                    }
                }
                _ => {}
            }
        }

        Ok(ConnectionHandle {
            connection: Arc::new(MockConnection {
                code,
                protocol: self.clone(),
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockConnection {
    code: String,
    protocol: MockProtocol,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn request_pairing_code(
        &self,
        phone_number: &str,
        custom_code: Option<&str>,
    ) -> Result<String, ProtocolError> {
        let mut state = self.protocol.lock();
        state
            .pairing_requests
            .push((phone_number.to_string(), custom_code.map(str::to_string)));
        match custom_code {
            Some(_) if state.reject_custom_codes => Err(ProtocolError::PairingRejected(
                "custom code refused".to_string(),
            )),
            Some(custom) => Ok(custom.to_string()),
            None => Ok(state.generated_code.clone()),
        }
    }

    async fn ping(&self) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst)
            || self.protocol.lock().failing_pings.contains(&self.code)
        {
            return Err(ProtocolError::Closed(CloseReason::ConnectionLost));
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut state = self.protocol.lock();
            if let Some(open) = state.open.get_mut(&self.code) {
                *open = open.saturating_sub(1);
            }
        }
    }
}
