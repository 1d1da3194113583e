use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::app::{ApplicationLayer, ConfirmMonitor, Fragment};
use crate::connection::Connection;
use crate::endpoint::RemoteEndpoint;
use crate::error::{Error, ProtocolError, Result, TimeoutKind};
use crate::link::{DataLinkLayer, Outbound};
use crate::transport::TransportFunction;

/// What a pending solicited-response waiter resolves to. A dropped sender
/// (connection lost) surfaces as a receive error instead.
pub type SolicitedOutcome = std::result::Result<Fragment, ProtocolError>;

/// One logical DNP3 conversation: the `(local address, remote address)` pair
/// on a remote endpoint, with the full layer stack and per-direction response
/// bookkeeping. Owned exclusively by its `RemoteEndpoint`; the back-reference
/// is non-owning.
pub struct Association {
    local_address: u16,
    remote_address: u16,
    on_master: bool,
    confirm_timeout: Duration,
    endpoint: Weak<RemoteEndpoint>,
    link: Arc<DataLinkLayer>,
    transport: Arc<TransportFunction>,
    app: Arc<ApplicationLayer>,
    confirm: Arc<ConfirmMonitor>,

    latest_solicited_response: Mutex<Option<Fragment>>,
    latest_unsolicited_response: Mutex<Option<Fragment>>,

    // Master side.
    latest_request_sequence_sent: Mutex<Option<u8>>,
    unsolicited_supported: AtomicBool,
    response_waiter: Mutex<Option<oneshot::Sender<SolicitedOutcome>>>,

    // Outstation side.
    first_valid_request_accepted: AtomicBool,
    latest_accepted_request_sequence: Mutex<Option<u8>>,
    broadcast_pending: AtomicBool,
}

impl Association {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local_address: u16,
        remote_address: u16,
        on_master: bool,
        endpoint: Weak<RemoteEndpoint>,
        outbound: Arc<Outbound>,
        reply_timeout: Duration,
        confirm_timeout: Duration,
        max_fragment_size: usize,
    ) -> Arc<Self> {
        let link = Arc::new(DataLinkLayer::new(
            local_address,
            remote_address,
            on_master,
            reply_timeout,
            outbound,
        ));
        let transport = Arc::new(TransportFunction::new(link.clone(), max_fragment_size));
        let confirm = Arc::new(ConfirmMonitor::new());
        let app = Arc::new(ApplicationLayer::new(
            transport.clone(),
            confirm.clone(),
            confirm_timeout,
            on_master,
        ));
        Arc::new(Self {
            local_address,
            remote_address,
            on_master,
            confirm_timeout,
            endpoint,
            link,
            transport,
            app,
            confirm,
            latest_solicited_response: Mutex::new(None),
            latest_unsolicited_response: Mutex::new(None),
            latest_request_sequence_sent: Mutex::new(None),
            unsolicited_supported: AtomicBool::new(false),
            response_waiter: Mutex::new(None),
            first_valid_request_accepted: AtomicBool::new(false),
            latest_accepted_request_sequence: Mutex::new(None),
            broadcast_pending: AtomicBool::new(false),
        })
    }

    pub fn local_address(&self) -> u16 {
        self.local_address
    }

    pub fn remote_address(&self) -> u16 {
        self.remote_address
    }

    /// True on the master side of the conversation.
    pub fn is_with_outstation(&self) -> bool {
        self.on_master
    }

    pub fn data_link_layer(&self) -> &Arc<DataLinkLayer> {
        &self.link
    }

    pub fn transport_function(&self) -> &Arc<TransportFunction> {
        &self.transport
    }

    pub fn application_layer(&self) -> &Arc<ApplicationLayer> {
        &self.app
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.link.outbound().connection()
    }

    pub fn remote_endpoint(&self) -> Option<Arc<RemoteEndpoint>> {
        self.endpoint.upgrade()
    }

    pub fn expect_confirm(&self, seq: u8, uns: bool) -> oneshot::Receiver<()> {
        self.confirm.expect(seq, uns)
    }

    pub async fn wait_for_confirm(&self, rx: oneshot::Receiver<()>) -> Result<()> {
        match timeout(self.confirm_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ClosedChannel),
            Err(_) => Err(Error::Timeout(TimeoutKind::Confirm, self.confirm_timeout)),
        }
    }

    pub fn latest_solicited_response(&self) -> Option<Fragment> {
        self.latest_solicited_response.lock().clone()
    }

    pub fn latest_unsolicited_response(&self) -> Option<Fragment> {
        self.latest_unsolicited_response.lock().clone()
    }

    pub fn unsolicited_supported(&self) -> bool {
        self.unsolicited_supported.load(Ordering::Relaxed)
    }

    pub fn record_request_sequence(&self, seq: u8) {
        *self.latest_request_sequence_sent.lock() = Some(seq);
    }

    pub fn latest_request_sequence(&self) -> Option<u8> {
        *self.latest_request_sequence_sent.lock()
    }

    /// Register interest in the next solicited response. Replacing a stale
    /// waiter drops it, which resolves that receiver with an error.
    pub fn register_response_waiter(&self) -> oneshot::Receiver<SolicitedOutcome> {
        let (tx, rx) = oneshot::channel();
        *self.response_waiter.lock() = Some(tx);
        rx
    }

    /// Route one solicited response: record it and release a waiter whose
    /// request sequence matches.
    pub fn deliver_solicited(&self, fragment: Fragment) -> bool {
        *self.latest_solicited_response.lock() = Some(fragment.clone());
        let matches = self
            .latest_request_sequence()
            .map(|seq| seq == fragment.control.seq)
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(tx) = self.response_waiter.lock().take() {
            tx.send(Ok(fragment)).is_ok()
        } else {
            false
        }
    }

    /// Route one unsolicited response.
    pub fn deliver_unsolicited(&self, fragment: Fragment) {
        self.unsolicited_supported.store(true, Ordering::Relaxed);
        *self.latest_unsolicited_response.lock() = Some(fragment);
    }

    /// Abort a pending transaction with a fragment-level protocol error. The
    /// association stays live.
    pub fn fail_response_waiter(&self, error: ProtocolError) {
        if let Some(tx) = self.response_waiter.lock().take() {
            let _ = tx.send(Err(error));
        }
    }

    /// Outstation-side request bookkeeping: rejects an immediate repeat of
    /// the latest accepted sequence.
    pub fn accept_request(&self, seq: u8) -> bool {
        let mut latest = self.latest_accepted_request_sequence.lock();
        if self.first_valid_request_accepted.load(Ordering::Relaxed) && *latest == Some(seq) {
            return false;
        }
        self.first_valid_request_accepted
            .store(true, Ordering::Relaxed);
        *latest = Some(seq);
        true
    }

    pub fn first_valid_request_accepted(&self) -> bool {
        self.first_valid_request_accepted.load(Ordering::Relaxed)
    }

    pub fn latest_accepted_request_sequence(&self) -> Option<u8> {
        *self.latest_accepted_request_sequence.lock()
    }

    /// A broadcast request was observed; the next response sets the
    /// BROADCAST internal indication.
    pub fn note_broadcast(&self) {
        self.broadcast_pending.store(true, Ordering::Relaxed);
    }

    pub fn take_broadcast(&self) -> bool {
        self.broadcast_pending.swap(false, Ordering::Relaxed)
    }

    /// Tear down the stack below this association and fail every waiter.
    pub fn on_connection_lost(&self) {
        self.link.close();
        self.confirm.fail_all();
        self.response_waiter.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppControl, FunctionCode, Iin};

    fn association() -> Arc<Association> {
        Association::new(
            1,
            10,
            true,
            Weak::new(),
            Outbound::new(),
            Duration::from_millis(100),
            Duration::from_millis(100),
            2048,
        )
    }

    fn response(seq: u8) -> Fragment {
        Fragment::response(
            FunctionCode::Response,
            AppControl::single(seq),
            Iin::new(),
            vec![],
        )
    }

    #[tokio::test]
    async fn solicited_response_releases_matching_waiter() {
        let assoc = association();
        assoc.record_request_sequence(4);
        let rx = assoc.register_response_waiter();
        assert!(assoc.deliver_solicited(response(4)));
        let fragment = rx.await.unwrap().unwrap();
        assert_eq!(fragment.control.seq, 4);
        assert!(assoc.latest_solicited_response().is_some());
    }

    #[tokio::test]
    async fn mismatched_sequence_keeps_waiter_pending() {
        let assoc = association();
        assoc.record_request_sequence(4);
        let mut rx = assoc.register_response_waiter();
        assert!(!assoc.deliver_solicited(response(9)));
        assert!(rx.try_recv().is_err());
        // The stale response is still recorded.
        assert_eq!(assoc.latest_solicited_response().unwrap().control.seq, 9);
    }

    #[test]
    fn unsolicited_updates_support_flag() {
        let assoc = association();
        assert!(!assoc.unsolicited_supported());
        assoc.deliver_unsolicited(response(0));
        assert!(assoc.unsolicited_supported());
        assert!(assoc.latest_unsolicited_response().is_some());
    }

    #[test]
    fn duplicate_request_sequence_rejected() {
        let assoc = association();
        assert!(assoc.accept_request(3));
        assert!(!assoc.accept_request(3));
        assert!(assoc.accept_request(4));
        assert!(assoc.accept_request(3));
        assert_eq!(assoc.latest_accepted_request_sequence(), Some(3));
    }

    #[tokio::test]
    async fn confirm_monitor_round_trip() {
        let assoc = association();
        let rx = assoc.expect_confirm(7, true);
        assert!(assoc.confirm.complete(7, true));
        assoc.wait_for_confirm(rx).await.unwrap();
    }

    #[tokio::test]
    async fn connection_lost_fails_waiters() {
        let assoc = association();
        let rx = assoc.register_response_waiter();
        let confirm_rx = assoc.expect_confirm(0, false);
        assoc.on_connection_lost();
        assert!(rx.await.is_err());
        assert!(matches!(
            assoc.wait_for_confirm(confirm_rx).await,
            Err(Error::ClosedChannel)
        ));
    }
}
