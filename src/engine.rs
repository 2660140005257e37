//! Command protocol engine for the collar peripheral
//!
//! The engine owns the pending request queue and drives it against an
//! abstract transport: it serializes outbound requests, enforces a single
//! in-flight request at a time, retries failed writes up to a bound, and
//! decodes inbound payloads into typed responses for a delegate.
//!
//! The engine is event-driven and never blocks. `submit` returns as soon as
//! the request is queued; write outcomes and inbound payloads are fed back
//! in by the connection layer via `on_write_completed` and
//! `on_inbound_payload`, which re-enter the engine to advance the queue.
//! All entry points are expected to be invoked serially from one logical
//! event loop; the internal mutex keeps re-entry from collaborator
//! callbacks safe, not concurrent callers fast.

use crate::envelope::{AccessPoint, Request, Response};
use crate::queue::RequestQueue;
use crate::types::{CommandKind, Result};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};

/// Total write attempts per request before it is reported as permanently
/// failed
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Correlation tag stamped on outbound requests unless reconfigured
pub const DEFAULT_COLLAR_ID: &str = "a1b2-c3d4";

/// Connected byte channel to the peripheral, supplied by the connection
/// layer
///
/// `write` only initiates a transfer; the asynchronous outcome must be
/// reported back through [`CommandEngine::on_write_completed`]. An `Err`
/// return means the write could not even be started and is handled with the
/// same retry policy as an asynchronous failure.
pub trait Transport: Send + Sync {
    fn write(&self, payload: &[u8]) -> Result<()>;

    /// Negotiated maximum write length for a single payload
    fn max_payload_size(&self) -> usize;
}

/// Receiver for engine events
///
/// The engine holds a shared reference but does not manage the delegate's
/// lifetime; the caller keeps its own handle.
pub trait EngineDelegate: Send + Sync {
    /// A well-formed response arrived from the peripheral
    fn on_response(&self, response: Response);

    /// A request exhausted its write attempts and will not be resent
    fn on_request_failed(&self, request: Request);

    /// A request encoded larger than the transport allows; it stays queued
    /// until the caller cancels it or resets the session
    fn on_message_too_large(&self, request: Request);

    /// The connection layer reported the peripheral gone
    fn on_disconnected(&self) {}
}

/// Session state owned exclusively by the engine
struct EngineState {
    queue: RequestQueue,
    retry_count: u32,
    sequence_counter: u32,
    currently_executing: Option<Request>,
    collar_id: Option<String>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            queue: RequestQueue::new(),
            retry_count: 0,
            sequence_counter: 0,
            currently_executing: None,
            collar_id: Some(DEFAULT_COLLAR_ID.to_string()),
        }
    }
}

enum FailureAction {
    Retry,
    Terminal(Request),
}

/// Command protocol engine
///
/// Explicitly constructed and caller-owned; one engine per connected
/// peripheral session.
pub struct CommandEngine {
    state: Mutex<EngineState>,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn EngineDelegate>,
}

impl CommandEngine {
    pub fn new(transport: Arc<dyn Transport>, delegate: Arc<dyn EngineDelegate>) -> Self {
        Self {
            state: Mutex::new(EngineState::new()),
            transport,
            delegate,
        }
    }

    /// Set the correlation tag stamped on subsequent requests, or `None` to
    /// stop stamping one
    pub fn set_collar_id(&self, collar_id: Option<String>) {
        self.state.lock().unwrap().collar_id = collar_id;
    }

    /// Queue a command for the peripheral
    ///
    /// Allocates the next sequence number, enqueues the request and starts
    /// sending it unless another request is already in flight. Returns the
    /// constructed request immediately so the caller can track it before
    /// any transport activity completes.
    pub fn submit(&self, kind: CommandKind, payload: Option<AccessPoint>) -> Request {
        let request = {
            let mut state = self.state.lock().unwrap();
            let mut request = Request::new(state.sequence_counter, kind, payload);
            request.correlation_tag = state.collar_id.clone();
            state.sequence_counter += 1;
            state.queue.push(request.clone());
            request
        };
        self.attempt_dispatch();
        request
    }

    /// Queue an Edit command carrying Wi-Fi credentials
    ///
    /// The secret is attached to an internal copy of the descriptor only;
    /// the caller's value is never mutated.
    pub fn submit_edit(&self, access_point: &AccessPoint, secret: impl Into<String>) -> Request {
        let mut copy = access_point.clone();
        copy.password = Some(secret.into());
        self.submit(CommandKind::Edit, Some(copy))
    }

    /// Cancel a request that has not started executing
    ///
    /// Returns whether a queued entry was removed. The in-flight request
    /// cannot be cancelled; its write outcome is already owed.
    pub fn cancel(&self, request: &Request) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.currently_executing.as_ref() == Some(request) {
            warn!(
                "Refusing to cancel in-flight {} request (seq {})",
                request.kind, request.sequence
            );
            return false;
        }
        state.queue.remove(request)
    }

    /// Feed back the outcome of the write started by the engine
    pub fn on_write_completed(&self, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.handle_write_success(),
            Err(e) => self.handle_write_failure(&e.to_string()),
        }
    }

    /// Feed in raw bytes that arrived from the peripheral
    ///
    /// Well-formed responses are dispatched to the delegate; anything else
    /// is logged and dropped. Inbound data never affects queue state, and
    /// responses are not correlated against the in-flight request: any
    /// decodable response is delivered.
    pub fn on_inbound_payload(&self, bytes: &[u8]) {
        match Response::decode(bytes) {
            Ok(response) => {
                info!(
                    "Received {} response (seq {}, result {})",
                    response.kind, response.sequence, response.result_code
                );
                self.delegate.on_response(response);
            }
            Err(e) => {
                warn!(
                    "Invalid data received ({}): {}",
                    e,
                    String::from_utf8_lossy(bytes)
                );
            }
        }
    }

    /// The connection layer lost the peripheral: discard the session and
    /// notify the delegate
    pub fn on_connection_lost(&self) {
        info!("Peripheral disconnected, resetting session");
        self.reset_session();
        self.delegate.on_disconnected();
    }

    /// Discard all queued and in-flight requests and reset the retry
    /// counter
    ///
    /// A later reconnection starts clean; discarded requests are not
    /// resumed.
    pub fn reset_session(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.queue.is_empty() {
            debug!(
                "Discarding {} pending request(s) on session reset",
                state.queue.len()
            );
        }
        state.queue.clear();
        state.retry_count = 0;
        state.currently_executing = None;
    }

    /// Number of requests queued, including the in-flight one
    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    /// The request currently awaiting a write outcome, if any
    pub fn in_flight(&self) -> Option<Request> {
        self.state.lock().unwrap().currently_executing.clone()
    }

    /// Try to start sending the queue head
    ///
    /// No-op while a write is outstanding or the queue is empty. An
    /// oversized request is reported and left at the head without being
    /// marked in flight, so the caller can cancel it or reset the session.
    fn attempt_dispatch(&self) {
        let mut state = self.state.lock().unwrap();
        if state.currently_executing.is_some() {
            return;
        }
        let Some(head) = state.queue.head() else {
            return;
        };
        let request = head.clone();

        let payload = match request.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {} request: {}", request.kind, e);
                return;
            }
        };

        let max = self.transport.max_payload_size();
        if payload.len() > max {
            drop(state);
            error!(
                "Encoded {} request is {} bytes, larger than the transport maximum of {}",
                request.kind,
                payload.len(),
                max
            );
            self.delegate.on_message_too_large(request);
            return;
        }

        info!(
            "Sending request of type {} (seq {})",
            request.kind, request.sequence
        );
        state.currently_executing = Some(request);
        drop(state);

        if let Err(e) = self.transport.write(&payload) {
            self.handle_write_failure(&e.to_string());
        }
    }

    fn handle_write_success(&self) {
        let mut state = self.state.lock().unwrap();
        let Some(acknowledged) = state.currently_executing.take() else {
            warn!("Write completion arrived with no request in flight");
            return;
        };

        let head = state.queue.pop();
        if head.as_ref() != Some(&acknowledged) {
            warn!(
                "Acknowledged {} request (seq {}) was not at the queue head",
                acknowledged.kind, acknowledged.sequence
            );
        }
        state.retry_count = 0;
        debug!(
            "Request of type {} (seq {}) acknowledged",
            acknowledged.kind, acknowledged.sequence
        );
        drop(state);

        self.attempt_dispatch();
    }

    fn handle_write_failure(&self, cause: &str) {
        let action = {
            let mut state = self.state.lock().unwrap();
            let Some(request) = state.currently_executing.clone() else {
                warn!("Write failure arrived with no request in flight");
                return;
            };

            state.retry_count += 1;
            if state.retry_count < MAX_SEND_ATTEMPTS {
                warn!(
                    "Write of {} request (seq {}) failed: {}. Retrying (attempt {} of {})",
                    request.kind,
                    request.sequence,
                    cause,
                    state.retry_count + 1,
                    MAX_SEND_ATTEMPTS
                );
                // The request stays at the queue head; only the in-flight
                // slot is released for the re-send.
                state.currently_executing = None;
                FailureAction::Retry
            } else {
                error!(
                    "Giving up on {} request (seq {}) after {} attempts: {}",
                    request.kind, request.sequence, MAX_SEND_ATTEMPTS, cause
                );
                // The request stays queued and the in-flight slot stays
                // occupied: the queue stalls until the caller cancels or
                // resets the session.
                FailureAction::Terminal(request)
            }
        };

        match action {
            FailureAction::Retry => self.attempt_dispatch(),
            FailureAction::Terminal(request) => self.delegate.on_request_failed(request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CollarError;
    use std::sync::Mutex as StdMutex;

    struct TestTransport {
        writes: StdMutex<Vec<Vec<u8>>>,
        max_payload: usize,
    }

    impl TestTransport {
        fn new(max_payload: usize) -> Self {
            Self {
                writes: StdMutex::new(Vec::new()),
                max_payload,
            }
        }

        fn written_requests(&self) -> Vec<Request> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|bytes| Request::decode(bytes).unwrap())
                .collect()
        }

        fn write_count(&self) -> usize {
            self.writes.lock().unwrap().len()
        }
    }

    impl Transport for TestTransport {
        fn write(&self, payload: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        fn max_payload_size(&self) -> usize {
            self.max_payload
        }
    }

    #[derive(Default)]
    struct RecordingDelegate {
        responses: StdMutex<Vec<Response>>,
        failed: StdMutex<Vec<Request>>,
        oversized: StdMutex<Vec<Request>>,
        disconnects: StdMutex<usize>,
    }

    impl EngineDelegate for RecordingDelegate {
        fn on_response(&self, response: Response) {
            self.responses.lock().unwrap().push(response);
        }

        fn on_request_failed(&self, request: Request) {
            self.failed.lock().unwrap().push(request);
        }

        fn on_message_too_large(&self, request: Request) {
            self.oversized.lock().unwrap().push(request);
        }

        fn on_disconnected(&self) {
            *self.disconnects.lock().unwrap() += 1;
        }
    }

    fn engine_with_max(
        max_payload: usize,
    ) -> (CommandEngine, Arc<TestTransport>, Arc<RecordingDelegate>) {
        let transport = Arc::new(TestTransport::new(max_payload));
        let delegate = Arc::new(RecordingDelegate::default());
        let engine = CommandEngine::new(transport.clone(), delegate.clone());
        (engine, transport, delegate)
    }

    fn engine() -> (CommandEngine, Arc<TestTransport>, Arc<RecordingDelegate>) {
        engine_with_max(512)
    }

    fn write_error() -> CollarError {
        CollarError::WriteFailed("ATT timeout".to_string())
    }

    #[test]
    fn test_submit_sends_immediately() {
        let (engine, transport, _) = engine();

        let request = engine.submit(CommandKind::Scan, None);
        assert_eq!(request.sequence, 0);
        assert_eq!(request.correlation_tag.as_deref(), Some(DEFAULT_COLLAR_ID));

        let written = transport.written_requests();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], request);
        assert_eq!(engine.in_flight(), Some(request));
    }

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let (engine, _, _) = engine();
        for expected in 0..4 {
            let request = engine.submit(CommandKind::Info, None);
            assert_eq!(request.sequence, expected);
            engine.on_write_completed(Ok(()));
        }
    }

    #[test]
    fn test_single_in_flight_with_fifo_promotion() {
        let (engine, transport, _) = engine();

        let scan = engine.submit(CommandKind::Scan, None);
        let info = engine.submit(CommandKind::Info, None);
        let finish = engine.submit(CommandKind::Finish, None);

        // Only the first submission goes on the wire; the rest stay queued
        // in submission order.
        assert_eq!(transport.write_count(), 1);
        assert_eq!(engine.in_flight(), Some(scan));
        assert_eq!(engine.pending_count(), 3);

        engine.on_write_completed(Ok(()));
        assert_eq!(transport.write_count(), 2);
        assert_eq!(engine.in_flight(), Some(info));

        engine.on_write_completed(Ok(()));
        assert_eq!(transport.write_count(), 3);
        assert_eq!(engine.in_flight(), Some(finish));

        engine.on_write_completed(Ok(()));
        assert_eq!(engine.in_flight(), None);
        assert_eq!(engine.pending_count(), 0);

        let kinds: Vec<_> = transport
            .written_requests()
            .iter()
            .map(|r| r.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![CommandKind::Scan, CommandKind::Info, CommandKind::Finish]
        );
    }

    #[test]
    fn test_two_failures_then_success_is_acknowledged() {
        let (engine, transport, delegate) = engine();

        engine.submit(CommandKind::Read, None);
        engine.on_write_completed(Err(write_error()));
        engine.on_write_completed(Err(write_error()));

        // Initial attempt plus two retries of the same request.
        let written = transport.written_requests();
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|r| r.sequence == 0));

        engine.on_write_completed(Ok(()));
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.in_flight(), None);
        assert!(delegate.failed.lock().unwrap().is_empty());

        // The retry counter was reset on acknowledgment: the next request
        // gets its full attempt budget again.
        engine.submit(CommandKind::Info, None);
        engine.on_write_completed(Err(write_error()));
        engine.on_write_completed(Err(write_error()));
        engine.on_write_completed(Ok(()));
        assert!(delegate.failed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_three_failures_reports_permanent_and_stalls() {
        let (engine, transport, delegate) = engine();

        let read = engine.submit(CommandKind::Read, None);
        engine.on_write_completed(Err(write_error()));
        engine.on_write_completed(Err(write_error()));
        engine.on_write_completed(Err(write_error()));

        // Exactly one permanent-failure report and no fourth attempt.
        assert_eq!(transport.write_count(), 3);
        let failed = delegate.failed.lock().unwrap().clone();
        assert_eq!(failed, vec![read.clone()]);

        // The request stays at the queue head and the queue stalls until
        // the caller intervenes.
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(engine.in_flight(), Some(read));
        engine.submit(CommandKind::Info, None);
        assert_eq!(transport.write_count(), 3);

        engine.reset_session();
        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.in_flight(), None);
    }

    #[test]
    fn test_oversized_request_is_reported_and_left_queued() {
        let (engine, transport, delegate) = engine_with_max(16);

        let scan = engine.submit(CommandKind::Scan, None);
        assert_eq!(transport.write_count(), 0);
        assert_eq!(engine.in_flight(), None);
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(delegate.oversized.lock().unwrap().clone(), vec![scan.clone()]);
        assert!(delegate.failed.lock().unwrap().is_empty());

        // Cancelling the oversized head unblocks the queue.
        assert!(engine.cancel(&scan));
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_submit_edit_does_not_mutate_caller_descriptor() {
        let (engine, transport, _) = engine();

        let access_point = AccessPoint::new("Home", -50, 0, 1, 6);
        let request = engine.submit_edit(&access_point, "hunter2");

        assert!(access_point.password.is_none());
        assert_eq!(
            request.payload.as_ref().unwrap().password.as_deref(),
            Some("hunter2")
        );

        let written = transport.written_requests();
        assert_eq!(written[0].kind, CommandKind::Edit);
        assert_eq!(
            written[0].payload.as_ref().unwrap().password.as_deref(),
            Some("hunter2")
        );
    }

    #[test]
    fn test_inbound_response_is_dispatched() {
        let (engine, _, delegate) = engine();

        engine.on_inbound_payload(
            br#"{"SEQU":0,"RESP":"INFO","RSLT":0,"COID":"a1b2-c3d4"}"#,
        );

        let responses = delegate.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, CommandKind::Info);
        assert_eq!(responses[0].correlation_tag.as_deref(), Some("a1b2-c3d4"));
    }

    #[test]
    fn test_malformed_inbound_payload_is_dropped() {
        let (engine, transport, delegate) = engine();

        engine.submit(CommandKind::Scan, None);
        engine.on_inbound_payload(b"garbage");
        engine.on_inbound_payload(br#"{"SEQU":0,"RSLT":0}"#);

        // Nothing dispatched, queue progression unaffected.
        assert!(delegate.responses.lock().unwrap().is_empty());
        assert_eq!(engine.pending_count(), 1);
        assert_eq!(transport.write_count(), 1);
    }

    #[test]
    fn test_responses_dispatch_without_sequence_correlation() {
        // Known gap preserved from the deployed protocol: a well-formed
        // response is delivered even when its sequence number matches no
        // in-flight request.
        let (engine, _, delegate) = engine();

        engine.submit(CommandKind::Scan, None);
        engine.on_inbound_payload(br#"{"SEQU":42,"RESP":"FINISH","RSLT":1}"#);

        let responses = delegate.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].sequence, 42);
        assert_eq!(responses[0].kind, CommandKind::Finish);
    }

    #[test]
    fn test_read_scenario_with_one_retry() {
        let (engine, transport, delegate) = engine();

        engine.submit(CommandKind::Read, None);
        engine.on_write_completed(Err(write_error()));
        engine.on_write_completed(Ok(()));
        assert_eq!(transport.write_count(), 2);

        engine.on_inbound_payload(
            br#"{"SEQU":0,"RESP":"READ","RSLT":0,"ACPO":{"SSID":"Home","RCPI":-50,"INDE":0,"COUN":1,"CHAN":6}}"#,
        );

        let responses = delegate.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].kind, CommandKind::Read);
        assert_eq!(responses[0].result_code, 0);
        assert_eq!(responses[0].payload.as_ref().unwrap().ssid, "Home");
    }

    #[test]
    fn test_cancel_only_removes_queued_requests() {
        let (engine, transport, _) = engine();

        let scan = engine.submit(CommandKind::Scan, None);
        let info = engine.submit(CommandKind::Info, None);

        assert!(!engine.cancel(&scan));
        assert!(engine.cancel(&info));
        assert!(!engine.cancel(&info));
        assert_eq!(engine.pending_count(), 1);

        // With Info gone, acknowledging Scan leaves nothing to promote.
        engine.on_write_completed(Ok(()));
        assert_eq!(transport.write_count(), 1);
        assert_eq!(engine.in_flight(), None);
    }

    #[test]
    fn test_connection_lost_resets_and_notifies() {
        let (engine, _, delegate) = engine();

        engine.submit(CommandKind::Scan, None);
        engine.submit(CommandKind::Info, None);
        engine.on_connection_lost();

        assert_eq!(engine.pending_count(), 0);
        assert_eq!(engine.in_flight(), None);
        assert_eq!(*delegate.disconnects.lock().unwrap(), 1);

        // A fresh submission after reset dispatches normally.
        let request = engine.submit(CommandKind::Read, None);
        assert_eq!(engine.in_flight(), Some(request));
    }

    #[test]
    fn test_write_initiation_failure_uses_retry_policy() {
        struct FailingTransport {
            attempts: StdMutex<usize>,
        }

        impl Transport for FailingTransport {
            fn write(&self, _payload: &[u8]) -> Result<()> {
                *self.attempts.lock().unwrap() += 1;
                Err(CollarError::NotConnected)
            }

            fn max_payload_size(&self) -> usize {
                512
            }
        }

        let transport = Arc::new(FailingTransport {
            attempts: StdMutex::new(0),
        });
        let delegate = Arc::new(RecordingDelegate::default());
        let engine = CommandEngine::new(transport.clone(), delegate.clone());

        engine.submit(CommandKind::Finish, None);

        assert_eq!(*transport.attempts.lock().unwrap(), 3);
        assert_eq!(delegate.failed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_spurious_write_completion_is_ignored() {
        let (engine, transport, delegate) = engine();

        engine.on_write_completed(Ok(()));
        engine.on_write_completed(Err(write_error()));

        assert_eq!(transport.write_count(), 0);
        assert!(delegate.failed.lock().unwrap().is_empty());
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn test_collar_id_is_configurable() {
        let (engine, _, _) = engine();

        engine.set_collar_id(Some("ffff-0000".to_string()));
        let request = engine.submit(CommandKind::Scan, None);
        assert_eq!(request.correlation_tag.as_deref(), Some("ffff-0000"));

        engine.on_write_completed(Ok(()));
        engine.set_collar_id(None);
        let request = engine.submit(CommandKind::Info, None);
        assert!(request.correlation_tag.is_none());
    }
}
