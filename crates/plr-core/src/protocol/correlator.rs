//! Request/response correlation
//!
//! Replies and pushes share one ordered byte stream. The correlator keeps
//! two FIFO queues: requests written but not yet answered, and callers
//! waiting for the next measurement push. Replies are matched strictly in
//! the order the requests were written.
//!
//! The correlator does no I/O. `submit` hands back the encoded frame and
//! the caller must pass it on to the writer before releasing the
//! correlator, so queue order equals wire order.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};

use super::checksum::ChecksumEngine;
use super::commands::{Command, Reply, ReplyDecoder, PUSH_EXCHANGE_DATA};
use super::frame::{self, Frame, RequestFrame, ResponseFrame};
use super::payload::{decode_exchange_data, ExchangeData};
use super::stream::RejectedFrame;
use super::ProtocolError;

/// Identifies one submitted request
pub type RequestId = u64;

type ReplySender = oneshot::Sender<Result<Reply, ProtocolError>>;
type PushSender = oneshot::Sender<Result<ExchangeData, ProtocolError>>;

struct PendingRequest {
    id: RequestId,
    command: u8,
    decoder: ReplyDecoder,
    reply: ReplySender,
}

/// Completion handle for a submitted request
#[derive(Debug)]
pub struct ReplyHandle {
    id: RequestId,
    rx: oneshot::Receiver<Result<Reply, ProtocolError>>,
}

impl ReplyHandle {
    /// Id for `expire` / `fail`
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the reply. A dropped correlator counts as a disconnect.
    pub async fn wait(self) -> Result<Reply, ProtocolError> {
        self.rx.await.map_err(|_| ProtocolError::Disconnected)?
    }
}

/// Completion handle for the next measurement push
#[derive(Debug)]
pub struct MeasurementHandle {
    rx: oneshot::Receiver<Result<ExchangeData, ProtocolError>>,
}

impl MeasurementHandle {
    /// Wait for the push. A dropped correlator counts as a disconnect.
    pub async fn wait(self) -> Result<ExchangeData, ProtocolError> {
        self.rx.await.map_err(|_| ProtocolError::Disconnected)?
    }
}

/// An encoded frame ready to write, plus the handle its reply resolves
#[derive(Debug)]
pub struct Submission {
    /// Encoded frame, checksum included
    pub frame: Vec<u8>,
    /// Resolves with the reply
    pub handle: ReplyHandle,
}

/// Matches inbound frames to outstanding requests and push waiters
pub struct Correlator {
    checksums: Arc<ChecksumEngine>,
    pending: VecDeque<PendingRequest>,
    push_waiters: VecDeque<PushSender>,
    observers: broadcast::Sender<ExchangeData>,
    next_id: RequestId,
    connected: bool,
}

impl Correlator {
    /// `push_capacity` bounds how many pushes a slow observer may lag behind
    pub fn new(checksums: Arc<ChecksumEngine>, push_capacity: usize) -> Self {
        let (observers, _) = broadcast::channel(push_capacity.max(1));
        Self {
            checksums,
            pending: VecDeque::new(),
            push_waiters: VecDeque::new(),
            observers,
            next_id: 1,
            connected: true,
        }
    }

    /// Encode `template` and queue a waiter for its reply
    pub fn submit(
        &mut self,
        template: &[u8],
        decoder: ReplyDecoder,
    ) -> Result<Submission, ProtocolError> {
        if !self.connected {
            return Err(ProtocolError::NotConnected);
        }
        let frame = frame::encode(&self.checksums, template)?;

        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.push_back(PendingRequest {
            id,
            command: template.get(1).copied().unwrap_or_default(),
            decoder,
            reply: tx,
        });
        tracing::debug!(
            "request {} queued ({} pending): {:02x?}",
            id,
            self.pending.len(),
            frame
        );

        Ok(Submission {
            frame,
            handle: ReplyHandle { id, rx },
        })
    }

    /// Submit one of the fixed device commands
    pub fn submit_command(&mut self, command: Command) -> Result<Submission, ProtocolError> {
        self.submit(command.template(), command.reply_decoder())
    }

    /// Queue a waiter for the next measurement push
    pub fn wait_for_next_measurement(&mut self) -> MeasurementHandle {
        let (tx, rx) = oneshot::channel();
        if self.connected {
            self.push_waiters.push_back(tx);
        } else {
            let _ = tx.send(Err(ProtocolError::Disconnected));
        }
        MeasurementHandle { rx }
    }

    /// Observe every measurement push
    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeData> {
        self.observers.subscribe()
    }

    /// Route an inbound frame.
    ///
    /// The rule is the frame shape alone: response frames answer the
    /// oldest pending request, request-shaped frames are device pushes,
    /// invalid frames are dropped. Queue contents never change the route.
    pub fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::Response(response) => self.on_response_frame(response),
            Frame::Request(push) => {
                if let Err(e) = self.on_push_frame(push) {
                    tracing::warn!("dropping push frame: {}", e);
                }
            }
            Frame::Invalid { info } => {
                tracing::warn!("dropping frame with invalid info byte {:#04x}", info);
            }
        }
    }

    /// Route a frame that failed to decode.
    ///
    /// A response-shaped frame still answers the oldest pending request,
    /// which resolves with the decode error. Anything else is dropped.
    pub fn dispatch_rejected(&mut self, rejected: RejectedFrame) {
        if !rejected.response {
            tracing::warn!("discarding inbound frame: {}", rejected.error);
            return;
        }

        let Some(pending) = self.pending.pop_front() else {
            tracing::warn!(
                "bad response with no pending request, dropped: {}",
                rejected.error
            );
            return;
        };
        tracing::warn!(
            "reply to request {} ({:#04x}) rejected: {}",
            pending.id,
            pending.command,
            rejected.error
        );
        if pending.reply.send(Err(rejected.error)).is_err() {
            tracing::debug!("request {} caller went away", pending.id);
        }
    }

    /// Resolve the oldest pending request with this response
    pub fn on_response_frame(&mut self, frame: ResponseFrame) {
        let Some(pending) = self.pending.pop_front() else {
            tracing::warn!(
                "response ({:?}) with no pending request, dropped",
                frame.comm_status
            );
            return;
        };

        if frame.hardware_error || frame.not_ready {
            tracing::warn!(
                "device flags on reply to {:#04x}: hardware_error={} not_ready={}",
                pending.command,
                frame.hardware_error,
                frame.not_ready
            );
        }

        let result = if frame.comm_status.is_success() {
            pending.decoder.decode(&frame.data)
        } else {
            Err(ProtocolError::DeviceReportedFailure(frame.comm_status))
        };
        tracing::debug!("request {} resolved: {:?}", pending.id, result);

        if pending.reply.send(result).is_err() {
            tracing::debug!("request {} caller went away", pending.id);
        }
    }

    /// Handle a frame the device sent on its own
    pub fn on_push_frame(&mut self, frame: RequestFrame) -> Result<(), ProtocolError> {
        if frame.command != PUSH_EXCHANGE_DATA {
            return Err(ProtocolError::UnknownCommand(frame.command));
        }

        let data = decode_exchange_data(&frame.data)?;
        tracing::debug!("measurement push {}: {:?}", data.id, data);

        // No subscribers is fine
        let _ = self.observers.send(data);

        // Skip waiters whose caller gave up; resolve at most one
        while let Some(waiter) = self.push_waiters.pop_front() {
            if waiter.send(Ok(data)).is_ok() {
                break;
            }
        }
        Ok(())
    }

    /// Withdraw one pending request, resolving it with `error`
    pub fn fail(&mut self, id: RequestId, error: ProtocolError) -> bool {
        let Some(index) = self.pending.iter().position(|p| p.id == id) else {
            return false;
        };
        if let Some(pending) = self.pending.remove(index) {
            tracing::debug!("request {} withdrawn: {}", id, error);
            let _ = pending.reply.send(Err(error));
        }
        true
    }

    /// Remove a request whose deadline passed
    pub fn expire(&mut self, id: RequestId) -> bool {
        self.fail(id, ProtocolError::Timeout)
    }

    /// Resolve everything outstanding with `Disconnected`.
    ///
    /// Later submissions fail with `NotConnected`.
    pub fn abandon_all(&mut self) {
        self.connected = false;

        let requests = self.pending.len();
        let waiters = self.push_waiters.len();
        if requests + waiters > 0 {
            tracing::info!(
                "abandoning {} pending requests and {} measurement waiters",
                requests,
                waiters
            );
        }

        for pending in self.pending.drain(..) {
            let _ = pending.reply.send(Err(ProtocolError::Disconnected));
        }
        for waiter in self.push_waiters.drain(..) {
            let _ = waiter.send(Err(ProtocolError::Disconnected));
        }
    }

    /// False once `abandon_all` ran
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Requests written but not yet answered
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Callers waiting for the next push
    pub fn pending_push_waiters(&self) -> usize {
        self.push_waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{CommStatus, RequestFormat};

    fn correlator() -> Correlator {
        Correlator::new(Arc::new(ChecksumEngine::new()), 8)
    }

    fn push(command: u8, data: Vec<u8>) -> RequestFrame {
        RequestFrame {
            request_format: RequestFormat::Long,
            response_format: RequestFormat::Long,
            command,
            data_length: data.len(),
            data,
            checksum: 0,
        }
    }

    fn exchange_bytes(id: u16) -> Vec<u8> {
        let mut data = vec![0b01, 0b0001];
        data.extend_from_slice(&id.to_le_bytes());
        data.extend_from_slice(&2.5f32.to_le_bytes());
        data.extend_from_slice(&0f32.to_le_bytes());
        data.extend_from_slice(&0f32.to_le_bytes());
        data
    }

    #[tokio::test]
    async fn test_submit_encodes_frame() {
        let mut correlator = correlator();
        let submission = correlator.submit_command(Command::Name).unwrap();
        assert_eq!(submission.frame, vec![0xc0, 0x05, 0x00, 0xc2]);
        assert_eq!(correlator.pending_requests(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_unsupported_mode() {
        let mut correlator = correlator();
        let err = correlator
            .submit(&[0xcc, 0x05, 0x00], ReplyDecoder::Ack)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedMode(_)));
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_replies_resolve_in_fifo_order() {
        let mut correlator = correlator();
        let a = correlator.submit_command(Command::Name).unwrap().handle;
        let b = correlator.submit_command(Command::Measure).unwrap().handle;

        correlator.on_response_frame(ResponseFrame::success(b"PLR 40C\0".to_vec()));
        correlator.on_response_frame(ResponseFrame::success(2000u32.to_le_bytes().to_vec()));

        assert_eq!(a.wait().await.unwrap(), Reply::Text("PLR 40C".to_string()));
        assert_eq!(b.wait().await.unwrap(), Reply::Distance(100.0));
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_failure_status_resolves_with_error() {
        let mut correlator = correlator();
        let handle = correlator.submit_command(Command::Info).unwrap().handle;

        correlator.on_response_frame(ResponseFrame::with_status(
            CommStatus::InvalidAccessLevel,
            vec![],
        ));

        assert!(matches!(
            handle.wait().await,
            Err(ProtocolError::DeviceReportedFailure(
                CommStatus::InvalidAccessLevel
            ))
        ));
    }

    #[tokio::test]
    async fn test_short_payload_resolves_with_truncation() {
        let mut correlator = correlator();
        let handle = correlator.submit_command(Command::Measure).unwrap().handle;
        correlator.on_response_frame(ResponseFrame::success(vec![0x01]));
        assert!(matches!(
            handle.wait().await,
            Err(ProtocolError::TruncatedPayload { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_dropped() {
        let mut correlator = correlator();
        correlator.on_response_frame(ResponseFrame::success(vec![]));
        assert_eq!(correlator.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_push_resolves_one_waiter_and_notifies_observers() {
        let mut correlator = correlator();
        let mut observer = correlator.subscribe();
        let waiter = correlator.wait_for_next_measurement();

        correlator.dispatch(Frame::Request(push(PUSH_EXCHANGE_DATA, exchange_bytes(1))));
        assert_eq!(correlator.pending_push_waiters(), 0);
        assert_eq!(waiter.wait().await.unwrap().id, 1);
        assert_eq!(observer.recv().await.unwrap().id, 1);

        // No waiter left: observers only
        correlator.dispatch(Frame::Request(push(PUSH_EXCHANGE_DATA, exchange_bytes(2))));
        assert_eq!(observer.recv().await.unwrap().id, 2);
        assert_eq!(correlator.pending_push_waiters(), 0);
    }

    #[tokio::test]
    async fn test_push_waiters_are_fifo() {
        let mut correlator = correlator();
        let first = correlator.wait_for_next_measurement();
        let second = correlator.wait_for_next_measurement();

        correlator.dispatch(Frame::Request(push(PUSH_EXCHANGE_DATA, exchange_bytes(10))));
        assert_eq!(correlator.pending_push_waiters(), 1);
        correlator.dispatch(Frame::Request(push(PUSH_EXCHANGE_DATA, exchange_bytes(11))));

        assert_eq!(first.wait().await.unwrap().id, 10);
        assert_eq!(second.wait().await.unwrap().id, 11);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let mut correlator = correlator();
        drop(correlator.wait_for_next_measurement());
        let live = correlator.wait_for_next_measurement();

        correlator.dispatch(Frame::Request(push(PUSH_EXCHANGE_DATA, exchange_bytes(3))));
        assert_eq!(live.wait().await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_push_does_not_touch_request_queue() {
        let mut correlator = correlator();
        let _handle = correlator.submit_command(Command::BeginReceive).unwrap();
        correlator.dispatch(Frame::Request(push(PUSH_EXCHANGE_DATA, exchange_bytes(4))));
        assert_eq!(correlator.pending_requests(), 1);
    }

    #[tokio::test]
    async fn test_unknown_push_command_is_dropped() {
        let mut correlator = correlator();
        let _handle = correlator.submit_command(Command::Name).unwrap();
        let _waiter = correlator.wait_for_next_measurement();

        assert!(matches!(
            correlator.on_push_frame(push(0x22, vec![])),
            Err(ProtocolError::UnknownCommand(0x22))
        ));
        correlator.dispatch(Frame::Invalid { info: 0x80 });

        assert_eq!(correlator.pending_requests(), 1);
        assert_eq!(correlator.pending_push_waiters(), 1);
    }

    #[tokio::test]
    async fn test_rejected_response_retires_head() {
        let mut correlator = correlator();
        let a = correlator.submit_command(Command::Name).unwrap().handle;
        let b = correlator.submit_command(Command::Measure).unwrap().handle;

        correlator.dispatch_rejected(RejectedFrame {
            response: true,
            error: ProtocolError::ChecksumMismatch {
                expected: 0x12,
                actual: 0x34,
            },
        });
        correlator.on_response_frame(ResponseFrame::success(100u32.to_le_bytes().to_vec()));

        assert!(matches!(
            a.wait().await,
            Err(ProtocolError::ChecksumMismatch {
                expected: 0x12,
                actual: 0x34
            })
        ));
        assert_eq!(b.wait().await.unwrap(), Reply::Distance(5.0));
    }

    #[tokio::test]
    async fn test_rejected_push_leaves_queue_alone() {
        let mut idle = correlator();
        let mut correlator = correlator();
        let _handle = correlator.submit_command(Command::Name).unwrap();

        correlator.dispatch_rejected(RejectedFrame {
            response: false,
            error: ProtocolError::MalformedFrame("reserved".to_string()),
        });
        assert_eq!(correlator.pending_requests(), 1);

        // Nothing pending: dropped without panicking
        idle.dispatch_rejected(RejectedFrame {
            response: true,
            error: ProtocolError::ChecksumMismatch {
                expected: 0,
                actual: 1,
            },
        });
        assert_eq!(idle.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_expire_removes_entry() {
        let mut correlator = correlator();
        let a = correlator.submit_command(Command::Name).unwrap().handle;
        let b = correlator.submit_command(Command::Info).unwrap().handle;

        assert!(correlator.expire(a.id()));
        assert!(!correlator.expire(a.id()));
        assert!(matches!(a.wait().await, Err(ProtocolError::Timeout)));

        // The next reply now goes to b
        correlator.on_response_frame(ResponseFrame::with_status(CommStatus::InvalidData, vec![]));
        assert!(matches!(
            b.wait().await,
            Err(ProtocolError::DeviceReportedFailure(CommStatus::InvalidData))
        ));
    }

    #[tokio::test]
    async fn test_abandon_all() {
        let mut correlator = correlator();
        let request = correlator.submit_command(Command::LaserOn).unwrap().handle;
        let waiter = correlator.wait_for_next_measurement();

        correlator.abandon_all();

        assert!(matches!(request.wait().await, Err(ProtocolError::Disconnected)));
        assert!(matches!(waiter.wait().await, Err(ProtocolError::Disconnected)));
        assert_eq!(correlator.pending_requests(), 0);
        assert_eq!(correlator.pending_push_waiters(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_abandon_fails() {
        let mut correlator = correlator();
        correlator.abandon_all();

        assert!(!correlator.is_connected());
        assert!(matches!(
            correlator.submit_command(Command::Name),
            Err(ProtocolError::NotConnected)
        ));
        let waiter = correlator.wait_for_next_measurement();
        assert!(matches!(waiter.wait().await, Err(ProtocolError::Disconnected)));
        assert_eq!(correlator.pending_push_waiters(), 0);
    }
}
