//! Network channel for quorum protocol messages.
//!
//! The channel multiplexes correlated requests and responses over a byte
//! transport it does not own. [`Transport`] is the seam to the underlying
//! socket client: the channel decides *what* to hand it and *when*, the
//! transport does connection management, framing, and I/O.
//!
//! Unreachable destinations never touch the network: the channel
//! synthesizes an inbound `BrokerNotAvailable` response on the caller's
//! correlation id (or `ClusterAuthorizationFailed` for authentication
//! failures) and delivers it on the next receive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{ErrorCode, RaftError, Result};
use crate::message::{ApiKey, RaftMessage, RequestPayload, ResponsePayload};
use crate::types::{CorrelationId, NodeId};

/// Connection readiness as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// The connection is established and writable.
    Ready,
    /// A connection attempt is in progress.
    Connecting,
    /// The connection failed or was disconnected.
    Failed,
    /// The peer rejected our credentials.
    AuthenticationFailed,
}

/// The byte-level socket client behind the channel.
///
/// Implementations own serialization, connection lifecycle, and the actual
/// poll loop; correlation ids pass through unchanged so responses can be
/// matched by the channel's caller.
pub trait Transport: Send {
    /// Readiness of the connection to `address`.
    fn status(&mut self, address: &str, now_ms: u64) -> ConnectionStatus;

    /// Submit a request with a per-request timeout.
    fn send_request(
        &mut self,
        address: &str,
        correlation_id: CorrelationId,
        request: RequestPayload,
        timeout_ms: u64,
    );

    /// Submit a response to a previously received inbound request.
    fn send_response(&mut self, correlation_id: CorrelationId, response: ResponsePayload);

    /// Block for up to `timeout_ms` and return completed inbound messages.
    fn poll(&mut self, timeout_ms: u64) -> Vec<RaftMessage>;

    /// Unblock a concurrent `poll`.
    fn wakeup(&self);
}

/// Correlation-id-multiplexed request/response channel.
pub trait NetworkChannel: Send {
    /// Allocate the next correlation id. Monotonic, unique per channel.
    fn new_correlation_id(&mut self) -> CorrelationId;

    /// Enqueue an outbound request or response.
    fn send(&mut self, message: RaftMessage) -> Result<()>;

    /// Flush pending sends, poll the transport, and return any mix of
    /// inbound requests, inbound responses, and synthesized responses.
    fn receive(&mut self, timeout_ms: u64) -> Result<Vec<RaftMessage>>;

    /// Unblock a concurrent `receive`.
    fn wakeup(&self);

    /// Learn or update the address of a peer.
    fn update_endpoint(&mut self, id: NodeId, address: String);
}

/// Production channel over a [`Transport`].
pub struct RaftNetworkChannel<T: Transport> {
    transport: T,
    clock: Arc<dyn Clock>,
    endpoints: HashMap<NodeId, String>,
    bootstrap: Vec<String>,
    bootstrap_cursor: usize,
    pending: VecDeque<RaftMessage>,
    synthesized: VecDeque<RaftMessage>,
    next_correlation: u32,
    max_pending: usize,
    retry_backoff_ms: u64,
    request_timeout_ms: u64,
}

impl<T: Transport> RaftNetworkChannel<T> {
    pub fn new(
        transport: T,
        clock: Arc<dyn Clock>,
        bootstrap: Vec<String>,
        max_pending: usize,
        retry_backoff_ms: u64,
        request_timeout_ms: u64,
    ) -> Self {
        Self {
            transport,
            clock,
            endpoints: HashMap::new(),
            bootstrap,
            bootstrap_cursor: 0,
            pending: VecDeque::new(),
            synthesized: VecDeque::new(),
            next_correlation: 0,
            max_pending,
            retry_backoff_ms,
            request_timeout_ms,
        }
    }

    fn synthesize(
        &mut self,
        correlation_id: CorrelationId,
        destination: NodeId,
        api_key: ApiKey,
        error_code: ErrorCode,
    ) -> Result<()> {
        debug!(
            %correlation_id,
            destination = %destination,
            api = %api_key,
            code = ?error_code,
            "synthesizing error response"
        );
        if self.synthesized.len() >= self.max_pending {
            return Err(RaftError::QueueOverflow(self.synthesized.len()));
        }
        self.synthesized.push_back(RaftMessage::InboundResponse {
            correlation_id,
            source: destination,
            response: ResponsePayload::error_of(api_key, error_code),
        });
        Ok(())
    }

    /// Resolve the concrete address for a destination. `INVALID` routes to
    /// the bootstrap list round-robin.
    fn resolve(&mut self, destination: NodeId) -> Option<String> {
        if destination.is_valid() {
            self.endpoints.get(&destination).cloned()
        } else if self.bootstrap.is_empty() {
            None
        } else {
            let address = self.bootstrap[self.bootstrap_cursor % self.bootstrap.len()].clone();
            self.bootstrap_cursor = self.bootstrap_cursor.wrapping_add(1);
            Some(address)
        }
    }

    /// Drain the pending queue as far as connection readiness allows. A
    /// request whose connection is still being established stays at the
    /// head and is retried on the next receive.
    fn flush(&mut self, now_ms: u64) -> Result<()> {
        while let Some(message) = self.pending.pop_front() {
            match message {
                RaftMessage::OutboundResponse {
                    correlation_id,
                    response,
                } => {
                    self.transport.send_response(correlation_id, response);
                }
                RaftMessage::OutboundRequest {
                    correlation_id,
                    destination,
                    request,
                } => {
                    let Some(address) = self.resolve(destination) else {
                        self.synthesize(
                            correlation_id,
                            destination,
                            request.api_key(),
                            ErrorCode::BrokerNotAvailable,
                        )?;
                        continue;
                    };
                    match self.transport.status(&address, now_ms) {
                        ConnectionStatus::Ready => {
                            self.transport.send_request(
                                &address,
                                correlation_id,
                                request,
                                self.request_timeout_ms,
                            );
                        }
                        ConnectionStatus::Connecting => {
                            // Not writable yet: put it back at the head and
                            // retry on the next receive.
                            self.pending.push_front(RaftMessage::OutboundRequest {
                                correlation_id,
                                destination,
                                request,
                            });
                            break;
                        }
                        ConnectionStatus::Failed => {
                            self.synthesize(
                                correlation_id,
                                destination,
                                request.api_key(),
                                ErrorCode::BrokerNotAvailable,
                            )?;
                        }
                        ConnectionStatus::AuthenticationFailed => {
                            self.synthesize(
                                correlation_id,
                                destination,
                                request.api_key(),
                                ErrorCode::ClusterAuthorizationFailed,
                            )?;
                        }
                    }
                }
                other => {
                    warn!(api = %other.api_key(), "dropping non-outbound message from send queue");
                }
            }
        }
        Ok(())
    }

    /// Derive the transport poll timeout: no sleep while synthesized work
    /// is pending, at most the retry backoff while sends wait for a
    /// connection, otherwise the caller's timeout.
    fn poll_timeout(&self, timeout_ms: u64) -> u64 {
        if !self.synthesized.is_empty() {
            0
        } else if !self.pending.is_empty() {
            timeout_ms.min(self.retry_backoff_ms)
        } else {
            timeout_ms
        }
    }
}

impl<T: Transport> NetworkChannel for RaftNetworkChannel<T> {
    fn new_correlation_id(&mut self) -> CorrelationId {
        let id = CorrelationId(self.next_correlation);
        self.next_correlation = self.next_correlation.wrapping_add(1);
        id
    }

    fn send(&mut self, message: RaftMessage) -> Result<()> {
        match message {
            RaftMessage::OutboundRequest { .. } | RaftMessage::OutboundResponse { .. } => {
                if self.pending.len() >= self.max_pending {
                    return Err(RaftError::QueueOverflow(self.pending.len()));
                }
                self.pending.push_back(message);
                Ok(())
            }
            _ => Err(RaftError::Config(
                "only outbound messages can be sent".to_string(),
            )),
        }
    }

    fn receive(&mut self, timeout_ms: u64) -> Result<Vec<RaftMessage>> {
        let now_ms = self.clock.now_ms();
        self.flush(now_ms)?;

        let poll_timeout = self.poll_timeout(timeout_ms);
        let inbound = self.transport.poll(poll_timeout);

        let mut messages: Vec<RaftMessage> = self.synthesized.drain(..).collect();
        messages.extend(inbound);
        Ok(messages)
    }

    fn wakeup(&self) {
        self.transport.wakeup();
    }

    fn update_endpoint(&mut self, id: NodeId, address: String) {
        self.endpoints.insert(id, address);
    }
}

/// Shared handle so the driving thread and a test (or an application
/// thread calling `wakeup`) can use one channel.
impl<N: NetworkChannel> NetworkChannel for Arc<Mutex<N>> {
    fn new_correlation_id(&mut self) -> CorrelationId {
        self.lock().new_correlation_id()
    }

    fn send(&mut self, message: RaftMessage) -> Result<()> {
        self.lock().send(message)
    }

    fn receive(&mut self, timeout_ms: u64) -> Result<Vec<RaftMessage>> {
        self.lock().receive(timeout_ms)
    }

    fn wakeup(&self) {
        self.lock().wakeup()
    }

    fn update_endpoint(&mut self, id: NodeId, address: String) {
        self.lock().update_endpoint(id, address)
    }
}
