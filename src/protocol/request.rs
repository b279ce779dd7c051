//! Typed requests and their erasure for the request pump
//!
//! Public callers issue typed `kafka-protocol` request structs through
//! [`ClientRequest`]. The per-broker pump works with heterogeneous queued
//! requests, so typed requests are erased into [`AnyRequest`] objects that
//! can encode at a negotiated version and decode their paired response.
//!
//! The trait also carries the per-type metadata the core needs from its
//! codec collaborator: which requests embed their own timeout (these route
//! to the slow connection and extend the read deadline), and which
//! responses report throttling — with the version at which brokers switch
//! from delaying the response themselves to expecting the client to delay
//! its next write (KIP-219).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiVersionsRequest, ApiVersionsResponse, CreatePartitionsRequest, CreatePartitionsResponse,
    CreateTopicsRequest, CreateTopicsResponse, DeleteRecordsRequest, DeleteRecordsResponse,
    DeleteTopicsRequest, DeleteTopicsResponse, EndTxnRequest, EndTxnResponse, FetchRequest,
    FetchResponse, FindCoordinatorRequest, FindCoordinatorResponse, HeartbeatRequest,
    HeartbeatResponse, InitProducerIdRequest, InitProducerIdResponse, JoinGroupRequest,
    JoinGroupResponse, LeaveGroupRequest, LeaveGroupResponse, ListOffsetsRequest,
    ListOffsetsResponse, MetadataRequest, MetadataResponse, OffsetCommitRequest,
    OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse, ProduceRequest,
    ProduceResponse, SaslAuthenticateRequest, SaslHandshakeRequest,
    SyncGroupRequest, SyncGroupResponse,
};
use kafka_protocol::protocol::{Decodable, Message, Request};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{KaflinkError, Result};

/// Throttle information extracted from a decoded response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleHint {
    /// How long the broker asked us to wait, in milliseconds
    pub millis: i32,
    /// True when the broker sent the response first and expects the
    /// client to delay its next write; false when the broker already
    /// delayed the response itself
    pub after_response: bool,
}

fn throttle_hint(millis: i32, after_response: bool) -> Option<ThrottleHint> {
    (millis > 0).then_some(ThrottleHint { millis, after_response })
}

/// Cancellation and tracing identity for one request.
///
/// Cancelling the context aborts a pending dispatch: a throttle wait
/// returns immediately with [`KaflinkError::Cancelled`] and leaves the
/// connection alive, while an in-flight read or write is unblocked and the
/// connection is killed (its state is unknowable mid-frame).
#[derive(Debug, Clone)]
pub struct RequestContext {
    token: CancellationToken,
    request_id: Arc<str>,
}

impl RequestContext {
    /// Fresh context with a generated request id
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            request_id: Uuid::new_v4().to_string().into(),
        }
    }

    /// Fresh context with a caller-supplied request id for tracing
    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            token: CancellationToken::new(),
            request_id: request_id.into().into(),
        }
    }

    /// Cancel the request
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the request was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The request id used in log lines
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed Kafka request this client can dispatch.
///
/// Implementations exist for the request structs the connection core
/// itself needs plus the common data-plane and group requests; downstream
/// layers add impls for further message types the same way.
pub trait ClientRequest: Request + fmt::Debug + Send + Sync + 'static
where
    Self::Response: Send + 'static,
{
    /// True for requests that embed their own operation timeout; these
    /// are routed to the slow connection.
    fn is_timeout_request(&self) -> bool {
        false
    }

    /// The request-embedded timeout, used to extend the response read
    /// deadline beyond the configured overhead.
    fn timeout_millis(&self) -> Option<i32> {
        None
    }

    /// Throttle information carried by the paired response at `version`,
    /// if any.
    fn throttle(_resp: &Self::Response, _version: i16) -> Option<ThrottleHint> {
        None
    }
}

impl ClientRequest for ApiVersionsRequest {
    fn throttle(resp: &ApiVersionsResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 2)
    }
}

impl ClientRequest for ProduceRequest {
    fn timeout_millis(&self) -> Option<i32> {
        Some(self.timeout_ms)
    }

    fn throttle(resp: &ProduceResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 6)
    }
}

impl ClientRequest for FetchRequest {
    fn timeout_millis(&self) -> Option<i32> {
        Some(self.max_wait_ms)
    }

    fn throttle(resp: &FetchResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 8)
    }
}

impl ClientRequest for MetadataRequest {
    fn throttle(resp: &MetadataResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 6)
    }
}

impl ClientRequest for ListOffsetsRequest {
    fn throttle(resp: &ListOffsetsResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 4)
    }
}

impl ClientRequest for OffsetCommitRequest {
    fn throttle(resp: &OffsetCommitResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 4)
    }
}

impl ClientRequest for OffsetFetchRequest {
    fn throttle(resp: &OffsetFetchResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 4)
    }
}

impl ClientRequest for FindCoordinatorRequest {
    fn throttle(resp: &FindCoordinatorResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 2)
    }
}

impl ClientRequest for JoinGroupRequest {
    fn timeout_millis(&self) -> Option<i32> {
        Some(self.rebalance_timeout_ms)
    }

    fn throttle(resp: &JoinGroupResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 3)
    }
}

impl ClientRequest for SyncGroupRequest {
    fn throttle(resp: &SyncGroupResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 2)
    }
}

impl ClientRequest for HeartbeatRequest {
    fn throttle(resp: &HeartbeatResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 2)
    }
}

impl ClientRequest for LeaveGroupRequest {
    fn throttle(resp: &LeaveGroupResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 2)
    }
}

impl ClientRequest for SaslHandshakeRequest {}

impl ClientRequest for SaslAuthenticateRequest {}

impl ClientRequest for InitProducerIdRequest {
    fn throttle(resp: &InitProducerIdResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 1)
    }
}

impl ClientRequest for EndTxnRequest {
    fn throttle(resp: &EndTxnResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 1)
    }
}

impl ClientRequest for CreateTopicsRequest {
    fn is_timeout_request(&self) -> bool {
        true
    }

    fn timeout_millis(&self) -> Option<i32> {
        Some(self.timeout_ms)
    }

    fn throttle(resp: &CreateTopicsResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 3)
    }
}

impl ClientRequest for DeleteTopicsRequest {
    fn is_timeout_request(&self) -> bool {
        true
    }

    fn timeout_millis(&self) -> Option<i32> {
        Some(self.timeout_ms)
    }

    fn throttle(resp: &DeleteTopicsResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 2)
    }
}

impl ClientRequest for DeleteRecordsRequest {
    fn is_timeout_request(&self) -> bool {
        true
    }

    fn timeout_millis(&self) -> Option<i32> {
        Some(self.timeout_ms)
    }

    fn throttle(resp: &DeleteRecordsResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 1)
    }
}

impl ClientRequest for CreatePartitionsRequest {
    fn is_timeout_request(&self) -> bool {
        true
    }

    fn timeout_millis(&self) -> Option<i32> {
        Some(self.timeout_ms)
    }

    fn throttle(resp: &CreatePartitionsResponse, version: i16) -> Option<ThrottleHint> {
        throttle_hint(resp.throttle_time_ms, version >= 1)
    }
}

/// A queued request with its type erased, as the pump sees it.
pub(crate) trait AnyRequest: Send + Sync {
    fn api_key(&self) -> i16;
    fn max_version(&self) -> i16;
    fn is_timeout_request(&self) -> bool;
    fn timeout_millis(&self) -> Option<i32>;
    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()>;
    fn decode_response(
        &self,
        body: &mut Bytes,
        version: i16,
    ) -> Result<(Box<dyn Any + Send>, Option<ThrottleHint>)>;
    /// The underlying typed request, for the produce acks rewrite.
    fn inner_any_mut(&mut self) -> &mut (dyn Any + Send);
}

/// The concrete erasure wrapper for a typed request.
pub(crate) struct ErasedRequest<R> {
    inner: R,
}

impl<R> ErasedRequest<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R> AnyRequest for ErasedRequest<R>
where
    R: ClientRequest,
    R::Response: Send + 'static,
{
    fn api_key(&self) -> i16 {
        R::KEY
    }

    fn max_version(&self) -> i16 {
        <R as Message>::VERSIONS.max
    }

    fn is_timeout_request(&self) -> bool {
        self.inner.is_timeout_request()
    }

    fn timeout_millis(&self) -> Option<i32> {
        self.inner.timeout_millis()
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        self.inner
            .encode(buf, version)
            .map_err(|e| KaflinkError::protocol("encode request body", e.to_string()))
    }

    fn decode_response(
        &self,
        body: &mut Bytes,
        version: i16,
    ) -> Result<(Box<dyn Any + Send>, Option<ThrottleHint>)> {
        let resp = <R::Response as Decodable>::decode(body, version)
            .map_err(|e| KaflinkError::protocol("decode response body", e.to_string()))?;
        let throttle = R::throttle(&resp, version);
        Ok((Box::new(resp), throttle))
    }

    fn inner_any_mut(&mut self) -> &mut (dyn Any + Send) {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_hint_only_when_positive() {
        assert_eq!(throttle_hint(0, true), None);
        assert_eq!(throttle_hint(-1, true), None);
        assert_eq!(
            throttle_hint(250, true),
            Some(ThrottleHint { millis: 250, after_response: true })
        );
    }

    #[test]
    fn produce_throttle_applies_after_response_from_v6() {
        let resp = ProduceResponse::default().with_throttle_time_ms(100);
        let before = ProduceRequest::throttle(&resp, 5).unwrap();
        assert!(!before.after_response);
        let after = ProduceRequest::throttle(&resp, 6).unwrap();
        assert!(after.after_response);
    }

    #[test]
    fn timeout_request_flags() {
        assert!(CreateTopicsRequest::default().is_timeout_request());
        assert!(DeleteRecordsRequest::default().is_timeout_request());
        assert!(!ProduceRequest::default().is_timeout_request());
        assert!(!MetadataRequest::default().is_timeout_request());
    }

    #[test]
    fn erased_request_exposes_key_and_versions() {
        let erased = ErasedRequest::new(ProduceRequest::default());
        assert_eq!(erased.api_key(), 0);
        assert_eq!(erased.max_version(), <ProduceRequest as Message>::VERSIONS.max);
    }

    #[test]
    fn erased_request_allows_acks_rewrite() {
        let mut erased: Box<dyn AnyRequest> =
            Box::new(ErasedRequest::new(ProduceRequest::default().with_acks(-1)));
        let produce = erased
            .inner_any_mut()
            .downcast_mut::<ProduceRequest>()
            .unwrap();
        produce.acks = 0;
        produce.timeout_ms = 1234;

        let inner = erased.inner_any_mut().downcast_ref::<ProduceRequest>().unwrap();
        assert_eq!(inner.acks, 0);
        assert_eq!(inner.timeout_ms, 1234);
    }

    #[test]
    fn request_context_cancellation() {
        let ctx = RequestContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
        assert!(!ctx.request_id().is_empty());

        let named = RequestContext::with_request_id("req-42");
        assert_eq!(named.request_id(), "req-42");
    }
}
