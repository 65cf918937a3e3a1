//! Request/response multiplexing over the shared connection.
//!
//! Every outbound request gets a fresh `req_id`. The dispatch task feeds
//! each inbound frame to [`RequestCorrelator::dispatch`], which completes
//! the pending request carrying that id, or hands push traffic to the
//! [`SubscriptionRegistry`]. Frames matching neither are logged and
//! dropped.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::registry::{SubscriptionHandle, SubscriptionRegistry};
use crate::config::SessionConfig;
use crate::connection::ConnectionLink;
use crate::error::{DerivError, Result};
use crate::protocol::frames::preview;
use crate::protocol::{InboundFrame, Request, RequestKind, Response, SubscriptionKey};

type Completion = oneshot::Sender<Result<Response>>;

struct PendingRequest {
    kind: RequestKind,
    created_at: Instant,
    deadline: Instant,
    completion: Completion,
    /// Registry entry waiting on this subscribe response
    subscription: Option<(SubscriptionKey, u64)>,
}

/// Caller's side of one in-flight request.
///
/// Dropping the handle cancels the request: its pending entry is removed
/// and a late response is dropped as unmatched.
pub struct ResponseHandle {
    req_id: u64,
    kind: RequestKind,
    deadline: Instant,
    timeout: Duration,
    receiver: oneshot::Receiver<Result<Response>>,
    pending: Arc<DashMap<u64, PendingRequest>>,
    _permit: OwnedSemaphorePermit,
}

impl ResponseHandle {
    pub fn req_id(&self) -> u64 {
        self.req_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Wait for the response, the deadline, or connection loss
    pub async fn wait(mut self) -> Result<Response> {
        match timeout_at(self.deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DerivError::ConnectionLost),
            Err(_) => {
                warn!(req_id = self.req_id, kind = %self.kind, "Request timed out");
                Err(DerivError::RequestTimeout {
                    kind: self.kind.to_string(),
                    req_id: self.req_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Give up on the request without waiting
    pub fn cancel(self) {
        debug!(req_id = self.req_id, kind = %self.kind, "Request cancelled by caller");
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        self.pending.remove(&self.req_id);
    }
}

/// Correlates requests with responses and routes push traffic
pub struct RequestCorrelator {
    link: Arc<ConnectionLink>,
    pending: Arc<DashMap<u64, PendingRequest>>,
    registry: Arc<SubscriptionRegistry>,
    next_id: AtomicU64,
    in_flight: Arc<Semaphore>,
    request_timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(link: Arc<ConnectionLink>, config: &SessionConfig) -> Self {
        Self {
            link,
            pending: Arc::new(DashMap::new()),
            registry: Arc::new(SubscriptionRegistry::new()),
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Send `request` and wait for its response
    pub async fn request(&self, request: Request) -> Result<Response> {
        self.issue(request).await?.wait().await
    }

    /// Send `request` and return a handle to its pending response.
    ///
    /// Fails with `NotReady` without sending when the connection state
    /// does not allow this kind of request.
    pub async fn issue(&self, request: Request) -> Result<ResponseHandle> {
        self.issue_with_timeout(request, self.request_timeout).await
    }

    pub async fn issue_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<ResponseHandle> {
        self.issue_tagged(request, timeout, None).await
    }

    async fn issue_tagged(
        &self,
        request: Request,
        timeout: Duration,
        subscription: Option<(SubscriptionKey, u64)>,
    ) -> Result<ResponseHandle> {
        let kind = request.kind();
        self.ensure_permitted(kind)?;

        let permit = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .map_err(|_| DerivError::Cancelled)?;
        // State may have moved while waiting for a slot
        self.ensure_permitted(kind)?;

        let req_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = request.encode(req_id)?;
        let created_at = Instant::now();
        let deadline = created_at + timeout;
        let (completion, receiver) = oneshot::channel();

        self.pending.insert(
            req_id,
            PendingRequest {
                kind,
                created_at,
                deadline,
                completion,
                subscription,
            },
        );

        let handle = ResponseHandle {
            req_id,
            kind,
            deadline,
            timeout,
            receiver,
            pending: Arc::clone(&self.pending),
            _permit: permit,
        };

        debug!(req_id, kind = %kind, "Sending request");
        // On failure the handle drops here and removes the entry
        self.link.send(frame).await?;
        Ok(handle)
    }

    fn ensure_permitted(&self, kind: RequestKind) -> Result<()> {
        let state = self.link.state();
        if kind.permitted_in(state) {
            Ok(())
        } else {
            debug!(kind = %kind, state = %state, "Request refused before send");
            Err(DerivError::NotReady { state })
        }
    }

    /// Route one inbound text frame
    pub fn dispatch(&self, text: &str) {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, frame = preview(text), "Dropping unparseable frame");
                return;
            }
        };

        if let Some(req_id) = frame.req_id {
            if let Some((_, pending)) = self.pending.remove(&req_id) {
                self.complete(req_id, pending, frame);
                return;
            }
        }

        if self.registry.route(&frame) {
            return;
        }

        match frame.msg_type.as_deref() {
            Some("ping") => debug!(req_id = ?frame.req_id, "Late heartbeat reply"),
            msg_type => warn!(
                req_id = ?frame.req_id,
                msg_type = ?msg_type,
                "Dropping unmatched frame"
            ),
        }
    }

    fn complete(&self, req_id: u64, pending: PendingRequest, frame: InboundFrame) {
        let elapsed = pending.created_at.elapsed();
        let result = match frame.error {
            Some(error) => {
                debug!(req_id, code = %error.code, "Server rejected request");
                Err(DerivError::server(error.code, error.message))
            }
            None => Response {
                req_id,
                msg_type: frame.msg_type.unwrap_or_default(),
                body: frame.body,
            }
            .expect_kind(pending.kind),
        };
        // Bound here so the first value precedes any push routed after it
        let result = match (result, pending.subscription) {
            (Ok(response), Some((key, epoch))) => self.confirm_subscription(response, &key, epoch),
            (result, _) => result,
        };

        if pending.kind == RequestKind::Ping {
            debug!(req_id, ?elapsed, "Heartbeat acknowledged");
        } else {
            debug!(req_id, kind = %pending.kind, ?elapsed, "Response matched");
        }

        if Instant::now() > pending.deadline {
            debug!(req_id, "Response arrived after deadline");
        }
        // Receiver gone means the caller cancelled
        let _ = pending.completion.send(result);
    }

    fn confirm_subscription(
        &self,
        response: Response,
        key: &SubscriptionKey,
        epoch: u64,
    ) -> Result<Response> {
        let stream_id = response.subscription_id().map(str::to_string);
        if self
            .registry
            .confirm(key, epoch, stream_id.as_deref(), response.body.clone())
        {
            return Ok(response);
        }

        info!(key = %key, "Subscription dropped before the server confirmed it");
        if let Some(stream_id) = stream_id {
            self.forget_orphan(stream_id);
        }
        Err(DerivError::Cancelled)
    }

    /// Stop a server stream nobody is watching any more.
    ///
    /// Runs from the dispatch path, so the send happens on its own task.
    fn forget_orphan(&self, stream_id: String) {
        let req_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = match Request::forget(&stream_id).encode(req_id) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(stream = %stream_id, error = %e, "Could not encode forget");
                return;
            }
        };
        let created_at = Instant::now();
        let deadline = created_at + self.request_timeout;
        let (completion, receiver) = oneshot::channel();
        self.pending.insert(
            req_id,
            PendingRequest {
                kind: RequestKind::Forget,
                created_at,
                deadline,
                completion,
                subscription: None,
            },
        );

        let link = Arc::clone(&self.link);
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            if let Err(e) = link.send(frame).await {
                pending.remove(&req_id);
                warn!(stream = %stream_id, error = %e, "Could not send forget");
                return;
            }
            match timeout_at(deadline, receiver).await {
                Ok(Ok(Ok(_))) => debug!(stream = %stream_id, "Orphaned stream forgotten"),
                _ => {
                    pending.remove(&req_id);
                    debug!(stream = %stream_id, "Forget for orphaned stream not confirmed");
                }
            }
        });
    }

    /// Fail every pending request with `ConnectionLost`
    pub fn fail_pending(&self) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.completion.send(Err(DerivError::ConnectionLost));
                failed += 1;
            }
        }
        if failed > 0 {
            info!(count = failed, "Failed pending requests after disconnect");
        }
        failed
    }

    /// Watch `key`, sending `request` only if nobody subscribed yet.
    ///
    /// The subscribe response is bound and delivered by the dispatch
    /// path. If `key` is unsubscribed before the response arrives, this
    /// fails with `Cancelled` and the server stream is forgotten.
    pub async fn subscribe(
        &self,
        key: SubscriptionKey,
        request: Request,
    ) -> Result<SubscriptionHandle> {
        self.ensure_permitted(request.kind())?;

        let (handle, created) = self.registry.attach(&key);
        if !created {
            debug!(key = %key, "Reusing existing subscription");
            return Ok(handle);
        }

        let epoch = handle.epoch();
        let tag = Some((key.clone(), epoch));
        let result = match self.issue_tagged(request, self.request_timeout, tag).await {
            Ok(pending) => pending.wait().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(_) => {
                info!(key = %key, "Subscribed");
                Ok(handle)
            }
            Err(e) => {
                self.registry.remove_epoch(&key, epoch, "subscribe failed");
                Err(e)
            }
        }
    }

    /// Drop `key` locally and ask the server to stop streaming.
    ///
    /// Local state is gone when this returns; the server's confirmation
    /// is only logged. A subscribe still in flight is forgotten once its
    /// response arrives. Returns false when `key` was not subscribed.
    pub async fn unsubscribe(&self, key: &SubscriptionKey) -> Result<bool> {
        let Some(stream_id) = self.registry.remove(key, "unsubscribed") else {
            return Ok(false);
        };

        if let Some(stream_id) = stream_id {
            self.send_and_log(Request::forget(&stream_id), key.to_string())
                .await;
        }
        Ok(true)
    }

    /// Drop every subscription of `channel` with one `forget_all`
    pub async fn unsubscribe_channel(&self, channel: &str) -> Result<Vec<SubscriptionKey>> {
        let removed = self.registry.remove_channel(channel, "unsubscribed");
        self.send_and_log(Request::forget_all(channel), channel.to_string())
            .await;
        Ok(removed)
    }

    async fn send_and_log(&self, request: Request, target: String) {
        match self.issue(request).await {
            Ok(handle) => {
                tokio::spawn(async move {
                    match handle.wait().await {
                        Ok(_) => debug!(stream = %target, "Server confirmed unsubscribe"),
                        Err(e) => debug!(stream = %target, error = %e, "Unsubscribe not confirmed"),
                    }
                });
            }
            Err(e) => warn!(stream = %target, error = %e, "Could not send unsubscribe"),
        }
    }
}
