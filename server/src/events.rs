//! Server-Sent Event streams of root changes.
//!
//! A stream owns one [`Subscriber`] and a drop guard recording which
//! registry entries that subscriber joined. Dropping the stream (client
//! disconnect) or firing its cancellation token ends it, and the guard
//! detaches the subscriber from every entry exactly once.
//!
//! Wire format:
//!
//! ```text
//! : connected
//!
//! event: changed
//! data: {"kind":"changed","rootId":"…","prdId":"alpha","at":"…"}
//!
//! : keepalive
//! ```

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::ChangeEvent;
use crate::watch::{RegistryError, Subscriber, SubscriberId, WatchRegistry};

/// Interval between keepalive comments on idle streams.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// SSE event name for change notifications.
pub const CHANGED_EVENT: &str = "changed";

#[derive(Default)]
struct FeedState {
    closed: bool,
    attached: Vec<String>,
    attach_task: Option<AbortHandle>,
}

/// Shared view of a stream's attachments.
#[derive(Clone)]
struct Feed {
    registry: WatchRegistry,
    subscriber_id: SubscriberId,
    state: Arc<Mutex<FeedState>>,
}

impl Feed {
    fn new(registry: WatchRegistry, subscriber_id: SubscriberId) -> Self {
        Self {
            registry,
            subscriber_id,
            state: Arc::new(Mutex::new(FeedState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a completed attach. If the feed already closed, the
    /// attachment is undone instead and `false` is returned.
    fn record_attached(&self, root_id: &str) -> bool {
        {
            let mut state = self.lock();
            if !state.closed {
                state.attached.push(root_id.to_string());
                return true;
            }
        }
        self.registry.detach(root_id, self.subscriber_id);
        false
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn set_attach_task(&self, task: AbortHandle) {
        let mut state = self.lock();
        if state.closed {
            task.abort();
        } else {
            state.attach_task = Some(task);
        }
    }

    fn close(&self) {
        let (attached, attach_task) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.attached),
                state.attach_task.take(),
            )
        };
        if let Some(task) = attach_task {
            task.abort();
        }
        for root_id in &attached {
            self.registry.detach(root_id, self.subscriber_id);
        }
        debug!(
            subscriber_id = self.subscriber_id,
            detached = attached.len(),
            "Change stream closed"
        );
    }
}

/// Detaches the stream's subscriber when dropped.
struct FeedGuard {
    feed: Feed,
}

impl Drop for FeedGuard {
    fn drop(&mut self) {
        self.feed.close();
    }
}

/// Opens a change stream for one root.
///
/// The subscriber is attached before this returns, so an unknown root is
/// reported as an error rather than as an empty stream.
///
/// # Errors
///
/// Propagates [`RegistryError`] from the attach.
pub async fn stream_root(
    registry: &WatchRegistry,
    root_id: &str,
    cancel: CancellationToken,
) -> Result<impl Stream<Item = Result<Event, Infallible>> + Send + 'static, RegistryError> {
    let (subscriber, receiver) = Subscriber::channel();
    registry.attach(root_id, &subscriber).await?;

    let feed = Feed::new(registry.clone(), subscriber.id());
    feed.record_attached(root_id);
    debug!(root_id, subscriber_id = subscriber.id(), "Root change stream opened");
    Ok(change_stream(receiver, FeedGuard { feed }, cancel))
}

/// Opens a change stream covering every configured root.
///
/// Roots are discovered and attached in the background after the stream
/// starts; roots that fail to attach are skipped.
pub fn stream_all(
    registry: &WatchRegistry,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (subscriber, receiver) = Subscriber::channel();
    let feed = Feed::new(registry.clone(), subscriber.id());

    let task = tokio::spawn(attach_all(feed.clone(), subscriber));
    feed.set_attach_task(task.abort_handle());
    debug!(subscriber_id = feed.subscriber_id, "Global change stream opened");

    change_stream(receiver, FeedGuard { feed }, cancel)
}

async fn attach_all(feed: Feed, subscriber: Subscriber) {
    let config = feed.registry.config().clone();
    let root_ids = match tokio::task::spawn_blocking(move || config.root_ids()).await {
        Ok(Ok(ids)) => ids,
        Ok(Err(err)) => {
            warn!(error = %err, "Failed to load roots for global stream");
            return;
        }
        Err(err) => {
            warn!(error = %err, "Root discovery task failed");
            return;
        }
    };

    for root_id in root_ids {
        if feed.is_closed() {
            return;
        }
        if let Err(err) = feed.registry.attach(&root_id, &subscriber).await {
            warn!(root_id = %root_id, error = %err, "Skipping root for global stream");
            continue;
        }
        if !feed.record_attached(&root_id) {
            return;
        }
    }
}

fn change_stream(
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    guard: FeedGuard,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().comment("connected")) });
    let changes = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        let event = receiver.recv().await?;
        Some((Ok::<_, Infallible>(to_sse_event(&event)), (receiver, guard)))
    });

    connected
        .chain(changes)
        .take_until(cancel.cancelled_owned())
}

fn to_sse_event(event: &ChangeEvent) -> Event {
    Event::default()
        .event(CHANGED_EVENT)
        .json_data(event)
        .unwrap_or_else(|err| {
            warn!(error = %err, "Failed to serialize change event");
            Event::default().comment("serialization-error")
        })
}

/// Wraps a change stream into an SSE response with keepalives and
/// proxy-buffering disabled.
pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .text("keepalive"),
    );
    (
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        sse,
    )
        .into_response()
}
