use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use keel_core::{Object, Spec};
use keel_kv::{EventKind, KvError, KvEvent, KvWatch};
use keel_registry::ResourceDescriptor;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{decode, decode_at};
use crate::error::StoreError;
use crate::store::{matches_options, ListOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(bound = "", rename_all = "camelCase")]
pub struct WatchEvent<S: Spec> {
    #[serde(rename = "type")]
    pub type_: EventType,
    pub object: Object<S>,
    pub resource_version: String,
}

impl<S: Spec> WatchEvent<S> {
    fn new(type_: EventType, object: Object<S>) -> Self {
        let resource_version = object.metadata.resource_version.clone();
        Self { type_, object, resource_version }
    }
}

struct State<S: Spec> {
    feed: KvWatch,
    descriptor: ResourceDescriptor<S>,
    opts: ListOptions,
    cancel: CancellationToken,
    done: bool,
}

/// Ordered change events for one scope and selector.
///
/// Ends when the request is canceled. A backend that can no longer keep up
/// ends the stream with an error for which
/// [`StoreError::is_resync_required`] holds.
pub struct WatchStream<S: Spec> {
    inner: BoxStream<'static, Result<WatchEvent<S>, StoreError>>,
}

impl<S: Spec> WatchStream<S> {
    pub(crate) fn new(
        feed: KvWatch,
        descriptor: ResourceDescriptor<S>,
        opts: ListOptions,
        cancel: CancellationToken,
    ) -> Self {
        let state = State { feed, descriptor, opts, cancel, done: false };
        let inner = stream::unfold(state, |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                let next = tokio::select! {
                    biased;
                    _ = st.cancel.cancelled() => {
                        debug!(kind = %S::KIND, "watch canceled");
                        return None;
                    }
                    next = st.feed.next() => next,
                };
                match next {
                    None => return None,
                    Some(Err(e)) => {
                        st.done = true;
                        if matches!(e, KvError::Overflowed | KvError::Compacted { .. }) {
                            counter!("watch_resync_total", 1u64, "kind" => S::KIND.as_str());
                            warn!(kind = %S::KIND, error = %e, "watch terminated; resync required");
                        }
                        return Some((Err(StoreError::from(e)), st));
                    }
                    Some(Ok(ev)) => match translate(&st.descriptor, &st.opts, &ev) {
                        Ok(Some(out)) => {
                            counter!("watch_events_total", 1u64, "kind" => S::KIND.as_str(), "type" => out.type_.as_str());
                            return Some((Ok(out), st));
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(kind = %S::KIND, key = %ev.kv.key, error = %e, "skipping undecodable event");
                            continue;
                        }
                    },
                }
            }
        });
        Self { inner: inner.boxed() }
    }
}

impl<S: Spec> Stream for WatchStream<S> {
    type Item = Result<WatchEvent<S>, StoreError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Maps a raw change onto what a subscriber of this selector should see.
/// Objects moving into the selector appear as added, objects moving out as
/// deleted.
fn translate<S: Spec>(
    d: &ResourceDescriptor<S>,
    opts: &ListOptions,
    ev: &KvEvent,
) -> Result<Option<WatchEvent<S>>, StoreError> {
    match ev.kind {
        EventKind::Delete => {
            let last = decode_at::<S>(&ev.kv.value, &ev.kv.key, ev.revision())?;
            Ok(matches_options(d, &last, opts).then(|| WatchEvent::new(EventType::Deleted, last)))
        }
        EventKind::Put => {
            let cur = decode::<S>(&ev.kv)?;
            let now = matches_options(d, &cur, opts);
            let before = match &ev.prev {
                Some(prev) => Some(matches_options(d, &decode::<S>(prev)?, opts)),
                None => None,
            };
            let type_ = match (before, now) {
                (None | Some(false), true) => EventType::Added,
                (Some(true), true) => EventType::Modified,
                (Some(true), false) => EventType::Deleted,
                (None | Some(false), false) => return Ok(None),
            };
            Ok(Some(WatchEvent::new(type_, cur)))
        }
    }
}


impl<S: Spec> fmt::Debug for WatchStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream").field("kind", &S::KIND).finish_non_exhaustive()
    }
}
