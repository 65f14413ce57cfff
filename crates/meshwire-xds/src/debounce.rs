//! Debouncing of config change events
//!
//! Bursts of changes are merged into one push. A merged push fires once no
//! new event has arrived for `after`, or once `max` has passed since the
//! first event of the burst.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::model::PushRequest;

#[derive(Debug, Clone, Copy)]
pub struct DebounceOptions {
    pub enabled: bool,
    pub after: Duration,
    pub max: Duration,
    /// Debounce endpoint-only changes too
    pub eds: bool,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            after: Duration::from_millis(100),
            max: Duration::from_secs(10),
            eds: true,
        }
    }
}

struct Burst {
    request: PushRequest,
    started: Instant,
    last_event: Instant,
    events: usize,
}

/// Run until `updates` closes or `stop` flips to true, handing merged
/// requests to `push`.
pub async fn debounce(
    mut updates: mpsc::UnboundedReceiver<PushRequest>,
    mut stop: watch::Receiver<bool>,
    options: DebounceOptions,
    mut push: impl FnMut(PushRequest),
) {
    let mut burst: Option<Burst> = None;

    loop {
        let deadline = burst.as_ref().map(|b| {
            (b.last_event + options.after).min(b.started + options.max)
        });
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            update = updates.recv() => {
                let Some(request) = update else { break };
                if !options.enabled || (!options.eds && !request.full) {
                    push(request);
                    continue;
                }
                let now = Instant::now();
                burst = Some(match burst.take() {
                    Some(b) => Burst {
                        request: b.request.merge(request),
                        started: b.started,
                        last_event: now,
                        events: b.events + 1,
                    },
                    None => Burst {
                        request,
                        started: now,
                        last_event: now,
                        events: 1,
                    },
                });
            }
            _ = timer => {
                if let Some(b) = burst.take() {
                    debug!(
                        events = b.events,
                        full = b.request.full,
                        waited_ms = b.started.elapsed().as_millis() as u64,
                        "Push debounce stable"
                    );
                    push(b.request);
                }
            }
        }
    }

    // flush whatever was waiting so a shutdown never loses the last change
    if let Some(b) = burst {
        push(b.request);
    }
}
