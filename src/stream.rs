//! Streaming progress API: emit a [`ProgressView`] whenever a job changes.
//!
//! Polling [`crate::orchestrator::Orchestrator::progress`] works, but a
//! caller driving a progress bar wants to be woken instead. The stream
//! returned here yields the current view immediately, then one view per
//! registry update, and ends right after the first terminal view
//! (Succeeded, Failed or Cancelled).
//!
//! Updates that land while the consumer is busy are coalesced: a slow
//! reader always sees the latest state, never a backlog.

use crate::job::Job;
use crate::status::{self, ProgressView, StageWeights};
use futures::future;
use futures::stream::StreamExt;
use std::pin::Pin;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

/// A boxed stream of progress views.
pub type ProgressStream = Pin<Box<dyn Stream<Item = ProgressView> + Send>>;

/// Progress views for the job behind `rx`, with the default stage weights.
pub fn watch_progress(rx: watch::Receiver<Job>) -> ProgressStream {
    watch_progress_with(rx, StageWeights::default())
}

pub fn watch_progress_with(rx: watch::Receiver<Job>, weights: StageWeights) -> ProgressStream {
    let views = WatchStream::new(rx)
        .map(move |job| status::render_with(&job, &weights))
        .scan(false, |finished, view| {
            if *finished {
                return future::ready(None);
            }
            *finished = view.status.is_terminal();
            future::ready(Some(view))
        });
    Box::pin(views)
}
