//! Background task driving one decode attempt.
//!
//! The task is spawned as soon as an opener decides a decode is needed and
//! owns the entry's decoding flag from then on; waiting for a worker slot is
//! part of the task, so an opener that gives up never strands the entry.

use mediacache_index::Status;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::Cache;
use crate::entry::{CacheEntry, Close};
use crate::transcoder::{Step, TranscodeError, Transcoder};

/// Signal sent to whoever started the worker, at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ready {
    /// Running, and no pre-buffering was requested.
    Started,
    /// The pre-buffer threshold was reached.
    Prebuffered,
    /// Output was completed before the threshold was reached.
    Finished,
    /// The attempt failed before the opener was released.
    Failed { errno: i32, code: i32 },
}

/// How a decode attempt ended.
#[derive(Debug)]
enum Outcome {
    Finished,
    Failed(TranscodeError),
    /// Nobody accessed the entry for too long.
    TimedOut,
    /// Shutdown or eviction.
    Cancelled,
    /// Shut down while waiting for a worker slot.
    Refused,
}

enum Resume {
    Continue,
    TimedOut,
    Cancelled,
}

pub(crate) struct Worker {
    cache: Arc<Cache>,
    entry: Arc<CacheEntry>,
    token: CancellationToken,
    ready: Option<oneshot::Sender<Ready>>,
}

impl Worker {
    /// The caller must already have retained a reference on `entry` for the
    /// worker; it is released when the worker finishes.
    pub(crate) fn new(
        cache: Arc<Cache>,
        entry: Arc<CacheEntry>,
        token: CancellationToken,
        ready: oneshot::Sender<Ready>,
    ) -> Self {
        Self { cache, entry, token, ready: Some(ready) }
    }

    #[instrument(name = "worker", skip(self), fields(key = %self.entry.key()))]
    pub(crate) async fn run(mut self) {
        let admission = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            admission = self.cache.gate().admit() => admission.ok(),
        };
        let Some(_admission) = admission else {
            self.conclude(Outcome::Refused).await;
            return;
        };
        debug!(active = self.cache.gate().active(), "worker admitted");
        let mut transcoder = self.cache.factory().create(self.entry.key(), &self.cache.settings().params);
        let outcome = self.transcode(transcoder.as_mut()).await;
        drop(transcoder);
        self.conclude(outcome).await;
    }

    fn signal(&mut self, ready: Ready) {
        if let Some(sender) = self.ready.take() {
            debug!(?ready, "releasing opener");
            // The opener may have given up waiting already.
            _ = sender.send(ready);
        }
    }

    async fn transcode(&mut self, transcoder: &mut dyn Transcoder) -> Outcome {
        let settings = self.cache.settings().clone();
        let key = self.entry.key().clone();
        info!(desttype = %key.desttype, "transcoding started");

        if let Err(err) = transcoder.open_input(&key.path).await {
            return Outcome::Failed(err);
        }
        let predicted = transcoder.predicted_size();
        let format = transcoder.format_info();
        self.entry.update_meta(|meta| {
            if meta.predicted_size == 0 {
                meta.predicted_size = predicted;
            }
            if meta.frame_count == 0 {
                meta.frame_count = format.frame_count;
            }
            meta.segment_count = format.segment_count;
            meta.duration = format.duration;
        });

        // Make room before the buffer starts growing.
        if let Err(err) = self.cache.maintenance_excluding(predicted, Some(&key)).await {
            return Outcome::Failed(TranscodeError::new(err.errno(), 0, err.to_string()));
        }
        if let Err(err) = transcoder.open_output(self.entry.buffer()).await {
            return Outcome::Failed(err);
        }

        let prebuffer = settings.prebuffer_size;
        if prebuffer == 0 {
            self.signal(Ready::Started);
        } else {
            debug!(bytes = prebuffer, "pre-buffering");
        }

        loop {
            if self.token.is_cancelled() {
                return Outcome::Cancelled;
            }
            if self.entry.inactive_for(settings.max_inactive_abort) {
                return Outcome::TimedOut;
            }
            if self.entry.refs() > 1 {
                self.entry.update_access();
            }

            match transcoder.step(self.entry.buffer()).await {
                Ok(Step::Continue) => {},
                Ok(Step::Finished) => {
                    if let Err(err) = transcoder.finish(self.entry.buffer()).await {
                        return Outcome::Failed(err);
                    }
                    return Outcome::Finished;
                },
                Err(err) => return Outcome::Failed(err),
            }
            self.entry.publish();

            if self.ready.is_some() && self.entry.buffer().watermark() > prebuffer {
                debug!("pre-buffer limit reached");
                self.signal(Ready::Prebuffered);
            }

            if self.entry.inactive_for(settings.max_inactive_suspend) {
                info!(after = ?settings.max_inactive_suspend, "transcoding suspended");
                match self.suspend().await {
                    Resume::Continue => info!("transcoding resumed"),
                    Resume::TimedOut => return Outcome::TimedOut,
                    Resume::Cancelled => return Outcome::Cancelled,
                }
            }
        }
    }

    /// Park until somebody accesses the entry again, the abort deadline
    /// passes, or the worker is cancelled.
    async fn suspend(&self) -> Resume {
        let settings = self.cache.settings();
        loop {
            if !self.entry.inactive_for(settings.max_inactive_suspend) {
                return Resume::Continue;
            }
            if self.entry.inactive_for(settings.max_inactive_abort) {
                return Resume::TimedOut;
            }
            let deadline = self.entry.last_access() + settings.max_inactive_abort;
            tokio::select! {
                _ = self.token.cancelled() => return Resume::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {},
                _ = self.entry.accessed() => {},
            }
        }
    }

    async fn conclude(mut self, outcome: Outcome) {
        let entry = Arc::clone(&self.entry);
        let guard = entry.lock().await;
        if entry.is_evicted() {
            debug!("entry was evicted while transcoding");
            drop(guard);
            self.signal(Ready::Failed { errno: libc::EIO, code: 0 });
            return;
        }

        let (status, errno, code, flags) = match &outcome {
            Outcome::Finished => (Status::Success, 0, 0, Close::Keep),
            Outcome::Failed(err) => (Status::Error, if err.errno == 0 { libc::EIO } else { err.errno }, err.code, Close::Keep),
            Outcome::TimedOut => (Status::Incomplete, libc::EIO, 0, Close::Delete),
            Outcome::Cancelled => (Status::Incomplete, libc::EIO, 0, Close::Keep),
            Outcome::Refused => (Status::Incomplete, libc::EBUSY, 0, Close::Keep),
        };
        entry.conclude(status, errno, code);
        match &outcome {
            Outcome::Finished => info!(size = entry.size(), "transcoding completed successfully"),
            Outcome::Failed(err) => error!(errno, code, error = %err, "transcoding failed"),
            Outcome::TimedOut => {
                warn!(after = ?self.cache.settings().max_inactive_abort, "transcoding aborted after inactivity")
            },
            Outcome::Cancelled => info!("transcoding aborted by shutdown"),
            Outcome::Refused => info!("shut down before a worker slot was free"),
        }
        if let Err(err) = self.cache.close_locked(&entry, flags).await {
            warn!(error = ?err, "could not close entry after transcoding");
        }
        drop(guard);

        self.signal(match outcome {
            Outcome::Finished => Ready::Finished,
            _ => Ready::Failed { errno, code },
        });
    }
}
