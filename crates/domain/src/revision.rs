//! Named revisions: a unit of work bracketed by storage-side bookkeeping.
//!
//! [`Revisions::change`] opens the ambient transaction, records a named
//! revision, runs the work, and then either completes the revision and
//! commits, or deletes the revision and rolls back. The work's own error is
//! returned unchanged unless undoing it fails too.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use row_store::{RevisionId, RevisionRepository, UnitOfWork};

use crate::{Error, Result};

/// Runs units of work inside named revisions.
///
/// One revision may be active per `Revisions` at a time; starting another
/// while one runs fails with [`Error::NestedRevision`].
#[derive(Clone)]
pub struct Revisions {
    revisions: Arc<dyn RevisionRepository>,
    transactions: Arc<dyn UnitOfWork>,
    active: Arc<Mutex<Option<String>>>,
}

/// Marks a revision active for as long as it lives.
struct ActiveRevision {
    active: Arc<Mutex<Option<String>>>,
}

impl ActiveRevision {
    fn enter(active: &Arc<Mutex<Option<String>>>, name: &str) -> Result<Self> {
        let mut slot = active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(outer) = slot.as_ref() {
            return Err(Error::NestedRevision {
                name: name.to_owned(),
                active: outer.clone(),
            });
        }
        *slot = Some(name.to_owned());
        Ok(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ActiveRevision {
    fn drop(&mut self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Revisions {
    pub fn new(revisions: Arc<dyn RevisionRepository>, transactions: Arc<dyn UnitOfWork>) -> Self {
        Self {
            revisions,
            transactions,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Name of the revision currently running, if any.
    pub fn active(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `work` inside a revision called `name`.
    #[tracing::instrument(skip(self, work))]
    pub async fn change<T, W>(&self, name: &str, work: W) -> Result<T>
    where
        W: Future<Output = Result<T>> + Send,
    {
        let _active = ActiveRevision::enter(&self.active, name)?;
        let started = Instant::now();

        self.transactions.begin().await?;
        let revision = match self.revisions.begin_revision(name).await {
            Ok(revision) => revision,
            Err(e) => {
                let original = Error::from(e);
                return Err(match self.transactions.rollback().await {
                    Ok(()) => original,
                    Err(rollback) => rollback_failed(name, original, rollback.into()),
                });
            }
        };
        tracing::debug!(%revision, "revision started");

        let outcome = match work.await {
            Ok(value) => self.finish(revision).await.map(|()| value),
            Err(original) => Err(original),
        };

        match outcome {
            Ok(value) => {
                let duration = started.elapsed().as_secs_f64();
                metrics::histogram!("revision_duration_seconds").record(duration);
                metrics::counter!("revisions_completed_total").increment(1);
                tracing::info!(%revision, duration, "revision completed");
                Ok(value)
            }
            Err(original) => {
                metrics::histogram!("revision_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                Err(self.abandon(name, revision, original).await)
            }
        }
    }

    async fn finish(&self, revision: RevisionId) -> Result<()> {
        self.revisions.complete_revision().await?;
        self.transactions.commit().await?;
        tracing::debug!(%revision, "revision committed");
        Ok(())
    }

    /// Undoes a failed revision and returns the error to report.
    async fn abandon(&self, name: &str, revision: RevisionId, original: Error) -> Error {
        metrics::counter!("revisions_rolled_back_total").increment(1);
        tracing::warn!(%revision, error = %original, "revision failed, rolling back");

        let undone = match self.revisions.delete_revision(revision).await {
            Ok(()) => self.transactions.rollback().await,
            Err(e) => {
                // the transaction must still be closed
                if let Err(rollback) = self.transactions.rollback().await {
                    tracing::error!(%revision, error = %rollback, "transaction rollback failed");
                }
                Err(e)
            }
        };
        match undone {
            Ok(()) => original,
            Err(rollback) => {
                tracing::error!(%revision, error = %rollback, "revision rollback failed");
                rollback_failed(name, original, rollback.into())
            }
        }
    }
}

fn rollback_failed(name: &str, original: Error, rollback: Error) -> Error {
    Error::RollbackFailed {
        name: name.to_owned(),
        original: Box::new(original),
        rollback: Box::new(rollback),
    }
}
