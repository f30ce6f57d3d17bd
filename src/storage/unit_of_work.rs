//! Units of work spanning several storage calls.

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Writes a store holds back for an open unit of work.
#[async_trait]
pub trait StagedWrites: Send + Sync + 'static {
    async fn commit(&self) -> anyhow::Result<()>;
    async fn rollback(&self) -> anyhow::Result<()>;
    fn as_any(&self) -> &dyn Any;
}

tokio::task_local! {
    static CURRENT_UNIT: Arc<dyn StagedWrites>;
}

/// An open unit of work of one store.
///
/// Storage calls made by the work passed to [`UnitOfWork::run`] join it.
/// The writes commit together when the work returns `Ok` and are rolled
/// back when it returns an error.
pub struct UnitOfWork {
    staged: Arc<dyn StagedWrites>,
}

impl UnitOfWork {
    pub fn new(staged: Arc<dyn StagedWrites>) -> Self {
        UnitOfWork { staged }
    }

    pub async fn run<F, T, E>(self, work: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: From<anyhow::Error> + fmt::Display,
    {
        match CURRENT_UNIT.scope(self.staged.clone(), work).await {
            Ok(value) => {
                self.staged.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.staged.rollback().await {
                    warn!(error = %e, rollback_error = %rollback, "Could not roll back unit of work");
                }
                Err(e)
            }
        }
    }

    /// Apply `f` to the staged writes of the unit of work running on this
    /// task, if there is one and it is of type `S`.
    pub(crate) fn with_current<S, R>(f: impl FnOnce(&S) -> R) -> Option<R>
    where
        S: StagedWrites,
    {
        CURRENT_UNIT
            .try_with(|staged| staged.as_any().downcast_ref::<S>().map(f))
            .ok()
            .flatten()
    }
}
