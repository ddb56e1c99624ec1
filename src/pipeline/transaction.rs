//! Request-scoped database transaction.

use super::error_handler::replace_with_error;
use super::interceptor::{Interceptor, Next};
use super::{RequestContext, RouteRequest, RouteResponse};
use crate::error::{AppError, ResolutionError};
use crate::inject::{Container, Injectable};
use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Shared handle to the request's open transaction.
#[derive(Clone)]
pub struct TransactionScope(Arc<Mutex<Option<Transaction<'static, Postgres>>>>);

impl TransactionScope {
    fn new(tx: Transaction<'static, Postgres>) -> Self {
        TransactionScope(Arc::new(Mutex::new(Some(tx))))
    }

    pub async fn lock(&self) -> TransactionGuard<'_> {
        TransactionGuard(self.0.lock().await)
    }

    async fn take(&self) -> Option<Transaction<'static, Postgres>> {
        self.0.lock().await.take()
    }
}

pub struct TransactionGuard<'a>(MutexGuard<'a, Option<Transaction<'static, Postgres>>>);

impl TransactionGuard<'_> {
    pub fn conn(&mut self) -> Result<&mut PgConnection, AppError> {
        self.0
            .as_mut()
            .map(|tx| &mut **tx)
            .ok_or_else(|| AppError::Handler("transaction already finished".into()))
    }
}

impl RequestContext {
    /// The transaction opened by [`TransactionInterceptor`], if one wraps this route.
    pub fn transaction(&self) -> Option<TransactionScope> {
        self.extensions().get::<TransactionScope>().cloned()
    }
}

/// Replace the route's response with the commit error; the route's writes are lost.
pub(crate) fn commit_failed(res: &mut RouteResponse, error: sqlx::Error) -> AppError {
    let error = AppError::from(error);
    replace_with_error(res, &error);
    error
}

/// Opens a transaction per request, commits when the inner chain succeeds and rolls back
/// when it fails. The inner error is always passed on, and a failed commit replaces
/// the route's response with the database error.
pub struct TransactionInterceptor {
    pool: PgPool,
}

impl TransactionInterceptor {
    pub fn new(pool: PgPool) -> Self {
        TransactionInterceptor { pool }
    }
}

impl Injectable for TransactionInterceptor {
    fn inject(container: &Container) -> Result<Self, ResolutionError> {
        Ok(TransactionInterceptor::new((*container.get::<PgPool>()?).clone()))
    }
}

#[async_trait]
impl Interceptor for TransactionInterceptor {
    async fn intercept(&self, req: &mut RouteRequest, res: &mut RouteResponse, next: Next<'_>) -> Result<(), AppError> {
        let scope = TransactionScope::new(self.pool.begin().await?);
        req.context_mut().extensions_mut().insert(scope.clone());

        let result = next.run(req, res).await;
        req.context_mut().extensions_mut().remove::<TransactionScope>();

        let Some(tx) = scope.take().await else {
            return result;
        };
        match result {
            Ok(()) => match tx.commit().await {
                Ok(()) => {
                    tracing::debug!(request = req.context().request_index(), "transaction committed");
                    Ok(())
                }
                Err(e) => {
                    tracing::warn!(request = req.context().request_index(), error = %e, "commit failed");
                    Err(commit_failed(res, e))
                }
            },
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                tracing::debug!(request = req.context().request_index(), "transaction rolled back");
                Err(e)
            }
        }
    }
}
