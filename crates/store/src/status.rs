use std::time::Instant;

use keel_core::{Object, Spec};

use crate::context::RequestContext;
use crate::error::StoreError;
use crate::store::{GenericStore, UpdatePath};

/// Status-only view over a [`GenericStore`]: same keys, same concurrency
/// contract, but spec changes made by the mutator are discarded.
#[derive(Debug, Clone)]
pub struct StatusStore<S: Spec> {
    inner: GenericStore<S>,
}

impl<S: Spec> StatusStore<S> {
    pub(crate) fn new(inner: GenericStore<S>) -> Self {
        Self { inner }
    }

    pub async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Object<S>, StoreError> {
        self.inner.get(ctx, name).await
    }

    pub async fn update<F>(
        &self,
        ctx: &RequestContext,
        name: &str,
        precondition: Option<&str>,
        mutate: F,
    ) -> Result<Object<S>, StoreError>
    where
        F: FnOnce(&mut Object<S>),
    {
        let started = Instant::now();
        let res = self.inner.update_inner(ctx, name, precondition, UpdatePath::Status, mutate).await;
        crate::store::observe("update_status", started, &res);
        res
    }
}
