use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use keel_core::{FieldError, FieldErrors, FieldPath, Kind, Object, ObjectList, Spec, StorageConfig, TypeMeta};
use keel_kv::{KeyValue, KvBackend, KvError, Revision, TxnOutcome};
use keel_registry::{KeyError, Registered, Registry, ResourceDescriptor};
use keel_selector::Selector;
use metrics::{counter, histogram};
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::{decode, encode, parse_version};
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::status::StatusStore;
use crate::watch::WatchStream;

const NAME_FIELD: &str = "metadata.name";
const GENERATE_SUFFIX_LEN: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub selector: Selector,
    /// Also return objects that still have initializers pending.
    pub include_uninitialized: bool,
}

impl ListOptions {
    pub fn new(selector: Selector) -> Self {
        Self { selector, include_uninitialized: false }
    }

    pub fn everything() -> Self {
        Self::default()
    }
}

/// Result of a delete request.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome<S: Spec> {
    /// The key was removed; carries the last stored object.
    Deleted(Object<S>),
    /// Finalizers remain; the object now carries a deletion timestamp.
    Pending(Object<S>),
}

impl<S: Spec> DeleteOutcome<S> {
    pub fn status_code(&self) -> u16 {
        match self {
            DeleteOutcome::Deleted(_) => 200,
            DeleteOutcome::Pending(_) => 202,
        }
    }

    pub fn object(&self) -> &Object<S> {
        match self {
            DeleteOutcome::Deleted(o) | DeleteOutcome::Pending(o) => o,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DeleteOutcome::Pending(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdatePath {
    Main,
    Status,
}

/// Storage for one kind over a shared backend.
///
/// The store keeps no state of its own between calls: every write is a
/// conditional backend transaction keyed on the revision just read, so two
/// racing writers resolve to one success and one `Conflict`. Failed writes are
/// never retried.
#[derive(Clone)]
pub struct GenericStore<S: Spec> {
    descriptor: ResourceDescriptor<S>,
    backend: Arc<dyn KvBackend>,
    timeout: Duration,
}

impl<S: Spec> std::fmt::Debug for GenericStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericStore")
            .field("kind", &S::KIND)
            .field("layout", &self.descriptor.layout)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<S: Registered> GenericStore<S> {
    pub fn new(registry: &Registry, backend: Arc<dyn KvBackend>, config: &StorageConfig) -> Self {
        Self::with_descriptor(registry.descriptor::<S>().clone(), backend, config.request_timeout())
    }
}

impl<S: Spec> GenericStore<S> {
    pub fn with_descriptor(descriptor: ResourceDescriptor<S>, backend: Arc<dyn KvBackend>, timeout: Duration) -> Self {
        Self { descriptor, backend, timeout }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor<S> {
        &self.descriptor
    }

    pub fn kind(&self) -> Kind {
        S::KIND
    }

    /// Restricted view that may only change status.
    pub fn status(&self) -> StatusStore<S> {
        StatusStore::new(self.clone())
    }

    pub async fn create(&self, ctx: &RequestContext, mut obj: Object<S>) -> Result<Object<S>, StoreError> {
        let started = Instant::now();
        let res = self.create_inner(ctx, &mut obj).await;
        observe("create", started, &res);
        res
    }

    async fn create_inner(&self, ctx: &RequestContext, obj: &mut Object<S>) -> Result<Object<S>, StoreError> {
        self.fill_namespace(ctx, obj)?;
        if obj.metadata.name.is_empty() && !obj.metadata.generate_name.is_empty() {
            let suffix = Uuid::new_v4().simple().to_string();
            obj.metadata.name = format!("{}{}", obj.metadata.generate_name, &suffix[..GENERATE_SUFFIX_LEN]);
        }
        prepare_for_create(obj);

        let errs = self.descriptor.validate(obj);
        if !errs.is_empty() {
            return Err(StoreError::invalid(S::KIND, obj.name(), errs));
        }
        let key = self.key(obj.namespace(), obj.name())?;
        let value = encode(obj)?;
        match self.call(ctx, "create", self.backend.create(&key, value)).await? {
            TxnOutcome::Committed(kv) => {
                let stored = decode::<S>(&kv)?;
                info!(kind = %S::KIND, %key, rv = kv.mod_revision, "created");
                Ok(stored)
            }
            TxnOutcome::Failed(_) => Err(StoreError::AlreadyExists { kind: S::KIND, name: obj.name().to_string() }),
        }
    }

    pub async fn get(&self, ctx: &RequestContext, name: &str) -> Result<Object<S>, StoreError> {
        let started = Instant::now();
        let res = self.read(ctx, name).await.map(|(obj, _)| obj);
        observe("get", started, &res);
        res
    }

    pub async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> Result<ObjectList<S>, StoreError> {
        let started = Instant::now();
        let res = self.list_inner(ctx, opts).await;
        observe("list", started, &res);
        res
    }

    async fn list_inner(&self, ctx: &RequestContext, opts: &ListOptions) -> Result<ObjectList<S>, StoreError> {
        self.check_fields(&opts.selector)?;
        let scope = self.scope(ctx);

        // A pinned name turns the range read into a single-key read.
        let exact = opts
            .selector
            .requires_exact_field(NAME_FIELD)
            .filter(|_| !self.descriptor.is_namespaced() || !scope.is_empty())
            .and_then(|name| self.descriptor.key_for(scope, name).ok());
        let (kvs, revision) = match exact {
            Some(key) => {
                let (kvs, rev) = self.call(ctx, "list", self.backend.list(&key)).await?;
                (kvs.into_iter().filter(|kv| kv.key == key).collect::<Vec<_>>(), rev)
            }
            None => {
                let prefix = self.descriptor.layout.range_prefix(scope);
                self.call(ctx, "list", self.backend.list(&prefix)).await?
            }
        };

        let mut list = (self.descriptor.new_list)();
        for kv in &kvs {
            let obj = decode::<S>(kv)?;
            if self.visible(&obj, opts) {
                list.items.push(obj);
            }
        }
        list.metadata.resource_version = revision.to_string();
        debug!(kind = %S::KIND, scope, scanned = kvs.len(), matched = list.items.len(), revision, "list");
        Ok(list)
    }

    /// Applies `mutate` to the current object and writes the result back if
    /// the stored revision is still the one read. Status changes made by the
    /// mutator are discarded.
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
        let res = self.update_inner(ctx, name, precondition, UpdatePath::Main, mutate).await;
        observe("update", started, &res);
        res
    }

    pub(crate) async fn update_inner<F>(
        &self,
        ctx: &RequestContext,
        name: &str,
        precondition: Option<&str>,
        path: UpdatePath,
        mutate: F,
    ) -> Result<Object<S>, StoreError>
    where
        F: FnOnce(&mut Object<S>),
    {
        let (current, kv) = self.read(ctx, name).await?;
        self.check_precondition(name, precondition, kv.mod_revision)?;

        let mut next = current.clone();
        mutate(&mut next);
        let errs = match path {
            UpdatePath::Main => {
                next.status = current.status.clone();
                if next.spec != current.spec {
                    next.metadata.generation = current.metadata.generation + 1;
                } else {
                    next.metadata.generation = current.metadata.generation;
                }
                keep_system_fields(&mut next, &current);
                (self.descriptor.validate_update)(&next, &current)
            }
            UpdatePath::Status => {
                next.spec = current.spec.clone();
                next.metadata.generation = current.metadata.generation;
                keep_system_fields(&mut next, &current);
                (self.descriptor.validate_status_update)(&next, &current)
            }
        };
        if !errs.is_empty() {
            return Err(StoreError::invalid(S::KIND, name, errs));
        }

        if next.metadata.is_being_deleted() && next.metadata.finalizers.is_empty() {
            return self.remove(ctx, name, &kv, next).await;
        }

        let value = encode(&mut next)?;
        if value == kv.value {
            debug!(kind = %S::KIND, key = %kv.key, "update is a no-op");
            return Ok(current);
        }
        match self.call(ctx, "update", self.backend.compare_and_swap(&kv.key, kv.mod_revision, value)).await? {
            TxnOutcome::Committed(stored) => {
                debug!(kind = %S::KIND, key = %stored.key, rv = stored.mod_revision, ?path, "updated");
                decode(&stored)
            }
            TxnOutcome::Failed(cur) => Err(self.txn_failure(name, cur, kv.mod_revision)),
        }
    }

    /// Deletes the object, or marks it for deletion while finalizers remain.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        name: &str,
        precondition: Option<&str>,
    ) -> Result<DeleteOutcome<S>, StoreError> {
        let started = Instant::now();
        let res = self.delete_inner(ctx, name, precondition).await;
        observe("delete", started, &res);
        res
    }

    async fn delete_inner(
        &self,
        ctx: &RequestContext,
        name: &str,
        precondition: Option<&str>,
    ) -> Result<DeleteOutcome<S>, StoreError> {
        let (mut current, kv) = self.read(ctx, name).await?;
        self.check_precondition(name, precondition, kv.mod_revision)?;

        if current.metadata.finalizers.is_empty() {
            let removed = self.remove(ctx, name, &kv, current).await?;
            return Ok(DeleteOutcome::Deleted(removed));
        }
        if current.metadata.is_being_deleted() {
            debug!(kind = %S::KIND, key = %kv.key, "delete already pending");
            return Ok(DeleteOutcome::Pending(current));
        }

        current.metadata.deletion_timestamp = Some(Utc::now());
        let value = encode(&mut current)?;
        match self.call(ctx, "delete", self.backend.compare_and_swap(&kv.key, kv.mod_revision, value)).await? {
            TxnOutcome::Committed(stored) => {
                info!(
                    kind = %S::KIND,
                    key = %stored.key,
                    finalizers = current.metadata.finalizers.len(),
                    "deletion pending on finalizers"
                );
                Ok(DeleteOutcome::Pending(decode(&stored)?))
            }
            TxnOutcome::Failed(cur) => Err(self.txn_failure(name, cur, kv.mod_revision)),
        }
    }

    /// Streams changes under the request scope strictly after `since`.
    /// An empty version starts from the current revision.
    pub async fn watch(
        &self,
        ctx: &RequestContext,
        opts: &ListOptions,
        since: &str,
    ) -> Result<WatchStream<S>, StoreError> {
        let started = Instant::now();
        let res = self.watch_inner(ctx, opts, since).await;
        observe("watch", started, &res);
        res
    }

    async fn watch_inner(
        &self,
        ctx: &RequestContext,
        opts: &ListOptions,
        since: &str,
    ) -> Result<WatchStream<S>, StoreError> {
        self.check_fields(&opts.selector)?;
        let since = parse_version(since)
            .map_err(|msg| self.bad_version("", msg))?;
        let prefix = self.descriptor.layout.range_prefix(self.scope(ctx));
        let feed = self.call(ctx, "watch", self.backend.watch(&prefix, since)).await?;
        debug!(kind = %S::KIND, %prefix, ?since, "watch opened");
        Ok(WatchStream::new(feed, self.descriptor.clone(), opts.clone(), ctx.cancel.clone()))
    }

    // ---- helpers ----

    pub(crate) async fn read(&self, ctx: &RequestContext, name: &str) -> Result<(Object<S>, KeyValue), StoreError> {
        let key = self.key(self.scope(ctx), name)?;
        match self.call(ctx, "get", self.backend.get(&key)).await? {
            Some(kv) => Ok((decode(&kv)?, kv)),
            None => Err(StoreError::NotFound { kind: S::KIND, name: name.to_string() }),
        }
    }

    async fn remove(
        &self,
        ctx: &RequestContext,
        name: &str,
        kv: &KeyValue,
        last: Object<S>,
    ) -> Result<Object<S>, StoreError> {
        match self.call(ctx, "delete", self.backend.compare_and_delete(&kv.key, kv.mod_revision)).await? {
            TxnOutcome::Committed(tomb) => {
                info!(kind = %S::KIND, key = %kv.key, rv = tomb.mod_revision, "deleted");
                Ok(last)
            }
            TxnOutcome::Failed(cur) => Err(self.txn_failure(name, cur, kv.mod_revision)),
        }
    }

    /// Races a backend call against the request timeout and cancellation.
    async fn call<T, F>(&self, ctx: &RequestContext, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                debug!(kind = %S::KIND, op, "request canceled");
                Err(StoreError::Canceled)
            }
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(r) => r.map_err(StoreError::from),
                Err(_) => Err(StoreError::Unavailable(format!("{op} timed out after {:?}", self.timeout))),
            },
        }
    }

    fn scope<'a>(&self, ctx: &'a RequestContext) -> &'a str {
        if self.descriptor.is_namespaced() {
            &ctx.namespace
        } else {
            ""
        }
    }

    fn key(&self, scope: &str, name: &str) -> Result<String, StoreError> {
        self.descriptor.key_for(scope, name).map_err(|e| {
            let field = match e {
                KeyError::MissingNamespace(_) => FieldPath::new("metadata").child("namespace"),
                _ => FieldPath::new("metadata").child("name"),
            };
            let err = match e {
                KeyError::EmptyName | KeyError::MissingNamespace(_) => FieldError::required(&field, e.to_string()),
                KeyError::InvalidName(ref v) => FieldError::invalid(&field, v, e.to_string()),
            };
            StoreError::invalid(S::KIND, name, vec![err])
        })
    }

    fn fill_namespace(&self, ctx: &RequestContext, obj: &mut Object<S>) -> Result<(), StoreError> {
        if !self.descriptor.is_namespaced() {
            return Ok(());
        }
        if obj.metadata.namespace.is_empty() {
            obj.metadata.namespace = ctx.namespace.clone();
        } else if !ctx.namespace.is_empty() && obj.metadata.namespace != ctx.namespace {
            let err = FieldError::invalid(
                &FieldPath::new("metadata").child("namespace"),
                &obj.metadata.namespace,
                format!("does not match the namespace of the request ({})", ctx.namespace),
            );
            return Err(StoreError::invalid(S::KIND, obj.name(), vec![err]));
        }
        Ok(())
    }

    fn check_fields(&self, selector: &Selector) -> Result<(), StoreError> {
        let mut errs = FieldErrors::new();
        let path = FieldPath::new("fieldSelector");
        for key in selector.fields.keys() {
            if !self.descriptor.supports_field(key) {
                errs.push(FieldError::not_supported(&path, key, self.descriptor.selectable_fields));
            }
        }
        if errs.is_empty() {
            Ok(())
        } else {
            Err(StoreError::invalid(S::KIND, "", errs))
        }
    }

    fn check_precondition(&self, name: &str, precondition: Option<&str>, stored: Revision) -> Result<(), StoreError> {
        let Some(rv) = precondition else { return Ok(()) };
        match parse_version(rv).map_err(|msg| self.bad_version(name, msg))? {
            Some(expected) if expected != stored => Err(StoreError::Conflict {
                kind: S::KIND,
                name: name.to_string(),
                reason: format!("expected resource version {expected}, stored is {stored}"),
            }),
            _ => Ok(()),
        }
    }

    fn bad_version(&self, name: &str, msg: String) -> StoreError {
        let path = FieldPath::new("metadata").child("resourceVersion");
        StoreError::invalid(S::KIND, name, vec![FieldError::invalid(&path, "", msg)])
    }

    fn txn_failure(&self, name: &str, current: Option<KeyValue>, read: Revision) -> StoreError {
        match current {
            None => StoreError::NotFound { kind: S::KIND, name: name.to_string() },
            Some(kv) => StoreError::Conflict {
                kind: S::KIND,
                name: name.to_string(),
                reason: format!("object was modified (read {read}, now {})", kv.mod_revision),
            },
        }
    }

    pub(crate) fn visible(&self, obj: &Object<S>, opts: &ListOptions) -> bool {
        matches_options(&self.descriptor, obj, opts)
    }
}

pub(crate) fn matches_options<S: Spec>(d: &ResourceDescriptor<S>, obj: &Object<S>, opts: &ListOptions) -> bool {
    let attrs = d.attributes_of(obj);
    if attrs.uninitialized && !opts.include_uninitialized {
        return false;
    }
    opts.selector.matches(&attrs)
}

fn prepare_for_create<S: Spec>(obj: &mut Object<S>) {
    obj.type_meta = TypeMeta::new(S::KIND.as_str());
    obj.status = S::Status::default();
    let meta = &mut obj.metadata;
    meta.uid = Uuid::new_v4().to_string();
    meta.creation_timestamp = Some(Utc::now());
    meta.deletion_timestamp = None;
    meta.generation = 1;
    meta.resource_version.clear();
}

fn keep_system_fields<S: Spec>(next: &mut Object<S>, current: &Object<S>) {
    next.type_meta = current.type_meta.clone();
    next.metadata.uid = current.metadata.uid.clone();
    next.metadata.creation_timestamp = current.metadata.creation_timestamp;
    next.metadata.deletion_timestamp = current.metadata.deletion_timestamp;
    next.metadata.resource_version = current.metadata.resource_version.clone();
}

pub(crate) fn observe<T>(op: &'static str, started: Instant, res: &Result<T, StoreError>) {
    let result = match res {
        Ok(_) => "ok",
        Err(StoreError::NotFound { .. }) => "not_found",
        Err(StoreError::AlreadyExists { .. }) => "already_exists",
        Err(StoreError::Conflict { .. }) => "conflict",
        Err(StoreError::Invalid { .. }) => "invalid",
        Err(StoreError::Canceled) => "canceled",
        Err(StoreError::Unavailable(_)) => "unavailable",
        Err(StoreError::Internal(_)) => "internal",
        Err(StoreError::TooOldResourceVersion { .. } | StoreError::WatchOverflow) => "resync",
    };
    counter!("store_ops_total", 1u64, "op" => op, "result" => result);
    histogram!("store_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
}
