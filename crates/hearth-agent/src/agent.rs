//! Background agent: one long-lived actor shared by every page context.
//!
//! Pages talk to the agent through a `Send + Sync` [`AgentHandle`]. Commands
//! travel over an unbounded mpsc channel and are handled in arrival order by a
//! single actor loop, which is what fixes each write's place in its
//! document's [`FifoGate`](crate::gate::FifoGate) queue. Network work runs in
//! tracked tasks that wait on those gates.
//!
//! A `batch-update` is persisted as a pending row and held. All rows of a
//! document leave together, merged into one request per verb, when the
//! document is flushed: by the `refresh-data` a page sends after draining its
//! queue, by `service-timers`, by an inactivity report, or by a replay.
//!
//! ```text
//!   AgentHandle (per page)      mpsc        agent loop              tasks
//!   ┌──────────────────┐   ──────────▶  ┌──────────────┐ spawn ┌──────────────────┐
//!   │ .send(msg)       │                │ ticket()     │ ────▶ │ wait(ticket)     │
//!   │ .connect(page)   │                │ page table   │       │ remote + cache   │
//!   └──────────────────┘   ◀──────────  │ bus: logout  │       │ fan out updates  │
//!            PageLink (AgentMessage)    └──────────────┘       └──────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use hearth_types::{
    AgentMessage, COLLECTIONS_STORE, Collection, ContextFlow, MutationOp, PageId, PageMessage,
    ScopeKey,
};

use crate::cache::{CacheDb, CacheError, CacheResult, PendingWrite, SharedCache};
use crate::config::AgentConfig;
use crate::flows::{FlowMessage, SharedContextBus, Subscription};
use crate::gate::{GateMap, Ticket};
use crate::remote::{CollectionPatch, MutationRequest, RemoteDocument, RemoteError, RemoteStore};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent shut down")]
    Shutdown,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Result of re-sending pending batch-updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub attempted: usize,
    pub delivered: usize,
    /// Rows still pending afterwards.
    pub remaining: usize,
}

// ============================================================================
// Commands (internal)
// ============================================================================

enum AgentCommand {
    Connect {
        page: PageId,
        outbox: mpsc::UnboundedSender<AgentMessage>,
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        page: PageId,
    },
    Page {
        page: PageId,
        message: PageMessage,
    },
    ReplayPending {
        reply: oneshot::Sender<Result<ReplayReport, AgentError>>,
    },
    Settle {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// AgentHandle (Send + Sync public API)
// ============================================================================

/// Handle to the agent actor. Cheap to clone; one per page is typical.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    /// Register a page. The agent immediately sends it `heartbeat-start`.
    pub async fn connect(&self, page: PageId) -> Result<PageLink, AgentError> {
        let (outbox, inbox) = mpsc::unbounded_channel();
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::Connect {
                page,
                outbox,
                reply,
            })
            .map_err(|_| AgentError::Shutdown)?;
        rx.await.map_err(|_| AgentError::Shutdown)?;
        Ok(PageLink { page, inbox })
    }

    pub fn disconnect(&self, page: PageId) -> Result<(), AgentError> {
        self.tx
            .send(AgentCommand::Disconnect { page })
            .map_err(|_| AgentError::Shutdown)
    }

    /// Post a message to the agent. Fire-and-forget.
    pub fn send(&self, page: PageId, message: PageMessage) -> Result<(), AgentError> {
        self.tx
            .send(AgentCommand::Page { page, message })
            .map_err(|_| AgentError::Shutdown)
    }

    /// Re-send every pending batch-update, in arrival order.
    pub async fn replay_pending(&self) -> Result<ReplayReport, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::ReplayPending { reply })
            .map_err(|_| AgentError::Shutdown)?;
        rx.await.map_err(|_| AgentError::Shutdown)?
    }

    /// Wait until everything sent so far, and any work it spawned, has finished.
    pub async fn settle(&self) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AgentCommand::Settle { reply })
            .map_err(|_| AgentError::Shutdown)?;
        rx.await.map_err(|_| AgentError::Shutdown)
    }
}

/// A page's inbox of agent messages.
pub struct PageLink {
    page: PageId,
    inbox: mpsc::UnboundedReceiver<AgentMessage>,
}

impl PageLink {
    pub fn page(&self) -> PageId {
        self.page
    }

    /// `None` once the agent has dropped this page.
    pub async fn recv(&mut self) -> Option<AgentMessage> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentMessage> {
        self.inbox.try_recv().ok()
    }
}

// ============================================================================
// Shared agent state
// ============================================================================

struct PageState {
    outbox: mpsc::UnboundedSender<AgentMessage>,
    scopes: BTreeSet<ScopeKey>,
    inactive: bool,
    /// The page was told to run the activity timer and not told to stop.
    timer_running: bool,
}

/// A `may-update` hint: `page` has a write to this collection in flight.
#[derive(Clone, Copy)]
struct Advisory {
    page: PageId,
    until: Instant,
}

/// What flushing one document's pending rows did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Push {
    /// Nothing was pending.
    Idle,
    /// The remote accepted the rows; `conflict` when it merged a stale version.
    Delivered { rows: usize, conflict: bool },
    /// Remote unreachable; the rows stay pending.
    Deferred { rows: usize },
    /// Rejected by the remote, or superseded locally; the rows are gone.
    Dropped { rows: usize },
}

struct AgentShared {
    cache: SharedCache,
    remote: Arc<dyn RemoteStore>,
    bus: SharedContextBus,
    config: AgentConfig,
    pages: DashMap<PageId, PageState>,
    advisories: DashMap<(ScopeKey, String, String), Advisory>,
    gates: GateMap,
    online: AtomicBool,
    tasks: TaskTracker,
    settle_lock: tokio::sync::Mutex<()>,
}

/// Spawn the agent on the current tokio runtime.
pub fn spawn_agent(
    cache: SharedCache,
    remote: Arc<dyn RemoteStore>,
    bus: SharedContextBus,
    config: AgentConfig,
) -> AgentHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let flows = bus.subscribe("auth.logout");
    let shared = Arc::new(AgentShared {
        cache,
        remote,
        bus,
        config,
        pages: DashMap::new(),
        advisories: DashMap::new(),
        gates: GateMap::new(),
        online: AtomicBool::new(true),
        tasks: TaskTracker::new(),
        settle_lock: tokio::sync::Mutex::new(()),
    });
    tokio::spawn(run(shared, rx, flows));
    AgentHandle { tx }
}

async fn run(
    shared: Arc<AgentShared>,
    mut rx: mpsc::UnboundedReceiver<AgentCommand>,
    mut flows: Subscription<ContextFlow>,
) {
    info!(
        bus_subscribers = shared.bus.subscriber_count(),
        "agent started"
    );
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => shared.handle_command(cmd),
                None => break,
            },
            Some(msg) = flows.recv() => shared.handle_flow(msg),
        }
    }
    debug!("agent shutting down: channel closed");
    shared.tasks.close();
    shared.tasks.wait().await;
}

impl AgentShared {
    fn cache<T>(&self, f: impl FnOnce(&CacheDb) -> CacheResult<T>) -> CacheResult<T> {
        let db = self.cache.lock();
        f(&db)
    }

    fn handle_command(self: &Arc<Self>, cmd: AgentCommand) {
        match cmd {
            AgentCommand::Connect {
                page,
                outbox,
                reply,
            } => {
                let _ = outbox.send(self.heartbeat_start());
                self.pages.insert(
                    page,
                    PageState {
                        outbox,
                        scopes: BTreeSet::new(),
                        inactive: false,
                        timer_running: true,
                    },
                );
                info!(page = %page, pages = self.pages.len(), "page connected");
                let _ = reply.send(());
            }
            AgentCommand::Disconnect { page } => {
                self.pages.remove(&page);
                info!(page = %page, pages = self.pages.len(), "page disconnected");
            }
            AgentCommand::Page { page, message } => self.handle_page_message(page, message),
            AgentCommand::ReplayPending { reply } => {
                let shared = self.clone();
                self.tasks.spawn(async move {
                    let _ = reply.send(shared.replay().await);
                });
            }
            AgentCommand::Settle { reply } => {
                let shared = self.clone();
                tokio::spawn(async move {
                    let _serial = shared.settle_lock.lock().await;
                    shared.tasks.close();
                    shared.tasks.wait().await;
                    shared.tasks.reopen();
                    let _ = reply.send(());
                });
            }
        }
    }

    fn heartbeat_start(&self) -> AgentMessage {
        AgentMessage::HeartbeatStart {
            name: self.config.activity_timer.clone(),
            interval_ms: self.config.activity_interval().as_millis() as u64,
            max_inactive_ms: self.config.max_inactive_ms,
        }
    }

    fn handle_page_message(self: &Arc<Self>, page: PageId, message: PageMessage) {
        if let Some(scope) = message.scope_key() {
            if let Some(mut state) = self.pages.get_mut(&page) {
                state.scopes.insert(scope.clone());
                if !state.timer_running {
                    state.timer_running = true;
                    let _ = state.outbox.send(self.heartbeat_start());
                }
            }
        }

        match message {
            PageMessage::RefreshData {
                scope_key,
                document,
                collections,
            } => {
                let ticket = self.gates.gate(&scope_key, &document).ticket();
                let shared = self.clone();
                self.tasks.spawn(async move {
                    shared
                        .refresh(ticket, page, scope_key, document, collections)
                        .await;
                });
            }
            PageMessage::MayUpdate {
                scope_key,
                document,
                collection,
            } => {
                let until = Instant::now() + self.config.may_update_window();
                self.advisories
                    .insert((scope_key, document, collection), Advisory { page, until });
            }
            PageMessage::BatchUpdate {
                scope_key,
                document,
                collection,
                property,
                op,
            } => {
                let recorded = self.cache(|db| {
                    db.push_pending(&scope_key, &document, &collection, property.as_deref(), op)
                });
                match recorded {
                    Ok(id) => {
                        debug!(pending = id, scope = %scope_key, document, collection, "write held")
                    }
                    Err(e) => {
                        error!(
                            scope = %scope_key,
                            document,
                            collection,
                            error = %e,
                            "failed to record pending write"
                        );
                        return;
                    }
                }
                // The cache already holds the write; other pages can show it now.
                self.fan_out_except(
                    page,
                    AgentMessage::DataUpdate {
                        scope_key,
                        store_name: COLLECTIONS_STORE.to_string(),
                        keys: vec![(document, collection)],
                    },
                );
            }
            PageMessage::HeartbeatBeat { name, inactive } => {
                let became_inactive = match self.pages.get_mut(&page) {
                    Some(mut state) => {
                        let was = std::mem::replace(&mut state.inactive, inactive);
                        !was && inactive
                    }
                    None => false,
                };
                debug!(page = %page, timer = %name, inactive, "heartbeat");
                if became_inactive {
                    self.flush_sharing(page, true, "inactive");
                }
            }
            PageMessage::ServiceTimers { reason } => {
                debug!(page = %page, reason = %reason, "page servicing timers");
                // The reporter drains itself before its timers go away.
                self.flush_sharing(page, false, &reason);
            }
        }
    }

    fn handle_flow(&self, msg: FlowMessage<ContextFlow>) {
        let ContextFlow::LoggedOut { scope_key } = &msg.payload else {
            return;
        };
        info!(scope = %scope_key, "scope logged out, purging cached data");
        if let Err(e) = self.cache(|db| db.purge_scope(scope_key)) {
            error!(scope = %scope_key, error = %e, "failed to purge scope");
        }
        self.advisories.retain(|(scope, _, _), _| scope != scope_key);
        for mut page in self.pages.iter_mut() {
            // A page left without any scope has nothing for the timer to guard.
            if page.scopes.remove(scope_key) && page.scopes.is_empty() && page.timer_running {
                page.timer_running = false;
                let _ = page.outbox.send(AgentMessage::HeartbeatStop {
                    name: self.config.activity_timer.clone(),
                });
                debug!(page = %page.key(), "activity timer stopped");
            }
        }
    }

    /// Ask every page sharing a scope with `reporter` to drain its queue, and
    /// forward what is already pending for those scopes.
    fn flush_sharing(self: &Arc<Self>, reporter: PageId, include_reporter: bool, reason: &str) {
        let Some(scopes) = self.pages.get(&reporter).map(|s| s.scopes.clone()) else {
            return;
        };
        for entry in self.pages.iter() {
            if *entry.key() == reporter && !include_reporter {
                continue;
            }
            let shared: Vec<ScopeKey> = entry.scopes.intersection(&scopes).cloned().collect();
            if shared.is_empty() {
                continue;
            }
            debug!(from = %reporter, to = %entry.key(), reason, "forcing flush");
            let _ = entry
                .outbox
                .send(AgentMessage::FlushNow { scope_keys: shared });
        }
        self.push_scopes(&scopes);
    }

    fn push_scopes(self: &Arc<Self>, scopes: &BTreeSet<ScopeKey>) {
        let documents = match self.cache(|db| db.pending_documents()) {
            Ok(documents) => documents,
            Err(e) => {
                error!(error = %e, "cannot list pending writes");
                return;
            }
        };
        for (scope, document) in documents {
            if !scopes.contains(&scope) {
                continue;
            }
            let ticket = self.gates.gate(&scope, &document).ticket();
            let shared = self.clone();
            self.tasks.spawn(async move {
                let _guard = ticket.wait().await;
                shared.sync_document(&scope, &document).await;
            });
        }
    }

    fn fan_out(&self, message: AgentMessage) {
        for entry in self.pages.iter() {
            if entry.outbox.send(message.clone()).is_err() {
                debug!(page = %entry.key(), "page link closed, dropping message");
            }
        }
    }

    fn fan_out_except(&self, origin: PageId, message: AgentMessage) {
        for entry in self.pages.iter().filter(|e| *e.key() != origin) {
            if entry.outbox.send(message.clone()).is_err() {
                debug!(page = %entry.key(), "page link closed, dropping message");
            }
        }
    }

    fn data_update(&self, scope: &ScopeKey, keys: Vec<(String, String)>) {
        self.fan_out(AgentMessage::DataUpdate {
            scope_key: scope.clone(),
            store_name: COLLECTIONS_STORE.to_string(),
            keys,
        });
    }

    fn mark_online(self: &Arc<Self>) {
        if !self.online.swap(true, Ordering::SeqCst) {
            info!("remote reachable again, replaying pending writes");
            let shared = self.clone();
            self.tasks.spawn(async move {
                if let Err(e) = shared.replay().await {
                    warn!(error = %e, "automatic replay failed");
                }
            });
        }
    }

    fn mark_offline(&self, err: &RemoteError) {
        if self.online.swap(false, Ordering::SeqCst) {
            warn!(error = %err, "remote unavailable, holding writes for replay");
        }
    }

    /// Whether another page has announced a write to this collection.
    fn shielded(
        &self,
        scope: &ScopeKey,
        document: &str,
        collection: &str,
        requester: Option<PageId>,
    ) -> bool {
        let key = (scope.clone(), document.to_string(), collection.to_string());
        match self.advisories.get(&key).map(|a| *a) {
            Some(a) if a.until <= Instant::now() => {
                self.advisories.remove(&key);
                false
            }
            Some(a) => Some(a.page) != requester,
            None => false,
        }
    }

    // ── Refresh ─────────────────────────────────────────────────────────

    async fn refresh(
        self: Arc<Self>,
        ticket: Ticket,
        page: PageId,
        scope: ScopeKey,
        document: String,
        collections: Option<Vec<String>>,
    ) {
        let _guard = ticket.wait().await;
        // Held writes go first so the fetch reflects them.
        let collections = match self.push_document(&scope, &document).await {
            Push::Deferred { .. } => {
                self.offline_update(&scope);
                return;
            }
            Push::Delivered { conflict: true, .. } => None,
            _ => collections,
        };
        match self
            .pull(&scope, &document, collections.as_deref(), Some(page))
            .await
        {
            Ok(keys) => {
                self.mark_online();
                self.data_update(&scope, keys);
            }
            Err(e) => {
                match &e {
                    AgentError::Remote(re) if re.is_unavailable() => self.mark_offline(re),
                    _ => warn!(scope = %scope, document, error = %e, "refresh failed"),
                }
                self.offline_update(&scope);
            }
        }
    }

    /// Pages waiting on a scope that is already cached can proceed offline.
    fn offline_update(&self, scope: &ScopeKey) {
        match self.cache(|db| db.is_loaded(scope)) {
            Ok(true) => self.data_update(scope, Vec::new()),
            Ok(false) => debug!(scope = %scope, "scope not loaded yet, no data-update"),
            Err(e) => error!(scope = %scope, error = %e, "cache unavailable"),
        }
    }

    /// Fetch from the remote and store changed collections. Returns the
    /// `(document, collection)` keys that changed.
    async fn pull(
        &self,
        scope: &ScopeKey,
        document: &str,
        collections: Option<&[String]>,
        requester: Option<PageId>,
    ) -> Result<Vec<(String, String)>, AgentError> {
        let single = match collections {
            Some([one]) => Some(one.as_str()),
            _ => None,
        };
        let fetched = self.remote.fetch(scope, document, single).await?;
        Ok(self.store_fetched(scope, document, collections, requester, fetched)?)
    }

    fn store_fetched(
        &self,
        scope: &ScopeKey,
        document: &str,
        collections: Option<&[String]>,
        requester: Option<PageId>,
        fetched: RemoteDocument,
    ) -> CacheResult<Vec<(String, String)>> {
        let wanted = |name: &str| {
            collections.is_none_or(|cols| cols.is_empty() || cols.iter().any(|c| c == name))
        };
        let db = self.cache.lock();
        let pending: HashSet<String> = db
            .pending_collections(scope, document)?
            .into_iter()
            .collect();

        let mut names: BTreeSet<String> = fetched
            .collections
            .keys()
            .filter(|n| wanted(n.as_str()))
            .cloned()
            .collect();
        names.extend(
            db.collection_names(scope, document)?
                .into_iter()
                .filter(|n| wanted(n.as_str())),
        );

        let mut keys = Vec::new();
        for name in names {
            if pending.contains(&name) || self.shielded(scope, document, &name, requester) {
                debug!(
                    scope = %scope,
                    document,
                    collection = %name,
                    "local write pending, keeping cached value"
                );
                continue;
            }
            let current = db.get(scope, document, &name)?;
            let remote = fetched.collections.get(&name);
            if current.as_ref() == remote {
                continue;
            }
            match remote {
                Some(body) => db.put(scope, document, &name, body)?,
                None => {
                    db.delete_collection(scope, document, &name)?;
                }
            }
            keys.push((document.to_string(), name));
        }
        db.set_version(scope, document, fetched.version)?;
        db.mark_loaded(scope)?;
        debug!(
            scope = %scope,
            document,
            version = fetched.version,
            changed = keys.len(),
            "pulled document"
        );
        Ok(keys)
    }

    // ── Batch-updates ───────────────────────────────────────────────────

    /// Forward every pending row of a document as one merged change set.
    /// The caller holds the document's gate.
    async fn push_document(self: &Arc<Self>, scope: &ScopeKey, document: &str) -> Push {
        let prepared = self.cache(|db| {
            let rows = db.document_pending(scope, document)?;
            let requests = build_requests(db, scope, document, &rows)?;
            Ok((rows, requests))
        });
        let (rows, requests) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(scope = %scope, document, error = %e, "cannot read pending writes");
                return Push::Deferred { rows: 0 };
            }
        };
        if rows.is_empty() {
            return Push::Idle;
        }
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        if requests.is_empty() {
            debug!(
                scope = %scope,
                document,
                rows = ids.len(),
                "cached values gone, writes superseded"
            );
            self.drop_rows(&ids);
            return Push::Dropped { rows: ids.len() };
        }

        let mut conflict = false;
        let mut version = None;
        for mut request in requests {
            // Follow-up requests build on the version the previous one produced.
            if version.is_some() {
                request.version = version;
            }
            match self.remote.mutate(scope, document, request).await {
                Ok(outcome) => {
                    version = Some(outcome.new_version);
                    conflict |= outcome.conflict;
                }
                Err(e) if e.is_unavailable() => {
                    self.mark_offline(&e);
                    if let Some(v) = version {
                        self.record_version(scope, document, v);
                    }
                    return Push::Deferred { rows: ids.len() };
                }
                Err(e) => {
                    error!(scope = %scope, document, error = %e, "remote rejected writes");
                    self.drop_rows(&ids);
                    return Push::Dropped { rows: ids.len() };
                }
            }
        }

        if let Some(v) = version {
            self.record_version(scope, document, v);
        }
        self.drop_rows(&ids);
        self.mark_online();
        debug!(
            scope = %scope,
            document,
            rows = ids.len(),
            version = ?version,
            conflict,
            "forwarded pending writes"
        );
        Push::Delivered {
            rows: ids.len(),
            conflict,
        }
    }

    /// Push a document and, if the remote merged a stale version, refetch it.
    /// The caller holds the document's gate.
    async fn sync_document(self: &Arc<Self>, scope: &ScopeKey, document: &str) -> Push {
        let push = self.push_document(scope, document).await;
        if let Push::Delivered { conflict: true, .. } = push {
            info!(scope = %scope, document, "stale version merged remotely, refetching");
            match self.pull(scope, document, None, None).await {
                Ok(keys) if keys.is_empty() => {}
                Ok(keys) => self.data_update(scope, keys),
                Err(e) => {
                    warn!(scope = %scope, document, error = %e, "refetch after conflict failed")
                }
            }
        }
        push
    }

    fn record_version(&self, scope: &ScopeKey, document: &str, version: u64) {
        if let Err(e) = self.cache(|db| db.set_version(scope, document, version)) {
            error!(scope = %scope, document, error = %e, "failed to record remote version");
        }
    }

    fn drop_rows(&self, ids: &[i64]) {
        let removed = self.cache(|db| ids.iter().try_for_each(|id| db.remove_pending(*id)));
        if let Err(e) = removed {
            error!(rows = ids.len(), error = %e, "failed to drop pending writes");
        }
    }

    async fn replay(self: &Arc<Self>) -> Result<ReplayReport, AgentError> {
        let documents = self.cache(|db| db.pending_documents())?;
        let queued: Vec<(Ticket, ScopeKey, String)> = documents
            .into_iter()
            .map(|(scope, document)| (self.gates.gate(&scope, &document).ticket(), scope, document))
            .collect();

        let mut report = ReplayReport::default();
        // Breaking out drops the leftover tickets, abandoning their places in line.
        for (ticket, scope, document) in queued {
            let _guard = ticket.wait().await;
            match self.sync_document(&scope, &document).await {
                Push::Idle => {}
                Push::Delivered { rows, .. } => {
                    report.attempted += rows;
                    report.delivered += rows;
                }
                Push::Dropped { rows } => report.attempted += rows,
                Push::Deferred { rows } => {
                    report.attempted += rows;
                    break;
                }
            }
        }

        report.remaining = self.cache(|db| db.pending_count())?;
        info!(
            attempted = report.attempted,
            delivered = report.delivered,
            remaining = report.remaining,
            "replayed pending writes"
        );
        Ok(report)
    }
}

/// Net effect of a document's pending rows on one collection.
#[derive(Default)]
struct Touched<'a> {
    /// Some row addressed the whole collection.
    whole: bool,
    last_op: Option<MutationOp>,
    /// Last op per property.
    properties: BTreeMap<&'a str, MutationOp>,
}

/// Merge a document's pending rows into remote requests, reading values from
/// the cache's current state: at most one put and one delete.
///
/// A put whose value no longer exists is superseded and left out; a later
/// delete row carries that change.
fn build_requests(
    db: &CacheDb,
    scope: &ScopeKey,
    document: &str,
    rows: &[PendingWrite],
) -> CacheResult<Vec<MutationRequest>> {
    let mut touched: BTreeMap<&str, Touched<'_>> = BTreeMap::new();
    for row in rows {
        let entry = touched.entry(row.collection.as_str()).or_default();
        entry.last_op = Some(row.op);
        match &row.property {
            Some(prop) => {
                entry.properties.insert(prop.as_str(), row.op);
            }
            None => entry.whole = true,
        }
    }

    let mut puts = Vec::new();
    let mut deletes = Vec::new();
    for (collection, touched) in touched {
        let current = db.get(scope, document, collection)?;
        if touched.whole {
            match current {
                Some(body) => puts.push(CollectionPatch::replace(collection, body)),
                None if touched.last_op == Some(MutationOp::Delete) => {
                    deletes.push(CollectionPatch::remove_collection(collection));
                }
                None => {}
            }
            continue;
        }

        let body = current.unwrap_or_default();
        let mut written = Collection::new();
        let mut removed = Vec::new();
        for (prop, op) in touched.properties {
            match (op, body.get(prop)) {
                (MutationOp::Put, Some(value)) => {
                    written.insert(prop.to_string(), value.clone());
                }
                (MutationOp::Put, None) => {}
                (MutationOp::Delete, _) => removed.push(prop.to_string()),
            }
        }
        if !written.is_empty() {
            puts.push(CollectionPatch::merge(collection, written));
        }
        if !removed.is_empty() {
            deletes.push(CollectionPatch::remove_properties(collection, removed));
        }
    }

    let version = db.version(scope, document)?;
    let mut requests = Vec::new();
    if !puts.is_empty() {
        requests.push(MutationRequest::new(version, MutationOp::Put, puts));
    }
    if !deletes.is_empty() {
        requests.push(MutationRequest::new(version, MutationOp::Delete, deletes));
    }
    Ok(requests)
}
