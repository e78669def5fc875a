//! The page-side engine.
//!
//! One per page. Owns the scope stores, the listener table, the mutation
//! queue, the activity monitor and the request seed, and runs a single pump
//! task that consumes the agent inbox and the shared context bus.
//!
//! ```ignore
//! let engine = Engine::start(PageId::new(), cache, agent, bus, ClientConfig::default()).await?;
//! engine.request(&scope, "home", &[])?;
//! let store = engine.store(&scope).await.expect("scope loaded");
//! store.view(&["home", "settings"]).set("theme", "dark")?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hearth_agent::{
    AgentError, AgentHandle, CacheError, CacheResult, FlowMessage, PageLink, SharedCache,
    SharedContextBus, Subscription,
};
use hearth_types::{
    AgentMessage, ContextFlow, DocPath, Document, KeyError, Mutation, PageId, PageMessage,
    RequestSeed, RequestSeedEntry, ScopeKey, SeedFilter,
};

use crate::config::ClientConfig;
use crate::gate::StoreGate;
use crate::heartbeat::{ActivityMonitor, Beacon, TimerSpec, TimerState};
use crate::queue::{DrainReport, MutationQueue};
use crate::seed::{filter_seed, seed_covers, update_seed};
use crate::sink::CacheSink;
use crate::store::{Store, StoreEvent, StoreHooks};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Page visibility and navigation transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PageLifecycle {
    Visible,
    Hidden,
    Navigating,
    Closing,
}

/// Out-of-band notices for the page's UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineNotice {
    /// A value the page was showing was replaced by newer data.
    StaleData {
        scope_key: ScopeKey,
        document: String,
        collection: String,
    },
    LoggedIn { scope_key: ScopeKey },
    LoggedOut { scope_key: ScopeKey },
    Invalidated { scope_key: ScopeKey },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

// ============================================================================
// Listener table and store hooks
// ============================================================================

#[derive(Default)]
struct Listeners {
    next: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Listener)>>,
}

impl Listeners {
    fn add(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(i, _)| *i != id);
        entries.len() != before
    }

    fn notify(&self, event: &StoreEvent) {
        // Snapshot so listeners may (un)register from inside a callback.
        let snapshot: Vec<Listener> = self.entries.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            listener(event);
        }
    }
}

struct EngineHooks {
    page: PageId,
    agent: AgentHandle,
    listeners: Arc<Listeners>,
    queue: Arc<MutationQueue>,
}

impl StoreHooks for EngineHooks {
    fn notify(&self, event: &StoreEvent) {
        self.listeners.notify(event);
    }

    fn enqueue(&self, mutation: Mutation) {
        let path = mutation.path();
        if let Some(collection) = path.collection_name() {
            let advisory = PageMessage::MayUpdate {
                scope_key: path.scope().clone(),
                document: path.document_name().to_string(),
                collection: collection.to_string(),
            };
            if let Err(e) = self.agent.send(self.page, advisory) {
                debug!(error = %e, "may-update not sent");
            }
        }
        self.queue.enqueue(mutation);
    }
}

struct AgentBeacon {
    page: PageId,
    agent: AgentHandle,
}

impl Beacon for AgentBeacon {
    fn send(&self, message: PageMessage) {
        if let Err(e) = self.agent.send(self.page, message) {
            debug!(error = %e, "timer message not sent");
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    page: PageId,
    config: ClientConfig,
    cache: SharedCache,
    agent: AgentHandle,
    bus: SharedContextBus,
    listeners: Arc<Listeners>,
    queue: Arc<MutationQueue>,
    hooks: Arc<EngineHooks>,
    stores: Mutex<HashMap<ScopeKey, Store>>,
    gate: StoreGate,
    seed: Mutex<RequestSeed>,
    monitor: ActivityMonitor,
    notices: broadcast::Sender<EngineNotice>,
    cancel: CancellationToken,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a page's engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Connect to the agent, load the page's persisted seed and start pumping.
    pub async fn start(
        page: PageId,
        cache: SharedCache,
        agent: AgentHandle,
        bus: SharedContextBus,
        config: ClientConfig,
    ) -> Result<Self, EngineError> {
        let flows = bus.subscribe(">");
        let link = agent.connect(page).await?;
        let seed = cache
            .lock()
            .load_seed(page)?
            .unwrap_or_else(|| RequestSeed::new(page));

        let listeners = Arc::new(Listeners::default());
        let sink = Arc::new(CacheSink::new(cache.clone(), agent.clone(), page));
        let queue = Arc::new(MutationQueue::new(sink, config.debounce()));
        let hooks = Arc::new(EngineHooks {
            page,
            agent: agent.clone(),
            listeners: listeners.clone(),
            queue: queue.clone(),
        });
        let monitor = ActivityMonitor::new(Arc::new(AgentBeacon {
            page,
            agent: agent.clone(),
        }));
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));

        let inner = Arc::new(EngineInner {
            page,
            config,
            cache,
            agent,
            bus,
            listeners,
            queue,
            hooks,
            stores: Mutex::new(HashMap::new()),
            gate: StoreGate::new(),
            seed: Mutex::new(seed),
            monitor,
            notices,
            cancel: CancellationToken::new(),
        });
        tokio::spawn(pump(
            Arc::downgrade(&inner),
            link,
            flows,
            inner.cancel.clone(),
        ));
        info!(page = %page.short(), "engine started");
        Ok(Self { inner })
    }

    pub fn page(&self) -> PageId {
        self.inner.page
    }

    /// The store for a scope, once its data has arrived.
    ///
    /// Waits for the scope's first `data-update` (or a cache that already
    /// holds it) up to the configured timeout; `None` on timeout. Every caller
    /// gets the same instance.
    pub async fn store(&self, scope: &ScopeKey) -> Option<Store> {
        let inner = &self.inner;
        if let Some(store) = inner.stores.lock().get(scope) {
            return Some(store.clone());
        }

        if !inner.gate.is_open(scope) {
            let loaded = inner.cache.lock().is_loaded(scope);
            match loaded {
                Ok(true) => {
                    inner.gate.release(scope);
                }
                Ok(false) => {}
                Err(e) => warn!(%scope, error = %e, "could not read load state"),
            }
        }
        let timeout = inner.config.store_wait_timeout();
        if !inner.gate.wait_open(scope, timeout).await {
            warn!(%scope, ?timeout, "no data arrived for scope");
            return None;
        }

        let mut stores = inner.stores.lock();
        if let Some(store) = stores.get(scope) {
            return Some(store.clone());
        }
        let documents = match load_scope(&inner.cache, scope) {
            Ok(documents) => documents,
            Err(e) => {
                warn!(%scope, error = %e, "could not load scope from cache");
                return None;
            }
        };
        let store = Store::new(scope.clone(), documents, inner.hooks.clone());
        stores.insert(scope.clone(), store.clone());
        Some(store)
    }

    /// Ask for a document. Empty `collections` means all of them.
    ///
    /// Records the request in the page's seed. Returns whether a refresh was
    /// sent; a request the seed already covers for a loaded scope is not.
    pub fn request(
        &self,
        scope: &ScopeKey,
        document: &str,
        collections: &[&str],
    ) -> Result<bool, EngineError> {
        let inner = &self.inner;
        DocPath::document(scope.clone(), document)?;
        let entry = RequestSeedEntry::new(
            scope.clone(),
            document,
            collections.iter().map(|c| c.to_string()).collect(),
        );

        let (covered, updated) = {
            let mut seed = inner.seed.lock();
            let covered = seed_covers(&seed, &entry);
            let next = update_seed(inner.page, Some(&seed), std::slice::from_ref(&entry));
            let updated = (next != *seed).then(|| next.clone());
            *seed = next;
            (covered, updated)
        };
        if let Some(seed) = updated {
            inner.cache.lock().save_seed(&seed)?;
        }
        if covered && inner.cache.lock().is_loaded(scope)? {
            debug!(%scope, document, "already cached, not requesting");
            return Ok(false);
        }

        inner.agent.send(inner.page, refresh_message(&entry))?;
        Ok(true)
    }

    /// Re-request what the page's seed remembers, narrowed by `filter`.
    /// Returns how many documents were requested.
    pub fn resume(&self, filter: &SeedFilter) -> Result<usize, EngineError> {
        let inner = &self.inner;
        let filtered = {
            let seed = inner.seed.lock();
            filter_seed(inner.page, Some(&seed), filter)
        };
        let Some(filtered) = filtered else {
            return Ok(0);
        };
        for entry in &filtered.entries {
            inner.agent.send(inner.page, refresh_message(entry))?;
        }
        Ok(filtered.entries.len())
    }

    pub fn seed(&self) -> RequestSeed {
        self.inner.seed.lock().clone()
    }

    pub fn listen(&self, listener: impl Fn(&StoreEvent) + Send + Sync + 'static) -> ListenerId {
        self.inner.listeners.add(Arc::new(listener))
    }

    pub fn unlisten(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.inner.notices.subscribe()
    }

    /// Drain the mutation queue now.
    pub async fn flush(&self) -> DrainReport {
        self.inner.queue.flush().await
    }

    pub fn pending_mutations(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn record_activity(&self) {
        self.inner.monitor.record_activity();
    }

    pub fn timer_state(&self, name: &str) -> TimerState {
        self.inner.monitor.state(name)
    }

    /// React to a visibility or navigation change.
    ///
    /// Leaving the page always drains the queue before the timers are torn
    /// down.
    pub async fn lifecycle(&self, state: PageLifecycle) -> Result<(), EngineError> {
        debug!(page = %self.inner.page.short(), %state, "lifecycle");
        match state {
            PageLifecycle::Visible => {
                self.inner.monitor.resume();
            }
            PageLifecycle::Hidden => {
                self.inner.monitor.service_now("hidden");
                self.flush().await;
                self.inner.monitor.stop_all();
            }
            PageLifecycle::Navigating | PageLifecycle::Closing => {
                self.inner.monitor.service_now(&state.to_string());
                self.shutdown().await?;
            }
        }
        Ok(())
    }

    pub fn login(&self, scope: &ScopeKey) {
        self.inner.bus.publish_from(
            ContextFlow::LoggedIn {
                scope_key: scope.clone(),
            },
            self.inner.page,
        );
        self.inner.notice(EngineNotice::LoggedIn {
            scope_key: scope.clone(),
        });
    }

    /// Drain, let the agent finish forwarding, then tell every page (and the
    /// agent) that the scope is gone.
    pub async fn logout(&self, scope: &ScopeKey) -> Result<(), EngineError> {
        let inner = &self.inner;
        self.flush().await;
        inner.agent.settle().await?;
        inner.bus.publish_from(
            ContextFlow::LoggedOut {
                scope_key: scope.clone(),
            },
            inner.page,
        );
        inner.monitor.stop_all();
        inner.drop_scope(scope);
        inner.notice(EngineNotice::LoggedOut {
            scope_key: scope.clone(),
        });
        info!(%scope, "logged out");
        Ok(())
    }

    /// Tell every page to drop its store for `scope` and re-gate.
    pub fn invalidate(&self, scope: &ScopeKey) {
        self.inner.bus.publish_from(
            ContextFlow::StoreInvalidated {
                scope_key: scope.clone(),
            },
            self.inner.page,
        );
        self.inner.drop_scope(scope);
    }

    /// Drain, stop timers, and disconnect from the agent.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let report = self.flush().await;
        inner.monitor.stop_all();
        inner.queue.shutdown();
        inner.cancel.cancel();
        inner.agent.disconnect(inner.page)?;
        info!(page = %inner.page.short(), applied = report.applied, "engine shut down");
        Ok(())
    }
}

impl EngineInner {
    fn notice(&self, notice: EngineNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn drop_scope(&self, scope: &ScopeKey) {
        self.stores.lock().remove(scope);
        self.gate.reset(scope);
    }

    async fn handle_agent(&self, message: AgentMessage) {
        match message {
            AgentMessage::DataUpdate {
                scope_key, keys, ..
            } => {
                self.gate.release(&scope_key);
                self.reconcile(&scope_key, &keys);
            }
            AgentMessage::HeartbeatStart {
                name,
                interval_ms,
                max_inactive_ms,
            } => {
                self.monitor.start(
                    &name,
                    TimerSpec {
                        interval: Duration::from_millis(interval_ms),
                        max_inactive: Duration::from_millis(max_inactive_ms),
                    },
                );
            }
            AgentMessage::HeartbeatStop { name } => self.monitor.stop(&name),
            AgentMessage::FlushNow { scope_keys } => {
                debug!(scopes = scope_keys.len(), "agent asked for a flush");
                self.queue.flush().await;
            }
        }
    }

    fn handle_flow(&self, message: FlowMessage<ContextFlow>) {
        if message.sender == Some(self.page) {
            return;
        }
        match message.payload {
            ContextFlow::LoggedIn { scope_key } => {
                self.notice(EngineNotice::LoggedIn { scope_key });
            }
            ContextFlow::LoggedOut { scope_key } => {
                self.drop_scope(&scope_key);
                self.notice(EngineNotice::LoggedOut { scope_key });
            }
            ContextFlow::StoreInvalidated { scope_key } => {
                self.drop_scope(&scope_key);
                self.notice(EngineNotice::Invalidated { scope_key });
            }
        }
    }

    /// Pull changed collections from the cache into the live store.
    fn reconcile(&self, scope: &ScopeKey, keys: &[(String, String)]) {
        let Some(store) = self.stores.lock().get(scope).cloned() else {
            return;
        };
        for (document, collection) in keys {
            if self.queue.has_pending(scope, document, collection) {
                debug!(%scope, document, collection, "local write queued, skipping reconcile");
                continue;
            }
            let cached = self.cache.lock().get(scope, document, collection);
            let cached = match cached {
                Ok(cached) => cached,
                Err(e) => {
                    warn!(%scope, document, collection, error = %e, "cache read failed");
                    continue;
                }
            };
            match store.reconcile(document, collection, cached) {
                Ok(Some(Some(_))) => self.notice(EngineNotice::StaleData {
                    scope_key: scope.clone(),
                    document: document.clone(),
                    collection: collection.clone(),
                }),
                Ok(_) => {}
                Err(e) => warn!(%scope, document, collection, error = %e, "reconcile failed"),
            }
        }
    }
}

fn refresh_message(entry: &RequestSeedEntry) -> PageMessage {
    PageMessage::RefreshData {
        scope_key: entry.scope_key.clone(),
        document: entry.document.clone(),
        collections: (!entry.all_collections()).then(|| entry.collections.clone()),
    }
}

fn load_scope(cache: &SharedCache, scope: &ScopeKey) -> CacheResult<BTreeMap<String, Document>> {
    let db = cache.lock();
    let mut documents = BTreeMap::new();
    for name in db.scope_documents(scope)? {
        let document = db.document(scope, &name)?;
        documents.insert(name, document);
    }
    Ok(documents)
}

async fn pump(
    inner: Weak<EngineInner>,
    mut link: PageLink,
    mut flows: Subscription<ContextFlow>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = link.recv() => {
                let Some(message) = message else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_agent(message).await;
            }
            flow = flows.recv() => {
                let Some(flow) = flow else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_flow(flow);
            }
        }
    }
    debug!(page = %link.page().short(), "engine pump stopped");
}
