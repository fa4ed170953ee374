//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

#[cfg_attr(doc, aquamarine::aquamarine)]
/// The tier: interior supervisor of the overlay tree
///
/// A tier owns the child records for one expanded JobGroup or JobArray,
/// launches children through the scheduler as their dependencies resolve,
/// aggregates their reports and mirrors the same websocket protocol its
/// own parent speaks.
///
/// # Control Flow
///
/// ```mermaid
/// sequenceDiagram
///     participant P   as Parent
///     participant T   as Tier
///     participant SCH as Scheduler
///     participant C1  as Child
///
///     T->>P: register
///     T->>P: spec(ident)
///     P-->>T: serialized group
///
///     T->>SCH: launch(eligible children)
///     SCH->>+C1: spawn
///     C1->>T: register
///     C1->>T: spec(ident)
///     T-->>C1: serialized job
///
///     loop while running
///         C1->>T: log / update
///         T->>P: update (aggregated)
///     end
///
///     C1->>-T: complete
///     T->>T: resolve dependencies, launch next
///     T->>P: complete (aggregated)
/// ```
mod children;
mod resolver;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use futures::StreamExt;
use log::debug;
use log::info;
use log::trace;
use log::warn;
use tokio::sync::oneshot;
use tokio::sync::Notify;

pub use children::Aggregate;
pub use children::ChildRecord;
pub use children::ChildResult;
pub use children::ChildState;
pub use children::ChildTable;
pub use resolver::validate_siblings;
pub use resolver::Partition;

use crate::config::Configuration;
use crate::protocol::message::CompletePayload;
use crate::protocol::message::LogPayload;
use crate::protocol::message::RegisterPayload;
use crate::protocol::message::SpecPayload;
use crate::protocol::message::SpecReply;
use crate::protocol::message::UpdatePayload;
use crate::protocol::message::ACTION_CHILDREN;
use crate::protocol::message::ACTION_COMPLETE;
use crate::protocol::message::ACTION_GET_TREE;
use crate::protocol::message::ACTION_LOG;
use crate::protocol::message::ACTION_REGISTER;
use crate::protocol::message::ACTION_SPEC;
use crate::protocol::message::ACTION_STOP;
use crate::protocol::message::ACTION_UPDATE;
use crate::protocol::ws_url;
use crate::protocol::Client;
use crate::protocol::MessageHandler;
use crate::protocol::NullHandler;
use crate::protocol::Server;
use crate::sched::LaunchMode;
use crate::sched::LaunchRequest;
use crate::sched::ProcessHandle;
use crate::sched::Scheduler;
use crate::spec::JobGroup;
use crate::spec::ResourceSummary;
use crate::spec::SpecNode;
use crate::store::LogStore;
use crate::store::Severity;
use crate::ui::LogRenderer;
use crate::util::now_ts;

/// Synthetic exit code recorded for discarded children
const ABORT_EXIT_CODE: i32 = -1;

/// A root spec may be a bare `!Job`; give it a tier to live under so the
/// runtime shape is uniform
pub fn rootify(node: SpecNode) -> SpecNode {
    match node {
        SpecNode::Job(job) => {
            let ident = job.ident().clone();
            SpecNode::Group(JobGroup::new(
                ident,
                None,
                BTreeMap::new(),
                vec![SpecNode::Job(job)],
                vec![],
                vec![],
                vec![],
            ))
        }
        other => other,
    }
}

struct TierShared {
    ident: String,
    config: Configuration,
    store: LogStore,
    children: Mutex<ChildTable>,
    scheduler: Arc<dyn Scheduler>,
    server_url: Mutex<String>,
    upward: Mutex<Option<Client>>,
    renderer: Option<LogRenderer>,
    /// Serializes resolver passes against the launches they trigger, which
    /// is what prevents duplicate launches under racing completes.
    launch_lock: tokio::sync::Mutex<()>,
    killers: Mutex<HashMap<String, oneshot::Sender<()>>>,
    stopping: AtomicBool,
    done: Notify,
}

impl TierShared {
    fn server_url(&self) -> String {
        self.server_url.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn upward(&self) -> Option<Client> {
        self.upward.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_log(&self, log: &LogPayload) {
        self.store
            .append_entry(log.timestamp, log.severity, &log.message);

        match &self.renderer {
            // At the root the renderer is the sink.
            Some(renderer) => renderer.render(log),
            None => {
                if let Some(client) = self.upward() {
                    match serde_json::to_value(log) {
                        Ok(value) => {
                            if let Err(e) = client.post(ACTION_LOG, value) {
                                debug!("Forwarding log entry failed: {e:#}");
                            }
                        }
                        Err(e) => warn!("Encoding log payload failed: {e}"),
                    }
                }
            }
        }
    }

    fn log_own(&self, severity: Severity, message: &str) {
        self.record_log(&LogPayload {
            origin: self.ident.clone(),
            timestamp: now_ts(),
            severity,
            message: message.to_string(),
        })
    }

    fn maybe_done(&self) {
        if self
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .all_terminal()
        {
            self.done.notify_waiters();
        }
    }

    fn take_killer(&self, ident: &str) -> Option<oneshot::Sender<()>> {
        self.killers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ident)
    }
}

/// Run one resolver pass and act on it, repeating until a fixpoint
///
/// Aborting a child can violate further `on_pass`/`on_fail` edges, so the
/// cascade loops until a pass neither launches nor discards anything.
///
/// Boxed to break the `resolve_and_launch` -> `launch_child` ->
/// `watch_child` -> `resolve_and_launch` recursion, which otherwise
/// defeats the compiler's auto-trait (`Send`) cycle detection.
fn resolve_and_launch(
    shared: &Arc<TierShared>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
    Box::pin(resolve_and_launch_inner(shared))
}

async fn resolve_and_launch_inner(shared: &Arc<TierShared>) {
    let _guard = shared.launch_lock.lock().await;

    loop {
        let partition = {
            let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
            resolver::resolve(&children)
        };

        let mut progressed = false;

        for ident in &partition.abort {
            let aborted = {
                let mut children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
                children
                    .get_mut(ident)
                    .map(|record| record.abort(ABORT_EXIT_CODE).is_ok())
                    .unwrap_or(false)
            };
            if aborted {
                progressed = true;
                shared.log_own(
                    Severity::Warning,
                    &format!("discarding '{ident}': dependencies cannot be met"),
                );
            }
        }

        if !shared.stopping.load(Ordering::SeqCst) {
            for ident in &partition.launch_now {
                progressed = true;
                if let Err(e) = launch_child(shared, ident).await {
                    warn!("Launching '{ident}' failed: {e:#}");
                    let mut children =
                        shared.children.lock().unwrap_or_else(|e| e.into_inner());
                    if let Ok(record) = children.get_mut(ident) {
                        let _ = record.abort(ABORT_EXIT_CODE);
                    }
                    drop(children);
                    shared.log_own(Severity::Error, &format!("launching '{ident}' failed: {e:#}"));
                }
            }
        }

        if !progressed {
            break;
        }
    }

    shared.maybe_done();
}

async fn launch_child(shared: &Arc<TierShared>, ident: &str) -> Result<()> {
    let (mode, resources) = {
        let mut children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
        let record = children.get_mut(ident)?;
        let (mode, resources) = match record.spec() {
            SpecNode::Job(job) => (
                LaunchMode::Wrapper,
                ResourceSummary::from_requests(job.resources()),
            ),
            _ => (LaunchMode::Tier, ResourceSummary::default()),
        };
        record.mark_launched()?;
        (mode, resources)
    };

    let request = LaunchRequest::builder()
        .ident(ident.to_string())
        .parent_url(shared.server_url())
        .resources(resources)
        .mode(mode)
        .build();

    let handle = tokio::time::timeout(
        shared.config.scheduler_timeout(),
        shared.scheduler.launch(request),
    )
    .await
    .map_err(|_| anyhow!("scheduler did not answer within {:?}", shared.config.scheduler_timeout()))?
    .with_context(|| format!("Scheduling '{ident}'"))?;

    let (killer_tx, killer_rx) = oneshot::channel();
    shared
        .killers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(ident.to_string(), killer_tx);
    tokio::spawn(watch_child(
        shared.clone(),
        ident.to_string(),
        handle,
        killer_rx,
    ));

    Ok(())
}

/// Own the process handle of one launched child until it is gone
///
/// Exits with the process; if the child never managed to report `complete`
/// it is recorded as ABORTED with its real exit code. The killer channel
/// forces termination (stop deadline, connect-back grace).
async fn watch_child(
    shared: Arc<TierShared>,
    ident: String,
    mut handle: Box<dyn ProcessHandle>,
    killer: oneshot::Receiver<()>,
) {
    let code = tokio::select! {
        code = handle.wait_for_exit() => code.unwrap_or(ABORT_EXIT_CODE),
        _ = killer => {
            debug!("Forcing termination of '{ident}'");
            let _ = handle.terminate().await;
            handle.wait_for_exit().await.unwrap_or(ABORT_EXIT_CODE)
        }
    };
    trace!("Supervisor process of '{ident}' exited with {code}");

    // Give an in-flight complete a moment to be serviced first.
    tokio::time::sleep(Duration::from_secs(1)).await;

    let aborted = {
        let mut children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
        match children.get_mut(&ident) {
            Ok(record) if !record.is_terminal() => record
                .abort(if code == 0 { ABORT_EXIT_CODE } else { code })
                .is_ok(),
            _ => false,
        }
    };

    shared.take_killer(&ident);

    if aborted {
        shared.log_own(
            Severity::Warning,
            &format!("'{ident}' exited with {code} without reporting completion"),
        );
        resolve_and_launch(&shared).await;
    } else {
        shared.maybe_done();
    }
}

/// Abort every PENDING child, forward `stop` to every STARTED child and
/// arm the termination deadline
async fn initiate_stop(shared: &Arc<TierShared>) {
    if shared.stopping.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("Stopping tier '{}'", shared.ident);

    let doomed = {
        let mut children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
        let pending = children
            .iter()
            .filter(|r| r.state() == ChildState::Pending)
            .map(|r| r.ident().to_string())
            .collect::<Vec<_>>();
        for ident in &pending {
            if let Ok(record) = children.get_mut(ident) {
                let _ = record.abort(ABORT_EXIT_CODE);
            }
        }
        pending
    };
    for ident in doomed {
        shared.log_own(Severity::Warning, &format!("discarding '{ident}': stopped"));
    }

    // Forward to every running child in parallel; the response to the
    // stop we received returns once this fan-out is done.
    let targets = {
        let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
        children
            .iter()
            .filter(|r| r.state() == ChildState::Started)
            .filter_map(|r| {
                r.server_url()
                    .map(|url| (r.ident().to_string(), url.to_string()))
            })
            .collect::<Vec<_>>()
    };

    targets
        .into_iter()
        .map(|(ident, server)| async move {
            match Client::connect(&ws_url(&server), Arc::new(NullHandler)).await {
                Ok(client) => {
                    if let Err(e) = client.post(ACTION_STOP, serde_json::json!({})) {
                        debug!("Forwarding stop to '{ident}' failed: {e:#}");
                    }
                }
                Err(e) => debug!("Cannot reach '{ident}' for stop: {e:#}"),
            }
        })
        .collect::<futures::stream::FuturesUnordered<_>>()
        .collect::<Vec<()>>()
        .await;

    let deadline = shared.config.stop_grace();
    let enforcer = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let stragglers = {
            let children = enforcer.children.lock().unwrap_or_else(|e| e.into_inner());
            children
                .iter()
                .filter(|r| !r.is_terminal())
                .map(|r| r.ident().to_string())
                .collect::<Vec<_>>()
        };
        for ident in stragglers {
            warn!("'{ident}' ignored stop for {deadline:?}, terminating it");
            if let Some(killer) = enforcer.take_killer(&ident) {
                let _ = killer.send(());
            }
        }
    });

    shared.maybe_done();
}

/// Abort LAUNCHED children that never connected back within the grace
/// period
fn sweep_connect_grace(shared: &Arc<TierShared>) {
    let grace = shared.config.connect_grace();
    let overdue = {
        let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
        children
            .iter()
            .filter(|r| r.launched_for().map(|d| d > grace).unwrap_or(false))
            .map(|r| r.ident().to_string())
            .collect::<Vec<_>>()
    };

    for ident in overdue {
        warn!("'{ident}' did not register within {grace:?}, terminating it");
        shared.log_own(
            Severity::Error,
            &format!("'{ident}' failed to start within {grace:?}"),
        );
        if let Some(killer) = shared.take_killer(&ident) {
            let _ = killer.send(());
        }
    }
}

/// Assemble the recursive `get_tree` snapshot
///
/// Leaf children contribute their state string; running tier children are
/// queried in parallel, with a timeout surfacing as the state string.
async fn build_tree(shared: &Arc<TierShared>) -> serde_json::Value {
    let targets = {
        let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
        children
            .iter()
            .map(|r| {
                let recurse = !r.spec().is_job()
                    && r.state() == ChildState::Started;
                (
                    r.ident().to_string(),
                    r.state().to_string(),
                    r.server_url().map(String::from).filter(|_| recurse),
                )
            })
            .collect::<Vec<_>>()
    };

    let subtrees = targets
        .into_iter()
        .map(|(ident, state, server)| async move {
            let value = match server {
                Some(server) => query_subtree(&server).await.unwrap_or_else(|e| {
                    debug!("get_tree for '{ident}' fell back to state: {e:#}");
                    serde_json::Value::String(state)
                }),
                None => serde_json::Value::String(state),
            };
            (ident, value)
        })
        .collect::<futures::stream::FuturesUnordered<_>>()
        .collect::<Vec<_>>()
        .await;

    serde_json::Value::Object(subtrees.into_iter().collect())
}

async fn query_subtree(server: &str) -> Result<serde_json::Value> {
    let client = Client::connect(&ws_url(server), Arc::new(NullHandler)).await?;
    client
        .request_timeout(
            ACTION_GET_TREE,
            serde_json::json!({}),
            Duration::from_secs(5),
        )
        .await
}

struct TierHandler(Arc<TierShared>);

#[async_trait::async_trait]
impl MessageHandler for TierHandler {
    async fn handle(&self, action: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        let shared = &self.0;
        match action {
            ACTION_REGISTER => {
                let register: RegisterPayload =
                    serde_json::from_value(payload).context("Decoding register payload")?;
                debug!("'{}' registered from {}", register.ident, register.server);
                shared
                    .children
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_mut(&register.ident)?
                    .register(&register.server)?;
                Ok(serde_json::json!({}))
            }

            ACTION_UPDATE => {
                let update: UpdatePayload =
                    serde_json::from_value(payload).context("Decoding update payload")?;
                shared
                    .children
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_mut(&update.ident)?
                    .update(update.metrics)?;
                Ok(serde_json::json!({}))
            }

            ACTION_COMPLETE => {
                let complete: CompletePayload =
                    serde_json::from_value(payload).context("Decoding complete payload")?;
                info!(
                    "'{}' completed: {} (exit {})",
                    complete.ident, complete.result, complete.code
                );
                shared
                    .children
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_mut(&complete.ident)?
                    .complete(complete.result, complete.code, complete.metrics)?;

                // Strictly after the COMPLETE transition, before anything
                // new launches in response.
                resolve_and_launch(shared).await;
                Ok(serde_json::json!({}))
            }

            ACTION_SPEC => {
                let spec: SpecPayload =
                    serde_json::from_value(payload).context("Decoding spec payload")?;
                let yaml = {
                    let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
                    crate::spec::to_yaml_string(children.get(&spec.ident)?.spec())?
                };
                Ok(serde_json::to_value(SpecReply { spec: yaml })?)
            }

            ACTION_CHILDREN => {
                let snapshot = shared
                    .children
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .snapshot();
                Ok(serde_json::to_value(snapshot)?)
            }

            ACTION_GET_TREE => Ok(build_tree(shared).await),

            ACTION_LOG => {
                let log: LogPayload =
                    serde_json::from_value(payload).context("Decoding log payload")?;
                shared.record_log(&log);
                Ok(serde_json::json!({}))
            }

            ACTION_STOP => {
                initiate_stop(shared).await;
                Ok(serde_json::json!({}))
            }

            other => Err(anyhow!("unknown action: {other}")),
        }
    }
}

/// One interior supervisor instance
pub struct Tier {
    ident: String,
    parent_url: Option<String>,
    root_spec: Option<SpecNode>,
    renderer: Option<LogRenderer>,
    scheduler: Arc<dyn Scheduler>,
    config: Configuration,
}

impl Tier {
    /// A tier launched by a parent tier; fetches its spec over the wire
    pub fn child(
        ident: String,
        parent_url: String,
        scheduler: Arc<dyn Scheduler>,
        config: Configuration,
    ) -> Self {
        Tier {
            ident,
            parent_url: Some(parent_url),
            root_spec: None,
            renderer: None,
            scheduler,
            config,
        }
    }

    /// The root tier; owns the console renderer and has no parent
    pub fn root(
        spec: SpecNode,
        renderer: LogRenderer,
        scheduler: Arc<dyn Scheduler>,
        config: Configuration,
    ) -> Self {
        Tier {
            ident: spec.ident().to_string(),
            parent_url: None,
            root_spec: Some(spec),
            renderer: Some(renderer),
            scheduler,
            config,
        }
    }

    /// Run the tier to completion; 0 iff every descendant succeeded
    pub async fn run(self) -> Result<i32> {
        // INIT
        let run_id = uuid::Uuid::new_v4();
        let state_dir = self
            .config
            .state_dir()
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("Creating state directory {}", state_dir.display()))?;
        let db_path = state_dir.join(format!("gator-{}-{}.db", self.ident, run_id));
        let store = LogStore::open(&db_path, self.config.store_timeout())?;

        let shared = Arc::new(TierShared {
            ident: self.ident.clone(),
            config: self.config.clone(),
            store: store.clone(),
            children: Mutex::new(ChildTable::default()),
            scheduler: self.scheduler.clone(),
            server_url: Mutex::new(String::new()),
            upward: Mutex::new(None),
            renderer: self.renderer.clone(),
            launch_lock: tokio::sync::Mutex::new(()),
            killers: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            done: Notify::new(),
        });
        let handler: Arc<dyn MessageHandler> = Arc::new(TierHandler(shared.clone()));
        let server = Server::bind(handler.clone()).await?;
        *shared.server_url.lock().unwrap_or_else(|e| e.into_inner()) = server.url();

        // CONNECT (the root loads its spec from disk instead)
        let spec = match &self.parent_url {
            Some(parent_url) => {
                info!("Registering '{}' with {parent_url}", self.ident);
                let client = Client::connect_with_backoff(
                    parent_url,
                    handler.clone(),
                    self.config.connect_attempts(),
                )
                .await?;
                *shared.upward.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(client.clone());

                client
                    .request(
                        ACTION_REGISTER,
                        serde_json::to_value(RegisterPayload {
                            ident: self.ident.clone(),
                            server: server.address(),
                        })?,
                    )
                    .await
                    .context("Registering with parent")?;

                let reply = client
                    .request(
                        ACTION_SPEC,
                        serde_json::to_value(SpecPayload {
                            ident: self.ident.clone(),
                        })?,
                    )
                    .await
                    .context("Fetching spec from parent")?;
                let text = serde_json::from_value::<SpecReply>(reply)
                    .context("Decoding spec reply")?
                    .spec;
                crate::spec::parse_str(&text)?
            }
            None => self
                .root_spec
                .clone()
                .ok_or_else(|| anyhow!("root tier constructed without a spec"))?,
        };

        // EXPAND
        if let Err(e) = self.expand_into(&shared, spec) {
            shared.log_own(Severity::Critical, &format!("{e:#}"));
            self.report_upward(&shared, ChildResult::Failure, 3).await;
            return Err(e);
        }

        // LAUNCH
        resolve_and_launch(&shared).await;

        // SUPERVISE
        let mut update_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.update_interval(),
            self.config.update_interval(),
        );
        loop {
            {
                let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
                if children.all_terminal() {
                    break;
                }
            }

            tokio::select! {
                _ = shared.done.notified() => (),
                _ = update_tick.tick() => {
                    sweep_connect_grace(&shared);
                    self.send_update(&shared);
                }
            }
        }

        // REPORT / EXIT
        let (result, aggregate) = {
            let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
            (children.overall_result(), children.aggregate())
        };
        let code = if result == ChildResult::Success { 0 } else { 1 };

        info!(
            "Tier '{}' finished: {result} ({} passed, {} failed of {})",
            self.ident, aggregate.sub_passed, aggregate.sub_failed, aggregate.sub_total
        );
        self.report_upward(&shared, result, code).await;

        if let Err(e) = store.flush().await {
            warn!("Flushing log store failed: {e:#}");
        }
        Ok(code)
    }

    fn expand_into(&self, shared: &Arc<TierShared>, spec: SpecNode) -> Result<()> {
        let node = match spec {
            SpecNode::Job(job) => {
                return crate::spec::spec_error(format!(
                    "tier '{}' was handed a job node: {}",
                    self.ident,
                    job.ident()
                ))
            }
            other => other,
        };

        let children = node.expand_children()?;
        validate_siblings(&children)?;
        debug!(
            "Tier '{}' expanded into {} children",
            self.ident,
            children.len()
        );

        let table = ChildTable::from_children(children)?;
        *shared.children.lock().unwrap_or_else(|e| e.into_inner()) = table;
        Ok(())
    }

    fn send_update(&self, shared: &Arc<TierShared>) {
        let client = match shared.upward() {
            Some(client) => client,
            None => return,
        };

        let metrics = {
            let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
            children.aggregate().into_metrics()
        };
        let payload = UpdatePayload {
            ident: self.ident.clone(),
            metrics,
        };

        tokio::spawn(async move {
            let value = match serde_json::to_value(&payload) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Encoding update payload failed: {e}");
                    return;
                }
            };
            if let Err(e) = client
                .request_timeout(ACTION_UPDATE, value, Duration::from_secs(5))
                .await
            {
                debug!("Heartbeat update failed: {e:#}");
            }
        });
    }

    async fn report_upward(&self, shared: &Arc<TierShared>, result: ChildResult, code: i32) {
        let client = match shared.upward() {
            Some(client) => client,
            None => return,
        };

        let metrics = {
            let children = shared.children.lock().unwrap_or_else(|e| e.into_inner());
            children.aggregate().into_metrics()
        };
        let payload = CompletePayload {
            ident: self.ident.clone(),
            result,
            code,
            metrics,
            db_file: shared.store.path().map(|p| p.display().to_string()),
        };

        let sent = match serde_json::to_value(&payload) {
            Ok(value) => {
                client
                    .request_timeout(ACTION_COMPLETE, value, self.config.report_timeout())
                    .await
            }
            Err(e) => Err(anyhow::Error::from(e)),
        };
        if let Err(e) = sent {
            warn!("Reporting completion of '{}' failed: {e:#}", self.ident);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::tier::children::tests::job_node;
    use crate::tier::children::tests::job_node_deps;

    /// Scheduler double that records launches and never finishes them
    struct RecordingScheduler {
        launched: Mutex<Vec<String>>,
    }

    impl RecordingScheduler {
        fn new() -> Arc<Self> {
            Arc::new(RecordingScheduler {
                launched: Mutex::new(Vec::new()),
            })
        }

        fn launched(&self) -> Vec<String> {
            self.launched.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Scheduler for RecordingScheduler {
        async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ProcessHandle>> {
            self.launched.lock().unwrap().push(request.ident().clone());
            Ok(Box::new(IdleHandle))
        }
    }

    struct IdleHandle;

    #[async_trait::async_trait]
    impl ProcessHandle for IdleHandle {
        async fn wait_for_exit(&mut self) -> Result<i32> {
            futures::future::pending().await
        }

        async fn terminate(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Configuration {
        let mut config = config::Config::default();
        config
            .merge(config::File::from_str("", config::FileFormat::Toml))
            .unwrap();
        config.try_into().unwrap()
    }

    fn shared_with(children: Vec<SpecNode>, scheduler: Arc<dyn Scheduler>) -> Arc<TierShared> {
        validate_siblings(&children).unwrap();
        Arc::new(TierShared {
            ident: String::from("t"),
            config: test_config(),
            store: LogStore::open_in_memory(Duration::from_secs(5)).unwrap(),
            children: Mutex::new(ChildTable::from_children(children).unwrap()),
            scheduler,
            server_url: Mutex::new(String::from("ws://127.0.0.1:1/")),
            upward: Mutex::new(None),
            renderer: None,
            launch_lock: tokio::sync::Mutex::new(()),
            killers: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
            done: Notify::new(),
        })
    }

    async fn drive(
        handler: &TierHandler,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        handler.handle(action, payload).await
    }

    #[tokio::test]
    async fn test_initial_launch_respects_dependencies() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(
            vec![job_node("a"), job_node_deps("b", &[], &["a"], &[])],
            scheduler.clone(),
        );

        resolve_and_launch(&shared).await;
        assert_eq!(scheduler.launched(), vec![String::from("a")]);

        let children = shared.children.lock().unwrap();
        assert_eq!(children.get("a").unwrap().state(), ChildState::Launched);
        assert_eq!(children.get("b").unwrap().state(), ChildState::Pending);
    }

    #[tokio::test]
    async fn test_complete_triggers_dependent_launch() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(
            vec![job_node("a"), job_node_deps("b", &[], &["a"], &[])],
            scheduler.clone(),
        );
        let handler = TierHandler(shared.clone());

        resolve_and_launch(&shared).await;
        drive(
            &handler,
            ACTION_REGISTER,
            serde_json::json!({"ident": "a", "server": "127.0.0.1:9001"}),
        )
        .await
        .unwrap();
        drive(
            &handler,
            ACTION_COMPLETE,
            serde_json::json!({"ident": "a", "result": "SUCCESS", "code": 0, "metrics": {}}),
        )
        .await
        .unwrap();

        assert_eq!(
            scheduler.launched(),
            vec![String::from("a"), String::from("b")]
        );
    }

    #[tokio::test]
    async fn test_failed_on_pass_dependency_aborts_without_launch() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(
            vec![job_node("a"), job_node_deps("b", &[], &["a"], &[])],
            scheduler.clone(),
        );
        let handler = TierHandler(shared.clone());

        resolve_and_launch(&shared).await;
        drive(
            &handler,
            ACTION_REGISTER,
            serde_json::json!({"ident": "a", "server": "127.0.0.1:9001"}),
        )
        .await
        .unwrap();
        drive(
            &handler,
            ACTION_COMPLETE,
            serde_json::json!({"ident": "a", "result": "FAILURE", "code": 1, "metrics": {}}),
        )
        .await
        .unwrap();

        // b was never handed to the scheduler.
        assert_eq!(scheduler.launched(), vec![String::from("a")]);

        let children = shared.children.lock().unwrap();
        let b = children.get("b").unwrap();
        assert_eq!(b.result(), ChildResult::Aborted);
        assert!(children.all_terminal());
        assert_eq!(children.overall_result(), ChildResult::Failure);
    }

    #[tokio::test]
    async fn test_on_fail_child_runs_after_failure() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(
            vec![job_node("a"), job_node_deps("b", &[], &[], &["a"])],
            scheduler.clone(),
        );
        let handler = TierHandler(shared.clone());

        resolve_and_launch(&shared).await;
        drive(
            &handler,
            ACTION_REGISTER,
            serde_json::json!({"ident": "a", "server": "127.0.0.1:9001"}),
        )
        .await
        .unwrap();
        drive(
            &handler,
            ACTION_COMPLETE,
            serde_json::json!({"ident": "a", "result": "FAILURE", "code": 1, "metrics": {}}),
        )
        .await
        .unwrap();

        assert_eq!(
            scheduler.launched(),
            vec![String::from("a"), String::from("b")]
        );
    }

    #[tokio::test]
    async fn test_update_from_unlaunched_child_is_rejected() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(vec![job_node("a")], scheduler.clone());
        let handler = TierHandler(shared.clone());

        let err = drive(
            &handler,
            ACTION_UPDATE,
            serde_json::json!({"ident": "a", "metrics": {}}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("protocol error"));

        let err = drive(
            &handler,
            ACTION_UPDATE,
            serde_json::json!({"ident": "ghost", "metrics": {}}),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unknown child"));
    }

    #[tokio::test]
    async fn test_second_complete_is_rejected() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(vec![job_node("a")], scheduler.clone());
        let handler = TierHandler(shared.clone());

        resolve_and_launch(&shared).await;
        drive(
            &handler,
            ACTION_REGISTER,
            serde_json::json!({"ident": "a", "server": "127.0.0.1:9001"}),
        )
        .await
        .unwrap();

        let complete = serde_json::json!({"ident": "a", "result": "SUCCESS", "code": 0, "metrics": {}});
        drive(&handler, ACTION_COMPLETE, complete.clone())
            .await
            .unwrap();
        assert!(drive(&handler, ACTION_COMPLETE, complete).await.is_err());
    }

    #[tokio::test]
    async fn test_spec_action_serves_child_spec() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(vec![job_node("a")], scheduler.clone());
        let handler = TierHandler(shared.clone());

        let reply = drive(&handler, ACTION_SPEC, serde_json::json!({"ident": "a"}))
            .await
            .unwrap();
        let spec: SpecReply = serde_json::from_value(reply).unwrap();
        let node = crate::spec::parse_str(&spec.spec).unwrap();
        assert_eq!(node.ident(), "a");
        assert!(node.is_job());
    }

    #[tokio::test]
    async fn test_stop_aborts_pending_children() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(
            vec![job_node("a"), job_node_deps("b", &["a"], &[], &[])],
            scheduler.clone(),
        );
        let handler = TierHandler(shared.clone());

        resolve_and_launch(&shared).await;
        drive(&handler, ACTION_STOP, serde_json::json!({}))
            .await
            .unwrap();

        let children = shared.children.lock().unwrap();
        assert_eq!(children.get("b").unwrap().result(), ChildResult::Aborted);
        // a is launched and still running; only pending children were
        // discarded.
        assert_eq!(children.get("a").unwrap().state(), ChildState::Launched);
    }

    #[tokio::test]
    async fn test_rootify_wraps_bare_job() {
        let node = crate::spec::parse_str("!Job\nident: hello\ncommand: echo\n").unwrap();
        let root = rootify(node);
        match &root {
            SpecNode::Group(group) => {
                assert_eq!(group.ident(), "hello");
                assert_eq!(group.jobs().len(), 1);
            }
            other => panic!("Expected group, got {other:?}"),
        }
        assert_eq!(root.leaf_count(), 1);
    }

    #[tokio::test]
    async fn test_get_tree_uses_state_strings_for_leaves() {
        let scheduler = RecordingScheduler::new();
        let shared = shared_with(
            vec![job_node("a"), job_node("b")],
            scheduler.clone(),
        );
        let handler = TierHandler(shared.clone());

        resolve_and_launch(&shared).await;
        let tree = drive(&handler, ACTION_GET_TREE, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(tree["a"], "LAUNCHED");
        assert_eq!(tree["b"], "LAUNCHED");
    }
}

