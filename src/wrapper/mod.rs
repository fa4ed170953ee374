//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

//! The wrapper: supervisor of exactly one job process
//!
//! Lifecycle: INIT (store + server) → CONNECT (register upward) → EXEC
//! (fetch spec, spawn the job) → MONITOR (capture output, sample
//! resources, heartbeat) → REPORT (graceful-then-forced shutdown ladder)
//! → EXIT (final `complete`, mirror the job's exit code).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use tokio::sync::Notify;

use crate::config::Configuration;
use crate::protocol::message::CompletePayload;
use crate::protocol::message::LogPayload;
use crate::protocol::message::MetricPayload;
use crate::protocol::message::RegisterPayload;
use crate::protocol::message::SpecPayload;
use crate::protocol::message::SpecReply;
use crate::protocol::message::UpdatePayload;
use crate::protocol::message::ACTION_COMPLETE;
use crate::protocol::message::ACTION_LOG;
use crate::protocol::message::ACTION_METRIC;
use crate::protocol::message::ACTION_REGISTER;
use crate::protocol::message::ACTION_SPEC;
use crate::protocol::message::ACTION_STOP;
use crate::protocol::message::ACTION_UPDATE;
use crate::protocol::Client;
use crate::protocol::MessageHandler;
use crate::protocol::Server;
use crate::sched::exit_code;
use crate::spec::Job;
use crate::spec::SpecNode;
use crate::store::LogStore;
use crate::store::ResourceSample;
use crate::store::Severity;
use crate::tier::ChildResult;
use crate::util::expand_env_refs;
use crate::util::now_ts;

mod output;
mod sampler;

pub use output::CapturedLine;
pub use output::LineClassifier;
use sampler::ResourceSampler;

const METRIC_CPU_MAX: &str = "cpu_percent_max";
const METRIC_RSS_MAX: &str = "rss_bytes_max";

/// State shared between the protocol handler and the monitor loop
struct Shared {
    ident: String,
    store: LogStore,
    metrics: Mutex<BTreeMap<String, i64>>,
    has_error: AtomicBool,
    upward: Mutex<Option<Client>>,
    stop: Notify,
    stopping: AtomicBool,
}

impl Shared {
    /// Append one log entry locally and forward it upward unchanged
    ///
    /// Timestamp and severity survive the boundary; the local store
    /// assigns its own uid.
    fn record_entry(&self, origin: &str, timestamp: i64, severity: Severity, message: &str) {
        {
            let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
            *metrics.entry(severity.counter_name().to_string()).or_insert(0) += 1;
        }
        if severity >= Severity::Error {
            self.has_error.store(true, Ordering::SeqCst);
        }

        self.store.append_entry(timestamp, severity, message);

        let payload = LogPayload {
            origin: origin.to_string(),
            timestamp,
            severity,
            message: message.to_string(),
        };
        if let Some(client) = &*self.upward.lock().unwrap_or_else(|e| e.into_inner()) {
            match serde_json::to_value(&payload) {
                Ok(value) => {
                    if let Err(e) = client.post(ACTION_LOG, value) {
                        debug!("Forwarding log entry failed: {e:#}");
                    }
                }
                Err(e) => warn!("Encoding log payload failed: {e}"),
            }
        }
    }

    fn record_line(&self, line: &CapturedLine) {
        self.record_entry(&self.ident, line.timestamp, line.severity, &line.message)
    }

    fn set_metric(&self, name: &str, value: i64) {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value);
        self.store.upsert_metric(name, value, now_ts());
    }

    fn raise_metric(&self, name: &str, value: i64) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let slot = metrics.entry(name.to_string()).or_insert(i64::MIN);
        if value > *slot {
            *slot = value;
            self.store.upsert_metric(name, value, now_ts());
        }
    }

    fn observe_sample(&self, sample: &ResourceSample) {
        self.store.append_resource(sample.clone());
        self.raise_metric(METRIC_CPU_MAX, sample.cpu_percent.round() as i64);
        self.raise_metric(METRIC_RSS_MAX, sample.rss_bytes as i64);
    }

    fn metrics_snapshot(&self) -> BTreeMap<String, i64> {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

struct WrapperHandler(Arc<Shared>);

#[async_trait::async_trait]
impl MessageHandler for WrapperHandler {
    async fn handle(&self, action: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
        match action {
            ACTION_METRIC => {
                let metric: MetricPayload =
                    serde_json::from_value(payload).context("Decoding metric payload")?;
                if metric.name.starts_with("sub_") {
                    return Err(anyhow!(
                        "metric name '{}' collides with the reserved sub_ namespace",
                        metric.name
                    ));
                }
                self.0.set_metric(&metric.name, metric.value);
                Ok(serde_json::json!({}))
            }

            ACTION_LOG => {
                let log: LogPayload =
                    serde_json::from_value(payload).context("Decoding log payload")?;
                self.0
                    .record_entry(&log.origin, log.timestamp, log.severity, &log.message);
                Ok(serde_json::json!({}))
            }

            ACTION_STOP => {
                info!("Stop requested for '{}'", self.0.ident);
                self.0.stopping.store(true, Ordering::SeqCst);
                self.0.stop.notify_waiters();
                Ok(serde_json::json!({}))
            }

            other => Err(anyhow!("unknown action: {other}")),
        }
    }
}

pub struct Wrapper {
    ident: String,
    parent_url: String,
    config: Configuration,
}

impl Wrapper {
    pub fn new(ident: String, parent_url: String, config: Configuration) -> Self {
        Wrapper {
            ident,
            parent_url,
            config,
        }
    }

    /// Run the wrapper to completion, returning the exit code to mirror
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
        let classifier = Arc::new(LineClassifier::from_rules(self.config.classify())?);

        let shared = Arc::new(Shared {
            ident: self.ident.clone(),
            store: store.clone(),
            metrics: Mutex::new(BTreeMap::new()),
            has_error: AtomicBool::new(false),
            upward: Mutex::new(None),
            stop: Notify::new(),
            stopping: AtomicBool::new(false),
        });
        let handler: Arc<dyn MessageHandler> = Arc::new(WrapperHandler(shared.clone()));
        let server = Server::bind(handler.clone()).await?;

        // CONNECT
        info!("Registering '{}' with {}", self.ident, self.parent_url);
        let client = Client::connect_with_backoff(
            &self.parent_url,
            handler.clone(),
            self.config.connect_attempts(),
        )
        .await?;
        *shared.upward.lock().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());

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

        // EXEC
        let reply = client
            .request(
                ACTION_SPEC,
                serde_json::to_value(SpecPayload {
                    ident: self.ident.clone(),
                })?,
            )
            .await
            .context("Fetching job spec from parent")?;
        let spec_text = serde_json::from_value::<SpecReply>(reply)
            .context("Decoding spec reply")?
            .spec;
        let job = match crate::spec::parse_str(&spec_text)? {
            SpecNode::Job(job) => job,
            other => {
                return crate::spec::spec_error(format!(
                    "wrapper '{}' was handed a non-job node: {}",
                    self.ident,
                    other.ident()
                ))
            }
        };

        let env = effective_env(&job, &self.ident, &server.url());
        let lookup = |name: &str| env.get(name).cloned();
        let command = expand_env_refs(job.command(), lookup);
        let args = job
            .args()
            .iter()
            .map(|arg| expand_env_refs(arg, lookup))
            .collect::<Vec<_>>();
        let cwd = job
            .cwd()
            .as_ref()
            .map(|c| PathBuf::from(expand_env_refs(&c.display().to_string(), lookup)));

        let program = if command.contains(std::path::MAIN_SEPARATOR) {
            PathBuf::from(&command)
        } else {
            match which::which(&command) {
                Ok(path) => path,
                Err(e) => {
                    return self
                        .fail_before_spawn(
                            &shared,
                            &client,
                            127,
                            &format!("command '{command}' not found: {e}"),
                        )
                        .await
                }
            }
        };

        debug!("Spawning {} {:?} for '{}'", program.display(), args, self.ident);
        let mut spawn = tokio::process::Command::new(&program);
        spawn
            .args(&args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cwd {
            spawn.current_dir(cwd);
        }

        let mut child = match spawn.spawn() {
            Ok(child) => child,
            Err(e) => {
                return self
                    .fail_before_spawn(
                        &shared,
                        &client,
                        127,
                        &format!("spawning '{command}' failed: {e}"),
                    )
                    .await
            }
        };

        // MONITOR
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("job process has no stdout pipe"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("job process has no stderr pipe"))?;

        let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(output::drain(
            stdout,
            Severity::Info,
            classifier.clone(),
            line_tx.clone(),
        ));
        tokio::spawn(output::drain(stderr, Severity::Error, classifier, line_tx));

        let mut sampler =
            ResourceSampler::new(child.id().unwrap_or(0), self.config.sample_descendants());

        let start = tokio::time::Instant::now();
        let mut sample_tick =
            tokio::time::interval_at(start + self.config.sample_interval(), self.config.sample_interval());
        let mut update_tick =
            tokio::time::interval_at(start + self.config.update_interval(), self.config.update_interval());

        let mut code: Option<i32> = None;
        let mut lines_done = false;
        let mut stopped = false;

        loop {
            if shared.stopping.load(Ordering::SeqCst) {
                stopped = true;
            }
            if stopped && code.is_none() {
                break;
            }
            if code.is_some() && lines_done {
                break;
            }

            tokio::select! {
                maybe_line = line_rx.recv(), if !lines_done => match maybe_line {
                    Some(line) => shared.record_line(&line),
                    None => lines_done = true,
                },

                status = child.wait(), if code.is_none() => {
                    let status = status.context("Waiting for job process")?;
                    debug!("Job '{}' exited: {status}", self.ident);
                    code = Some(exit_code(status));
                },

                _ = sample_tick.tick() => {
                    if let Some(sample) = sampler.sample() {
                        shared.observe_sample(&sample);
                    }
                },

                _ = update_tick.tick() => {
                    send_update(&self.ident, &shared, &client);
                },

                _ = shared.stop.notified() => stopped = true,
            }
        }

        // REPORT: close stdin, then escalate until the job is gone.
        if code.is_none() {
            info!("Shutting down job '{}'", self.ident);
            drop(child.stdin.take());

            code = Some(
                match tokio::time::timeout(self.config.term_grace(), child.wait()).await {
                    Ok(status) => exit_code(status.context("Waiting for job process")?),
                    Err(_) => {
                        if let Some(pid) = child.id() {
                            debug!("Sending SIGTERM to {pid}");
                            unsafe {
                                libc::kill(pid as libc::pid_t, libc::SIGTERM);
                            }
                        }
                        match tokio::time::timeout(self.config.kill_grace(), child.wait()).await {
                            Ok(status) => exit_code(status.context("Waiting for job process")?),
                            Err(_) => {
                                warn!("Job '{}' survived SIGTERM, killing it", self.ident);
                                let _ = child.kill().await;
                                exit_code(child.wait().await.context("Waiting for killed job")?)
                            }
                        }
                    }
                },
            );
        }

        // The pipes are closed now; collect whatever the drains still hold.
        if !lines_done {
            while let Some(line) = line_rx.recv().await {
                shared.record_line(&line);
            }
        }

        // EXIT
        let code = code.unwrap_or(-1);
        let result = if code == 0 && !shared.has_error.load(Ordering::SeqCst) {
            ChildResult::Success
        } else {
            ChildResult::Failure
        };

        self.report_complete(&shared, &client, result, code).await;
        info!("Job '{}' finished: {result} (exit {code})", self.ident);
        Ok(code)
    }

    async fn fail_before_spawn(
        &self,
        shared: &Arc<Shared>,
        client: &Client,
        code: i32,
        message: &str,
    ) -> Result<i32> {
        shared.record_entry(&self.ident, now_ts(), Severity::Critical, message);
        self.report_complete(shared, client, ChildResult::Failure, code)
            .await;
        Ok(code)
    }

    async fn report_complete(
        &self,
        shared: &Arc<Shared>,
        client: &Client,
        result: ChildResult,
        code: i32,
    ) {
        if let Err(e) = shared.store.flush().await {
            warn!("Flushing log store failed: {e:#}");
        }

        let payload = CompletePayload {
            ident: self.ident.clone(),
            result,
            code,
            metrics: shared.metrics_snapshot(),
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

/// Construct the job's effective environment: the inherited environment,
/// overlaid with the job's `env` block, plus the wrapper's injections.
/// Job-provided values are expanded against the combined map.
fn effective_env(job: &Job, ident: &str, wrapper_url: &str) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    env.extend(job.env().clone());
    env.insert(String::from("GATOR_PARENT"), wrapper_url.to_string());
    env.insert(String::from("GATOR_IDENT"), ident.to_string());

    let reference = env.clone();
    for key in job.env().keys() {
        if let Some(value) = env.get(key).cloned() {
            env.insert(
                key.clone(),
                expand_env_refs(&value, |name| reference.get(name).cloned()),
            );
        }
    }

    env
}

fn send_update(ident: &str, shared: &Arc<Shared>, client: &Client) {
    let payload = UpdatePayload {
        ident: ident.to_string(),
        metrics: shared.metrics_snapshot(),
    };
    let client = client.clone();
    tokio::spawn(async move {
        let value = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Encoding update payload failed: {e}");
                return;
            }
        };
        if let Err(e) = client
            .request_timeout(ACTION_UPDATE, value, std::time::Duration::from_secs(5))
            .await
        {
            debug!("Heartbeat update failed: {e:#}");
        }
    });
}
