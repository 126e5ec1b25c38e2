//! In-memory network and runtime builders for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, StatusCode};
use swkit_net::{Fetcher, NetError, Request, Response};
use tokio::sync::{mpsc, Notify};
use url::Url;

use crate::config::WorkerConfig;
use crate::runtime::{WorkerEvent, WorkerRuntime};

pub(crate) const SHELL_HTML: &str = "<!doctype html><title>Slope</title>";

enum Script {
    Respond(StatusCode, Bytes),
    Fail,
}

/// Blocks the next fetch of a URL until released.
pub(crate) struct Gate(Arc<Notify>);

impl Gate {
    pub(crate) fn release(&self) {
        self.0.notify_one();
    }
}

/// A [`Fetcher`] that answers from a script. Unscripted URLs fail as if
/// offline.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    requests: Mutex<Vec<Request>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(&self, url: &Url, status: u16, body: &str) {
        let status = StatusCode::from_u16(status).unwrap();
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), Script::Respond(status, Bytes::from(body.to_string())));
    }

    pub(crate) fn fail(&self, url: &Url) {
        self.scripts.lock().unwrap().insert(url.to_string(), Script::Fail);
    }

    pub(crate) fn hold(&self, url: &Url) -> Gate {
        let notify = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(url.to_string(), notify.clone());
        Gate(notify)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let key = request.url.to_string();
        let gate = self.gates.lock().unwrap().remove(&key);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let scripts = self.scripts.lock().unwrap();
        match scripts.get(&key) {
            Some(Script::Respond(status, body)) => {
                Ok(Response::new(*status, HeaderMap::new(), body.clone()).with_url(request.url))
            }
            Some(Script::Fail) | None => Err(NetError::RequestFailed(format!("offline: {key}"))),
        }
    }
}

/// Script every precache URL of the default config.
pub(crate) fn script_precache(fetcher: &ScriptedFetcher) {
    let config = WorkerConfig::default();
    for bucket in &config.buckets {
        for entry in &bucket.precache {
            let url = config.resolve(entry).unwrap();
            let body = match entry.as_str() {
                "/" | "/index.html" => SHELL_HTML,
                _ => "asset",
            };
            fetcher.respond(&url, 200, body);
        }
    }
}

pub(crate) fn runtime_with_config(
    config: WorkerConfig,
    fetcher: Arc<ScriptedFetcher>,
) -> (WorkerRuntime, mpsc::UnboundedReceiver<WorkerEvent>) {
    WorkerRuntime::new(config, fetcher).unwrap()
}

pub(crate) fn runtime_with(fetcher: Arc<ScriptedFetcher>) -> (WorkerRuntime, mpsc::UnboundedReceiver<WorkerEvent>) {
    runtime_with_config(WorkerConfig::default(), fetcher)
}

/// A runtime that has precached the default manifest and is serving.
pub(crate) async fn active_runtime(fetcher: Arc<ScriptedFetcher>) -> WorkerRuntime {
    script_precache(&fetcher);
    let (runtime, _events) = runtime_with(fetcher);
    runtime.install().await.unwrap();
    runtime
}
