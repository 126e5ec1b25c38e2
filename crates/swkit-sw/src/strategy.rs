//! Per-request strategy selection and execution.
//!
//! Classification (first match wins):
//!
//! 1. non-GET or non-http(s): not intercepted
//! 2. navigation or `Accept: text/html`: network-first on `core`
//! 3. same origin: cache-first on `core`
//! 4. configured game asset: stale-while-revalidate on `game`
//! 5. anything else: network-first on `core`
//!
//! Only 2xx responses are stored. Every stored response is a clone taken
//! before the original goes back to the requester. Concurrent writes for the
//! same key are last-writer-wins.

use std::time::Instant;

use http::StatusCode;
use swkit_net::{NetError, Request, Response, UrlPattern};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{BucketName, MatchScope, RequestKey};
use crate::config::{CORE_BUCKET, GAME_BUCKET};
use crate::lifecycle::LifecycleState;
use crate::runtime::WorkerRuntime;

/// Caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    NetworkFirst,
    CacheFirst,
    StaleWhileRevalidate,
}

/// Result of classifying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Leave the request to default network handling.
    Passthrough,
    Handle {
        strategy: Strategy,
        /// Logical bucket name.
        bucket: &'static str,
        /// Top-level document: falls back to the cached root when offline.
        document: bool,
    },
}

/// Pick a strategy for `request`. Pure: depends only on the request, the
/// worker origin and the game asset patterns.
pub fn classify(request: &Request, origin: &Url, game_assets: &[UrlPattern]) -> Route {
    if request.method != http::Method::GET || !request.is_http() {
        return Route::Passthrough;
    }

    if request.is_navigation() || request.accepts_html() {
        return Route::Handle {
            strategy: Strategy::NetworkFirst,
            bucket: CORE_BUCKET,
            document: true,
        };
    }

    if request.url.origin() == origin.origin() {
        return Route::Handle {
            strategy: Strategy::CacheFirst,
            bucket: CORE_BUCKET,
            document: false,
        };
    }

    if game_assets.iter().any(|p| p.matches(&request.url)) {
        return Route::Handle {
            strategy: Strategy::StaleWhileRevalidate,
            bucket: GAME_BUCKET,
            document: false,
        };
    }

    Route::Handle {
        strategy: Strategy::NetworkFirst,
        bucket: CORE_BUCKET,
        document: false,
    }
}

/// A spawned task nobody waits on.
///
/// Dropping the handle does not cancel the task; [`DetachedTask::join`] is
/// there for hosts and tests that want to observe completion.
#[derive(Debug)]
pub struct DetachedTask {
    handle: JoinHandle<()>,
}

impl DetachedTask {
    fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to finish.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Detached task panicked or was aborted");
        }
    }
}

/// The response chosen for an intercepted request.
#[derive(Debug)]
pub struct FetchResponse {
    pub response: Response,
    pub strategy: Strategy,
    /// Background refresh started by stale-while-revalidate.
    pub revalidation: Option<DetachedTask>,
}

/// What the host should do with a fetch event.
#[derive(Debug)]
pub enum FetchDisposition {
    /// Not intercepted: perform the request normally.
    Passthrough,
    Respond(FetchResponse),
}

impl FetchDisposition {
    pub fn into_response(self) -> Option<FetchResponse> {
        match self {
            FetchDisposition::Passthrough => None,
            FetchDisposition::Respond(r) => Some(r),
        }
    }
}

impl WorkerRuntime {
    /// Handle an intercepted request. Always yields a response for
    /// intercepted requests; network failures become cached or synthetic
    /// responses.
    pub async fn handle_fetch(&self, request: Request) -> FetchDisposition {
        if self.state().await != LifecycleState::Active {
            trace!(url = %request.url, "Worker not active, passing through");
            return FetchDisposition::Passthrough;
        }

        let (strategy, bucket, document) =
            match classify(&request, &self.config.origin, &self.config.game_assets) {
                Route::Passthrough => {
                    trace!(url = %request.url, method = %request.method, "Not intercepted");
                    return FetchDisposition::Passthrough;
                }
                Route::Handle {
                    strategy,
                    bucket,
                    document,
                } => (strategy, self.config.bucket_name(bucket), document),
            };

        // GET is guaranteed by classification.
        let Some(key) = RequestKey::for_request(&request) else {
            return FetchDisposition::Passthrough;
        };
        debug!(url = %request.url, ?strategy, bucket = %bucket, "Handling fetch");

        let (response, revalidation) = match strategy {
            Strategy::NetworkFirst => (self.network_first(request, &bucket, key, document).await, None),
            Strategy::CacheFirst => (self.cache_first(request, &bucket, key).await, None),
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request, &bucket, key).await,
        };

        FetchDisposition::Respond(FetchResponse {
            response,
            strategy,
            revalidation,
        })
    }

    async fn network_first(&self, request: Request, bucket: &BucketName, key: RequestKey, document: bool) -> Response {
        match self.fetch_from_network(request).await {
            Ok(response) => {
                self.store_if_ok(bucket, &key, &response).await;
                response
            }
            Err(e) => {
                warn!(url = %key.url, error = %e, "Network request failed, trying cache");

                if let Some(cached) = self.cached(MatchScope::All, &key).await {
                    return cached;
                }
                if document {
                    if let Some(root) = self.cached_root_document().await {
                        return root;
                    }
                    return Response::synthetic(StatusCode::SERVICE_UNAVAILABLE, &self.config.offline.document);
                }
                Response::synthetic(StatusCode::SERVICE_UNAVAILABLE, &self.config.offline.resource)
            }
        }
    }

    async fn cache_first(&self, request: Request, bucket: &BucketName, key: RequestKey) -> Response {
        if let Some(cached) = self.cached(MatchScope::All, &key).await {
            trace!(url = %key.url, "Cache hit");
            return cached;
        }

        match self.fetch_from_network(request).await {
            Ok(response) => {
                self.store_if_ok(bucket, &key, &response).await;
                response
            }
            Err(e) => {
                warn!(url = %key.url, error = %e, "Resource unavailable");
                Response::synthetic(StatusCode::NOT_FOUND, &self.config.offline.resource)
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        request: Request,
        bucket: &BucketName,
        key: RequestKey,
    ) -> (Response, Option<DetachedTask>) {
        if let Some(cached) = self.cached(MatchScope::Bucket(bucket), &key).await {
            let runtime = self.clone();
            let bucket = bucket.clone();
            let refresh = DetachedTask::spawn(async move {
                match runtime.fetch_from_network(request).await {
                    Ok(response) => runtime.store_if_ok(&bucket, &key, &response).await,
                    Err(e) => warn!(url = %key.url, error = %e, "Background refresh failed"),
                }
            });
            return (cached, Some(refresh));
        }

        let response = match self.fetch_from_network(request).await {
            Ok(response) => {
                self.store_if_ok(bucket, &key, &response).await;
                response
            }
            Err(e) => {
                warn!(url = %key.url, error = %e, "Game resource unavailable");
                Response::synthetic(StatusCode::SERVICE_UNAVAILABLE, &self.config.offline.game)
            }
        };
        (response, None)
    }

    /// Fetch through the configured fetcher, logging slow requests.
    pub(crate) async fn fetch_from_network(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.clone();
        let started = Instant::now();
        let result = self.fetcher.fetch(request).await;

        let elapsed = started.elapsed();
        if elapsed > self.config.slow_request_threshold() {
            warn!(url = %url, elapsed_ms = elapsed.as_millis() as u64, "Slow request");
        }
        result
    }

    /// Store a clone of `response` if it is 2xx. Storage failures are logged
    /// and otherwise ignored.
    pub(crate) async fn store_if_ok(&self, bucket: &BucketName, key: &RequestKey, response: &Response) {
        if !response.ok() {
            trace!(url = %key.url, status = %response.status, "Not caching error response");
            return;
        }
        let copy = match response.try_clone() {
            Ok(copy) => copy,
            Err(e) => {
                warn!(url = %key.url, error = %e, "Cannot clone response for caching");
                return;
            }
        };
        if let Err(e) = self.caches.write().await.put(bucket, key.clone(), copy) {
            warn!(bucket = %bucket, url = %key.url, error = %e, "Cache write failed");
        }
    }

    async fn cached(&self, scope: MatchScope<'_>, key: &RequestKey) -> Option<Response> {
        self.caches
            .read()
            .await
            .match_request(scope, key)
            .map(|entry| entry.to_response())
    }

    async fn cached_root_document(&self) -> Option<Response> {
        for path in &self.config.navigation_fallbacks {
            let Ok(url) = self.config.resolve(path) else {
                continue;
            };
            if let Some(root) = self.cached(MatchScope::All, &RequestKey::get(&url)).await {
                debug!(fallback = %url, "Serving cached root document");
                return Some(root);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::test_support::{runtime_with, runtime_with_config, script_precache, ScriptedFetcher};
    use http::{header, HeaderValue};
    use std::sync::Arc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn origin() -> Url {
        url("http://localhost:8000/")
    }

    fn game() -> Vec<UrlPattern> {
        vec![UrlPattern::prefix("https://slopeunblocked.bitbucket.io/file/")]
    }

    fn strategy_of(route: Route) -> Option<Strategy> {
        match route {
            Route::Passthrough => None,
            Route::Handle { strategy, .. } => Some(strategy),
        }
    }

    #[test]
    fn test_classify_passthrough() {
        let post = Request::post(url("http://localhost:8000/api"), "{}".into());
        assert_eq!(classify(&post, &origin(), &game()), Route::Passthrough);

        let ext = Request::get(url("chrome-extension://abc/inject.js"));
        assert_eq!(classify(&ext, &origin(), &game()), Route::Passthrough);
    }

    #[test]
    fn test_classify_navigation_beats_same_origin() {
        let nav = Request::navigate(url("http://localhost:8000/"));
        assert_eq!(
            classify(&nav, &origin(), &game()),
            Route::Handle {
                strategy: Strategy::NetworkFirst,
                bucket: CORE_BUCKET,
                document: true,
            }
        );
    }

    #[test]
    fn test_classify_html_accept_on_cross_origin() {
        let req = Request::get(url("https://slopeunblocked.bitbucket.io/file/index.html"))
            .header(header::ACCEPT, HeaderValue::from_static("text/html"));
        assert_eq!(strategy_of(classify(&req, &origin(), &game())), Some(Strategy::NetworkFirst));
    }

    #[test]
    fn test_classify_same_origin_and_game_and_other() {
        let own = Request::get(url("http://localhost:8000/icons/icon-192x192.png"));
        assert_eq!(strategy_of(classify(&own, &origin(), &game())), Some(Strategy::CacheFirst));

        let asset = Request::get(url("https://slopeunblocked.bitbucket.io/file/Build/slope.wasm"));
        assert_eq!(
            classify(&asset, &origin(), &game()),
            Route::Handle {
                strategy: Strategy::StaleWhileRevalidate,
                bucket: GAME_BUCKET,
                document: false,
            }
        );

        let other = Request::get(url("https://fonts.example/inter.woff2"));
        assert_eq!(
            classify(&other, &origin(), &game()),
            Route::Handle {
                strategy: Strategy::NetworkFirst,
                bucket: CORE_BUCKET,
                document: false,
            }
        );
    }

    #[tokio::test]
    async fn test_inactive_worker_passes_through() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let (runtime, _events) = runtime_with(fetcher.clone());

        let disposition = runtime
            .handle_fetch(Request::get(url("http://localhost:8000/app.js")))
            .await;
        assert!(matches!(disposition, FetchDisposition::Passthrough));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        let app = url("http://localhost:8000/app.js");
        fetcher.respond(&app, 200, "v1");

        let mut first = runtime.handle_fetch(Request::get(app.clone())).await.into_response().unwrap();
        assert_eq!(first.strategy, Strategy::CacheFirst);
        assert_eq!(first.response.text().unwrap(), "v1");
        assert!(!first.response.from_cache);

        fetcher.respond(&app, 200, "v2");
        let calls = fetcher.calls();
        let mut second = runtime.handle_fetch(Request::get(app)).await.into_response().unwrap();
        assert!(second.response.from_cache);
        assert_eq!(second.response.text().unwrap(), "v1");
        assert_eq!(fetcher.calls(), calls);
    }

    #[tokio::test]
    async fn test_cache_first_offline_miss_is_404() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;

        let mut result = runtime
            .handle_fetch(Request::get(url("http://localhost:8000/missing.css")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(result.response.status, StatusCode::NOT_FOUND);
        assert_eq!(result.response.text().unwrap(), "Resource not available");
    }

    #[tokio::test]
    async fn test_error_responses_are_returned_not_stored() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        let missing = url("http://localhost:8000/gone.png");
        fetcher.respond(&missing, 404, "nope");

        let result = runtime.handle_fetch(Request::get(missing.clone())).await.into_response().unwrap();
        assert_eq!(result.response.status, StatusCode::NOT_FOUND);
        assert!(runtime
            .caches
            .read()
            .await
            .match_request(MatchScope::All, &RequestKey::get(&missing))
            .is_none());
    }

    #[tokio::test]
    async fn test_network_first_updates_cache_then_serves_it_offline() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        let font = url("https://fonts.example/inter.woff2");
        fetcher.respond(&font, 200, "font-v1");

        let mut online = runtime.handle_fetch(Request::get(font.clone())).await.into_response().unwrap();
        assert_eq!(online.strategy, Strategy::NetworkFirst);
        assert_eq!(online.response.text().unwrap(), "font-v1");

        fetcher.fail(&font);
        let mut offline = runtime.handle_fetch(Request::get(font)).await.into_response().unwrap();
        assert!(offline.response.from_cache);
        assert_eq!(offline.response.text().unwrap(), "font-v1");
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_serves_network_response() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        let fetcher = Arc::new(ScriptedFetcher::new());
        script_precache(&fetcher);
        let config = WorkerConfig {
            storage_dir: Some(root.clone()),
            ..WorkerConfig::default()
        };
        let (runtime, _events) = runtime_with_config(config, fetcher.clone());
        runtime.install().await.unwrap();

        // Every later write fails: the storage directory is now a file.
        std::fs::remove_dir_all(&root).unwrap();
        std::fs::write(&root, b"").unwrap();

        let app = url("http://localhost:8000/app.js");
        let font = url("https://fonts.example/inter.woff2");
        let level = url("https://slopeunblocked.bitbucket.io/file/level.bin");
        for (target, strategy) in [
            (&app, Strategy::CacheFirst),
            (&font, Strategy::NetworkFirst),
            (&level, Strategy::StaleWhileRevalidate),
        ] {
            fetcher.respond(target, 200, "live");
            let mut result = runtime
                .handle_fetch(Request::get(target.clone()))
                .await
                .into_response()
                .unwrap();
            assert_eq!(result.strategy, strategy);
            assert_eq!(result.response.status, StatusCode::OK);
            assert!(!result.response.from_cache);
            assert_eq!(result.response.text().unwrap(), "live");
            assert!(runtime.cached(MatchScope::All, &RequestKey::get(target)).await.is_none());
        }

        // Nothing was stored, so a repeat goes back to the network.
        let calls = fetcher.calls();
        runtime.handle_fetch(Request::get(app)).await;
        assert_eq!(fetcher.calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_network_first_offline_miss_is_503() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;

        let mut result = runtime
            .handle_fetch(Request::get(url("https://fonts.example/missing.woff2")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(result.response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(result.response.text().unwrap(), "Resource not available");
    }

    #[tokio::test]
    async fn test_failed_navigation_prefers_exact_match() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        let play = url("http://localhost:8000/play.html");
        fetcher.respond(&play, 200, "<p>play</p>");
        runtime.handle_fetch(Request::navigate(play.clone())).await;

        fetcher.fail(&play);
        let mut result = runtime.handle_fetch(Request::navigate(play)).await.into_response().unwrap();
        assert_eq!(result.response.text().unwrap(), "<p>play</p>");
    }

    #[tokio::test]
    async fn test_failed_navigation_falls_back_to_root_document() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        // Precache serves "/" with the shell.
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;

        let mut result = runtime
            .handle_fetch(Request::navigate(url("http://localhost:8000/levels/7")))
            .await
            .into_response()
            .unwrap();
        assert!(result.response.from_cache);
        assert_eq!(result.response.status, StatusCode::OK);
        assert_eq!(result.response.text().unwrap(), crate::test_support::SHELL_HTML);
    }

    #[tokio::test]
    async fn test_failed_navigation_without_any_cache_is_offline_page() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        assert!(runtime.clear_all_caches().await);

        let mut result = runtime
            .handle_fetch(Request::navigate(url("http://localhost:8000/levels/7")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(result.response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(result.response.text().unwrap(), "Offline - Game not available");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_returns_cache_before_refresh_resolves() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        let wasm = url("https://slopeunblocked.bitbucket.io/file/Build/slope.wasm");
        fetcher.respond(&wasm, 200, "wasm-v1");
        runtime.handle_fetch(Request::get(wasm.clone())).await;

        fetcher.respond(&wasm, 200, "wasm-v2");
        let gate = fetcher.hold(&wasm);

        let mut result = runtime.handle_fetch(Request::get(wasm.clone())).await.into_response().unwrap();
        assert_eq!(result.strategy, Strategy::StaleWhileRevalidate);
        assert!(result.response.from_cache);
        assert_eq!(result.response.text().unwrap(), "wasm-v1");

        let refresh = result.revalidation.take().unwrap();
        assert!(!refresh.is_finished());
        gate.release();
        refresh.join().await;

        let key = RequestKey::get(&wasm);
        let game = runtime.config().bucket_name(GAME_BUCKET);
        let mut updated = runtime.cached(MatchScope::Bucket(&game), &key).await.unwrap();
        assert_eq!(updated.text().unwrap(), "wasm-v2");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_refresh_errors_are_swallowed() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        let wasm = url("https://slopeunblocked.bitbucket.io/file/data.unityweb");
        fetcher.respond(&wasm, 200, "level");
        runtime.handle_fetch(Request::get(wasm.clone())).await;

        fetcher.fail(&wasm);
        let mut result = runtime.handle_fetch(Request::get(wasm.clone())).await.into_response().unwrap();
        result.revalidation.take().unwrap().join().await;
        assert_eq!(result.response.text().unwrap(), "level");

        let mut still = runtime.handle_fetch(Request::get(wasm)).await.into_response().unwrap();
        assert_eq!(still.response.text().unwrap(), "level");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_refresh_outlives_dropped_handle() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;
        let asset = url("https://slopeunblocked.bitbucket.io/file/music.ogg");
        fetcher.respond(&asset, 200, "old");
        runtime.handle_fetch(Request::get(asset.clone())).await;

        fetcher.respond(&asset, 200, "new");
        let gate = fetcher.hold(&asset);
        let result = runtime.handle_fetch(Request::get(asset.clone())).await;
        drop(result);
        gate.release();

        let key = RequestKey::get(&asset);
        let game = runtime.config().bucket_name(GAME_BUCKET);
        for _ in 0..100 {
            if let Some(mut r) = runtime.cached(MatchScope::Bucket(&game), &key).await {
                if r.text().unwrap() == "new" {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("refresh did not update the cache");
    }

    #[tokio::test]
    async fn test_stale_while_revalidate_miss_offline_is_503() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let runtime = crate::test_support::active_runtime(fetcher.clone()).await;

        let mut result = runtime
            .handle_fetch(Request::get(url("https://slopeunblocked.bitbucket.io/file/none.bin")))
            .await
            .into_response()
            .unwrap();
        assert!(result.revalidation.is_none());
        assert_eq!(result.response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(result.response.text().unwrap(), "Game resource not available");
    }
}
