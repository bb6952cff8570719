// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Composition root: loads configuration, wires the Store/ObjectStore/
//! Fetcher into the pipeline stages, registers them with the
//! Supervisor, and serves the HTTP control surface.
//!
//! Exit codes per the service's contract: 0 on clean shutdown, 1 on
//! startup failure (store unreachable, required env var missing).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use estate_error::{Code, Error};
use estate_fetcher::{AgencyFields, DetailOutcome, Fetcher, ListingFilters, RawListing};
use estate_objectstore::ObjectStoreClient;
use estate_pipeline::{agency, images, ingester};
use estate_scheduler::{StageSpec, Supervisor};
use estate_service::{AppState, STAGE_AGENCE_BRUTE, STAGE_AGENCE_NOTEXISTING, STAGE_BULK_CRAWL, STAGE_IMAGE_PROCESSOR, STAGE_LOOP};
use estate_store::{Store, StoreTrait};
use estate_util::cancel::{cancel_pair, CancelToken};
use estate_util::window::Window;
use rand::Rng;
use tracing::{event, Level};

/// The bulk crawl re-enters every 15-30 minutes while its window is
/// open; the loop ingester waits 5 minutes after startup before its
/// first cycle. Both figures come from the stage window table.
const BULK_CRAWL_REENTRY_MIN_SECS: u64 = 15 * 60;
const BULK_CRAWL_REENTRY_MAX_SECS: u64 = 30 * 60;
const LOOP_STARTUP_DELAY: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        event!(Level::ERROR, %err, "startup failed");
        std::process::exit(1);
    }
    std::process::exit(0);
}

async fn run() -> Result<(), Error> {
    let config = estate_config::AppConfig::load_from_env()?;

    let store = Store::connect(&config.store.uri, &config.store.database).await?;
    store.ensure_indexes().await?;
    let store: Arc<dyn StoreTrait> = Arc::new(store);

    let objectstore = Arc::new(
        ObjectStoreClient::new(&config.objectstore, config.scheduling.objectstore_permits).await?,
    );
    let http = reqwest::Client::new();
    let fetcher: Arc<dyn Fetcher> = Arc::new(UnimplementedFetcher);

    let supervisor = Arc::new(Supervisor::new(config.scheduling.day_start_hour, config.scheduling.day_end_hour));
    register_stages(&supervisor, Arc::clone(&store), Arc::clone(&objectstore), http, Arc::clone(&fetcher), config.scheduling.image_processor_instances).await;

    let (supervisor_cancel_source, supervisor_cancel_token) = cancel_pair();
    let supervisor_task = tokio::spawn(Arc::clone(&supervisor).run_forever(supervisor_cancel_token));

    let app_state = AppState { supervisor: Arc::clone(&supervisor) };
    let router = estate_service::router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.http.bind_addr)
        .await
        .map_err(|e| estate_error::make_err!(Code::Internal, "binding {}: {e}", config.http.bind_addr))?;

    event!(Level::INFO, addr = %config.http.bind_addr, "listening");

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor_cancel_source.cancel();
    let _ = supervisor_task.await;

    serve_result.map_err(|e| estate_error::make_err!(Code::Internal, "http server error: {e}"))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "shutdown signal received");
}

async fn register_stages(
    supervisor: &Supervisor,
    store: Arc<dyn StoreTrait>,
    objectstore: Arc<ObjectStoreClient>,
    http: reqwest::Client,
    fetcher: Arc<dyn Fetcher>,
    image_processor_instances: usize,
) {
    {
        let store = Arc::clone(&store);
        let fetcher = Arc::clone(&fetcher);
        supervisor
            .register(StageSpec {
                name: STAGE_BULK_CRAWL.to_string(),
                window: Window::Day,
                run: Arc::new(move |mut cancel: CancelToken, _instances: usize| {
                    let store = Arc::clone(&store);
                    let fetcher = Arc::clone(&fetcher);
                    Box::pin(async move {
                        let filters = ListingFilters::default();
                        ingester::bulk_crawl(fetcher.as_ref(), store.as_ref(), &filters, ingester::MAX_BULK_PAGES).await?;
                        let delay = Duration::from_secs(
                            rand::thread_rng().gen_range(BULK_CRAWL_REENTRY_MIN_SECS..=BULK_CRAWL_REENTRY_MAX_SECS),
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {}
                        }
                        Ok(())
                    })
                }),
                initial_instances: 1,
            })
            .await;
    }

    {
        let store = Arc::clone(&store);
        let fetcher = Arc::clone(&fetcher);
        supervisor
            .register(StageSpec {
                name: STAGE_LOOP.to_string(),
                window: Window::Day,
                run: Arc::new(move |mut cancel: CancelToken, _instances: usize| {
                    let store = Arc::clone(&store);
                    let fetcher = Arc::clone(&fetcher);
                    Box::pin(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(LOOP_STARTUP_DELAY) => {}
                            _ = cancel.cancelled() => return Ok(()),
                        }
                        let filters = ListingFilters::default();
                        while !cancel.is_cancelled() {
                            ingester::incremental_loop_once(fetcher.as_ref(), store.as_ref(), &filters).await?;
                            tokio::select! {
                                _ = tokio::time::sleep(ingester::next_cycle_delay()) => {}
                                _ = cancel.cancelled() => break,
                            }
                        }
                        Ok(())
                    })
                }),
                initial_instances: 1,
            })
            .await;
    }

    {
        let store = Arc::clone(&store);
        let fetcher = Arc::clone(&fetcher);
        supervisor
            .register(StageSpec {
                name: STAGE_AGENCE_BRUTE.to_string(),
                window: Window::Night,
                run: Arc::new(move |_cancel: CancelToken, _instances: usize| {
                    let store = Arc::clone(&store);
                    let fetcher = Arc::clone(&fetcher);
                    Box::pin(async move {
                        agency::enrich_sweep(fetcher.as_ref(), store.as_ref()).await?;
                        Ok(())
                    })
                }),
                initial_instances: 1,
            })
            .await;
    }

    {
        let store = Arc::clone(&store);
        let fetcher = Arc::clone(&fetcher);
        supervisor
            .register(StageSpec {
                name: STAGE_AGENCE_NOTEXISTING.to_string(),
                window: Window::Night,
                run: Arc::new(move |_cancel: CancelToken, _instances: usize| {
                    let store = Arc::clone(&store);
                    let fetcher = Arc::clone(&fetcher);
                    Box::pin(async move {
                        agency::resolve_sweep(fetcher.as_ref(), store.as_ref()).await?;
                        Ok(())
                    })
                }),
                initial_instances: 1,
            })
            .await;
    }

    {
        let store = Arc::clone(&store);
        let objectstore = Arc::clone(&objectstore);
        let http = http.clone();
        supervisor
            .register(StageSpec {
                name: STAGE_IMAGE_PROCESSOR.to_string(),
                window: Window::Always,
                run: Arc::new(move |cancel: CancelToken, instances: usize| {
                    let store = Arc::clone(&store);
                    let objectstore = Arc::clone(&objectstore);
                    let http = http.clone();
                    Box::pin(async move {
                        let workers = (0..instances).map(|_| {
                            images::worker_loop(Arc::clone(&store), Arc::clone(&objectstore), http.clone(), cancel.clone())
                        });
                        futures::future::join_all(workers).await;
                        Ok(())
                    })
                }),
                initial_instances: image_processor_instances.clamp(1, 10),
            })
            .await;
    }
}

/// Placeholder wiring for the external Fetcher (browser automation,
/// CAPTCHA handling). Production deployments supply their own
/// implementation; this one fails every call so a misconfigured
/// deployment is loud rather than silently idle.
struct UnimplementedFetcher;

#[async_trait]
impl Fetcher for UnimplementedFetcher {
    async fn fetch_listing_page(&self, _filters: &ListingFilters, _page: u32) -> Result<Vec<RawListing>, Error> {
        Err(estate_error::make_err!(Code::Unavailable, "no Fetcher implementation wired"))
    }

    async fn fetch_listing_detail(&self, _listing_url: &str) -> Result<DetailOutcome, Error> {
        Err(estate_error::make_err!(Code::Unavailable, "no Fetcher implementation wired"))
    }

    async fn fetch_agency_detail(&self, _agency_url: &str) -> Result<AgencyFields, Error> {
        Err(estate_error::make_err!(Code::Unavailable, "no Fetcher implementation wired"))
    }
}
