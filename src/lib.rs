pub mod account_reactor;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod ingestor;
pub mod ingress;
pub mod killswitch;
pub mod models;
pub mod process;
pub mod provider;
pub mod rate_limit;
pub mod replay;
pub mod retention;
pub mod routes;
pub mod status_applier;
pub mod template_machine;

use std::sync::Arc;

use cache::TenantRouter;
use config::GatewayConfig;
use db::Db;
use dispatcher::DispatchQueue;
use events::EventBus;
use process::RouterDeps;
use provider::ProviderClient;
use rate_limit::RateLimiter;
use replay::ReplayStore;
use rocket_cors::CorsOptions;

/// Queue depth for admitted-but-not-yet-dispatched webhook jobs. Sized well
/// above the provider's expected burst; a full queue applies backpressure
/// onto the ingress handler rather than growing unbounded.
const DISPATCH_QUEUE_CAPACITY: usize = 4096;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let config = GatewayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("configuration error: {e}");
        std::process::exit(1);
    });
    build_rocket(config)
}

pub fn rocket_with_config(config: GatewayConfig) -> rocket::Rocket<rocket::Build> {
    build_rocket(config)
}

fn build_rocket(config: GatewayConfig) -> rocket::Rocket<rocket::Build> {
    // The managed `Db` serves route handlers. The dispatcher and retention
    // sweep each open their own connection against the same file, mirroring
    // the teacher's `spawn_dispatcher`/`spawn_retention_task` (separate
    // connections keep a slow background sweep from blocking request-path
    // lock acquisition).
    let db = Db::new(&config.database_path).expect("failed to open database");
    let dispatcher_db = Arc::new(Db::new(&config.database_path).expect("failed to open database"));

    let events = Arc::new(EventBus::new());
    let tenant_router = Arc::new(TenantRouter::new(config.tenant_cache_ttl));
    let replay_store = Arc::new(ReplayStore::new(config.replay_ttl));
    let rate_limiter = Arc::new(RateLimiter::new());
    let provider = Arc::new(ProviderClient::new(
        config.provider_base_url.clone(),
        config.provider_access_token.clone(),
        config.provider_timeout,
    ));
    let config = Arc::new(config);

    let (queue, receiver) = DispatchQueue::new(DISPATCH_QUEUE_CAPACITY);

    let router_deps = Arc::new(RouterDeps {
        events: events.clone(),
        tenant_router: tenant_router.clone(),
        provider: provider.clone(),
        rate_limiter: rate_limiter.clone(),
        config: config.clone(),
    });
    let process_job = process::build_process_job(router_deps);

    let retention_db_path = config.database_path.clone();
    let retention_tenant_router = tenant_router.clone();
    let retention_replay_store = replay_store.clone();
    let retention_rate_limiter = rate_limiter.clone();
    let retention_log_retention_days = config.webhook_log_retention_days;

    let cors = CorsOptions::default().to_cors().expect("failed to build CORS layer");

    rocket::build()
        .manage(db)
        .manage((*config).clone())
        .manage(events)
        .manage(tenant_router)
        .manage(replay_store)
        .manage(rate_limiter)
        .manage(provider)
        .manage(queue)
        .attach(cors)
        .register("/", rocket::catchers![routes::not_found, routes::too_many_requests])
        .mount(
            "/",
            rocket::routes![
                routes::verify_webhook,
                routes::handle_webhook,
                routes::send_template,
                routes::activate_global_killswitch,
                routes::deactivate_global_killswitch,
                routes::workspace_safety,
                routes::health,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff("Webhook Dispatcher", move |_rocket| {
            Box::pin(async move {
                dispatcher::spawn_dispatcher(receiver, dispatcher_db, process_job);
                tracing::info!("webhook dispatcher started");
            })
        }))
        .attach(rocket::fairing::AdHoc::on_liftoff("Retention Sweep", move |_rocket| {
            Box::pin(async move {
                retention::spawn_retention_task(
                    retention_db_path,
                    retention_tenant_router,
                    retention_replay_store,
                    retention_rate_limiter,
                    retention_log_retention_days,
                );
                tracing::info!("retention sweep task started");
            })
        }))
}
