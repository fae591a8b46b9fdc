use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scanner_execution_rs::api::{self, AppState};
use scanner_execution_rs::broker::{BrokerApi, KiteClient};
use scanner_execution_rs::calendar::HolidayCalendar;
use scanner_execution_rs::config::{ParamStore, Settings, TradingParams};
use scanner_execution_rs::context::{SharedClock, SystemTimeProvider};
use scanner_execution_rs::notify::build_notifier;
use scanner_execution_rs::pipeline::ExecutionPipeline;
use scanner_execution_rs::scheduler::{MarketSchedule, Supervisor};
use scanner_execution_rs::session::SessionManager;
use scanner_execution_rs::storage::FileStorage;

fn config_err(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::new().map_err(config_err)?;
    info!(
        "Starting scanner execution service on {}:{}",
        settings.server.bind, settings.server.port
    );

    let storage = Arc::new(FileStorage::new(&settings.storage.data_dir));
    let notifier = build_notifier(&settings.telegram);
    let clock: SharedClock = Arc::new(SystemTimeProvider);

    let client = Arc::new(KiteClient::new(&settings.broker, &settings.limiter).map_err(config_err)?);
    let broker: Arc<dyn BrokerApi> = client.clone();

    let session = SessionManager::new(
        storage.clone(),
        notifier.clone(),
        broker.clone(),
        &settings.market,
        settings.server.app_url.clone(),
        clock.clone(),
    );
    // The client refuses orders until the session gate is wired
    client.set_gate(session.clone());

    // Persisted runtime parameters win over the static config
    let params = Arc::new(ParamStore::new(
        storage
            .load_settings()
            .unwrap_or_else(|| TradingParams::from_config(&settings.trading)),
    ));

    let pipeline = Arc::new(ExecutionPipeline::new(
        broker,
        session.clone(),
        params.clone(),
        storage.clone(),
        notifier.clone(),
        clock.clone(),
    ));

    let calendar = Arc::new(HolidayCalendar::new(
        &settings.calendar,
        &settings.storage.data_dir,
    ));
    let schedule = MarketSchedule::new(&settings.market, calendar, clock);
    let supervisor = Supervisor::new(schedule, session.clone(), notifier);
    tokio::spawn(supervisor.clone().run());

    let state = web::Data::new(AppState {
        pipeline,
        session,
        supervisor,
        params,
        storage,
        login_url: client.login_redirect_url(),
    });

    let bind = (settings.server.bind.clone(), settings.server.port);
    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .configure(api::configure)
    })
    .bind(bind)?
    .run()
    .await
}
