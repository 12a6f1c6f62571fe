use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use clap::Parser;
use credit_tracker::{
    config::Config,
    database::Database,
    handlers,
    ledger::Ledger,
    nats_consumer::ContractEventConsumer,
    services::{CreditService, MockBurnInitiator},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "credit-tracker", about = "Credit ledger for developer metering")]
struct Args {
    /// Path to the env file to load before reading configuration
    #[arg(long, default_value = ".env")]
    env: String,

    /// Run database migrations on startup
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    migrations: bool,

    /// Run migrations and exit
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    migrate_only: bool,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    dotenv::from_filename(&args.env).ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    info!("Starting credit tracker on port {}", config.server.port);

    let db = Arc::new(
        Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .expect("Failed to connect to database"),
    );

    if args.migrations || args.migrate_only {
        info!("Running migrations");
        db.migrate().await.expect("Failed to run migrations");
        if args.migrate_only {
            return Ok(());
        }
    }

    let shutdown = CancellationToken::new();
    let ledger = Arc::new(Ledger::new(db.clone(), shutdown.clone()));

    let burn_initiator = Arc::new(MockBurnInitiator::new(ledger.clone()));
    let credit_service = Arc::new(CreditService::new(
        ledger.clone(),
        burn_initiator,
        config.credit.default_burn_amount,
    ));

    let consumer = ContractEventConsumer::new(
        &config.nats.url,
        config.nats.stream_name.clone(),
        config.nats.consumer_name.clone(),
        config.nats.contract_event_subject.clone(),
        config.nats.burn_event_signature.clone(),
        config.nats.revert_event_signature.clone(),
        ledger.clone(),
        shutdown.clone(),
    )
    .await
    .expect("Failed to create contract event consumer");

    let consumer_handle = tokio::spawn(consumer.run());

    // Cancel in-flight ledger retries and the consumer on ctrl-c; actix
    // drains its own workers.
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_shutdown.cancel();
        }
    });

    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(credit_service.clone()))
            .app_data(web::Data::new(ledger.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await;

    shutdown.cancel();
    let _ = consumer_handle.await;

    server
}
