use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;

use api::AppState;
use blockchain::{Blockchain, Payload, Transaction, Wallet};
use config::Config;

// Open the persisted chain, or start an in-memory one when no data directory is set
fn initialize_blockchain(config: &Config) -> anyhow::Result<Blockchain> {
    let Some(data_dir) = &config.data_dir else {
        info!("No data directory configured, keeping the chain in memory");
        return Ok(Blockchain::new()?);
    };

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir))?;

    let blockchain = Blockchain::with_storage(data_dir)
        .with_context(|| format!("Failed to load blockchain from {}", data_dir))?;
    info!(
        "Loaded blockchain from storage at {} ({} blocks)",
        data_dir,
        blockchain.len()
    );

    Ok(blockchain)
}

// Periodically mine a reward block to a fresh wallet until `cancel` is raised
fn spawn_auto_miner(
    blockchain: Blockchain,
    reward: u64,
    every: Duration,
    cancel: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if cancel.load(Ordering::Relaxed) {
                break;
            }

            let wallet = Wallet::new();
            let coinbase = Transaction::new_reward(wallet.address(), reward);
            let chain = blockchain.clone();
            let flag = cancel.clone();

            let mined = tokio::task::spawn_blocking(move || {
                chain.append_cancellable(Payload::Transactions(vec![coinbase]), &flag)
            })
            .await;

            match mined {
                Ok(Ok(block)) => info!(
                    "Auto-mined block {} paying {} to {}",
                    block.hash_hex(),
                    reward,
                    wallet.address()
                ),
                Ok(Err(_)) if cancel.load(Ordering::Relaxed) => break,
                Ok(Err(err)) => warn!("Auto-mining failed: {}", err),
                Err(err) => error!("Auto-miner task panicked: {}", err),
            }
        }

        info!("Auto-miner stopped");
    })
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::add_block,
        api::handlers::mine_block,
        api::handlers::send_transaction,
        api::handlers::validate_chain,
        api::handlers::submit_block,
        api::handlers::create_wallet
    ),
    components(
        schemas(
            api::handlers::BlockView,
            api::handlers::TransactionView,
            api::handlers::TxInputView,
            api::handlers::TxOutputView,
            api::handlers::ChainResponse,
            api::handlers::AddBlockRequest,
            api::handlers::MineRequest,
            api::handlers::SpendRequest,
            api::handlers::PaymentRequest,
            api::handlers::TransactionRequest,
            api::handlers::BlockResponse,
            api::handlers::ViolationView,
            api::handlers::ValidateResponse,
            api::handlers::SubmitBlockRequest,
            api::handlers::WalletResponse
        )
    ),
    tags(
        (name = "ledger", description = "Proof-of-work ledger endpoints")
    ),
    info(
        title = "PoW Ledger API",
        version = "0.1.0",
        description = "A minimal proof-of-work ledger",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Config::from_env()?;

    // Mining the genesis block is CPU bound
    let init_config = config.clone();
    let blockchain = web::block(move || initialize_blockchain(&init_config))
        .await
        .context("Blockchain initialization worker failed")??;

    let cancel = Arc::new(AtomicBool::new(false));
    let auto_miner = config.auto_mine_secs.map(|secs| {
        info!("Auto-mining a block every {} seconds", secs);
        spawn_auto_miner(
            blockchain.clone(),
            config.mining_reward,
            Duration::from_secs(secs),
            cancel.clone(),
        )
    });

    let state = web::Data::new(AppState::new(blockchain, config.mining_reward));

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    // Start HTTP server
    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    cancel.store(true, Ordering::Relaxed);
    if let Some(handle) = auto_miner {
        handle.abort();
    }

    Ok(())
}
