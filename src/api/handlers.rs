use actix_web::{web, HttpResponse, Responder};
use log::error;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::block::BlockError;
use crate::blockchain::transaction::{TxInput, TxOutput};
use crate::blockchain::{
    Address, Block, BlockHeader, Blockchain, BlockchainError, Payload, Transaction, Wallet,
};

/// Shared state handed to every handler
pub struct AppState {
    pub blockchain: Blockchain,

    /// Reward paid by coinbase transactions minted through `/mine`
    pub mining_reward: u64,
}

impl AppState {
    pub fn new(blockchain: Blockchain, mining_reward: u64) -> Self {
        AppState {
            blockchain,
            mining_reward,
        }
    }
}

/// Data structure for the application state
pub type AppData = web::Data<AppState>;

/// JSON view of a transaction input
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TxInputView {
    /// Id of the spent transaction (hex, empty for coinbase)
    pub txid: String,

    /// Index of the spent output (-1 for coinbase)
    pub vout: i64,

    /// Compact signature (hex)
    pub signature: Option<String>,

    /// Compressed public key (hex)
    pub public_key: Option<String>,
}

/// JSON view of a transaction output
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TxOutputView {
    pub value: u64,

    /// Address the output is locked to (hex)
    pub owner_hash: String,
}

/// JSON view of a transaction
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionView {
    pub id: String,
    pub is_coinbase: bool,
    pub inputs: Vec<TxInputView>,
    pub outputs: Vec<TxOutputView>,
}

/// JSON view of a block
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BlockView {
    pub hash: String,

    /// Empty for the genesis block
    pub parent_hash: String,

    pub timestamp: i64,
    pub nonce: u64,

    /// Free-form data, for data blocks
    pub data: Option<String>,

    /// Transactions, for ledger blocks
    pub transactions: Vec<TransactionView>,
}

impl From<&TxInput> for TxInputView {
    fn from(input: &TxInput) -> Self {
        TxInputView {
            txid: hex::encode(&input.txid),
            vout: input.vout,
            signature: input.signature.as_ref().map(hex::encode),
            public_key: input.public_key.as_ref().map(hex::encode),
        }
    }
}

impl From<&TxOutput> for TxOutputView {
    fn from(output: &TxOutput) -> Self {
        TxOutputView {
            value: output.value,
            owner_hash: hex::encode(&output.owner_hash),
        }
    }
}

impl From<&Transaction> for TransactionView {
    fn from(transaction: &Transaction) -> Self {
        TransactionView {
            id: transaction.id_hex(),
            is_coinbase: transaction.is_coinbase(),
            inputs: transaction.inputs.iter().map(TxInputView::from).collect(),
            outputs: transaction.outputs.iter().map(TxOutputView::from).collect(),
        }
    }
}

impl From<&Block> for BlockView {
    fn from(block: &Block) -> Self {
        let data = match block.payload() {
            Payload::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
            Payload::Transactions(_) => None,
        };

        BlockView {
            hash: block.hash_hex(),
            parent_hash: hex::encode(block.parent_hash()),
            timestamp: block.timestamp(),
            nonce: block.nonce(),
            data,
            transactions: block.transactions().iter().map(TransactionView::from).collect(),
        }
    }
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// Whether the chain is valid
    pub is_valid: bool,

    /// Leading zero bits every block hash needs
    pub difficulty_bits: u32,

    /// Proof-of-work target (hex, big-endian)
    pub target: String,

    /// The blocks in the chain, head first
    pub chain: Vec<BlockView>,
}

/// Request for the add block endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct AddBlockRequest {
    /// Free-form block data
    pub data: String,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineRequest {
    /// The miner's address (40 hex characters)
    pub miner_address: String,
}

/// An output to spend, for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SpendRequest {
    /// Id of the transaction holding the output (hex)
    pub txid: String,

    /// Index of the output in that transaction
    pub vout: i64,
}

/// An output to create, for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct PaymentRequest {
    /// The recipient's address (40 hex characters)
    pub address: String,

    pub value: u64,
}

/// Request for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionRequest {
    /// Secret key owning every spent output (hex)
    pub private_key: String,

    pub inputs: Vec<SpendRequest>,
    pub outputs: Vec<PaymentRequest>,
}

/// Response for endpoints that append a block
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BlockResponse {
    /// The message
    pub message: String,

    /// The newly appended block
    pub block: BlockView,
}

/// Position and reason of a validation failure
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ViolationView {
    pub position: usize,
    pub reason: String,
}

/// Response for the validate endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidateResponse {
    pub valid: bool,
    pub length: usize,
    pub violation: Option<ViolationView>,
}

/// Request for the submit block endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SubmitBlockRequest {
    /// bincode-encoded block, hex
    pub block: String,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    /// The wallet's address
    pub address: String,

    /// The wallet's private key (hex encoded)
    pub private_key: String,
}

fn error_response(err: &BlockchainError) -> HttpResponse {
    let body = serde_json::json!({ "error": err.to_string() });

    match err {
        BlockchainError::InvalidTransaction(_)
        | BlockchainError::BlockRejected(_)
        | BlockchainError::BlockError(BlockError::EmptyTransactions) => {
            HttpResponse::BadRequest().json(body)
        }
        _ => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({ "error": message }))
}

/// Runs a chain operation on the blocking pool. Anything that takes the
/// append lock goes through here, since a miner may hold it for a long time.
async fn on_worker<T, F>(state: AppData, work: F) -> Result<T, HttpResponse>
where
    T: Send + 'static,
    F: FnOnce(&Blockchain) -> Result<T, BlockchainError> + Send + 'static,
{
    match web::block(move || work(&state.blockchain)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(error_response(&err)),
        Err(err) => {
            error!("Chain worker failed: {}", err);
            Err(HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "Chain worker failed"
            })))
        }
    }
}

/// Mines on the blocking pool and renders the appended block
async fn append_on_worker<F>(state: AppData, message: &str, mine: F) -> HttpResponse
where
    F: FnOnce(&Blockchain) -> Result<Block, BlockchainError> + Send + 'static,
{
    match on_worker(state, mine).await {
        Ok(block) => HttpResponse::Created().json(BlockResponse {
            message: message.to_string(),
            block: BlockView::from(&block),
        }),
        Err(response) => response,
    }
}

/// Get the full blockchain
///
/// Returns every block from head to genesis and the validity status
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Blockchain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(state: AppData) -> impl Responder {
    let chain: Vec<BlockView> = state.blockchain.iter().map(|b| BlockView::from(&b)).collect();

    let pow = state.blockchain.proof();
    let mut target = [0u8; 32];
    pow.target().to_big_endian(&mut target);

    let response = ChainResponse {
        length: chain.len(),
        is_valid: state.blockchain.validate(),
        difficulty_bits: pow.difficulty_bits(),
        target: hex::encode(target),
        chain,
    };

    HttpResponse::Ok().json(response)
}

/// Add a data block
///
/// Mines a block carrying free-form data on top of the current head
#[utoipa::path(
    post,
    path = "/api/v1/blocks",
    request_body = AddBlockRequest,
    responses(
        (status = 201, description = "Block mined and appended", body = BlockResponse),
        (status = 400, description = "Missing block data"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn add_block(state: AppData, request: web::Json<AddBlockRequest>) -> impl Responder {
    let data = request.into_inner().data;
    if data.is_empty() {
        return bad_request("Block data must not be empty".to_string());
    }

    append_on_worker(state, "Block added", move |chain| chain.add_block(&data)).await
}

/// Mine a reward block
///
/// Mines a block holding a coinbase transaction paid to the miner
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = MineRequest,
    responses(
        (status = 201, description = "Block mined successfully", body = BlockResponse),
        (status = 400, description = "Malformed miner address"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(state: AppData, request: web::Json<MineRequest>) -> impl Responder {
    let address: Address = match request.miner_address.parse() {
        Ok(address) => address,
        Err(err) => {
            return bad_request(format!("Invalid miner address: {}", err));
        }
    };

    let coinbase = Transaction::new_reward(&address, state.mining_reward);
    append_on_worker(state, "New Block Mined", move |chain| {
        chain.mine_block(vec![coinbase])
    })
    .await
}

/// Send a signed transaction
///
/// Signs a transfer with the given key and mines it into a block. Every
/// spent output must be unspent and owned by the key, and the outputs may
/// not exceed the spent value.
#[utoipa::path(
    post,
    path = "/api/v1/transactions",
    request_body = TransactionRequest,
    responses(
        (status = 201, description = "Transaction mined", body = BlockResponse),
        (status = 400, description = "Malformed or invalid transaction"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn send_transaction(
    state: AppData,
    request: web::Json<TransactionRequest>,
) -> impl Responder {
    let request = request.into_inner();
    if request.inputs.is_empty() || request.outputs.is_empty() {
        return bad_request("A transaction needs at least one input and one output".to_string());
    }

    let wallet = match hex::decode(&request.private_key)
        .map_err(|e| e.to_string())
        .and_then(|bytes| Wallet::from_secret_key(&bytes).map_err(|e| e.to_string()))
    {
        Ok(wallet) => wallet,
        Err(err) => return bad_request(format!("Invalid private key: {}", err)),
    };

    let inputs = request
        .inputs
        .iter()
        .map(|spend| {
            hex::decode(&spend.txid)
                .map(|txid| TxInput::new(txid, spend.vout))
                .map_err(|e| format!("Invalid txid {}: {}", spend.txid, e))
        })
        .collect::<Result<Vec<_>, _>>();
    let outputs = request
        .outputs
        .iter()
        .map(|payment| TxOutput::new(payment.value, &payment.address).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>();

    let mut transaction = match (inputs, outputs) {
        (Ok(inputs), Ok(outputs)) => Transaction::new(inputs, outputs),
        (Err(err), _) | (_, Err(err)) => return bad_request(err),
    };

    append_on_worker(state, "Transaction mined", move |chain| {
        let referenced = chain.referenced_outputs(&transaction)?;
        transaction
            .sign(&wallet, &referenced)
            .map_err(|e| BlockchainError::InvalidTransaction(e.to_string()))?;
        chain.mine_block(vec![transaction])
    })
    .await
}

/// Check if the blockchain is valid
///
/// Validates the entire blockchain and reports the first failing block
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Blockchain validation status", body = ValidateResponse)
    )
)]
pub async fn validate_chain(state: AppData) -> impl Responder {
    let violation = state.blockchain.check().err().map(|violation| ViolationView {
        position: violation.position,
        reason: violation.kind.to_string(),
    });

    HttpResponse::Ok().json(ValidateResponse {
        valid: violation.is_none(),
        length: state.blockchain.len(),
        violation,
    })
}

/// Submit a mined block
///
/// Accepts a block mined by a peer if it extends the current head
#[utoipa::path(
    post,
    path = "/api/v1/blocks/submit",
    request_body = SubmitBlockRequest,
    responses(
        (status = 201, description = "Block accepted", body = BlockView),
        (status = 400, description = "Malformed or invalid block"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn submit_block(state: AppData, request: web::Json<SubmitBlockRequest>) -> impl Responder {
    let block = match hex::decode(&request.block)
        .map_err(|e| e.to_string())
        .and_then(|bytes| Block::deserialize(&bytes).map_err(|e| e.to_string()))
    {
        Ok(block) => block,
        Err(err) => return bad_request(format!("Malformed block: {}", err)),
    };

    let view = BlockView::from(&block);
    match on_worker(state, move |chain| chain.submit_block(block)).await {
        Ok(()) => HttpResponse::Created().json(view),
        Err(response) => response,
    }
}

/// Create a new wallet
///
/// Creates a new wallet with a random keypair
///
/// The private key must be stored by your own
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Wallet created successfully", body = WalletResponse)
    )
)]
pub async fn create_wallet() -> impl Responder {
    let wallet = Wallet::new();

    HttpResponse::Created().json(WalletResponse {
        address: wallet.address().to_string(),
        private_key: hex::encode(wallet.export_secret_key()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::proof::ProofOfWork;
    use actix_web::{test, App};

    fn test_state() -> AppData {
        let chain = Blockchain::with_proof(ProofOfWork::new(8).unwrap()).unwrap();
        web::Data::new(AppState::new(chain, 50))
    }

    #[actix_web::test]
    async fn test_add_block_and_get_chain() {
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/api/v1/blocks")
            .set_json(AddBlockRequest {
                data: "hello".to_string(),
            })
            .to_request();
        let response: BlockResponse = test::call_and_read_body_json(&app, request).await;
        assert_eq!(response.block.data.as_deref(), Some("hello"));

        let request = test::TestRequest::get().uri("/api/v1/chain").to_request();
        let chain: ChainResponse = test::call_and_read_body_json(&app, request).await;
        assert_eq!(chain.length, 2);
        assert!(chain.is_valid);
        assert_eq!(chain.difficulty_bits, 8);
        assert_eq!(chain.target, format!("01{}", "00".repeat(31)));
        assert_eq!(chain.chain[0].hash, response.block.hash);
        assert_eq!(chain.chain[1].parent_hash, "");
    }

    #[actix_web::test]
    async fn test_empty_data_is_rejected() {
        let app = test::init_service(App::new().app_data(test_state()).configure(configure_routes)).await;

        let request = test::TestRequest::post()
            .uri("/api/v1/blocks")
            .set_json(AddBlockRequest {
                data: String::new(),
            })
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);
    }

    #[actix_web::test]
    async fn test_mine_pays_coinbase() {
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let miner = Wallet::new();

        let request = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(MineRequest {
                miner_address: miner.address().to_string(),
            })
            .to_request();
        let response: BlockResponse = test::call_and_read_body_json(&app, request).await;

        let coinbase = &response.block.transactions[0];
        assert!(coinbase.is_coinbase);
        assert_eq!(coinbase.outputs[0].value, 50);
        assert_eq!(coinbase.outputs[0].owner_hash, miner.address().to_string());
        assert_eq!(state.blockchain.len(), 2);

        let request = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(MineRequest {
                miner_address: "not-an-address".to_string(),
            })
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);
    }

    #[actix_web::test]
    async fn test_validate_reports_status() {
        let app = test::init_service(App::new().app_data(test_state()).configure(configure_routes)).await;

        let request = test::TestRequest::get().uri("/api/v1/validate").to_request();
        let response: ValidateResponse = test::call_and_read_body_json(&app, request).await;

        assert!(response.valid);
        assert_eq!(response.length, 1);
        assert!(response.violation.is_none());
    }

    #[actix_web::test]
    async fn test_submit_block() {
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let pow = *state.blockchain.proof();
        let head = state.blockchain.head();
        let block = Block::new("from a peer".into(), head.hash().to_vec(), &pow).unwrap();
        let encoded = hex::encode(block.serialize().unwrap());

        let request = test::TestRequest::post()
            .uri("/api/v1/blocks/submit")
            .set_json(SubmitBlockRequest {
                block: encoded.clone(),
            })
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 201);
        assert_eq!(state.blockchain.head(), block);

        // Resubmitting no longer extends the head
        let request = test::TestRequest::post()
            .uri("/api/v1/blocks/submit")
            .set_json(SubmitBlockRequest { block: encoded })
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);

        let request = test::TestRequest::post()
            .uri("/api/v1/blocks/submit")
            .set_json(SubmitBlockRequest {
                block: "zz".to_string(),
            })
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);
    }

    #[actix_web::test]
    async fn test_send_transaction() {
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;
        let owner = Wallet::new();
        let recipient = Wallet::new();

        let request = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(MineRequest {
                miner_address: owner.address().to_string(),
            })
            .to_request();
        let mined: BlockResponse = test::call_and_read_body_json(&app, request).await;
        let reward_id = mined.block.transactions[0].id.clone();

        let transfer = || TransactionRequest {
            private_key: hex::encode(owner.export_secret_key()),
            inputs: vec![SpendRequest {
                txid: reward_id.clone(),
                vout: 0,
            }],
            outputs: vec![
                PaymentRequest {
                    address: recipient.address().to_string(),
                    value: 30,
                },
                PaymentRequest {
                    address: owner.address().to_string(),
                    value: 20,
                },
            ],
        };

        let request = test::TestRequest::post()
            .uri("/api/v1/transactions")
            .set_json(transfer())
            .to_request();
        let response: BlockResponse = test::call_and_read_body_json(&app, request).await;
        let sent = &response.block.transactions[0];
        assert!(!sent.is_coinbase);
        assert_eq!(sent.inputs[0].txid, reward_id);
        assert_eq!(sent.outputs[0].owner_hash, recipient.address().to_string());
        assert_eq!(state.blockchain.len(), 3);

        // The reward is already spent
        let request = test::TestRequest::post()
            .uri("/api/v1/transactions")
            .set_json(transfer())
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);
        assert_eq!(state.blockchain.len(), 3);

        let request = test::TestRequest::post()
            .uri("/api/v1/transactions")
            .set_json(TransactionRequest {
                private_key: "zz".to_string(),
                ..transfer()
            })
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);
    }

    #[actix_web::test]
    async fn test_submit_block_with_forged_transaction_id() {
        let state = test_state();
        let app = test::init_service(
            App::new().app_data(state.clone()).configure(configure_routes),
        )
        .await;

        let pow = *state.blockchain.proof();
        let mut reward = Transaction::new_reward(Wallet::new().address(), 50);
        reward.id = vec![0x11; 32];
        let block = Block::new(vec![reward].into(), state.blockchain.head().hash().to_vec(), &pow)
            .unwrap();

        let request = test::TestRequest::post()
            .uri("/api/v1/blocks/submit")
            .set_json(SubmitBlockRequest {
                block: hex::encode(block.serialize().unwrap()),
            })
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);
        assert_eq!(state.blockchain.len(), 1);
    }

    #[actix_web::test]
    async fn test_create_wallet() {
        let app = test::init_service(App::new().configure(configure_routes)).await;

        let request = test::TestRequest::post().uri("/api/v1/wallet/new").to_request();
        let response: WalletResponse = test::call_and_read_body_json(&app, request).await;

        let wallet = Wallet::from_secret_key(&hex::decode(&response.private_key).unwrap()).unwrap();
        assert_eq!(wallet.address().to_string(), response.address);
    }
}
