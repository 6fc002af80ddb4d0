//! Leader and witness pipelines wired with in-memory collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use quantum_core::constellation::{AssetDefinition, ConstellationInitRequest};
use quantum_core::crypto::KeyPair;
use quantum_core::effects::EffectKind;
use quantum_core::messages::{
    AccountDataRequest, Envelope, LedgerPayment, LedgerUpdateNotification, Message, OrderRequest,
    RequestMessage,
};
use quantum_core::ports::{
    LedgerInfo, LedgerOracle, LedgerUpdateStream, Persistence, SignedVaultTransaction, Transport,
};
use quantum_core::quantum::HandlerInput;
use quantum_core::snapshot::validate_snapshot;
use quantum_core::storage::MemoryPersistence;
use quantum_core::types::{OrderSide, PublicKey, TimeInForce, QUOTE_ASSET};
use quantum_core::{
    ApplicationState, Config, Node, NodeServices, ResultStatus, Role, Snapshot,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

const GENESIS_LEDGER: u64 = 10;

#[derive(Debug, Default)]
struct RecordingTransport {
    broadcast: Mutex<Vec<Envelope>>,
    to_alpha: Mutex<Vec<Envelope>>,
    requested: Mutex<Vec<(u64, u64)>>,
    notified: Mutex<Vec<(PublicKey, Envelope)>>,
}

impl RecordingTransport {
    fn take_broadcast(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.broadcast.lock())
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn broadcast_quantum(&self, quantum: &Envelope) -> quantum_core::Result<()> {
        self.broadcast.lock().push(quantum.clone());
        Ok(())
    }

    async fn send_to_alpha(&self, message: &Envelope) -> quantum_core::Result<()> {
        self.to_alpha.lock().push(message.clone());
        Ok(())
    }

    async fn request_quanta(&self, from: u64, to: u64) -> quantum_core::Result<()> {
        self.requested.lock().push((from, to));
        Ok(())
    }

    async fn notify_client(&self, account: &PublicKey, result: &Envelope) -> quantum_core::Result<()> {
        self.notified.lock().push((*account, result.clone()));
        Ok(())
    }
}

#[derive(Debug)]
struct QuietLedger;

#[async_trait]
impl LedgerOracle for QuietLedger {
    async fn latest_ledger(&self) -> quantum_core::Result<u64> {
        Ok(GENESIS_LEDGER)
    }

    async fn get_ledger(&self, sequence: u64) -> quantum_core::Result<Option<LedgerInfo>> {
        Ok(Some(LedgerInfo {
            sequence,
            close_time: 0,
        }))
    }

    async fn subscribe(&self, _from: u64) -> quantum_core::Result<LedgerUpdateStream> {
        Ok(Box::pin(tokio_stream::pending()))
    }

    async fn submit_transaction(
        &self,
        transaction: SignedVaultTransaction,
    ) -> quantum_core::Result<bool> {
        Ok(transaction.threshold as usize <= transaction.signers.len())
    }
}

struct TestNode {
    node: Arc<Node>,
    keypair: KeyPair,
    transport: Arc<RecordingTransport>,
    persistence: Arc<MemoryPersistence>,
}

fn seed_hex(seed: u8) -> String {
    hex::encode([seed; 32])
}

async fn start_node(
    role: Role,
    seed: u8,
    alpha: Option<PublicKey>,
    auditors: Vec<PublicKey>,
    quorum_timeout_ms: u64,
) -> TestNode {
    let mut config = Config::default();
    config.node.role = role;
    config.node.secret_seed = seed_hex(seed);
    config.node.alpha = alpha;
    config.node.default_auditors = auditors;
    config.snapshot.interval_ms = 3_600_000;
    config.snapshot.quorum_timeout_ms = quorum_timeout_ms;

    let transport = Arc::new(RecordingTransport::default());
    let persistence = Arc::new(MemoryPersistence::new());
    let node = Node::start(
        &config,
        NodeServices {
            persistence: persistence.clone(),
            transport: transport.clone(),
            oracle: Arc::new(QuietLedger),
        },
    )
    .await
    .unwrap();

    TestNode {
        node,
        keypair: KeyPair::from_seed(&[seed; 32]),
        transport,
        persistence,
    }
}

fn init_request(auditors: Vec<PublicKey>) -> ConstellationInitRequest {
    ConstellationInitRequest {
        auditors,
        assets: vec![AssetDefinition {
            code: "X".to_string(),
            issuer: PublicKey::from_bytes([3u8; 32]),
        }],
        min_account_balance: 1,
        min_allowed_lot_size: 1,
    }
}

/// Leader in `Ready` plus one witness caught up from genesis
async fn constellation(quorum_timeout_ms: u64) -> (TestNode, TestNode, Snapshot) {
    let auditor = KeyPair::from_seed(&[2u8; 32]).public_key();
    let leader = start_node(Role::Leader, 1, None, vec![auditor], quorum_timeout_ms).await;
    let alpha = leader.keypair.public_key();
    let witness = start_node(Role::Witness, 2, Some(alpha), vec![auditor], quorum_timeout_ms).await;

    let genesis = leader.node.initialize(init_request(vec![auditor])).await.unwrap();
    assert_eq!(leader.node.state_manager().state(), ApplicationState::Rising);
    leader.node.auditor_connected(auditor);
    assert_eq!(leader.node.state_manager().state(), ApplicationState::Ready);

    assert_eq!(
        witness.node.catchup(genesis.clone(), vec![]).await,
        ResultStatus::Success
    );
    assert_eq!(witness.node.state_manager().state(), ApplicationState::Running);
    (leader, witness, genesis)
}

fn deposit(account: PublicKey, asset: u32, amount: u64, tag: u8) -> LedgerPayment {
    LedgerPayment::Deposit {
        account,
        asset,
        amount,
        transaction_hash: [tag; 32],
    }
}

/// Auditor-signed ledger update funding `accounts`
fn funding(ledger: u64, accounts: &[PublicKey], auditor: &KeyPair) -> Envelope {
    let payments = accounts
        .iter()
        .enumerate()
        .flat_map(|(i, account)| {
            let tag = (i as u8) * 2;
            [
                deposit(*account, QUOTE_ASSET, 1_000, tag),
                deposit(*account, 1, 1_000, tag + 1),
            ]
        })
        .collect();
    Envelope::signed(
        Message::LedgerUpdate(LedgerUpdateNotification { ledger, payments }),
        auditor,
    )
    .unwrap()
}

fn order(keypair: &KeyPair, nonce: u64, side: OrderSide, price: Decimal, amount: u64) -> Envelope {
    Envelope::signed(
        Message::Request(RequestMessage::Order(OrderRequest {
            account: keypair.public_key(),
            nonce,
            asset: 1,
            side,
            price,
            amount,
            time_in_force: TimeInForce::GoodTillCancel,
        })),
        keypair,
    )
    .unwrap()
}

fn account_data(keypair: &KeyPair, nonce: u64) -> Envelope {
    Envelope::signed(
        Message::Request(RequestMessage::AccountData(AccountDataRequest {
            account: keypair.public_key(),
            nonce,
        })),
        keypair,
    )
    .unwrap()
}

/// Apply every quantum the leader broadcast on the witness, in order
async fn replicate(leader: &TestNode, witness: &TestNode) -> Vec<Envelope> {
    let mut results = Vec::new();
    for quantum in leader.transport.take_broadcast() {
        let processed = witness
            .node
            .handle()
            .handle_async(HandlerInput::Quantum(quantum))
            .await
            .unwrap();
        assert_eq!(processed.status, ResultStatus::Success);
        results.push(processed.result);
    }
    results
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn trades(effects: &[quantum_core::effects::Effect]) -> usize {
    effects
        .iter()
        .filter(|e| matches!(e.kind, EffectKind::Trade { .. }))
        .count()
}

#[tokio::test]
async fn test_matching_replicated_and_snapshot_confirmed() {
    let (leader, witness, _) = constellation(10_000).await;
    let seller = KeyPair::from_seed(&[11u8; 32]);
    let buyer = KeyPair::from_seed(&[12u8; 32]);

    leader
        .node
        .handle_ledger_update(funding(
            GENESIS_LEDGER + 1,
            &[seller.public_key(), buyer.public_key()],
            &witness.keypair,
        ))
        .await
        .unwrap();

    let placed = leader
        .node
        .submit_request(order(&seller, 1, OrderSide::Sell, Decimal::new(2, 0), 10))
        .await
        .unwrap();
    assert!(placed
        .effects
        .iter()
        .any(|e| matches!(e.kind, EffectKind::OrderPlaced { .. })));
    assert_eq!(trades(&placed.effects), 0);

    let matched = leader
        .node
        .submit_request(order(&buyer, 1, OrderSide::Buy, Decimal::new(25, 1), 4))
        .await
        .unwrap();
    assert_eq!(trades(&matched.effects), 2);
    assert_eq!(leader.transport.notified.lock().len(), 2);

    replicate(&leader, &witness).await;
    assert_eq!(witness.node.handle().current_apex(), 4);
    assert_eq!(witness.transport.to_alpha.lock().len(), 3);

    for node in [&leader, &witness] {
        node.node.handle().read(|state| {
            let book = state.exchange.market(1).unwrap().book(OrderSide::Sell);
            assert_eq!(book.len(), 1);
            assert_eq!(book.total_amount(), 6);

            let seller_account = state.accounts.get_account(&seller.public_key()).unwrap();
            // 4 sold at the resting price of 2
            assert_eq!(seller_account.balance(QUOTE_ASSET).unwrap().amount, 1_008);
            let buyer_account = state.accounts.get_account(&buyer.public_key()).unwrap();
            assert_eq!(buyer_account.balance(QUOTE_ASSET).unwrap().amount, 992);
            assert_eq!(buyer_account.balance(QUOTE_ASSET).unwrap().liabilities, 0);
        });
    }

    let apex = leader.node.trigger_snapshot().await.unwrap();
    assert!(leader.node.snapshots().is_in_progress());
    let results = replicate(&leader, &witness).await;
    assert_eq!(results.len(), 1);

    assert!(leader.node.handle_auditor_result(&results[0]).await.unwrap());
    assert_eq!(leader.node.state_manager().state(), ApplicationState::Running);
    assert!(!leader.node.snapshots().is_in_progress());
    assert_eq!(leader.node.snapshots().finalized_apex(), apex);

    let confirmed = leader.persistence.get_last_snapshot().await.unwrap().unwrap();
    assert_eq!(confirmed.apex, apex);
    let auditors = vec![witness.keypair.public_key()];
    validate_snapshot(&confirmed, Some(1), &auditors, &auditors).unwrap();

    leader.node.shutdown().await.unwrap();
    witness.node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_witness_buffers_quanta_after_gap() {
    let (leader, witness, _) = constellation(10_000).await;
    let client = KeyPair::from_seed(&[11u8; 32]);

    leader
        .node
        .handle_ledger_update(funding(GENESIS_LEDGER + 1, &[client.public_key()], &witness.keypair))
        .await
        .unwrap();
    leader.node.submit_request(account_data(&client, 1)).await.unwrap();
    leader.node.submit_request(account_data(&client, 2)).await.unwrap();

    let quanta = leader.transport.take_broadcast();
    assert_eq!(quanta.len(), 3);
    let (apex2, apex3, apex4) = (quanta[0].clone(), quanta[1].clone(), quanta[2].clone());

    let handle = witness.node.handle();
    handle
        .handle_async(HandlerInput::Quantum(apex2))
        .await
        .unwrap();
    witness.node.receive_quantum(apex4).await.unwrap();

    assert_eq!(handle.last_added_apex(), 4);
    assert_eq!(handle.current_apex(), 2);
    eventually(|| !witness.transport.requested.lock().is_empty()).await;
    assert_eq!(witness.transport.requested.lock().as_slice(), &[(3, 3)]);
    assert_eq!(handle.current_apex(), 2);

    handle
        .handle_async(HandlerInput::Quantum(apex3))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait_for_apex(4))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.current_apex(), 4);
    assert_eq!(
        handle.read(|s| s.accounts.get_account(&client.public_key()).unwrap().nonce),
        2
    );
}

#[tokio::test]
async fn test_rejected_request_is_not_sequenced() {
    let (leader, witness, _) = constellation(10_000).await;
    let client = KeyPair::from_seed(&[11u8; 32]);

    leader
        .node
        .handle_ledger_update(funding(GENESIS_LEDGER + 1, &[client.public_key()], &witness.keypair))
        .await
        .unwrap();
    leader.node.submit_request(account_data(&client, 1)).await.unwrap();

    let outcome = leader.node.submit_request(account_data(&client, 1)).await;
    assert!(matches!(outcome, Err(quantum_core::Error::InvalidNonce { .. })));
    assert_eq!(leader.node.handle().current_apex(), 3);

    let notified = leader.transport.notified.lock();
    let (_, rejection) = notified.last().unwrap();
    let result = rejection.message.as_result().unwrap();
    assert_eq!(result.status, ResultStatus::InvalidNonce);
    assert!(result.effects.is_empty());
}

#[tokio::test]
async fn test_snapshot_without_quorum_fails_leader() {
    let (leader, _witness, _) = constellation(100).await;

    leader.node.trigger_snapshot().await.unwrap();
    let mut states = leader.node.state_manager().subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| *s == ApplicationState::Failed),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!leader.node.snapshots().is_in_progress());
    // Only genesis was persisted
    assert_eq!(
        leader.persistence.get_last_snapshot().await.unwrap().unwrap().apex,
        1
    );
}

#[tokio::test]
async fn test_new_witness_catches_up_from_confirmed_snapshot() {
    let (leader, witness, _) = constellation(10_000).await;
    let client = KeyPair::from_seed(&[11u8; 32]);

    leader
        .node
        .handle_ledger_update(funding(GENESIS_LEDGER + 1, &[client.public_key()], &witness.keypair))
        .await
        .unwrap();
    leader.node.trigger_snapshot().await.unwrap();
    let results = replicate(&leader, &witness).await;
    assert!(leader
        .node
        .handle_auditor_result(results.last().unwrap())
        .await
        .unwrap());
    leader.node.submit_request(account_data(&client, 1)).await.unwrap();

    let snapshot = leader.persistence.get_last_snapshot().await.unwrap().unwrap();
    let pending = leader.persistence.get_pending_quanta().await.unwrap();
    assert_eq!(pending.len(), 1);

    let auditors = vec![witness.keypair.public_key()];
    let late = start_node(
        Role::Witness,
        5,
        Some(leader.keypair.public_key()),
        auditors,
        10_000,
    )
    .await;
    assert_eq!(late.node.catchup(snapshot, pending).await, ResultStatus::Success);
    assert_eq!(late.node.state_manager().state(), ApplicationState::Running);
    assert_eq!(late.node.handle().current_apex(), leader.node.handle().current_apex());
    assert_eq!(
        late.node
            .handle()
            .read(|s| s.accounts.get_account(&client.public_key()).cloned()),
        leader
            .node
            .handle()
            .read(|s| s.accounts.get_account(&client.public_key()).cloned()),
    );
}

/// Leader with a confirmed snapshot at apex 3 and a funded client
async fn confirmed_constellation() -> (TestNode, TestNode, KeyPair, Snapshot) {
    let (leader, witness, _) = constellation(10_000).await;
    let client = KeyPair::from_seed(&[11u8; 32]);

    leader
        .node
        .handle_ledger_update(funding(GENESIS_LEDGER + 1, &[client.public_key()], &witness.keypair))
        .await
        .unwrap();
    leader.node.trigger_snapshot().await.unwrap();
    let results = replicate(&leader, &witness).await;
    assert!(leader
        .node
        .handle_auditor_result(results.last().unwrap())
        .await
        .unwrap());
    let snapshot = leader.persistence.get_last_snapshot().await.unwrap().unwrap();
    assert_eq!(snapshot.apex, 3);
    (leader, witness, client, snapshot)
}

async fn late_witness(leader: &TestNode, witness: &TestNode) -> TestNode {
    start_node(
        Role::Witness,
        5,
        Some(leader.keypair.public_key()),
        vec![witness.keypair.public_key()],
        10_000,
    )
    .await
}

#[tokio::test]
async fn test_failed_replay_does_not_adopt_snapshot() {
    let (leader, witness, client, snapshot) = confirmed_constellation().await;
    leader.node.submit_request(account_data(&client, 1)).await.unwrap();
    let pending = leader.persistence.get_pending_quanta().await.unwrap();
    assert_eq!(pending.len(), 1);

    // Same quantum, signed by someone other than alpha
    let forged = Envelope::signed(pending[0].message.clone(), &client).unwrap();
    let late = late_witness(&leader, &witness).await;
    assert_eq!(
        late.node.catchup(snapshot.clone(), vec![forged]).await,
        ResultStatus::InternalError
    );
    assert!(late.persistence.get_last_snapshot().await.unwrap().is_none());
    assert_ne!(late.node.state_manager().state(), ApplicationState::Running);

    assert_eq!(late.node.catchup(snapshot, pending).await, ResultStatus::Success);
    assert_eq!(
        late.persistence.get_last_snapshot().await.unwrap().unwrap().apex,
        3
    );
    assert_eq!(late.node.handle().current_apex(), 4);
    assert_eq!(late.node.state_manager().state(), ApplicationState::Running);
}

#[tokio::test]
async fn test_catchup_with_buffered_live_quantum() {
    let (leader, witness, client, snapshot) = confirmed_constellation().await;
    leader.node.submit_request(account_data(&client, 1)).await.unwrap();
    leader.node.submit_request(account_data(&client, 2)).await.unwrap();
    let pending = leader.persistence.get_pending_quanta().await.unwrap();
    assert_eq!(pending.len(), 2);
    leader.node.submit_request(account_data(&client, 3)).await.unwrap();

    // Apex 5 and 6 arrive live before catchup; 5 is also in the pending set
    let live = leader.transport.take_broadcast();
    assert_eq!(live.len(), 3);
    let late = late_witness(&leader, &witness).await;
    late.node.receive_quantum(live[1].clone()).await.unwrap();
    late.node.receive_quantum(live[2].clone()).await.unwrap();
    assert_eq!(late.node.handle().last_added_apex(), 6);

    assert_eq!(late.node.catchup(snapshot, pending).await, ResultStatus::Success);
    tokio::time::timeout(Duration::from_secs(5), late.node.handle().wait_for_apex(6))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(late.node.state_manager().state(), ApplicationState::Running);
    assert_eq!(late.node.handle().current_apex(), 6);
    assert_eq!(
        late.node
            .handle()
            .read(|s| s.accounts.get_account(&client.public_key()).cloned()),
        leader
            .node
            .handle()
            .read(|s| s.accounts.get_account(&client.public_key()).cloned()),
    );
}

#[tokio::test]
async fn test_genesis_with_foreign_auditors_rejected() {
    let (_leader, _witness, genesis) = constellation(10_000).await;
    let other = KeyPair::from_seed(&[6u8; 32]).public_key();
    let stranger = start_node(
        Role::Witness,
        7,
        Some(genesis.settings.vault),
        vec![other],
        10_000,
    )
    .await;

    assert_eq!(
        stranger.node.catchup(genesis, vec![]).await,
        ResultStatus::SnapshotValidationFailed
    );
    assert_eq!(stranger.node.state_manager().state(), ApplicationState::Rising);
}
