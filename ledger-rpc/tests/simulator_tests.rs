//! Simulated ledger flows
//!
//! - Signed transactions execute both programs and emit decodable events
//! - Expired or unknown blockhashes are rejected
//! - Dropped transactions stay pending while blocks advance
//! - Live subscriptions see new transactions of their program only

use ed25519_dalek::{Signer, SigningKey};
use futures::StreamExt;
use ledger_rpc::{Error, LedgerClient, SignatureQuery, SimulatedLedger, TxStatus, VaultSetup};
use vault_ledger::events::parse_logs;
use vault_ledger::pda;
use vault_ledger::receipt::NewJob;
use vault_ledger::tx::{self, Message, ReceiveRevenueAccounts, RecordJobAccounts, Transaction};
use vault_ledger::{Hash, JobStatus, LedgerEvent, Pubkey, RejectionCode, Signature};

const CHALLENGE_WINDOW: i64 = 3_600;

struct Fixture {
    ledger: SimulatedLedger,
    operator: SigningKey,
    operator_key: Pubkey,
    client: Pubkey,
    authority: Pubkey,
    vault: Pubkey,
    registry: Pubkey,
}

fn pubkey_of(key: &SigningKey) -> Pubkey {
    Pubkey::new(key.verifying_key().to_bytes())
}

fn fixture() -> Fixture {
    let ledger = SimulatedLedger::new();
    let operator = SigningKey::from_bytes(&[7u8; 32]);
    let operator_key = pubkey_of(&operator);
    let client = Pubkey::new([20u8; 32]);
    let authority = Pubkey::new([21u8; 32]);
    let treasury = ledger.token_account(&Pubkey::new([22u8; 32])).unwrap();

    ledger.mint_to(&operator_key, 1_000_000_000).unwrap();
    let vault = ledger
        .create_vault(VaultSetup::new(operator_key, Pubkey::new([23u8; 32]), treasury))
        .unwrap();
    ledger.stake_bond(&operator_key, 100_000_000).unwrap();
    let registry = ledger
        .create_registry(&vault, authority, CHALLENGE_WINDOW, None)
        .unwrap();

    Fixture {
        ledger,
        operator,
        operator_key,
        client,
        authority,
        vault,
        registry,
    }
}

async fn revenue_and_receipt_tx(f: &Fixture, amount: u64, blockhash: Hash) -> Transaction {
    let vault = f.ledger.vault(&f.vault).unwrap();
    let registry = f.ledger.registry(&f.registry).unwrap();
    let program = f.ledger.registry_program();

    let revenue = tx::receive_revenue(
        f.ledger.vault_program(),
        &ReceiveRevenueAccounts {
            vault: f.vault,
            operator: f.operator_key,
            vault_token_account: vault.vault_token_account,
            operator_token_account: f.ledger.token_account(&f.operator_key).unwrap(),
            protocol_treasury: vault.protocol_treasury,
        },
        amount,
    );
    let record = tx::record_job(
        program,
        &RecordJobAccounts {
            registry: f.registry,
            job_receipt: pda::job_receipt_address(&program, &f.registry, registry.job_counter).unwrap(),
            signer: f.operator_key,
            client: f.client,
        },
        Hash::digest(b"artifact"),
        amount,
        [9u8; 64],
    );

    let message = Message::new(&[revenue, record], &f.operator_key, blockhash).unwrap();
    let mut transaction = Transaction::new_unsigned(message);
    let data = transaction.message_data().unwrap();
    let signature = Signature::from_bytes(f.operator.sign(&data).to_bytes());
    transaction.add_signature(&f.operator_key, signature).unwrap();
    transaction
}

#[tokio::test]
async fn test_signed_transaction_routes_revenue_and_records_job() {
    let f = fixture();
    let blockhash = f.ledger.latest_blockhash().await.unwrap().blockhash;
    let transaction = revenue_and_receipt_tx(&f, 10_000_000, blockhash).await;

    let signature = f.ledger.send_transaction(&transaction).await.unwrap();
    assert!(matches!(
        f.ledger.signature_status(&signature).await.unwrap(),
        TxStatus::Confirmed { .. }
    ));

    let vault = f.ledger.vault(&f.vault).unwrap();
    assert_eq!(vault.total_revenue, 10_000_000);
    assert_eq!(vault.total_jobs, 1);
    assert_eq!(f.ledger.balance(&vault.protocol_treasury), 500_000);
    assert_eq!(f.ledger.balance(&vault.vault_token_account), 100_000_000 + 2_500_000);

    let receipt = f.ledger.receipt(&f.registry, 0).unwrap();
    assert_eq!(receipt.client, f.client);
    assert_eq!(receipt.status, JobStatus::Active);

    let logs = f.ledger.get_transaction_logs(&signature).await.unwrap().unwrap();
    let vault_events = parse_logs(&f.ledger.vault_program(), &logs.logs).events;
    let registry_events = parse_logs(&f.ledger.registry_program(), &logs.logs).events;
    assert!(matches!(
        vault_events.as_slice(),
        [LedgerEvent::RevenueReceived { amount: 10_000_000, job_id: 0, .. }]
    ));
    assert!(matches!(
        registry_events.as_slice(),
        [LedgerEvent::JobRecorded { job_id: 0, payment_amount: 10_000_000, .. }]
    ));

    // The transaction appears in both programs' histories
    for program in [f.ledger.vault_program(), f.ledger.registry_program()] {
        let newest = f
            .ledger
            .get_signatures(&program, SignatureQuery { limit: 1, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(newest[0].signature, signature);
    }
}

#[tokio::test]
async fn test_tampered_signature_rejected() {
    let f = fixture();
    let blockhash = f.ledger.latest_blockhash().await.unwrap().blockhash;
    let mut transaction = revenue_and_receipt_tx(&f, 1_000_000, blockhash).await;
    transaction.signatures[0] = Signature::from_bytes([1u8; 64]);

    let err = f.ledger.send_transaction(&transaction).await.unwrap_err();
    assert!(matches!(err, Error::TransactionRejected(_)));
    assert_eq!(f.ledger.vault(&f.vault).unwrap().total_revenue, 0);
}

#[tokio::test]
async fn test_expired_blockhash_rejected() {
    let f = fixture();
    f.ledger.set_blockhash_validity(0);
    let blockhash = f.ledger.latest_blockhash().await.unwrap().blockhash;
    f.ledger.stake_bond(&f.operator_key, 1).unwrap();

    let transaction = revenue_and_receipt_tx(&f, 1_000_000, blockhash).await;
    let err = f.ledger.send_transaction(&transaction).await.unwrap_err();
    assert!(matches!(err, Error::TransactionRejected(ref reason) if reason.contains("expired")));

    let unknown = revenue_and_receipt_tx(&f, 1_000_000, Hash::new([3u8; 32])).await;
    assert!(f.ledger.send_transaction(&unknown).await.is_err());
}

#[tokio::test]
async fn test_program_failure_lands_as_failed() {
    let f = fixture();
    f.ledger.pause(&f.operator_key).unwrap();
    let blockhash = f.ledger.latest_blockhash().await.unwrap().blockhash;
    let transaction = revenue_and_receipt_tx(&f, 1_000_000, blockhash).await;

    let signature = f.ledger.send_transaction(&transaction).await.unwrap();
    match f.ledger.signature_status(&signature).await.unwrap() {
        TxStatus::Failed { reason, .. } => assert!(reason.contains("VaultPaused")),
        other => panic!("unexpected status {:?}", other),
    }
    // Neither instruction took effect
    assert_eq!(f.ledger.registry(&f.registry).unwrap().job_counter, 0);
    assert_eq!(f.ledger.vault(&f.vault).unwrap().total_revenue, 0);
}

#[tokio::test]
async fn test_dropped_transaction_stays_pending() {
    let f = fixture();
    f.ledger.set_drop_transactions(true);
    let recent = f.ledger.latest_blockhash().await.unwrap();
    let transaction = revenue_and_receipt_tx(&f, 1_000_000, recent.blockhash).await;

    let signature = f.ledger.send_transaction(&transaction).await.unwrap();
    let first = f.ledger.block_height().await.unwrap();
    let second = f.ledger.block_height().await.unwrap();
    assert!(second > first);
    assert_eq!(f.ledger.signature_status(&signature).await.unwrap(), TxStatus::Pending);
}

#[tokio::test]
async fn test_receipt_lifecycle() {
    let f = fixture();
    let job = |amount| NewJob {
        client: f.client,
        artifact_hash: Hash::from_prefix(b"report"),
        payment_amount: amount,
        payment_tx_ref: [0u8; 64],
    };
    f.ledger.record_job(&f.operator_key, &f.registry, job(5_000_000)).unwrap();
    f.ledger.record_job(&f.operator_key, &f.registry, job(6_000_000)).unwrap();

    // Only the client may challenge
    let err = f.ledger.challenge(&f.authority, &f.registry, 0).unwrap_err();
    assert!(matches!(err, Error::Ledger(ref e) if e.rejection() == Some(RejectionCode::Unauthorized)));

    f.ledger.challenge(&f.client, &f.registry, 0).unwrap();
    f.ledger.resolve(&f.authority, &f.registry, 0, false).unwrap();
    assert_eq!(f.ledger.receipt(&f.registry, 0).unwrap().status, JobStatus::Rejected);

    let err = f.ledger.finalize(&f.client, &f.registry, 1).unwrap_err();
    assert!(matches!(err, Error::Ledger(ref e) if e.rejection() == Some(RejectionCode::ChallengeWindowActive)));
    f.ledger.advance_clock(CHALLENGE_WINDOW + 1);
    f.ledger.finalize(&f.client, &f.registry, 1).unwrap();
    f.ledger.verify_receipt(&f.client, &f.registry, 1).unwrap();

    let registry = f.ledger.registry(&f.registry).unwrap();
    assert_eq!(registry.total_challenged, 1);
    assert_eq!(registry.total_resolved_against, 1);
    assert!(f.ledger.receipt(&f.registry, 1).unwrap().client_verified);
}

#[tokio::test]
async fn test_deposit_withdraw_and_slash() {
    let f = fixture();
    let depositor = Pubkey::new([30u8; 32]);
    let arbitrator = Pubkey::new([23u8; 32]);
    f.ledger.mint_to(&depositor, 50_000_000).unwrap();

    f.ledger.deposit(&depositor, &f.vault, 50_000_000, 0).unwrap();
    let shares = f.ledger.share_balance(&f.vault, &depositor);
    assert_eq!(shares, 50_000_000);

    // Lockup is one day
    let err = f.ledger.withdraw(&depositor, &f.vault, shares, 0).unwrap_err();
    assert!(matches!(err, Error::Ledger(ref e) if e.rejection() == Some(RejectionCode::LockupNotExpired)));

    f.ledger.slash(&arbitrator, &f.vault, 0, 5_000_000, &f.client).unwrap();
    let vault = f.ledger.vault(&f.vault).unwrap();
    assert_eq!(vault.operator_bond, 90_000_000);
    assert_eq!(f.ledger.balance(&f.ledger.token_account(&f.client).unwrap()), 7_500_000);
    assert_eq!(f.ledger.pool(&f.vault).unwrap().total_assets, 50_000_000);

    f.ledger.advance_clock(86_400);
    f.ledger.withdraw(&depositor, &f.vault, shares, 0).unwrap();
    assert_eq!(f.ledger.balance(&f.ledger.token_account(&depositor).unwrap()), 50_000_000);
}

#[tokio::test]
async fn test_subscription_filters_by_program() {
    let f = fixture();
    let mut stream = f.ledger.subscribe_logs(&f.ledger.registry_program()).await.unwrap();

    f.ledger.stake_bond(&f.operator_key, 1).unwrap();
    let signature = f
        .ledger
        .record_job(
            &f.operator_key,
            &f.registry,
            NewJob {
                client: f.client,
                artifact_hash: Hash::default(),
                payment_amount: 1,
                payment_tx_ref: [0u8; 64],
            },
        )
        .unwrap();

    let received = stream.next().await.unwrap();
    assert_eq!(received.signature, signature);
}
