//! End-to-end tests across version upgrades
//!
//! Covers migration of stored records, yield, the two-phase withdrawal
//! lifecycle and compensation of failed transfers.

use custody_ledger::{
    schema::{fields, ACCOUNT_RECORD_SLOTS},
    AssetId, Config, Error, EventKind, GlobalState, InMemoryTransferProvider, Ledger,
    LedgerVersion, ManualClock, Principal, RecordLayout, Role, SchemaRegistry, SchemaVersion,
    Storage,
};
use std::sync::Arc;
use tempfile::TempDir;

const START: u64 = 1_700_000_000;
const YEAR: u64 = 365 * 86_400;
const DAY: u64 = 86_400;

struct Harness {
    ledger: Ledger,
    provider: Arc<InMemoryTransferProvider>,
    clock: ManualClock,
    admin: Principal,
    config: Config,
    _temp: TempDir,
}

fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config
}

async fn open(
    config: Config,
    provider: Arc<InMemoryTransferProvider>,
    clock: &ManualClock,
) -> Ledger {
    Ledger::open_with(
        config,
        provider,
        Arc::new(clock.clone()),
        SchemaRegistry::builtin(),
    )
    .await
    .unwrap()
}

/// Create initialized ledger at `version` with the given deposit fee
async fn create_test_ledger(version: LedgerVersion, fee_bps: u64) -> Harness {
    create_with_config(version, fee_bps, |_| {}).await
}

async fn create_with_config(
    version: LedgerVersion,
    fee_bps: u64,
    customize: impl FnOnce(&mut Config),
) -> Harness {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp_dir);
    customize(&mut config);

    let provider = Arc::new(InMemoryTransferProvider::new());
    let clock = ManualClock::starting_at(START);
    let ledger = open(config.clone(), provider.clone(), &clock).await;

    let admin = Principal::new("admin");
    ledger
        .initialize(AssetId::new("USDC").unwrap(), admin.clone(), fee_bps)
        .await
        .unwrap();
    if version > LedgerVersion::V1 {
        ledger.upgrade(admin.clone(), version).await.unwrap();
    }

    Harness {
        ledger,
        provider,
        clock,
        admin,
        config,
        _temp: temp_dir,
    }
}

fn raw_records(config: &Config, principals: &[Principal]) -> (Vec<u8>, Vec<Option<Vec<u8>>>) {
    let storage = Storage::open(config).unwrap();
    let global = storage.get_global_raw().unwrap().unwrap();
    let accounts = principals
        .iter()
        .map(|p| storage.get_account_raw(p).unwrap())
        .collect();
    (global, accounts)
}

#[tokio::test]
async fn test_upgrade_preserves_records_bit_for_bit() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config(&temp_dir);
    let provider = Arc::new(InMemoryTransferProvider::new());
    let clock = ManualClock::starting_at(START);
    let admin = Principal::new("admin");
    let emptied = Principal::new("emptied");
    let whale = Principal::new("whale");
    let regular = Principal::new("regular");

    let ledger = open(config.clone(), provider.clone(), &clock).await;
    ledger
        .initialize(AssetId::new("USDC").unwrap(), admin.clone(), 0)
        .await
        .unwrap();

    provider.fund(&emptied, 10);
    ledger.deposit(emptied.clone(), 10).await.unwrap();
    ledger.withdraw(emptied.clone(), 10).await.unwrap();

    provider.fund(&whale, u64::MAX);
    ledger.deposit(whale.clone(), u64::MAX).await.unwrap();
    assert_eq!(ledger.total_deposits().await.unwrap(), u64::MAX);
    ledger.shutdown().await.unwrap();

    let principals = [emptied.clone(), whale.clone(), regular.clone()];
    let (global_v1, accounts_v1) = raw_records(&config, &principals);

    let ledger = open(config.clone(), provider.clone(), &clock).await;
    ledger.upgrade(admin.clone(), LedgerVersion::V2).await.unwrap();
    ledger.upgrade(admin.clone(), LedgerVersion::V3).await.unwrap();
    assert_eq!(ledger.active_version().await.unwrap(), LedgerVersion::V3);
    assert_eq!(ledger.balance_of(whale.clone()).await.unwrap(), u64::MAX);
    assert_eq!(ledger.balance_of(emptied.clone()).await.unwrap(), 0);
    assert_eq!(ledger.accrued_yield(whale.clone()).await.unwrap(), 0);
    assert_eq!(ledger.pending_withdrawal(whale.clone()).await.unwrap(), None);
    ledger.shutdown().await.unwrap();

    let (global_v3, accounts_v3) = raw_records(&config, &principals);

    // account records are never rewritten by an upgrade
    assert_eq!(accounts_v1, accounts_v3);
    // global V1 fields keep their bytes, except the active version itself
    assert_eq!(global_v1.len(), global_v3.len());
    assert_eq!(global_v1[..8], global_v3[..8]);
    assert_eq!(global_v1[16..80], global_v3[16..80]);
    assert_eq!(u64::from_le_bytes(global_v3[8..16].try_into().unwrap()), 3);
}

fn slot(record: &[u8], index: usize) -> u64 {
    u64::from_le_bytes(record[index * 8..(index + 1) * 8].try_into().unwrap())
}

#[tokio::test]
async fn test_v2_fields_survive_upgrade_to_v3() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config(&temp_dir);
    let provider = Arc::new(InMemoryTransferProvider::new());
    let clock = ManualClock::starting_at(START);
    let admin = Principal::new("admin");
    let saver = Principal::new("saver");
    let whale = Principal::new("whale");

    let ledger = open(config.clone(), provider.clone(), &clock).await;
    ledger
        .initialize(AssetId::new("USDC").unwrap(), admin.clone(), 0)
        .await
        .unwrap();
    ledger.upgrade(admin.clone(), LedgerVersion::V2).await.unwrap();
    ledger.set_yield_rate(admin.clone(), 10_000).await.unwrap();

    provider.fund(&saver, 5_000);
    ledger.deposit(saver.clone(), 5_000).await.unwrap();
    clock.advance(3_600);
    provider.fund(&whale, u64::MAX - 5_000);
    ledger.deposit(whale.clone(), u64::MAX - 5_000).await.unwrap();
    assert_eq!(ledger.total_deposits().await.unwrap(), u64::MAX);
    ledger.shutdown().await.unwrap();

    let principals = [saver.clone(), whale.clone()];
    let (global_v2, accounts_v2) = raw_records(&config, &principals);

    // slot 0 balance, slot 1 yield baseline
    let saver_v2 = accounts_v2[0].as_ref().unwrap();
    let whale_v2 = accounts_v2[1].as_ref().unwrap();
    assert_eq!(slot(saver_v2, 1), START);
    assert_eq!(slot(whale_v2, 0), u64::MAX - 5_000);
    assert_eq!(slot(whale_v2, 1), START + 3_600);
    // slot 6 total deposits, slot 10 yield rate
    assert_eq!(slot(&global_v2, 6), u64::MAX);
    assert_eq!(slot(&global_v2, 10), 10_000);

    let ledger = open(config.clone(), provider.clone(), &clock).await;
    ledger.upgrade(admin.clone(), LedgerVersion::V3).await.unwrap();
    let state = ledger.global_state().await.unwrap();
    assert_eq!(state.yield_rate_bps, 10_000);
    assert_eq!(state.withdrawal_delay_secs, DAY);
    let account = ledger.account(whale.clone()).await.unwrap();
    assert_eq!(account.yield_baseline, START + 3_600);
    assert_eq!(account.pending_withdrawal, None);
    ledger.shutdown().await.unwrap();

    let (global_v3, accounts_v3) = raw_records(&config, &principals);

    assert_eq!(accounts_v2, accounts_v3);
    assert_eq!(global_v2.len(), global_v3.len());
    assert_eq!(global_v2[..8], global_v3[..8]);
    // every V2 slot after the version slot, yield rate included
    assert_eq!(global_v2[16..88], global_v3[16..88]);
    assert_eq!(slot(&global_v3, 1), 3);
    assert_eq!(slot(&global_v3, 11), DAY);
}

#[tokio::test]
async fn test_upgrade_runs_field_initializers() {
    let h = create_test_ledger(LedgerVersion::V1, 500).await;

    h.ledger.upgrade(h.admin.clone(), LedgerVersion::V3).await.unwrap();

    let state = h.ledger.global_state().await.unwrap();
    assert_eq!(state.schema_version, LedgerVersion::V3);
    assert_eq!(state.yield_rate_bps, 0);
    assert_eq!(state.withdrawal_delay_secs, DAY);
    assert_eq!(state.deposit_fee_bps, 500);

    let events = h.ledger.events_for(h.admin.clone()).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::Upgraded {
            from: LedgerVersion::V1,
            to: LedgerVersion::V3
        }
    )));

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let h = create_test_ledger(LedgerVersion::V2, 500).await;
    let mallory = Principal::new("mallory");

    let err = h
        .ledger
        .upgrade(mallory.clone(), LedgerVersion::V3)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Upgrader, .. }));

    let err = h
        .ledger
        .upgrade(h.admin.clone(), LedgerVersion::V2)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Reinitialization(_)));

    let err = h
        .ledger
        .upgrade(h.admin.clone(), LedgerVersion::V1)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaConflict(_)));

    assert_eq!(h.ledger.active_version().await.unwrap(), LedgerVersion::V2);

    // a dedicated upgrader suffices
    h.ledger
        .grant_role(h.admin.clone(), mallory.clone(), Role::Upgrader)
        .await
        .unwrap();
    h.ledger.upgrade(mallory, LedgerVersion::V3).await.unwrap();
    assert_eq!(h.ledger.active_version().await.unwrap(), LedgerVersion::V3);

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reordered_layout_upgrade_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config(&temp_dir);
    let builtin = SchemaRegistry::builtin();
    let v1 = builtin.get(LedgerVersion::V1).unwrap().clone();
    let v2 = builtin.get(LedgerVersion::V2).unwrap().clone();

    // balance no longer at offset 0
    let broken_v2 = SchemaVersion {
        version: LedgerVersion::V2,
        global: v2.global.clone(),
        account: RecordLayout::packed(
            &[(fields::YIELD_BASELINE, 1), (fields::BALANCE, 1)],
            ACCOUNT_RECORD_SLOTS,
        ),
    };
    let registry = SchemaRegistry::from_versions([v1, broken_v2]);

    let provider = Arc::new(InMemoryTransferProvider::new());
    let clock = ManualClock::starting_at(START);
    let ledger = Ledger::open_with(config, provider.clone(), Arc::new(clock), registry)
        .await
        .unwrap();
    let admin = Principal::new("admin");
    let alice = Principal::new("alice");
    ledger
        .initialize(AssetId::new("USDC").unwrap(), admin.clone(), 0)
        .await
        .unwrap();
    provider.fund(&alice, 700);
    ledger.deposit(alice.clone(), 700).await.unwrap();
    let before = ledger.global_state().await.unwrap();

    let err = ledger
        .upgrade(admin.clone(), LedgerVersion::V2)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaConflict(_)));

    assert_eq!(ledger.global_state().await.unwrap(), before);
    assert_eq!(ledger.active_version().await.unwrap(), LedgerVersion::V1);
    assert_eq!(ledger.balance_of(alice).await.unwrap(), 700);
    assert!(!ledger
        .events_for(admin)
        .await
        .unwrap()
        .iter()
        .any(|e| matches!(e.kind, EventKind::Upgraded { .. })));

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reopen_with_tampered_schema_rejected() {
    let h = create_test_ledger(LedgerVersion::V1, 0).await;
    let config = h.config.clone();
    h.ledger.shutdown().await.unwrap();

    let builtin = SchemaRegistry::builtin();
    let mut tampered_v1 = builtin.get(LedgerVersion::V1).unwrap().clone();
    tampered_v1.account = tampered_v1.account.extend(&[("shadow", 1)]);
    let registry = SchemaRegistry::from_versions([tampered_v1]);

    let err = Ledger::open_with(
        config.clone(),
        h.provider.clone(),
        Arc::new(h.clock.clone()),
        registry,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::SchemaConflict(_)));

    // the shipped layouts still open it
    let ledger = open(config, h.provider.clone(), &h.clock).await;
    assert_eq!(ledger.active_version().await.unwrap(), LedgerVersion::V1);
    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_initialize_rejected() {
    let h = create_test_ledger(LedgerVersion::V2, 500).await;

    let err = h
        .ledger
        .initialize(AssetId::new("DAI").unwrap(), Principal::new("intruder"), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Reinitialization(_)));

    let state = h.ledger.global_state().await.unwrap();
    assert_eq!(state.asset.unwrap().as_str(), "USDC");
    assert_eq!(state.schema_version, LedgerVersion::V2);
    assert!(!h
        .ledger
        .has_role(Principal::new("intruder"), Role::Admin)
        .await
        .unwrap());

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_yield_accrues_and_claims() {
    let h = create_test_ledger(LedgerVersion::V2, 500).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 2_000);

    h.ledger.set_yield_rate(h.admin.clone(), 500).await.unwrap();
    let receipt = h.ledger.deposit(alice.clone(), 2_000).await.unwrap();
    assert_eq!(receipt.net, 1_900);

    h.clock.advance(YEAR);
    assert_eq!(h.ledger.accrued_yield(alice.clone()).await.unwrap(), 95);

    assert_eq!(h.ledger.claim_yield(alice.clone()).await.unwrap(), 95);
    assert_eq!(h.ledger.balance_of(alice.clone()).await.unwrap(), 1_995);
    assert_eq!(h.ledger.total_deposits().await.unwrap(), 1_995);
    assert_eq!(h.ledger.accrued_yield(alice.clone()).await.unwrap(), 0);
    assert_eq!(h.ledger.check_conservation().await.unwrap(), 1_995);

    let err = h.ledger.claim_yield(alice.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .ledger
        .set_yield_rate(alice.clone(), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    let err = h
        .ledger
        .set_yield_rate(h.admin.clone(), 10_001)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deposit_discards_pending_yield_by_default() {
    let h = create_test_ledger(LedgerVersion::V2, 500).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 4_000);
    h.ledger.set_yield_rate(h.admin.clone(), 500).await.unwrap();

    h.ledger.deposit(alice.clone(), 2_000).await.unwrap();
    h.clock.advance(YEAR);
    h.ledger.deposit(alice.clone(), 2_000).await.unwrap();

    assert_eq!(h.ledger.balance_of(alice.clone()).await.unwrap(), 3_800);
    assert_eq!(h.ledger.accrued_yield(alice).await.unwrap(), 0);

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deposit_credits_pending_yield_when_configured() {
    let h = create_with_config(LedgerVersion::V2, 500, |config| {
        config.ledger.credit_pending_yield_on_deposit = true;
    })
    .await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 4_000);
    h.ledger.set_yield_rate(h.admin.clone(), 500).await.unwrap();

    h.ledger.deposit(alice.clone(), 2_000).await.unwrap();
    h.clock.advance(YEAR);
    h.ledger.deposit(alice.clone(), 2_000).await.unwrap();

    assert_eq!(h.ledger.balance_of(alice.clone()).await.unwrap(), 3_895);
    assert_eq!(h.ledger.total_deposits().await.unwrap(), 3_895);

    let events = h.ledger.events_for(alice).await.unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::YieldClaimed { amount: 95 })));

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delayed_withdrawal_lifecycle() {
    let h = create_test_ledger(LedgerVersion::V3, 500).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 1_000);
    h.ledger.deposit(alice.clone(), 1_000).await.unwrap();

    let err = h.ledger.execute_withdrawal(alice.clone()).await.unwrap_err();
    assert!(matches!(err, Error::NoPendingWithdrawal(_)));

    let err = h
        .ledger
        .request_withdrawal(alice.clone(), 951)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientBalance { .. }));

    h.ledger.request_withdrawal(alice.clone(), 100).await.unwrap();
    let pending = h.ledger.pending_withdrawal(alice.clone()).await.unwrap().unwrap();
    assert_eq!(pending.amount, 100);
    assert_eq!(pending.requested_at, START);

    h.clock.advance(DAY - 1);
    let err = h.ledger.execute_withdrawal(alice.clone()).await.unwrap_err();
    assert!(matches!(err, Error::DelayNotElapsed { ready_at, .. } if ready_at == START + DAY));
    assert_eq!(h.ledger.balance_of(alice.clone()).await.unwrap(), 950);

    h.clock.advance(1);
    assert_eq!(h.ledger.execute_withdrawal(alice.clone()).await.unwrap(), 100);
    assert_eq!(h.ledger.balance_of(alice.clone()).await.unwrap(), 850);
    assert_eq!(h.ledger.pending_withdrawal(alice.clone()).await.unwrap(), None);
    assert_eq!(h.provider.wallet_balance(&alice), 100);
    assert_eq!(h.ledger.check_conservation().await.unwrap(), 850);

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_new_request_supersedes_pending() {
    let h = create_test_ledger(LedgerVersion::V3, 0).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 1_000);
    h.ledger.deposit(alice.clone(), 1_000).await.unwrap();

    h.ledger.request_withdrawal(alice.clone(), 100).await.unwrap();
    h.clock.advance(3_600);
    h.ledger.request_withdrawal(alice.clone(), 200).await.unwrap();

    let pending = h.ledger.pending_withdrawal(alice.clone()).await.unwrap().unwrap();
    assert_eq!(pending.amount, 200);
    assert_eq!(pending.requested_at, START + 3_600);

    let events = h.ledger.events_for(alice.clone()).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::WithdrawalRequested {
            amount: 200,
            superseded: Some(100)
        }
    )));

    // the delay restarts with the newer request
    h.clock.set(START + DAY);
    assert!(matches!(
        h.ledger.execute_withdrawal(alice.clone()).await.unwrap_err(),
        Error::DelayNotElapsed { .. }
    ));

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_emergency_withdraw_bypasses_delay() {
    let h = create_test_ledger(LedgerVersion::V3, 0).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 1_000);
    h.ledger.deposit(alice.clone(), 1_000).await.unwrap();
    h.ledger.request_withdrawal(alice.clone(), 400).await.unwrap();

    assert_eq!(h.ledger.emergency_withdraw(alice.clone()).await.unwrap(), 1_000);
    assert_eq!(h.ledger.balance_of(alice.clone()).await.unwrap(), 0);
    assert_eq!(h.ledger.pending_withdrawal(alice.clone()).await.unwrap(), None);
    assert_eq!(h.ledger.total_deposits().await.unwrap(), 0);
    assert_eq!(h.provider.wallet_balance(&alice), 1_000);

    let err = h.ledger.emergency_withdraw(alice).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_withdrawal_delay_configuration() {
    let h = create_test_ledger(LedgerVersion::V3, 0).await;

    h.ledger
        .set_withdrawal_delay(h.admin.clone(), 3_600)
        .await
        .unwrap();
    assert_eq!(
        h.ledger.global_state().await.unwrap().withdrawal_delay_secs,
        3_600
    );

    let err = h
        .ledger
        .set_withdrawal_delay(h.admin.clone(), 31 * DAY)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .ledger
        .set_withdrawal_delay(Principal::new("bob"), 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { .. }));

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_pull_leaves_no_trace() {
    let h = create_test_ledger(LedgerVersion::V3, 500).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 1_000);

    h.provider.set_fail_pulls(true);
    let err = h.ledger.deposit(alice.clone(), 1_000).await.unwrap_err();
    assert!(matches!(err, Error::TransferFailed(_)));

    assert_eq!(h.ledger.balance_of(alice.clone()).await.unwrap(), 0);
    assert_eq!(h.ledger.total_deposits().await.unwrap(), 0);
    assert_eq!(h.ledger.global_state().await.unwrap().collected_fees, 0);
    assert!(h.ledger.events_for(alice.clone()).await.unwrap().is_empty());
    assert_eq!(h.provider.wallet_balance(&alice), 1_000);
    assert_eq!(h.ledger.metrics().transfer_failures.get(), 1);

    // a wallet that is short fails the same way
    h.provider.set_fail_pulls(false);
    let err = h.ledger.deposit(alice.clone(), 1_001).await.unwrap_err();
    assert!(matches!(err, Error::TransferFailed(_)));

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_push_restores_prior_state() {
    let h = create_test_ledger(LedgerVersion::V3, 0).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 1_000);
    h.ledger.deposit(alice.clone(), 1_000).await.unwrap();
    h.ledger.request_withdrawal(alice.clone(), 300).await.unwrap();
    h.clock.advance(DAY);

    let account_before = h.ledger.account(alice.clone()).await.unwrap();
    let events_before = h.ledger.events_for(alice.clone()).await.unwrap();

    h.provider.set_fail_pushes(true);
    assert!(matches!(
        h.ledger.withdraw(alice.clone(), 100).await.unwrap_err(),
        Error::TransferFailed(_)
    ));
    assert!(matches!(
        h.ledger.execute_withdrawal(alice.clone()).await.unwrap_err(),
        Error::TransferFailed(_)
    ));
    assert!(matches!(
        h.ledger.emergency_withdraw(alice.clone()).await.unwrap_err(),
        Error::TransferFailed(_)
    ));

    assert_eq!(h.ledger.account(alice.clone()).await.unwrap(), account_before);
    assert_eq!(h.ledger.events_for(alice.clone()).await.unwrap(), events_before);
    assert_eq!(h.ledger.total_deposits().await.unwrap(), 1_000);
    assert_eq!(h.ledger.check_conservation().await.unwrap(), 1_000);
    assert_eq!(h.ledger.metrics().transfer_failures.get(), 3);

    // the restored request still executes
    h.provider.set_fail_pushes(false);
    assert_eq!(h.ledger.execute_withdrawal(alice.clone()).await.unwrap(), 300);
    assert_eq!(h.ledger.balance_of(alice).await.unwrap(), 700);

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_operations_gated_by_version() {
    let h = create_test_ledger(LedgerVersion::V2, 0).await;
    let alice = Principal::new("alice");

    assert_eq!(h.ledger.accrued_yield(alice.clone()).await.unwrap(), 0);
    let err = h
        .ledger
        .request_withdrawal(alice.clone(), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::UnsupportedOperation {
            version: LedgerVersion::V2,
            ..
        }
    ));
    assert!(h.ledger.emergency_withdraw(alice).await.is_err());

    h.ledger.shutdown().await.unwrap();
}

/// Everything a denied call must leave untouched
async fn observable_state(
    ledger: &Ledger,
    principals: &[Principal],
) -> (GlobalState, Vec<Vec<Principal>>, Vec<usize>) {
    let global = ledger.global_state().await.unwrap();
    let mut members = Vec::new();
    for role in Role::ALL {
        members.push(ledger.role_members(role).await.unwrap());
    }
    let mut events = Vec::new();
    for principal in principals {
        events.push(ledger.events_for(principal.clone()).await.unwrap().len());
    }
    (global, members, events)
}

#[tokio::test]
async fn test_denied_admin_calls_leave_state_untouched() {
    let h = create_test_ledger(LedgerVersion::V3, 500).await;
    let mallory = Principal::new("mallory");
    let ops = Principal::new("ops");
    h.ledger
        .grant_role(h.admin.clone(), ops.clone(), Role::Pauser)
        .await
        .unwrap();

    let principals = [h.admin.clone(), mallory.clone(), ops.clone()];
    let before = observable_state(&h.ledger, &principals).await;

    let err = h
        .ledger
        .set_deposit_fee(mallory.clone(), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    // a pauser is not an admin
    let err = h.ledger.set_deposit_fee(ops.clone(), 100).await.unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h
        .ledger
        .set_deposit_fee(h.admin.clone(), 10_001)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h
        .ledger
        .set_yield_rate(mallory.clone(), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h
        .ledger
        .set_withdrawal_delay(mallory.clone(), 60)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h.ledger.pause_deposits(mallory.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Pauser, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h.ledger.unpause_deposits(mallory.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Pauser, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h
        .ledger
        .grant_role(mallory.clone(), mallory.clone(), Role::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h
        .ledger
        .grant_role(ops.clone(), mallory.clone(), Role::Pauser)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h
        .ledger
        .revoke_role(mallory.clone(), h.admin.clone(), Role::Admin)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Admin, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    let err = h
        .ledger
        .upgrade(mallory.clone(), LedgerVersion::V3)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Authorization { role: Role::Upgrader, .. }));
    assert_eq!(observable_state(&h.ledger, &principals).await, before);

    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_deposit_fee_applies_to_later_deposits() {
    let h = create_test_ledger(LedgerVersion::V1, 500).await;
    let alice = Principal::new("alice");
    h.provider.fund(&alice, 1_000);

    h.ledger.set_deposit_fee(h.admin.clone(), 100).await.unwrap();
    assert_eq!(h.ledger.global_state().await.unwrap().deposit_fee_bps, 100);
    let events = h.ledger.events_for(h.admin.clone()).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::DepositFeeUpdated {
            deposit_fee_bps: 100
        }
    )));

    let receipt = h.ledger.deposit(alice.clone(), 1_000).await.unwrap();
    assert_eq!(receipt.fee, 10);
    assert_eq!(h.ledger.balance_of(alice).await.unwrap(), 990);

    h.ledger.shutdown().await.unwrap();
}
