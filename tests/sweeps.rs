mod common;

use std::sync::Arc;

use rust_decimal_macros::dec;

use receiptflow::db::RecordStore;
use receiptflow::jobs::{run_auto_pay_sweep, run_reconciliation_sweep, SWEEP_BATCH_LIMIT};
use receiptflow::ledger::{AwaitingBill, LedgerApi};
use receiptflow::memory::ScriptedExtractor;
use receiptflow::storage::{namespace, ObjectStore, Stage};

use common::{active_tenant, integration, receipt_fields, seed_credential, test_env};

#[tokio::test(start_paused = true)]
async fn reconciliation_caps_work_per_tenant_per_run() {
    let env = test_env(Arc::new(ScriptedExtractor::succeeding(receipt_fields(
        "Acme Pty Ltd",
        "10.00",
        &[],
    ))));
    env.records.add_tenant(active_tenant("t1")).await;
    env.records.add_integration(integration("t1")).await;
    seed_credential(&env.secrets, "t1").await;

    for index in 0..7 {
        env.objects
            .put(
                &namespace("t1", Stage::Upload),
                &format!("pending-{index}.pdf"),
                b"bytes",
                None,
            )
            .await
            .unwrap();
    }

    let records = env.records.clone() as Arc<dyn RecordStore>;
    let objects = env.objects.clone() as Arc<dyn ObjectStore>;

    let processed = run_reconciliation_sweep(&records, &objects, &env.pipeline).await;
    assert_eq!(processed, SWEEP_BATCH_LIMIT);
    assert_eq!(
        env.objects
            .list(&namespace("t1", Stage::Upload))
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        env.records.list_receipts("t1").await.unwrap().len(),
        SWEEP_BATCH_LIMIT
    );

    // The next run drains the backlog.
    let processed = run_reconciliation_sweep(&records, &objects, &env.pipeline).await;
    assert_eq!(processed, 2);
    assert!(env
        .objects
        .list(&namespace("t1", Stage::Upload))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconciliation_ignores_inactive_and_disabled_tenants() {
    let env = test_env(Arc::new(ScriptedExtractor::succeeding(receipt_fields(
        "Acme Pty Ltd",
        "10.00",
        &[],
    ))));
    let mut disabled = active_tenant("t-disabled");
    disabled.settings.processing_enabled = false;
    env.records.add_tenant(disabled).await;
    let mut suspended = active_tenant("t-suspended");
    suspended.status = String::from("suspended");
    env.records.add_tenant(suspended).await;

    for tenant_id in ["t-disabled", "t-suspended"] {
        env.objects
            .put(&namespace(tenant_id, Stage::Upload), "r.pdf", b"bytes", None)
            .await
            .unwrap();
    }

    let records = env.records.clone() as Arc<dyn RecordStore>;
    let objects = env.objects.clone() as Arc<dyn ObjectStore>;
    let processed = run_reconciliation_sweep(&records, &objects, &env.pipeline).await;

    assert_eq!(processed, 0);
    for tenant_id in ["t-disabled", "t-suspended"] {
        assert_eq!(
            env.objects
                .list(&namespace(tenant_id, Stage::Upload))
                .await
                .unwrap()
                .len(),
            1
        );
    }
}

#[tokio::test(start_paused = true)]
async fn auto_pay_skips_unconfigured_tenants_and_pays_the_rest() {
    let env = test_env(Arc::new(ScriptedExtractor::succeeding(receipt_fields(
        "Acme Pty Ltd",
        "10.00",
        &[],
    ))));

    // Tenant A opted in but never configured a bank account.
    let mut tenant_a = active_tenant("ta");
    tenant_a.settings.auto_pay_enabled = true;
    env.records.add_tenant(tenant_a).await;
    env.records.add_integration(integration("ta")).await;
    seed_credential(&env.secrets, "ta").await;

    // Tenant B has one awaiting bill of 25.00.
    let mut tenant_b = active_tenant("tb");
    tenant_b.settings.auto_pay_enabled = true;
    tenant_b.settings.bank_account_id = Some(String::from("bank-b"));
    env.records.add_tenant(tenant_b).await;
    env.records.add_integration(integration("tb")).await;
    seed_credential(&env.secrets, "tb").await;
    env.ledger
        .seed_awaiting_bill(AwaitingBill {
            invoice_id: String::from("bill-1"),
            amount_due: dec!(25.00),
            due_date: Some(String::from("/Date(1700000000000)/")),
        })
        .await;

    let records = env.records.clone() as Arc<dyn RecordStore>;
    let ledger = env.ledger.clone() as Arc<dyn LedgerApi>;
    let paid = run_auto_pay_sweep(&records, &env.credentials, &ledger, &env.limiter).await;

    assert_eq!(paid, 1);

    let payments = env.ledger.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].invoice_id, "bill-1");
    assert_eq!(payments[0].account_id, "bank-b");
    assert_eq!(payments[0].amount, dec!(25.00));
    // Payment date came from the legacy-encoded due date.
    assert_eq!(payments[0].date.to_string(), "2023-11-14");

    // Exactly one audit entry, attributed to tenant B.
    let audit = env.records.audit_entries().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].tenant_id, "tb");
    assert_eq!(audit[0].action, "auto_payment_created");
    assert_eq!(audit[0].details["invoiceId"], "bill-1");
}

#[tokio::test(start_paused = true)]
async fn auto_pay_ignores_bills_with_nothing_due() {
    let env = test_env(Arc::new(ScriptedExtractor::succeeding(receipt_fields(
        "Acme Pty Ltd",
        "10.00",
        &[],
    ))));
    let mut tenant = active_tenant("t1");
    tenant.settings.auto_pay_enabled = true;
    tenant.settings.bank_account_id = Some(String::from("bank-1"));
    env.records.add_tenant(tenant).await;
    env.records.add_integration(integration("t1")).await;
    seed_credential(&env.secrets, "t1").await;
    env.ledger
        .seed_awaiting_bill(AwaitingBill {
            invoice_id: String::from("settled"),
            amount_due: dec!(0),
            due_date: None,
        })
        .await;

    let records = env.records.clone() as Arc<dyn RecordStore>;
    let ledger = env.ledger.clone() as Arc<dyn LedgerApi>;
    let paid = run_auto_pay_sweep(&records, &env.credentials, &ledger, &env.limiter).await;

    assert_eq!(paid, 0);
    assert!(env.ledger.payments().await.is_empty());
    assert!(env.records.audit_entries().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn one_failed_payment_does_not_stop_the_batch() {
    let env = test_env(Arc::new(ScriptedExtractor::succeeding(receipt_fields(
        "Acme Pty Ltd",
        "10.00",
        &[],
    ))));
    let mut tenant = active_tenant("t1");
    tenant.settings.auto_pay_enabled = true;
    tenant.settings.bank_account_id = Some(String::from("bank-1"));
    env.records.add_tenant(tenant).await;
    env.records.add_integration(integration("t1")).await;
    seed_credential(&env.secrets, "t1").await;

    env.ledger
        .seed_awaiting_bill(AwaitingBill {
            invoice_id: String::from("bill-bad"),
            amount_due: dec!(10.00),
            due_date: None,
        })
        .await;
    env.ledger
        .seed_awaiting_bill(AwaitingBill {
            invoice_id: String::from("bill-good"),
            amount_due: dec!(40.00),
            due_date: None,
        })
        .await;
    env.ledger.fail_payment_for("bill-bad").await;

    let records = env.records.clone() as Arc<dyn RecordStore>;
    let ledger = env.ledger.clone() as Arc<dyn LedgerApi>;
    let paid = run_auto_pay_sweep(&records, &env.credentials, &ledger, &env.limiter).await;

    assert_eq!(paid, 1);
    let payments = env.ledger.payments().await;
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].invoice_id, "bill-good");

    let audit = env.records.audit_entries().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].details["invoiceId"], "bill-good");
}
