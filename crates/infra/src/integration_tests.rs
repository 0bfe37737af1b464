//! Integration tests for the issue/return pipeline.
//!
//! Tests: InventoryService → executors → stores → invoice service
//!
//! Verifies:
//! - Stock, issuance status and invoice lines stay reconciled
//! - Fee attachment is best-effort while fee reversal is a hard failure
//! - Tenant isolation and capability checks hold at the service boundary

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use schoolops_auth::{AuthzError, Principal, PrincipalId, RbacGuard, Role};
    use schoolops_core::{DomainError, Money, PersonId, TenantId};
    use schoolops_inventory::{
        ChargeType, InventoryItemPolicy, IssuanceFilter, IssuanceRejection, IssuanceRequest,
        IssuanceStatus, IssueTo, PolicyDraft, PolicyPatch, RecipientType, ReturnRequest,
    };
    use schoolops_invoicing::{
        BillingCalendar, FeeCategory, FeeInvoice, FeeInvoiceItem, InvoiceId, InvoiceItemId,
        InvoiceKey, NewInvoiceItem,
    };

    use crate::invoice_service::InvoiceService;
    use crate::issuance::{FeeAttach, FeeReversal, ReversalConfig};
    use crate::retry::RetryPolicy;
    use crate::service::{InventoryService, ServiceError};
    use crate::store::{InMemoryInvoices, IssuanceStore, StoreError, StoreResult, Stores};

    /// Invoice service that can be told to fail appends or removals.
    #[derive(Default)]
    struct FlakyInvoices {
        inner: InMemoryInvoices,
        add_failures: AtomicU32,
        lost_add_responses: AtomicU32,
        fail_removals: AtomicBool,
        refuse_removals: AtomicBool,
    }

    impl FlakyInvoices {
        fn fail_next_adds(&self, n: u32) {
            self.add_failures.store(n, Ordering::SeqCst);
        }

        /// Commit the next `n` appends but report them as failed.
        fn lose_next_add_responses(&self, n: u32) {
            self.lost_add_responses.store(n, Ordering::SeqCst);
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl InvoiceService for FlakyInvoices {
        async fn find_or_create_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<InvoiceId> {
            self.inner.find_or_create_invoice(tenant_id, key).await
        }

        async fn add_items(
            &self,
            tenant_id: TenantId,
            invoice_id: InvoiceId,
            items: Vec<NewInvoiceItem>,
        ) -> StoreResult<Vec<FeeInvoiceItem>> {
            if take(&self.add_failures) {
                return Err(StoreError::Backend("invoice service unavailable".into()));
            }
            let created = self.inner.add_items(tenant_id, invoice_id, items).await?;
            if take(&self.lost_add_responses) {
                return Err(StoreError::Backend("connection reset after commit".into()));
            }
            Ok(created)
        }

        async fn find_invoice(&self, tenant_id: TenantId, key: &InvoiceKey) -> StoreResult<Option<FeeInvoice>> {
            self.inner.find_invoice(tenant_id, key).await
        }

        async fn get_invoice(&self, tenant_id: TenantId, invoice_id: InvoiceId) -> StoreResult<Option<FeeInvoice>> {
            self.inner.get_invoice(tenant_id, invoice_id).await
        }

        async fn find_item(&self, tenant_id: TenantId, item_id: InvoiceItemId) -> StoreResult<Option<FeeInvoiceItem>> {
            self.inner.find_item(tenant_id, item_id).await
        }

        async fn remove_item(
            &self,
            tenant_id: TenantId,
            invoice_id: InvoiceId,
            item_id: InvoiceItemId,
        ) -> StoreResult<FeeInvoice> {
            if self.fail_removals.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("invoice service unavailable".into()));
            }
            if self.refuse_removals.load(Ordering::SeqCst) {
                return Err(StoreError::Conflict("invoice is finalized".into()));
            }
            self.inner.remove_item(tenant_id, invoice_id, item_id).await
        }
    }

    struct Harness {
        service: InventoryService,
        invoices: Arc<FlakyInvoices>,
        issuances: Arc<dyn IssuanceStore>,
        tenant_id: TenantId,
        admin: Principal,
    }

    fn harness_with(fee_retry: RetryPolicy, reversal: ReversalConfig) -> Harness {
        let invoices = Arc::new(FlakyInvoices::default());
        let memory = Stores::in_memory();
        let issuances = memory.issuances.clone();
        let stores = Stores {
            policies: memory.policies,
            issuances: memory.issuances,
            invoices: invoices.clone(),
        };
        let tenant_id = TenantId::new();
        let service = InventoryService::new(
            Arc::new(RbacGuard::default()),
            stores,
            BillingCalendar::default(),
            fee_retry,
            reversal,
        );
        Harness {
            service,
            invoices,
            issuances,
            tenant_id,
            admin: Principal::with_roles(PrincipalId::new(), tenant_id, vec![Role::ADMIN]),
        }
    }

    fn harness() -> Harness {
        harness_with(RetryPolicy::no_retry(), ReversalConfig::default())
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn money(v: rust_decimal::Decimal) -> Option<Money> {
        Some(Money::new(v).unwrap())
    }

    /// Scenario 1 policy: tracked, student-only, one-time 50, auto-billed.
    fn blazer() -> PolicyDraft {
        PolicyDraft {
            name: "School Blazer".into(),
            tracks_quantity: true,
            current_quantity: Some(10),
            low_stock_threshold: Some(2),
            can_be_issued: true,
            issue_to: Some(IssueTo::Student),
            is_chargeable: true,
            charge_type: Some(ChargeType::OneTime),
            charge_amount: money(dec!(50)),
            auto_add_to_fees: true,
            fee_category: Some(FeeCategory::Uniform),
            ..PolicyDraft::default()
        }
    }

    /// Deposit-charged, serially tracked, must come back within 180 days.
    fn tablet() -> PolicyDraft {
        PolicyDraft {
            name: "Tablet".into(),
            tracks_quantity: true,
            tracks_serially: true,
            current_quantity: Some(5),
            can_be_issued: true,
            issue_to: Some(IssueTo::Both),
            must_be_returned: true,
            return_duration_days: Some(180),
            is_chargeable: true,
            charge_type: Some(ChargeType::Deposit),
            charge_amount: money(dec!(200)),
            auto_add_to_fees: true,
            fee_category: Some(FeeCategory::Misc),
            ..PolicyDraft::default()
        }
    }

    fn to_student(student: PersonId, quantity: u32) -> IssuanceRequest {
        IssuanceRequest {
            issued_to_type: RecipientType::Student,
            issued_to_id: student,
            quantity,
            serial_number: None,
            charge_amount_override: None,
        }
    }

    impl Harness {
        async fn create(&self, draft: PolicyDraft) -> InventoryItemPolicy {
            self.service.create_policy(&self.admin, draft).await.unwrap()
        }

        async fn stock(&self, policy: &InventoryItemPolicy) -> Option<u32> {
            self.service
                .get_policy(&self.admin, policy.id)
                .await
                .unwrap()
                .current_quantity
        }

        async fn invoice_for(&self, student: PersonId) -> Option<FeeInvoice> {
            let key = BillingCalendar::default().key_for(student, today());
            self.invoices.find_invoice(self.tenant_id, &key).await.unwrap()
        }

        async fn return_it(
            &self,
            id: schoolops_inventory::IssuanceId,
            lost: bool,
        ) -> Result<crate::issuance::ReturnOutcome, ServiceError> {
            self.service
                .return_issuance(
                    &self.admin,
                    id,
                    ReturnRequest {
                        notes: Some("checked at counter".into()),
                        mark_as_lost: lost,
                    },
                    today(),
                )
                .await
        }
    }

    #[tokio::test]
    async fn scenario_1_issue_decrements_stock_and_bills_student() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();

        let outcome = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 2), today())
            .await
            .unwrap();

        assert_eq!(outcome.record.status, IssuanceStatus::Issued);
        assert_eq!(h.stock(&policy).await, Some(8));

        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 1);
        assert_eq!(invoice.items()[0].label, "School Blazer (x2)");
        assert_eq!(invoice.items()[0].amount, dec!(100));
        assert_eq!(invoice.items()[0].category, Some(FeeCategory::Uniform));
        assert_eq!(invoice.total_amount(), dec!(100));
        assert_eq!(invoice.key().billing_period.as_str(), "2026-10");
        assert_eq!(invoice.key().academic_year.label(), "2026-27");

        assert_eq!(outcome.fee_invoice_item_id(), Some(invoice.items()[0].id));
        assert!(matches!(outcome.fee, FeeAttach::Attached { .. }));
    }

    #[tokio::test]
    async fn scenario_2_return_restores_stock_and_removes_one_time_charge() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 2), today())
            .await
            .unwrap();

        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();

        assert_eq!(returned.record.status, IssuanceStatus::Returned);
        assert_eq!(returned.record.returned_date, Some(today()));
        assert_eq!(returned.record.return_notes.as_deref(), Some("checked at counter"));
        assert_eq!(returned.stock_after, Some(10));
        assert_eq!(h.stock(&policy).await, Some(10));
        assert!(matches!(returned.fee, FeeReversal::Removed { .. }));

        // P3: net zero for one-time charges.
        let invoice = h.invoice_for(student).await.unwrap();
        assert!(invoice.items().is_empty());
        assert_eq!(invoice.total_amount(), dec!(0));
    }

    #[tokio::test]
    async fn scenario_3_deposit_is_refunded_with_a_credit_line() {
        let h = harness();
        let policy = h.create(tablet()).await;
        let student = PersonId::new();
        let mut request = to_student(student, 1);
        request.serial_number = Some("TAB-2026-0007".into());

        let issued = h.service.issue(&h.admin, policy.id, request, today()).await.unwrap();
        assert_eq!(
            issued.record.expected_return_date,
            NaiveDate::from_ymd_opt(2027, 4, 16)
        );
        let original = issued.fee_invoice_item_id().unwrap();

        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();
        assert!(matches!(returned.fee, FeeReversal::Refunded { .. }));

        // P4: original untouched, compensating line present, net zero.
        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 2);
        let charge = invoice.item(original).unwrap();
        assert_eq!(charge.amount, dec!(200));
        let refund = invoice.items().iter().find(|i| i.id != original).unwrap();
        assert_eq!(refund.label, "Refund: Tablet — Returned");
        assert_eq!(refund.amount, dec!(-200));
        assert_eq!(invoice.total_amount(), dec!(0));
    }

    #[tokio::test]
    async fn scenario_4_insufficient_stock_is_rejected_without_mutation() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();

        let err = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 15), today())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ServiceError::Rejected(IssuanceRejection::InsufficientStock {
                available: 10,
                requested: 15
            })
        ));
        assert_eq!(h.stock(&policy).await, Some(10));
        assert!(h.invoice_for(student).await.is_none());
        let all = h
            .service
            .list_issuances(&h.admin, &IssuanceFilter::default())
            .await
            .unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn scenario_5_second_return_is_rejected_without_side_effects() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();

        h.return_it(issued.issuance_id(), false).await.unwrap();
        let invoice_before = h.invoice_for(student).await.unwrap();

        let err = h.return_it(issued.issuance_id(), true).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::AlreadyReturned {
                status: IssuanceStatus::Returned,
                ..
            }
        ));
        assert_eq!(h.stock(&policy).await, Some(10));
        assert_eq!(h.invoice_for(student).await.unwrap(), invoice_before);
    }

    #[tokio::test]
    async fn scenario_6_serial_tracking_without_quantity_is_rejected_before_insert() {
        let h = harness();
        let draft = PolicyDraft {
            tracks_serially: true,
            tracks_quantity: false,
            ..tablet()
        };

        let err = h.service.create_policy(&h.admin, draft).await.unwrap_err();
        match err {
            ServiceError::Validation(e) => assert_eq!(e.field(), Some("tracks_serially")),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(h.service.list_policies(&h.admin).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_enforces_structure_and_corrects_stock() {
        let h = harness();
        let policy = h.create(tablet()).await;

        // P5 on update.
        let err = h
            .service
            .update_policy(
                &h.admin,
                policy.id,
                PolicyPatch {
                    tracks_quantity: Some(false),
                    ..PolicyPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(DomainError::Validation { .. })));

        // P6 on create.
        let err = h
            .service
            .create_policy(
                &h.admin,
                PolicyDraft {
                    auto_add_to_fees: true,
                    fee_category: None,
                    ..blazer()
                },
            )
            .await
            .unwrap_err();
        match err {
            ServiceError::Validation(e) => assert_eq!(e.field(), Some("fee_category")),
            other => panic!("expected validation error, got {other:?}"),
        }

        let updated = h
            .service
            .update_policy(
                &h.admin,
                policy.id,
                PolicyPatch {
                    current_quantity: Some(12),
                    charge_amount: money(dec!(250)),
                    ..PolicyPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.current_quantity, Some(12));
        assert_eq!(updated.charge_amount, money(dec!(250)));
    }

    #[tokio::test]
    async fn lost_items_restore_stock_and_reverse_fee() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 3), today())
            .await
            .unwrap();

        let lost = h.return_it(issued.issuance_id(), true).await.unwrap();
        assert_eq!(lost.record.status, IssuanceStatus::Lost);
        assert_eq!(lost.record.returned_date, None);
        assert_eq!(h.stock(&policy).await, Some(10));
        assert_eq!(h.invoice_for(student).await.unwrap().total_amount(), dec!(0));
    }

    #[tokio::test]
    async fn fee_attach_failure_does_not_abort_issuance() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        h.invoices.fail_next_adds(1);

        let outcome = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();

        assert!(matches!(outcome.fee, FeeAttach::Failed { .. }));
        assert_eq!(outcome.fee_invoice_item_id(), None);
        assert_eq!(outcome.record.status, IssuanceStatus::Issued);
        assert_eq!(h.stock(&policy).await, Some(9));

        let stored = h
            .service
            .list_issuances(&h.admin, &IssuanceFilter::default())
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].fee_invoice_item_id.is_none());
    }

    #[tokio::test]
    async fn fee_attach_retries_under_explicit_policy() {
        let h = harness_with(
            RetryPolicy::fixed(2, Duration::from_millis(1)),
            ReversalConfig::default(),
        );
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        h.invoices.fail_next_adds(2);

        let outcome = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();

        assert!(matches!(outcome.fee, FeeAttach::Attached { .. }));
        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 1);
    }

    #[tokio::test]
    async fn reversal_failure_is_hard_but_status_and_stock_stay_applied() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 2), today())
            .await
            .unwrap();
        h.invoices.fail_removals.store(true, Ordering::SeqCst);

        let err = h.return_it(issued.issuance_id(), false).await.unwrap_err();
        let invoice = h.invoice_for(student).await.unwrap();
        match err {
            ServiceError::ReversalFailed {
                issuance_id,
                invoice_id,
                ..
            } => {
                assert_eq!(issuance_id, issued.issuance_id());
                assert_eq!(invoice_id, Some(invoice.id_typed()));
            }
            other => panic!("expected reversal failure, got {other:?}"),
        }

        assert_eq!(h.stock(&policy).await, Some(10));
        let records = h
            .service
            .list_issuances(&h.admin, &IssuanceFilter::default())
            .await
            .unwrap();
        assert_eq!(records[0].status, IssuanceStatus::Returned);
        assert_eq!(invoice.total_amount(), dec!(100));
    }

    #[tokio::test]
    async fn label_fallback_locates_unlinked_charge() {
        let h = harness();
        let policy = h.create(PolicyDraft {
            auto_add_to_fees: false,
            ..blazer()
        })
        .await;
        let student = PersonId::new();

        // Charge billed by hand, so the issuance carries no item link.
        let key = BillingCalendar::default().key_for(student, today());
        let invoice_id = h.invoices.find_or_create_invoice(h.tenant_id, &key).await.unwrap();
        h.invoices
            .add_items(
                h.tenant_id,
                invoice_id,
                vec![
                    NewInvoiceItem {
                        label: "Tuition".into(),
                        amount: dec!(1500),
                        category: None,
                        source_ref: None,
                    },
                    NewInvoiceItem {
                        label: policy.fee_label(1),
                        amount: dec!(50),
                        category: Some(FeeCategory::Uniform),
                        source_ref: None,
                    },
                ],
            )
            .await
            .unwrap();

        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        assert_eq!(issued.fee, FeeAttach::NotApplicable);

        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();
        assert!(matches!(returned.fee, FeeReversal::Removed { .. }));
        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 1);
        assert_eq!(invoice.total_amount(), dec!(1500));
    }

    /// Bill a line by hand on the student's invoice for the test period.
    async fn bill_by_hand(h: &Harness, student: PersonId, label: String, amount: rust_decimal::Decimal) -> FeeInvoiceItem {
        let key = BillingCalendar::default().key_for(student, today());
        let invoice_id = h.invoices.find_or_create_invoice(h.tenant_id, &key).await.unwrap();
        let mut created = h
            .invoices
            .add_items(
                h.tenant_id,
                invoice_id,
                vec![NewInvoiceItem {
                    label,
                    amount,
                    category: None,
                    source_ref: None,
                }],
            )
            .await
            .unwrap();
        created.remove(0)
    }

    #[tokio::test]
    async fn without_label_matching_unreferenced_charge_is_left_alone() {
        let h = harness_with(
            RetryPolicy::no_retry(),
            ReversalConfig {
                match_by_label: false,
            },
        );
        let policy = h.create(PolicyDraft {
            auto_add_to_fees: false,
            ..blazer()
        })
        .await;
        let student = PersonId::new();
        bill_by_hand(&h, student, policy.fee_label(1), dec!(50)).await;

        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();

        assert_eq!(returned.fee, FeeReversal::NotBilled { fee_expected: false });
        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 1);
        assert_eq!(invoice.total_amount(), dec!(50));
    }

    #[tokio::test]
    async fn unbilled_charge_without_invoice_is_not_credited() {
        let h = harness();
        let policy = h.create(PolicyDraft {
            auto_add_to_fees: false,
            ..blazer()
        })
        .await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        assert!(!issued.record.fee_expected);

        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();
        assert_eq!(returned.fee, FeeReversal::NotBilled { fee_expected: false });
        assert_eq!(returned.record.status, IssuanceStatus::Returned);
        assert_eq!(h.stock(&policy).await, Some(10));
        assert!(h.invoice_for(student).await.is_none());
    }

    #[tokio::test]
    async fn returning_unbilled_item_keeps_sibling_charge() {
        let h = harness();
        let uniform = h.create(blazer()).await;
        let book = h
            .create(PolicyDraft {
                name: "Library Book".into(),
                charge_amount: money(dec!(50)),
                auto_add_to_fees: false,
                fee_category: Some(FeeCategory::Books),
                ..blazer()
            })
            .await;
        let student = PersonId::new();

        h.service
            .issue(&h.admin, uniform.id, to_student(student, 1), today())
            .await
            .unwrap();
        let lent = h
            .service
            .issue(&h.admin, book.id, to_student(student, 1), today())
            .await
            .unwrap();
        assert_eq!(h.invoice_for(student).await.unwrap().total_amount(), dec!(50));

        let returned = h.return_it(lent.issuance_id(), false).await.unwrap();
        assert_eq!(returned.fee, FeeReversal::NotBilled { fee_expected: false });
        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 1);
        assert_eq!(invoice.total_amount(), dec!(50));
    }

    #[tokio::test]
    async fn unlinked_issuance_does_not_claim_a_sibling_charge() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();

        // Same item, same student, same period: the first attach fails.
        h.invoices.fail_next_adds(1);
        let first = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        assert!(matches!(first.fee, FeeAttach::Failed { .. }));
        let second = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        let billed = second.fee_invoice_item_id().unwrap();

        let returned = h.return_it(first.issuance_id(), false).await.unwrap();
        assert_eq!(returned.fee, FeeReversal::NotBilled { fee_expected: true });
        let invoice = h.invoice_for(student).await.unwrap();
        assert!(invoice.item(billed).is_some());
        assert_eq!(invoice.total_amount(), dec!(50));

        let returned = h.return_it(second.issuance_id(), false).await.unwrap();
        assert_eq!(
            returned.fee,
            FeeReversal::Removed {
                invoice_id: invoice.id_typed(),
                item_id: billed
            }
        );
        let invoice = h.invoice_for(student).await.unwrap();
        assert!(invoice.items().is_empty());
        assert_eq!(invoice.total_amount(), dec!(0));
        assert_eq!(h.stock(&policy).await, Some(10));
    }

    #[tokio::test]
    async fn label_fallback_skips_lines_linked_to_other_issuances() {
        let h = harness();
        let policy = h.create(PolicyDraft {
            auto_add_to_fees: false,
            ..blazer()
        })
        .await;
        let student = PersonId::new();
        let line = bill_by_hand(&h, student, policy.fee_label(1), dec!(50)).await;

        let first = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        let second = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        h.issuances
            .link_fee_item(h.tenant_id, second.issuance_id(), line.id)
            .await
            .unwrap();

        let returned = h.return_it(first.issuance_id(), false).await.unwrap();
        assert_eq!(returned.fee, FeeReversal::NotBilled { fee_expected: false });
        assert_eq!(h.invoice_for(student).await.unwrap().total_amount(), dec!(50));

        let returned = h.return_it(second.issuance_id(), false).await.unwrap();
        assert!(matches!(returned.fee, FeeReversal::Removed { item_id, .. } if item_id == line.id));
        assert_eq!(h.invoice_for(student).await.unwrap().total_amount(), dec!(0));
    }

    #[tokio::test]
    async fn deleted_linked_line_is_not_credited_again() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        let item_id = issued.fee_invoice_item_id().unwrap();

        // Cleared on the invoice side before the item comes back.
        let invoice = h.invoice_for(student).await.unwrap();
        h.invoices
            .remove_item(h.tenant_id, invoice.id_typed(), item_id)
            .await
            .unwrap();

        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();
        assert_eq!(returned.fee, FeeReversal::AlreadyCleared { item_id });
        let invoice = h.invoice_for(student).await.unwrap();
        assert!(invoice.items().is_empty());
        assert_eq!(invoice.total_amount(), dec!(0));
        assert_eq!(h.stock(&policy).await, Some(10));
    }

    #[tokio::test]
    async fn undeletable_charge_is_compensated() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        h.invoices.refuse_removals.store(true, Ordering::SeqCst);

        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();
        assert!(matches!(returned.fee, FeeReversal::Compensated { .. }));
        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 2);
        let credit = invoice.items().iter().find(|i| i.amount < dec!(0)).unwrap();
        assert_eq!(credit.label, "Refund: School Blazer — Returned");
        assert_eq!(credit.source_ref, Some(issued.record.reversal_source_ref()));
        assert_eq!(invoice.total_amount(), dec!(0));
    }

    #[tokio::test]
    async fn fee_attach_retry_after_lost_response_bills_once() {
        let h = harness_with(
            RetryPolicy::fixed(1, Duration::from_millis(1)),
            ReversalConfig::default(),
        );
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        h.invoices.lose_next_add_responses(1);

        let outcome = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();

        let invoice = h.invoice_for(student).await.unwrap();
        assert_eq!(invoice.items().len(), 1);
        assert_eq!(invoice.total_amount(), dec!(50));
        assert_eq!(
            outcome.fee,
            FeeAttach::Attached {
                invoice_id: invoice.id_typed(),
                item_id: invoice.items()[0].id
            }
        );
        assert_eq!(invoice.items()[0].source_ref, Some(outcome.record.fee_source_ref()));
    }

    #[tokio::test]
    async fn unlinked_attach_is_found_by_its_reference() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();

        // Line committed, response lost, no retry: the issuance stays unlinked.
        h.invoices.lose_next_add_responses(1);
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();
        assert!(matches!(issued.fee, FeeAttach::Failed { .. }));
        assert_eq!(h.invoice_for(student).await.unwrap().total_amount(), dec!(50));

        let returned = h.return_it(issued.issuance_id(), false).await.unwrap();
        assert!(matches!(returned.fee, FeeReversal::Removed { .. }));
        assert_eq!(h.invoice_for(student).await.unwrap().total_amount(), dec!(0));
    }

    #[tokio::test]
    async fn staff_issuance_is_charged_but_never_billed() {
        let h = harness();
        let policy = h.create(PolicyDraft {
            issue_to: Some(IssueTo::Both),
            ..blazer()
        })
        .await;
        let staff = PersonId::new();
        let outcome = h
            .service
            .issue(
                &h.admin,
                policy.id,
                IssuanceRequest {
                    issued_to_type: RecipientType::Staff,
                    issued_to_id: staff,
                    quantity: 1,
                    serial_number: None,
                    charge_amount_override: None,
                },
                today(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.fee, FeeAttach::NotApplicable);
        assert_eq!(outcome.record.charge_amount, money(dec!(50)));

        let returned = h.return_it(outcome.issuance_id(), false).await.unwrap();
        assert_eq!(returned.fee, FeeReversal::NotApplicable);
    }

    #[tokio::test]
    async fn capabilities_and_tenants_are_enforced() {
        let h = harness();
        let policy = h.create(blazer()).await;

        let staff = Principal::with_roles(PrincipalId::new(), h.tenant_id, vec![Role::STAFF]);
        assert_eq!(h.service.list_policies(&staff).await.unwrap().len(), 1);
        let err = h.service.create_policy(&staff, blazer()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(AuthzError::Forbidden(_))));
        let err = h
            .service
            .issue(&staff, policy.id, to_student(PersonId::new(), 1), today())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));

        let outsider = Principal::with_roles(PrincipalId::new(), TenantId::new(), vec![Role::ADMIN]);
        assert!(h.service.list_policies(&outsider).await.unwrap().is_empty());
        let err = h.service.get_policy(&outsider, policy.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound("policy")));
    }

    #[tokio::test]
    async fn deactivated_policy_blocks_issue_but_allows_return() {
        let h = harness();
        let policy = h.create(blazer()).await;
        let student = PersonId::new();
        let issued = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap();

        let deactivated = h.service.deactivate_policy(&h.admin, policy.id).await.unwrap();
        assert!(!deactivated.is_active);

        let err = h
            .service
            .issue(&h.admin, policy.id, to_student(student, 1), today())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(IssuanceRejection::NotIssuable { .. })));

        h.return_it(issued.issuance_id(), false).await.unwrap();
        assert_eq!(h.stock(&policy).await, Some(10));
    }

    #[tokio::test]
    async fn low_stock_and_overdue_listings() {
        let h = harness();
        let blazers = h.create(blazer()).await;
        let tablets = h.create(tablet()).await;
        let student = PersonId::new();

        h.service
            .issue(&h.admin, blazers.id, to_student(student, 8), today())
            .await
            .unwrap();
        let low = h.service.list_low_stock(&h.admin).await.unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].id, blazers.id);

        let issued = h
            .service
            .issue(&h.admin, tablets.id, to_student(student, 1), today())
            .await
            .unwrap();
        let due = issued.record.expected_return_date.unwrap();
        assert!(h.service.list_overdue(&h.admin, due).await.unwrap().is_empty());
        let overdue = h
            .service
            .list_overdue(&h.admin, due.succ_opt().unwrap())
            .await
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].id, issued.issuance_id());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// P1: over any sequence of issues and returns, stock never goes
        /// negative and on-hand plus outstanding always equals the start count.
        #[test]
        fn stock_is_conserved(ops in prop::collection::vec((any::<bool>(), 1u32..5, any::<prop::sample::Index>()), 1..30)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let h = harness();
                let policy = h.create(PolicyDraft {
                    name: "Lab Goggles".into(),
                    tracks_quantity: true,
                    current_quantity: Some(10),
                    can_be_issued: true,
                    issue_to: Some(IssueTo::Both),
                    ..PolicyDraft::default()
                }).await;

                let mut open: Vec<(schoolops_inventory::IssuanceId, u32)> = Vec::new();
                for (issue, qty, pick) in ops {
                    if issue || open.is_empty() {
                        let before = h.stock(&policy).await.unwrap();
                        match h.service.issue(&h.admin, policy.id, to_student(PersonId::new(), qty), today()).await {
                            Ok(outcome) => open.push((outcome.issuance_id(), qty)),
                            Err(ServiceError::Rejected(IssuanceRejection::InsufficientStock { available, requested })) => {
                                prop_assert_eq!(available, before);
                                prop_assert!(requested > available);
                            }
                            Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                        }
                    } else {
                        let (id, _) = open.remove(pick.index(open.len()));
                        h.return_it(id, qty % 2 == 0).await.unwrap();
                    }

                    let on_hand = h.stock(&policy).await.unwrap();
                    let outstanding: u32 = open.iter().map(|(_, q)| q).sum();
                    prop_assert_eq!(on_hand + outstanding, 10);
                }
                Ok(())
            })?;
        }
    }
}
