use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use testresult::TestResult;

use super::*;
use crate::catalog::InMemoryCatalog;
use crate::clock::MockClock;
use crate::deposit::provider::MockPaymentProvider;
use crate::error::{CouponError, ErrorKind};
use crate::model::{Chapter, ChapterId, Course, CouponScope, PricingKind};
use crate::notify::{NotificationKind, RecordingNotifier};

struct World {
    commerce: Arc<Commerce>,
    catalog: Arc<InMemoryCatalog>,
    notifier: Arc<RecordingNotifier>,
    admin: AccountId,
    instructor: AccountId,
}

fn world() -> World {
    world_with(RecordingNotifier::new())
}

fn world_with(notifier: RecordingNotifier) -> World {
    let mut config = CommerceConfig::default();
    config.provider.receiving_account = "0011223344".to_string();

    let catalog = Arc::new(InMemoryCatalog::new());
    let notifier = Arc::new(notifier);
    let collaborators = Collaborators {
        catalog: catalog.clone(),
        provider: Arc::new(MockPaymentProvider::new()),
        notifier: notifier.clone(),
        clock: Arc::new(MockClock::default()),
    };
    let commerce = Commerce::new(config, Arc::new(Store::new()), collaborators).unwrap();
    let admin = commerce.register_account("admin", Role::Admin).unwrap().id;
    let instructor = commerce
        .register_account("instructor", Role::Instructor)
        .unwrap()
        .id;

    World {
        commerce: Arc::new(commerce),
        catalog,
        notifier,
        admin,
        instructor,
    }
}

impl World {
    fn student(&self, name: &str) -> AccountId {
        self.commerce
            .register_account(name, Role::Student)
            .unwrap()
            .id
    }

    fn fund(&self, account: AccountId, amount: Decimal) {
        self.commerce
            .adjust_wallet(self.admin, account, amount, "opening balance")
            .unwrap();
    }

    fn course(&self, price: Decimal) -> Course {
        let course = Course {
            id: CourseId::new(),
            title: "Ownership in Practice".into(),
            instructor_id: self.instructor,
            price,
            pricing: if price.is_zero() {
                PricingKind::Free
            } else {
                PricingKind::Paid
            },
            published: true,
            revenue_share: None,
            specialization_id: None,
            chapters: vec![Chapter {
                id: ChapterId::new(),
                lessons: (0..4).map(|_| LessonId::new()).collect(),
            }],
        };
        self.catalog.upsert(course.clone());
        course
    }

    fn coupon(&self, code: &str, percent: u8, max_usage: Option<u32>) -> Coupon {
        self.commerce
            .create_coupon(
                self.admin,
                NewCoupon {
                    code: code.into(),
                    discount_percent: percent,
                    max_usage,
                    expires_at: None,
                    scope: CouponScope::All,
                },
            )
            .unwrap()
    }

    fn balance(&self, account: AccountId) -> Decimal {
        self.commerce.wallet_balance(account).unwrap()
    }

    fn used_count(&self, code: &str) -> u32 {
        self.commerce
            .store()
            .read(|q| q.coupon_by_code(code).map(|c| c.used_count))
            .unwrap()
    }

    fn assert_ledger_consistent(&self) {
        self.commerce.store().read(|q| {
            for account in q.accounts() {
                assert!(
                    ledger::is_consistent(q, account.id),
                    "balance of {} drifted from its ledger",
                    account.display_name
                );
            }
        });
    }
}

fn webhook(txn: &str, amount: u64, description: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "data": { "transaction_id": txn, "amount": amount, "description": description }
    }))
    .unwrap()
}

// =============================================================================
// Purchases
// =============================================================================

#[tokio::test]
async fn test_discounted_purchase_spends_whole_balance() -> TestResult {
    let w = world();
    let student = w.student("ana");
    w.fund(student, dec!(80000));
    let course = w.course(dec!(100000));
    w.coupon("SAVE20", 20, None);

    let enrollment = w.commerce.enroll(course.id, student, Some("save20")).await?;

    assert_eq!(enrollment.price_paid, dec!(80000));
    assert!(enrollment.coupon_id.is_some());
    assert_eq!(w.balance(student), Decimal::ZERO);
    assert_eq!(w.used_count("SAVE20"), 1);

    let entries = w.commerce.ledger_entries(student, student)?;
    assert_eq!(entries.last().map(|e| e.amount), Some(dec!(-80000)));
    assert_eq!(entries.last().map(|e| e.kind), Some(EntryKind::CoursePurchase));

    let earnings = w.commerce.instructor_earnings(w.instructor, w.instructor)?;
    assert_eq!(earnings.len(), 1);
    assert_eq!(earnings[0].amount, dec!(64000));
    assert_eq!(w.balance(w.instructor), dec!(64000));

    let sent = w.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, NotificationKind::Enrollment);
    assert_eq!(sent[0].account_id, student);
    w.assert_ledger_consistent();
    Ok(())
}

#[tokio::test]
async fn test_one_short_changes_nothing() {
    let w = world();
    let student = w.student("ana");
    w.fund(student, dec!(79999));
    let course = w.course(dec!(100000));
    w.coupon("SAVE20", 20, None);

    let err = w
        .commerce
        .enroll(course.id, student, Some("SAVE20"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

    assert_eq!(w.balance(student), dec!(79999));
    assert_eq!(w.used_count("SAVE20"), 0);
    assert_eq!(w.commerce.ledger_entries(student, student).unwrap().len(), 1);
    assert!(w.commerce.get_progress(course.id, student).is_err());
    assert!(w
        .commerce
        .instructor_earnings(w.admin, w.instructor)
        .unwrap()
        .is_empty());
    assert!(w.notifier.sent().is_empty());
    w.assert_ledger_consistent();
}

#[tokio::test]
async fn test_coupon_reuse_on_other_course() {
    let w = world();
    let student = w.student("ana");
    w.fund(student, dec!(500000));
    let first = w.course(dec!(100000));
    let second = w.course(dec!(100000));
    w.coupon("SAVE10", 10, None);

    w.commerce
        .enroll(first.id, student, Some("SAVE10"))
        .await
        .unwrap();
    let err = w
        .commerce
        .enroll(second.id, student, Some("SAVE10"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CommerceError::Coupon(CouponError::AlreadyRedeemed { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(w.balance(student), dec!(410000));
    assert_eq!(w.used_count("SAVE10"), 1);
    assert!(w.commerce.get_progress(second.id, student).is_err());
}

#[tokio::test]
async fn test_instructor_cannot_buy_own_course() {
    let w = world();
    w.fund(w.instructor, dec!(200000));
    let course = w.course(dec!(100000));

    let err = w
        .commerce
        .enroll(course.id, w.instructor, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert_eq!(w.balance(w.instructor), dec!(200000));

    let err = w.commerce.enroll(course.id, w.admin, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_free_course_needs_no_funds() {
    let w = world();
    let student = w.student("ana");
    let course = w.course(Decimal::ZERO);

    let enrollment = w.commerce.enroll(course.id, student, None).await.unwrap();
    assert_eq!(enrollment.price_paid, Decimal::ZERO);
    assert!(w.commerce.ledger_entries(student, student).unwrap().is_empty());
    assert!(w
        .commerce
        .instructor_earnings(w.instructor, w.instructor)
        .unwrap()
        .is_empty());

    let err = w.commerce.enroll(course.id, student, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_full_discount_still_uses_coupon() {
    let w = world();
    let student = w.student("ana");
    let course = w.course(dec!(100000));
    w.coupon("FREEBIE", 100, Some(5));

    let enrollment = w
        .commerce
        .enroll(course.id, student, Some("FREEBIE"))
        .await
        .unwrap();
    assert_eq!(enrollment.price_paid, Decimal::ZERO);
    assert_eq!(w.used_count("FREEBIE"), 1);
    assert!(w.commerce.ledger_entries(student, student).unwrap().is_empty());
}

#[tokio::test]
async fn test_unpublished_course_not_found() {
    let w = world();
    let student = w.student("ana");
    let course = w.course(dec!(100));
    w.catalog.set_published(course.id, false);

    let err = w.commerce.enroll(course.id, student, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test_log::test(tokio::test)]
async fn test_notification_failure_keeps_enrollment() {
    let w = world_with(RecordingNotifier::failing());
    let student = w.student("ana");
    w.fund(student, dec!(100000));
    let course = w.course(dec!(100000));

    let enrollment = w.commerce.enroll(course.id, student, None).await.unwrap();
    let progress = w.commerce.get_progress(course.id, student).unwrap();
    assert_eq!(progress.progress, Decimal::ZERO);
    assert_eq!(enrollment.price_paid, dec!(100000));
    assert_eq!(w.balance(student), Decimal::ZERO);
}

// =============================================================================
// Races
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_coupon_use_goes_to_one_buyer() {
    let w = world();
    let course = w.course(dec!(100000));
    w.coupon("LAST1", 50, Some(1));
    let buyers: Vec<AccountId> = (0..2).map(|i| w.student(&format!("buyer-{i}"))).collect();
    for buyer in &buyers {
        w.fund(*buyer, dec!(100000));
    }

    let course_id = course.id;
    let handles: Vec<_> = buyers
        .iter()
        .map(|&buyer| {
            let commerce = w.commerce.clone();
            tokio::spawn(async move { commerce.enroll(course_id, buyer, Some("LAST1")).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::LimitReached),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(w.used_count("LAST1"), 1);

    let mut balances: Vec<Decimal> = buyers.iter().map(|b| w.balance(*b)).collect();
    balances.sort();
    assert_eq!(balances, vec![dec!(50000), dec!(100000)]);
    w.assert_ledger_consistent();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coupon_limit_holds_under_contention() {
    let w = world();
    let course = w.course(dec!(100000));
    let coupon = w.coupon("TRIO", 50, Some(3));
    let buyers: Vec<AccountId> = (0..10).map(|i| w.student(&format!("buyer-{i}"))).collect();
    for buyer in &buyers {
        w.fund(*buyer, dec!(100000));
    }

    let course_id = course.id;
    let handles: Vec<_> = buyers
        .iter()
        .map(|&buyer| {
            let commerce = w.commerce.clone();
            tokio::spawn(async move { commerce.enroll(course_id, buyer, Some("TRIO")).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(enrollment) => {
                assert_eq!(enrollment.price_paid, dec!(50000));
                winners += 1;
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::LimitReached),
        }
    }
    assert_eq!(winners, 3);
    assert_eq!(w.used_count("TRIO"), 3);

    w.commerce.store().read(|q| {
        let redeemed = buyers
            .iter()
            .filter(|&&b| q.redemption(coupon.id, b).is_some())
            .count();
        let enrolled = buyers
            .iter()
            .filter(|&&b| q.enrollment_for(b, course_id).is_some())
            .count();
        assert_eq!(redeemed, 3);
        assert_eq!(enrolled, 3);
    });
    let spent = buyers
        .iter()
        .filter(|&&b| w.balance(b) == dec!(50000))
        .count();
    assert_eq!(spent, 3);
    w.assert_ledger_consistent();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_double_enrollment() {
    let w = world();
    let student = w.student("ana");
    w.fund(student, dec!(300000));
    let course = w.course(dec!(100000));

    let course_id = course.id;
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let commerce = w.commerce.clone();
            tokio::spawn(async move { commerce.enroll(course_id, student, None).await })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(w.balance(student), dec!(200000));
    w.assert_ledger_consistent();
}

// =============================================================================
// Deposits
// =============================================================================

#[tokio::test]
async fn test_double_webhook_credits_once() -> TestResult {
    let w = world();
    let student = w.student("ana");
    let intent = w.commerce.create_deposit(student, dec!(50000)).await?;
    let body = webhook("FT-1", 50000, &intent.content);

    let first = w.commerce.handle_webhook(&body).await?;
    let second = w.commerce.handle_webhook(&body).await?;

    assert!(matches!(first, WebhookAck::Credited { .. }));
    assert_eq!(second, WebhookAck::Duplicate { deposit_id: intent.id });
    assert_eq!(w.balance(student), dec!(50000));
    assert_eq!(
        w.commerce.deposit_status(student, intent.id)?.status,
        crate::model::DepositStatus::Completed
    );
    w.assert_ledger_consistent();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_webhooks_credit_once() {
    let w = world();
    let student = w.student("ana");
    let intent = w.commerce.create_deposit(student, dec!(50000)).await.unwrap();
    let body = Arc::new(webhook("FT-2", 50000, &format!("IBFT {}", intent.content)));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let commerce = w.commerce.clone();
            let body = body.clone();
            tokio::spawn(async move { commerce.handle_webhook(&body).await })
        })
        .collect();

    let mut credited = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            WebhookAck::Credited { .. } => credited += 1,
            WebhookAck::Duplicate { deposit_id } => assert_eq!(deposit_id, intent.id),
            other => panic!("unexpected ack {other:?}"),
        }
    }
    assert_eq!(credited, 1);
    assert_eq!(w.balance(student), dec!(50000));
    let deposits = w
        .notifier
        .sent()
        .into_iter()
        .filter(|n| n.kind == NotificationKind::Deposit)
        .count();
    assert_eq!(deposits, 1);
}

#[tokio::test]
async fn test_deposit_then_purchase() {
    let w = world();
    let student = w.student("ana");
    let course = w.course(dec!(100000));
    w.coupon("SAVE20", 20, None);

    let intent = w.commerce.create_deposit(student, dec!(80000)).await.unwrap();
    w.commerce
        .handle_webhook(&webhook("FT-3", 80000, &intent.content))
        .await
        .unwrap();
    w.commerce
        .enroll(course.id, student, Some("SAVE20"))
        .await
        .unwrap();

    assert_eq!(w.balance(student), Decimal::ZERO);
    let kinds: Vec<EntryKind> = w
        .commerce
        .ledger_entries(student, student)
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(kinds, vec![EntryKind::Deposit, EntryKind::CoursePurchase]);
    w.assert_ledger_consistent();
}

// =============================================================================
// Coupons, wallets and progress
// =============================================================================

#[test]
fn test_apply_coupon_is_dry_run() {
    let w = world();
    let student = w.student("ana");
    let course = w.course(dec!(100000));
    w.coupon("SAVE20", 20, Some(1));

    let preview = w.commerce.apply_coupon("save20", course.id, student).unwrap();
    assert_eq!(preview.discount_percent, 20);
    assert_eq!(preview.final_price, dec!(80000));
    assert_eq!(preview.original_price, dec!(100000));
    assert_eq!(w.used_count("SAVE20"), 0);

    let err = w.commerce.apply_coupon("NOPE", course.id, student).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_deactivated_coupon_rejected() {
    let w = world();
    let student = w.student("ana");
    let course = w.course(dec!(100000));
    w.coupon("GONE", 20, None);

    let err = w.commerce.deactivate_coupon(student, "GONE").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    w.commerce.deactivate_coupon(w.admin, "gone").unwrap();

    let err = w.commerce.apply_coupon("GONE", course.id, student).unwrap_err();
    assert!(matches!(err, CommerceError::Coupon(CouponError::Inactive { .. })));
}

#[test]
fn test_adjust_wallet_rules() {
    let w = world();
    let student = w.student("ana");

    let err = w
        .commerce
        .adjust_wallet(w.instructor, student, dec!(10), "gift")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    w.fund(student, dec!(100));
    let err = w
        .commerce
        .adjust_wallet(w.admin, student, dec!(-100.01), "chargeback")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);
    let entry = w
        .commerce
        .adjust_wallet(w.admin, student, dec!(-40), "chargeback")
        .unwrap();
    assert_eq!(entry.amount, dec!(-40));
    assert_eq!(w.balance(student), dec!(60));

    let err = w
        .commerce
        .adjust_wallet(w.admin, student, Decimal::ZERO, "noop")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    w.assert_ledger_consistent();
}

#[test]
fn test_financials_are_private() {
    let w = world();
    let ana = w.student("ana");
    let bob = w.student("bob");

    let err = w.commerce.ledger_entries(bob, ana).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(w.commerce.ledger_entries(w.admin, ana).is_ok());
    let err = w.commerce.instructor_earnings(bob, w.instructor).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[test]
fn test_register_account_requires_name() {
    let w = world();
    let err = w.commerce.register_account("   ", Role::Student).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_progress_through_facade() {
    let w = world();
    let student = w.student("ana");
    let course = w.course(Decimal::ZERO);
    w.commerce.enroll(course.id, student, None).await.unwrap();

    let lessons: Vec<LessonId> = course.lessons().copied().collect();
    w.commerce
        .record_lesson_event(student, lessons[0], true)
        .unwrap();
    let snapshot = w
        .commerce
        .record_lesson_event(student, lessons[1], true)
        .unwrap();
    assert_eq!(snapshot.progress, dec!(50.00));
    assert_eq!(snapshot.completed_at, None);

    for lesson in &lessons[2..] {
        w.commerce.record_lesson_event(student, *lesson, true).unwrap();
    }
    let done = w.commerce.recalc_progress(student, course.id).unwrap();
    assert_eq!(done.progress, dec!(100));
    assert!(done.completed_at.is_some());
    assert_eq!(w.commerce.get_progress(course.id, student).unwrap(), done);
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = CommerceConfig::default();
    config.instructor_share = dec!(1.5);
    let collaborators = Collaborators {
        catalog: Arc::new(InMemoryCatalog::new()),
        provider: Arc::new(MockPaymentProvider::new()),
        notifier: Arc::new(RecordingNotifier::new()),
        clock: Arc::new(MockClock::default()),
    };
    assert!(Commerce::new(config, Arc::new(Store::new()), collaborators).is_err());
}
