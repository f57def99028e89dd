use dojogate_entitlements::audit::fact_type;
use dojogate_entitlements::{EntitlementError, EntitlementStore};
use dojogate_shared::{AccessSource, SubscriptionStatus, TrialStatus};
use std::collections::{BTreeMap, BTreeSet};
use time::Duration;

use crate::common::{feature, Harness, T0};

#[tokio::test]
async fn test_override_always_wins() {
    let h = Harness::new().await;
    let dojo = h.onboard("professional", SubscriptionStatus::Active);
    h.billing.activate(dojo, "exams");
    h.engine.trials.start_trial(dojo, "exams", T0).await.unwrap();

    for allow in [false, true] {
        for key in ["calendar", "sepa", "exams"] {
            h.engine
                .overrides
                .set_override(dojo, key, Some(allow), T0)
                .await
                .unwrap();
            let d = h.engine.entitlements.resolve(dojo, key, T0).await.unwrap();
            assert_eq!(d.granted, allow, "{key}");
            assert_eq!(d.source, AccessSource::Override);
        }
    }
}

#[tokio::test]
async fn test_clearing_override_restores_precedence() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Cancelled);

    h.engine
        .overrides
        .set_override(dojo, "calendar", Some(true), T0)
        .await
        .unwrap();
    assert!(h.engine.entitlements.resolve(dojo, "calendar", T0).await.unwrap().granted);

    let sub = h
        .engine
        .overrides
        .set_override(dojo, "calendar", None, T0)
        .await
        .unwrap();
    assert!(sub.feature_overrides.is_empty());

    // Cancelled subscription with no override is denied even though the plan includes it
    let d = h.engine.entitlements.resolve(dojo, "calendar", T0).await.unwrap();
    assert!(!d.granted);
    assert_eq!(d.source, AccessSource::None);

    assert_eq!(h.audit.facts_of_type(fact_type::OVERRIDE_SET).len(), 1);
    assert_eq!(h.audit.facts_of_type(fact_type::OVERRIDE_CLEARED).len(), 1);
}

#[tokio::test]
async fn test_override_does_not_touch_trials() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    let started = h.engine.trials.start_trial(dojo, "sepa", T0).await.unwrap();

    h.engine
        .overrides
        .set_override(dojo, "sepa", Some(false), T0)
        .await
        .unwrap();
    let trials = h.engine.trials.list_trials(dojo).await.unwrap();
    assert_eq!(trials[0].id, started.trial.id);
    assert_eq!(trials[0].status, TrialStatus::Active);
}

#[tokio::test]
async fn test_batch_overrides_validate_every_key_first() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);

    let mut changes = BTreeMap::new();
    changes.insert("sepa".to_string(), Some(true));
    changes.insert("warp_drive".to_string(), Some(true));
    let err = h
        .engine
        .overrides
        .set_overrides(dojo, &changes, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));
    assert!(h.audit.facts().is_empty());

    changes.remove("warp_drive");
    changes.insert("exams".to_string(), Some(false));
    let sub = h.engine.overrides.set_overrides(dojo, &changes, T0).await.unwrap();
    assert_eq!(sub.override_for("sepa"), Some(true));
    assert_eq!(sub.override_for("exams"), Some(false));

    let err = h
        .engine
        .overrides
        .set_overrides(uuid::Uuid::new_v4(), &changes, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));
}

#[tokio::test]
async fn test_plan_edit_is_visible_on_next_resolve() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    assert!(!h.engine.entitlements.resolve(dojo, "sepa", T0).await.unwrap().granted);

    let features: BTreeSet<String> = ["calendar", "sepa"].iter().map(|s| s.to_string()).collect();
    h.engine
        .catalog
        .set_plan_features("starter", features, T0)
        .await
        .unwrap();

    let d = h.engine.entitlements.resolve(dojo, "sepa", T0).await.unwrap();
    assert!(d.granted);
    assert_eq!(d.source, AccessSource::Plan);

    let removed: BTreeSet<String> = BTreeSet::new();
    h.engine
        .catalog
        .set_plan_features("starter", removed, T0)
        .await
        .unwrap();
    assert!(!h.engine.entitlements.resolve(dojo, "calendar", T0).await.unwrap().granted);
}

#[tokio::test]
async fn test_plan_edit_rejects_unknown_plan_and_feature() {
    let h = Harness::new().await;

    let err = h
        .engine
        .catalog
        .set_plan_features("platinum", BTreeSet::new(), T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));

    let bogus: BTreeSet<String> = ["hoverboards".to_string()].into_iter().collect();
    let err = h
        .engine
        .catalog
        .set_plan_features("starter", bogus, T0)
        .await
        .unwrap_err();
    assert!(matches!(err, EntitlementError::NotFound(_)));
}

#[tokio::test]
async fn test_registered_feature_is_trialable_immediately() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);

    let mut video = feature("video", true, false);
    video.trial_days = 7;
    h.engine.catalog.register_feature(video.clone(), T0).await.unwrap();

    let err = h.engine.catalog.register_feature(video, T0).await.unwrap_err();
    assert!(matches!(err, EntitlementError::Conflict(_)));

    let started = h.engine.trials.start_trial(dojo, "video", T0).await.unwrap();
    assert_eq!(started.trial.expires_at, T0 + Duration::days(7));
    assert_eq!(started.decision.days_remaining, Some(7));
}

#[tokio::test]
async fn test_catalog_shutdown_fails_closed() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);

    h.engine.shutdown().await;
    let err = h.engine.entitlements.resolve(dojo, "calendar", T0).await.unwrap_err();
    assert!(err.is_unavailable());

    h.engine.catalog.reload().await.unwrap();
    assert!(h.engine.entitlements.resolve(dojo, "calendar", T0).await.unwrap().granted);
}

#[tokio::test]
async fn test_failed_batch_applies_no_override() {
    let h = Harness::new().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);
    h.engine
        .overrides
        .set_override(dojo, "calendar", Some(false), T0)
        .await
        .unwrap();

    // Keys apply in order calendar, exams, sepa; the write fails on the last one
    h.store.fail_override_writes_for("sepa", true);
    let changes = BTreeMap::from([
        ("calendar".to_string(), None),
        ("exams".to_string(), Some(true)),
        ("sepa".to_string(), Some(true)),
    ]);
    let err = h
        .engine
        .overrides
        .set_overrides(dojo, &changes, T0)
        .await
        .unwrap_err();
    assert!(err.is_unavailable());

    let sub = h.store.subscription(dojo).await.unwrap().unwrap();
    assert_eq!(sub.feature_overrides, BTreeMap::from([("calendar".to_string(), false)]));
    assert_eq!(h.audit.facts_of_type(fact_type::OVERRIDE_SET).len(), 1);
    assert!(h.audit.facts_of_type(fact_type::OVERRIDE_CLEARED).is_empty());

    h.store.fail_override_writes_for("sepa", false);
    let sub = h.engine.overrides.set_overrides(dojo, &changes, T0).await.unwrap();
    assert_eq!(sub.override_for("calendar"), None);
    assert_eq!(sub.override_for("exams"), Some(true));
    assert_eq!(sub.override_for("sepa"), Some(true));
}

#[tokio::test]
async fn test_catalog_edits_from_another_engine_are_visible() {
    let h = Harness::new().await;
    let replica = h.second_engine().await;
    let dojo = h.onboard("starter", SubscriptionStatus::Active);

    let mut video = feature("video", true, false);
    video.trial_days = 7;
    h.engine.catalog.register_feature(video, T0).await.unwrap();
    assert!(replica.catalog.feature("video").await.unwrap().is_some());
    replica.trials.start_trial(dojo, "video", T0).await.unwrap();

    let features: BTreeSet<String> = ["calendar", "sepa"].iter().map(|s| s.to_string()).collect();
    h.engine
        .catalog
        .set_plan_features("starter", features, T0)
        .await
        .unwrap();
    let d = replica.entitlements.resolve(dojo, "sepa", T0).await.unwrap();
    assert!(d.granted);
    assert_eq!(d.source, AccessSource::Plan);

    // Written straight to storage, bypassing every cache
    h.store
        .set_plan_features("starter", &BTreeSet::new())
        .await
        .unwrap();
    assert!(!h.engine.entitlements.resolve(dojo, "calendar", T0).await.unwrap().granted);
    assert!(!replica.entitlements.resolve(dojo, "calendar", T0).await.unwrap().granted);
}
