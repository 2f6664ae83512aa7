// tests/pipeline_e2e.rs
//
// End-to-end runs of PipelineManager against a scripted provider and a real SQLite file.
//
// Covered:
// - oil-related item goes through all four stages -> complete
// - non-oil item short-circuits after classify -> partial
// - gate threshold is inclusive (both sides of 0.6)
// - a failing stage keeps earlier results and finalizes as failed
// - re-running an item leaves exactly one record and keeps created_at
// - causal validation sees similar completed events
// - a stage that never returns valid JSON exhausts its attempts and fails the item
// - the two-item walkthrough (oil cut -> complete, rate hike -> partial)
// - explicit nulls in optional fields read as absent

mod common;

use common::*;
use oil_event_analyzer::analysis::ProviderError;
use oil_event_analyzer::record::RecordStatus;
use oil_event_analyzer::stage::{EventType, StageKind};
use oil_event_analyzer::{EventStore, NewsItem, PipelineSettings};

#[tokio::test]
async fn saudi_cut_runs_all_stages_and_completes() {
    let provider = ScriptedProvider::happy();
    provider.set_default(StageKind::Classify, Ok(classify_json(true, "geopolitical", 0.92)));
    let h = Harness::new(provider);

    let rec = h.pipeline.run(&saudi_item()).await.expect("run");

    assert_eq!(rec.status, RecordStatus::Complete);
    assert!(rec.is_oil_related);
    assert_eq!(rec.event_type, Some(EventType::Geopolitical));
    assert_eq!(
        rec.stages.populated(),
        vec!["classify", "supply_demand", "sentiment", "causal_validation"]
    );
    assert!(rec.error.is_none());
    let sd = rec.stages.supply_demand.as_ref().expect("supply_demand");
    assert_eq!(
        sd.transmission_path,
        vec!["production cut", "lower supply", "higher price"]
    );
    // Calibrated intensity sits beside the raw one, neither overwrites the other.
    assert_eq!(rec.stages.sentiment.as_ref().map(|s| s.intensity), Some(0.8));
    assert_eq!(rec.effective_intensity(), Some(0.75));

    for stage in StageKind::PIPELINE {
        assert_eq!(h.provider.calls_for(stage), 1, "one call for {stage}");
    }

    let stored = h.store.get("n-saudi").await.expect("get").expect("stored");
    assert_eq!(stored.status, RecordStatus::Complete);
    assert_eq!(stored.stages, rec.stages);
}

#[tokio::test]
async fn fed_rate_item_short_circuits_to_partial() {
    let provider = ScriptedProvider::happy();
    provider.when(
        "Federal Reserve",
        StageKind::Classify,
        Ok(classify_json(false, "macro", 0.85)),
    );
    let h = Harness::new(provider);

    let rec = h.pipeline.run(&fed_item()).await.expect("run");

    assert_eq!(rec.status, RecordStatus::Partial);
    assert!(!rec.is_oil_related);
    assert_eq!(rec.stages.populated(), vec!["classify"]);
    assert!(rec.stages.downstream_empty());
    assert_eq!(h.provider.calls_for(StageKind::SupplyDemandAnalyze), 0);
    assert_eq!(h.provider.calls_for(StageKind::CausalValidate), 0);
}

#[tokio::test]
async fn gate_threshold_is_inclusive() {
    let provider = ScriptedProvider::happy();
    provider.when("AT-THRESHOLD", StageKind::Classify, Ok(classify_json(true, "inventory", 0.6)));
    provider.when("BELOW-THRESHOLD", StageKind::Classify, Ok(classify_json(true, "inventory", 0.59)));
    let settings = PipelineSettings {
        classify_confidence_threshold: 0.6,
        ..PipelineSettings::default()
    };
    let h = Harness::with_settings(provider, settings, 3);

    let at = NewsItem::new("at", "AT-THRESHOLD crude stocks draw", day("2024-06-05"));
    let below = NewsItem::new("below", "BELOW-THRESHOLD crude stocks draw", day("2024-06-05"));

    let at = h.pipeline.run(&at).await.expect("run at");
    let below = h.pipeline.run(&below).await.expect("run below");

    assert_eq!(at.status, RecordStatus::Complete, "0.6 passes the gate");
    assert_eq!(below.status, RecordStatus::Partial, "0.59 does not");
    assert_eq!(below.stages.populated(), vec!["classify"]);
}

#[tokio::test]
async fn failing_stage_keeps_earlier_results() {
    let provider = ScriptedProvider::happy();
    provider.set_default(
        StageKind::SentimentScore,
        Err(ProviderError::Transient("503 from upstream".into())),
    );
    let h = Harness::with_settings(provider, PipelineSettings::default(), 2);

    let rec = h.pipeline.run(&saudi_item()).await.expect("run");

    assert_eq!(rec.status, RecordStatus::Failed);
    assert_eq!(rec.stages.populated(), vec!["classify", "supply_demand"]);
    let err = rec.error.as_deref().unwrap_or_default();
    assert!(err.contains("sentiment"), "error names the stage: {err}");
    assert_eq!(h.provider.calls_for(StageKind::SentimentScore), 2);
    assert_eq!(h.provider.calls_for(StageKind::CausalValidate), 0);

    let stored = h.store.get("n-saudi").await.unwrap().unwrap();
    assert_eq!(stored.status, RecordStatus::Failed);
    assert!(stored.stages.supply_demand.is_some());
    assert!(stored.stages.sentiment.is_none());
}

#[tokio::test]
async fn rerun_is_idempotent_and_keeps_created_at() {
    let h = Harness::new(ScriptedProvider::happy());
    let item = saudi_item();

    let first_run = h.pipeline.run(&item).await.expect("first run");
    let first = h.store.get(&item.id).await.unwrap().unwrap();
    assert_eq!(first_run.created_at, first.created_at);

    h.provider
        .set_default(StageKind::SentimentScore, Ok(sentiment_json(-0.4, 0.3)));
    let second_run = h.pipeline.run(&item).await.expect("second run");
    let second = h.store.get(&item.id).await.unwrap().unwrap();

    assert_eq!(h.store.count().await.unwrap(), 1);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(second_run.created_at, first.created_at, "returned record matches the stored row");
    assert_eq!(second_run, second);
    assert!(second.updated_at >= first.updated_at);
    assert_eq!(second.polarity(), Some(-0.4), "latest run wins");
}

#[tokio::test]
async fn causal_stage_receives_similar_events() {
    let h = Harness::new(ScriptedProvider::happy());

    h.pipeline.run(&saudi_item()).await.expect("history");
    let follow_up = NewsItem::new(
        "n-follow",
        "OPEC+ extends voluntary cuts into next quarter",
        day("2024-06-10"),
    );
    let rec = h.pipeline.run(&follow_up).await.expect("run");

    let causal = rec.stages.causal_validation.as_ref().expect("causal");
    assert_eq!(causal.reference_events, 1);

    let causal_call = h
        .provider
        .calls()
        .into_iter()
        .filter(|r| r.stage == StageKind::CausalValidate)
        .last()
        .expect("causal call");
    assert!(causal_call
        .user_text()
        .contains("Saudi Arabia announces additional 1 million bpd production cut"));
}

#[tokio::test]
async fn explicit_nulls_in_optional_fields_are_accepted() {
    let provider = ScriptedProvider::happy();
    provider.set_default(
        StageKind::Classify,
        Ok(r#"{"is_oil_related": true, "event_type": "geopolitical", "confidence": 0.9,
              "keywords": null, "entities": null, "reason": null}"#
            .to_string()),
    );
    provider.set_default(
        StageKind::SupplyDemandAnalyze,
        Ok(r#"{"drivers": ["supply"], "key_entities": ["OPEC+"],
              "quantitative_indicators": null, "transmission_path": ["cut", "price"],
              "confidence": 0.7, "uncertainties": null, "reasoning": null}"#
            .to_string()),
    );
    provider.set_default(
        StageKind::SentimentScore,
        Ok(r#"{"polarity": 0.4, "intensity": 0.5, "confidence": 0.6, "basis": null}"#.to_string()),
    );
    provider.set_default(
        StageKind::CausalValidate,
        Ok(r#"{"is_causal": true, "calibrated_intensity": 0.5, "path_completeness": 0.8,
              "confounding_factors": null, "confidence": 0.7, "warning": null, "reasoning": null}"#
            .to_string()),
    );
    let h = Harness::new(provider);

    let rec = h.pipeline.run(&saudi_item()).await.expect("run");

    assert_eq!(rec.status, RecordStatus::Complete, "error: {:?}", rec.error);
    for stage in StageKind::PIPELINE {
        assert_eq!(h.provider.calls_for(stage), 1, "no retry for {stage}");
    }
    let classify = rec.stages.classify.as_ref().unwrap();
    assert!(classify.keywords.is_empty());
    assert!(rec.stages.supply_demand.as_ref().unwrap().uncertainties.is_empty());
    assert!(rec
        .stages
        .causal_validation
        .as_ref()
        .unwrap()
        .confounding_factors
        .is_empty());
}

#[tokio::test]
async fn schema_exhaustion_fails_the_item_without_a_stage_entry() {
    let provider = ScriptedProvider::happy();
    provider.set_default(StageKind::SentimentScore, Ok("not json".to_string()));
    let h = Harness::new(provider);

    let rec = h.pipeline.run(&saudi_item()).await.expect("run");

    assert_eq!(rec.status, RecordStatus::Failed);
    assert!(rec.stages.sentiment.is_none());
    assert_eq!(rec.stages.populated(), vec!["classify", "supply_demand"]);
    assert_eq!(h.provider.calls_for(StageKind::SentimentScore), 3);
    assert_eq!(h.provider.calls_for(StageKind::CausalValidate), 0);
    let err = rec.error.as_deref().unwrap_or_default();
    assert!(err.contains("malformed"), "schema failure is named: {err}");
    assert!(err.contains("sentiment"), "error names the stage: {err}");

    let stored = h.store.get("n-saudi").await.unwrap().unwrap();
    assert_eq!(stored.status, RecordStatus::Failed);
    assert!(stored.stages.sentiment.is_none());
}

#[tokio::test]
async fn two_item_walkthrough() {
    let provider = ScriptedProvider::happy();
    provider.set_default(StageKind::Classify, Ok(classify_json(true, "geopolitical", 0.92)));
    provider.when(
        "Federal Reserve",
        StageKind::Classify,
        Ok(classify_json(false, "macro", 0.85)),
    );
    let h = Harness::new(provider);

    let cut = NewsItem::new(
        "1",
        "Saudi Arabia announces surprise oil production cut",
        day("2026-01-28"),
    )
    .with_category("oil")
    .with_url("https://example.com/news/saudi-cut");
    let hike = NewsItem::new("2", "US Federal Reserve raises interest rates", day("2026-01-28"))
        .with_category("finance");

    let cut = h.pipeline.run(&cut).await.expect("run 1");
    let hike = h.pipeline.run(&hike).await.expect("run 2");

    assert_eq!(cut.status, RecordStatus::Complete);
    assert_eq!(cut.category, "oil");
    assert_eq!(cut.stages.classify.as_ref().map(|c| c.confidence), Some(0.92));
    assert_eq!(
        cut.stages.populated(),
        vec!["classify", "supply_demand", "sentiment", "causal_validation"]
    );

    assert_eq!(hike.status, RecordStatus::Partial);
    assert!(!hike.is_oil_related);
    assert_eq!(hike.category, "finance");
    assert_eq!(hike.stages.populated(), vec!["classify"]);
    assert!(hike.stages.downstream_empty());

    assert_eq!(h.store.count().await.unwrap(), 2);
    assert_eq!(h.store.get("2").await.unwrap().unwrap().status, RecordStatus::Partial);
}
