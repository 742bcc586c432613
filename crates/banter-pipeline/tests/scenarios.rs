// End-to-end pipeline scenarios over in-memory SQLite and a scripted
// model provider: ingestion → windowing → learning → proactive decisions.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use banter_agent::testing::ScriptedProvider;
use banter_agent::{GenerateResponse, Provider};
use banter_core::config::BanterConfig;
use banter_core::types::{InboundMessage, OutboundMessage};
use banter_pipeline::{ChatOutbound, Pipeline};
use banter_queue::WorkerPool;
use banter_store::types::{ChangeType, Decision, FactSource};
use banter_store::FactStore;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

struct RecordingOutbound {
    sent: Mutex<Vec<OutboundMessage>>,
    next_id: AtomicI64,
}

impl RecordingOutbound {
    fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        }
    }

    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatOutbound for RecordingOutbound {
    async fn send(&self, msg: &OutboundMessage) -> Result<i64, String> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

struct Harness {
    pipeline: Arc<Pipeline>,
    store: Arc<FactStore>,
    provider: Arc<ScriptedProvider>,
    outbound: Arc<RecordingOutbound>,
}

fn harness(mutate: impl FnOnce(&mut BanterConfig)) -> Harness {
    let mut config = BanterConfig::default();
    config.window.size = 3;
    config.embedding.min_interval_ms = 0;
    config.telegram.bot_username = "banter_bot".to_string();
    mutate(&mut config);

    let store = Arc::new(FactStore::open_in_memory().unwrap());
    let provider = Arc::new(ScriptedProvider::default());
    let outbound = Arc::new(RecordingOutbound::new());
    let pipeline = Arc::new(Pipeline::new(
        config,
        Arc::clone(&store),
        Arc::clone(&provider) as Arc<dyn Provider>,
        Arc::clone(&outbound) as Arc<dyn ChatOutbound>,
    ));
    Harness {
        pipeline,
        store,
        provider,
        outbound,
    }
}

fn msg(message_id: i64, user_id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        chat_id: -100,
        thread_id: None,
        message_id,
        user_id,
        author_name: format!("user{user_id}"),
        text: text.to_string(),
        media_refs: vec![],
        has_user_media: false,
        reply_to_message_id: None,
        is_from_self: false,
        addressed: false,
        timestamp: Utc::now(),
    }
}

fn addressed(message_id: i64, user_id: i64, text: &str) -> InboundMessage {
    let mut m = msg(message_id, user_id, text);
    m.addressed = true;
    m
}

#[tokio::test]
async fn location_mentions_converge_to_one_canonical_fact() {
    // Three spellings of the same city close a window and end up as one
    // active fact at full confidence with a creation + two reinforcements.
    let h = harness(|_| {});
    h.pipeline.handle_message(&msg(1, 42, "Я з Києва")).await;
    h.pipeline.handle_message(&msg(2, 42, "Hi from Kiev")).await;
    h.pipeline.handle_message(&msg(3, 42, "Київ ❤️")).await;

    let facts = h.store.active_facts(42, -100).unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].fact_type, "personal");
    assert_eq!(facts[0].key, "location");
    assert_eq!(facts[0].value_canonical, "kyiv");
    assert!((facts[0].confidence - 1.0).abs() < 1e-9);

    let kinds: Vec<ChangeType> = h
        .store
        .fact_versions(facts[0].id)
        .unwrap()
        .iter()
        .map(|v| v.change_type)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ChangeType::Creation,
            ChangeType::Reinforcement,
            ChangeType::Reinforcement
        ]
    );

    // The window reached the processed state with a metrics row.
    let w = h.store.get_window(1).unwrap();
    assert!(w.processed);
    assert!(h.store.get_quality_metrics(1).unwrap().is_some());
}

#[tokio::test]
async fn reingesting_the_same_message_is_a_noop() {
    let h = harness(|_| {});
    let m = msg(1, 42, "Я з Києва");
    h.pipeline.handle_message(&m).await;
    h.pipeline.handle_message(&m).await;
    h.pipeline.handle_message(&m).await;

    // One stored row, no window (needs three messages), no facts yet.
    assert_eq!(h.store.recent_in_chat(-100, 10).unwrap().len(), 1);
    assert!(h.store.active_facts(42, -100).unwrap().is_empty());
}

#[tokio::test]
async fn addressed_message_gets_a_reply_and_inline_facts() {
    let h = harness(|c| c.window.size = 8);
    // The scripted reply for the tool loop.
    h.provider.push_response(GenerateResponse {
        text: "Вітаю! Запам'ятав.".to_string(),
        tool_calls: vec![],
        stop_reason: "stop".to_string(),
    });

    // Four messages keep a window open; the addressed one joins it but
    // does not close it.
    for i in 1..=4 {
        h.pipeline.handle_message(&msg(i, 42, &format!("market chatter number {i}"))).await;
    }
    h.pipeline
        .handle_message(&addressed(5, 42, "@banter_bot i live in Lviv"))
        .await;

    // A reply went out, in reply to the addressed message.
    let sent = h.outbound.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].reply_to_message_id, Some(5));
    assert_eq!(sent[0].text, "Вітаю! Запам'ятав.");

    // The inline extraction stored the fact as directly-stated.
    let facts = h.store.active_facts(42, -100).unwrap();
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].value_canonical, "lviv");
    assert_eq!(facts[0].source, FactSource::Addressed);

    // No window closed early: the open window still owns these messages.
    assert!(h.store.get_window(1).is_err());
}

#[tokio::test]
async fn model_outage_still_answers_with_the_fallback() {
    let h = harness(|c| c.window.size = 8);
    h.provider.fail_generation(true);

    h.pipeline
        .handle_message(&addressed(1, 42, "@banter_bot are you alive?"))
        .await;

    let sent = h.outbound.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].text.contains("trouble thinking"));
}

#[tokio::test]
async fn proactive_suppression_inside_global_cooldown() {
    // A SENT proactive event 200 seconds ago forces SUPPRESS with
    // block_reason global_cooldown for the next qualifying window.
    let h = harness(|c| {
        c.proactive.enabled = true;
    });

    // Prior send, aged 200s into the 300s cooldown.
    let outcome = h
        .store
        .record_send(
            &banter_store::proactive::NewProactiveEvent {
                chat_id: -100,
                window_id: 999,
                user_id: Some(7),
                intent_type: "question".to_string(),
                intent_confidence: 0.9,
                adjusted_confidence: 0.9,
                block_reason: None,
                response_message_id: Some(555),
            },
            chrono::Duration::zero(),
        )
        .unwrap();
    assert!(matches!(
        outcome,
        banter_store::proactive::SendOutcome::Recorded(_)
    ));
    {
        let conn = h.store.conn_for_tests();
        let past = (Utc::now() - chrono::Duration::seconds(200)).to_rfc3339();
        conn.execute("UPDATE proactive_events SET created_at = ?1", [&past])
            .unwrap();
    }

    // The model extractor consumes the first structured response, the
    // intent classifier the second.
    h.provider.push_structured(serde_json::json!({ "facts": [] }));
    h.provider.push_structured(serde_json::json!({
        "intent": "question", "confidence": 0.9
    }));

    for i in 1..=3 {
        h.pipeline
            .handle_message(&msg(i, 42, &format!("serious question number {i} about deployment?")))
            .await;
    }

    let events: Vec<_> = (1..=10)
        .filter_map(|id| h.store.get_proactive_event(id).ok())
        .collect();
    let suppressed: Vec<_> = events
        .iter()
        .filter(|e| e.decision == Decision::Suppress)
        .collect();
    assert_eq!(suppressed.len(), 1);
    assert_eq!(suppressed[0].block_reason.as_deref(), Some("global_cooldown"));
    // No second send happened.
    assert!(h.outbound.sent().is_empty());
}

#[tokio::test]
async fn proactive_send_records_event_with_response_id() {
    let h = harness(|c| {
        c.proactive.enabled = true;
    });
    h.provider.push_structured(serde_json::json!({ "facts": [] }));
    h.provider.push_structured(serde_json::json!({
        "intent": "question", "confidence": 0.95
    }));
    h.provider.push_response(GenerateResponse {
        text: "The deploy failed because the migration step was skipped.".to_string(),
        tool_calls: vec![],
        stop_reason: "stop".to_string(),
    });

    for i in 1..=3 {
        h.pipeline
            .handle_message(&msg(i, 42, &format!("why does the deploy keep failing today {i}?")))
            .await;
    }

    let sent = h.outbound.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].reply_to_message_id, Some(3));

    let ev = h.store.get_proactive_event(1).unwrap();
    assert_eq!(ev.decision, Decision::Send);
    assert!(ev.response_message_id.is_some());
    assert_eq!(ev.user_id, Some(42));
    assert_eq!(ev.intent_type, "question");
}

#[tokio::test]
async fn reaction_to_a_proactive_reply_is_recorded() {
    let h = harness(|c| {
        c.proactive.enabled = true;
    });
    h.provider.push_structured(serde_json::json!({ "facts": [] }));
    h.provider.push_structured(serde_json::json!({
        "intent": "question", "confidence": 0.95
    }));
    h.provider.push_response(GenerateResponse {
        text: "Try clearing the cache first.".to_string(),
        tool_calls: vec![],
        stop_reason: "stop".to_string(),
    });

    for i in 1..=3 {
        h.pipeline
            .handle_message(&msg(i, 42, &format!("how do i fix this weird build error {i}?")))
            .await;
    }
    let response_id = h.store.get_proactive_event(1).unwrap().response_message_id.unwrap();

    // The user replies with thanks.
    let mut reply = msg(50, 42, "дякую, спрацювало!");
    reply.reply_to_message_id = Some(response_id);
    h.pipeline.handle_message(&reply).await;

    let ev = h.store.get_proactive_event(1).unwrap();
    assert_eq!(
        ev.user_reaction,
        Some(banter_store::types::Reaction::Positive)
    );
    assert!(ev.reaction_delay_ms.is_some());
}

#[tokio::test]
async fn async_mode_processes_windows_through_the_worker_pool() {
    let h = harness(|c| {
        c.queue.enable_async = true;
    });
    for i in 1..=3 {
        h.pipeline.handle_message(&msg(i, 42, "Я з Києва")).await;
    }
    // Learning has not run yet — the event sits in the queue.
    assert!(h.store.active_facts(42, -100).unwrap().is_empty());
    assert_eq!(h.pipeline.queue().len(), 1);

    let queue = h.pipeline.queue();
    queue.close();
    let mut pool = WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&h.pipeline) as Arc<dyn banter_queue::EventHandler>,
        60,
        CancellationToken::new(),
    );
    pool.start(3);
    pool.join().await;

    let facts = h.store.active_facts(42, -100).unwrap();
    assert_eq!(facts.len(), 1);
    assert!(h.store.get_window(1).unwrap().processed);
}

#[tokio::test]
async fn tiny_window_learns_nothing_and_suppresses_as_too_small() {
    let h = harness(|c| {
        c.window.size = 2;
        c.proactive.enabled = true;
    });
    h.pipeline.handle_message(&msg(1, 42, "ok")).await;
    h.pipeline.handle_message(&msg(2, 42, "норм")).await;

    // Two low-value messages close the window; nothing is extractable.
    assert!(h.store.active_facts(42, -100).unwrap().is_empty());
    let metrics = h.store.get_quality_metrics(1).unwrap().unwrap();
    assert_eq!(metrics.facts_created, 0);
    assert_eq!(metrics.candidates_seen, 0);

    let ev = h.store.get_proactive_event(1).unwrap();
    assert_eq!(ev.decision, Decision::Suppress);
    assert_eq!(ev.block_reason.as_deref(), Some("window_too_small"));
}

#[tokio::test]
async fn reprocessing_a_settled_window_changes_nothing() {
    let h = harness(|_| {});
    h.pipeline.handle_message(&msg(1, 42, "Я з Києва")).await;
    h.pipeline.handle_message(&msg(2, 42, "Hi from Kiev")).await;
    h.pipeline.handle_message(&msg(3, 42, "Київ ❤️")).await;

    let facts = h.store.active_facts(42, -100).unwrap();
    let versions_before = h.store.fact_versions(facts[0].id).unwrap().len();

    // A worker retry after restart finds the window already processed.
    h.pipeline
        .process_window(1, &CancellationToken::new())
        .await
        .unwrap();

    let versions_after = h.store.fact_versions(facts[0].id).unwrap().len();
    assert_eq!(versions_before, versions_after);
}

#[tokio::test]
async fn window_sweep_closes_idle_windows() {
    let h = harness(|c| c.window.size = 8);
    // Two messages from five minutes ago: past the 180s inactivity cutoff.
    let mut first = msg(1, 42, "I live in Kharkiv");
    first.timestamp = Utc::now() - chrono::Duration::seconds(300);
    let mut second = msg(2, 42, "anyway, how was your weekend?");
    second.timestamp = Utc::now() - chrono::Duration::seconds(290);
    h.pipeline.handle_message(&first).await;
    h.pipeline.handle_message(&second).await;
    h.pipeline.sweep_windows().await;

    // Timeout closure processed the two-message window.
    let w = h.store.get_window(1).unwrap();
    assert_eq!(w.message_count, 2);
    assert!(w.processed);
    assert_eq!(
        h.store.active_facts(42, -100).unwrap()[0].value_canonical,
        "kharkiv"
    );
}

#[tokio::test]
async fn shutdown_flush_persists_open_windows() {
    let h = harness(|c| c.window.size = 8);
    h.pipeline.handle_message(&msg(1, 42, "we should plan the retro")).await;
    h.pipeline.handle_message(&msg(2, 7, "agreed, maybe thursday")).await;
    h.pipeline.flush_windows().await;

    let w = h.store.get_window(1).unwrap();
    assert_eq!(
        w.closure_reason,
        banter_store::types::ClosureReason::Shutdown
    );
}
