use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::ServiceExt;

use slotbot::config::AppConfig;
use slotbot::db::{self, queries, Db};
use slotbot::handlers;
use slotbot::models::{BookingRecord, ConversationState, InboundEvent, ServiceCatalog, Slot, Stage};
use slotbot::services::calendar::BusinessCalendar;
use slotbot::services::conversation::{BookingOrchestrator, BookingSettings};
use slotbot::services::form::FieldKey;
use slotbot::services::messaging::{MessagingProvider, OutboundMessage};
use slotbot::services::receipt::{IcsReceiptGenerator, Receipt, ReceiptGenerator};
use slotbot::services::sessions::{SessionStore, SqliteSessionStore};
use slotbot::services::slots::{SlotStore, SqliteSlotStore};
use slotbot::state::AppState;

const CLIENT: &str = "59165900645";
const OTHER: &str = "59171234567";

type Sent = Arc<Mutex<Vec<(String, OutboundMessage)>>>;

// ── Mocks ──

struct MockMessaging {
    sent: Sent,
    fail_documents: bool,
    fail_all: bool,
}

#[async_trait]
impl MessagingProvider for MockMessaging {
    async fn send(&self, to: &str, message: &OutboundMessage) -> anyhow::Result<()> {
        if self.fail_all {
            anyhow::bail!("provider unreachable");
        }
        if self.fail_documents && matches!(message, OutboundMessage::Document { .. }) {
            anyhow::bail!("document upload rejected");
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), message.clone()));
        Ok(())
    }
}

/// Real SQLite store that counts claim attempts and can refuse ledger writes.
struct CountingSlotStore {
    inner: SqliteSlotStore,
    claims: AtomicUsize,
    fail_append: bool,
}

#[async_trait]
impl SlotStore for CountingSlotStore {
    async fn list_next_working_days(&self, n: usize) -> anyhow::Result<Vec<NaiveDate>> {
        self.inner.list_next_working_days(n).await
    }

    async fn list_open_slots(&self, date: NaiveDate) -> anyhow::Result<Vec<Slot>> {
        self.inner.list_open_slots(date).await
    }

    async fn claim_slot(&self, slot_id: i64, claimant: &str, service: &str) -> anyhow::Result<bool> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        self.inner.claim_slot(slot_id, claimant, service).await
    }

    async fn release_slot(&self, slot_id: i64, claimant: &str) -> anyhow::Result<bool> {
        self.inner.release_slot(slot_id, claimant).await
    }

    async fn append_booking(&self, record: &BookingRecord) -> anyhow::Result<bool> {
        if self.fail_append {
            anyhow::bail!("ledger unavailable");
        }
        self.inner.append_booking(record).await
    }

    async fn latest_booking(&self, address: &str) -> anyhow::Result<Option<BookingRecord>> {
        self.inner.latest_booking(address).await
    }
}

struct BrokenSessions;

#[async_trait]
impl SessionStore for BrokenSessions {
    async fn get(&self, _address: &str) -> anyhow::Result<Option<ConversationState>> {
        anyhow::bail!("session table locked")
    }

    async fn set(&self, _state: &ConversationState) -> anyhow::Result<()> {
        anyhow::bail!("session table locked")
    }

    async fn delete(&self, _address: &str) -> anyhow::Result<()> {
        anyhow::bail!("session table locked")
    }

    async fn take_expired(&self, _cutoff: DateTime<Utc>) -> anyhow::Result<Vec<ConversationState>> {
        anyhow::bail!("session table locked")
    }

    async fn count(&self) -> anyhow::Result<usize> {
        anyhow::bail!("session table locked")
    }
}

struct BrokenReceipts;

#[async_trait]
impl ReceiptGenerator for BrokenReceipts {
    async fn generate(&self, _booking: &BookingRecord) -> anyhow::Result<Receipt> {
        anyhow::bail!("renderer offline")
    }
}

// ── Harness ──

#[derive(Default)]
struct Options {
    fail_append: bool,
    fail_receipt: bool,
    fail_documents: bool,
    fail_sends: bool,
    fail_sessions: bool,
    app_secret: &'static str,
}

struct Harness {
    state: Arc<AppState>,
    db: Db,
    sent: Sent,
    store: Arc<CountingSlotStore>,
    /// The days the bot offers right now, in order.
    days: Vec<NaiveDate>,
    next_message: AtomicUsize,
}

fn test_config(app_secret: &str) -> AppConfig {
    AppConfig {
        database_url: ":memory:".to_string(),
        admin_token: "test-token".to_string(),
        whatsapp_app_secret: app_secret.to_string(),
        whatsapp_verify_token: "verify-me".to_string(),
        public_base_url: "https://bot.test".to_string(),
        support_contact: "soporte@estudio.test".to_string(),
        phone_country_code: "591".to_string(),
        phone_digits: 8,
        ..AppConfig::default()
    }
}

fn harness_with(options: Options) -> Harness {
    let config = test_config(options.app_secret);
    let db: Db = Arc::new(Mutex::new(db::init_db(":memory:").unwrap()));
    let calendar = BusinessCalendar::from_config(&config);
    let days = calendar.next_working_days(calendar.today(), config.days_offered);

    let sent: Sent = Arc::new(Mutex::new(Vec::new()));
    let messaging: Arc<dyn MessagingProvider> = Arc::new(MockMessaging {
        sent: sent.clone(),
        fail_documents: options.fail_documents,
        fail_all: options.fail_sends,
    });

    let store = Arc::new(CountingSlotStore {
        inner: SqliteSlotStore::new(db.clone(), calendar),
        claims: AtomicUsize::new(0),
        fail_append: options.fail_append,
    });

    let receipts: Arc<dyn ReceiptGenerator> = if options.fail_receipt {
        Arc::new(BrokenReceipts)
    } else {
        Arc::new(IcsReceiptGenerator::new(
            config.business_name.clone(),
            config.timezone,
            config.appointment_minutes,
            config.public_base_url.clone(),
        ))
    };

    let sessions: Arc<dyn SessionStore> = if options.fail_sessions {
        Arc::new(BrokenSessions)
    } else {
        Arc::new(SqliteSessionStore::new(db.clone()))
    };

    let orchestrator = BookingOrchestrator::new(
        store.clone(),
        sessions,
        messaging.clone(),
        receipts,
        ServiceCatalog::default(),
        BookingSettings::from_config(&config),
    );

    let state = Arc::new(AppState {
        db: db.clone(),
        config,
        messaging,
        transcriber: None,
        orchestrator,
    });

    Harness {
        state,
        db,
        sent,
        store,
        days,
        next_message: AtomicUsize::new(0),
    }
}

fn harness() -> Harness {
    harness_with(Options::default())
}

fn hm(s: &str) -> NaiveTime {
    NaiveTime::parse_from_str(s, "%H:%M").unwrap()
}

fn envelope(message: serde_json::Value) -> String {
    serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "1",
            "changes": [{
                "field": "messages",
                "value": {"messaging_product": "whatsapp", "messages": [message]}
            }]
        }]
    })
    .to_string()
}

fn text_payload(from: &str, message_id: &str, body: &str) -> String {
    envelope(serde_json::json!({
        "from": from, "id": message_id, "timestamp": "1", "type": "text",
        "text": {"body": body}
    }))
}

fn selection_payload(from: &str, message_id: &str, id: &str) -> String {
    envelope(serde_json::json!({
        "from": from, "id": message_id, "timestamp": "1", "type": "interactive",
        "interactive": {"type": "list_reply", "list_reply": {"id": id, "title": id}}
    }))
}

fn sign(secret: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn admin_get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", "Bearer test-token")
        .body(Body::empty())
        .unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(res: axum::response::Response) -> T {
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

impl Harness {
    fn seed(&self, date: NaiveDate, times: &[&str]) -> Vec<i64> {
        let conn = db::lock(&self.db).unwrap();
        times
            .iter()
            .map(|t| queries::insert_slot(&conn, date, hm(t), None, None).unwrap())
            .collect()
    }

    fn message_id(&self) -> String {
        format!("wamid.{}", self.next_message.fetch_add(1, Ordering::SeqCst))
    }

    async fn post_webhook(&self, body: String) -> StatusCode {
        let app = handlers::router(self.state.clone());
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        app.oneshot(req).await.unwrap().status()
    }

    async fn say(&self, from: &str, text: &str) {
        let id = self.message_id();
        assert_eq!(self.post_webhook(text_payload(from, &id, text)).await, StatusCode::OK);
    }

    async fn tap(&self, from: &str, selection: &str) {
        let id = self.message_id();
        assert_eq!(
            self.post_webhook(selection_payload(from, &id, selection)).await,
            StatusCode::OK
        );
    }

    async fn stage(&self, address: &str) -> Option<Stage> {
        self.state
            .orchestrator
            .sessions()
            .get(address)
            .await
            .unwrap()
            .map(|s| s.stage)
    }

    fn messages_to(&self, address: &str) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == address)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn last_to(&self, address: &str) -> OutboundMessage {
        self.messages_to(address).pop().expect("no message sent")
    }

    fn claims(&self) -> usize {
        self.store.claims.load(Ordering::SeqCst)
    }

    fn bookings(&self) -> Vec<BookingRecord> {
        let conn = db::lock(&self.db).unwrap();
        queries::list_bookings(&conn, None, 100).unwrap()
    }

    fn open_times(&self, date: NaiveDate) -> Vec<String> {
        let conn = db::lock(&self.db).unwrap();
        queries::list_open_slots(&conn, date)
            .unwrap()
            .into_iter()
            .map(|s| s.label)
            .collect()
    }

    /// hola → service → first offered day, ending on the slot list.
    async fn reach_time_choice(&self, address: &str) {
        self.say(address, "hola").await;
        self.tap(address, "serv_tributaria").await;
        self.tap(address, &format!("day_{}", self.days[0])).await;
        assert!(matches!(
            self.stage(address).await,
            Some(Stage::AwaitingTimeChoice { .. })
        ));
    }

    async fn reach_form(&self, address: &str, slot_id: i64) {
        self.reach_time_choice(address).await;
        self.tap(address, &format!("slot_{slot_id}")).await;
        assert!(matches!(
            self.stage(address).await,
            Some(Stage::CollectingForm { .. })
        ));
    }

    async fn reach_confirmation(&self, address: &str, slot_id: i64) {
        self.reach_form(address, slot_id).await;
        self.say(address, "María González").await;
        self.tap(address, "phone_yes").await;
        self.say(address, "maria@example.com").await;
        assert!(matches!(
            self.stage(address).await,
            Some(Stage::AwaitingFinalConfirmation { .. })
        ));
    }
}

fn row_id_with_title(message: &OutboundMessage, title: &str) -> Option<String> {
    match message {
        OutboundMessage::List { sections, .. } => sections
            .iter()
            .flat_map(|s| &s.rows)
            .find(|r| r.title == title)
            .map(|r| r.id.clone()),
        _ => None,
    }
}

// ── Conversation flow ──

#[tokio::test]
async fn test_full_booking_flow() {
    let h = harness();
    h.seed(h.days[0], &["09:00", "09:30", "10:00"]);

    h.say(CLIENT, "hola").await;
    assert!(matches!(h.stage(CLIENT).await, Some(Stage::AwaitingServiceType)));
    assert!(h.last_to(CLIENT).choice_ids().contains(&"serv_tributaria"));

    h.tap(CLIENT, "serv_tributaria").await;
    let day_id = format!("day_{}", h.days[0]);
    assert!(h.last_to(CLIENT).choice_ids().contains(&day_id.as_str()));

    h.tap(CLIENT, &day_id).await;
    let slot_list = h.last_to(CLIENT);
    assert_eq!(slot_list.choice_ids().len(), 3);
    let nine = row_id_with_title(&slot_list, "09:00").unwrap();

    h.tap(CLIENT, &nine).await;
    assert!(h
        .messages_to(CLIENT)
        .iter()
        .any(|m| m.body().contains("Apartamos para ti el horario de las *09:00*")));
    assert!(!h.open_times(h.days[0]).contains(&"09:00".to_string()));

    h.say(CLIENT, "María González").await;
    let phone_prompt = h.last_to(CLIENT);
    assert!(phone_prompt.body().contains("65900645"));

    h.say(CLIENT, "sí").await;
    h.say(CLIENT, "maria@example.com").await;
    let summary = h.last_to(CLIENT);
    assert!(summary.body().contains("María González"));
    assert_eq!(
        summary.choice_ids(),
        vec!["confirm_yes", "confirm_edit", "confirm_no"]
    );

    h.say(CLIENT, "confirmar").await;

    let bookings = h.bookings();
    assert_eq!(bookings.len(), 1);
    let booking = &bookings[0];
    assert_eq!(booking.name, "María González");
    assert_eq!(booking.phone, "65900645");
    assert_eq!(booking.email, "maria@example.com");
    assert_eq!(booking.service, "Asesoría Tributaria");
    assert_eq!(booking.date, h.days[0]);
    assert_eq!(booking.time, hm("09:00"));
    assert_eq!(booking.address, CLIENT);

    let sent = h.messages_to(CLIENT);
    assert!(sent.iter().any(|m| m.body().contains("¡Tu cita está confirmada!")));
    match sent.last().unwrap() {
        OutboundMessage::Document { link, .. } => {
            assert_eq!(link, &format!("https://bot.test/receipts/{}.ics", booking.id));
        }
        other => panic!("expected receipt document, got {other:?}"),
    }

    // Terminal: the session is gone and the slot stays taken.
    assert!(h.stage(CLIENT).await.is_none());
    assert_eq!(h.open_times(h.days[0]), vec!["09:30", "10:00"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00", "09:30"]);

    h.reach_time_choice(CLIENT).await;
    h.reach_time_choice(OTHER).await;

    let selection = format!("slot_{}", ids[0]);
    let a = {
        let state = h.state.clone();
        let id = selection.clone();
        tokio::spawn(async move {
            state
                .orchestrator
                .handle(CLIENT, InboundEvent::Selection { id })
                .await
        })
    };
    let b = {
        let state = h.state.clone();
        let id = selection.clone();
        tokio::spawn(async move {
            state
                .orchestrator
                .handle(OTHER, InboundEvent::Selection { id })
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let mut winners = 0;
    for address in [CLIENT, OTHER] {
        match h.stage(address).await {
            Some(Stage::CollectingForm { form }) => {
                winners += 1;
                assert_eq!(form.slot.id, ids[0]);
            }
            Some(Stage::AwaitingTimeChoice { offered_slots, page, .. }) => {
                assert_eq!(page, 0);
                assert!(offered_slots.iter().all(|s| s.id != ids[0]));
                assert!(h
                    .messages_to(address)
                    .iter()
                    .any(|m| m.body().contains("acaba de ser reservado")));
            }
            other => panic!("unexpected stage {other:?}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(h.claims(), 2);
}

#[tokio::test]
async fn test_lost_race_requeries_fresh_slots() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00", "09:30"]);
    h.reach_time_choice(CLIENT).await;

    // Someone else takes 09:00 after the list was shown.
    h.store.claim_slot(ids[0], OTHER, "Contabilidad").await.unwrap();

    h.tap(CLIENT, &format!("slot_{}", ids[0])).await;

    match h.stage(CLIENT).await {
        Some(Stage::AwaitingTimeChoice { offered_slots, .. }) => {
            let labels: Vec<&str> = offered_slots.iter().map(|s| s.label.as_str()).collect();
            assert_eq!(labels, vec!["09:30"]);
        }
        other => panic!("unexpected stage {other:?}"),
    }
    assert_eq!(
        h.last_to(CLIENT).choice_ids(),
        vec![format!("slot_{}", ids[1]).as_str()]
    );
}

#[tokio::test]
async fn test_stale_selection_is_never_claimed() {
    let h = harness();
    h.seed(h.days[0], &["09:00"]);
    let elsewhere = h.seed(h.days[1], &["11:00"]);
    h.reach_time_choice(CLIENT).await;

    h.tap(CLIENT, "slot_9999").await;
    h.tap(CLIENT, &format!("slot_{}", elsewhere[0])).await;

    assert_eq!(h.claims(), 0);
    assert!(matches!(
        h.stage(CLIENT).await,
        Some(Stage::AwaitingTimeChoice { .. })
    ));
    assert!(h
        .messages_to(CLIENT)
        .iter()
        .any(|m| m.body().contains("ya no está vigente")));
    assert_eq!(h.open_times(h.days[1]), vec!["11:00"]);
}

#[tokio::test]
async fn test_typed_time_picks_offered_slot() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00", "10:00"]);
    h.reach_time_choice(CLIENT).await;

    h.say(CLIENT, "10:00").await;

    match h.stage(CLIENT).await {
        Some(Stage::CollectingForm { form }) => assert_eq!(form.slot.id, ids[1]),
        other => panic!("unexpected stage {other:?}"),
    }
}

#[tokio::test]
async fn test_day_without_slots_reoffers_days() {
    let h = harness();
    h.say(CLIENT, "hola").await;
    h.tap(CLIENT, "serv_contable").await;
    h.tap(CLIENT, &format!("day_{}", h.days[0])).await;

    assert!(matches!(
        h.stage(CLIENT).await,
        Some(Stage::AwaitingDayChoice { .. })
    ));
    assert!(h
        .messages_to(CLIENT)
        .iter()
        .any(|m| m.body().contains("Ya no quedan horarios libres")));
}

#[tokio::test]
async fn test_day_dropped_from_calendar_is_reoffered() {
    let h = harness();
    h.seed(h.days[0], &["09:00"]);
    h.say(CLIENT, "hola").await;
    h.tap(CLIENT, "serv_tributaria").await;

    h.tap(CLIENT, "day_2000-01-03").await;

    match h.stage(CLIENT).await {
        Some(Stage::AwaitingDayChoice { offered_days, .. }) => assert_eq!(offered_days, h.days),
        other => panic!("unexpected stage {other:?}"),
    }
    let sent = h.messages_to(CLIENT);
    assert!(sent
        .iter()
        .any(|m| m.body().contains("Ese día ya no está disponible")));
    let day_id = format!("day_{}", h.days[0]);
    assert!(sent.last().unwrap().choice_ids().contains(&day_id.as_str()));
    assert_eq!(h.claims(), 0);
}

#[tokio::test]
async fn test_free_text_service_match() {
    let h = harness();
    h.say(CLIENT, "necesito ayuda con mis impuestos").await;

    match h.stage(CLIENT).await {
        Some(Stage::AwaitingDayChoice { service, offered_days }) => {
            assert_eq!(service, "tributaria");
            assert_eq!(offered_days, h.days);
        }
        other => panic!("unexpected stage {other:?}"),
    }
}

#[tokio::test]
async fn test_pagination_moves_between_pages() {
    let h = harness();
    let times: Vec<String> = (0..10).map(|i| format!("{:02}:00", 8 + i)).collect();
    let refs: Vec<&str> = times.iter().map(String::as_str).collect();
    h.seed(h.days[0], &refs);
    h.reach_time_choice(CLIENT).await;

    let first = h.last_to(CLIENT);
    assert!(first.choice_ids().contains(&"page_next"));
    assert!(first.body().contains("página 1 de 2"));

    h.tap(CLIENT, "page_next").await;
    let second = h.last_to(CLIENT);
    assert!(second.body().contains("página 2 de 2"));
    assert!(second.choice_ids().contains(&"page_prev"));
    assert!(row_id_with_title(&second, "17:00").is_some());
    assert!(matches!(
        h.stage(CLIENT).await,
        Some(Stage::AwaitingTimeChoice { page: 1, .. })
    ));
}

// ── Cancellation ──

#[tokio::test]
async fn test_cancel_before_claim_is_idempotent() {
    let h = harness();
    h.say(CLIENT, "hola").await;

    h.say(CLIENT, "cancelar").await;
    assert!(h.stage(CLIENT).await.is_none());
    assert!(h.last_to(CLIENT).body().contains("Proceso cancelado"));

    h.say(CLIENT, "cancelar").await;
    assert!(h.stage(CLIENT).await.is_none());
}

#[tokio::test]
async fn test_cancel_during_form_releases_claim() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_form(CLIENT, ids[0]).await;
    assert!(h.open_times(h.days[0]).is_empty());

    h.say(CLIENT, "cancelar").await;

    assert!(h.stage(CLIENT).await.is_none());
    assert_eq!(h.open_times(h.days[0]), vec!["09:00"]);
    assert!(h.bookings().is_empty());
}

#[tokio::test]
async fn test_cancel_at_confirmation_releases_claim() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    h.tap(CLIENT, "confirm_no").await;
    assert!(h.stage(CLIENT).await.is_none());
    assert_eq!(h.open_times(h.days[0]), vec!["09:00"]);

    h.say(CLIENT, "cancelar").await;
    assert!(h.stage(CLIENT).await.is_none());
    assert!(h.bookings().is_empty());
}

#[tokio::test]
async fn test_typed_cancel_at_confirmation_releases_claim() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    h.say(CLIENT, "cancelar").await;

    assert!(h.stage(CLIENT).await.is_none());
    assert!(h.last_to(CLIENT).body().contains("Proceso cancelado"));
    assert_eq!(h.open_times(h.days[0]), vec!["09:00"]);
    assert!(h.bookings().is_empty());
}

// ── Form handling ──

#[tokio::test]
async fn test_invalid_answer_keeps_field() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_form(CLIENT, ids[0]).await;

    h.say(CLIENT, "123").await;

    match h.stage(CLIENT).await {
        Some(Stage::CollectingForm { form }) => {
            assert_eq!(form.field_index, 0);
            assert!(form.collected.is_empty());
        }
        other => panic!("unexpected stage {other:?}"),
    }
    assert!(h
        .messages_to(CLIENT)
        .iter()
        .any(|m| m.body().starts_with("⚠️")));
}

#[tokio::test]
async fn test_manual_phone_entry_is_normalized() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_form(CLIENT, ids[0]).await;

    h.say(CLIENT, "Juan Pérez").await;
    h.tap(CLIENT, "phone_no").await;
    assert!(h.last_to(CLIENT).body().contains("8 dígitos"));

    h.say(CLIENT, "+591 7123 4567").await;
    h.tap(CLIENT, "email_skip").await;

    match h.stage(CLIENT).await {
        Some(Stage::AwaitingFinalConfirmation { form }) => {
            assert!(form.collected.values().any(|v| v == "71234567"));
        }
        other => panic!("unexpected stage {other:?}"),
    }
}

#[tokio::test]
async fn test_edit_returns_to_summary() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    h.tap(CLIENT, "confirm_edit").await;
    assert!(h.last_to(CLIENT).choice_ids().contains(&"edit_email"));

    h.tap(CLIENT, "edit_email").await;
    h.say(CLIENT, "otro@example.com").await;

    assert!(matches!(
        h.stage(CLIENT).await,
        Some(Stage::AwaitingFinalConfirmation { .. })
    ));
    assert!(h.last_to(CLIENT).body().contains("otro@example.com"));
}

#[tokio::test]
async fn test_help_does_not_change_state() {
    let h = harness();
    h.seed(h.days[0], &["09:00"]);
    h.reach_time_choice(CLIENT).await;
    let before = h.state.orchestrator.sessions().get(CLIENT).await.unwrap().unwrap();

    h.say(CLIENT, "ayuda").await;

    let after = h.state.orchestrator.sessions().get(CLIENT).await.unwrap().unwrap();
    assert_eq!(after.last_updated, before.last_updated);
    assert_eq!(after.stage.name(), before.stage.name());
    assert!(h.last_to(CLIENT).body().starts_with("ℹ️"));
}

#[tokio::test]
async fn test_audio_without_transcriber_reprompts() {
    let h = harness();
    h.say(CLIENT, "hola").await;

    let body = envelope(serde_json::json!({
        "from": CLIENT, "id": "wamid.audio", "timestamp": "1", "type": "audio",
        "audio": {"id": "media-1", "mime_type": "audio/ogg"}
    }));
    assert_eq!(h.post_webhook(body).await, StatusCode::OK);

    assert!(matches!(h.stage(CLIENT).await, Some(Stage::AwaitingServiceType)));
    let sent = h.messages_to(CLIENT);
    assert!(sent
        .iter()
        .any(|m| m.body().contains("solo puedo leer mensajes de texto")));
    assert!(sent.last().unwrap().choice_ids().contains(&"serv_tributaria"));
}

// ── Commit failures ──

#[tokio::test]
async fn test_append_failure_keeps_confirmation_stage() {
    let h = harness_with(Options {
        fail_append: true,
        ..Options::default()
    });
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    h.tap(CLIENT, "confirm_yes").await;

    assert!(h.bookings().is_empty());
    assert!(matches!(
        h.stage(CLIENT).await,
        Some(Stage::AwaitingFinalConfirmation { .. })
    ));
    assert!(h
        .messages_to(CLIENT)
        .iter()
        .any(|m| m.body().contains("soporte@estudio.test")));
    // The claim is still held for a retry.
    assert!(h.open_times(h.days[0]).is_empty());
}

#[tokio::test]
async fn test_revoked_claim_cannot_double_book() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00", "09:30"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    // An operator reopens the held slot and someone else books it.
    let release = Request::builder()
        .method("POST")
        .uri(format!("/api/admin/slots/{}/release", ids[0]))
        .header("authorization", "Bearer test-token")
        .body(Body::empty())
        .unwrap();
    let res = handlers::router(h.state.clone()).oneshot(release).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    h.reach_confirmation(OTHER, ids[0]).await;
    h.tap(OTHER, "confirm_yes").await;

    h.tap(CLIENT, "confirm_yes").await;

    let bookings = h.bookings();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].address, OTHER);
    assert_eq!(bookings[0].slot_id, ids[0]);

    match h.stage(CLIENT).await {
        Some(Stage::AwaitingTimeChoice { offered_slots, .. }) => {
            let labels: Vec<&str> = offered_slots.iter().map(|s| s.label.as_str()).collect();
            assert_eq!(labels, vec!["09:30"]);
        }
        other => panic!("unexpected stage {other:?}"),
    }
    let sent = h.messages_to(CLIENT);
    assert!(sent.iter().any(|m| m.body().contains("ya no está apartado para ti")));
    assert!(!sent.iter().any(|m| m.body().contains("¡Tu cita está confirmada!")));

    // Booked slots stay booked.
    let release = Request::builder()
        .method("POST")
        .uri(format!("/api/admin/slots/{}/release", ids[0]))
        .header("authorization", "Bearer test-token")
        .body(Body::empty())
        .unwrap();
    let res = handlers::router(h.state.clone()).oneshot(release).await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(h.open_times(h.days[0]), vec!["09:30"]);
}

#[tokio::test]
async fn test_commit_revalidation_returns_to_offending_field() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    let sessions = h.state.orchestrator.sessions();
    let mut state = sessions.get(CLIENT).await.unwrap().unwrap();
    match &mut state.stage {
        Stage::AwaitingFinalConfirmation { form } => {
            form.collected.insert(FieldKey::Email, "no-es-correo".to_string());
        }
        other => panic!("unexpected stage {other:?}"),
    }
    sessions.set(&state).await.unwrap();

    h.tap(CLIENT, "confirm_yes").await;

    match h.stage(CLIENT).await {
        Some(Stage::CollectingForm { form }) => {
            assert_eq!(form.current_field().unwrap().key, FieldKey::Email);
            assert!(form.editing);
        }
        other => panic!("unexpected stage {other:?}"),
    }
    assert!(h
        .messages_to(CLIENT)
        .iter()
        .any(|m| m.body().contains("*Correo* necesita corrección")));
    assert!(h.bookings().is_empty());
    assert!(h.open_times(h.days[0]).is_empty());

    h.say(CLIENT, "maria@example.com").await;
    h.tap(CLIENT, "confirm_yes").await;
    assert_eq!(h.bookings().len(), 1);
}

#[tokio::test]
async fn test_receipt_failure_still_confirms() {
    let h = harness_with(Options {
        fail_receipt: true,
        ..Options::default()
    });
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    h.tap(CLIENT, "confirm_yes").await;

    assert_eq!(h.bookings().len(), 1);
    assert!(h.stage(CLIENT).await.is_none());
    assert!(h.last_to(CLIENT).body().contains("Escribe *comprobante*"));
}

#[tokio::test]
async fn test_document_failure_falls_back_to_link() {
    let h = harness_with(Options {
        fail_documents: true,
        ..Options::default()
    });
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;

    h.tap(CLIENT, "confirm_yes").await;

    let booking = &h.bookings()[0];
    let last = h.last_to(CLIENT);
    assert!(matches!(last, OutboundMessage::Text { .. }));
    assert!(last
        .body()
        .contains(&format!("https://bot.test/receipts/{}.ics", booking.id)));
}

#[tokio::test]
async fn test_receipt_can_be_requested_again() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;
    h.tap(CLIENT, "confirm_yes").await;

    h.say(CLIENT, "comprobante").await;

    assert!(matches!(h.last_to(CLIENT), OutboundMessage::Document { .. }));
    assert!(matches!(h.stage(CLIENT).await, None | Some(Stage::Initial)));

    h.say(OTHER, "comprobante").await;
    assert!(h.last_to(OTHER).body().contains("No encontramos reservas"));
}

// ── Webhook ──

#[tokio::test]
async fn test_webhook_verification() {
    let h = harness();
    let app = handlers::router(h.state.clone());
    let res = app
        .oneshot(
            Request::builder()
                .uri("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"12345");

    let app = handlers::router(h.state.clone());
    let res = app
        .oneshot(
            Request::builder()
                .uri("/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let h = harness_with(Options {
        app_secret: "app-secret",
        ..Options::default()
    });
    let body = text_payload(CLIENT, "wamid.sig", "hola");

    let unsigned = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let res = handlers::router(h.state.clone()).oneshot(unsigned).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert!(h.messages_to(CLIENT).is_empty());

    let signed = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("x-hub-signature-256", sign("app-secret", &body))
        .body(Body::from(body))
        .unwrap();
    let res = handlers::router(h.state.clone()).oneshot(signed).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(matches!(h.stage(CLIENT).await, Some(Stage::AwaitingServiceType)));
}

#[tokio::test]
async fn test_webhook_ignores_redelivery() {
    let h = harness();
    let body = text_payload(CLIENT, "wamid.same", "hola");

    assert_eq!(h.post_webhook(body.clone()).await, StatusCode::OK);
    let first = h.messages_to(CLIENT).len();
    assert!(first > 0);

    assert_eq!(h.post_webhook(body).await, StatusCode::OK);
    assert_eq!(h.messages_to(CLIENT).len(), first);
}

#[tokio::test]
async fn test_session_failure_sends_apology() {
    let h = harness_with(Options {
        fail_sessions: true,
        ..Options::default()
    });

    h.say(CLIENT, "hola").await;

    let sent = h.messages_to(CLIENT);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body().contains("tuvimos un problema procesando tu mensaje"));
}

#[tokio::test]
async fn test_undeliverable_apology_still_acknowledges() {
    let h = harness_with(Options {
        fail_sessions: true,
        fail_sends: true,
        ..Options::default()
    });
    let body = text_payload(CLIENT, "wamid.lost", "hola");

    assert_eq!(h.post_webhook(body.clone()).await, StatusCode::OK);
    assert!(h.sent.lock().unwrap().is_empty());

    // The id was still recorded, so a retry is not processed twice.
    let conn = db::lock(&h.db).unwrap();
    assert!(!queries::mark_message_processed(&conn, "wamid.lost").unwrap());
}

#[tokio::test]
async fn test_webhook_rejects_garbage() {
    let h = harness();
    assert_eq!(
        h.post_webhook("not json".to_string()).await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn test_status_updates_are_ignored() {
    let h = harness();
    let body = serde_json::json!({
        "entry": [{"changes": [{"value": {"statuses": [{"id": "wamid.X", "status": "read"}]}}]}]
    })
    .to_string();
    assert_eq!(h.post_webhook(body).await, StatusCode::OK);
    assert!(h.sent.lock().unwrap().is_empty());
}

// ── Admin API ──

#[tokio::test]
async fn test_admin_requires_auth() {
    let h = harness();
    let res = handlers::router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/admin/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = handlers::router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/api/admin/status")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_slot_lifecycle() {
    let h = harness();
    let date = h.days[0].format("%Y-%m-%d").to_string();

    let create = Request::builder()
        .method("POST")
        .uri("/api/admin/slots")
        .header("authorization", "Bearer test-token")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"date": date, "times": ["09:00", "09:30"]}).to_string(),
        ))
        .unwrap();
    let res = handlers::router(h.state.clone()).oneshot(create).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let json: serde_json::Value = json_body(res).await;
    let created: Vec<i64> = serde_json::from_value(json["created"].clone()).unwrap();
    assert_eq!(created.len(), 2);

    h.store.claim_slot(created[0], CLIENT, "Contabilidad").await.unwrap();

    let res = handlers::router(h.state.clone())
        .oneshot(admin_get(&format!("/api/admin/slots?date={date}")))
        .await
        .unwrap();
    let rows: Vec<serde_json::Value> = json_body(res).await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["status"], "claimed");
    assert_eq!(rows[0]["claimant"], CLIENT);

    let res = handlers::router(h.state.clone())
        .oneshot(admin_get("/api/admin/status"))
        .await
        .unwrap();
    let status: serde_json::Value = json_body(res).await;
    assert_eq!(status["open_slots"], 1);
    assert_eq!(status["claimed_slots"], 1);
    assert_eq!(status["booked_slots"], 0);
    assert_eq!(status["active_conversations"], 0);

    let release = Request::builder()
        .method("POST")
        .uri(format!("/api/admin/slots/{}/release", created[0]))
        .header("authorization", "Bearer test-token")
        .body(Body::empty())
        .unwrap();
    let res = handlers::router(h.state.clone()).oneshot(release).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(h.open_times(h.days[0]), vec!["09:00", "09:30"]);

    let release_missing = Request::builder()
        .method("POST")
        .uri("/api/admin/slots/9999/release")
        .header("authorization", "Bearer test-token")
        .body(Body::empty())
        .unwrap();
    let res = handlers::router(h.state.clone())
        .oneshot(release_missing)
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_status_separates_claims_from_bookings() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00", "09:30", "10:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;
    h.tap(CLIENT, "confirm_yes").await;
    h.reach_form(OTHER, ids[1]).await;

    let res = handlers::router(h.state.clone())
        .oneshot(admin_get("/api/admin/status"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let status: serde_json::Value = json_body(res).await;
    assert_eq!(status["open_slots"], 1);
    assert_eq!(status["claimed_slots"], 1);
    assert_eq!(status["booked_slots"], 1);
    assert_eq!(status["bookings"], 1);
    assert_eq!(status["active_conversations"], 1);
}

#[tokio::test]
async fn test_admin_rejects_bad_slot_input() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/api/admin/slots")
        .header("authorization", "Bearer test-token")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({"date": "2026-13-40", "times": ["09:00"]}).to_string(),
        ))
        .unwrap();
    let res = handlers::router(h.state.clone()).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_lists_bookings() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;
    h.tap(CLIENT, "confirm_yes").await;

    let res = handlers::router(h.state.clone())
        .oneshot(admin_get(&format!("/api/admin/bookings?date={}", h.days[0])))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let bookings: Vec<serde_json::Value> = json_body(res).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0]["name"], "María González");
}

// ── Receipts ──

#[tokio::test]
async fn test_receipt_download() {
    let h = harness();
    let ids = h.seed(h.days[0], &["09:00"]);
    h.reach_confirmation(CLIENT, ids[0]).await;
    h.tap(CLIENT, "confirm_yes").await;
    let booking = h.bookings().remove(0);

    let res = handlers::router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri(format!("/receipts/{}.ics", booking.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.headers().get("content-type").unwrap(),
        "text/calendar; charset=utf-8"
    );
    assert_eq!(
        res.headers().get("content-disposition").unwrap(),
        format!("attachment; filename=\"reserva-{}.ics\"", booking.code()).as_str()
    );
    let body = axum::body::to_bytes(res.into_body(), usize::MAX)
        .await
        .unwrap();
    let ics = String::from_utf8(body.to_vec()).unwrap();
    assert!(ics.starts_with("BEGIN:VCALENDAR"));
    assert!(ics.contains("Asesoría Tributaria"));
}

#[tokio::test]
async fn test_receipt_not_found() {
    let h = harness();
    let res = handlers::router(h.state.clone())
        .oneshot(
            Request::builder()
                .uri("/receipts/does-not-exist.ics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let res = handlers::router(h.state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}
