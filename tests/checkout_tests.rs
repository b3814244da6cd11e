/// Integration tests for the plan checkout flow.
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[path = "../src/api.rs"]
mod api;
#[path = "../src/checkout.rs"]
mod checkout;
#[path = "../src/config.rs"]
mod config;
#[path = "../src/models.rs"]
mod models;
#[path = "../src/requests.rs"]
mod requests;
#[path = "../src/session.rs"]
mod session;
#[path = "../src/socket.rs"]
mod socket;
#[path = "../src/store.rs"]
mod store;

mod support;

use api::{ApiClient, ApiRequest, ApiResponse};
use checkout::{
    CheckoutError, CheckoutFlow, CheckoutListener, CheckoutOutcome, CheckoutProvider,
    ProviderEvent,
};
use models::{PaymentOrder, PaymentProof, PaymentReceipt};
use support::{logged_in_session, respond, MockTransport};

const ORDERS: &str = "/api/v1/billing/orders";
const VERIFY: &str = "/api/v1/billing/verify";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedProvider {
    loads: AtomicU32,
    failing_loads: AtomicU32,
    script: Mutex<Vec<ProviderEvent>>,
    opened: Mutex<Vec<PaymentOrder>>,
}

impl ScriptedProvider {
    fn with_script(script: Vec<ProviderEvent>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            ..Default::default()
        })
    }
}

#[async_trait]
impl CheckoutProvider for ScriptedProvider {
    async fn load(&self) -> Result<(), CheckoutError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing_loads.load(Ordering::SeqCst) > 0 {
            self.failing_loads.fetch_sub(1, Ordering::SeqCst);
            return Err(CheckoutError::Load("script blocked".into()));
        }
        Ok(())
    }

    async fn open(
        &self,
        order: &PaymentOrder,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<(), CheckoutError> {
        self.opened.lock().unwrap().push(order.clone());
        let script = self.script.lock().unwrap().clone();
        for event in script {
            let _ = events.send(event).await;
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    calls: Mutex<Vec<String>>,
}

impl RecordingListener {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CheckoutListener for RecordingListener {
    fn on_success(&self, receipt: &PaymentReceipt) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("success:{}", receipt.plan_id));
    }

    fn on_cancel(&self) {
        self.calls.lock().unwrap().push("cancel".into());
    }

    fn on_error(&self, message: &str) {
        self.calls.lock().unwrap().push(format!("error:{message}"));
    }
}

fn billing(req: &ApiRequest) -> ApiResponse {
    match req.path.as_str() {
        ORDERS => respond(
            200,
            json!({"order_id": "order_1", "amount": 99900, "currency": "INR",
                   "key_id": "rzp_test_key", "plan_id": "pro"}),
        ),
        VERIFY => respond(200, json!({"plan_id": "pro", "status": "active"})),
        _ => respond(404, json!({"detail": "Not found"})),
    }
}

fn proof(order_id: &str) -> PaymentProof {
    PaymentProof {
        order_id: order_id.into(),
        payment_id: "pay_1".into(),
        signature: "sig".into(),
    }
}

fn flow(
    transport: Arc<MockTransport>,
    provider: Arc<ScriptedProvider>,
) -> CheckoutFlow {
    let (session, _store) = logged_in_session("a1", Some("r1"));
    let api = Arc::new(ApiClient::new(transport, session, "/api/v1"));
    CheckoutFlow::new(api, provider)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dismiss_before_success_cancels_without_verification() {
    let transport = MockTransport::new(billing);
    let provider = ScriptedProvider::with_script(vec![
        ProviderEvent::Dismissed,
        ProviderEvent::Success(proof("order_1")),
    ]);
    let flow = flow(transport.clone(), provider);
    let listener = RecordingListener::default();

    let outcome = flow.pay("pro", &listener).await;

    assert_eq!(outcome, CheckoutOutcome::Cancelled);
    assert_eq!(listener.calls(), vec!["cancel"]);
    assert_eq!(transport.calls_to(ORDERS).len(), 1);
    assert!(transport.calls_to(VERIFY).is_empty());
}

#[tokio::test]
async fn success_is_verified_before_it_is_reported() {
    let transport = MockTransport::new(billing);
    let provider = ScriptedProvider::with_script(vec![ProviderEvent::Success(proof("order_1"))]);
    let flow = flow(transport.clone(), provider.clone());
    let listener = RecordingListener::default();

    let outcome = flow.pay("pro", &listener).await;

    assert!(matches!(outcome, CheckoutOutcome::Paid(ref r) if r.status == "active"));
    assert_eq!(listener.calls(), vec!["success:pro"]);
    assert_eq!(provider.opened.lock().unwrap()[0].key_id, "rzp_test_key");

    let verify = transport.calls_to(VERIFY);
    assert_eq!(verify.len(), 1);
    assert_eq!(
        verify[0].body,
        Some(json!({"order_id": "order_1", "payment_id": "pay_1", "signature": "sig"}))
    );
    assert_eq!(transport.calls_to(ORDERS)[0].body, Some(json!({"plan_id": "pro"})));
}

#[tokio::test]
async fn failed_verification_goes_to_the_error_callback() {
    let transport = MockTransport::new(|req| match req.path.as_str() {
        VERIFY => respond(400, json!({"detail": "Invalid payment signature"})),
        _ => billing(req),
    });
    let provider = ScriptedProvider::with_script(vec![ProviderEvent::Success(proof("order_1"))]);
    let flow = flow(transport, provider);
    let listener = RecordingListener::default();

    let outcome = flow.pay("pro", &listener).await;

    assert!(matches!(outcome, CheckoutOutcome::Failed(_)));
    let calls = listener.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("error:"));
    assert!(calls[0].contains("Invalid payment signature"));
}

#[tokio::test]
async fn proof_for_another_order_is_not_verified() {
    let transport = MockTransport::new(billing);
    let provider = ScriptedProvider::with_script(vec![ProviderEvent::Success(proof("order_9"))]);
    let flow = flow(transport.clone(), provider);
    let listener = RecordingListener::default();

    let outcome = flow.pay("pro", &listener).await;

    assert!(matches!(outcome, CheckoutOutcome::Failed(_)));
    assert!(transport.calls_to(VERIFY).is_empty());
}

#[tokio::test]
async fn order_creation_failure_never_opens_the_provider() {
    let transport = MockTransport::new(|_| respond(403, json!({"detail": "Upgrade not allowed"})));
    let provider = ScriptedProvider::with_script(vec![ProviderEvent::Dismissed]);
    let flow = flow(transport, provider.clone());
    let listener = RecordingListener::default();

    flow.pay("pro", &listener).await;

    assert_eq!(listener.calls(), vec!["error:Upgrade not allowed"]);
    assert!(provider.opened.lock().unwrap().is_empty());
}

#[tokio::test]
async fn provider_is_loaded_once() {
    let transport = MockTransport::new(billing);
    let provider = ScriptedProvider::with_script(vec![ProviderEvent::Dismissed]);
    let flow = flow(transport, provider.clone());
    let listener = RecordingListener::default();

    assert!(!flow.is_loaded());
    flow.pay("pro", &listener).await;
    flow.pay("pro", &listener).await;

    assert!(flow.is_loaded());
    assert_eq!(provider.loads.load(Ordering::SeqCst), 1);
    assert_eq!(listener.calls(), vec!["cancel", "cancel"]);
}

#[tokio::test]
async fn failed_load_is_retried_on_next_payment() {
    let transport = MockTransport::new(billing);
    let provider = ScriptedProvider::with_script(vec![ProviderEvent::Dismissed]);
    provider.failing_loads.store(1, Ordering::SeqCst);
    let flow = flow(transport.clone(), provider.clone());
    let listener = RecordingListener::default();

    let first = flow.pay("pro", &listener).await;
    assert!(matches!(first, CheckoutOutcome::Failed(_)));
    assert!(transport.calls_to(ORDERS).is_empty());

    let second = flow.pay("pro", &listener).await;
    assert_eq!(second, CheckoutOutcome::Cancelled);
    assert_eq!(provider.loads.load(Ordering::SeqCst), 2);
}
