/// checkout.rs – Plan purchase through a third-party payment provider.
///
/// The server creates the order, the provider collects the payment, and the
/// server verifies the provider's signed proof before anything counts as
/// paid. Outcomes reach the caller through `CheckoutListener`, never as an
/// error return.
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, OnceCell};
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::models::{PaymentOrder, PaymentProof, PaymentReceipt};

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("payment provider failed to load: {0}")]
    Load(String),

    #[error("payment provider could not open checkout: {0}")]
    Open(String),
}

/// What the provider reports back for one opened checkout.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Success(PaymentProof),
    Dismissed,
    Failed(String),
}

#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    /// One-time provider setup.
    async fn load(&self) -> Result<(), CheckoutError>;

    /// Present checkout for `order`. Outcome events go to `events`; only the
    /// first one is acted on.
    async fn open(
        &self,
        order: &PaymentOrder,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<(), CheckoutError>;
}

pub trait CheckoutListener: Send + Sync {
    fn on_success(&self, receipt: &PaymentReceipt);
    fn on_cancel(&self);
    fn on_error(&self, message: &str);
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    Paid(PaymentReceipt),
    Cancelled,
    Failed(String),
}

pub struct CheckoutFlow {
    api: Arc<ApiClient>,
    provider: Arc<dyn CheckoutProvider>,
    loaded: OnceCell<()>,
}

impl CheckoutFlow {
    pub fn new(api: Arc<ApiClient>, provider: Arc<dyn CheckoutProvider>) -> Self {
        Self {
            api,
            provider,
            loaded: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    /// Load the provider once; a failed load is retried on the next call.
    pub async fn ensure_loaded(&self) -> Result<(), CheckoutError> {
        self.loaded
            .get_or_try_init(|| async {
                info!("Loading payment provider");
                self.provider.load().await
            })
            .await
            .map(|_| ())
    }

    pub async fn pay(&self, plan_id: &str, listener: &dyn CheckoutListener) -> CheckoutOutcome {
        let outcome = self.run(plan_id).await;
        match &outcome {
            CheckoutOutcome::Paid(receipt) => listener.on_success(receipt),
            CheckoutOutcome::Cancelled => listener.on_cancel(),
            CheckoutOutcome::Failed(message) => listener.on_error(message),
        }
        outcome
    }

    async fn run(&self, plan_id: &str) -> CheckoutOutcome {
        if let Err(e) = self.ensure_loaded().await {
            return CheckoutOutcome::Failed(e.to_string());
        }

        let order = match self.api.create_payment_order(plan_id).await {
            Ok(order) => order,
            Err(e) => return CheckoutOutcome::Failed(e.to_string()),
        };
        info!(
            "Payment order {} created: {} {} for plan {}",
            order.order_id, order.amount, order.currency, plan_id
        );

        let (tx, mut rx) = mpsc::channel(4);
        if let Err(e) = self.provider.open(&order, tx).await {
            return CheckoutOutcome::Failed(e.to_string());
        }

        match rx.recv().await {
            Some(ProviderEvent::Success(proof)) => {
                if proof.order_id != order.order_id {
                    warn!(
                        "Payment proof for order {} does not match {}",
                        proof.order_id, order.order_id
                    );
                    return CheckoutOutcome::Failed(
                        "payment proof does not match the order".into(),
                    );
                }
                match self.api.verify_payment(&proof).await {
                    Ok(receipt) => {
                        info!("Payment {} verified", proof.payment_id);
                        CheckoutOutcome::Paid(receipt)
                    }
                    Err(e) => {
                        warn!("Payment {} failed verification: {e}", proof.payment_id);
                        CheckoutOutcome::Failed(format!("payment verification failed: {e}"))
                    }
                }
            }
            // Provider went away without reporting: same as the user closing it.
            Some(ProviderEvent::Dismissed) | None => {
                info!("Checkout for order {} dismissed", order.order_id);
                CheckoutOutcome::Cancelled
            }
            Some(ProviderEvent::Failed(message)) => CheckoutOutcome::Failed(message),
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal provider
// ---------------------------------------------------------------------------

/// Prints the order for payment in the provider's hosted page and reads the
/// resulting payment id and signature from stdin. An empty line dismisses.
pub struct ConsoleCheckout {
    pub checkout_url: String,
}

#[async_trait]
impl CheckoutProvider for ConsoleCheckout {
    async fn load(&self) -> Result<(), CheckoutError> {
        if self.checkout_url.trim().is_empty() {
            return Err(CheckoutError::Load("no checkout URL configured".into()));
        }
        Ok(())
    }

    async fn open(
        &self,
        order: &PaymentOrder,
        events: mpsc::Sender<ProviderEvent>,
    ) -> Result<(), CheckoutError> {
        println!(
            "Pay {:.2} {} at {}?order_id={}&key={}",
            order.amount as f64 / 100.0,
            order.currency,
            self.checkout_url,
            order.order_id,
            order.key_id
        );
        println!("Then paste `<payment_id> <signature>` (empty line to cancel):");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let line = lines
            .next_line()
            .await
            .map_err(|e| CheckoutError::Open(e.to_string()))?
            .unwrap_or_default();

        let mut parts = line.split_whitespace();
        let event = match (parts.next(), parts.next()) {
            (Some(payment_id), Some(signature)) => ProviderEvent::Success(PaymentProof {
                order_id: order.order_id.clone(),
                payment_id: payment_id.to_string(),
                signature: signature.to_string(),
            }),
            (None, _) => ProviderEvent::Dismissed,
            (Some(_), None) => ProviderEvent::Failed("expected a payment id and a signature".into()),
        };
        let _ = events.send(event).await;
        Ok(())
    }
}

/// Listener that reports outcomes through the log.
pub struct LogListener;

impl CheckoutListener for LogListener {
    fn on_success(&self, receipt: &PaymentReceipt) {
        info!("Plan {} is now {}", receipt.plan_id, receipt.status);
    }

    fn on_cancel(&self) {
        info!("Checkout cancelled");
    }

    fn on_error(&self, message: &str) {
        warn!("Checkout failed: {message}");
    }
}
