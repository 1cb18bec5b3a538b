//! Card acquirer seam. The engine only ever asks the gateway to open a
//! payment intent; the terminal outcome arrives later through the payment
//! confirmation callback on the wire surface.

use async_trait::async_trait;
use ulid::Ulid;

#[derive(Debug, Clone)]
pub enum GatewayError {
    /// The acquirer rejected the intent outright.
    Declined(String),
    /// The acquirer could not be reached or answered garbage.
    Unavailable(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::Declined(reason) => write!(f, "declined: {reason}"),
            GatewayError::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Abstraction over card acquirers. Implementations must be cheap to call
/// concurrently; the engine never holds a lock across `create_intent`.
#[async_trait]
pub trait CardGateway: Send + Sync {
    /// Open a payment intent and return its external reference.
    async fn create_intent(&self, amount_minor: i64, currency: &str) -> Result<String, GatewayError>;
}

/// Gateway used when no real acquirer is configured: mints a local intent id
/// and trusts the caller to deliver the callback (useful for closed-loop
/// deployments and manual settlement).
pub struct LocalGateway;

#[async_trait]
impl CardGateway for LocalGateway {
    async fn create_intent(&self, amount_minor: i64, currency: &str) -> Result<String, GatewayError> {
        let reference = format!("pi_{}", Ulid::new());
        tracing::info!("local intent {reference} for {amount_minor} {currency}");
        Ok(reference)
    }
}

/// Always fails with `Unavailable`. Lets tests exercise the
/// nothing-recorded-on-gateway-error path.
#[cfg(test)]
pub struct FailingGateway;

#[cfg(test)]
#[async_trait]
impl CardGateway for FailingGateway {
    async fn create_intent(&self, _amount_minor: i64, _currency: &str) -> Result<String, GatewayError> {
        Err(GatewayError::Unavailable("connection refused".into()))
    }
}

/// Returns the same reference on every call, which is how a retrying acquirer
/// client can hand the engine a duplicate external reference.
#[cfg(test)]
pub struct FixedRefGateway(pub String);

#[cfg(test)]
#[async_trait]
impl CardGateway for FixedRefGateway {
    async fn create_intent(&self, _amount_minor: i64, _currency: &str) -> Result<String, GatewayError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_gateway_mints_unique_references() {
        let gateway = LocalGateway;
        let a = gateway.create_intent(1000, "EUR").await.unwrap();
        let b = gateway.create_intent(1000, "EUR").await.unwrap();
        assert!(a.starts_with("pi_"));
        assert!(b.starts_with("pi_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn failing_gateway_reports_unavailable() {
        let err = FailingGateway.create_intent(1000, "EUR").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }
}
