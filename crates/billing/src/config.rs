//! Creem billing configuration
//!
//! All secrets come from environment variables and are never logged.

use std::collections::HashMap;
use std::env;

use promptos_shared::Plan;

use crate::error::{BillingError, BillingResult};

/// Which Creem environment this deployment talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreemMode {
    Live,
    Test,
}

/// Configuration for Creem webhook verification and plan resolution.
#[derive(Debug, Clone)]
pub struct CreemConfig {
    pub mode: CreemMode,
    /// Webhook signing secret for the live environment.
    live_webhook_secret: Option<String>,
    /// Webhook signing secret for the test environment.
    test_webhook_secret: Option<String>,
    /// Static product id -> plan lookup table.
    product_plans: HashMap<String, Plan>,
}

impl CreemConfig {
    /// Load configuration from environment variables.
    ///
    /// - `CREEM_MODE`: `live` or `test` (default: `test`)
    /// - `CREEM_WEBHOOK_SECRET_LIVE` / `CREEM_WEBHOOK_SECRET_TEST`
    /// - `CREEM_PRODUCT_ID_STARTER` / `CREEM_PRODUCT_ID_PRO`
    pub fn from_env() -> BillingResult<Self> {
        let mode = match env::var("CREEM_MODE").as_deref() {
            Ok("live") => CreemMode::Live,
            Ok("test") | Err(_) => CreemMode::Test,
            Ok(other) => {
                return Err(BillingError::Configuration(format!(
                    "CREEM_MODE must be 'live' or 'test', got '{other}'"
                )))
            }
        };

        let mut product_plans = HashMap::new();
        if let Ok(id) = env::var("CREEM_PRODUCT_ID_STARTER") {
            if !id.is_empty() {
                product_plans.insert(id, Plan::Starter);
            }
        }
        if let Ok(id) = env::var("CREEM_PRODUCT_ID_PRO") {
            if !id.is_empty() {
                product_plans.insert(id, Plan::Pro);
            }
        }

        Ok(Self {
            mode,
            live_webhook_secret: env::var("CREEM_WEBHOOK_SECRET_LIVE")
                .ok()
                .filter(|s| !s.is_empty()),
            test_webhook_secret: env::var("CREEM_WEBHOOK_SECRET_TEST")
                .ok()
                .filter(|s| !s.is_empty()),
            product_plans,
        })
    }

    /// Explicit constructor for tests and embedding.
    pub fn new(
        mode: CreemMode,
        live_webhook_secret: Option<String>,
        test_webhook_secret: Option<String>,
        product_plans: HashMap<String, Plan>,
    ) -> Self {
        Self {
            mode,
            live_webhook_secret,
            test_webhook_secret,
            product_plans,
        }
    }

    /// The signing secret for the active environment.
    ///
    /// `None` means the server is misconfigured; the webhook endpoint fails
    /// closed rather than accepting unsigned events.
    pub fn active_secret(&self) -> Option<&str> {
        match self.mode {
            CreemMode::Live => self.live_webhook_secret.as_deref(),
            CreemMode::Test => self.test_webhook_secret.as_deref(),
        }
    }

    /// Resolve a Creem product id to a plan via the static lookup table.
    pub fn resolve_plan(&self, product_id: &str) -> Option<Plan> {
        self.product_plans.get(product_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(mode: CreemMode) -> CreemConfig {
        let mut products = HashMap::new();
        products.insert("prod_starter".to_string(), Plan::Starter);
        products.insert("prod_pro".to_string(), Plan::Pro);
        CreemConfig::new(
            mode,
            Some("live_secret".to_string()),
            Some("test_secret".to_string()),
            products,
        )
    }

    #[test]
    fn active_secret_follows_mode() {
        assert_eq!(config_with(CreemMode::Live).active_secret(), Some("live_secret"));
        assert_eq!(config_with(CreemMode::Test).active_secret(), Some("test_secret"));
    }

    #[test]
    fn missing_secret_is_none() {
        let config = CreemConfig::new(CreemMode::Live, None, None, HashMap::new());
        assert!(config.active_secret().is_none());
    }

    #[test]
    fn resolve_plan_consults_table_only() {
        let config = config_with(CreemMode::Test);
        assert_eq!(config.resolve_plan("prod_pro"), Some(Plan::Pro));
        assert_eq!(config.resolve_plan("prod_starter"), Some(Plan::Starter));
        assert_eq!(config.resolve_plan("prod_unknown"), None);
    }
}
