//! Top-level configuration: everything an operator tunes, with the defaults
//! the rest of the crate assumes.

use std::time::Duration;

use crate::client::WebhookConfig;
use crate::dispatcher::DispatcherConfig;
use crate::payload::BuildRules;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone)]
pub struct CourierConfig {
    /// Master switch. Off means `submit` becomes a no-op.
    pub enabled: bool,
    pub webhook_url: String,
    /// Queue group; lets several integrations share one store.
    pub group: String,
    /// Comma-separated attribute slugs probed for the `model` field.
    pub model_attributes: String,
    pub link_label: String,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub verify_tls: bool,
    pub retry: RetryPolicy,
    pub workers: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub audit_window: Duration,
    pub fast_fail_client_errors: bool,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: String::new(),
            group: "webhook-delivery".to_string(),
            model_attributes: String::new(),
            link_label: "Buy Now".to_string(),
            max_attempts: 5,
            timeout: Duration::from_secs(45),
            verify_tls: true,
            retry: RetryPolicy::default(),
            workers: 2,
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            lease_timeout: Duration::from_secs(60),
            audit_window: Duration::from_secs(24 * 3600),
            fast_fail_client_errors: false,
        }
    }
}

impl CourierConfig {
    /// Enabled only when there is somewhere to deliver to.
    pub fn integration_enabled(&self) -> bool {
        self.enabled && !self.webhook_url.is_empty()
    }

    pub fn build_rules(&self) -> BuildRules {
        BuildRules::parse(&self.model_attributes, &self.link_label)
    }

    pub fn webhook(&self) -> WebhookConfig {
        WebhookConfig {
            url: self.webhook_url.clone(),
            timeout: self.timeout,
            verify_tls: self.verify_tls,
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            group: self.group.clone(),
            workers: self.workers,
            batch_size: self.batch_size,
            poll_interval: self.poll_interval,
            lease_timeout: self.lease_timeout,
            audit_window: self.audit_window,
            retry: self.retry.clone(),
            fast_fail_client_errors: self.fast_fail_client_errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enabled_requires_a_webhook_url() {
        let mut config = CourierConfig::default();
        assert!(!config.integration_enabled());

        config.webhook_url = "https://hooks.example/abc".to_string();
        assert!(config.integration_enabled());

        config.enabled = false;
        assert!(!config.integration_enabled());
    }

    #[test]
    fn build_rules_come_from_the_raw_slug_list() {
        let config = CourierConfig {
            model_attributes: "model, variant-model".to_string(),
            ..CourierConfig::default()
        };
        let rules = config.build_rules();
        assert_eq!(rules.model_attributes, vec!["model", "variant-model"]);
        assert_eq!(rules.link_label, "Buy Now");
    }
}
