//! Rotating API-key chain handed to tools.
//!
//! Every service (`openai`, `anthropic`, ...) owns an ordered list of keys.
//! The front key is the active one; rotating moves it to the back. Tools get
//! a copy of the chain with each request and hand it back with their
//! response, so the scheduler always keeps the most recent key priority.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ToolError;
use crate::tools::{ToolReply, ToolResponse};

/// Ordered API keys per service.
#[derive(Debug, Default)]
pub struct KeyChain {
    services: HashMap<String, VecDeque<SecretString>>,
}

impl KeyChain {
    /// Build a chain from plain-text keys.
    pub fn new(keys: HashMap<String, Vec<String>>) -> Self {
        let services = keys
            .into_iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(service, keys)| {
                let keys = keys.into_iter().map(SecretString::from).collect();
                (service, keys)
            })
            .collect();
        Self { services }
    }

    /// The active key for a service.
    pub fn get(&self, service: &str) -> Option<&SecretString> {
        self.services.get(service).and_then(|keys| keys.front())
    }

    /// Move the active key of a service to the back of its list.
    pub fn rotate(&mut self, service: &str) {
        if let Some(keys) = self.services.get_mut(service) {
            keys.rotate_left(1.min(keys.len()));
        }
    }

    /// How many rotations each service allows before every key was tried.
    pub fn max_retries(&self) -> HashMap<String, usize> {
        self.services
            .iter()
            .map(|(service, keys)| (service.clone(), keys.len().saturating_sub(1)))
            .collect()
    }

    /// Names of all configured services.
    pub fn services(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Clone for KeyChain {
    fn clone(&self) -> Self {
        let services = self
            .services
            .iter()
            .map(|(service, keys)| {
                let keys = keys
                    .iter()
                    .map(|key| SecretString::from(key.expose_secret().to_owned()))
                    .collect();
                (service.clone(), keys)
            })
            .collect();
        Self { services }
    }
}

/// Run a tool body, rotating to the next key of a service whenever the body
/// reports a rate limit for it.
///
/// Gives up once every key of the rate-limited service was tried. Any other
/// error becomes a failure response carrying the error message. The returned
/// response always carries the chain in its final rotation state.
pub async fn with_key_rotation<F, Fut>(mut keys: KeyChain, mut attempt: F) -> ToolResponse
where
    F: FnMut(KeyChain) -> Fut,
    Fut: Future<Output = Result<ToolReply, ToolError>>,
{
    let mut retries_left = keys.max_retries();

    loop {
        match attempt(keys.clone()).await {
            Ok(reply) => return ToolResponse::from_reply(reply, keys),
            Err(ToolError::RateLimited { service }) => {
                let left = retries_left.entry(service.clone()).or_insert(0);
                if *left == 0 {
                    tracing::warn!(service = %service, "All keys rate limited");
                    let message = ToolError::RateLimited { service }.to_string();
                    return ToolResponse::failure(message, keys);
                }
                *left -= 1;
                keys.rotate(&service);
                tracing::debug!(service = %service, "Rotated API key after rate limit");
            }
            Err(e) => return ToolResponse::failure(e.to_string(), keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chain() -> KeyChain {
        KeyChain::new(HashMap::from([
            ("openai".to_string(), vec!["k1".to_string(), "k2".to_string()]),
            ("anthropic".to_string(), vec!["a1".to_string()]),
            ("empty".to_string(), vec![]),
        ]))
    }

    #[test]
    fn rotate_cycles_keys() {
        let mut keys = chain();
        assert_eq!(keys.get("openai").unwrap().expose_secret(), "k1");
        keys.rotate("openai");
        assert_eq!(keys.get("openai").unwrap().expose_secret(), "k2");
        keys.rotate("openai");
        assert_eq!(keys.get("openai").unwrap().expose_secret(), "k1");
        keys.rotate("missing");
    }

    #[test]
    fn max_retries_per_service() {
        let retries = chain().max_retries();
        assert_eq!(retries["openai"], 1);
        assert_eq!(retries["anthropic"], 0);
        assert!(!retries.contains_key("empty"));
    }

    #[test]
    fn debug_does_not_leak_keys() {
        let rendered = format!("{:?}", chain());
        assert!(!rendered.contains("k1"));
    }

    #[tokio::test]
    async fn rotation_recovers_from_rate_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let response = with_key_rotation(chain(), move |keys| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    return Err(ToolError::RateLimited {
                        service: "openai".into(),
                    });
                }
                let key = keys.get("openai").unwrap().expose_secret().to_string();
                Ok(ToolReply::text(key))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(response.message, "k2");
        assert_eq!(response.keys.get("openai").unwrap().expose_secret(), "k2");
    }

    #[tokio::test]
    async fn rotation_gives_up_after_all_keys() {
        let response = with_key_rotation(chain(), |_| async {
            Err(ToolError::RateLimited {
                service: "anthropic".into(),
            })
        })
        .await;

        assert!(response.message.contains("anthropic"));
        assert_eq!(response.prompt.as_deref(), Some(""));
        assert!(response.transaction.is_none());
    }

    #[tokio::test]
    async fn other_errors_become_failures() {
        let response = with_key_rotation(chain(), |_| async {
            Err(ToolError::InvalidParameters {
                name: "t".into(),
                reason: "bad prompt".into(),
            })
        })
        .await;

        assert!(response.message.contains("bad prompt"));
    }
}
