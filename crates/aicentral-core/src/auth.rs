use std::collections::HashMap;
use std::sync::Arc;

use aicentral_common::ConsumerId;
use arc_swap::ArcSwap;
use http::HeaderMap;

/// What the auth step learned about the caller. Tagging a `consumer_id`
/// makes it visible to every subsequent step (per-consumer limiters,
/// affinity keying, telemetry).
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub consumer_id: Option<ConsumerId>,
}

#[derive(Debug)]
pub struct AuthError {
    pub status: u16,
    pub body: String,
}

impl AuthError {
    fn unauthorized(body: impl Into<String>) -> Self {
        Self {
            status: 401,
            body: body.into(),
        }
    }
}

/// The pipeline's auth step: validates the caller and tags a consumer id.
/// Key-validation semantics (hashing, expiry, revocation) live outside this
/// crate; the gateway only needs a yes/no answer plus a consumer identity.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError>;
}

/// Used when a pipeline's auth spec is `"none"`: every request is admitted,
/// unattributed to any consumer.
#[derive(Debug, Default)]
pub struct NoneAuth;

impl AuthProvider for NoneAuth {
    fn authenticate(&self, _headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        Ok(AuthContext::default())
    }
}

/// One configured client: a name and the set of API keys that authenticate
/// as it.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub name: String,
    pub allowed_keys: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct KeySnapshot {
    client_by_key: HashMap<String, ConsumerId>,
}

/// In-memory list-of-clients auth provider, built from the pipeline's
/// configured `(clientName, allowedKeys[])` list.
#[derive(Debug)]
pub struct KeyedAuth {
    snapshot: ArcSwap<KeySnapshot>,
}

impl KeyedAuth {
    pub fn new(clients: Vec<ClientEntry>) -> Self {
        let mut client_by_key = HashMap::new();
        for client in clients {
            let consumer_id = ConsumerId::from(client.name.clone());
            for key in client.allowed_keys {
                client_by_key.insert(key, consumer_id.clone());
            }
        }
        Self {
            snapshot: ArcSwap::from_pointee(KeySnapshot { client_by_key }),
        }
    }

    pub fn replace(&self, clients: Vec<ClientEntry>) {
        let mut client_by_key = HashMap::new();
        for client in clients {
            let consumer_id = ConsumerId::from(client.name.clone());
            for key in client.allowed_keys {
                client_by_key.insert(key, consumer_id.clone());
            }
        }
        self.snapshot.store(Arc::new(KeySnapshot { client_by_key }));
    }
}

impl AuthProvider for KeyedAuth {
    fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let api_key =
            extract_api_key(headers).ok_or_else(|| AuthError::unauthorized("missing api key"))?;

        let snapshot = self.snapshot.load();
        let consumer_id = snapshot
            .client_by_key
            .get(&api_key)
            .cloned()
            .ok_or_else(|| AuthError::unauthorized("invalid api key"))?;

        Ok(AuthContext {
            consumer_id: Some(consumer_id),
        })
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_value(headers, "api-key") {
        return Some(value);
    }

    let auth = header_value(headers, "authorization")?;
    let auth = auth.trim();
    if let Some(token) = auth.strip_prefix("Bearer ") {
        return Some(token.trim().to_string());
    }
    if let Some(token) = auth.strip_prefix("bearer ") {
        return Some(token.trim().to_string());
    }
    None
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn keyed_auth_tags_consumer() {
        let auth = KeyedAuth::new(vec![ClientEntry {
            name: "team-a".to_string(),
            allowed_keys: vec!["sk-a".to_string()],
        }]);
        let mut headers = HeaderMap::new();
        headers.insert("api-key", HeaderValue::from_static("sk-a"));
        let ctx = auth.authenticate(&headers).unwrap();
        assert_eq!(ctx.consumer_id.unwrap().as_str(), "team-a");
    }

    #[test]
    fn keyed_auth_rejects_unknown_key() {
        let auth = KeyedAuth::new(vec![ClientEntry {
            name: "team-a".to_string(),
            allowed_keys: vec!["sk-a".to_string()],
        }]);
        let mut headers = HeaderMap::new();
        headers.insert("api-key", HeaderValue::from_static("sk-bad"));
        let err = auth.authenticate(&headers).unwrap_err();
        assert_eq!(err.status, 401);
    }

    #[test]
    fn none_auth_always_admits() {
        let auth = NoneAuth;
        assert!(auth.authenticate(&HeaderMap::new()).is_ok());
    }
}
