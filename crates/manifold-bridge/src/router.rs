//! Inbound request routing
//!
//! Discovery answers come straight from the registry. Invocations
//! resolve the public identifier, rewrite it to the backend's native
//! form, and forward to the owning session. `initialize` and `ping` are
//! answered locally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use manifold_core::RpcError;
use manifold_core::jsonrpc::{ErrorObject, Notification, Request, RequestId, Response};
use manifold_config::BridgeSettings;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;
use crate::registry::{CatalogEntry, Registry};
use crate::session::Session;
use crate::state::{Backend, CapabilityKind};

/// Routes client requests to backend sessions
pub struct Router {
    backends: Vec<Arc<Backend>>,
    registry: Arc<Registry>,
    settings: Arc<BridgeSettings>,
    /// In-flight invocations by client request id, for cancellation
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl Router {
    pub fn new(
        backends: Vec<Arc<Backend>>,
        registry: Arc<Registry>,
        settings: Arc<BridgeSettings>,
    ) -> Self {
        Self {
            backends,
            registry,
            settings,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one client request and produce its response
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "initialize" => self.initialize().await,
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": self.registry.list(CapabilityKind::Tool)})),
            "resources/list" => {
                Ok(json!({"resources": self.registry.list(CapabilityKind::Resource)}))
            }
            "resources/templates/list" => Ok(json!({"resourceTemplates": []})),
            "prompts/list" => Ok(json!({"prompts": self.registry.list(CapabilityKind::Prompt)})),
            "tools/call" => {
                self.invoke(&id, CapabilityKind::Tool, "tools/call", "name", params)
                    .await
            }
            "resources/read" => {
                self.invoke(&id, CapabilityKind::Resource, "resources/read", "uri", params)
                    .await
            }
            "prompts/get" => {
                self.invoke(&id, CapabilityKind::Prompt, "prompts/get", "name", params)
                    .await
            }
            "logging/setLevel" => self.set_logging_level(params).await,
            "completion/complete" => self.complete(params).await,
            method => Err(BridgeError::MethodNotFound {
                method: method.to_string(),
            }),
        };

        match result {
            Ok(value) => Response::ok(id, value),
            Err(e) => error_response(id, &e),
        }
    }

    /// Handle a client notification; notifications never get responses
    pub async fn handle_notification(&self, notification: Notification) {
        match notification.method.as_str() {
            "notifications/initialized" => {}
            "notifications/cancelled" | "$/cancelRequest" => {
                let params = notification.params.unwrap_or(Value::Null);
                let request_id = params
                    .get("requestId")
                    .or_else(|| params.get("id"))
                    .cloned()
                    .and_then(|v| serde_json::from_value::<RequestId>(v).ok());
                if let Some(request_id) = request_id {
                    self.cancel(&request_id);
                }
            }
            method => {
                tracing::debug!(method, "ignoring client notification");
            }
        }
    }

    /// Cancel an in-flight invocation by its client request id
    pub fn cancel(&self, id: &RequestId) {
        let token = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(token) = token {
            tracing::debug!(%id, "cancelling in-flight request");
            token.cancel();
        }
    }

    /// The bridge advertises the union of capability kinds at least one
    /// ready backend offers
    async fn initialize(&self) -> Result<Value, BridgeError> {
        let kinds = self.registry.declared_kinds().await;
        let mut capabilities = serde_json::Map::new();
        if kinds.tools {
            capabilities.insert("tools".to_string(), json!({"listChanged": true}));
        }
        if kinds.resources {
            capabilities.insert("resources".to_string(), json!({"listChanged": true}));
        }
        if kinds.prompts {
            capabilities.insert("prompts".to_string(), json!({"listChanged": true}));
        }

        Ok(json!({
            "protocolVersion": crate::session::PROTOCOL_VERSION,
            "capabilities": Value::Object(capabilities),
            "serverInfo": {
                "name": "manifold",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }))
    }

    /// Forward an invocation to the backend owning the public identifier
    async fn invoke(
        &self,
        client_id: &RequestId,
        kind: CapabilityKind,
        method: &str,
        id_field: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let public = params
            .get(id_field)
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::InvalidParams {
                reason: format!("missing '{id_field}'"),
            })?
            .to_string();

        let entry = self
            .registry
            .resolve(kind, &public)
            .ok_or_else(|| BridgeError::BackendUnavailable { id: public.clone() })?;

        let (backend, session) = self.target_for(&entry, kind).await.ok_or_else(|| {
            BridgeError::BackendUnavailable { id: public.clone() }
        })?;

        // Rewrite the public identifier to the backend's native one
        let mut forwarded = params;
        if let Some(object) = forwarded.as_object_mut() {
            object.insert(
                id_field.to_string(),
                Value::String(entry.native_id.clone()),
            );
        }

        let cancel = CancellationToken::new();
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id.clone(), cancel.clone());

        let outcome = session
            .request_cancellable(
                method,
                Some(forwarded),
                backend.config.request_timeout(),
                &cancel,
            )
            .await;

        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id);

        outcome
    }

    /// The owning session when it is ready, otherwise a failover target
    /// advertising the same native id
    ///
    /// A shadow entry for the same native id only exists when conflict
    /// resolution dropped one, so failover is exact, never fuzzy.
    async fn target_for(
        &self,
        entry: &CatalogEntry,
        kind: CapabilityKind,
    ) -> Option<(Arc<Backend>, Arc<Session>)> {
        if let Some(target) = self.ready_session(&entry.backend).await {
            return Some(target);
        }

        if !self.settings.failover.enabled {
            return None;
        }

        for backend in &self.backends {
            if backend.name == entry.backend {
                continue;
            }
            let state = backend.state.read().await;
            if state.status.is_ready() && state.snapshot.contains(kind, &entry.native_id) {
                if let Some(session) = state.session.clone() {
                    tracing::info!(
                        from = %entry.backend,
                        to = %backend.name,
                        native_id = %entry.native_id,
                        "failing over request"
                    );
                    return Some((Arc::clone(backend), session));
                }
            }
        }
        None
    }

    async fn ready_session(&self, name: &str) -> Option<(Arc<Backend>, Arc<Session>)> {
        let backend = self.backends.iter().find(|b| b.name == name)?;
        let state = backend.state.read().await;
        if state.status.is_ready() {
            state
                .session
                .clone()
                .map(|session| (Arc::clone(backend), session))
        } else {
            None
        }
    }

    /// Forward the level to every ready backend, best effort
    async fn set_logging_level(&self, params: Value) -> Result<Value, BridgeError> {
        let mut forwarded = 0usize;
        for backend in &self.backends {
            let session = {
                let state = backend.state.read().await;
                state.status.is_ready().then(|| state.session.clone()).flatten()
            };
            let Some(session) = session else { continue };
            match session
                .request(
                    "logging/setLevel",
                    Some(params.clone()),
                    backend.config.request_timeout(),
                )
                .await
            {
                Ok(_) => forwarded += 1,
                Err(e) => {
                    tracing::warn!(
                        backend = %backend.name,
                        error = %e,
                        "failed to forward logging level"
                    );
                }
            }
        }
        tracing::debug!(forwarded, "forwarded logging level to ready backends");
        Ok(json!({}))
    }

    /// Fan completion requests out to every ready backend and merge the
    /// values, preserving first-seen order
    async fn complete(&self, params: Value) -> Result<Value, BridgeError> {
        let mut values: Vec<String> = Vec::new();
        for backend in &self.backends {
            let session = {
                let state = backend.state.read().await;
                state.status.is_ready().then(|| state.session.clone()).flatten()
            };
            let Some(session) = session else { continue };
            match session
                .request(
                    "completion/complete",
                    Some(params.clone()),
                    backend.config.request_timeout(),
                )
                .await
            {
                Ok(result) => {
                    let backend_values = result
                        .pointer("/completion/values")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    for value in backend_values {
                        if let Some(text) = value.as_str() {
                            if !values.iter().any(|seen| seen == text) {
                                values.push(text.to_string());
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        backend = %backend.name,
                        error = %e,
                        "completion request failed"
                    );
                }
            }
        }

        Ok(json!({
            "completion": {"values": values, "hasMore": false}
        }))
    }
}

/// Build the error response, forwarding backend error payloads verbatim
fn error_response(id: RequestId, error: &BridgeError) -> Response {
    let object = match error {
        BridgeError::BackendError {
            code,
            message,
            data,
            ..
        } => ErrorObject {
            code: *code,
            message: message.clone(),
            data: data.clone(),
        },
        other => ErrorObject::new(other.code(), other.client_message()),
    };
    Response::error(Some(id), object)
}

#[cfg(test)]
mod tests {
    use manifold_core::codes;

    use super::*;

    #[test]
    fn backend_error_payload_survives_verbatim() {
        let error = BridgeError::BackendError {
            name: "a".into(),
            code: -32602,
            message: "missing argument".into(),
            data: Some(json!({"argument": "path"})),
        };
        let response = error_response(RequestId::Number(4), &error);
        let object = response.error.unwrap();
        assert_eq!(object.code, -32602);
        assert_eq!(object.message, "missing argument");
        assert_eq!(object.data, Some(json!({"argument": "path"})));
    }

    #[test]
    fn synthesized_errors_use_stable_codes() {
        let error = BridgeError::BackendUnavailable { id: "a.fetch".into() };
        let response = error_response(RequestId::Number(1), &error);
        assert_eq!(response.error.unwrap().code, codes::BACKEND_UNAVAILABLE);
    }
}
