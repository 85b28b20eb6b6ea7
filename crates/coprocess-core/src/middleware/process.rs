use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use coprocess_proto::{HookType, SessionState};
use http::header::{AUTHORIZATION, CONTENT_LENGTH};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use serde_json::json;

use super::headers::{obfuscate_key, sync_headers_and_multivalue_headers};
use super::{
    CoProcessMiddleware, MiddlewareError, RequestStatus, SessionKey, TransformRequestMethod,
    UrlRewriteTarget,
};
use crate::hooks::EventMessage;

const MIDDLEWARE_ERROR: &str = "Middleware error";
const KEY_NOT_AUTHORISED: &str = "Key not authorised";
/// Event handler name used for rejected keys.
pub const AUTH_FAILURE_EVENT: &str = "AuthFailure";

/// What the gateway should do with a request after a coprocess hook ran.
#[derive(Debug)]
pub enum RequestOutcome {
    /// Pass the (possibly mutated) request down the chain.
    Continue,
    /// Answer the client with this response and stop the chain.
    Respond(Response<Bytes>),
    /// Fail the request through the gateway's error handler.
    Reject {
        status: StatusCode,
        message: String,
        headers: HeaderMap,
    },
}

impl RequestOutcome {
    fn reject(status: StatusCode, message: impl Into<String>) -> Self {
        RequestOutcome::Reject {
            status,
            message: message.into(),
            headers: HeaderMap::new(),
        }
    }

    fn middleware_error() -> Self {
        Self::reject(StatusCode::INTERNAL_SERVER_ERROR, MIDDLEWARE_ERROR)
    }
}

fn status_code(code: i32) -> Option<StatusCode> {
    u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
}

fn header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => tracing::warn!(target: "coprocess", header = %name, "skipping invalid override header"),
        }
    }
    map
}

/// Client address as reported by the proxy headers, empty when unknown.
fn origin(request: &Request<Bytes>) -> String {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    header("x-real-ip")
        .or_else(|| header("x-forwarded-for").and_then(|value| value.split(',').next()))
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

impl CoProcessMiddleware {
    /// Sends an `AuthFailure` event through the driver without blocking the
    /// request.
    fn auth_failed(&self, request: &Request<Bytes>, key: &str) {
        let message = json!({
            "message": "Auth Failure",
            "path": request.uri().path(),
            "origin": origin(request),
            "key": obfuscate_key(key),
        });
        let payload = match EventMessage::new(AUTH_FAILURE_EVENT, message).to_payload() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(target: "coprocess", error = %err, "failed to encode auth failure event");
                return;
            }
        };
        let drivers = self.drivers.clone();
        let driver = self.driver;
        tokio::spawn(async move {
            if let Err(err) = drivers.dispatch_event(driver, payload).await {
                tracing::warn!(target: "coprocess", error = %err, "failed to dispatch auth failure event");
            }
        });
    }

    /// Runs the hook for an incoming request.
    pub async fn process_request(&self, request: &mut Request<Bytes>) -> RequestOutcome {
        if self.hook_type == HookType::CustomKeyCheck
            && request.extensions().get::<RequestStatus>() == Some(&RequestStatus::OkAndIgnore)
        {
            return RequestOutcome::Continue;
        }

        tracing::debug!(target: "coprocess", hook_type = ?self.hook_type, hook = %self.hook_name, "CoProcess Request");
        let original_uri = request.uri().clone();

        let mut object = match self.build_object(request, None) {
            Ok(object) => object,
            Err(err) => {
                tracing::error!(target: "coprocess", error = %err, "Failed to build request object");
                return RequestOutcome::middleware_error();
            }
        };

        let mut orig_url = None;
        if let Some(UrlRewriteTarget(target)) = request.extensions().get::<UrlRewriteTarget>()
            && let Some(mini) = object.request.as_mut()
        {
            orig_url = Some(std::mem::replace(&mut mini.url, target.to_string()));
            mini.request_uri = target
                .path_and_query()
                .map(|path| path.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
        }

        let mut orig_method = None;
        if let Some(TransformRequestMethod(method)) = request.extensions().get::<TransformRequestMethod>()
            && let Some(mini) = object.request.as_mut()
        {
            orig_method = Some(request.method().clone());
            mini.method = method.to_string();
        }

        let started = Instant::now();
        let mut returned = match self.drivers.dispatch(self.driver, object).await {
            Ok(object) => object,
            Err(err) => {
                tracing::error!(target: "coprocess", error = %err, "Dispatch error");
                if self.hook_type == HookType::CustomKeyCheck {
                    return RequestOutcome::reject(StatusCode::FORBIDDEN, KEY_NOT_AUTHORISED);
                }
                return RequestOutcome::middleware_error();
            }
        };
        tracing::debug!(
            target: "coprocess",
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "gRPC request processing took"
        );

        if let Err(err) =
            self.post_process(&returned, request, orig_url.as_deref(), orig_method.as_ref())
        {
            *request.uri_mut() = original_uri;
            tracing::error!(target: "coprocess", error = %err, "Failed to post-process request object");
            return RequestOutcome::middleware_error();
        }

        let mut token = String::new();
        if let Some(session) = returned.session.as_mut() {
            session
                .metadata
                .extend(returned.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            token = session.metadata.get("token").cloned().unwrap_or_default();
        }

        let overrides = returned
            .request
            .as_mut()
            .and_then(|mini| mini.return_overrides.take())
            .unwrap_or_default();
        let mut response_body = overrides.response_body;
        if !overrides.response_error.is_empty() {
            response_body = overrides.response_error;
        }

        if overrides.response_code >= 400 && !overrides.override_error {
            tracing::info!(target: "coprocess", key = %obfuscate_key(&token), "Attempted access with invalid key");
            self.auth_failed(request, &token);
            let Some(status) = status_code(overrides.response_code) else {
                tracing::error!(target: "coprocess", error = %MiddlewareError::InvalidStatus(overrides.response_code), "Failed to apply return overrides");
                return RequestOutcome::middleware_error();
            };
            let message = if response_body.is_empty() {
                KEY_NOT_AUTHORISED.to_string()
            } else {
                response_body
            };
            return RequestOutcome::Reject {
                status,
                message,
                headers: header_map(&overrides.headers),
            };
        }

        if overrides.response_code > 0 {
            let Some(status) = status_code(overrides.response_code) else {
                tracing::error!(target: "coprocess", error = %MiddlewareError::InvalidStatus(overrides.response_code), "Failed to apply return overrides");
                return RequestOutcome::middleware_error();
            };
            let mut response = Response::new(Bytes::from(response_body));
            *response.status_mut() = status;
            *response.headers_mut() = header_map(&overrides.headers);
            return RequestOutcome::Respond(response);
        }

        if self.spec.coprocess_auth_enabled() && self.hook_type == HookType::CustomKeyCheck {
            let Some(mut session) = returned.session.take().filter(|_| !token.is_empty()) else {
                tracing::info!(target: "coprocess", hook = %self.hook_name, "coprocess auth hook returned no session");
                let auth_header = request
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                self.auth_failed(request, &auth_header);
                return RequestOutcome::reject(StatusCode::FORBIDDEN, "Forbidden");
            };
            session.org_id = self.spec.org_id.clone();
            request.extensions_mut().insert(session);
            request.extensions_mut().insert(SessionKey(token));
        }

        RequestOutcome::Continue
    }

    /// Runs a response hook over the upstream `response`.
    ///
    /// On error `response` is left as it was and the error displays as
    /// `Middleware error`, with the cause as its source.
    pub async fn handle_response(
        &self,
        request: &Request<Bytes>,
        response: &mut Response<Bytes>,
        session: Option<&SessionState>,
    ) -> Result<(), MiddlewareError> {
        tracing::debug!(target: "coprocess", hook = %self.hook_name, "Response hook '{}' is called", self.name());

        let (status, headers, body) = match self.run_response_hook(request, response, session).await {
            Ok(parts) => parts,
            Err(err) => {
                tracing::debug!(target: "coprocess", hook = %self.hook_name, error = %err, "Response hook failed");
                return Err(MiddlewareError::ResponseHook(Box::new(err)));
            }
        };
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        *response.body_mut() = body;
        Ok(())
    }

    /// Dispatches the response object and validates what came back.
    async fn run_response_hook(
        &self,
        request: &Request<Bytes>,
        response: &Response<Bytes>,
        session: Option<&SessionState>,
    ) -> Result<(StatusCode, HeaderMap, Bytes), MiddlewareError> {
        let mut object = self.build_object(request, Some(response))?;
        object.session = session.cloned();
        let sent_headers = object
            .response
            .as_ref()
            .map(|response| response.headers.clone())
            .unwrap_or_default();

        let returned = self.drivers.dispatch(self.driver, object).await?;
        let mut returned_response = returned.response.ok_or(MiddlewareError::MissingResponse)?;

        let status = status_code(returned_response.status_code)
            .ok_or(MiddlewareError::InvalidStatus(returned_response.status_code))?;

        if sent_headers != returned_response.headers {
            returned_response.multivalue_headers = sync_headers_and_multivalue_headers(
                &returned_response.headers,
                returned_response.multivalue_headers,
            );
        }

        let mut headers = HeaderMap::new();
        for header in &returned_response.multivalue_headers {
            let name = HeaderName::from_bytes(header.key.as_bytes())
                .map_err(|_| MiddlewareError::InvalidHeader(header.key.clone()))?;
            for value in &header.values {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| MiddlewareError::InvalidHeader(header.key.clone()))?;
                headers.append(name.clone(), value);
            }
        }

        let body = Bytes::from(returned_response.raw_body);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok((status, headers, body))
    }
}
