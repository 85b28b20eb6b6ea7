use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use coprocess_proto::{Header, HookType, MiniRequestObject, Object, ResponseObject, ReturnOverrides, SessionState};
use http::header::{CONTENT_LENGTH, HOST};
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, Uri};

use super::headers::canonical_header_key;
use super::{CoProcessMiddleware, MiddlewareError, TransformRequestMethod, UrlRewriteTarget};

type QueryValues = BTreeMap<String, Vec<String>>;

fn header_text(value: &HeaderValue) -> String {
    String::from_utf8_lossy(value.as_bytes()).into_owned()
}

/// First value of every header, keyed by canonical name.
fn univalue_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            headers
                .get(name)
                .map(|value| (canonical_header_key(name.as_str()), header_text(value)))
        })
        .collect()
}

fn multivalue_headers(headers: &HeaderMap) -> Vec<Header> {
    headers
        .keys()
        .map(|name| Header {
            key: canonical_header_key(name.as_str()),
            values: headers.get_all(name).iter().map(header_text).collect(),
        })
        .collect()
}

fn query_values(query: Option<&str>) -> QueryValues {
    let mut values = QueryValues::new();
    for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        values.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    values
}

fn encode_query(values: &QueryValues) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, list) in values {
        for value in list {
            serializer.append_pair(key, value);
        }
    }
    serializer.finish()
}

/// Parses an absolute URI or an absolute path, rejecting fragments.
pub(crate) fn parse_request_uri(raw: &str) -> Result<Uri, MiddlewareError> {
    let invalid = |reason: &str| MiddlewareError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    if raw.is_empty() {
        return Err(invalid("empty url"));
    }
    if raw.contains('#') {
        return Err(invalid("fragments are not allowed"));
    }
    if !raw.starts_with('/') && !raw.contains("://") {
        return Err(invalid("not an absolute path or URI"));
    }
    raw.parse::<Uri>().map_err(|err| invalid(&err.to_string()))
}

fn with_query(uri: &Uri, query: &str) -> Result<Uri, MiddlewareError> {
    let path_and_query = if query.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{query}", uri.path())
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query.as_str()).map_err(|err| {
        MiddlewareError::InvalidUrl {
            url: path_and_query.clone(),
            reason: err.to_string(),
        }
    })?);
    Uri::from_parts(parts).map_err(|err| MiddlewareError::InvalidUrl {
        url: path_and_query,
        reason: err.to_string(),
    })
}

fn parse_header_name(name: &str) -> Result<HeaderName, MiddlewareError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| MiddlewareError::InvalidHeader(name.to_string()))
}

impl CoProcessMiddleware {
    /// Builds the object sent to the coprocess for `request` and, in response
    /// hooks, the upstream `response`.
    pub fn build_object(
        &self,
        request: &Request<Bytes>,
        response: Option<&Response<Bytes>>,
    ) -> Result<Object, MiddlewareError> {
        let mut headers = univalue_headers(request.headers());
        let host = request
            .headers()
            .get(HOST)
            .map(header_text)
            .or_else(|| request.uri().authority().map(|authority| authority.to_string()))
            .unwrap_or_default();
        if !host.is_empty() {
            headers.insert("Host".to_string(), host);
        }

        let scheme = match request.uri().scheme_str() {
            Some("https") => "https",
            _ => "http",
        };

        let params = query_values(request.uri().query())
            .into_iter()
            .filter_map(|(key, values)| values.into_iter().next().map(|value| (key, value)))
            .collect();

        let raw_body = request.body().to_vec();
        let body = self.text_body(&raw_body);

        let mini = MiniRequestObject {
            headers,
            url: request.uri().to_string(),
            params,
            return_overrides: Some(ReturnOverrides {
                response_code: -1,
                ..Default::default()
            }),
            method: request.method().to_string(),
            request_uri: request
                .uri()
                .path_and_query()
                .map(PathAndQuery::as_str)
                .unwrap_or("/")
                .to_string(),
            scheme: scheme.to_string(),
            raw_body,
            body,
            ..Default::default()
        };

        let mut object = Object {
            request: Some(mini),
            hook_name: self.hook_name.clone(),
            spec: self.spec_map()?,
            ..Default::default()
        };
        object.set_hook_type(self.hook_type);

        if !matches!(self.hook_type, HookType::Pre | HookType::CustomKeyCheck)
            && let Some(session) = request.extensions().get::<SessionState>()
        {
            object.metadata = session.metadata.clone();
            object.session = Some(session.clone());
        }

        if let Some(response) = response {
            let raw_body = response.body().to_vec();
            object.response = Some(ResponseObject {
                status_code: i32::from(response.status().as_u16()),
                headers: univalue_headers(response.headers()),
                multivalue_headers: multivalue_headers(response.headers()),
                body: self.text_body(&raw_body),
                raw_body,
            });
        }

        Ok(object)
    }

    fn text_body(&self, raw: &[u8]) -> String {
        if self.raw_body_only {
            return String::new();
        }
        std::str::from_utf8(raw).map(str::to_string).unwrap_or_default()
    }

    fn spec_map(&self) -> Result<HashMap<String, String>, MiddlewareError> {
        let mut spec = HashMap::from([
            ("OrgID".to_string(), self.spec.org_id.clone()),
            ("APIID".to_string(), self.spec.api_id.clone()),
            ("bundle_hash".to_string(), self.spec.bundle_hash.clone()),
        ]);
        if self.spec.should_add_config_data() {
            spec.insert(
                "config_data".to_string(),
                serde_json::to_string(&self.spec.config_data)?,
            );
        }
        Ok(spec)
    }

    /// Applies the mutations a coprocess returned to `request`.
    ///
    /// `orig_url` and `orig_method` are what the request carried before a
    /// rewrite target or transform method was substituted into the object.
    pub(crate) fn post_process(
        &self,
        object: &Object,
        request: &mut Request<Bytes>,
        orig_url: Option<&str>,
        orig_method: Option<&Method>,
    ) -> Result<(), MiddlewareError> {
        let mini = object.request.as_ref().ok_or(MiddlewareError::MissingRequest)?;

        *request.body_mut() = Bytes::from(mini.raw_body.clone());
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(mini.raw_body.len()));

        for name in &mini.delete_headers {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                request.headers_mut().remove(name);
            }
        }
        for (name, value) in &mini.set_headers {
            let header = parse_header_name(name)?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| MiddlewareError::InvalidHeader(name.clone()))?;
            request.headers_mut().insert(header, value);
        }

        let mut updated = query_values(request.uri().query());
        for key in &mini.delete_params {
            updated.remove(key);
        }
        for (key, value) in &mini.add_params {
            updated.insert(key.clone(), vec![value.clone()]);
        }

        let parsed = parse_request_uri(&mini.url)?;
        if request.extensions().get::<UrlRewriteTarget>().is_some() {
            request.extensions_mut().insert(UrlRewriteTarget(parsed));
            *request.uri_mut() = parse_request_uri(orig_url.unwrap_or_default())?;
        } else {
            *request.uri_mut() = parsed;
        }

        let returned_method = if mini.method.is_empty() {
            None
        } else {
            Some(
                Method::from_bytes(mini.method.as_bytes())
                    .map_err(|_| MiddlewareError::InvalidMethod(mini.method.clone()))?,
            )
        };
        if request.extensions().get::<TransformRequestMethod>().is_some() {
            if let Some(method) = returned_method {
                request.extensions_mut().insert(TransformRequestMethod(method));
            }
            if let Some(method) = orig_method {
                *request.method_mut() = method.clone();
            }
        } else if let Some(method) = returned_method {
            *request.method_mut() = method;
        }

        if query_values(request.uri().query()) != updated {
            let uri = with_query(request.uri(), &encode_query(&updated))?;
            *request.uri_mut() = uri;
        }

        Ok(())
    }
}
