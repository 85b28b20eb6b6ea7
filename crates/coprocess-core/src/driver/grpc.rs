use std::time::Duration;

use coprocess_proto::dispatcher_client::DispatcherClient;
use coprocess_proto::{Event, Object};
use tonic::Request;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue};
use tonic::transport::{Channel, Endpoint, Uri};

use super::{DriverDispatcher, DriverError};
use crate::config::CoProcessOptions;

/// Turns a gateway-style target (`tcp://host:port`, `host:port`) into an
/// HTTP/2 endpoint URL.
pub fn normalize_target(target: &str) -> Result<String, DriverError> {
    let target = target.trim();
    let invalid = |reason: &str| DriverError::InvalidEndpoint {
        target: target.to_string(),
        reason: reason.to_string(),
    };
    if target.is_empty() {
        return Err(invalid("target is empty"));
    }
    if let Some(address) = target.strip_prefix("tcp://") {
        return Ok(format!("http://{address}"));
    }
    if target.starts_with("http://") {
        return Ok(target.to_string());
    }
    if let Some((scheme, _)) = target.split_once("://") {
        return Err(invalid(&format!("unsupported scheme {scheme}")));
    }
    Ok(format!("http://{target}"))
}

fn endpoint(target: &str) -> Result<Endpoint, DriverError> {
    let url = normalize_target(target)?;
    Endpoint::from_shared(url).map_err(|err| DriverError::InvalidEndpoint {
        target: target.to_string(),
        reason: err.to_string(),
    })
}

/// Per-call options for the one-shot helpers.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub metadata: Vec<(String, String)>,
    pub compression: bool,
}

impl CallOptions {
    fn request<T>(&self, message: T) -> Result<Request<T>, DriverError> {
        let mut request = Request::new(message);
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        for (key, value) in &self.metadata {
            let key = AsciiMetadataKey::from_bytes(key.as_bytes())
                .map_err(|_| DriverError::InvalidMetadata(format!("key {key:?}")))?;
            let value = AsciiMetadataValue::try_from(value.as_str())
                .map_err(|_| DriverError::InvalidMetadata(format!("value for {}", key.as_str())))?;
            request.metadata_mut().insert(key, value);
        }
        Ok(request)
    }

    fn client(&self, channel: Channel) -> DispatcherClient<Channel> {
        let client = DispatcherClient::new(channel);
        if self.compression {
            client
                .send_compressed(CompressionEncoding::Gzip)
                .accept_compressed(CompressionEncoding::Gzip)
        } else {
            client
        }
    }
}

/// Connects to `target`, sends a single `Dispatch` call and returns the
/// mutated object.
pub async fn dispatch_once(
    target: &str,
    object: Object,
    options: &CallOptions,
) -> Result<Object, DriverError> {
    let channel = endpoint(target)?.connect().await?;
    let mut client = options.client(channel);
    let response = client.dispatch(options.request(object)?).await?;
    Ok(response.into_inner())
}

/// Connects to `target` and sends a single `DispatchEvent` call.
pub async fn dispatch_event_once(
    target: &str,
    payload: String,
    options: &CallOptions,
) -> Result<(), DriverError> {
    let channel = endpoint(target)?.connect().await?;
    let mut client = options.client(channel);
    client
        .dispatch_event(options.request(Event { payload })?)
        .await?;
    Ok(())
}

/// Dispatcher driver backed by a remote gRPC coprocess.
#[derive(Debug, Clone)]
pub struct GrpcDispatcher {
    client: DispatcherClient<Channel>,
    timeout: Option<Duration>,
}

impl GrpcDispatcher {
    /// Builds the driver without connecting; the channel connects on first use.
    pub fn connect_lazy(options: &CoProcessOptions) -> Result<Self, DriverError> {
        let mut endpoint = endpoint(&options.coprocess_grpc_server)?;
        if !options.grpc_authority.is_empty() {
            let origin = format!("http://{}", options.grpc_authority)
                .parse::<Uri>()
                .map_err(|err| DriverError::InvalidEndpoint {
                    target: options.grpc_authority.clone(),
                    reason: err.to_string(),
                })?;
            endpoint = endpoint.origin(origin);
        }
        let channel = endpoint.connect_lazy();
        let client = DispatcherClient::new(channel)
            .max_decoding_message_size(options.grpc_recv_max_size)
            .max_encoding_message_size(options.grpc_send_max_size);
        Ok(Self {
            client,
            timeout: options.dispatch_timeout(),
        })
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: DispatcherClient::new(channel),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        if let Some(timeout) = self.timeout {
            request.set_timeout(timeout);
        }
        request
    }
}

#[tonic::async_trait]
impl DriverDispatcher for GrpcDispatcher {
    async fn dispatch(&self, object: Object) -> Result<Object, DriverError> {
        let mut client = self.client.clone();
        let response = client.dispatch(self.request(object)).await?;
        Ok(response.into_inner())
    }

    async fn dispatch_event(&self, payload: String) -> Result<(), DriverError> {
        let mut client = self.client.clone();
        client.dispatch_event(self.request(Event { payload })).await?;
        Ok(())
    }
}
