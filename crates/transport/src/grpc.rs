//! gRPC client for the internal operator service.
//!
//! [`SparkInternalServiceClient`] follows the tonic codegen shape and is
//! checked in by hand -- the service surface is seven unary methods and
//! keeping the file in-tree avoids a protoc build dependency.
//! [`GrpcFollowerClient`] wraps one lazily-connecting channel per operator
//! and implements [`FollowerClient`] over it. Channels are HTTP/2
//! multiplexed and reconnect internally, so there is no pool management
//! here.

use std::collections::HashMap;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};

use crate::internal;
use crate::rpc::{FollowerClient, RpcError};

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// Address of a single peer operator.
#[derive(Debug, Clone)]
pub struct OperatorEndpoint {
    /// Stable operator id used on the wire.
    pub id: String,
    /// gRPC endpoint URL.
    pub address: String,
}

/// Timeouts for internal fan-out calls.
#[derive(Debug, Clone)]
pub struct GrpcConfig {
    /// TCP + TLS handshake timeout. Default: 10 s.
    pub connect_timeout: Duration,
    /// Per-request timeout; the coordinator's deadline propagation bound.
    /// Default: 30 s.
    pub request_timeout: Duration,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Generated-style unary client
// ---------------------------------------------------------------------------

/// Client for `spark.internal.SparkInternalService`.
pub mod spark_internal_service_client {
    #![allow(clippy::wildcard_imports)]

    use tonic::codegen::*;

    use crate::internal;

    #[derive(Debug, Clone)]
    pub struct SparkInternalServiceClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl SparkInternalServiceClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> SparkInternalServiceClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        async fn unary<Req, Resp>(
            &mut self,
            request: tonic::Request<Req>,
            path: &'static str,
            method: &'static str,
        ) -> std::result::Result<tonic::Response<Resp>, tonic::Status>
        where
            Req: prost::Message + Send + Sync + 'static,
            Resp: prost::Message + Default + Send + Sync + 'static,
        {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(path);
            let mut request = request;
            request.extensions_mut().insert(GrpcMethod::new(
                "spark.internal.SparkInternalService",
                method,
            ));
            self.inner.unary(request, path, codec).await
        }

        pub async fn initiate_transfer(
            &mut self,
            request: impl tonic::IntoRequest<internal::InitiateTransferInternal>,
        ) -> std::result::Result<tonic::Response<internal::Empty>, tonic::Status> {
            self.unary(
                request.into_request(),
                "/spark.internal.SparkInternalService/InitiateTransfer",
                "InitiateTransfer",
            )
            .await
        }

        pub async fn initiate_cooperative_exit(
            &mut self,
            request: impl tonic::IntoRequest<internal::InitiateCooperativeExitInternal>,
        ) -> std::result::Result<tonic::Response<internal::Empty>, tonic::Status> {
            self.unary(
                request.into_request(),
                "/spark.internal.SparkInternalService/InitiateCooperativeExit",
                "InitiateCooperativeExit",
            )
            .await
        }

        pub async fn rollback_transfer(
            &mut self,
            request: impl tonic::IntoRequest<internal::RollbackTransferInternal>,
        ) -> std::result::Result<tonic::Response<internal::Empty>, tonic::Status> {
            self.unary(
                request.into_request(),
                "/spark.internal.SparkInternalService/RollbackTransfer",
                "RollbackTransfer",
            )
            .await
        }

        pub async fn apply_tweaks(
            &mut self,
            request: impl tonic::IntoRequest<internal::ApplyTweaksInternal>,
        ) -> std::result::Result<tonic::Response<internal::Empty>, tonic::Status> {
            self.unary(
                request.into_request(),
                "/spark.internal.SparkInternalService/ApplyTweaks",
                "ApplyTweaks",
            )
            .await
        }

        pub async fn settle_claim(
            &mut self,
            request: impl tonic::IntoRequest<internal::SettleClaimInternal>,
        ) -> std::result::Result<tonic::Response<internal::Empty>, tonic::Status> {
            self.unary(
                request.into_request(),
                "/spark.internal.SparkInternalService/SettleClaim",
                "SettleClaim",
            )
            .await
        }

        pub async fn frost_commit(
            &mut self,
            request: impl tonic::IntoRequest<internal::FrostCommitRequest>,
        ) -> std::result::Result<tonic::Response<internal::FrostCommitResponse>, tonic::Status>
        {
            self.unary(
                request.into_request(),
                "/spark.internal.SparkInternalService/FrostCommit",
                "FrostCommit",
            )
            .await
        }

        pub async fn frost_sign(
            &mut self,
            request: impl tonic::IntoRequest<internal::FrostSignRequest>,
        ) -> std::result::Result<tonic::Response<internal::FrostSignResponse>, tonic::Status>
        {
            self.unary(
                request.into_request(),
                "/spark.internal.SparkInternalService/FrostSign",
                "FrostSign",
            )
            .await
        }
    }
}

pub use spark_internal_service_client::SparkInternalServiceClient;

// ---------------------------------------------------------------------------
// FollowerClient over gRPC
// ---------------------------------------------------------------------------

/// [`FollowerClient`] backed by one lazily-connecting channel per peer.
#[derive(Debug, Clone)]
pub struct GrpcFollowerClient {
    channels: HashMap<String, Channel>,
}

impl GrpcFollowerClient {
    /// Build a client for the given peer set. No I/O happens here;
    /// channels connect on first use.
    pub fn new(peers: &[OperatorEndpoint], config: &GrpcConfig) -> Result<Self, RpcError> {
        let mut channels = HashMap::with_capacity(peers.len());
        for peer in peers {
            let endpoint = Endpoint::from_shared(peer.address.clone())
                .map_err(|e| RpcError::InvalidEndpoint {
                    url: peer.address.clone(),
                    reason: e.to_string(),
                })?
                .connect_timeout(config.connect_timeout)
                .timeout(config.request_timeout);
            channels.insert(peer.id.clone(), endpoint.connect_lazy());
        }
        Ok(Self { channels })
    }

    fn client(&self, operator_id: &str) -> Result<SparkInternalServiceClient<Channel>, RpcError> {
        self.channels
            .get(operator_id)
            .cloned()
            .map(SparkInternalServiceClient::new)
            .ok_or_else(|| RpcError::UnknownOperator(operator_id.to_owned()))
    }
}

impl FollowerClient for GrpcFollowerClient {
    async fn initiate_transfer(
        &self,
        operator_id: &str,
        request: internal::InitiateTransferInternal,
    ) -> Result<(), RpcError> {
        self.client(operator_id)?
            .initiate_transfer(request)
            .await
            .map(|_| ())
            .map_err(RpcError::from_status)
    }

    async fn initiate_cooperative_exit(
        &self,
        operator_id: &str,
        request: internal::InitiateCooperativeExitInternal,
    ) -> Result<(), RpcError> {
        self.client(operator_id)?
            .initiate_cooperative_exit(request)
            .await
            .map(|_| ())
            .map_err(RpcError::from_status)
    }

    async fn rollback_transfer(
        &self,
        operator_id: &str,
        request: internal::RollbackTransferInternal,
    ) -> Result<(), RpcError> {
        self.client(operator_id)?
            .rollback_transfer(request)
            .await
            .map(|_| ())
            .map_err(RpcError::from_status)
    }

    async fn apply_tweaks(
        &self,
        operator_id: &str,
        request: internal::ApplyTweaksInternal,
    ) -> Result<(), RpcError> {
        self.client(operator_id)?
            .apply_tweaks(request)
            .await
            .map(|_| ())
            .map_err(RpcError::from_status)
    }

    async fn settle_claim(
        &self,
        operator_id: &str,
        request: internal::SettleClaimInternal,
    ) -> Result<(), RpcError> {
        self.client(operator_id)?
            .settle_claim(request)
            .await
            .map(|_| ())
            .map_err(RpcError::from_status)
    }

    async fn frost_commit(
        &self,
        operator_id: &str,
        request: internal::FrostCommitRequest,
    ) -> Result<internal::FrostCommitResponse, RpcError> {
        self.client(operator_id)?
            .frost_commit(request)
            .await
            .map(|r| r.into_inner())
            .map_err(RpcError::from_status)
    }

    async fn frost_sign(
        &self,
        operator_id: &str,
        request: internal::FrostSignRequest,
    ) -> Result<internal::FrostSignResponse, RpcError> {
        self.client(operator_id)?
            .frost_sign(request)
            .await
            .map(|r| r.into_inner())
            .map_err(RpcError::from_status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_operator_is_rejected_without_io() {
        let client = GrpcFollowerClient::new(
            &[OperatorEndpoint {
                id: "1".into(),
                address: "http://127.0.0.1:8536".into(),
            }],
            &GrpcConfig::default(),
        )
        .unwrap();

        assert!(client.client("1").is_ok());
        assert!(matches!(
            client.client("9"),
            Err(RpcError::UnknownOperator(_))
        ));
    }

    #[test]
    fn invalid_endpoint_is_rejected_at_construction() {
        let result = GrpcFollowerClient::new(
            &[OperatorEndpoint {
                id: "1".into(),
                address: "not a url".into(),
            }],
            &GrpcConfig::default(),
        );
        assert!(matches!(result, Err(RpcError::InvalidEndpoint { .. })));
    }
}
