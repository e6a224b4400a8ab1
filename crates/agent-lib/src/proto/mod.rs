//! CRI runtime service messages and client
//!
//! Hand-written prost/tonic definitions for the subset of
//! `k8s.io/cri-api` `runtime.v1` the agent calls. Field tags match the
//! upstream api.proto.

pub mod runtime {
    pub mod v1 {
        use prost::Message;

        #[derive(Clone, PartialEq, Message)]
        pub struct StopContainerRequest {
            #[prost(string, tag = "1")]
            pub container_id: String,
            /// Seconds to wait before the runtime force-kills the container
            #[prost(int64, tag = "2")]
            pub timeout: i64,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct StopContainerResponse {}

        #[derive(Clone, PartialEq, Message)]
        pub struct VersionRequest {
            #[prost(string, tag = "1")]
            pub version: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct VersionResponse {
            #[prost(string, tag = "1")]
            pub version: String,
            #[prost(string, tag = "2")]
            pub runtime_name: String,
            #[prost(string, tag = "3")]
            pub runtime_version: String,
            #[prost(string, tag = "4")]
            pub runtime_api_version: String,
        }

        pub mod runtime_service_client {
            use super::*;
            use tonic::codegen::*;
            use tonic::transport::Uri;

            #[derive(Debug, Clone)]
            pub struct RuntimeServiceClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl RuntimeServiceClient<tonic::transport::Channel> {
                pub fn new(channel: tonic::transport::Channel) -> Self {
                    let inner = tonic::client::Grpc::new(channel);
                    Self { inner }
                }
            }

            impl<T> RuntimeServiceClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                pub fn with_origin(inner: T, origin: Uri) -> Self {
                    let inner = tonic::client::Grpc::with_origin(inner, origin);
                    Self { inner }
                }

                async fn ready(&mut self) -> Result<(), tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })
                }

                pub async fn version(
                    &mut self,
                    request: impl tonic::IntoRequest<VersionRequest>,
                ) -> Result<tonic::Response<VersionResponse>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path =
                        http::uri::PathAndQuery::from_static("/runtime.v1.RuntimeService/Version");
                    self.inner.unary(request.into_request(), path, codec).await
                }

                pub async fn stop_container(
                    &mut self,
                    request: impl tonic::IntoRequest<StopContainerRequest>,
                ) -> Result<tonic::Response<StopContainerResponse>, tonic::Status> {
                    self.ready().await?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static(
                        "/runtime.v1.RuntimeService/StopContainer",
                    );
                    self.inner.unary(request.into_request(), path, codec).await
                }
            }
        }
    }
}

pub use runtime::v1::runtime_service_client::RuntimeServiceClient;
pub use runtime::v1::*;
