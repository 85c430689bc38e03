//! Wire messages and client for `talkgate.executor.v1.TalkService`.
//!
//! ```text
//! service TalkService {
//!   rpc Talk(stream TalkRequest) returns (stream TalkResponse);
//! }
//! ```
//!
//! Messages are declared with prost derives directly so the crate builds without protoc.

use std::collections::HashMap;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, prost::Message)]
pub struct TalkRequest {
    #[prost(oneof = "talk_request::Request", tags = "1, 2, 3")]
    pub request: Option<talk_request::Request>,
}

pub mod talk_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Configuration(super::Configuration),
        #[prost(message, tag = "2")]
        Message(super::UserMessage),
        #[prost(message, tag = "3")]
        Interruption(super::Interruption),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Configuration {
    #[prost(uint64, tag = "1")]
    pub assistant_id: u64,
    #[prost(uint64, tag = "2")]
    pub conversation_id: u64,
    #[prost(uint64, tag = "3")]
    pub provider_model_id: u64,
    #[prost(string, tag = "4")]
    pub channel: String,
    #[prost(map = "string, string", tag = "5")]
    pub args: HashMap<String, String>,
    #[prost(map = "string, string", tag = "6")]
    pub options: HashMap<String, String>,
    #[prost(message, repeated, tag = "7")]
    pub history: Vec<HistoryEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HistoryEntry {
    #[prost(string, tag = "1")]
    pub role: String,
    #[prost(string, tag = "2")]
    pub content: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UserMessage {
    #[prost(string, tag = "1")]
    pub context_id: String,
    #[prost(string, tag = "2")]
    pub text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Interruption {
    #[prost(string, tag = "1")]
    pub context_id: String,
    /// `vad` or `word`.
    #[prost(string, tag = "2")]
    pub source: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TalkResponse {
    #[prost(oneof = "talk_response::Response", tags = "1, 2, 3, 4, 5, 6")]
    pub response: Option<talk_response::Response>,
}

pub mod talk_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Delta(super::TextChunk),
        #[prost(message, tag = "2")]
        Done(super::TextChunk),
        #[prost(message, tag = "3")]
        Interruption(super::Interruption),
        #[prost(message, tag = "4")]
        Directive(super::DirectiveMessage),
        #[prost(message, tag = "5")]
        Error(super::ErrorMessage),
        #[prost(message, tag = "6")]
        Metrics(super::MetricBatch),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TextChunk {
    #[prost(string, tag = "1")]
    pub context_id: String,
    #[prost(string, tag = "2")]
    pub text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DirectiveMessage {
    #[prost(string, tag = "1")]
    pub context_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(map = "string, string", tag = "3")]
    pub args: HashMap<String, String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ErrorMessage {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricBatch {
    #[prost(string, tag = "1")]
    pub context_id: String,
    #[prost(message, repeated, tag = "2")]
    pub metrics: Vec<MetricEntry>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetricEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
    #[prost(string, tag = "3")]
    pub description: String,
}

const TALK_PATH: &str = "/talkgate.executor.v1.TalkService/Talk";

#[derive(Debug, Clone)]
pub struct TalkServiceClient {
    inner: tonic::client::Grpc<Channel>,
}

impl TalkServiceClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn talk(
        &mut self,
        request: impl tonic::IntoStreamingRequest<Message = TalkRequest>,
    ) -> Result<tonic::Response<tonic::codec::Streaming<TalkResponse>>, tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("Service was not ready: {e}")))?;
        let codec: tonic::codec::ProstCodec<TalkRequest, TalkResponse> =
            tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(TALK_PATH);
        self.inner
            .streaming(request.into_streaming_request(), path, codec)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn response_oneof_survives_the_wire() {
        let response = TalkResponse {
            response: Some(talk_response::Response::Done(TextChunk {
                context_id: "c1".into(),
                text: "all of it".into(),
            })),
        };
        let bytes = response.encode_to_vec();
        let decoded = TalkResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, response);
    }
}
