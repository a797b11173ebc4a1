use futures::StreamExt;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use tracing::{debug, warn};

use super::backend::{
    ChatBackend, CompletionRequest, CompletionResponse, FrameStream, SendMessageRequest,
    TransportError,
};
use super::sse_decoder::SseDecoder;
use crate::settings::models::ClientSettings;
use crate::torgon::models::Attachment;
use crate::torgon::repositories::BoxFuture;

const FILE_UPLOAD_PATH: &str = "/file/upload";
const FILE_DELETE_PATH: &str = "/file/delete";
const CONVERSATION_DELETE_PATH: &str = "/conversation/delete";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFileBody {
    file_id: String,
    conversation_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteConversationBody {
    conversation_id: String,
}

/// `ChatBackend` over plain HTTP: an event-stream GET for replies, JSON
/// POSTs for everything else.
#[derive(Clone)]
pub struct HttpChatBackend {
    client: Client,
    settings: ClientSettings,
}

impl HttpChatBackend {
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_client(Client::new(), settings)
    }

    pub fn with_client(client: Client, settings: ClientSettings) -> Self {
        Self { client, settings }
    }

    fn stream_url(&self) -> String {
        self.settings.endpoint(&self.settings.stream_path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status { status, body })
    }

    fn post_json<B: Serialize + Send + 'static>(
        &self,
        url: String,
        body: B,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let response = client.post(&url).json(&body).send().await?;
            Self::check(response).await?;
            Ok(())
        })
    }
}

impl ChatBackend for HttpChatBackend {
    fn open_stream(&self, thread_id: &str) -> BoxFuture<'static, Result<FrameStream, TransportError>> {
        let client = self.client.clone();
        let url = self.stream_url();
        let thread_id = thread_id.to_string();

        Box::pin(async move {
            debug!(url = %url, thread_id = %thread_id, "Opening event stream");
            let response = client
                .get(&url)
                .query(&[("thread_id", thread_id.as_str())])
                .header("Accept", "text/event-stream")
                .send()
                .await?;
            let response = Self::check(response).await?;

            let frames = async_stream::stream! {
                let mut bytes = response.bytes_stream();
                let mut decoder = SseDecoder::new();
                while let Some(chunk) = bytes.next().await {
                    match chunk {
                        Ok(chunk) => {
                            for frame in decoder.feed(&chunk) {
                                yield Ok(frame);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Event stream read failed");
                            yield Err(TransportError::Request(e));
                            return;
                        }
                    }
                }
                if let Some(frame) = decoder.finish() {
                    yield Ok(frame);
                }
            };

            Ok(frames.boxed())
        })
    }

    fn send_messages(&self, request: SendMessageRequest) -> BoxFuture<'static, Result<(), TransportError>> {
        let client = self.client.clone();
        let url = self.stream_url();

        Box::pin(async move {
            let response = client
                .post(&url)
                .query(&[("thread_id", request.thread_id.as_str())])
                .json(&request)
                .send()
                .await?;
            Self::check(response).await?;
            Ok(())
        })
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> BoxFuture<'static, Result<CompletionResponse, TransportError>> {
        let client = self.client.clone();
        let url = self.settings.endpoint(&self.settings.completion_path);

        Box::pin(async move {
            let response = client.post(&url).json(&request).send().await?;
            let response = Self::check(response).await?;
            Ok(response.json::<CompletionResponse>().await?)
        })
    }

    fn upload_file(
        &self,
        conversation_id: &str,
        attachment: &Attachment,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        let client = self.client.clone();
        let url = self.settings.endpoint(FILE_UPLOAD_PATH);
        let conversation_id = conversation_id.to_string();
        let file_name = attachment.file_name();
        let mime_type = attachment.mime_type.clone();
        let binary = attachment.binary.clone();

        Box::pin(async move {
            let part = Part::bytes(binary).file_name(file_name).mime_str(&mime_type)?;
            let form = Form::new()
                .part("file", part)
                .text("conversationId", conversation_id);
            let response = client.post(&url).multipart(form).send().await?;
            Self::check(response).await?;
            Ok(())
        })
    }

    fn delete_file(
        &self,
        conversation_id: &str,
        file_id: &str,
    ) -> BoxFuture<'static, Result<(), TransportError>> {
        self.post_json(
            self.settings.endpoint(FILE_DELETE_PATH),
            DeleteFileBody {
                file_id: file_id.to_string(),
                conversation_id: conversation_id.to_string(),
            },
        )
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, Result<(), TransportError>> {
        self.post_json(
            self.settings.endpoint(CONVERSATION_DELETE_PATH),
            DeleteConversationBody {
                conversation_id: conversation_id.to_string(),
            },
        )
    }
}
