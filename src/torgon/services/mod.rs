pub mod backend;
pub mod chat_service;
pub mod frame_parser;
pub mod http_backend;
pub mod sse_decoder;
pub mod stream_service;
pub mod stream_transport;
pub mod title_generator;

pub use backend::{
    ChatBackend, CompletionMessage, CompletionRequest, CompletionResponse, FrameStream,
    SendMessageRequest, SseFrame, TransportError, WireAttachment, WireMessage,
};
pub use chat_service::{ChatError, ChatService, ChunkUpdate, SendOutcome, UserSend};
pub use frame_parser::{ParseTier, ParsedFrame, StreamPayload, parse_frame};
pub use http_backend::HttpChatBackend;
pub use sse_decoder::SseDecoder;
pub use stream_service::{ChunkSink, StreamService, StreamSessions, UiChunkCallback};
pub use stream_transport::{ChunkCallback, ConnectionState, DoneCallback, StreamTransport};
pub use title_generator::generate_title;
