//! Cloudshim Transport - protocol-translating HTTP transport
//!
//! `CloudTransport` implements [`HttpTransport`] so it can be injected
//! wherever an SDK expects a client. It rewrites Gemini-style generate
//! requests into the cloud code backend's envelope, keeps the OAuth token
//! fresh, retries with backoff and endpoint fallback, and unwraps buffered
//! and streamed responses on the way back.

pub mod context;
pub mod error;
pub mod headers;
pub mod http;
pub mod retry;
pub mod rewrite;
pub mod sender;
pub mod tool_names;
pub mod transport;
pub mod unwrap;

pub use context::CallContext;
pub use error::{Result, TransportError};
pub use headers::{prepare_headers, BetaFeatures, CLIENT_USER_AGENT};
pub use http::{ByteStream, HttpResponse, HttpTransport, OutgoingRequest, ReqwestTransport, ResponseBody};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use rewrite::{resolve_model, ModelRoute, RequestRewriter, Rewrite, Thinking, WrappedPayload};
pub use sender::{ResilientSender, RetryPlan};
pub use tool_names::{PrefixOutcome, ToolNamePrefixer, DEFAULT_TOOL_PREFIX};
pub use transport::{CloudTransport, CloudTransportBuilder};
pub use unwrap::{unwrap_body, unwrap_payload, unwrap_stream, Unwrapped};

pub use cloudshim_auth as auth;
