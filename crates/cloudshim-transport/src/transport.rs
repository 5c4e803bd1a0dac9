use crate::context::CallContext;
use crate::error::{Result, TransportError};
use crate::headers::{prepare_headers, set_bearer};
use crate::http::{HttpResponse, HttpTransport, OutgoingRequest, ReqwestTransport};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::rewrite::{RequestRewriter, Rewrite, DEFAULT_PROJECT_ID};
use crate::sender::ResilientSender;
use crate::tool_names::ToolNamePrefixer;
use crate::unwrap::{unwrap_body, unwrap_stream};
use async_trait::async_trait;
use cloudshim_auth::CredentialManager;
use cloudshim_config::{TransportSettings, DEFAULT_ENDPOINTS};
use reqwest::header::CONTENT_LENGTH;
use std::sync::Arc;
use tracing::{debug, info};

/// The adapter handed to SDK callers.
///
/// Generate requests are rewritten into backend envelopes, sent with retry
/// and endpoint fallback, and their responses unwrapped so the caller sees a
/// native reply. Every other request goes straight to the inner transport.
pub struct CloudTransport {
    sender: ResilientSender,
    rewriter: RequestRewriter,
    credentials: Option<Arc<CredentialManager>>,
    project_id: Option<String>,
}

impl CloudTransport {
    pub fn builder() -> CloudTransportBuilder {
        CloudTransportBuilder::default()
    }

    /// Transport over `reqwest` configured from settings
    pub fn from_settings(
        settings: &TransportSettings,
        credentials: Option<Arc<CredentialManager>>,
    ) -> Result<Self> {
        let mut builder = Self::builder()
            .inner(Arc::new(ReqwestTransport::from_settings(settings)?))
            .endpoints(settings.endpoints.clone())
            .policy(RetryPolicy::from(&settings.retry))
            .tool_prefix(settings.tool_prefix.clone());
        if let Some(project_id) = &settings.project_id {
            builder = builder.project_id(project_id.clone());
        }
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }
        builder.build()
    }

    pub async fn send_with_context(
        &self,
        request: OutgoingRequest,
        ctx: &mut CallContext,
    ) -> Result<HttpResponse> {
        let project = self.resolve_project().await;
        let rewrite = self
            .rewriter
            .wrap(&request.body, &request.path, &project, ctx.request_id());

        let Rewrite::Wrapped {
            body,
            path,
            query,
            model,
            stream,
            reasoning_tier,
        } = rewrite
        else {
            debug!(path = %request.path, "passing request through");
            return self.sender.inner().send(request).await;
        };

        let mut outgoing = OutgoingRequest {
            method: request.method,
            base_url: request.base_url,
            path,
            query,
            headers: request.headers,
            body,
        };
        prepare_headers(&mut outgoing.headers, reasoning_tier);
        self.attach_token(&mut outgoing, ctx).await?;

        info!(
            request_id = ctx.request_id(),
            model = %model,
            stream,
            "sending wrapped request"
        );
        let response = self.sender.send(outgoing, ctx).await?;
        self.unwrap_response(response, stream).await
    }

    async fn resolve_project(&self) -> String {
        if let Some(project_id) = &self.project_id {
            return project_id.clone();
        }
        if let Some(credentials) = &self.credentials {
            if let Some(project_id) = credentials
                .stored_state()
                .await
                .and_then(|state| state.project_id)
            {
                return project_id;
            }
        }
        DEFAULT_PROJECT_ID.to_string()
    }

    /// Stored token first, the caller's bearer otherwise; refreshed up front
    /// when it is already stale.
    async fn attach_token(&self, request: &mut OutgoingRequest, ctx: &mut CallContext) -> Result<()> {
        let Some(credentials) = &self.credentials else {
            return Ok(());
        };

        if let Some(token) = credentials.current_token().await {
            set_bearer(&mut request.headers, &token)?;
        }

        if ctx.refresh_attempted() || !credentials.should_refresh(&request.headers).await {
            return Ok(());
        }

        ctx.mark_refresh_attempted();
        let stale = CredentialManager::extract_bearer(&request.headers);
        if let Some(token) = credentials.refresh(stale.as_deref()).await {
            debug!(request_id = ctx.request_id(), "refreshed stale token before sending");
            set_bearer(&mut request.headers, &token)?;
        }
        Ok(())
    }

    async fn unwrap_response(&self, response: HttpResponse, stream: bool) -> Result<HttpResponse> {
        let prefixer = self.rewriter.prefixer();
        let (status, mut headers, body) = response.into_parts();
        headers.remove(CONTENT_LENGTH);

        if stream && status.is_success() {
            let unwrapped = unwrap_stream(body.into_stream(), Some(prefixer.clone()));
            return Ok(HttpResponse::streaming(status, headers, unwrapped));
        }

        let mut buffered = HttpResponse::new(status, headers, body);
        let bytes = buffered.read().await?;
        let (status, headers, _) = buffered.into_parts();
        Ok(HttpResponse::buffered(
            status,
            headers,
            unwrap_body(&bytes, Some(prefixer)),
        ))
    }
}

#[async_trait]
impl HttpTransport for CloudTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<HttpResponse> {
        let mut ctx = CallContext::new();
        self.send_with_context(request, &mut ctx).await
    }
}

#[derive(Default)]
pub struct CloudTransportBuilder {
    inner: Option<Arc<dyn HttpTransport>>,
    endpoints: Option<Vec<String>>,
    policy: Option<RetryPolicy>,
    credentials: Option<Arc<CredentialManager>>,
    project_id: Option<String>,
    tool_prefix: Option<String>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl CloudTransportBuilder {
    pub fn inner(mut self, inner: Arc<dyn HttpTransport>) -> Self {
        self.inner = Some(inner);
        self
    }

    pub fn endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn credentials(mut self, credentials: Arc<CredentialManager>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn tool_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tool_prefix = Some(prefix.into());
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub fn build(self) -> Result<CloudTransport> {
        let inner = self.inner.ok_or_else(|| {
            TransportError::Configuration("an inner transport is required".to_string())
        })?;
        let endpoints = self
            .endpoints
            .unwrap_or_else(|| DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect());
        let prefixer = match self.tool_prefix {
            Some(prefix) => ToolNamePrefixer::new(prefix)?,
            None => ToolNamePrefixer::default(),
        };

        let mut sender = ResilientSender::new(inner, endpoints)?
            .with_policy(self.policy.unwrap_or_default())
            .with_sleeper(self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)));
        if let Some(credentials) = &self.credentials {
            sender = sender.with_credentials(credentials.clone());
        }

        Ok(CloudTransport {
            sender,
            rewriter: RequestRewriter::new(prefixer),
            credentials: self.credentials,
            project_id: self.project_id,
        })
    }
}
