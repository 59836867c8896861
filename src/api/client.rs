//! Bearer-authenticated REST client
//!
//! [`RestClient`] reads the access token from the shared
//! [`CredentialStore`](crate::session::CredentialStore) on every call, so a
//! refresh is visible to the very next request without rebuilding the
//! client. Retrying after a 401 is left to the caller; see
//! [`ChatClient`](crate::client::ChatClient).

use bytes::Bytes;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::envelope::{Envelope, EnvelopeError};
use crate::api::types::{
    AuthPayload, Conversation, DeviceAuthRequest, FollowUpQuestionsRequest, Message,
    NewConversation, NewMessage, PhoneAuthRequest, QuestionsPayload, RatingRequest,
    RefreshRequest, StarterQuestionsRequest, TranscriptionPayload, User, UserUpdate,
};
use crate::api::ApiError;
use crate::collaborators::AudioTranscriber;
use crate::error::{AgrichatError, DataError, Result};
use crate::session::{AuthApi, Credentials, SessionContext};

type ApiResult<T> = std::result::Result<T, ApiError>;

/// HTTP client for the assistant backend.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use agrichat::api::RestClient;
/// use agrichat::collaborators::{StaticDeviceIdentity, StaticLocale};
/// use agrichat::config::Config;
/// use agrichat::session::credentials::{CredentialStore, MemoryPersistence};
/// use agrichat::session::SessionContext;
///
/// # async fn example() -> agrichat::error::Result<()> {
/// let context = SessionContext::new(
///     Config::default(),
///     Arc::new(CredentialStore::new(Arc::new(MemoryPersistence::default()))),
///     Arc::new(StaticDeviceIdentity("device-1".to_string())),
///     Arc::new(StaticLocale::new("en")),
/// );
/// let client = RestClient::new(context)?;
/// let conversations = client.list_conversations().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    context: SessionContext,
}

impl RestClient {
    /// Build a client for `context.config.server.api_base`.
    ///
    /// # Errors
    ///
    /// Returns [`AgrichatError::Http`] if the TLS backend cannot be
    /// initialised.
    pub fn new(context: SessionContext) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(context.config.server.request_timeout())
            .user_agent(concat!("agrichat/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(AgrichatError::Http)?;
        let base = context.config.server.api_base.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base,
            context,
        })
    }

    /// The session context this client authenticates with.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Start a request, attaching the current bearer token if one is set.
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.url(path))
            .header("Accept-Language", self.context.locale.current_language_code());
        if let Some(token) = self.context.credentials.access_token() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> ApiResult<T> {
        let response = builder.send().await?;
        let envelope: Envelope<T> = decode_envelope(response).await?;
        envelope.into_result().map_err(map_envelope_error)
    }

    async fn send_unit(&self, builder: RequestBuilder) -> ApiResult<()> {
        let response = builder.send().await?;
        let envelope: Envelope<serde_json::Value> = decode_envelope(response).await?;
        envelope.into_unit().map_err(map_envelope_error)
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ApiResult<T> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    // -----------------------------------------------------------------------
    // Auth
    // -----------------------------------------------------------------------

    /// `POST /auth/device`
    pub async fn auth_device(&self, device_id: &str) -> ApiResult<AuthPayload> {
        let body = DeviceAuthRequest {
            device_id: device_id.to_string(),
        };
        self.post_json("auth/device", &body).await
    }

    /// `POST /auth/phone/login`
    pub async fn auth_phone_login(&self, phone: &str, password: &str) -> ApiResult<AuthPayload> {
        let body = PhoneAuthRequest {
            phone: phone.to_string(),
            password: password.to_string(),
            name: None,
            device_id: None,
        };
        self.post_json("auth/phone/login", &body).await
    }

    /// `POST /auth/phone/register`
    pub async fn auth_phone_register(
        &self,
        phone: &str,
        password: &str,
        name: Option<&str>,
    ) -> ApiResult<AuthPayload> {
        let body = PhoneAuthRequest {
            phone: phone.to_string(),
            password: password.to_string(),
            name: name.map(str::to_string),
            device_id: None,
        };
        self.post_json("auth/phone/register", &body).await
    }

    /// `POST /auth/refresh`
    pub async fn auth_refresh(&self, refresh_token: &str) -> ApiResult<AuthPayload> {
        let body = RefreshRequest {
            refresh_token: refresh_token.to_string(),
        };
        // The refresh token is the credential; a stale bearer must not be sent.
        let builder = self
            .http
            .post(self.url("auth/refresh"))
            .json(&body);
        self.send(builder).await
    }

    // -----------------------------------------------------------------------
    // User
    // -----------------------------------------------------------------------

    /// `GET /user`
    pub async fn get_user(&self) -> ApiResult<User> {
        self.send(self.request(Method::GET, "user")).await
    }

    /// `PATCH /user`
    pub async fn update_user(&self, update: &UserUpdate) -> ApiResult<User> {
        self.send(self.request(Method::PATCH, "user").json(update))
            .await
    }

    // -----------------------------------------------------------------------
    // Conversations and messages
    // -----------------------------------------------------------------------

    /// `GET /conversations`
    pub async fn list_conversations(&self) -> ApiResult<Vec<Conversation>> {
        self.send(self.request(Method::GET, "conversations")).await
    }

    /// `GET /conversations/{id}`
    pub async fn get_conversation(&self, id: &str) -> ApiResult<Conversation> {
        self.send(self.request(Method::GET, &format!("conversations/{}", id)))
            .await
    }

    /// `POST /conversations`
    pub async fn create_conversation(&self, new: &NewConversation) -> ApiResult<Conversation> {
        self.post_json("conversations", new).await
    }

    /// `DELETE /conversations/{id}`
    pub async fn delete_conversation(&self, id: &str) -> ApiResult<()> {
        self.send_unit(self.request(Method::DELETE, &format!("conversations/{}", id)))
            .await
    }

    /// `GET /conversations/{id}/messages`
    pub async fn list_messages(&self, conversation_id: &str) -> ApiResult<Vec<Message>> {
        self.send(self.request(
            Method::GET,
            &format!("conversations/{}/messages", conversation_id),
        ))
        .await
    }

    /// `POST /messages`
    pub async fn send_message(&self, new: &NewMessage) -> ApiResult<Message> {
        self.post_json("messages", new).await
    }

    /// `POST /messages/{id}/rating`
    pub async fn rate_message(&self, message_id: &str, rating: u8) -> ApiResult<()> {
        let builder = self
            .request(Method::POST, &format!("messages/{}/rating", message_id))
            .json(&RatingRequest { rating });
        self.send_unit(builder).await
    }

    // -----------------------------------------------------------------------
    // Suggestions and transcription
    // -----------------------------------------------------------------------

    /// `POST /starter-questions` in the active language.
    pub async fn starter_questions(&self) -> ApiResult<Vec<String>> {
        let body = StarterQuestionsRequest {
            language: self.context.locale.current_language_code(),
        };
        let payload: QuestionsPayload = self.post_json("starter-questions", &body).await?;
        Ok(payload.questions)
    }

    /// `POST /follow-up-questions` in the active language.
    pub async fn follow_up_questions(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> ApiResult<Vec<String>> {
        let body = FollowUpQuestionsRequest {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            language: self.context.locale.current_language_code(),
        };
        let payload: QuestionsPayload = self.post_json("follow-up-questions", &body).await?;
        Ok(payload.questions)
    }

    /// `POST /transcribe` as multipart form data.
    pub async fn transcribe_audio(
        &self,
        audio: Bytes,
        mime_type: &str,
        language: &str,
    ) -> ApiResult<String> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("audio")
            .mime_str(mime_type)
            .map_err(|e| ApiError::Invalid(format!("invalid audio mime type: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .part("audio", part)
            .text("language", language.to_string());
        let payload: TranscriptionPayload = self
            .send(self.request(Method::POST, "transcribe").multipart(form))
            .await?;
        Ok(payload.text)
    }
}

/// Map the HTTP status, then decode the envelope body.
async fn decode_envelope<T: DeserializeOwned>(response: Response) -> ApiResult<Envelope<T>> {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED => return Err(ApiError::Unauthorized),
        StatusCode::NOT_FOUND => return Err(DataError::NotFound.into()),
        StatusCode::CONFLICT => return Err(DataError::Conflict.into()),
        _ => {}
    }

    let body = response.bytes().await?;
    if !status.is_success() {
        let message = serde_json::from_slice::<Envelope<serde_json::Value>>(&body)
            .ok()
            .and_then(|env| env.message.or(env.error))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        tracing::warn!(status = status.as_u16(), "REST call failed: {}", message);
        return Err(ApiError::Server {
            status: status.as_u16(),
            message,
        });
    }

    serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))
}

/// An envelope rejected with a 2xx status; interpret its error code.
fn map_envelope_error(err: EnvelopeError) -> ApiError {
    match &err {
        EnvelopeError::Rejected { error: Some(code), .. } => {
            match code.to_ascii_uppercase().as_str() {
                "UNAUTHORIZED" => ApiError::Unauthorized,
                "NOT_FOUND" => DataError::NotFound.into(),
                "CONFLICT" => DataError::Conflict.into(),
                _ => ApiError::Server {
                    status: 200,
                    message: err.description(),
                },
            }
        }
        EnvelopeError::Rejected { .. } => ApiError::Server {
            status: 200,
            message: err.description(),
        },
        EnvelopeError::MissingData => ApiError::Decode(err.description()),
    }
}

#[async_trait::async_trait]
impl AuthApi for RestClient {
    async fn login(&self, credentials: &Credentials, device_id: Option<&str>) -> ApiResult<AuthPayload> {
        match credentials {
            Credentials::Device => {
                let device_id = device_id.ok_or_else(|| {
                    ApiError::Network("device identifier unavailable".to_string())
                })?;
                self.auth_device(device_id).await
            }
            Credentials::PhoneLogin { phone, password } => {
                self.auth_phone_login(phone, password).await
            }
            Credentials::PhoneRegister {
                phone,
                password,
                name,
            } => {
                self.auth_phone_register(phone, password, name.as_deref())
                    .await
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> ApiResult<AuthPayload> {
        self.auth_refresh(refresh_token).await
    }
}

#[async_trait::async_trait]
impl AudioTranscriber for RestClient {
    async fn transcribe(&self, audio: Bytes, mime_type: &str, language: &str) -> ApiResult<String> {
        self.transcribe_audio(audio, mime_type, language).await
    }
}
