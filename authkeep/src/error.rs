//! Errors surfaced by silent token acquisition

use std::{error, fmt};

use authkeep_cache::{lock::LockTimeout, CacheError};
use thiserror::Error;

type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// Why silent acquisition failed
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The request or its environment was invalid; retrying will not help
    #[error("{kind}")]
    Client {
        /// What was wrong
        kind: ClientErrorKind,
        /// The underlying error, if any
        #[source]
        source: Option<BoxError>,
    },
    /// The user must interact with the identity provider
    #[error("user interaction required: {reason}")]
    UiRequired {
        /// Why interaction is required
        reason: UiRequiredReason,
        /// The service error that prompted this, if any
        #[source]
        source: Option<ServiceError>,
    },
    /// The identity provider or broker reported an error
    #[error(transparent)]
    Service(ServiceError),
    /// The cache lock could not be acquired in time
    #[error(transparent)]
    LockTimeout(LockTimeout),
    /// The operation was cancelled
    #[error("operation was cancelled")]
    Cancelled,
}

impl AcquireError {
    /// A client error of the given kind with no further detail
    pub fn client(kind: ClientErrorKind) -> Self {
        AcquireError::Client { kind, source: None }
    }

    /// A client error caused by `source`
    pub fn client_with_source(kind: ClientErrorKind, source: impl Into<BoxError>) -> Self {
        AcquireError::Client {
            kind,
            source: Some(source.into()),
        }
    }

    /// A UI required error with no underlying service error
    pub fn ui_required(reason: UiRequiredReason) -> Self {
        AcquireError::UiRequired {
            reason,
            source: None,
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            AcquireError::Service(err) => err.retryable,
            AcquireError::LockTimeout(_) => true,
            _ => false,
        }
    }

    /// The service error behind this error, if any
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            AcquireError::Service(err) => Some(err),
            AcquireError::UiRequired { source, .. } => source.as_ref(),
            _ => None,
        }
    }

    /// Reclassifies service errors that can only be resolved interactively
    ///
    /// `invalid_grant`, `interaction_required`, `consent_required` and
    /// `login_required` become [`UiRequired`][AcquireError::UiRequired].
    pub fn into_ui_required_if_interactive(self) -> Self {
        match self {
            AcquireError::Service(err) => match err.interaction_reason() {
                Some(reason) => AcquireError::UiRequired {
                    reason,
                    source: Some(err),
                },
                None => AcquireError::Service(err),
            },
            other => other,
        }
    }
}

impl From<ServiceError> for AcquireError {
    fn from(err: ServiceError) -> Self {
        AcquireError::Service(err)
    }
}

impl From<CacheError> for AcquireError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::LockTimeout(timeout) => AcquireError::LockTimeout(timeout),
            CacheError::UnidentifiedAccount => {
                AcquireError::client_with_source(ClientErrorKind::InvalidResponse, err)
            }
            other => AcquireError::client_with_source(ClientErrorKind::CacheUnavailable, other),
        }
    }
}

/// The kind of a client error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientErrorKind {
    /// A request parameter was missing or malformed
    InvalidRequest,
    /// An extra query parameter was given twice or collides with one the
    /// library sets itself
    DuplicateQueryParameter,
    /// A response did not belong to the request that produced it
    StateMismatch,
    /// The configuration is unusable
    InvalidConfiguration,
    /// The identity provider or broker returned a response that could not
    /// be understood
    InvalidResponse,
    /// The token cache could not be read or written
    CacheUnavailable,
}

impl fmt::Display for ClientErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientErrorKind::InvalidRequest => "invalid request",
            ClientErrorKind::DuplicateQueryParameter => "duplicate query parameter",
            ClientErrorKind::StateMismatch => "response does not match the request",
            ClientErrorKind::InvalidConfiguration => "invalid configuration",
            ClientErrorKind::InvalidResponse => "unreadable response from the authority",
            ClientErrorKind::CacheUnavailable => "token cache unavailable",
        })
    }
}

/// Why interaction is required
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UiRequiredReason {
    /// No account or login hint was given
    UserNull,
    /// No cached account matches the login hint
    NoAccountForLoginHint,
    /// Several cached accounts match the login hint
    MultipleAccountsForLoginHint,
    /// The broker does not know the account
    NoAccountForId,
    /// No refresh token is cached for the account
    NoTokensFound,
    /// The broker could not satisfy the request silently
    BrokerCannotSatisfy,
    /// The identity provider requires the user to sign in again
    PromptNeverFailed,
    /// The account cannot be used without the user fixing it
    AccountUnusable,
}

/// Broad groupings of [`UiRequiredReason`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UiRequiredCategory {
    /// A silent attempt was made and refused
    PromptNeverFailed,
    /// There is no account to act for
    NoAccount,
    /// The account to act for is ambiguous
    MultipleAccounts,
    /// The account exists but is unusable
    AccountUnusable,
}

impl UiRequiredReason {
    /// The category of this reason
    pub fn category(self) -> UiRequiredCategory {
        match self {
            UiRequiredReason::UserNull
            | UiRequiredReason::NoAccountForLoginHint
            | UiRequiredReason::NoAccountForId
            | UiRequiredReason::NoTokensFound => UiRequiredCategory::NoAccount,
            UiRequiredReason::MultipleAccountsForLoginHint => UiRequiredCategory::MultipleAccounts,
            UiRequiredReason::BrokerCannotSatisfy | UiRequiredReason::PromptNeverFailed => {
                UiRequiredCategory::PromptNeverFailed
            }
            UiRequiredReason::AccountUnusable => UiRequiredCategory::AccountUnusable,
        }
    }
}

impl fmt::Display for UiRequiredReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UiRequiredReason::UserNull => "no account or login hint was provided",
            UiRequiredReason::NoAccountForLoginHint => "no cached account matches the login hint",
            UiRequiredReason::MultipleAccountsForLoginHint => {
                "multiple cached accounts match the login hint"
            }
            UiRequiredReason::NoAccountForId => "the broker does not know this account",
            UiRequiredReason::NoTokensFound => "no refresh token is cached for this account",
            UiRequiredReason::BrokerCannotSatisfy => "the broker cannot satisfy the request silently",
            UiRequiredReason::PromptNeverFailed => "the identity provider requires interaction",
            UiRequiredReason::AccountUnusable => "the account is unusable",
        })
    }
}

/// Sub-error codes that mark an account, rather than a session, as unusable
const ACCOUNT_UNUSABLE_SUB_ERRORS: [&str; 3] = ["bad_token", "token_expired", "user_password_expired"];

/// An error reported by the identity provider or the broker
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("service error `{code}`{}", describe(.description))]
pub struct ServiceError {
    /// The error code, such as `invalid_grant`
    pub code: String,
    /// A human-readable description
    pub description: Option<String>,
    /// A finer-grained code, such as `client_mismatch`
    pub sub_error: Option<String>,
    /// The HTTP status, when the error came over HTTP
    pub status: Option<u16>,
    /// Whether the same request may succeed later
    pub retryable: bool,
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(": {}", d))
        .unwrap_or_default()
}

impl ServiceError {
    /// A new service error
    pub fn new(code: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            description: None,
            sub_error: None,
            status: None,
            retryable,
        }
    }

    /// Sets the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the sub-error
    pub fn with_sub_error(mut self, sub_error: impl Into<String>) -> Self {
        self.sub_error = Some(sub_error.into());
        self
    }

    /// Sets the HTTP status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether this is an `invalid_grant` whose sub-error is exactly
    /// `client_mismatch`
    pub fn is_client_mismatch(&self) -> bool {
        self.code == "invalid_grant" && self.sub_error.as_deref() == Some("client_mismatch")
    }

    /// The interaction this error calls for, if it can only be resolved
    /// interactively
    pub fn interaction_reason(&self) -> Option<UiRequiredReason> {
        match self.code.as_str() {
            "invalid_grant" | "interaction_required" | "consent_required" | "login_required" => {
                let unusable = self
                    .sub_error
                    .as_deref()
                    .map_or(false, |s| ACCOUNT_UNUSABLE_SUB_ERRORS.contains(&s));
                Some(if unusable {
                    UiRequiredReason::AccountUnusable
                } else {
                    UiRequiredReason::PromptNeverFailed
                })
            }
            _ => None,
        }
    }
}
