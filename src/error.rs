use serde_json::{json, Value};

/// Application error taxonomy. Variants map to stable codes and HTTP
/// statuses; stream and API layers decide the final wire shape.
#[derive(Debug)]
pub enum AppError {
    Validation {
        message: String,
        errors: Option<Value>,
    },
    Authorization(String),
    NotFound(String),
    Connection(String),
    Execution(String),
    Generation {
        message: String,
        status: Option<u16>,
    },
    Queue(String),
    UnhandledJobKind(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            errors: None,
        }
    }

    pub fn validation_with(message: impl Into<String>, errors: Value) -> Self {
        Self::Validation {
            message: message.into(),
            errors: Some(errors),
        }
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
            status: None,
        }
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue(message.into())
    }

    pub fn unhandled_job_kind(kind: impl Into<String>) -> Self {
        Self::UnhandledJobKind(kind.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Authorization(_) => "UNAUTHORIZED_ACCESS",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Execution(_) => "EXECUTION_ERROR",
            Self::Generation { .. } => "GENERATION_ERROR",
            Self::Queue(_) => "QUEUE_ERROR",
            Self::UnhandledJobKind(_) => "UNHANDLED_JOB_KIND",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::Authorization(_) => 403,
            Self::NotFound(_) => 404,
            Self::Connection(_) => 500,
            Self::Execution(_) => 500,
            Self::Generation { status, .. } => status.unwrap_or(502),
            Self::Queue(_) => 500,
            Self::UnhandledJobKind(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation { message, .. } | Self::Generation { message, .. } => message,
            Self::Authorization(message)
            | Self::NotFound(message)
            | Self::Connection(message)
            | Self::Execution(message)
            | Self::Queue(message) => message,
            Self::UnhandledJobKind(kind) => kind,
        }
    }

    pub fn to_payload(&self) -> Value {
        let mut payload = json!({
            "code": self.code(),
            "message": self.display_message(),
        });
        if let Self::Validation {
            errors: Some(errors),
            ..
        } = self
        {
            if let Value::Object(ref mut map) = payload {
                map.insert("errors".to_string(), errors.clone());
            }
        }
        payload
    }

    fn display_message(&self) -> String {
        match self {
            Self::UnhandledJobKind(kind) => format!("Unhandled job kind: {kind}"),
            other => other.message().to_string(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}

impl std::error::Error for AppError {}
