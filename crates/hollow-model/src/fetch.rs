use std::sync::Arc;

/// What kind of request triggered an object fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCause {
    /// Cause not recorded.
    Unknown,
    /// A kernel-channel filesystem request.
    Fs,
    /// An administrative request.
    Admin,
    /// A background prefetch.
    Prefetch,
}

/// Per-request attribution carried alongside every object fetch.
///
/// Cheap to clone; the detail string is shared. Spawned load tasks keep a
/// clone so attribution survives the caller going away.
#[derive(Debug, Clone)]
pub struct FetchContext {
    cause: FetchCause,
    detail: Option<Arc<str>>,
}

impl FetchContext {
    pub fn new(cause: FetchCause) -> Self {
        FetchContext {
            cause,
            detail: None,
        }
    }

    pub fn with_detail(cause: FetchCause, detail: impl Into<Arc<str>>) -> Self {
        FetchContext {
            cause,
            detail: Some(detail.into()),
        }
    }

    pub fn unknown() -> Self {
        Self::new(FetchCause::Unknown)
    }

    pub fn fs() -> Self {
        Self::new(FetchCause::Fs)
    }

    pub fn cause(&self) -> FetchCause {
        self.cause
    }

    pub fn cause_detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        Self::unknown()
    }
}
