use std::fmt;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::deposit::provider::ProviderError;
use crate::store::StoreError;

pub type Result<T, E = CommerceError> = std::result::Result<T, E>;

/// Stable, caller-facing classification of a [`CommerceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    LimitReached,
    Expired,
    InsufficientFunds,
    Forbidden,
    ExternalService,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::LimitReached => "limit_reached",
            ErrorKind::Expired => "expired",
            ErrorKind::InsufficientFunds => "insufficient_funds",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::ExternalService => "external_service",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Reasons a coupon cannot be applied to a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponError {
    #[error("coupon {code} does not exist")]
    NotFound { code: String },
    #[error("coupon {code} is no longer active")]
    Inactive { code: String },
    #[error("coupon {code} has expired")]
    Expired { code: String },
    #[error("coupon {code} does not apply to this course")]
    ScopeMismatch { code: String },
    #[error("coupon {code} has reached its usage limit")]
    LimitReached { code: String },
    #[error("coupon {code} was already redeemed by this account")]
    AlreadyRedeemed { code: String },
}

impl CouponError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CouponError::NotFound { .. } => ErrorKind::NotFound,
            CouponError::Inactive { .. } | CouponError::Expired { .. } => ErrorKind::Expired,
            CouponError::ScopeMismatch { .. } => ErrorKind::Validation,
            CouponError::LimitReached { .. } => ErrorKind::LimitReached,
            CouponError::AlreadyRedeemed { .. } => ErrorKind::Conflict,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommerceError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: Decimal,
        available: Decimal,
    },
    #[error(transparent)]
    Coupon(#[from] CouponError),
    #[error("payment provider error: {0}")]
    ExternalService(#[from] ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl CommerceError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        CommerceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CommerceError::Validation(_) => ErrorKind::Validation,
            CommerceError::NotFound { .. } => ErrorKind::NotFound,
            CommerceError::Conflict(_) => ErrorKind::Conflict,
            CommerceError::Forbidden(_) => ErrorKind::Forbidden,
            CommerceError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            CommerceError::Coupon(e) => e.kind(),
            CommerceError::ExternalService(_) => ErrorKind::ExternalService,
            CommerceError::Store(StoreError::UniqueViolation { .. }) => ErrorKind::Conflict,
            CommerceError::Store(_) => ErrorKind::Internal,
        }
    }
}
