use std::sync::Arc;

use anyhow::Context;
use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        claims::Identity,
        dto::{AuthResponse, LoginRequest, PublicUser, RegisterRequest},
        jwt::JwtKeys,
        password::{hash_password, verify_password, HashCost},
        repo_types::User,
    },
    error::AppError,
    records::RecordStore,
    state::AppState,
};

const BAD_CREDENTIALS: &str = "Invalid email or password";

lazy_static! {
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

pub(crate) fn check_password_strength(password: &str) -> Result<(), AppError> {
    if password.chars().count() < 6 {
        return Err(AppError::Validation(
            "Password must be at least 6 characters long".into(),
        ));
    }
    let lower = password.chars().any(|c| c.is_ascii_lowercase());
    let upper = password.chars().any(|c| c.is_ascii_uppercase());
    let digit = password.chars().any(|c| c.is_ascii_digit());
    if !(lower && upper && digit) {
        return Err(AppError::Validation(
            "Password must contain at least one uppercase letter, one lowercase letter, and one number"
                .into(),
        ));
    }
    Ok(())
}

pub(crate) fn check_name(name: &str) -> Result<(), AppError> {
    let len = name.chars().count();
    if !(2..=50).contains(&len) {
        return Err(AppError::Validation(
            "Name must be between 2 and 50 characters".into(),
        ));
    }
    Ok(())
}

/// Registration, login and session verification over the user records.
#[derive(Clone)]
pub struct AuthService {
    records: Arc<RecordStore>,
    keys: JwtKeys,
    cost: HashCost,
}

impl FromRef<AppState> for AuthService {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

impl AuthService {
    pub fn new(records: Arc<RecordStore>, keys: JwtKeys, cost: HashCost) -> Self {
        Self {
            records,
            keys,
            cost,
        }
    }

    async fn check(&self, plain: &str, hash: &str) -> Result<bool, AppError> {
        let (plain, hash) = (plain.to_string(), hash.to_string());
        let ok = tokio::task::spawn_blocking(move || verify_password(&plain, &hash))
            .await
            .context("password verification task failed")??;
        Ok(ok)
    }

    /// Email uniqueness is check-then-create; two concurrent registrations
    /// for the same address can both succeed.
    #[instrument(skip(self, req))]
    pub async fn register(&self, req: RegisterRequest) -> Result<AuthResponse, AppError> {
        let email = normalize_email(&req.email);
        if !is_valid_email(&email) {
            warn!(%email, "invalid email");
            return Err(AppError::Validation(
                "Please provide a valid email address".into(),
            ));
        }
        check_password_strength(&req.password)?;
        let name = req.name.trim().to_string();
        check_name(&name)?;

        if User::find_by_email(&self.records, &email).await?.is_some() {
            warn!(%email, "email already registered");
            return Err(AppError::Conflict(
                "User with this email already exists".into(),
            ));
        }

        let cost = self.cost;
        let plain = req.password;
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&plain, cost))
            .await
            .context("password hashing task failed")??;

        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email,
            password_hash,
            name,
            created_at: now,
            last_login: Some(now),
        };
        User::create(&self.records, &user).await?;
        let token = self.keys.sign(&Identity::from(&user))?;

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(AuthResponse {
            user: PublicUser::from(&user),
            token,
        })
    }

    #[instrument(skip(self, req))]
    pub async fn login(&self, req: LoginRequest) -> Result<AuthResponse, AppError> {
        let email = normalize_email(&req.email);
        if !is_valid_email(&email) {
            return Err(AppError::Validation(
                "Please provide a valid email address".into(),
            ));
        }
        if req.password.is_empty() {
            return Err(AppError::Validation("Password is required".into()));
        }

        let Some(record) = User::find_by_email(&self.records, &email).await? else {
            warn!(%email, "login unknown email");
            return Err(AppError::Unauthorized(BAD_CREDENTIALS.into()));
        };
        if !self.check(&req.password, &record.value.password_hash).await? {
            warn!(user_id = %record.value.id, "login invalid password");
            return Err(AppError::Unauthorized(BAD_CREDENTIALS.into()));
        }

        let now = OffsetDateTime::now_utc();
        if let Err(e) = User::touch_last_login(&self.records, &record, now).await {
            warn!(user_id = %record.value.id, error = %e, "failed to update last login");
        }

        let mut user = record.value;
        user.last_login = Some(now);
        let token = self.keys.sign(&Identity::from(&user))?;

        info!(user_id = %user.id, "user logged in");
        Ok(AuthResponse {
            user: PublicUser::from(&user),
            token,
        })
    }

    /// Checks signature, expiry, issuer and audience. Does not touch storage.
    pub fn verify(&self, token: &str) -> Result<Identity, AppError> {
        match self.keys.verify(token) {
            Ok(claims) => Ok(Identity::from(claims)),
            Err(e) => {
                warn!(error = %e, "invalid or expired token");
                Err(AppError::Unauthorized("Invalid or expired token".into()))
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn profile(&self, user_id: Uuid) -> Result<PublicUser, AppError> {
        let record = User::find_by_id(&self.records, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))?;
        Ok(PublicUser::from(&record.value))
    }

    /// Re-checks the password of a signed-in user before destructive actions.
    #[instrument(skip(self, password))]
    pub async fn confirm_password(&self, user_id: Uuid, password: &str) -> Result<(), AppError> {
        if password.is_empty() {
            return Err(AppError::Validation(
                "Password confirmation required for account deletion".into(),
            ));
        }
        let record = User::find_by_id(&self.records, user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".into()))?;
        if !self.check(password, &record.value.password_hash).await? {
            warn!(%user_id, "password confirmation failed");
            return Err(AppError::Unauthorized("Invalid password".into()));
        }
        Ok(())
    }
}
