//! Gathers everything the application stores about a user.
//!
//! Secrets never leave the database: session token hashes, 2FA secrets and
//! backup codes, API key hashes, OAuth tokens and password hashes are not
//! selected at all.

#![allow(missing_docs)]

use crate::errors::ExportError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};

const LOGIN_HISTORY_LIMIT: i64 = 100;
const AUDIT_LOG_LIMIT: i64 = 500;

/// Version of the `user_data.json` layout.
pub const FORMAT_VERSION: &str = "1.0";

/// The document written to `user_data.json`.
///
/// Sections without rows are left out of the JSON.
#[derive(Debug, Clone, Serialize)]
pub struct UserDataExport {
    pub export_info: ExportInfo,
    pub profile: UserProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferences: Option<UserPreferences>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub login_history: Vec<LoginRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub two_factor: Option<TwoFactorStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub api_keys: Vec<ApiKeyRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub oauth_providers: Vec<OAuthProvider>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<OrganizationMembership>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub audit_log: Vec<AuditLogEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportInfo {
    pub export_id: i64,
    pub user_id: i64,
    pub generated_at: DateTime<Utc>,
    pub format_version: &'static str,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserProfile {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub role: String,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserPreferences {
    pub theme: String,
    pub language: String,
    pub timezone: String,
    pub email_notifications: bool,
    pub marketing_emails: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SessionRecord {
    pub id: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LoginRecord {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Whether 2FA is on; the secret and codes stay behind.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TwoFactorStatus {
    pub enabled: bool,
    pub verified_at: Option<DateTime<Utc>>,
    pub has_recovery_codes: bool,
}

/// API key metadata. The prefix is what the UI already shows.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub name: String,
    pub key_prefix: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OAuthProvider {
    pub provider: String,
    pub email: Option<String>,
    pub linked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub file_name: String,
    pub content_type: Option<String>,
    pub file_size: i64,
    pub storage_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct OrganizationMembership {
    pub organization_id: i64,
    pub name: String,
    pub slug: String,
    pub role: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Reads the user's data for export `export_id`.
///
/// # Errors
///
/// [`ExportError::UserNotFound`] if the user row is gone, otherwise any query
/// failure.
pub async fn collect_user_data(
    pool: &PgPool,
    user_id: i64,
    export_id: i64,
) -> Result<UserDataExport, ExportError> {
    let profile = sqlx::query_as::<_, UserProfile>(
        r"
        SELECT id, email, name, avatar_url, role, email_verified, created_at, updated_at
        FROM users
        WHERE id = $1
        ",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(ExportError::UserNotFound(user_id))?;

    let preferences = sqlx::query_as::<_, UserPreferences>(
        r"
        SELECT theme, language, timezone, email_notifications, marketing_emails, updated_at
        FROM user_preferences
        WHERE user_id = $1
        ",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let sessions = sqlx::query_as::<_, SessionRecord>(
        r"
        SELECT id, ip_address, user_agent, created_at, last_active_at, expires_at
        FROM sessions
        WHERE user_id = $1
        ORDER BY created_at DESC
        ",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let login_history = sqlx::query_as::<_, LoginRecord>(
        r"
        SELECT ip_address, user_agent, success, failure_reason, created_at
        FROM login_history
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        ",
    )
    .bind(user_id)
    .bind(LOGIN_HISTORY_LIMIT)
    .fetch_all(pool)
    .await?;

    let two_factor = sqlx::query_as::<_, TwoFactorStatus>(
        r"
        SELECT enabled, verified_at,
               COALESCE(backup_codes, '') <> '' AS has_recovery_codes
        FROM two_factor_auth
        WHERE user_id = $1
        ",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let api_keys = sqlx::query_as::<_, ApiKeyRecord>(
        r"
        SELECT id, name, key_prefix, last_used_at, expires_at, created_at
        FROM api_keys
        WHERE user_id = $1
        ORDER BY created_at
        ",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let oauth_providers = sqlx::query_as::<_, OAuthProvider>(
        r"
        SELECT provider, email, created_at AS linked_at
        FROM oauth_accounts
        WHERE user_id = $1
        ORDER BY created_at
        ",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let files = sqlx::query_as::<_, FileRecord>(
        r"
        SELECT id, file_name, content_type, file_size, storage_type, created_at
        FROM files
        WHERE user_id = $1
        ORDER BY created_at
        ",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let organizations = sqlx::query_as::<_, OrganizationMembership>(
        r"
        SELECT o.id AS organization_id, o.name, o.slug, m.role, m.joined_at
        FROM organization_members m
        JOIN organizations o ON o.id = m.organization_id
        WHERE m.user_id = $1
        ORDER BY m.joined_at
        ",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let audit_log = sqlx::query_as::<_, AuditLogEntry>(
        r"
        SELECT id, action, resource_type, resource_id, ip_address, created_at
        FROM audit_logs
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        ",
    )
    .bind(user_id)
    .bind(AUDIT_LOG_LIMIT)
    .fetch_all(pool)
    .await?;

    Ok(UserDataExport {
        export_info: ExportInfo {
            export_id,
            user_id,
            generated_at: Utc::now(),
            format_version: FORMAT_VERSION,
        },
        profile,
        preferences,
        sessions,
        login_history,
        two_factor,
        api_keys,
        oauth_providers,
        files,
        organizations,
        audit_log,
    })
}
