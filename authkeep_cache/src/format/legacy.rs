//! The legacy single-entry blob format
//!
//! Each entry carries a refresh token together with enough of the account
//! to rebuild account and ID token records. Access tokens in this format were
//! resource-scoped and cannot be mapped onto scope sets, so they are not
//! migrated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    key::CredentialKind,
    records::{
        AccountRecord, AppMetadataRecord, AuthorityType, ExtraFields, IdTokenRecord,
        RefreshTokenRecord,
    },
    CacheContents, CacheKey, CacheRecord, ClientId, Environment, FamilyId, HomeAccountId, IdToken,
    LocalAccountId, RefreshToken, TenantId, Username,
};

/// One self-contained legacy entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LegacyEntry {
    /// The full authority URL, e.g. `https://login.example.com/{tenant}`
    pub authority: String,
    /// The client the entry belongs to
    pub client_id: ClientId,
    /// The home account, absent in the oldest entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_account_id: Option<HomeAccountId>,
    /// The displayable username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayable_id: Option<Username>,
    /// The account's id within the tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<LocalAccountId>,
    /// The tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    /// The refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    /// The raw ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdToken>,
    /// The family the refresh token is shared with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_id: Option<FamilyId>,
    /// Unrecognized fields
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl LegacyEntry {
    /// The authority host, which becomes the record environment
    pub fn environment(&self) -> Option<Environment> {
        let (host, _) = split_authority(&self.authority)?;
        Some(Environment::new(host.to_lowercase()))
    }

    /// The tenant, taken from the entry or else the authority path
    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant_id
            .clone()
            .filter(|t| !t.as_str().is_empty())
            .or_else(|| {
                let (_, tenant) = split_authority(&self.authority)?;
                Some(TenantId::from(tenant))
            })
    }
}

fn split_authority(authority: &str) -> Option<(&str, &str)> {
    let rest = authority
        .strip_prefix("https://")
        .or_else(|| authority.strip_prefix("http://"))
        .unwrap_or(authority);
    let mut parts = rest.splitn(3, '/');
    let host = parts.next().filter(|h| !h.is_empty())?;
    let tenant = parts.next().filter(|t| !t.is_empty())?;
    Some((host, tenant))
}

/// Decodes the entries of a legacy blob, skipping unreadable ones
pub fn decode(entries: Vec<Value>) -> Vec<LegacyEntry> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::warn!(index, %error, "skipping unreadable legacy cache entry");
                None
            }
        })
        .collect()
}

/// Migrates legacy entries into current records
pub fn migrate(entries: Vec<LegacyEntry>) -> CacheContents {
    let mut contents = CacheContents::new();

    for entry in entries {
        let Some(home_account_id) = entry.home_account_id.clone().filter(|h| !h.as_str().is_empty())
        else {
            tracing::debug!(client_id = %entry.client_id, "skipping legacy entry without a home account");
            continue;
        };
        let Some(environment) = entry.environment() else {
            tracing::debug!(authority = %entry.authority, "skipping legacy entry with unusable authority");
            continue;
        };
        let tenant = entry.tenant();

        let mut records: Vec<CacheRecord> = Vec::with_capacity(4);

        if let Some(secret) = entry.refresh_token.clone() {
            records.push(
                RefreshTokenRecord {
                    home_account_id: home_account_id.clone(),
                    environment: environment.clone(),
                    client_id: entry.client_id.clone(),
                    secret,
                    family_id: entry.family_id.clone(),
                    extra: ExtraFields::new(),
                }
                .into(),
            );
        }

        if let Some(family) = entry.family_id.as_ref().filter(|f| !f.as_str().is_empty()) {
            records.push(
                AppMetadataRecord {
                    client_id: entry.client_id.clone(),
                    environment: environment.clone(),
                    family_id: family.as_str().to_owned(),
                    extra: ExtraFields::new(),
                }
                .into(),
            );
        }

        if let Some(tenant_id) = tenant {
            records.push(
                AccountRecord {
                    home_account_id: home_account_id.clone(),
                    environment: environment.clone(),
                    tenant_id: tenant_id.clone(),
                    local_account_id: entry.unique_id.clone(),
                    username: entry.displayable_id.clone(),
                    authority_type: AuthorityType::Aad,
                    extra: ExtraFields::new(),
                }
                .into(),
            );

            if let Some(secret) = entry.id_token.clone() {
                records.push(
                    IdTokenRecord {
                        home_account_id: home_account_id.clone(),
                        environment: environment.clone(),
                        client_id: entry.client_id.clone(),
                        tenant_id,
                        secret,
                        extra: ExtraFields::new(),
                    }
                    .into(),
                );
            }
        }

        for record in records {
            match record.key() {
                Ok(key) => {
                    contents.insert(key, record);
                }
                Err(error) => tracing::debug!(%error, "skipping migrated record"),
            }
        }
    }

    contents
}

/// The kinds a legacy blob cannot hold faithfully
///
/// Access tokens are never written. Application metadata survives only as
/// the family id on a refresh token, so a confirmed non-member is lost.
pub const UNREPRESENTED_KINDS: [CredentialKind; 2] =
    [CredentialKind::AccessToken, CredentialKind::AppMetadata];

/// Combines freshly migrated legacy contents with the records of the
/// previous view that the legacy blob could not hold
///
/// The blob stays authoritative for refresh tokens, accounts and ID tokens.
/// Records of [`UNREPRESENTED_KINDS`] are carried over from `previous`
/// unless the migration produced a record under the same key.
pub fn carry_over(mut migrated: CacheContents, previous: &CacheContents) -> CacheContents {
    for kind in UNREPRESENTED_KINDS {
        for (key, record) in previous.section(kind) {
            let key = CacheKey::new(key.to_owned());
            if migrated.get(kind, &key).is_none() {
                migrated.insert(key, record.clone());
            }
        }
    }
    migrated
}

/// Encodes contents as a legacy blob
///
/// One entry is written per refresh token, joined with the account and ID
/// token of the same account. Access tokens are not representable and are
/// omitted.
pub fn encode(contents: &CacheContents) -> Result<Vec<u8>, serde_json::Error> {
    let accounts: BTreeMap<(String, String), &AccountRecord> = contents
        .section(CredentialKind::Account)
        .filter_map(|(_, r)| r.as_account())
        .map(|a| {
            (
                (a.home_account_id.as_str().to_owned(), a.environment.as_str().to_owned()),
                a,
            )
        })
        .collect();

    let entries: Vec<LegacyEntry> = contents
        .section(CredentialKind::RefreshToken)
        .filter_map(|(_, r)| r.as_refresh_token())
        .map(|rt| {
            let account = accounts
                .get(&(
                    rt.home_account_id.as_str().to_owned(),
                    rt.environment.as_str().to_owned(),
                ))
                .copied();
            let tenant_id = account.map(|a| a.tenant_id.clone());
            let id_token = tenant_id.as_ref().and_then(|tenant_id| {
                let key = crate::key::id_token(
                    &rt.home_account_id,
                    &rt.environment,
                    &rt.client_id,
                    tenant_id,
                )
                .ok()?;
                contents
                    .get(CredentialKind::IdToken, &key)?
                    .as_id_token()
                    .map(|id| id.secret.clone())
            });
            let authority = format!(
                "https://{}/{}",
                rt.environment,
                tenant_id.as_ref().map_or("common", |t| t.as_str())
            );

            LegacyEntry {
                authority,
                client_id: rt.client_id.clone(),
                home_account_id: Some(rt.home_account_id.clone()),
                displayable_id: account.and_then(|a| a.username.clone()),
                unique_id: account.and_then(|a| a.local_account_id.clone()),
                tenant_id,
                refresh_token: Some(rt.secret.clone()),
                id_token,
                family_id: rt.family_id.clone(),
                extra: ExtraFields::new(),
            }
        })
        .collect();

    serde_json::to_vec(&entries)
}
