use aliri_braid::braid;
use std::fmt;

/// Hides a secret behind `***LABEL***` unless the alternate flag is set
///
/// `{:#?}` shows a quoted prefix of at most `width` characters (or the given
/// default) and `{:#}` shows the whole secret.
macro_rules! redacted {
    ($ty:ty, $label:literal, $prefix:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }
                let keep = f.width().unwrap_or($prefix);
                write!(f, "\"{}\"", Prefix(self.as_str(), keep))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str(self.as_str())
                } else {
                    f.write_str(concat!("***", $label, "***"))
                }
            }
        }
    };
}

/// At most `.1` characters of a secret, the last replaced by an ellipsis
/// when anything was cut
struct Prefix<'a>(&'a str, usize);

impl fmt::Display for Prefix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Prefix(secret, keep) = *self;
        if secret.chars().count() <= keep {
            return f.write_str(secret);
        }
        let cut = secret
            .char_indices()
            .nth(keep.saturating_sub(1))
            .map_or(secret.len(), |(idx, _)| idx);
        write!(f, "{}…", &secret[..cut])
    }
}

/// A stable identifier for a signed-in identity, independent of tenant
///
/// Usually of the form `{object id}.{tenant id}`.
#[braid(serde)]
pub struct HomeAccountId;

/// The host of the issuing authority, e.g. `login.example.com`
#[braid(serde)]
pub struct Environment;

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// A tenant (realm) ID
#[braid(serde)]
pub struct TenantId;

/// The identifier of a family of clients sharing refresh tokens
#[braid(serde)]
pub struct FamilyId;

/// A user-facing account name, such as an email address
#[braid(serde)]
pub struct Username;

/// The account's identifier within a single tenant
#[braid(serde)]
pub struct LocalAccountId;

/// A composite cache key
///
/// Construct keys through [`crate::key`] so that equal lookups always
/// produce identical keys.
#[braid(serde)]
pub struct CacheKey;

/// An access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef, "ACCESS TOKEN", 15);

/// A refresh token
#[braid(serde, debug = "owned", display = "owned")]
pub struct RefreshToken;

redacted!(RefreshTokenRef, "REFRESH TOKEN", 5);

/// A raw OpenID Connect ID token
#[braid(serde, debug = "owned", display = "owned")]
pub struct IdToken;

redacted!(IdTokenRef, "ID TOKEN", 5);
