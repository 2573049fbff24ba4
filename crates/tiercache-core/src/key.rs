//! Canonical cache keys.
//!
//! Every logical key is reduced to a single delimiter-safe token and then
//! composed into `prefix:application:tenant:cache:token`, the string both
//! tiers address. The token encoding is injective: the direct (readable) form
//! is only used where it cannot be confused with another key, everything else
//! goes through tagged JSON and base64.

use std::borrow::Cow;
use std::fmt;
use std::future::Future;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};

/// Delimiter between key segments.
pub const DELIMITER: char = ':';

/// Tenant segment used when no tenant is in scope.
pub const DEFAULT_TENANT: &str = "default";

/// Marks a token produced by the tagged JSON path.
const TAGGED_PREFIX: char = '~';

tokio::task_local! {
    static CURRENT_TENANT: String;
}

/// Runs `future` with `tenant` as the tenant for every key built inside it.
pub async fn with_tenant<F: Future>(tenant: impl Into<String>, future: F) -> F::Output {
    CURRENT_TENANT.scope(tenant.into(), future).await
}

/// Returns the tenant in scope for the current task, if any.
pub fn current_tenant() -> Option<String> {
    CURRENT_TENANT.try_with(Clone::clone).ok()
}

/// A logical cache key.
///
/// Text and integers have a canonical string form; anything else is carried
/// as structured JSON. UUIDs get their own tag so they never meet a text key
/// with the same spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Text(String),
    Integer(i128),
    Uuid(Uuid),
    Structured(Value),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Uuid(value) => write!(f, "{value}"),
            Self::Structured(value) => write!(f, "{value}"),
        }
    }
}

/// Conversion into a [`CacheKey`].
pub trait ToCacheKey {
    fn to_cache_key(&self) -> CacheResult<CacheKey>;
}

impl ToCacheKey for CacheKey {
    fn to_cache_key(&self) -> CacheResult<CacheKey> {
        Ok(self.clone())
    }
}

impl ToCacheKey for str {
    fn to_cache_key(&self) -> CacheResult<CacheKey> {
        Ok(CacheKey::Text(self.to_owned()))
    }
}

impl ToCacheKey for String {
    fn to_cache_key(&self) -> CacheResult<CacheKey> {
        Ok(CacheKey::Text(self.clone()))
    }
}

impl ToCacheKey for Uuid {
    fn to_cache_key(&self) -> CacheResult<CacheKey> {
        Ok(CacheKey::Uuid(*self))
    }
}

impl<T: ToCacheKey + ?Sized> ToCacheKey for &T {
    fn to_cache_key(&self) -> CacheResult<CacheKey> {
        (**self).to_cache_key()
    }
}

macro_rules! integer_keys {
    ($($ty:ty),*) => {
        $(
            impl ToCacheKey for $ty {
                fn to_cache_key(&self) -> CacheResult<CacheKey> {
                    Ok(CacheKey::Integer(i128::from(*self)))
                }
            }
        )*
    };
}

integer_keys!(i8, i16, i32, i64, u8, u16, u32, u64);

impl ToCacheKey for usize {
    fn to_cache_key(&self) -> CacheResult<CacheKey> {
        Ok(CacheKey::Integer(*self as i128))
    }
}

/// Wraps any serializable value so it can be used as a structured key.
#[derive(Debug, Clone)]
pub struct Json<T>(pub T);

impl<T: Serialize> ToCacheKey for Json<T> {
    fn to_cache_key(&self) -> CacheResult<CacheKey> {
        Ok(CacheKey::Structured(serde_json::to_value(&self.0)?))
    }
}

/// A key resolved against the serializer's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// Tenant segment the key was built with.
    pub tenant: String,
    /// Delimiter-safe encoding of the logical key.
    pub token: String,
    /// Full key addressed in both tiers.
    pub full: String,
}

impl ResolvedKey {
    /// Returns the tenant, or `None` for the default tenant.
    pub fn explicit_tenant(&self) -> Option<&str> {
        (self.tenant != DEFAULT_TENANT).then_some(self.tenant.as_str())
    }
}

/// Builds canonical keys for one application namespace.
#[derive(Debug, Clone)]
pub struct KeySerializer {
    prefix: String,
    application: String,
}

impl KeySerializer {
    /// Creates a serializer for `prefix` and `application_name`.
    ///
    /// The application name is normalized to lower snake case.
    pub fn new(prefix: impl Into<String>, application_name: &str) -> CacheResult<Self> {
        let prefix = prefix.into();
        check_segment("key prefix", &prefix)?;
        let application = normalize_application_name(application_name);
        check_segment("application name", &application)?;
        Ok(Self {
            prefix,
            application,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    /// Encodes a key as a delimiter-safe token.
    pub fn serialize<K: ToCacheKey + ?Sized>(&self, key: &K) -> CacheResult<String> {
        encode_token(&key.to_cache_key()?)
    }

    /// Resolves `key` in `cache_name` using the tenant currently in scope.
    pub fn resolve<K: ToCacheKey + ?Sized>(
        &self,
        cache_name: &str,
        key: &K,
    ) -> CacheResult<ResolvedKey> {
        let tenant = current_tenant().unwrap_or_else(|| DEFAULT_TENANT.to_string());
        let token = self.serialize(key)?;
        self.resolve_token(Some(&tenant), cache_name, &token)
    }

    /// Rebuilds a key from an already serialized token, as carried by
    /// invalidation messages.
    pub fn resolve_token(
        &self,
        tenant: Option<&str>,
        cache_name: &str,
        token: &str,
    ) -> CacheResult<ResolvedKey> {
        let tenant = tenant.unwrap_or(DEFAULT_TENANT);
        check_segment("tenant id", tenant)?;
        check_segment("cache name", cache_name)?;
        if token.is_empty() || token.contains(DELIMITER) {
            return Err(CacheError::serialization(format!(
                "malformed key token '{token}'"
            )));
        }
        let full = format!(
            "{}{DELIMITER}{}{DELIMITER}{tenant}{DELIMITER}{cache_name}{DELIMITER}{token}",
            self.prefix, self.application
        );
        Ok(ResolvedKey {
            tenant: tenant.to_string(),
            token: token.to_string(),
            full,
        })
    }

    /// Convenience for `resolve(..).full`.
    pub fn build_key<K: ToCacheKey + ?Sized>(&self, cache_name: &str, key: &K) -> CacheResult<String> {
        Ok(self.resolve(cache_name, key)?.full)
    }

    /// Glob pattern matching every key of `cache_name`, across tenants.
    pub fn cache_pattern(&self, cache_name: &str) -> CacheResult<String> {
        check_segment("cache name", cache_name)?;
        Ok(format!(
            "{}{DELIMITER}{}{DELIMITER}*{DELIMITER}{cache_name}{DELIMITER}*",
            self.prefix, self.application
        ))
    }

    /// Glob pattern matching every key of this application.
    pub fn namespace_pattern(&self) -> String {
        format!("{}{DELIMITER}{}{DELIMITER}*", self.prefix, self.application)
    }
}

/// Validates a cache-name without building a key.
pub fn validate_cache_name(cache_name: &str) -> CacheResult<()> {
    check_segment("cache name", cache_name)
}

fn check_segment(what: &str, segment: &str) -> CacheResult<()> {
    if segment.is_empty() {
        return Err(CacheError::invalid_configuration(format!("{what} is empty")));
    }
    if let Some(bad) = segment.chars().find(|c| is_reserved(*c)) {
        return Err(CacheError::invalid_configuration(format!(
            "{what} '{segment}' contains reserved character {bad:?}"
        )));
    }
    Ok(())
}

fn is_reserved(c: char) -> bool {
    c == DELIMITER || c.is_whitespace() || c.is_control() || matches!(c, '*' | '?' | '[' | ']' | '\\')
}

fn encode_token(key: &CacheKey) -> CacheResult<String> {
    match key {
        CacheKey::Integer(value) => Ok(value.to_string()),
        CacheKey::Text(text) if is_direct_text(text) => Ok(text.clone()),
        CacheKey::Text(text) => tagged(&json!({ "s": text })),
        CacheKey::Uuid(value) => tagged(&json!({ "u": value.to_string() })),
        CacheKey::Structured(value) => tagged(&json!({ "j": value })),
    }
}

fn tagged(value: &Value) -> CacheResult<String> {
    let json = serde_json::to_vec(value)?;
    Ok(format!("{TAGGED_PREFIX}{}", URL_SAFE_NO_PAD.encode(json)))
}

/// Text may be used verbatim only when it cannot collide with an integer or
/// a tagged token and cannot break the key layout.
fn is_direct_text(text: &str) -> bool {
    !text.is_empty()
        && !text.starts_with(TAGGED_PREFIX)
        && !looks_like_integer(text)
        && !text.chars().any(is_reserved)
}

fn looks_like_integer(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Normalizes an application name: `-` to `_`, camelCase to snake_case,
/// repeated underscores collapsed, lowercased.
pub fn normalize_application_name(name: &str) -> String {
    let replaced: Cow<'_, str> = if name.contains('-') {
        Cow::Owned(name.replace('-', "_"))
    } else {
        Cow::Borrowed(name)
    };

    let mut out = String::with_capacity(replaced.len() + 4);
    let mut prev_lower_or_digit = false;
    for ch in replaced.trim().chars() {
        if ch.is_uppercase() {
            if prev_lower_or_digit {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower_or_digit = false;
        } else {
            if ch == '_' && out.ends_with('_') {
                continue;
            }
            out.push(ch);
            prev_lower_or_digit = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}
