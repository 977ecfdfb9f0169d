use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::AppConfig;
use crate::error::AppError;

/// Caller identity established from a verified bearer token.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Identity provider subject
    pub subject: String,
    pub session_id: Option<String>,
}

#[derive(Clone)]
enum KeySource {
    Jwks {
        client: reqwest::Client,
        cache: Arc<RwLock<JwksCache>>,
    },
    Static {
        key: DecodingKey,
        algorithm: Algorithm,
    },
}

#[derive(Clone)]
pub struct JwtVerifier {
    config: Arc<AppConfig>,
    keys: KeySource,
}

impl JwtVerifier {
    /// Verify RS256 tokens against the identity provider's JWKS.
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            keys: KeySource::Jwks {
                client: reqwest::Client::new(),
                cache: Arc::new(RwLock::new(JwksCache::default())),
            },
        }
    }

    /// Verify tokens with one fixed key, ignoring `kid`.
    pub fn with_static_key(config: Arc<AppConfig>, key: DecodingKey, algorithm: Algorithm) -> Self {
        Self {
            config,
            keys: KeySource::Static { key, algorithm },
        }
    }

    pub async fn verify_access_token(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let header = decode_header(token).map_err(|error| {
            AppError::unauthorized(format!("Token header decode failed: {}", sanitize(&error)))
        })?;

        let (key, algorithm) = match &self.keys {
            KeySource::Static { key, algorithm } => (key.clone(), *algorithm),
            KeySource::Jwks { client, cache } => {
                let kid = header
                    .kid
                    .ok_or_else(|| AppError::unauthorized("Token header missing `kid`"))?;
                (self.find_key(client, cache, &kid).await?, Algorithm::RS256)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        validation.set_issuer(&[self.config.jwt_issuer.as_str()]);

        let decoded = decode::<Claims>(token, &key, &validation).map_err(|error| {
            AppError::unauthorized(format!("Token validation failed: {}", sanitize(&error)))
        })?;

        if !audience_matches(decoded.claims.aud.as_ref(), &self.config.jwt_audience) {
            return Err(AppError::unauthorized("Token audience is not allowed"));
        }
        if decoded.claims.sub.trim().is_empty() {
            return Err(AppError::unauthorized("Token subject is missing"));
        }
        validate_temporal_claims(&decoded.claims, self.config.auth_clock_skew)?;

        Ok(AuthenticatedUser {
            subject: decoded.claims.sub,
            session_id: decoded.claims.session_id.or(decoded.claims.jti),
        })
    }

    async fn find_key(
        &self,
        client: &reqwest::Client,
        cache: &RwLock<JwksCache>,
        kid: &str,
    ) -> Result<DecodingKey, AppError> {
        {
            let cache = cache.read().await;
            if !cache.is_stale(self.config.jwks_cache_ttl) {
                if let Some(key) = cache.keys.get(kid) {
                    return Ok(key.clone());
                }
            }
        }

        let mut cache = cache.write().await;
        if !cache.is_stale(self.config.jwks_cache_ttl) {
            if let Some(key) = cache.keys.get(kid) {
                return Ok(key.clone());
            }
        }

        let keys = fetch_jwks(client, &self.config.jwks_url).await?;
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());

        cache
            .keys
            .get(kid)
            .cloned()
            .ok_or_else(|| AppError::unauthorized("Signing key not found in JWKS"))
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }

    Ok(token)
}

#[derive(Default)]
struct JwksCache {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Option<Instant>,
}

impl JwksCache {
    fn is_stale(&self, ttl: std::time::Duration) -> bool {
        self.fetched_at.map_or(true, |at| at.elapsed() > ttl)
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: Option<String>,
    #[serde(rename = "use")]
    use_: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    aud: Option<Value>,
    exp: Option<i64>,
    iat: Option<i64>,
    nbf: Option<i64>,
    jti: Option<String>,
    session_id: Option<String>,
}

fn validate_temporal_claims(
    claims: &Claims,
    clock_skew: std::time::Duration,
) -> Result<(), AppError> {
    let now = chrono::Utc::now().timestamp();
    let skew = i64::try_from(clock_skew.as_secs()).unwrap_or(0);

    let exp = claims
        .exp
        .ok_or_else(|| AppError::unauthorized("Token missing `exp` claim"))?;
    if exp <= now.saturating_sub(skew) {
        return Err(AppError::unauthorized("Token is expired"));
    }

    let iat = claims
        .iat
        .ok_or_else(|| AppError::unauthorized("Token missing `iat` claim"))?;
    if iat > now.saturating_add(skew) {
        return Err(AppError::unauthorized("Token `iat` is in the future"));
    }

    if let Some(nbf) = claims.nbf {
        if nbf > now.saturating_add(skew) {
            return Err(AppError::unauthorized("Token is not yet valid"));
        }
    }

    Ok(())
}

async fn fetch_jwks(
    client: &reqwest::Client,
    jwks_url: &str,
) -> Result<HashMap<String, DecodingKey>, AppError> {
    let response = client
        .get(jwks_url)
        .header("Accept", "application/json")
        .send()
        .await
        .map_err(|error| {
            AppError::external(format!("JWKS request failed: {}", sanitize(&error)))
        })?;

    if !response.status().is_success() {
        return Err(AppError::external(format!(
            "JWKS request failed with HTTP {}",
            response.status().as_u16()
        )));
    }

    let payload = response.json::<JwksDocument>().await.map_err(|error| {
        AppError::external(format!("JWKS JSON parse failed: {}", sanitize(&error)))
    })?;

    let mut out = HashMap::new();
    for key in payload.keys {
        let (Some(kid), Some(n), Some(e)) = (key.kid, key.n, key.e) else {
            continue;
        };
        if key.kty.as_deref() != Some("RSA") {
            continue;
        }
        if key.use_.as_deref().is_some_and(|usage| usage != "sig") {
            continue;
        }
        let decoding = DecodingKey::from_rsa_components(&n, &e).map_err(|error| {
            AppError::external(format!("Invalid JWKS RSA key: {}", sanitize(&error)))
        })?;
        out.insert(kid, decoding);
    }

    if out.is_empty() {
        return Err(AppError::external(
            "JWKS did not include any usable RSA signing keys",
        ));
    }

    Ok(out)
}

fn audience_matches(aud: Option<&Value>, expected: &str) -> bool {
    match aud {
        Some(Value::String(value)) => value == expected,
        Some(Value::Array(values)) => values
            .iter()
            .filter_map(Value::as_str)
            .any(|value| value == expected),
        _ => false,
    }
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}


#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::test_support::{token_for, verifier};
    use super::*;
    use crate::config::test_config;

    #[test]
    fn bearer_token_extractor_accepts_standard_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer abc.def.ghi"),
        );

        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn bearer_token_extractor_rejects_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_err());
    }

    #[test]
    fn audience_matches_string_or_array() {
        assert!(audience_matches(
            Some(&Value::String("authenticated".to_string())),
            "authenticated"
        ));
        assert!(audience_matches(
            Some(&serde_json::json!(["anon", "authenticated"])),
            "authenticated"
        ));
        assert!(!audience_matches(None, "authenticated"));
    }

    #[test]
    fn temporal_claims_reject_expired_token() {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: "engineer".to_string(),
            aud: None,
            exp: Some(now - 120),
            iat: Some(now - 600),
            nbf: None,
            jti: None,
            session_id: None,
        };
        let err =
            validate_temporal_claims(&claims, std::time::Duration::from_secs(30)).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn static_key_verifier_accepts_minted_token() {
        let config = Arc::new(test_config());
        let user = verifier(Arc::clone(&config))
            .verify_access_token(&token_for(&config, "engineer-1"))
            .await
            .unwrap();
        assert_eq!(user.subject, "engineer-1");
    }

    #[tokio::test]
    async fn wrong_issuer_is_rejected() {
        let config = Arc::new(test_config());
        let mut other = test_config();
        other.jwt_issuer = "https://evil.example.com".to_string();

        let result = verifier(config)
            .verify_access_token(&token_for(&other, "engineer-1"))
            .await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }
}
