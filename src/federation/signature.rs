//! HTTP Signatures for federation requests
//!
//! Outgoing deliveries sign `(request-target) host date`. Incoming requests
//! may sign any of `(request-target)`, `host`, `date`, `digest` and
//! `content-length`; only RSA-SHA256 is accepted.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, NaiveDateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use super::objects::Actor;
use crate::error::{AppError, Result};

/// Signed header names for outgoing requests
const SIGNED_HEADERS: &str = "(request-target) host date";

/// Format of the `Date` header (RFC 1123, always GMT)
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// `Host` header value, including a non-default port
    pub host: String,
    /// `Date` header value
    pub date: String,
    /// `Signature` header value
    pub signature: String,
}

/// Sign an outgoing request
///
/// # Arguments
/// * `method` - HTTP method (e.g. "POST")
/// * `url` - Full URL being requested
/// * `private_key` - Sending actor's RSA key
/// * `key_id` - Sending actor's `publicKey.id`
pub fn sign_request(
    method: &str,
    url: &str,
    private_key: &RsaPrivateKey,
    key_id: &str,
) -> Result<SignatureHeaders> {
    sign_request_at(method, url, private_key, key_id, Utc::now())
}

pub(crate) fn sign_request_at(
    method: &str,
    url: &str,
    private_key: &RsaPrivateKey,
    key_id: &str,
    at: DateTime<Utc>,
) -> Result<SignatureHeaders> {
    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = match (parsed_url.host_str(), parsed_url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(AppError::Validation("Missing host in URL".to_string())),
    };

    let path_and_query = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let date = at.format(HTTP_DATE_FORMAT).to_string();

    let signing_string = format!(
        "(request-target): {} {}\nhost: {}\ndate: {}",
        method.to_lowercase(),
        path_and_query,
        host,
        date
    );

    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());

    let signature = format!(
        "keyId=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id,
        SIGNED_HEADERS,
        BASE64.encode(signature.to_bytes())
    );

    Ok(SignatureHeaders {
        host,
        date,
        signature,
    })
}

/// Verify an incoming request against the claimed actor
///
/// Returns `false` on any rejection. Use [`verify_request`] for the reason.
pub fn verify(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    actor: &Actor,
    max_skew_seconds: i64,
) -> bool {
    match verify_request(method, path, headers, body, actor, max_skew_seconds) {
        Ok(()) => true,
        Err(error) => {
            tracing::debug!(actor = %actor.id, %error, "Signature rejected");
            false
        }
    }
}

/// Verify an incoming request against the claimed actor
///
/// # Errors
/// `InvalidSignature` when the header is missing or malformed, the keyId is
/// not the actor's key, `(request-target)` or `date` is left unsigned, the date is outside the skew window, a signed digest
/// does not match the body, or the RSA check fails.
pub fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    actor: &Actor,
    max_skew_seconds: i64,
) -> Result<()> {
    let signature_header = header_value(headers, "signature")?
        .ok_or_else(|| AppError::InvalidSignature("Missing Signature header".to_string()))?;
    let parsed = parse_signature_header(signature_header)?;

    if let Some(algorithm) = parsed
        .algorithm
        .as_deref()
        .filter(|algorithm| !matches!(*algorithm, "rsa-sha256" | "hs2019"))
    {
        return Err(AppError::InvalidSignature(format!(
            "Unsupported signature algorithm: {}",
            algorithm
        )));
    }

    let expected_key_id = actor
        .public_key_id()
        .ok_or_else(|| AppError::InvalidSignature("Actor has no public key".to_string()))?;
    if parsed.key_id != expected_key_id {
        return Err(AppError::InvalidSignature(format!(
            "keyId {} does not belong to {}",
            parsed.key_id, actor.id
        )));
    }

    // An unsigned Date can be swapped for a fresh one on replay.
    for required in ["(request-target)", "date"] {
        if !parsed.headers.iter().any(|name| name == required) {
            return Err(AppError::InvalidSignature(format!(
                "{} is not covered by the signature",
                required
            )));
        }
    }

    let date = header_value(headers, "date")?
        .ok_or_else(|| AppError::InvalidSignature("Missing Date header".to_string()))?;
    let sent_at = parse_http_date(date)
        .ok_or_else(|| AppError::InvalidSignature("Invalid Date format".to_string()))?;
    if (Utc::now() - sent_at).num_seconds().abs() > max_skew_seconds {
        return Err(AppError::InvalidSignature(
            "Date header outside the accepted window".to_string(),
        ));
    }

    let signing_string = signing_string(method, path, headers, &parsed.headers)?;

    if parsed.headers.iter().any(|name| name == "digest") {
        let digest = header_value(headers, "digest")?.unwrap_or_default();
        if digest != generate_digest(body) {
            return Err(AppError::InvalidSignature("Digest mismatch".to_string()));
        }
    }

    let public_key_pem = actor
        .public_key_pem()
        .ok_or_else(|| AppError::InvalidSignature("Actor has no public key".to_string()))?;
    let public_key = super::keys::parse_public_key(public_key_pem)
        .map_err(|e| AppError::InvalidSignature(e.to_string()))?;

    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| AppError::InvalidSignature("Invalid signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::InvalidSignature(format!("Invalid signature format: {}", e)))?;

    VerifyingKey::<Sha256>::new(public_key)
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature("Signature verification failed".to_string()))
}

/// Rebuild the canonical string for the listed headers
fn signing_string(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    names: &[String],
) -> Result<String> {
    let mut lines = Vec::with_capacity(names.len());

    for name in names {
        let value = match name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-length" => header_value(headers, name)?
                .unwrap_or_default()
                .to_string(),
            other => {
                return Err(AppError::InvalidSignature(format!(
                    "Unsupported header in signature: {}",
                    other
                )));
            }
        };
        lines.push(format!("{}: {}", name, value));
    }

    Ok(lines.join("\n"))
}

fn header_value<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<Option<&'a str>> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::InvalidSignature(format!("Invalid {} header", name)))
        })
        .transpose()
}

/// Parse a `Date` header
///
/// Accepts RFC 1123 with `GMT` and the `UTC` suffix some peers send.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S UTC")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Declared algorithm, when present
    pub algorithm: Option<String>,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse a Signature header value
///
/// # Format
/// ```text
/// keyId="...",headers="...",signature="..."
/// ```
/// `headers` defaults to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in split_params(header) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');

        match key.trim() {
            "keyId" => key_id = Some(value.to_string()),
            "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(|name| name.to_ascii_lowercase())
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| AppError::InvalidSignature("Missing keyId".to_string()))?,
        algorithm,
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature
            .ok_or_else(|| AppError::InvalidSignature("Missing signature".to_string()))?,
    })
}

/// Split on commas outside quoted values
fn split_params(header: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (index, ch) in header.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(header[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(header[start..].trim());

    parts.into_iter().filter(|part| !part.is_empty()).collect()
}

/// SHA-256 digest header value for a body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::objects::PublicKey;
    use chrono::Duration;
    use http::{HeaderMap, HeaderValue};
    use rsa::RsaPublicKey;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};

    const KEY_ID: &str = "https://remote.example/b#main-key";
    const INBOX: &str = "https://local.example/g/inbox";

    fn generate_test_keypair() -> (RsaPrivateKey, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).expect("key generation should work");
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .expect("public key pem");
        (private_key, public_key_pem)
    }

    fn actor_with_key(public_key_pem: &str) -> Actor {
        Actor {
            id: "https://remote.example/b".to_string(),
            public_key: Some(PublicKey {
                id: KEY_ID.to_string(),
                owner: "https://remote.example/b".to_string(),
                public_key_pem: public_key_pem.to_string(),
            }),
            ..Actor::default()
        }
    }

    fn signed_headers(private_key: &RsaPrivateKey, at: DateTime<Utc>) -> HeaderMap {
        let signed = sign_request_at("POST", INBOX, private_key, KEY_ID, at).expect("signed");

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_str(&signed.host).expect("host"));
        headers.insert("date", HeaderValue::from_str(&signed.date).expect("date"));
        headers.insert(
            "signature",
            HeaderValue::from_str(&signed.signature).expect("signature"),
        );
        headers
    }

    #[test]
    fn signed_request_verifies() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let headers = signed_headers(&private_key, Utc::now());

        let result = verify_request(
            "POST",
            "/g/inbox",
            &headers,
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        );
        assert!(result.is_ok(), "valid signature should verify: {result:?}");
    }

    #[test]
    fn signature_header_has_expected_shape() {
        let (private_key, _) = generate_test_keypair();
        let signed = sign_request("POST", INBOX, &private_key, KEY_ID).expect("signed");

        assert!(signed.signature.starts_with(&format!("keyId=\"{}\"", KEY_ID)));
        assert!(signed.signature.contains("headers=\"(request-target) host date\""));
        assert!(signed.date.ends_with(" GMT"));
        assert_eq!(signed.host, "local.example");
    }

    #[test]
    fn host_keeps_explicit_port() {
        let (private_key, _) = generate_test_keypair();
        let signed = sign_request("POST", "http://127.0.0.1:8080/inbox", &private_key, KEY_ID)
            .expect("signed");
        assert_eq!(signed.host, "127.0.0.1:8080");
    }

    #[test]
    fn stale_date_is_rejected() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let headers = signed_headers(&private_key, Utc::now() - Duration::seconds(120));

        assert!(!verify(
            "POST",
            "/g/inbox",
            &headers,
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        ));
    }

    #[test]
    fn future_date_is_rejected() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let headers = signed_headers(&private_key, Utc::now() + Duration::seconds(120));

        assert!(!verify(
            "POST",
            "/g/inbox",
            &headers,
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        ));
    }

    #[test]
    fn foreign_key_id_is_rejected() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let headers = signed_headers(&private_key, Utc::now());
        let mut actor = actor_with_key(&public_key_pem);
        if let Some(key) = actor.public_key.as_mut() {
            key.id = "https://remote.example/other#main-key".to_string();
        }

        match verify_request("POST", "/g/inbox", &headers, b"{}", &actor, 75) {
            Err(AppError::InvalidSignature(msg)) => assert!(msg.contains("does not belong")),
            other => panic!("expected keyId mismatch, got: {other:?}"),
        }
    }

    #[test]
    fn altered_signed_header_is_rejected() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let mut headers = signed_headers(&private_key, Utc::now());
        headers.insert("host", HeaderValue::from_static("evil.example"));

        assert!(!verify(
            "POST",
            "/g/inbox",
            &headers,
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        ));
    }

    #[test]
    fn altered_path_is_rejected() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let headers = signed_headers(&private_key, Utc::now());

        assert!(!verify(
            "POST",
            "/other/inbox",
            &headers,
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        ));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let (private_key, _) = generate_test_keypair();
        let (_, other_public_pem) = generate_test_keypair();
        let headers = signed_headers(&private_key, Utc::now());

        assert!(!verify(
            "POST",
            "/g/inbox",
            &headers,
            b"{}",
            &actor_with_key(&other_public_pem),
            75,
        ));
    }

    #[test]
    fn missing_signature_header_is_rejected() {
        let (_, public_key_pem) = generate_test_keypair();
        match verify_request(
            "POST",
            "/g/inbox",
            &HeaderMap::new(),
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        ) {
            Err(AppError::InvalidSignature(msg)) => assert!(msg.contains("Missing Signature")),
            other => panic!("expected missing header error, got: {other:?}"),
        }
    }

    #[test]
    fn signed_digest_must_match_body() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let body = br#"{"type":"Follow"}"#;
        let date = Utc::now().format(HTTP_DATE_FORMAT).to_string();
        let digest = generate_digest(body);
        let signing_string = format!(
            "(request-target): post /g/inbox\nhost: local.example\ndate: {}\ndigest: {}",
            date, digest
        );
        let signature = SigningKey::<Sha256>::new(private_key)
            .sign_with_rng(&mut rand::thread_rng(), signing_string.as_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("local.example"));
        headers.insert("date", HeaderValue::from_str(&date).expect("date"));
        headers.insert("digest", HeaderValue::from_str(&digest).expect("digest"));
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!(
                "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date digest\",signature=\"{}\"",
                KEY_ID,
                BASE64.encode(signature.to_bytes())
            ))
            .expect("signature"),
        );

        let actor = actor_with_key(&public_key_pem);
        assert!(verify("POST", "/g/inbox", &headers, body, &actor, 75));
        assert!(!verify("POST", "/g/inbox", &headers, b"{\"type\":\"Delete\"}", &actor, 75));
    }

    #[test]
    fn unsigned_date_is_rejected() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let signing_string = "(request-target): post /g/inbox\nhost: local.example";
        let signature = SigningKey::<Sha256>::new(private_key)
            .sign_with_rng(&mut rand::thread_rng(), signing_string.as_bytes());

        // A fresh Date outside the signed headers must not refresh an old capture.
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("local.example"));
        headers.insert(
            "date",
            HeaderValue::from_str(&Utc::now().format(HTTP_DATE_FORMAT).to_string())
                .expect("date"),
        );
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!(
                "keyId=\"{}\",headers=\"(request-target) host\",signature=\"{}\"",
                KEY_ID,
                BASE64.encode(signature.to_bytes())
            ))
            .expect("signature"),
        );

        match verify_request(
            "POST",
            "/g/inbox",
            &headers,
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        ) {
            Err(AppError::InvalidSignature(msg)) => assert!(msg.contains("date")),
            other => panic!("expected unsigned date error, got: {other:?}"),
        }
    }

    #[test]
    fn unsigned_request_target_is_rejected() {
        let (private_key, public_key_pem) = generate_test_keypair();
        let date = Utc::now().format(HTTP_DATE_FORMAT).to_string();
        let signing_string = format!("host: local.example\ndate: {}", date);
        let signature = SigningKey::<Sha256>::new(private_key)
            .sign_with_rng(&mut rand::thread_rng(), signing_string.as_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("local.example"));
        headers.insert("date", HeaderValue::from_str(&date).expect("date"));
        headers.insert(
            "signature",
            HeaderValue::from_str(&format!(
                "keyId=\"{}\",headers=\"host date\",signature=\"{}\"",
                KEY_ID,
                BASE64.encode(signature.to_bytes())
            ))
            .expect("signature"),
        );

        assert!(!verify(
            "POST",
            "/g/inbox",
            &headers,
            b"{}",
            &actor_with_key(&public_key_pem),
            75,
        ));
    }

    #[test]
    fn parse_signature_header_handles_commas_inside_quotes() {
        let parsed = parse_signature_header(
            "keyId=\"https://remote.example/b#main-key\",headers=\"(request-target) host date\",signature=\"a,b==\"",
        )
        .expect("parsed");

        assert_eq!(parsed.key_id, KEY_ID);
        assert_eq!(parsed.headers, vec!["(request-target)", "host", "date"]);
        assert_eq!(parsed.signature, "a,b==");
        assert_eq!(parsed.algorithm, None);
    }

    #[test]
    fn parse_signature_header_requires_key_id() {
        assert!(matches!(
            parse_signature_header("headers=\"date\",signature=\"abc\""),
            Err(AppError::InvalidSignature(_))
        ));
    }

    #[test]
    fn http_date_accepts_gmt_and_utc_suffix() {
        let gmt = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").expect("gmt");
        let utc = parse_http_date("Sun, 06 Nov 1994 08:49:37 UTC").expect("utc");
        assert_eq!(gmt, utc);
        assert!(parse_http_date("yesterday").is_none());
    }
}
