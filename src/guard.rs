//! Checks applied before any action runs: body size ceiling and basic auth.

use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH};
use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256, Sha512};

use crate::error::DispatchError;
use crate::rules::{HashAlgorithm, User, With};

/// Rejects requests whose declared `Content-Length` exceeds `limit`.
pub fn check_body_size(headers: &HeaderMap, limit: u64) -> Result<(), DispatchError> {
    let observed = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    match observed {
        Some(observed) if observed > limit => Err(DispatchError::EntityTooLarge {
            observed: Some(observed),
            limit,
        }),
        _ => Ok(()),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn hash_password(password: &str, algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::None => password.to_string(),
        HashAlgorithm::Sha256 => to_hex(&Sha256::digest(password.as_bytes())),
        HashAlgorithm::Sha512 => to_hex(&Sha512::digest(password.as_bytes())),
    }
}

/// Decodes `Authorization: Basic ...` into username and password.
fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// True when the request carries credentials matching one of `users`.
/// An empty user list does not require authentication.
pub fn is_authenticated(users: &[User], algorithm: HashAlgorithm, headers: &HeaderMap) -> bool {
    if users.is_empty() {
        return true;
    }
    let Some((username, password)) = basic_credentials(headers) else {
        return false;
    };
    let hashed = hash_password(&password, algorithm);
    users.iter().any(|u| {
        u.username == username
            && match algorithm {
                HashAlgorithm::None => u.password == hashed,
                _ => u.password.eq_ignore_ascii_case(&hashed),
            }
    })
}

/// Runs both checks in order: size first, then credentials.
pub fn check(with: Option<&With>, limit: u64, headers: &HeaderMap) -> Result<(), DispatchError> {
    check_body_size(headers, limit)?;
    if let Some(with) = with {
        if !is_authenticated(&with.auth_basic_users, with.auth_hash_algorithm, headers) {
            return Err(DispatchError::Unauthorised);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn basic(user: &str, pass: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let token = STANDARD.encode(format!("{}:{}", user, pass));
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Basic {}", token)).unwrap());
        headers
    }

    fn users(password: &str) -> Vec<User> {
        vec![User {
            username: "john".to_string(),
            password: password.to_string(),
        }]
    }

    #[test]
    fn test_body_size() {
        let mut headers = HeaderMap::new();
        assert!(check_body_size(&headers, 10).is_ok());
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("10"));
        assert!(check_body_size(&headers, 10).is_ok());
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1000"));
        match check_body_size(&headers, 10) {
            Err(DispatchError::EntityTooLarge { observed, limit }) => {
                assert_eq!(observed, Some(1000));
                assert_eq!(limit, 10);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_hash_password() {
        assert_eq!(hash_password("secret", HashAlgorithm::None), "secret");
        assert_eq!(
            hash_password("secret", HashAlgorithm::Sha256),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
        assert_eq!(hash_password("secret", HashAlgorithm::Sha512).len(), 128);
    }

    #[test]
    fn test_empty_user_list_allows_everyone() {
        assert!(is_authenticated(&[], HashAlgorithm::None, &HeaderMap::new()));
    }

    #[test]
    fn test_plain_and_hashed_credentials() {
        assert!(is_authenticated(&users("secret"), HashAlgorithm::None, &basic("john", "secret")));
        assert!(!is_authenticated(&users("secret"), HashAlgorithm::None, &basic("john", "wrong")));
        assert!(!is_authenticated(&users("secret"), HashAlgorithm::None, &basic("jane", "secret")));
        assert!(!is_authenticated(&users("secret"), HashAlgorithm::None, &HeaderMap::new()));

        let stored = hash_password("secret", HashAlgorithm::Sha256);
        assert!(is_authenticated(&users(&stored), HashAlgorithm::Sha256, &basic("john", "secret")));
        assert!(!is_authenticated(&users("secret"), HashAlgorithm::Sha256, &basic("john", "secret")));
    }

    #[test]
    fn test_check_size_before_auth() {
        let with = With {
            auth_basic_users: users("secret"),
            ..Default::default()
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1000"));
        assert!(matches!(
            check(Some(&with), 10, &headers),
            Err(DispatchError::EntityTooLarge { .. })
        ));
        assert!(matches!(check(Some(&with), 10_000, &headers), Err(DispatchError::Unauthorised)));
        assert!(check(None, 10_000, &headers).is_ok());
    }
}
