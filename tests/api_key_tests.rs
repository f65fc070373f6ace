//! API Key 生成与提取测试

use axum::http::HeaderMap;
use labops_system::auth::{extract_api_key, ApiKeyGenerator};

#[test]
fn test_full_key_workflow() {
    // 生成密钥
    let key = ApiKeyGenerator::generate();
    assert!(key.starts_with("lab_ak_"));

    // 派生公开标识
    let key_id = ApiKeyGenerator::generate_key_id(&key);
    assert!(key_id.starts_with("ak_"));
    assert_eq!(key_id.len(), 11);

    // 哈希稳定
    let hash = ApiKeyGenerator::hash(&key);
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, ApiKeyGenerator::hash(&key));
}

#[test]
fn test_generated_keys_are_unique() {
    let a = ApiKeyGenerator::generate();
    let b = ApiKeyGenerator::generate();
    assert_ne!(a, b);
    assert_ne!(ApiKeyGenerator::hash(&a), ApiKeyGenerator::hash(&b));
}

#[test]
fn test_key_id_is_derived_from_key_prefix() {
    let key = ApiKeyGenerator::generate();
    let key_id = ApiKeyGenerator::generate_key_id(&key);

    // key_id 的 8 个字符来自明文密钥去掉前缀后的开头
    let expected: String = key.chars().skip(7).take(8).collect();
    assert_eq!(key_id, format!("ak_{}", expected));
}

#[test]
fn test_extract_from_authorization_header() {
    let key = ApiKeyGenerator::generate();

    let mut headers = HeaderMap::new();
    headers.insert("authorization", format!("Bearer {}", key).parse().unwrap());

    assert_eq!(extract_api_key(&headers).unwrap(), key);
}

#[test]
fn test_extract_from_x_api_key_header() {
    let mut headers = HeaderMap::new();
    headers.insert("x-api-key", "lab_ak_secret".parse().unwrap());

    assert_eq!(extract_api_key(&headers).unwrap(), "lab_ak_secret");
}

#[test]
fn test_extract_rejects_foreign_bearer_tokens() {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer eyJhbGciOi.some.jwt".parse().unwrap());

    assert!(extract_api_key(&headers).is_none());
}
