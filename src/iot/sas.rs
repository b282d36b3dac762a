//! Shared access signatures and per-device key derivation

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use url::form_urlencoded;

use crate::error::{ConnectorError, Result};

type HmacSha256 = Hmac<Sha256>;

fn sign(key_b64: &str, data: &[u8]) -> Result<String> {
    let key = STANDARD
        .decode(key_b64.trim())
        .map_err(|e| ConnectorError::Config(format!("signing key is not base64: {}", e)))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| ConnectorError::Config(format!("invalid signing key: {}", e)))?;
    mac.update(data);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

pub fn url_encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

/// Per-device symmetric key for group enrollment: HMAC-SHA256 of the
/// registration id under the group key, both keys base64.
pub fn derive_device_key(group_key_b64: &str, registration_id: &str) -> Result<String> {
    sign(group_key_b64, registration_id.as_bytes())
}

/// `SharedAccessSignature sr=..&sig=..&se=..[&skn=..]` for `resource_uri`,
/// valid until `expiry` (unix seconds).
pub fn generate_sas_token(
    resource_uri: &str,
    key_b64: &str,
    key_name: Option<&str>,
    expiry: i64,
) -> Result<String> {
    let resource = url_encode(resource_uri);
    let signature = sign(key_b64, format!("{}\n{}", resource, expiry).as_bytes())?;

    let mut token = format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        resource,
        url_encode(&signature),
        expiry
    );
    if let Some(key_name) = key_name {
        token.push_str("&skn=");
        token.push_str(&url_encode(key_name));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP_KEY: &str = "Z3JvdXAtZW5yb2xsbWVudC1rZXktMDEyMzQ1Njc4OQ==";

    #[test]
    fn test_derive_device_key() {
        assert_eq!(
            derive_device_key(GROUP_KEY, "42").unwrap(),
            "xa6WZG/4NUzIF1VmCgPS2+rHGQEaqk+I9Q8J8NgI0tM="
        );
    }

    #[test]
    fn test_derived_keys_differ_per_device() {
        assert_ne!(
            derive_device_key(GROUP_KEY, "42").unwrap(),
            derive_device_key(GROUP_KEY, "43").unwrap()
        );
    }

    #[test]
    fn test_registration_token() {
        let token = generate_sas_token(
            "0ne00000000/registrations/42",
            "xa6WZG/4NUzIF1VmCgPS2+rHGQEaqk+I9Q8J8NgI0tM=",
            Some("registration"),
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(
            token,
            "SharedAccessSignature sr=0ne00000000%2Fregistrations%2F42\
             &sig=T5%2BQ%2BM5MvKtwa5XHHC1Po%2FrVbnsyiOBn%2BIrP0XOmIHI%3D\
             &se=1700000000&skn=registration"
        );
    }

    #[test]
    fn test_device_token_without_key_name() {
        let token = generate_sas_token(
            "hub.example.net/devices/42",
            "cG9saWN5LWtleQ==",
            None,
            1_700_000_000,
        )
        .unwrap();
        assert_eq!(
            token,
            "SharedAccessSignature sr=hub.example.net%2Fdevices%2F42\
             &sig=ujCG6tm%2BPhnl6WNVhpdR%2FqPH8uQDaH7pjOZxAs%2FCFYY%3D\
             &se=1700000000"
        );
    }

    #[test]
    fn test_bad_key_is_config_error() {
        assert!(matches!(
            derive_device_key("not base64!", "42"),
            Err(ConnectorError::Config(_))
        ));
    }
}
