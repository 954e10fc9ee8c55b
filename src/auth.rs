use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Shared-access key, validated once at configuration load.
#[derive(Clone)]
pub struct SasKey {
    decoded: Vec<u8>,
}

impl SasKey {
    pub fn new(key: &str) -> Result<SasKey> {
        // Verify key is base64
        let decoded = general_purpose::STANDARD
            .decode(key)
            .map_err(|_| Error::Config("shared access key is not valid base64".into()))?;

        // Verify key is the right length for Hmac
        Hmac::<Sha256>::new_from_slice(&decoded)
            .map_err(|_| Error::Config("shared access key has an invalid length".into()))?;

        Ok(SasKey { decoded })
    }

    fn token(&self, message: &str) -> String {
        // Checked base64 and hmac in new so should be safe to unwrap here
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.decoded).unwrap();
        mac.update(message.as_bytes());
        let mac_result = mac.finalize();
        let signature = general_purpose::STANDARD.encode(mac_result.into_bytes());

        let pairs = &[("sig", signature)];
        serde_urlencoded::to_string(pairs).unwrap()
    }
}

impl std::fmt::Debug for SasKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SasKey(redacted)")
    }
}

/// Signature scoped to one event stream under the hub namespace.
pub fn stream_signature(
    key: &SasKey,
    hostname: &str,
    key_name: &str,
    stream_path: &str,
    expiry: &DateTime<Utc>,
) -> String {
    let resource_uri = format!("{}%2F{}", hostname, stream_path.replace('/', "%2F"));
    signature_for(key, &resource_uri, key_name, expiry)
}

/// Signature scoped to the whole hub service API.
pub fn service_signature(
    key: &SasKey,
    hostname: &str,
    key_name: &str,
    expiry: &DateTime<Utc>,
) -> String {
    signature_for(key, hostname, key_name, expiry)
}

fn signature_for(key: &SasKey, resource_uri: &str, key_name: &str, expiry: &DateTime<Utc>) -> String {
    let expiry_timestamp = expiry.timestamp();

    let to_sign = format!("{}\n{}", resource_uri, expiry_timestamp);

    let token = key.token(&to_sign);

    format!(
        "SharedAccessSignature sr={}&{}&se={}&skn={}",
        resource_uri, token, expiry_timestamp, key_name
    )
}
