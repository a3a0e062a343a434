use std::fs;
use std::path::Path;
use base64::URL_SAFE_NO_PAD;
use log::debug;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::SecretKey;
use std::error::Error;

const PRIVATE_KEY_PATH: &str = "config/vapid_private_key.txt";
const PUBLIC_KEY_PATH: &str = "config/vapid_public_key.txt";

/// Returns `(private, public)` VAPID keys, base64url encoded without padding.
pub fn ensure_vapid_keys() -> Result<(String, String), Box<dyn Error>> {
    if !Path::new(PRIVATE_KEY_PATH).exists() {
        debug!("Generating new VAPID keys");
        let (private_key, public_key) = generate_vapid_keys();
        if let Some(dir) = Path::new(PRIVATE_KEY_PATH).parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(PRIVATE_KEY_PATH, &private_key)?;
        fs::write(PUBLIC_KEY_PATH, &public_key)?;
    }

    let private_key = fs::read_to_string(PRIVATE_KEY_PATH)?;
    let public_key = fs::read_to_string(PUBLIC_KEY_PATH)?;

    Ok((private_key.trim().to_string(), public_key.trim().to_string()))
}

/// Raw P-256 scalar for the private key, uncompressed SEC1 point for the
/// public key (the form browsers expect as `applicationServerKey`).
pub fn generate_vapid_keys() -> (String, String) {
    let secret = SecretKey::random(&mut rand::thread_rng());
    let public = secret.public_key().to_encoded_point(false);

    (
        base64::encode_config(secret.to_bytes(), URL_SAFE_NO_PAD),
        base64::encode_config(public.as_bytes(), URL_SAFE_NO_PAD),
    )
}
