//! Random secret and nonce generation from the OS CSPRNG.

use rand::RngCore;

/// Size of a device initial secret in bytes (128 bits)
pub const DEVICE_SECRET_SIZE: usize = 16;

/// Size of a refresh nonce in bytes (256 bits)
pub const REFRESH_NONCE_SIZE: usize = 32;

/// Fill a fixed-size array with random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// A fresh device initial secret, hex encoded.
pub fn generate_device_secret() -> String {
    hex::encode(random_bytes::<DEVICE_SECRET_SIZE>())
}

/// A fresh refresh nonce, hex encoded.
pub fn generate_refresh_nonce() -> String {
    hex::encode(random_bytes::<REFRESH_NONCE_SIZE>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_secret_shape() {
        let secret = generate_device_secret();
        assert_eq!(secret.len(), DEVICE_SECRET_SIZE * 2);
        assert!(hex::decode(&secret).is_ok());
    }

    #[test]
    fn test_nonces_are_unique() {
        let a = generate_refresh_nonce();
        let b = generate_refresh_nonce();
        assert_eq!(a.len(), REFRESH_NONCE_SIZE * 2);
        assert_ne!(a, b);
    }
}
