use std::fmt;

use rand::Rng;

/// Azureus-style client prefix: client code and version
const PREFIX: &[u8; 8] = b"-SK0100-";
const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(PartialEq, Eq, Clone, Copy)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// A fresh id for this process. Peers see the client prefix followed by
    /// random alphanumerics.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut data = [0; 20];
        data[..PREFIX.len()].copy_from_slice(PREFIX);
        for byte in &mut data[PREFIX.len()..] {
            *byte = ALPHABET[rng.random_range(0..ALPHABET.len())];
        }
        Self(data)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0))
    }
}
