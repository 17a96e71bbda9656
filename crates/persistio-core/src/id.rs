//! Key generation for new identities

use uuid::Uuid;

/// Produces candidate keys for new records
pub trait KeyGenerator: Send + Sync {
    fn next_key(&self, prefix: &str) -> String;
}

/// Random v4 UUID keys in simple (hyphen-free) form
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeys;

impl KeyGenerator for UuidKeys {
    fn next_key(&self, prefix: &str) -> String {
        format!("{prefix}{}", Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_keys() {
        let keys = UuidKeys;
        let a = keys.next_key("acct-");
        let b = keys.next_key("acct-");
        assert!(a.starts_with("acct-"));
        assert_eq!(a.len(), "acct-".len() + 32);
        assert_ne!(a, b);
    }
}
