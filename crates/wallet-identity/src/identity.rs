//! Wallet address normalisation and the session identity contract
//!
//! Sessions issued by the identity provider are bound to a synthetic
//! identity of the form `<lowercased-address>@<domain>`. The bound address
//! is recovered by stripping the suffix, so this module, the challenge
//! format and the provider must change together.

/// Normalise an address for comparison
///
/// Only used at the comparison boundary. The canonical stored value is
/// always whatever the wallet adapter currently reports.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Case-insensitive address comparison
pub fn addresses_match(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// Build the synthetic identity a session is bound to
pub fn synthetic_identity(address: &str, domain: &str) -> String {
    format!("{}@{}", normalize_address(address), domain)
}

/// Recover the wallet address bound to a synthetic identity
///
/// Returns `None` if the identity does not carry the expected domain or the
/// local part is empty.
pub fn address_from_identity(identity: &str, domain: &str) -> Option<String> {
    let (local, suffix) = identity.trim().rsplit_once('@')?;
    if !suffix.eq_ignore_ascii_case(domain) || local.is_empty() {
        return None;
    }
    Some(normalize_address(local))
}
