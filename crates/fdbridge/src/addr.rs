//! Remote address formatting

/// Strip the `:port` suffix from an `ip:port` or `[ipv6]:port` string.
///
/// IPv6 literals keep their brackets. Input without a port comes back as is.
pub fn extract_address(remote: &str) -> &str {
    if remote.starts_with('[') {
        return match remote.find(']') {
            Some(end) => &remote[..=end],
            None => remote,
        };
    }
    match remote.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal with no port.
        Some((host, _)) if !host.contains(':') => host,
        _ => remote,
    }
}
