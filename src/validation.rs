//! Input validation for operator-supplied values.
//!
//! VM names end up in `VBoxManage` argument lists and on-disk paths, so they
//! are restricted to a conservative character set.

use anyhow::{Result, bail};
use std::net::IpAddr;

use crate::error::ProvisionError;

/// Maximum length for VM names
const MAX_VM_NAME_LEN: usize = 63;

/// Display resolutions outside these bounds are not something a guest will accept.
const MIN_RESOLUTION: u32 = 320;
const MAX_RESOLUTION: u32 = 8192;

/// Validate a VM name.
///
/// Valid VM names:
/// - Start and end with a letter or number
/// - Contain only alphanumeric characters, hyphens, underscores and dots
/// - Are between 1 and 63 characters long
/// - Do not contain path traversal sequences
pub fn validate_vm_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!(ProvisionError::config("VM name cannot be empty"));
    }

    if name.len() > MAX_VM_NAME_LEN {
        bail!(ProvisionError::config(format!(
            "VM name too long (max {} characters)",
            MAX_VM_NAME_LEN
        )));
    }

    let first_last_ok = name
        .chars()
        .next()
        .zip(name.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if !first_last_ok {
        bail!(ProvisionError::config(
            "VM name must start and end with a letter or number"
        ));
    }

    if let Some(ch) = name
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && !matches!(ch, '-' | '_' | '.'))
    {
        bail!(ProvisionError::config(format!(
            "VM name contains invalid character '{}'. Only letters, numbers, hyphens, underscores, and dots are allowed",
            ch
        )));
    }

    if name.contains("..") {
        bail!(ProvisionError::config(
            "VM name cannot contain parent directory references (..)"
        ));
    }

    Ok(())
}

/// Parse a `WIDTHxHEIGHT` display resolution.
pub fn parse_resolution(resolution: &str) -> Result<(u32, u32)> {
    let invalid = || {
        ProvisionError::config(format!(
            "Invalid resolution '{}'. Expected WIDTHxHEIGHT, e.g. 1024x768",
            resolution
        ))
    };

    let (w, h) = resolution.split_once('x').ok_or_else(invalid)?;
    let width: u32 = w.trim().parse().map_err(|_| invalid())?;
    let height: u32 = h.trim().parse().map_err(|_| invalid())?;

    let in_range = |v: u32| (MIN_RESOLUTION..=MAX_RESOLUTION).contains(&v);
    if !in_range(width) || !in_range(height) {
        bail!(invalid());
    }

    Ok((width, height))
}

/// Parse an IP address option, naming the option in the error.
pub fn parse_ip(option: &str, value: &str) -> Result<IpAddr> {
    value.trim().parse::<IpAddr>().map_err(|_| {
        anyhow::Error::from(ProvisionError::config(format!(
            "Invalid IP address for {}: '{}'",
            option, value
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_vm_names() {
        assert!(validate_vm_name("cuckoo1").is_ok());
        assert!(validate_vm_name("win-xp_sp3").is_ok());
        assert!(validate_vm_name("win7.x64").is_ok());
        assert!(validate_vm_name("a").is_ok());
    }

    #[test]
    fn test_invalid_vm_names() {
        // Empty
        assert!(validate_vm_name("").is_err());

        // Too long
        assert!(validate_vm_name(&"a".repeat(64)).is_err());

        // Invalid characters
        assert!(validate_vm_name("vm;rm -rf /").is_err());
        assert!(validate_vm_name("vm$(whoami)").is_err());
        assert!(validate_vm_name("vm name").is_err());
        assert!(validate_vm_name("a/b").is_err());

        // Invalid start/end
        assert!(validate_vm_name("-vm").is_err());
        assert!(validate_vm_name("vm_").is_err());

        // Traversal
        assert!(validate_vm_name("a..b").is_err());
    }

    #[test]
    fn test_resolution() {
        assert_eq!(parse_resolution("1024x768").unwrap(), (1024, 768));
        assert_eq!(parse_resolution("1920x1080").unwrap(), (1920, 1080));
        assert!(parse_resolution("1024").is_err());
        assert!(parse_resolution("axb").is_err());
        assert!(parse_resolution("10x10").is_err());
        assert!(parse_resolution("1024x768x32").is_err());
    }

    #[test]
    fn test_parse_ip() {
        assert!(parse_ip("--host-ip", "192.168.56.1").is_ok());
        assert!(parse_ip("--host-ip", "::1").is_ok());
        let err = parse_ip("--guest-ip", "192.168.56").unwrap_err();
        assert!(err.to_string().contains("--guest-ip"));
    }
}
