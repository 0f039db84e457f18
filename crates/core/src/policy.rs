//! Input validation for values that end up on the host filesystem or in a
//! sandbox command line.

use crate::types::OwnerId;
use crate::{Error, Result};

/// Longest owner id accepted as a host directory name.
pub const MAX_OWNER_ID_LEN: usize = 64;

/// Validates an owner id before it is used as a path component under the
/// host mount root.
///
/// Only ASCII alphanumerics, `-` and `_` are allowed, which rules out
/// separators, `..`, and anything a shell or the engine would reinterpret.
pub fn validate_owner_id(owner: &OwnerId) -> Result<()> {
    let id = owner.as_str();
    if id.is_empty() {
        return Err(Error::invalid_request("userId is required"));
    }
    if id.len() > MAX_OWNER_ID_LEN {
        return Err(Error::invalid_request(format!(
            "userId must be at most {} characters",
            MAX_OWNER_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::invalid_request(format!(
            "userId contains unsupported characters: {}",
            id
        )));
    }
    Ok(())
}

/// Resolves a path supplied by a client into the path handed to the sandbox.
///
/// Relative paths are anchored at `workdir`; absolute paths are kept as-is,
/// since the container itself is the isolation boundary. NUL bytes can never
/// be carried in an argv element and are rejected up front.
pub fn resolve_sandbox_path(workdir: &str, input: &str) -> Result<String> {
    if input.is_empty() {
        return Err(Error::invalid_request("path is required"));
    }
    if input.contains('\0') {
        return Err(Error::invalid_request("path must not contain NUL bytes"));
    }
    if input.starts_with('/') {
        return Ok(input.to_string());
    }
    let base = workdir.trim_end_matches('/');
    Ok(format!("{}/{}", base, input.trim_start_matches("./")))
}
