use std::path::Path;
use std::path::PathBuf;

/// Resolve the CA bundle validating connections to the identity provider.
///
/// An explicitly configured path wins. Otherwise auto-detect: a
/// `<server_name>.ca.crt` dropped next to the dispatcher root (the usual
/// out-of-band install for self-signed providers) is picked up; failing that,
/// `None` leaves verification to the system roots.
pub fn which_bundle(
    server_name: &str,
    certs_home: &Path,
    configured: Option<PathBuf>,
) -> Option<PathBuf> {
    if configured.is_some() {
        return configured;
    }
    let local = certs_home.join(format!("{server_name}.ca.crt"));
    match local.is_file() {
        true => Some(local),
        false => None,
    }
}
