//! Utility functions for identifiers and default paths.

use std::path::PathBuf;

/// Name of the data directory created under the XDG data home.
const APP_DIR: &str = "mpmc";

/// Returns the homeserver host, without `https://` scheme or trailing slash.
///
/// # Examples
///
/// ```
/// # use mpmc::utils::normalize_homeserver;
/// assert_eq!(normalize_homeserver("https://matrix.org/"), "matrix.org");
/// ```
pub fn normalize_homeserver(homeserver: &str) -> String {
    let host = homeserver.trim();
    let host = host.strip_prefix("https://").unwrap_or(host);
    host.trim_end_matches('/').to_owned()
}

/// Qualifies a bare localpart into a full user id on `homeserver`.
///
/// A value already starting with `@` is returned as is.
pub fn qualify_user_id(user: &str, homeserver: &str) -> String {
    if user.starts_with('@') {
        user.to_owned()
    } else {
        format!("@{}:{}", user, homeserver)
    }
}

/// Default mailbox directory: `$XDG_DATA_HOME/mpmc`, or `~/.local/share/mpmc`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join(APP_DIR)
}
