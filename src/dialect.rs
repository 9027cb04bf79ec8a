//! Dialect abstraction (component F): plain 9P2000 versus its 9P2000.u
//! extension. The two share all framing and most of the message codec;
//! they differ only in `Tauth`/`Tattach` (extra `n_uname`), `Tcreate`
//! (extra `extension`), `Stat`/`Twstat` (extra `StatExt` fields), and
//! `Rerror` (extra errno suffix), all handled in [`crate::serialize`] and
//! [`crate::stat`] by branching on this type rather than through a trait
//! hierarchy (see the design notes on composition over inheritance).

use crate::fcall::{P92000, P92000U, VERSION_UNKNOWN};

/// The protocol variant a connection has negotiated.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// Plain 9P2000.
    Plain,
    /// 9P2000.u: numeric uid/gid/muid and errno-qualified `Rerror`.
    ExtendedU,
}

impl Dialect {
    /// The version string this dialect advertises in `Rversion`.
    pub fn version_str(&self) -> &'static str {
        match self {
            Dialect::Plain => P92000,
            Dialect::ExtendedU => P92000U,
        }
    }

    /// Map a version string back to a dialect. `None` for anything else,
    /// including `"unknown"`.
    pub fn from_version_str(s: &str) -> Option<Dialect> {
        match s {
            P92000 => Some(Dialect::Plain),
            P92000U => Some(Dialect::ExtendedU),
            _ => None,
        }
    }
}

/// Negotiate the version string a `Tversion` reply carries.
///
/// `client_version` is what the client sent; `backend_version` is what the
/// backend reports it supports for that request (see
/// [`crate::srv::Filesystem::rversion`]). The reply is `backend_version`
/// when it is a prefix of `client_version`, otherwise the literal
/// `"unknown"`. The resulting connection dialect is derived from whichever
/// string is actually negotiated; an `"unknown"` result leaves the
/// connection on the plain dialect until the client retries `Tversion`.
pub fn negotiate(client_version: &str, backend_version: &str) -> (String, Dialect) {
    if client_version.starts_with(backend_version) {
        let dialect = Dialect::from_version_str(backend_version).unwrap_or(Dialect::Plain);
        (backend_version.to_owned(), dialect)
    } else {
        (VERSION_UNKNOWN.to_owned(), Dialect::Plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_matching_prefix() {
        let (version, dialect) = negotiate("9P2000.u", "9P2000.u");
        assert_eq!(version, "9P2000.u");
        assert_eq!(dialect, Dialect::ExtendedU);
    }

    #[test]
    fn downgrades_to_plain_when_client_requests_more() {
        let (version, dialect) = negotiate("9P2000.u", "9P2000");
        assert_eq!(version, "9P2000");
        assert_eq!(dialect, Dialect::Plain);
    }

    #[test]
    fn falls_back_to_unknown_when_not_a_prefix() {
        let (version, dialect) = negotiate("9P2000", "9P2000.u");
        assert_eq!(version, "unknown");
        assert_eq!(dialect, Dialect::Plain);
    }
}
