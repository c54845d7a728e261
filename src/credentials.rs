//! Transport security is an external collaborator: this module only
//! specifies the contract a `Credentials` implementation must satisfy so the
//! channel can negotiate a transport without knowing which security
//! mechanism (TLS, insecure, ALTS, ...) is in play.

/// Distinguishes how much protection a negotiated connection provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SecurityLevel {
    NoSecurity,
    IntegrityOnly,
    PrivacyAndIntegrity,
}

pub struct ProtocolInfo {
    security_protocol: &'static str,
    security_level: SecurityLevel,
}

impl ProtocolInfo {
    pub const fn new(security_protocol: &'static str, security_level: SecurityLevel) -> Self {
        Self {
            security_protocol,
            security_level,
        }
    }

    pub fn security_protocol(&self) -> &'static str {
        self.security_protocol
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }
}

/// Channel-side transport credentials. A concrete implementation (TLS,
/// insecure, ...) is supplied by the embedder at `Channel::new` time; this
/// crate ships only the `Insecure` implementation, needed for the in-memory
/// test transport.
pub trait Credentials: Send + Sync {
    fn info(&self) -> &ProtocolInfo;
}

/// Credentials that perform no transport security. Used by the in-memory
/// transport and as the default for targets that do not request TLS.
pub struct Insecure {
    info: ProtocolInfo,
}

impl Default for Insecure {
    fn default() -> Self {
        Self {
            info: ProtocolInfo::new("insecure", SecurityLevel::NoSecurity),
        }
    }
}

impl Credentials for Insecure {
    fn info(&self) -> &ProtocolInfo {
        &self.info
    }
}
